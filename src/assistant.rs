use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::conversation::Turn;
use crate::error::{EcoAssistantError, Result};
use crate::gateway::InferenceGateway;
use crate::location::{LocationFields, PanelMessage, Visibility};
use crate::session::{InputMode, Session};
use crate::suggestions::{SUGGESTIONS, suggestion};

pub const SELECT_INPUT_NOTICE: &str = "Please select a type of input.";

/// An uploaded image as received from the browser.
#[derive(Debug, Clone)]
pub struct ImageUpload {
    pub bytes: Vec<u8>,
    pub declared_type: Option<String>,
    pub file_name: Option<String>,
}

impl ImageUpload {
    /// MIME type sent to the provider. Only PNG and JPEG are accepted; the
    /// declared type wins, the file extension is the fallback.
    pub fn mime_type(&self) -> Result<&'static str> {
        let from_declared = self
            .declared_type
            .as_deref()
            .map(|t| t.trim().to_ascii_lowercase());
        let from_extension = self
            .file_name
            .as_deref()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase());

        match (from_declared.as_deref(), from_extension.as_deref()) {
            (Some("image/png"), _) => Ok("image/png"),
            (Some("image/jpeg" | "image/jpg" | "image/pjpeg"), _) => Ok("image/jpeg"),
            (Some(t), _) if t != "application/octet-stream" => Err(unsupported_image(t)),
            (_, Some("png")) => Ok("image/png"),
            (_, Some("jpg" | "jpeg")) => Ok("image/jpeg"),
            (_, other) => Err(unsupported_image(other.unwrap_or("unknown"))),
        }
    }
}

fn unsupported_image(kind: &str) -> EcoAssistantError {
    EcoAssistantError::validation(
        "file",
        format!("unsupported image type {kind}; upload a PNG or JPEG"),
    )
}

#[derive(Debug, Serialize)]
pub struct LocationView {
    pub visibility: Visibility,
    pub manual_entry: bool,
    pub fields: LocationFields,
    pub message: Option<PanelMessage>,
}

/// Everything the page needs to redraw a session after an interaction.
#[derive(Debug, Serialize)]
pub struct SessionView {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub turns: Vec<Turn>,
    pub input_mode: InputMode,
    pub notice: Option<String>,
    pub location: LocationView,
    pub suggestions: Vec<&'static str>,
}

/// Applies one input event to a session and dispatches it to the gateway.
pub struct EcoAssistant {
    gateway: InferenceGateway,
}

impl EcoAssistant {
    pub fn new(gateway: InferenceGateway) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &InferenceGateway {
        &self.gateway
    }

    pub fn render(&self, session: &Session) -> SessionView {
        let notice = match session.input_mode {
            InputMode::Unselected => Some(SELECT_INPUT_NOTICE.to_string()),
            InputMode::Text | InputMode::Image => None,
        };
        SessionView {
            session_id: session.id,
            started_at: session.created_at,
            turns: session.conversation.all().to_vec(),
            input_mode: session.input_mode,
            notice,
            location: LocationView {
                visibility: session.location.visibility(),
                manual_entry: session.location.manual_entry(),
                fields: session.location.fields().clone(),
                message: session.location.message().cloned(),
            },
            suggestions: SUGGESTIONS.to_vec(),
        }
    }

    pub fn select_mode(&self, session: &mut Session, mode: InputMode) {
        tracing::debug!(session = %session.id, ?mode, "Input mode selected");
        session.input_mode = mode;
        session.touch();
    }

    /// Shared path for typed questions and canned suggestions
    async fn submit_user_text(&self, session: &mut Session, text: &str) {
        session.conversation.append(Turn::user(text));
        let answer = self.gateway.answer_text(text).await;
        session.conversation.append(Turn::assistant(answer));
        session.touch();
    }

    pub async fn submit_text(&self, session: &mut Session, text: &str) -> Result<()> {
        self.require_mode(session, InputMode::Text)?;
        if text.trim().is_empty() {
            tracing::debug!(session = %session.id, "Ignoring empty message");
            return Ok(());
        }
        self.submit_user_text(session, text).await;
        Ok(())
    }

    pub async fn submit_suggestion(&self, session: &mut Session, index: usize) -> Result<()> {
        let question = suggestion(index).ok_or_else(|| {
            EcoAssistantError::validation("suggestion", format!("no suggestion at index {index}"))
        })?;
        tracing::info!(session = %session.id, question, "Suggestion selected");
        self.submit_user_text(session, question).await;
        Ok(())
    }

    /// The image itself is not logged; only the assistant's answer is.
    pub async fn upload_image(&self, session: &mut Session, upload: ImageUpload) -> Result<()> {
        self.require_mode(session, InputMode::Image)?;
        if upload.bytes.is_empty() {
            return Err(EcoAssistantError::validation("file", "uploaded file is empty"));
        }
        let mime_type = upload.mime_type()?;
        let answer = self.gateway.answer_image(upload.bytes, mime_type).await;
        session.conversation.append(Turn::assistant(answer));
        session.touch();
        Ok(())
    }

    pub fn toggle_location(&self, session: &mut Session) -> Visibility {
        session.touch();
        session.location.toggle()
    }

    pub fn set_manual_location(&self, session: &mut Session, enabled: bool) -> Result<()> {
        session.touch();
        session.location.set_manual_entry(enabled)
    }

    pub async fn search_location(&self, session: &mut Session, fields: LocationFields) -> Result<()> {
        session.touch();
        let Some(query) = session.location.prepare_search(fields)? else {
            return Ok(());
        };
        let outcome = self.gateway.try_find_recycling_centers(&query).await;
        session.location.record_result(&query, outcome);
        Ok(())
    }

    fn require_mode(&self, session: &Session, expected: InputMode) -> Result<()> {
        if session.input_mode == expected {
            return Ok(());
        }
        let reason = match session.input_mode {
            InputMode::Unselected => SELECT_INPUT_NOTICE.to_string(),
            other => format!("input mode is {other:?}, expected {expected:?}"),
        };
        tracing::warn!(session = %session.id, "{}", reason);
        Err(EcoAssistantError::validation("input_mode", reason))
    }
}
