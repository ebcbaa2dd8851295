//! Inference gateway: one user input plus one fixed instruction becomes one
//! provider call. Failures stay typed until the `answer_*` boundary, where
//! they become display text prefixed with the failing operation.

use std::sync::Arc;
use thiserror::Error;

use crate::config::Config;
use crate::error::{EcoAssistantError, Result};
use crate::location::LocationQuery;
use crate::models::{ChatMessage, ChatRequest, GenerateContentRequest, Part};
use crate::prompts::{
    IMAGE_INSTRUCTION, PART_SEPARATOR, RECYCLING_CENTERS_INSTRUCTION, TEXT_INSTRUCTION,
    recycling_centers_query,
};
use crate::transport::{ChatTransport, GeminiTransport, GenerativeTransport, OpenAIChatTransport};

pub const TEXT_ERROR_PREFIX: &str = "Error in generating response:";
pub const IMAGE_ERROR_PREFIX: &str = "Error in processing image:";
pub const LOCATION_ERROR_PREFIX: &str = "Error fetching recycling centers:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayErrorKind {
    MissingCredential,
    Upload,
    Generation,
    Completion,
    EmptyResponse,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct GatewayError {
    pub kind: GatewayErrorKind,
    pub message: String,
}

impl GatewayError {
    fn new(kind: GatewayErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn from_provider(kind: GatewayErrorKind, err: EcoAssistantError) -> Self {
        Self::new(kind, err.to_string())
    }
}

/// The three gateway operations, each with its own failure prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    AnswerText,
    AnswerImage,
    FindRecyclingCenters,
}

impl Operation {
    pub fn error_prefix(self) -> &'static str {
        match self {
            Operation::AnswerText => TEXT_ERROR_PREFIX,
            Operation::AnswerImage => IMAGE_ERROR_PREFIX,
            Operation::FindRecyclingCenters => LOCATION_ERROR_PREFIX,
        }
    }

    /// Convert a typed outcome into renderable text
    pub fn render(self, outcome: std::result::Result<String, GatewayError>) -> String {
        match outcome {
            Ok(text) => text,
            Err(e) => {
                tracing::error!(operation = ?self, kind = ?e.kind, "{}", e.message);
                format!("{} {}", self.error_prefix(), e.message)
            }
        }
    }
}

pub struct InferenceGateway {
    generative: Option<Arc<dyn GenerativeTransport>>,
    chat: Option<Arc<dyn ChatTransport>>,
    chat_model: String,
    max_tokens: u32,
}

impl InferenceGateway {
    pub fn new(
        generative: Option<Arc<dyn GenerativeTransport>>,
        chat: Option<Arc<dyn ChatTransport>>,
        chat_model: String,
        max_tokens: u32,
    ) -> Self {
        Self {
            generative,
            chat,
            chat_model,
            max_tokens,
        }
    }

    /// Build provider transports for whichever credentials are configured
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let generative = match &cfg.gemini.api_key {
            Some(key) => Some(Arc::new(GeminiTransport::new(
                key.clone(),
                &cfg.gemini.base_url,
                cfg.gemini.model.clone(),
                cfg.gemini_request_timeout(),
            )?) as Arc<dyn GenerativeTransport>),
            None => None,
        };
        let chat = cfg.openai.api_key.as_ref().map(|key| {
            Arc::new(OpenAIChatTransport::new(
                key.clone(),
                cfg.openai.base_url.as_deref(),
            )) as Arc<dyn ChatTransport>
        });

        Ok(Self::new(
            generative,
            chat,
            cfg.openai.model.clone(),
            cfg.openai.max_tokens,
        ))
    }

    pub fn generative_available(&self) -> bool {
        self.generative.is_some()
    }

    pub fn chat_available(&self) -> bool {
        self.chat.is_some()
    }

    fn generative(&self) -> std::result::Result<&Arc<dyn GenerativeTransport>, GatewayError> {
        self.generative.as_ref().ok_or_else(|| {
            GatewayError::new(
                GatewayErrorKind::MissingCredential,
                "API Key is not set. Please configure the 'Gemini_API' environment variable.",
            )
        })
    }

    async fn generate_text(
        &self,
        parts: Vec<Part>,
    ) -> std::result::Result<String, GatewayError> {
        let request = GenerateContentRequest::from_parts(parts);
        let response = self
            .generative()?
            .generate(&request)
            .await
            .map_err(|e| GatewayError::from_provider(GatewayErrorKind::Generation, e))?;

        response.text().ok_or_else(|| {
            GatewayError::new(GatewayErrorKind::EmptyResponse, response.empty_reason())
        })
    }

    pub async fn try_answer_text(
        &self,
        user_input: &str,
    ) -> std::result::Result<String, GatewayError> {
        tracing::info!("Answering text question ({} chars)", user_input.len());
        self.generate_text(vec![
            Part::text(user_input),
            Part::text(PART_SEPARATOR),
            Part::text(TEXT_INSTRUCTION),
        ])
        .await
    }

    pub async fn try_answer_image(
        &self,
        image: Vec<u8>,
        mime_type: &str,
    ) -> std::result::Result<String, GatewayError> {
        tracing::info!(mime_type, "Answering image upload ({} bytes)", image.len());
        let staged = self
            .generative()?
            .upload_file(image, mime_type)
            .await
            .map_err(|e| GatewayError::from_provider(GatewayErrorKind::Upload, e))?;

        self.generate_text(vec![
            Part::file(&staged),
            Part::text(PART_SEPARATOR),
            Part::text(IMAGE_INSTRUCTION),
        ])
        .await
    }

    pub async fn try_find_recycling_centers(
        &self,
        query: &LocationQuery,
    ) -> std::result::Result<String, GatewayError> {
        let chat = self.chat.as_ref().ok_or_else(|| {
            GatewayError::new(
                GatewayErrorKind::MissingCredential,
                "OpenAI API key is not set. Please configure the 'OpenAI_Api_Key' environment variable.",
            )
        })?;

        tracing::info!(
            city = %query.city(),
            state = %query.state(),
            postcode = %query.postcode(),
            "Looking up recycling centers"
        );

        let request = ChatRequest {
            model: self.chat_model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: RECYCLING_CENTERS_INSTRUCTION.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: recycling_centers_query(query.city(), query.state(), query.postcode()),
                },
            ],
            max_tokens: self.max_tokens,
        };

        let text = chat
            .chat(&request)
            .await
            .map_err(|e| GatewayError::from_provider(GatewayErrorKind::Completion, e))?;
        if text.trim().is_empty() {
            return Err(GatewayError::new(
                GatewayErrorKind::EmptyResponse,
                "no text returned",
            ));
        }
        Ok(text)
    }

    /// Answer a typed question. Never fails: errors come back as text.
    pub async fn answer_text(&self, user_input: &str) -> String {
        Operation::AnswerText.render(self.try_answer_text(user_input).await)
    }

    /// Answer an uploaded image. Never fails: errors come back as text.
    pub async fn answer_image(&self, image: Vec<u8>, mime_type: &str) -> String {
        Operation::AnswerImage.render(self.try_answer_image(image, mime_type).await)
    }

    pub async fn find_recycling_centers(&self, query: &LocationQuery) -> String {
        Operation::FindRecyclingCenters.render(self.try_find_recycling_centers(query).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GenerateContentResponse, StagedFile};
    use crate::transport::{MockChatTransport, MockGenerativeTransport};

    fn text_response(text: &str) -> GenerateContentResponse {
        serde_json::from_value(serde_json::json!({
            "candidates": [{"content": {"parts": [{"text": text}]}}]
        }))
        .unwrap()
    }

    fn gateway(
        generative: Option<MockGenerativeTransport>,
        chat: Option<MockChatTransport>,
    ) -> InferenceGateway {
        InferenceGateway::new(
            generative.map(|g| Arc::new(g) as Arc<dyn GenerativeTransport>),
            chat.map(|c| Arc::new(c) as Arc<dyn ChatTransport>),
            "gpt-4".to_string(),
            500,
        )
    }

    fn query() -> LocationQuery {
        LocationQuery::new("Ipoh", "Perak", "30000").unwrap()
    }

    #[tokio::test]
    async fn test_answer_text_sends_input_then_instruction() {
        let mut mock = MockGenerativeTransport::new();
        mock.expect_generate()
            .withf(|req| {
                req.contents.len() == 1
                    && req.contents[0].parts
                        == vec![
                            Part::text("How do I compost?"),
                            Part::text("\n\n"),
                            Part::text(TEXT_INSTRUCTION),
                        ]
            })
            .times(1)
            .returning(|_| Ok(text_response("Use a bin.")));

        let answer = gateway(Some(mock), None).answer_text("How do I compost?").await;
        assert_eq!(answer, "Use a bin.");
    }

    #[tokio::test]
    async fn test_answer_text_failure_is_prefixed() {
        let mut mock = MockGenerativeTransport::new();
        mock.expect_generate()
            .returning(|_| Err(EcoAssistantError::Internal("quota exceeded".to_string())));

        let answer = gateway(Some(mock), None).answer_text("anything").await;
        assert!(answer.starts_with(TEXT_ERROR_PREFIX));
        assert!(answer.contains("quota exceeded"));
    }

    #[tokio::test]
    async fn test_answer_text_without_credential_is_prefixed() {
        let gw = gateway(None, None);
        let err = gw.try_answer_text("hi").await.unwrap_err();
        assert_eq!(err.kind, GatewayErrorKind::MissingCredential);
        assert!(gw.answer_text("hi").await.starts_with(TEXT_ERROR_PREFIX));
    }

    #[tokio::test]
    async fn test_empty_generation_is_an_error() {
        let mut mock = MockGenerativeTransport::new();
        mock.expect_generate().returning(|_| {
            Ok(serde_json::from_value(serde_json::json!({"candidates": []})).unwrap())
        });

        let gw = gateway(Some(mock), None);
        let err = gw.try_answer_text("hi").await.unwrap_err();
        assert_eq!(err.kind, GatewayErrorKind::EmptyResponse);
    }

    #[tokio::test]
    async fn test_answer_image_stages_then_generates() {
        let mut mock = MockGenerativeTransport::new();
        mock.expect_upload_file()
            .withf(|bytes, mime| bytes == &vec![1u8, 2, 3] && mime.to_string() == "image/png")
            .times(1)
            .returning(|_, mime| {
                Ok(StagedFile {
                    name: "files/1".to_string(),
                    uri: "https://files.test/1".to_string(),
                    mime_type: mime.to_string(),
                })
            });
        mock.expect_generate()
            .withf(|req| {
                let parts = &req.contents[0].parts;
                matches!(&parts[0], Part::FileData { file_data } if file_data.file_uri == "https://files.test/1")
                    && parts[2] == Part::text(IMAGE_INSTRUCTION)
            })
            .times(1)
            .returning(|_| Ok(text_response("Recyclable PET bottle.")));

        let answer = gateway(Some(mock), None)
            .answer_image(vec![1, 2, 3], "image/png")
            .await;
        assert_eq!(answer, "Recyclable PET bottle.");
    }

    #[tokio::test]
    async fn test_upload_failure_skips_generation() {
        let mut mock = MockGenerativeTransport::new();
        mock.expect_upload_file()
            .returning(|_, _| Err(EcoAssistantError::Internal("upload rejected".to_string())));
        mock.expect_generate().times(0);

        let gw = gateway(Some(mock), None);
        let err = gw.try_answer_image(vec![0], "image/jpeg").await.unwrap_err();
        assert_eq!(err.kind, GatewayErrorKind::Upload);
        let answer = gw.answer_image(vec![0], "image/jpeg").await;
        assert!(answer.starts_with(IMAGE_ERROR_PREFIX));
    }

    #[tokio::test]
    async fn test_recycling_centers_request_shape() {
        let mut chat = MockChatTransport::new();
        chat.expect_chat()
            .withf(|req| {
                req.model == "gpt-4"
                    && req.max_tokens == 500
                    && req.messages[0].role == "system"
                    && req.messages[0].content == RECYCLING_CENTERS_INSTRUCTION
                    && req.messages[1].content
                        == "Please suggest nearby recycling centers in Ipoh, Perak, 30000."
            })
            .times(1)
            .returning(|_| Ok("- **Green Depot**".to_string()));

        let text = gateway(None, Some(chat)).find_recycling_centers(&query()).await;
        assert_eq!(text, "- **Green Depot**");
    }

    #[tokio::test]
    async fn test_recycling_centers_failure_is_prefixed() {
        let mut chat = MockChatTransport::new();
        chat.expect_chat()
            .times(1)
            .returning(|_| Err(EcoAssistantError::Internal("rate limited".to_string())));

        let gw = gateway(None, Some(chat));
        let err = gw.try_find_recycling_centers(&query()).await.unwrap_err();
        assert_eq!(err.kind, GatewayErrorKind::Completion);
        let text = Operation::FindRecyclingCenters.render(Err(err));
        assert!(text.starts_with(LOCATION_ERROR_PREFIX));
        assert!(text.contains("rate limited"));
    }

    #[tokio::test]
    async fn test_recycling_centers_without_key_is_prefixed() {
        let text = gateway(None, None).find_recycling_centers(&query()).await;
        assert!(text.starts_with(LOCATION_ERROR_PREFIX));
        assert!(text.contains("OpenAI_Api_Key"));
    }
}
