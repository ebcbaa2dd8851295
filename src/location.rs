//! Recycling center lookup panel.
//!
//! The panel starts hidden and is flipped by a single toggle action. While it
//! is visible, a manual-entry checkbox (on by default) exposes the city, state
//! and postcode fields. A search only reaches the provider when all three
//! fields are filled in; the answer is shown inside the panel and is never
//! written to the conversation log.

use serde::{Deserialize, Serialize};

use crate::error::{EcoAssistantError, Result};
use crate::gateway::{GatewayError, Operation};

pub const MISSING_FIELDS_WARNING: &str =
    "Please fill in all fields to find nearby recycling centers.";

/// Raw field values as typed by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationFields {
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub postcode: String,
}

/// A validated lookup request; exists only for the duration of one search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocationQuery {
    city: String,
    state: String,
    postcode: String,
}

impl LocationQuery {
    pub fn new(city: &str, state: &str, postcode: &str) -> Result<Self> {
        if city.is_empty() || state.is_empty() || postcode.is_empty() {
            return Err(EcoAssistantError::validation("location", MISSING_FIELDS_WARNING));
        }
        Ok(Self {
            city: city.to_string(),
            state: state.to_string(),
            postcode: postcode.to_string(),
        })
    }

    pub fn city(&self) -> &str {
        &self.city
    }

    pub fn state(&self) -> &str {
        &self.state
    }

    pub fn postcode(&self) -> &str {
        &self.postcode
    }

    pub fn heading(&self) -> String {
        format!(
            "Based on your location in {}, {}, {}, here are some local recycling centers you might consider:",
            self.city, self.state, self.postcode
        )
    }
}

impl TryFrom<&LocationFields> for LocationQuery {
    type Error = EcoAssistantError;

    fn try_from(fields: &LocationFields) -> Result<Self> {
        Self::new(&fields.city, &fields.state, &fields.postcode)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Hidden,
    Visible,
}

/// What the panel shows below its controls after a search attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PanelMessage {
    Warning { text: String },
    Centers { heading: String, body: String },
    Error { text: String },
}

#[derive(Debug, Clone)]
pub struct LocationPanel {
    visibility: Visibility,
    manual_entry: bool,
    fields: LocationFields,
    message: Option<PanelMessage>,
}

impl Default for LocationPanel {
    fn default() -> Self {
        Self {
            visibility: Visibility::Hidden,
            manual_entry: true,
            fields: LocationFields::default(),
            message: None,
        }
    }
}

impl LocationPanel {
    pub fn visibility(&self) -> Visibility {
        self.visibility
    }

    pub fn is_visible(&self) -> bool {
        self.visibility == Visibility::Visible
    }

    pub fn manual_entry(&self) -> bool {
        self.manual_entry
    }

    pub fn fields(&self) -> &LocationFields {
        &self.fields
    }

    pub fn message(&self) -> Option<&PanelMessage> {
        self.message.as_ref()
    }

    /// Flip between hidden and visible. Any previous search output is dropped.
    pub fn toggle(&mut self) -> Visibility {
        self.visibility = match self.visibility {
            Visibility::Hidden => Visibility::Visible,
            Visibility::Visible => Visibility::Hidden,
        };
        self.message = None;
        self.visibility
    }

    pub fn set_manual_entry(&mut self, enabled: bool) -> Result<()> {
        self.ensure_visible()?;
        self.manual_entry = enabled;
        Ok(())
    }

    /// Validate a search request. `Ok(None)` means a warning was recorded and
    /// no provider call should be made.
    pub fn prepare_search(&mut self, fields: LocationFields) -> Result<Option<LocationQuery>> {
        self.ensure_visible()?;
        self.fields = fields;

        let query = if self.manual_entry {
            LocationQuery::try_from(&self.fields).ok()
        } else {
            None
        };

        if query.is_none() {
            tracing::warn!("Recycling center search rejected: incomplete location");
            self.message = Some(PanelMessage::Warning {
                text: MISSING_FIELDS_WARNING.to_string(),
            });
        }
        Ok(query)
    }

    pub fn record_result(
        &mut self,
        query: &LocationQuery,
        outcome: std::result::Result<String, GatewayError>,
    ) {
        self.message = Some(match outcome {
            Ok(body) => PanelMessage::Centers {
                heading: query.heading(),
                body,
            },
            Err(e) => PanelMessage::Error {
                text: Operation::FindRecyclingCenters.render(Err(e)),
            },
        });
    }

    fn ensure_visible(&self) -> Result<()> {
        if self.is_visible() {
            Ok(())
        } else {
            Err(EcoAssistantError::validation(
                "location",
                "location panel is hidden; toggle it first",
            ))
        }
    }
}
