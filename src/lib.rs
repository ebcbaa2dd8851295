pub mod assistant;
pub mod config;
pub mod conversation;
pub mod error;
pub mod gateway;
pub mod location;
pub mod models;
pub mod prompts;
pub mod server;
pub mod session;
pub mod suggestions;
pub mod transport;

pub use assistant::{EcoAssistant, ImageUpload, SessionView};
pub use config::Config;
pub use error::{EcoAssistantError, Result};
pub use gateway::InferenceGateway;
