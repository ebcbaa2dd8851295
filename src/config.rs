use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for the Eco-Assistant server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub gemini: GeminiConfig,
    pub openai: OpenAIConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
    pub session_idle_ttl_seconds: u64,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    /// Never read from the YAML file; credentials come from the environment only
    #[serde(skip)]
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub request_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    #[serde(skip)]
    pub api_key: Option<String>,
    pub model: String,
    pub max_tokens: u32,
    #[serde(default)]
    pub base_url: Option<String>,
}

/// Environment variable names checked for each credential, first match wins
const GEMINI_KEY_VARS: [&str; 2] = ["Gemini_API", "GEMINI_API_KEY"];
const OPENAI_KEY_VARS: [&str; 2] = ["OpenAI_Api_Key", "OPENAI_API_KEY"];

impl Config {
    /// Load configuration from file with environment variable overrides
    /// ALWAYS returns a valid config - never fails
    pub fn load() -> Self {
        let env_paths = ["../.env", ".env"];

        let mut env_loaded = false;
        for path in &env_paths {
            if dotenvy::from_path(path).is_ok() {
                tracing::info!("Loaded .env from: {}", path);
                env_loaded = true;
                break;
            }
        }

        if !env_loaded {
            tracing::warn!("No .env file found - continuing with env vars only");
        }

        let config_path =
            env::var("ECO_CONFIG_PATH").unwrap_or_else(|_| "config.yaml".to_string());

        let mut config = if Path::new(&config_path).exists() {
            match fs::read_to_string(&config_path) {
                Ok(contents) => Self::from_yaml(&contents).unwrap_or_else(|e| {
                    tracing::error!(
                        "Failed to parse config file {}: {} - using defaults",
                        config_path,
                        e
                    );
                    Self::default()
                }),
                Err(e) => {
                    tracing::error!(
                        "Failed to read config file {}: {} - using defaults",
                        config_path,
                        e
                    );
                    Self::default()
                }
            }
        } else {
            tracing::info!("Config file not found at {} - using defaults", config_path);
            Self::default()
        };

        config.apply_env_overrides(|name| env::var(name).ok());

        if let Err(e) = config.validate() {
            tracing::warn!("Config validation warnings: {} - continuing anyway", e);
        }

        config
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        let config = serde_yaml::from_str::<Config>(contents)?;
        tracing::info!("Loaded configuration from YAML");
        Ok(config)
    }

    /// Apply environment variable overrides. `lookup` abstracts `std::env::var`
    /// so the mapping can be exercised without touching the process environment.
    fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let first_set = |names: &[&str]| {
            names
                .iter()
                .filter_map(|&name| lookup(name))
                .find(|value| !value.trim().is_empty())
        };

        // Server overrides
        if let Some(bind) = lookup("ECO_HTTP_BIND") {
            self.server.bind = bind;
        }
        if let Some(token) = lookup("ECO_BEARER_TOKEN") {
            self.server.bearer_token = Some(token).filter(|t| !t.is_empty());
        }
        if let Some(ttl) = lookup("ECO_SESSION_TTL_SECONDS") {
            if let Ok(secs) = ttl.parse() {
                self.server.session_idle_ttl_seconds = secs;
            }
        }
        if let Some(max) = lookup("ECO_MAX_UPLOAD_BYTES") {
            if let Ok(bytes) = max.parse() {
                self.server.max_upload_bytes = bytes;
            }
        }

        // Gemini overrides
        if let Some(api_key) = first_set(&GEMINI_KEY_VARS) {
            self.gemini.api_key = Some(api_key);
        }
        if let Some(model) = lookup("GEMINI_MODEL") {
            self.gemini.model = model;
        }
        if let Some(base_url) = lookup("GEMINI_BASE_URL") {
            self.gemini.base_url = base_url;
        }

        // OpenAI overrides
        if let Some(api_key) = first_set(&OPENAI_KEY_VARS) {
            self.openai.api_key = Some(api_key);
        }
        if let Some(model) = lookup("OPENAI_MODEL") {
            self.openai.model = model;
        }
        if let Some(base_url) = lookup("OPENAI_BASE_URL") {
            self.openai.base_url = Some(base_url);
        }
    }

    /// Validate configuration
    fn validate(&self) -> Result<(), Box<dyn std::error::Error>> {
        if self.server.bind.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!("ECO_HTTP_BIND must be host:port, got {}", self.server.bind).into());
        }
        if self.server.session_idle_ttl_seconds == 0 {
            return Err("session_idle_ttl_seconds cannot be 0".into());
        }
        if self.openai.max_tokens == 0 {
            return Err("openai.max_tokens cannot be 0".into());
        }

        // A missing Gemini key blocks every model call; report it once here
        if self.gemini.api_key.is_none() {
            tracing::error!(
                "API Key is not set. Please configure the 'Gemini_API' environment variable."
            );
        }
        if self.openai.api_key.is_none() {
            tracing::warn!("OpenAI_Api_Key not set - recycling center lookup will fail");
        }

        Ok(())
    }

    pub fn session_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.server.session_idle_ttl_seconds)
    }

    pub fn gemini_request_timeout(&self) -> Duration {
        Duration::from_secs(self.gemini.request_timeout_seconds)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                bind: "127.0.0.1:8501".to_string(),
                bearer_token: None,
                session_idle_ttl_seconds: 3600,
                max_upload_bytes: 10 * 1024 * 1024,
            },
            gemini: GeminiConfig {
                api_key: None,
                model: "gemini-1.5-flash".to_string(),
                base_url: "https://generativelanguage.googleapis.com".to_string(),
                request_timeout_seconds: 120,
            },
            openai: OpenAIConfig {
                api_key: None,
                model: "gpt-4".to_string(),
                max_tokens: 500,
                base_url: None,
            },
        }
    }
}
