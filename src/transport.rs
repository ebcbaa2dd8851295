use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;

#[cfg(test)]
use mockall::automock;

use crate::error::{EcoAssistantError, Result};
use crate::models::{
    ApiErrorBody, ApiErrorResponse, ChatMessage, ChatRequest, GenerateContentRequest,
    GenerateContentResponse, StagedFile, UploadFileResponse,
};

/// Generative-model provider: file staging plus content generation.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait GenerativeTransport: Send + Sync {
    async fn upload_file(&self, bytes: Vec<u8>, mime_type: &str) -> Result<StagedFile>;
    async fn generate(&self, req: &GenerateContentRequest) -> Result<GenerateContentResponse>;
}

/// Chat-completion provider returning the text of the first choice.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn chat(&self, req: &ChatRequest) -> Result<String>;
}

pub struct GeminiTransport {
    client: Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl GeminiTransport {
    pub fn new(api_key: String, base_url: &str, model: String, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            model,
        })
    }

    fn generate_url(&self) -> String {
        format!(
            "{}/v1beta/models/{}:generateContent",
            self.base_url, self.model
        )
    }

    fn upload_url(&self) -> String {
        format!("{}/upload/v1beta/files", self.base_url)
    }
}

#[async_trait]
impl GenerativeTransport for GeminiTransport {
    async fn upload_file(&self, bytes: Vec<u8>, mime_type: &str) -> Result<StagedFile> {
        tracing::debug!(size = bytes.len(), mime_type, "Staging file with Gemini");

        let response = self
            .client
            .post(self.upload_url())
            .header("x-goog-api-key", &self.api_key)
            .header("X-Goog-Upload-Protocol", "raw")
            .header("Content-Type", mime_type)
            .body(bytes)
            .send()
            .await?;

        let uploaded: UploadFileResponse = read_json(response, "Gemini file upload").await?;
        tracing::debug!(name = %uploaded.file.name, "File staged");
        Ok(uploaded.file)
    }

    async fn generate(&self, req: &GenerateContentRequest) -> Result<GenerateContentResponse> {
        tracing::debug!(model = %self.model, "Requesting Gemini content generation");

        let response = self
            .client
            .post(self.generate_url())
            .header("x-goog-api-key", &self.api_key)
            .json(req)
            .send()
            .await?;

        read_json(response, "Gemini generateContent").await
    }
}

/// Decode a successful body, or turn a provider error body into a readable message.
async fn read_json<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return response.json().await.map_err(|e| {
            EcoAssistantError::Internal(format!("Failed to parse {what} response: {e}"))
        });
    }

    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());
    Err(EcoAssistantError::Internal(format!(
        "{what} returned {status}: {}",
        provider_error_message(body)
    )))
}

fn provider_error_message(body: String) -> String {
    match serde_json::from_str::<ApiErrorResponse>(&body) {
        Ok(ApiErrorResponse {
            error: ApiErrorBody {
                message,
                status: Some(status),
            },
        }) => format!("{message} ({status})"),
        Ok(api) => api.error.message,
        Err(_) => body,
    }
}

pub struct OpenAIChatTransport {
    client: async_openai::Client<OpenAIConfig>,
}

impl OpenAIChatTransport {
    pub fn new(api_key: String, base_url: Option<&str>) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(base) = base_url {
            config = config.with_api_base(base);
        }
        Self {
            client: async_openai::Client::with_config(config),
        }
    }
}

fn to_openai_messages(messages: &[ChatMessage]) -> Result<Vec<ChatCompletionRequestMessage>> {
    messages
        .iter()
        .map(|m| -> Result<ChatCompletionRequestMessage> {
            match m.role.as_str() {
                "system" => Ok(ChatCompletionRequestSystemMessageArgs::default()
                    .content(m.content.clone())
                    .build()?
                    .into()),
                "user" => Ok(ChatCompletionRequestUserMessageArgs::default()
                    .content(m.content.clone())
                    .build()?
                    .into()),
                other => Err(EcoAssistantError::validation(
                    "role",
                    format!("unsupported chat role: {other}"),
                )),
            }
        })
        .collect()
}

#[async_trait]
impl ChatTransport for OpenAIChatTransport {
    #[allow(deprecated)]
    async fn chat(&self, req: &ChatRequest) -> Result<String> {
        tracing::debug!(model = %req.model, max_tokens = req.max_tokens, "Requesting chat completion");

        let request = CreateChatCompletionRequestArgs::default()
            .model(req.model.clone())
            .messages(to_openai_messages(&req.messages)?)
            .max_tokens(req.max_tokens)
            .build()?;

        let response = self.client.chat().create(request).await?;

        response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or_else(|| {
                EcoAssistantError::Internal("OpenAI API returned empty choices".to_string())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(role: &str, content: &str) -> ChatMessage {
        ChatMessage {
            role: role.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn test_openai_messages_keep_order() {
        let converted =
            to_openai_messages(&[msg("system", "be brief"), msg("user", "hi")]).unwrap();
        assert_eq!(converted.len(), 2);
        assert!(matches!(
            converted[0],
            ChatCompletionRequestMessage::System(_)
        ));
        assert!(matches!(converted[1], ChatCompletionRequestMessage::User(_)));
    }

    #[test]
    fn test_openai_messages_reject_unknown_role() {
        let err = to_openai_messages(&[msg("tool", "x")]).unwrap_err();
        assert!(matches!(err, EcoAssistantError::Validation { .. }));
    }

    #[test]
    fn test_provider_error_body_is_summarised() {
        let body = r#"{"error":{"code":400,"message":"API key not valid","status":"INVALID_ARGUMENT"}}"#;
        assert_eq!(
            provider_error_message(body.to_string()),
            "API key not valid (INVALID_ARGUMENT)"
        );
        assert_eq!(
            provider_error_message(r#"{"error":{"message":"quota"}}"#.to_string()),
            "quota"
        );
        assert_eq!(provider_error_message("bad gateway".to_string()), "bad gateway");
    }

    #[test]
    fn test_gemini_urls_strip_trailing_slash() {
        let transport = GeminiTransport::new(
            "k".to_string(),
            "http://localhost:8080/",
            "gemini-1.5-flash".to_string(),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            transport.generate_url(),
            "http://localhost:8080/v1beta/models/gemini-1.5-flash:generateContent"
        );
        assert_eq!(transport.upload_url(), "http://localhost:8080/upload/v1beta/files");
    }
}
