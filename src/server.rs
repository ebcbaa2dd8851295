use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, Query, State};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::assistant::{EcoAssistant, ImageUpload, SessionView};
use crate::config::Config;
use crate::error::{EcoAssistantError, Result};
use crate::location::{LocationFields, Visibility};
use crate::session::{InputMode, SessionStore};
use crate::suggestions::SUGGESTIONS;

const INDEX_HTML: &str = include_str!("../static/index.html");

#[derive(Clone)]
pub struct AppState {
    pub assistant: Arc<EcoAssistant>,
    pub sessions: Arc<SessionStore>,
    pub config: Arc<Config>,
}

impl AppState {
    pub fn new(assistant: EcoAssistant, config: Arc<Config>) -> Self {
        Self {
            assistant: Arc::new(assistant),
            sessions: Arc::new(SessionStore::new(config.session_idle_ttl())),
            config,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let max_upload = state.config.server.max_upload_bytes;
    let bearer_token = state.config.server.bearer_token.clone();

    let mut router = Router::new()
        .route("/", get(index))
        .route("/api/status", get(status))
        .route("/api/sessions", post(create_session))
        .route("/api/sessions/:id", get(get_session).delete(end_session))
        .route("/api/sessions/:id/mode", put(select_mode))
        .route("/api/sessions/:id/messages", post(submit_message))
        .route("/api/sessions/:id/images", post(upload_image))
        .route("/api/sessions/:id/suggestions/:index", post(submit_suggestion))
        .route("/api/sessions/:id/location/toggle", post(toggle_location))
        .route("/api/sessions/:id/location/manual", put(set_manual_location))
        .route("/api/sessions/:id/location/search", post(search_location))
        .layer(DefaultBodyLimit::max(max_upload))
        .with_state(state);

    if let Some(expected) = bearer_token {
        router = router.layer(middleware::from_fn_with_state(
            Arc::new(expected),
            require_bearer,
        ));
    }

    router.route("/health", get(|| async { "ok" }))
}

async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

#[derive(Debug, Serialize)]
struct StatusView {
    generative_available: bool,
    chat_available: bool,
    gemini_model: String,
    chat_model: String,
    config_error: Option<&'static str>,
    suggestions: Vec<&'static str>,
}

async fn status(State(state): State<AppState>) -> Json<StatusView> {
    let gateway = state.assistant.gateway();
    Json(StatusView {
        generative_available: gateway.generative_available(),
        chat_available: gateway.chat_available(),
        gemini_model: state.config.gemini.model.clone(),
        chat_model: state.config.openai.model.clone(),
        config_error: (!gateway.generative_available()).then_some(
            "API Key is not set. Please configure the 'Gemini_API' environment variable.",
        ),
        suggestions: SUGGESTIONS.to_vec(),
    })
}

async fn create_session(State(state): State<AppState>) -> (StatusCode, Json<SessionView>) {
    let handle = state.sessions.create().await;
    let session = handle.lock().await;
    (StatusCode::CREATED, Json(state.assistant.render(&session)))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>> {
    let handle = state.sessions.get(id).await?;
    let session = handle.lock().await;
    Ok(Json(state.assistant.render(&session)))
}

async fn end_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode> {
    state.sessions.end(id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct ModeBody {
    mode: InputMode,
}

async fn select_mode(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ModeBody>,
) -> Result<Json<SessionView>> {
    let handle = state.sessions.get(id).await?;
    let mut session = handle.lock().await;
    state.assistant.select_mode(&mut session, body.mode);
    Ok(Json(state.assistant.render(&session)))
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    text: String,
}

async fn submit_message(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<MessageBody>,
) -> Result<Json<SessionView>> {
    let handle = state.sessions.get(id).await?;
    let mut session = handle.lock().await;
    state.assistant.submit_text(&mut session, &body.text).await?;
    Ok(Json(state.assistant.render(&session)))
}

async fn upload_image(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    mut multipart: Multipart,
) -> Result<Json<SessionView>> {
    let handle = state.sessions.get(id).await?;

    let mut upload = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| EcoAssistantError::validation("file", e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let declared_type = field.content_type().map(str::to_string);
        let file_name = field.file_name().map(str::to_string);
        let bytes = field
            .bytes()
            .await
            .map_err(|e| EcoAssistantError::validation("file", e.to_string()))?;
        upload = Some(ImageUpload {
            bytes: bytes.to_vec(),
            declared_type,
            file_name,
        });
    }
    let upload = upload
        .ok_or_else(|| EcoAssistantError::validation("file", "missing multipart field 'file'"))?;

    let mut session = handle.lock().await;
    state.assistant.upload_image(&mut session, upload).await?;
    Ok(Json(state.assistant.render(&session)))
}

async fn submit_suggestion(
    State(state): State<AppState>,
    Path((id, index)): Path<(Uuid, usize)>,
) -> Result<Json<SessionView>> {
    let handle = state.sessions.get(id).await?;
    let mut session = handle.lock().await;
    state.assistant.submit_suggestion(&mut session, index).await?;
    Ok(Json(state.assistant.render(&session)))
}

async fn toggle_location(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>> {
    let handle = state.sessions.get(id).await?;
    let mut session = handle.lock().await;
    let visible = state.assistant.toggle_location(&mut session) == Visibility::Visible;
    tracing::debug!(session = %id, visible, "Location panel toggled");
    Ok(Json(state.assistant.render(&session)))
}

#[derive(Debug, Deserialize)]
struct ManualEntryBody {
    enabled: bool,
}

async fn set_manual_location(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ManualEntryBody>,
) -> Result<Json<SessionView>> {
    let handle = state.sessions.get(id).await?;
    let mut session = handle.lock().await;
    state
        .assistant
        .set_manual_location(&mut session, body.enabled)?;
    Ok(Json(state.assistant.render(&session)))
}

async fn search_location(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(fields): Json<LocationFields>,
) -> Result<Json<SessionView>> {
    let handle = state.sessions.get(id).await?;
    let mut session = handle.lock().await;
    state.assistant.search_location(&mut session, fields).await?;
    Ok(Json(state.assistant.render(&session)))
}

/// Accepts `Authorization: Bearer <token>` or a `token` / `access_token`
/// query parameter for browsers that cannot set headers on the first load.
fn is_authorized(req: &Request<Body>, expected: &str) -> bool {
    let headers: &HeaderMap = req.headers();
    let header_ok = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {expected}"));
    if header_ok {
        return true;
    }
    Query::<TokenParams>::try_from_uri(req.uri()).is_ok_and(|Query(params)| {
        [params.access_token, params.token]
            .into_iter()
            .flatten()
            .any(|token| token == expected)
    })
}

#[derive(Debug, Deserialize)]
struct TokenParams {
    access_token: Option<String>,
    token: Option<String>,
}

async fn require_bearer(
    State(expected): State<Arc<String>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if req.uri().path().eq("/health") || is_authorized(&req, expected.as_str()) {
        return next.run(req).await;
    }
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::InferenceGateway;
    use crate::models::{GenerateContentResponse, StagedFile};
    use crate::transport::{GenerativeTransport, MockGenerativeTransport};
    use axum::body::to_bytes;
    use tower::ServiceExt;

    fn stub_generative() -> MockGenerativeTransport {
        let mut mock = MockGenerativeTransport::new();
        mock.expect_generate().returning(|_| {
            let res: GenerateContentResponse = serde_json::from_value(serde_json::json!({
                "candidates": [{"content": {"parts": [{"text": "Stub answer"}]}}]
            }))?;
            Ok(res)
        });
        mock.expect_upload_file().returning(|_, mime| {
            Ok(StagedFile {
                name: "files/t".to_string(),
                uri: "https://files.test/t".to_string(),
                mime_type: mime.to_string(),
            })
        });
        mock
    }

    fn app_with(config: Config) -> Router {
        let gateway = InferenceGateway::new(
            Some(Arc::new(stub_generative()) as Arc<dyn GenerativeTransport>),
            None,
            config.openai.model.clone(),
            config.openai.max_tokens,
        );
        router(AppState::new(EcoAssistant::new(gateway), Arc::new(config)))
    }

    fn app() -> Router {
        app_with(Config::default())
    }

    async fn call(app: &Router, req: Request<Body>) -> (StatusCode, serde_json::Value) {
        let res = app.clone().oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = to_bytes(res.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn new_session(app: &Router) -> String {
        let (status, view) = call(app, empty_request("POST", "/api/sessions")).await;
        assert_eq!(status, StatusCode::CREATED);
        view["session_id"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_suggestion_round_trip_over_http() {
        let app = app();
        let id = new_session(&app).await;

        let (status, view) = call(
            &app,
            empty_request("POST", &format!("/api/sessions/{id}/suggestions/0")),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            view["turns"],
            serde_json::json!([
                {"role": "user", "content": "How do I recycle plastics?"},
                {"role": "assistant", "content": "Stub answer"}
            ])
        );
    }

    #[tokio::test]
    async fn test_text_requires_mode_selection() {
        let app = app();
        let id = new_session(&app).await;
        let message = serde_json::json!({"text": "Can I recycle glass?"});

        let (status, _) = call(
            &app,
            json_request("POST", &format!("/api/sessions/{id}/messages"), message.clone()),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, view) = call(
            &app,
            json_request(
                "PUT",
                &format!("/api/sessions/{id}/mode"),
                serde_json::json!({"mode": "text"}),
            ),
        )
        .await;
        assert_eq!(view["input_mode"], "text");
        assert!(view["notice"].is_null());

        let (status, view) = call(
            &app,
            json_request("POST", &format!("/api/sessions/{id}/messages"), message),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["turns"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_image_upload_over_multipart() {
        let app = app();
        let id = new_session(&app).await;
        call(
            &app,
            json_request(
                "PUT",
                &format!("/api/sessions/{id}/mode"),
                serde_json::json!({"mode": "image"}),
            ),
        )
        .await;

        let body = "--XBOUNDARY\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"can.png\"\r\n\
Content-Type: image/png\r\n\r\n\
PNGDATA\r\n\
--XBOUNDARY--\r\n";
        let req = Request::builder()
            .method("POST")
            .uri(format!("/api/sessions/{id}/images"))
            .header("content-type", "multipart/form-data; boundary=XBOUNDARY")
            .body(Body::from(body))
            .unwrap();

        let (status, view) = call(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            view["turns"],
            serde_json::json!([{"role": "assistant", "content": "Stub answer"}])
        );
    }

    #[tokio::test]
    async fn test_location_panel_flow() {
        let app = app();
        let id = new_session(&app).await;

        let (_, view) = call(
            &app,
            empty_request("POST", &format!("/api/sessions/{id}/location/toggle")),
        )
        .await;
        assert_eq!(view["location"]["visibility"], "visible");
        assert_eq!(view["location"]["manual_entry"], true);

        let (status, view) = call(
            &app,
            json_request(
                "POST",
                &format!("/api/sessions/{id}/location/search"),
                serde_json::json!({"city": "Kuantan", "state": "", "postcode": "25000"}),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["location"]["message"]["kind"], "warning");

        // No OpenAI key configured: the lookup reports an error inside the panel
        let (_, view) = call(
            &app,
            json_request(
                "POST",
                &format!("/api/sessions/{id}/location/search"),
                serde_json::json!({"city": "Kuantan", "state": "Pahang", "postcode": "25000"}),
            ),
        )
        .await;
        assert_eq!(view["location"]["message"]["kind"], "error");
        assert!(view["turns"].as_array().unwrap().is_empty());

        let (_, view) = call(
            &app,
            empty_request("POST", &format!("/api/sessions/{id}/location/toggle")),
        )
        .await;
        assert_eq!(view["location"]["visibility"], "hidden");
    }

    #[tokio::test]
    async fn test_ended_session_is_gone() {
        let app = app();
        let id = new_session(&app).await;

        let (status, _) = call(&app, empty_request("DELETE", &format!("/api/sessions/{id}"))).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _) = call(&app, empty_request("GET", &format!("/api/sessions/{id}"))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_status_reports_missing_chat_key() {
        let (status, view) = call(&app(), empty_request("GET", "/api/status")).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(view["generative_available"], true);
        assert_eq!(view["chat_available"], false);
        assert_eq!(view["suggestions"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_bearer_token_guards_api_but_not_health() {
        let mut config = Config::default();
        config.server.bearer_token = Some("s3cret".to_string());
        let app = app_with(config);

        let res = app.clone().oneshot(empty_request("GET", "/api/status")).await.unwrap();
        assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

        let res = app.clone().oneshot(empty_request("GET", "/health")).await.unwrap();
        assert_eq!(res.status(), StatusCode::OK);

        let req = Request::builder()
            .uri("/api/status")
            .header("authorization", "Bearer s3cret")
            .body(Body::empty())
            .unwrap();
        assert_eq!(app.clone().oneshot(req).await.unwrap().status(), StatusCode::OK);

        let res = app
            .oneshot(empty_request("GET", "/api/status?token=s3cret"))
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::OK);
    }

    #[test]
    fn test_query_token_is_percent_decoded() {
        let req = |uri: &str| Request::builder().uri(uri).body(Body::empty()).unwrap();
        let expected = "a+b&c%d";

        assert!(is_authorized(
            &req("/api/status?access_token=a%2Bb%26c%25d"),
            expected
        ));
        assert!(is_authorized(&req("/?x=1&token=a%2Bb%26c%25d"), expected));
        assert!(!is_authorized(&req("/api/status?token=a+b&c%d"), expected));
        assert!(!is_authorized(&req("/api/status"), expected));
    }
}
