//! Updraft HTTP API
//! Serves the latest artifact record, accepts push endpoint registrations and
//! triggers refresh cycles

use axum::{
    body::Bytes,
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};

use crate::engine::database::DatabaseError;
use crate::engine::devices::{DeviceRegistration, Platform};
use crate::engine::metadata::ArtifactRecord;
use crate::engine::push::DispatchSummary;
use crate::engine::refresh::{RefreshError, RefreshOutcome, Refresher};

#[derive(Clone)]
pub struct AppState {
    pub refresher: Arc<Refresher>,
    pub api_key: Arc<str>,
}

impl AppState {
    pub fn new(refresher: Refresher, api_key: &str) -> Self {
        Self {
            refresher: Arc::new(refresher),
            api_key: Arc::from(api_key),
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(health, latest, register_token, scrape),
    components(schemas(
        ArtifactRecord,
        DispatchSummary,
        RefreshOutcome,
        RegisterTokenRequest,
        ErrorBody
    )),
    tags(
        (name = "updates", description = "Latest artifact discovery"),
        (name = "devices", description = "Push endpoint registration"),
    )
)]
pub struct ApiDoc;

pub fn create_router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/registerToken", post(register_token))
        .route("/scrape", post(scrape))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_api_key));

    Router::new()
        .route("/health", get(health))
        .route("/latest.json", get(latest))
        .route("/openapi.json", get(openapi))
        .merge(protected)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorBody {
    pub error: String,
    pub code: String,
}

#[derive(Debug)]
pub enum ApiError {
    Unauthorized,
    BadRequest { code: &'static str, message: String },
    NotFound(&'static str),
    Refresh(RefreshError),
    Store(DatabaseError),
}

impl From<DatabaseError> for ApiError {
    fn from(e: DatabaseError) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match self {
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "Missing or invalid API key".to_string(),
            ),
            ApiError::BadRequest { code, message } => (StatusCode::BAD_REQUEST, code, message),
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, "not_found", message.to_string()),
            ApiError::Refresh(e) => {
                if e.is_retryable() {
                    tracing::warn!(error = %e, code = e.code(), retryable = true, "Refresh failed");
                } else {
                    tracing::error!(error = %e, code = e.code(), "Refresh failed");
                }
                (StatusCode::INTERNAL_SERVER_ERROR, e.code(), e.to_string())
            }
            ApiError::Store(e) => {
                tracing::error!(error = %e, "Store error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "store_failed",
                    "Internal storage error".to_string(),
                )
            }
        };

        let body = ErrorBody {
            error: message,
            code: code.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let presented = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim);

    match presented {
        Some(key) if !state.api_key.is_empty() && keys_equal(key, &state.api_key) => {
            Ok(next.run(request).await)
        }
        _ => Err(ApiError::Unauthorized),
    }
}

fn keys_equal(a: &str, b: &str) -> bool {
    a.len() == b.len()
        && a.bytes()
            .zip(b.bytes())
            .fold(0u8, |acc, (x, y)| acc | (x ^ y))
            == 0
}

#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is up")),
    tag = "updates"
)]
async fn health() -> Json<Value> {
    Json(json!({ "ok": true }))
}

#[utoipa::path(
    get,
    path = "/latest.json",
    responses(
        (status = 200, description = "Current latest artifact", body = ArtifactRecord),
        (status = 404, description = "No artifact recorded yet", body = ErrorBody)
    ),
    tag = "updates"
)]
async fn latest(State(state): State<AppState>) -> Response {
    let mut headers = HeaderMap::new();
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));

    match state.refresher.metadata().get_latest() {
        Ok(Some(record)) => (headers, Json(record)).into_response(),
        Ok(None) => (headers, ApiError::NotFound("latest not set")).into_response(),
        Err(e) => (headers, ApiError::from(e)).into_response(),
    }
}

/// Body of POST /registerToken
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegisterTokenRequest {
    pub token: String,
    #[serde(default)]
    pub app_version: Option<String>,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
}

impl RegisterTokenRequest {
    fn from_value(body: &Value) -> Result<Self, ApiError> {
        let token = match body.get("token") {
            Some(Value::String(token)) if !token.trim().is_empty() => token.trim().to_string(),
            _ => {
                return Err(ApiError::BadRequest {
                    code: "invalid_token",
                    message: "token must be a non-empty string".to_string(),
                })
            }
        };
        let text = |key: &str| {
            body.get(key)
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
        };
        Ok(Self {
            token,
            app_version: text("appVersion"),
            device_id: text("deviceId"),
            platform: text("platform"),
        })
    }

    fn into_registration(self) -> Result<DeviceRegistration, ApiError> {
        let platform = self
            .platform
            .map(|raw| raw.parse::<Platform>())
            .transpose()
            .map_err(|message| ApiError::BadRequest {
                code: "invalid_platform",
                message,
            })?;
        Ok(DeviceRegistration {
            endpoint_token: self.token,
            platform,
            app_version: self.app_version,
            device_id: self.device_id,
            last_seen_at: Utc::now(),
        })
    }
}

/// Any content type is accepted; an empty body reads as an empty object.
fn parse_body(body: &[u8]) -> Result<Value, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(json!({}));
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest {
        code: "invalid_body",
        message: format!("body is not valid JSON: {e}"),
    })
}

#[utoipa::path(
    post,
    path = "/registerToken",
    request_body = RegisterTokenRequest,
    responses(
        (status = 200, description = "Endpoint registered"),
        (status = 400, description = "Missing or malformed token", body = ErrorBody),
        (status = 401, description = "Missing or invalid API key", body = ErrorBody)
    ),
    tag = "devices"
)]
async fn register_token(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<Value>, ApiError> {
    let registration = RegisterTokenRequest::from_value(&parse_body(&body)?)?.into_registration()?;
    state.refresher.devices().upsert(&registration)?;
    tracing::info!(
        platform = registration.platform.map(|p| p.as_str()).unwrap_or("-"),
        app_version = registration.app_version.as_deref().unwrap_or("-"),
        "Registered push endpoint"
    );
    Ok(Json(json!({ "ok": true })))
}

#[utoipa::path(
    post,
    path = "/scrape",
    responses(
        (status = 200, description = "Refresh completed", body = RefreshOutcome),
        (status = 401, description = "Missing or invalid API key", body = ErrorBody),
        (status = 500, description = "Configuration or scrape failure", body = ErrorBody)
    ),
    tag = "updates"
)]
async fn scrape(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let outcome = state.refresher.refresh().await.map_err(ApiError::Refresh)?;
    Ok(Json(json!({
        "ok": true,
        "isNew": outcome.is_new,
        "latest": outcome.latest,
        "pushed": outcome.pushed,
    })))
}

async fn openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::config::ServerConfig;
    use crate::engine::database::Database;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use chrono::TimeZone;
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn app(api_key: &str) -> (Router, AppState, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::from_lookup(|_| None).unwrap();
        config.lock_dir = dir.path().to_path_buf();
        let refresher = Refresher::new(Database::in_memory().unwrap(), &config);
        let state = AppState::new(refresher, api_key);
        (create_router(state.clone()), state, dir)
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post(uri: &str, key: Option<&str>, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(key) = key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {key}"));
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (router, _, _dir) = app("k");
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!({ "ok": true }));
    }

    #[tokio::test]
    async fn test_latest_not_set() {
        let (router, _, _dir) = app("k");
        let response = router
            .oneshot(Request::builder().uri("/latest.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
        assert_eq!(json_body(response).await["error"], "latest not set");
    }

    #[tokio::test]
    async fn test_latest_served_with_no_store() {
        let (router, state, _dir) = app("k");
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
        state
            .refresher
            .metadata()
            .put_latest(&ArtifactRecord {
                version_label: "2.3.1".to_string(),
                artifact_url: "https://dl.example.com/App-2.3.1.apk".to_string(),
                file_name: "App-2.3.1.apk".to_string(),
                published_at: ts,
                size_bytes: 42,
                content_hash: Some("00".repeat(32)),
                updated_at: ts,
                last_checked_at: ts,
            })
            .unwrap();

        let response = router
            .oneshot(Request::builder().uri("/latest.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
        let body = json_body(response).await;
        assert_eq!(body["versionLabel"], "2.3.1");
        assert_eq!(body["sizeBytes"], 42);
    }

    #[tokio::test]
    async fn test_protected_routes_require_key() {
        let (router, _, _dir) = app("secret");
        let response = router
            .clone()
            .oneshot(post("/registerToken", None, r#"{"token":"t"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = router
            .oneshot(post("/scrape", Some("wrong"), "{}"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_empty_server_key_rejects_everything() {
        let (router, _, _dir) = app("");
        let response = router
            .oneshot(post("/registerToken", Some(""), r#"{"token":"t"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_register_token_validation_and_merge() {
        let (router, state, _dir) = app("secret");

        let response = router
            .clone()
            .oneshot(post("/registerToken", Some("secret"), r#"{"token":42}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .clone()
            .oneshot(post(
                "/registerToken",
                Some("secret"),
                r#"{"token":"tok","appVersion":"1.0","deviceId":"dev-1"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(post("/registerToken", Some("secret"), r#"{"token":"tok"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stored = state.refresher.devices().get("tok").unwrap().unwrap();
        assert_eq!(stored.app_version.as_deref(), Some("1.0"));
        assert_eq!(stored.device_id.as_deref(), Some("dev-1"));
    }

    #[tokio::test]
    async fn test_register_token_keeps_platform_when_omitted() {
        let (router, state, _dir) = app("secret");

        let response = router
            .clone()
            .oneshot(post(
                "/registerToken",
                Some("secret"),
                r#"{"token":"t","platform":"desktop"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let response = router
            .oneshot(post("/registerToken", Some("secret"), r#"{"token":"t"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stored = state.refresher.devices().get("t").unwrap().unwrap();
        assert_eq!(stored.platform, Some(Platform::Desktop));
    }

    #[tokio::test]
    async fn test_register_token_bad_bodies_get_json_errors() {
        let (router, state, _dir) = app("secret");

        // No content type at all
        let request = Request::builder()
            .method("POST")
            .uri("/registerToken")
            .header(header::AUTHORIZATION, "Bearer secret")
            .body(Body::from("token=t"))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["code"], "invalid_body");

        let response = router
            .clone()
            .oneshot(post("/registerToken", Some("secret"), r#"{"token":"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        assert_eq!(json_body(response).await["code"], "invalid_body");

        let response = router
            .clone()
            .oneshot(post("/registerToken", Some("secret"), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = json_body(response).await;
        assert_eq!(body["code"], "invalid_token");
        assert!(body["error"].is_string());

        // A JSON body without a JSON content type is still read
        let request = Request::builder()
            .method("POST")
            .uri("/registerToken")
            .header(header::AUTHORIZATION, "Bearer secret")
            .body(Body::from(r#"{"token":"plain"}"#))
            .unwrap();
        let response = router.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.refresher.devices().get("plain").unwrap().is_some());
    }

    #[tokio::test]
    async fn test_scrape_without_index_url() {
        let (router, _, _dir) = app("secret");
        let response = router
            .oneshot(post("/scrape", Some("secret"), ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["code"], "config");
    }

    #[tokio::test]
    async fn test_openapi_lists_routes() {
        let (router, _, _dir) = app("k");
        let response = router
            .oneshot(Request::builder().uri("/openapi.json").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = json_body(response).await;
        assert!(body["paths"]["/latest.json"].is_object());
        assert!(body["paths"]["/scrape"].is_object());
    }
}
