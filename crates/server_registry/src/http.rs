//! HTTP binding of the registry API.
//!
//! | Method | Path                              | Operation  |
//! |--------|-----------------------------------|------------|
//! | POST   | `/api/v1/servers/register`        | register   |
//! | PUT    | `/api/v1/servers/:id/heartbeat`   | heartbeat  |
//! | DELETE | `/api/v1/servers/:id`             | unregister |
//! | GET    | `/api/v1/servers/:id`             | get        |
//! | GET    | `/api/v1/servers`                 | discover   |
//! | POST   | `/api/v1/servers/:id/join`        | join       |
//! | GET    | `/api/v1/status`                  | status     |
//! | GET    | `/health`                         | liveness   |
//!
//! Failures are returned as `{"error": <message>, "code": <CODE>}` with the
//! status code from [`RegistryError::status_code`].

use crate::api::{
    AckResponse, DiscoverQuery, DiscoverResponse, HealthResponse, HeartbeatRequest, JoinRequest,
    RegisterRequest, RegistryApi, StatusResponse,
};
use crate::error::RegistryError;
use crate::types::{JoinGrant, ServerEntry};
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Shared state handed to every handler.
#[derive(Debug, Clone)]
pub struct AppState {
    pub api: Arc<RegistryApi>,
}

impl AppState {
    pub fn new(api: Arc<RegistryApi>) -> Self {
        Self { api }
    }
}

/// Error body returned for every failed request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!("Request failed: {}", self);
        }

        let body = ErrorResponse {
            error: self.to_string(),
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type HttpResult<T> = Result<Json<T>, RegistryError>;

/// Builds the registry router.
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/servers", get(discover))
        .route("/servers/register", post(register))
        .route("/servers/:id", get(get_server).delete(unregister))
        .route("/servers/:id/heartbeat", put(heartbeat))
        .route("/servers/:id/join", post(join))
        .route("/status", get(status));

    Router::new()
        .route("/health", get(health))
        .nest("/api/v1", api_routes)
        .with_state(state)
}

fn body_error(rejection: JsonRejection) -> RegistryError {
    RegistryError::invalid("body", rejection.body_text())
}

async fn register(
    State(state): State<AppState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> HttpResult<AckResponse> {
    let Json(request) = body.map_err(body_error)?;
    state.api.register(request).await.map(Json)
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> HttpResult<AckResponse> {
    let Json(mut request) = body.map_err(body_error)?;
    request.id = Some(id);
    state.api.heartbeat(request).await.map(Json)
}

async fn unregister(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> HttpResult<AckResponse> {
    state.api.unregister(Some(&id)).await.map(Json)
}

async fn get_server(State(state): State<AppState>, Path(id): Path<String>) -> HttpResult<ServerEntry> {
    state.api.get(Some(&id)).map(Json)
}

async fn discover(
    State(state): State<AppState>,
    query: Result<Query<DiscoverQuery>, QueryRejection>,
) -> HttpResult<DiscoverResponse> {
    let Query(query) = query.map_err(|e| RegistryError::invalid("query", e.body_text()))?;
    Ok(Json(state.api.discover(query)))
}

/// The body only needs `clientId`; the path supplies the server.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinBody {
    client_id: Option<String>,
}

async fn join(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    body: Result<Json<JoinBody>, JsonRejection>,
) -> HttpResult<JoinGrant> {
    let Json(body) = body.map_err(body_error)?;
    state
        .api
        .join(JoinRequest {
            client_id: body.client_id,
            server_id: Some(server_id),
        })
        .map(Json)
}

async fn status(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(state.api.status())
}

async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(state.api.health())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::{AdmissionController, JoinPolicy};
    use crate::api::RegistrationDefaults;
    use crate::clock::{ManualClock, StalenessPolicy};
    use crate::store::RegistryStore;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, Request};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn router() -> Router {
        let clock = Arc::new(ManualClock::new(10_000));
        let store = Arc::new(RegistryStore::new(clock, StalenessPolicy::default()));
        let admission = Arc::new(AdmissionController::new(store.clone(), JoinPolicy::default()));
        let api = RegistryApi::new(
            store,
            admission,
            RegistrationDefaults {
                capacity: 100,
                region: "default".to_string(),
            },
        );
        create_router(AppState::new(Arc::new(api)))
    }

    async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(json) => {
                builder = builder.header(header::CONTENT_TYPE, "application/json");
                Body::from(json.to_string())
            }
            None => Body::empty(),
        };

        let response = app
            .clone()
            .oneshot(builder.body(body).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let app = router();
        let (status, body) = send(&app, Method::GET, "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok", "servers": 0}));
    }

    #[tokio::test]
    async fn test_register_then_discover() {
        let app = router();
        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/servers/register",
            Some(json!({"id": "srv-1", "address": "10.0.0.5:7777", "maxCapacity": 16})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"ok": true, "id": "srv-1"}));

        let (status, body) = send(&app, Method::GET, "/api/v1/servers", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["servers"][0]["id"], "srv-1");
        assert_eq!(body["servers"][0]["host"], "10.0.0.5");
        assert_eq!(body["servers"][0]["maxPlayers"], 16);
    }

    #[tokio::test]
    async fn test_error_body_shape() {
        let app = router();
        let (status, body) = send(
            &app,
            Method::PUT,
            "/api/v1/servers/ghost/heartbeat",
            Some(json!({"currentCapacity": 1})),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_REGISTERED");
        assert!(body["error"].as_str().unwrap().contains("ghost"));
    }

    #[tokio::test]
    async fn test_malformed_body_is_bad_request() {
        let app = router();
        let response = app
            .clone()
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/v1/servers/register")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from("{not json"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: ErrorResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body.code, "INVALID_FIELD");
    }

    #[tokio::test]
    async fn test_join_full_server_conflict() {
        let app = router();
        send(
            &app,
            Method::POST,
            "/api/v1/servers/register",
            Some(json!({"id": "srv-1", "address": {"host": "h", "port": 1}, "maxCapacity": 1})),
        )
        .await;
        send(
            &app,
            Method::PUT,
            "/api/v1/servers/srv-1/heartbeat",
            Some(json!({"currentCapacity": "1"})),
        )
        .await;

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/servers/srv-1/join",
            Some(json!({"clientId": "player-1"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], "SERVER_FULL");

        let (status, body) = send(
            &app,
            Method::POST,
            "/api/v1/servers/srv-1/join",
            Some(json!({})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "MISSING_FIELD");
    }

    #[tokio::test]
    async fn test_unregister_and_get() {
        let app = router();
        send(
            &app,
            Method::POST,
            "/api/v1/servers/register",
            Some(json!({"id": "srv-1", "address": "h:1"})),
        )
        .await;

        let (status, body) = send(&app, Method::GET, "/api/v1/servers/srv-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "online");

        let (status, _) = send(&app, Method::DELETE, "/api/v1/servers/srv-1", None).await;
        assert_eq!(status, StatusCode::OK);
        let (status, body) = send(&app, Method::DELETE, "/api/v1/servers/srv-1", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], "NOT_FOUND");
    }
}
