use std::{net::SocketAddr, sync::Arc};

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{delete, get, patch, post, put},
};
use cliproxy_warden::{
    ActionError, KeyRecord, KeyStoreError, Monitor, MonitorError, Outcome, ServiceError, Snapshot,
};
use serde::{Deserialize, Serialize};

#[derive(Clone)]
struct AppState {
    monitor: Monitor,
}

#[derive(Debug, Serialize)]
struct ErrorView {
    error: String,
}

type ApiError = (StatusCode, Json<ErrorView>);

fn error_status(err: &MonitorError) -> StatusCode {
    match err {
        MonitorError::Closed => StatusCode::SERVICE_UNAVAILABLE,
        MonitorError::Action(action) => match action {
            ActionError::Keys(KeyStoreError::KeyAlreadyExists) => StatusCode::CONFLICT,
            ActionError::Keys(KeyStoreError::EmptyKey | KeyStoreError::InvalidKey) => {
                StatusCode::BAD_REQUEST
            }
            ActionError::Keys(KeyStoreError::ConfigNotFound)
            | ActionError::Service(ServiceError::ConfigNotFound)
            | ActionError::Service(ServiceError::BinaryNotFound(_)) => StatusCode::NOT_FOUND,
            ActionError::Service(ServiceError::FailedToStart) => StatusCode::BAD_GATEWAY,
            ActionError::Keys(KeyStoreError::Io(_))
            | ActionError::Service(ServiceError::Io(_))
            | ActionError::Join(_) => StatusCode::INTERNAL_SERVER_ERROR,
        },
    }
}

fn api_error(context: &str, err: MonitorError) -> ApiError {
    let status = error_status(&err);
    if status.is_server_error() {
        tracing::error!(error = %err, "{context}");
    } else {
        tracing::debug!(error = %err, "{context}");
    }
    (
        status,
        Json(ErrorView {
            error: err.to_string(),
        }),
    )
}

async fn health_check() -> &'static str {
    "ok"
}

async fn get_snapshot(State(state): State<Arc<AppState>>) -> Json<Snapshot> {
    Json(state.monitor.snapshot())
}

#[derive(Debug, Serialize)]
struct KeyView {
    key: String,
    masked: String,
    note: String,
    enabled: bool,
}

impl From<KeyRecord> for KeyView {
    fn from(record: KeyRecord) -> Self {
        Self {
            masked: record.masked(),
            key: record.key,
            note: record.note,
            enabled: record.enabled,
        }
    }
}

async fn list_keys(State(state): State<Arc<AppState>>) -> Json<Vec<KeyView>> {
    let keys = state.monitor.snapshot().keys;
    Json(keys.into_iter().map(KeyView::from).collect())
}

/// 省略 `api_key` 时生成新的随机 key。
#[derive(Debug, Default, Deserialize)]
struct CreateKeyRequest {
    #[serde(default)]
    api_key: Option<String>,
}

async fn create_key(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateKeyRequest>,
) -> Result<(StatusCode, Json<Outcome>), ApiError> {
    let result = match payload.api_key {
        Some(raw) => state.monitor.add_key(raw).await,
        None => state.monitor.generate_key().await,
    };
    result
        .map(|outcome| (StatusCode::CREATED, Json(outcome)))
        .map_err(|err| api_error("create api key failed", err))
}

async fn delete_key(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<Outcome>, ApiError> {
    state
        .monitor
        .remove_key(key)
        .await
        .map(Json)
        .map_err(|err| api_error("remove api key failed", err))
}

#[derive(Debug, Deserialize)]
struct UpdateKeyStatus {
    status: String,
}

async fn update_key_status(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(payload): Json<UpdateKeyStatus>,
) -> Result<Json<Outcome>, ApiError> {
    let enabled = match payload.status.trim().to_ascii_lowercase().as_str() {
        "active" | "enabled" => true,
        "disabled" => false,
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(ErrorView {
                    error: format!("unknown status '{other}'"),
                }),
            ));
        }
    };
    state
        .monitor
        .set_enabled(key, enabled)
        .await
        .map(Json)
        .map_err(|err| api_error("update api key status failed", err))
}

#[derive(Debug, Deserialize)]
struct UpdateKeyNote {
    #[serde(default)]
    note: String,
}

async fn update_key_note(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(payload): Json<UpdateKeyNote>,
) -> Result<Json<Outcome>, ApiError> {
    state
        .monitor
        .update_note(key, payload.note)
        .await
        .map(Json)
        .map_err(|err| api_error("update api key note failed", err))
}

async fn start_service(State(state): State<Arc<AppState>>) -> Result<Json<Outcome>, ApiError> {
    state
        .monitor
        .start_service()
        .await
        .map(Json)
        .map_err(|err| api_error("start service failed", err))
}

async fn stop_service(State(state): State<Arc<AppState>>) -> Result<Json<Outcome>, ApiError> {
    state
        .monitor
        .stop_service()
        .await
        .map(Json)
        .map_err(|err| api_error("stop service failed", err))
}

async fn refresh(State(state): State<Arc<AppState>>) -> Result<Json<Snapshot>, ApiError> {
    state
        .monitor
        .refresh()
        .await
        .map_err(|err| api_error("refresh failed", err))?;
    Ok(Json(state.monitor.snapshot()))
}

#[derive(Debug, Deserialize)]
struct MonitorToggle {
    enabled: bool,
}

async fn set_monitoring(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<MonitorToggle>,
) -> Result<Json<Snapshot>, ApiError> {
    state
        .monitor
        .set_monitoring(payload.enabled)
        .await
        .map_err(|err| api_error("toggle monitoring failed", err))?;
    Ok(Json(state.monitor.snapshot()))
}

pub fn router(monitor: Monitor) -> Router {
    let state = Arc::new(AppState { monitor });

    Router::new()
        .route("/health", get(health_check))
        .route("/api/snapshot", get(get_snapshot))
        .route("/api/keys", get(list_keys))
        .route("/api/keys", post(create_key))
        .route("/api/keys/:key", delete(delete_key))
        .route("/api/keys/:key/status", patch(update_key_status))
        .route("/api/keys/:key/note", patch(update_key_note))
        // Local service control
        .route("/api/service/start", post(start_service))
        .route("/api/service/stop", post(stop_service))
        .route("/api/refresh", post(refresh))
        .route("/api/monitor", put(set_monitoring))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, monitor: Monitor) -> Result<(), Box<dyn std::error::Error>> {
    let app = router(monitor.clone());

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;
    tracing::info!("dashboard listening on http://{bound_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    monitor.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::{Body, to_bytes},
        http::{Method, Request},
    };
    use cliproxy_warden::{LocatorOverrides, MonitorOptions, SearchRoots, UsageClient};
    use serde_json::{Value, json};
    use std::{fs, time::Duration};
    use tower::ServiceExt;

    fn monitor_in(dir: &std::path::Path) -> Monitor {
        let mut options = MonitorOptions::new(
            LocatorOverrides::default(),
            SearchRoots {
                cwd: Some(dir.to_path_buf()),
                home: None,
            },
        );
        options.poll_interval = Duration::from_secs(3600);
        options.monitor_enabled = false;
        options.log_path = dir.join("proxy.log");
        Monitor::spawn(options, UsageClient::new().unwrap())
    }

    async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        let body = match body {
            Some(value) => {
                builder = builder.header("content-type", "application/json");
                Body::from(value.to_string())
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
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn key_management_over_http() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.yaml"), "port: 1\n").unwrap();
        let app = router(monitor_in(dir.path()));

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/keys",
            Some(json!({"api_key": "sk-dashboard-0001"})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["key"], "sk-dashboard-0001");

        let (status, _) = call(
            &app,
            Method::POST,
            "/api/keys",
            Some(json!({"api_key": "sk-dashboard-0001"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, _) = call(&app, Method::POST, "/api/keys", Some(json!({"api_key": "  "}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = call(
            &app,
            Method::POST,
            "/api/keys",
            Some(json!({"api_key": "sk-b\ndebug: true"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("whitespace"));
        assert_eq!(
            fs::read_to_string(dir.path().join("config.yaml")).unwrap(),
            "port: 1\n\napi-keys:\n  - \"sk-dashboard-0001\"\n"
        );

        let (status, body) = call(&app, Method::POST, "/api/keys", Some(json!({}))).await;
        assert_eq!(status, StatusCode::CREATED);
        let generated = body["key"].as_str().unwrap().to_owned();
        assert!(generated.starts_with("sk-"));

        let (status, _) = call(
            &app,
            Method::PATCH,
            "/api/keys/sk-dashboard-0001/status",
            Some(json!({"status": "disabled"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = call(
            &app,
            Method::PATCH,
            "/api/keys/sk-dashboard-0001/note",
            Some(json!({"note": "ci runner"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = call(&app, Method::GET, "/api/keys", None).await;
        assert_eq!(status, StatusCode::OK);
        let keys = body.as_array().unwrap();
        assert_eq!(keys.len(), 2);
        assert_eq!(keys[0]["note"], "ci runner");
        assert_eq!(keys[0]["enabled"], false);
        assert_eq!(keys[0]["masked"], "sk-dash...0001");

        let (status, _) = call(&app, Method::DELETE, &format!("/api/keys/{generated}"), None).await;
        assert_eq!(status, StatusCode::OK);
        let (_, body) = call(&app, Method::GET, "/api/snapshot", None).await;
        assert_eq!(body["keys"].as_array().unwrap().len(), 1);
        assert_eq!(body["title"], "OFF");
    }

    #[tokio::test]
    async fn invalid_status_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("config.yaml"), "port: 1\n").unwrap();
        let app = router(monitor_in(dir.path()));

        let (status, body) = call(
            &app,
            Method::PATCH,
            "/api/keys/sk-x/status",
            Some(json!({"status": "paused"})),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("paused"));
    }

    #[tokio::test]
    async fn missing_config_maps_to_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(monitor_in(dir.path()));

        let (status, _) = call(&app, Method::POST, "/api/keys", Some(json!({}))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = call(&app, Method::POST, "/api/service/start", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("config.yaml"));
    }

    #[tokio::test]
    async fn health_and_monitor_toggle() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(monitor_in(dir.path()));

        let response = app
            .clone()
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let (status, body) = call(&app, Method::POST, "/api/refresh", None).await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["last_poll_at"].is_i64());

        let (status, body) = call(&app, Method::PUT, "/api/monitor", Some(json!({"enabled": false}))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["monitor_enabled"], false);
        assert_eq!(body["title"], "OFF");
    }
}
