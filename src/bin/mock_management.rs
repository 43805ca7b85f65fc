use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode, header::AUTHORIZATION},
    response::IntoResponse,
    routing::get,
};
use rand::Rng;
use serde_json::json;
use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
};
use tracing_subscriber::EnvFilter;

#[derive(Default)]
struct Traffic {
    primary: AtomicI64,
    secondary: AtomicI64,
}

#[derive(Clone)]
struct MockState {
    management_key: Option<String>,
    traffic: Arc<Traffic>,
}

impl MockState {
    fn authorized(&self, headers: &HeaderMap, query: &HashMap<String, String>) -> bool {
        let Some(expected) = self.management_key.as_deref() else {
            return true;
        };
        let bearer = headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "));
        bearer == Some(expected) || query.get("key").map(String::as_str) == Some(expected)
    }
}

async fn usage(
    State(state): State<MockState>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    if !state.authorized(&headers, &query) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid management key"})),
        );
    }

    // Every poll looks like fresh traffic.
    let bump = rand::thread_rng().gen_range(1..=5);
    let primary = state.traffic.primary.fetch_add(bump, Ordering::Relaxed) + bump;
    let secondary = state.traffic.secondary.fetch_add(1, Ordering::Relaxed) + 1;
    let total = primary + secondary;

    let body = json!({
        "usage": {
            "total_requests": total,
            "total_tokens": total * 850,
            "apis": {
                "sk-mock-primary-0000000000000001": {
                    "total_requests": primary,
                    "total_tokens": primary * 900,
                    "models": {
                        "antigravity/gemini-2.5-pro": {"total_requests": primary - primary / 3},
                        "antigravity/claude-sonnet-4": {"total_requests": primary / 3},
                        "gpt-4o": 2
                    }
                },
                "sk-mock-secondary-000000000000002": {
                    "total_requests": secondary,
                    "total_tokens": secondary * 700,
                    "models": {"gemini-2.5-flash": secondary}
                }
            }
        }
    });
    (StatusCode::OK, Json(body))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let state = MockState {
        management_key: std::env::var("MOCK_MANAGEMENT_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty()),
        traffic: Arc::new(Traffic::default()),
    };
    let app = Router::new()
        .route("/v0/management/usage", get(usage))
        .with_state(state);

    let bind_addr =
        std::env::var("MOCK_MANAGEMENT_ADDR").unwrap_or_else(|_| "127.0.0.1:8317".to_string());
    let addr: SocketAddr = bind_addr.parse()?;
    tracing::info!("mock management API on http://{addr}");

    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
