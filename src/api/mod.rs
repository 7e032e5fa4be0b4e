//! HTTP API for health checks, swap status, and operator actions

use crate::chain::ChainManager;
use crate::config::ApiConfig;
use crate::coordination::RelayCoordinator;
use crate::error::{RelayerError, RelayerResult};
use crate::hashlock::{parse_h256, ChainId, HashLock};
use crate::state::{Swap, SwapRegistry, SwapStats, SwapStatus};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

const DEFAULT_LIST_LIMIT: usize = 100;
const MAX_LIST_LIMIT: usize = 1000;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<dyn SwapRegistry>,
    pub chains: Arc<ChainManager>,
    pub coordinator: Arc<RelayCoordinator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/swaps", get(list_swaps))
        .route("/swaps/:hash_lock", get(get_swap))
        .route("/swaps/:hash_lock/retry", post(retry_swap))
        .route("/stats", get(get_stats))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Run the HTTP API server
pub async fn run_server(config: ApiConfig, state: AppState) -> RelayerResult<()> {
    let app = router(state);

    let addr = format!("{}:{}", config.host, config.port);
    info!("Starting API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| RelayerError::Internal(format!("Failed to bind {}: {}", addr, e)))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| RelayerError::Internal(format!("API server error: {}", e)))?;

    Ok(())
}

/// Health check endpoint - basic liveness
async fn health_check() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Readiness check - store reachable and both chains answering
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let database = state.registry.health_check().await.is_ok();

    let details: Vec<ChainHealth> = state
        .chains
        .health_check()
        .await
        .into_iter()
        .map(|(chain_id, head)| ChainHealth {
            chain_id,
            healthy: head.is_some(),
            head,
        })
        .collect();
    let chains = details.iter().all(|c| c.healthy);

    let ready = database && chains;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadinessResponse {
            ready,
            database,
            chains,
            details,
        }),
    )
}

async fn list_swaps(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Swap>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<SwapStatus>)
        .transpose()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LIST_LIMIT)
        .min(MAX_LIST_LIMIT);

    Ok(Json(state.registry.list(status, limit).await?))
}

async fn get_swap(
    State(state): State<AppState>,
    Path(hash_lock): Path<String>,
) -> Result<Json<Swap>, ApiError> {
    let hash_lock = parse_hash_lock(&hash_lock)?;
    state
        .registry
        .get(hash_lock)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::from(RelayerError::SwapNotFound { hash_lock }))
}

/// Clear a flag and let the coordinator drive the swap again
async fn retry_swap(
    State(state): State<AppState>,
    Path(hash_lock): Path<String>,
) -> Result<Json<Swap>, ApiError> {
    let hash_lock = parse_hash_lock(&hash_lock)?;
    Ok(Json(state.coordinator.retry(hash_lock).await?))
}

async fn get_stats(State(state): State<AppState>) -> Result<Json<StatsResponse>, ApiError> {
    let swaps = state.registry.stats().await?;
    Ok(Json(StatsResponse {
        swaps,
        in_flight: state.coordinator.in_flight_count(),
    }))
}

fn parse_hash_lock(raw: &str) -> Result<HashLock, ApiError> {
    parse_h256(raw).ok_or_else(|| ApiError::bad_request(format!("invalid hash lock '{}'", raw)))
}

/// Error body with the status code it maps to
#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: String) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message,
        }
    }
}

impl From<RelayerError> for ApiError {
    fn from(e: RelayerError) -> Self {
        let status = match &e {
            RelayerError::SwapNotFound { .. } => StatusCode::NOT_FOUND,
            RelayerError::SwapFrozen { .. } => StatusCode::CONFLICT,
            _ => {
                error!("API request failed: {}", e);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: e.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

// Request and response types

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    limit: Option<usize>,
}

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

#[derive(Serialize)]
struct ReadinessResponse {
    ready: bool,
    database: bool,
    chains: bool,
    details: Vec<ChainHealth>,
}

#[derive(Serialize)]
struct ChainHealth {
    chain_id: ChainId,
    healthy: bool,
    head: Option<u64>,
}

#[derive(Serialize)]
struct StatsResponse {
    swaps: SwapStats,
    in_flight: usize,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::testing::{chain_params, FakeGateway};
    use crate::config::RelayerConfig;
    use crate::hashlock::HashFunction;
    use crate::state::swap::tests::lock_record;
    use crate::state::{MemoryStore, SwapFlag};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use ethers::types::H256;
    use serde_json::Value;
    use tower::ServiceExt;

    fn app() -> (Router, Arc<MemoryStore>) {
        let chains = Arc::new(ChainManager::new());
        chains.register(chain_params(1), Arc::new(FakeGateway::new(1)));
        chains.register(chain_params(2), Arc::new(FakeGateway::new(2)));
        let store = Arc::new(MemoryStore::new());

        let config = RelayerConfig {
            instance_id: "api-test".into(),
            sweep_interval_secs: 15,
            max_retries: 1,
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 1,
            confirmation_timeout_secs: 1,
            health_check_interval_secs: 30,
            archive_after_secs: 3600,
            hash_function: HashFunction::Sha256,
            shard_index: 0,
            shard_count: 1,
        };
        let coordinator = Arc::new(RelayCoordinator::new(chains.clone(), store.clone(), config));

        let state = AppState {
            registry: store.clone(),
            chains,
            coordinator,
        };
        (router(state), store)
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    fn path(hash: &H256) -> String {
        format!("/swaps/0x{}", hex::encode(hash.as_bytes()))
    }

    #[tokio::test]
    async fn test_health_and_ready() {
        let (app, _) = app();

        let (status, body) = call(app.clone(), "GET", "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = call(app, "GET", "/ready").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ready"], true);
        assert_eq!(body["details"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_swap_lookup() {
        let (app, store) = app();
        let hash = H256::repeat_byte(0x42);
        store.upsert_on_lock(lock_record(hash, 1, 2)).await.unwrap();

        let (status, body) = call(app.clone(), "GET", &path(&hash)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "LOCKED");
        assert_eq!(body["origin_chain"], 1);

        let (status, _) = call(app.clone(), "GET", &path(&H256::repeat_byte(0x43))).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = call(app, "GET", "/swaps/not-a-hash").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let (app, store) = app();
        store
            .upsert_on_lock(lock_record(H256::repeat_byte(1), 1, 2))
            .await
            .unwrap();
        store
            .upsert_on_lock(lock_record(H256::repeat_byte(2), 1, 2))
            .await
            .unwrap();
        store
            .transition(H256::repeat_byte(2), SwapStatus::Locked, SwapStatus::Refunded)
            .await
            .unwrap();

        let (status, body) = call(app.clone(), "GET", "/swaps?status=refunded").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (_, body) = call(app.clone(), "GET", "/swaps?limit=1").await;
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = call(app.clone(), "GET", "/swaps?status=bogus").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = call(app, "GET", "/stats").await;
        assert_eq!(body["swaps"]["by_status"]["locked"], 1);
        assert_eq!(body["swaps"]["by_status"]["refunded"], 1);
        assert_eq!(body["in_flight"], 0);
    }

    #[tokio::test]
    async fn test_retry_clears_flag_but_not_conflicts() {
        let (app, store) = app();
        let hash = H256::repeat_byte(0x44);
        let mut record = lock_record(hash, 1, 2);
        record.time_lock = 10_000;
        store.upsert_on_lock(record).await.unwrap();
        store
            .flag(hash, SwapFlag::RetriesExhausted, "gave up".into())
            .await
            .unwrap();

        let retry = format!("{}/retry", path(&hash));
        let (status, body) = call(app.clone(), "POST", &retry).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["flag"], Value::Null);

        store
            .flag(hash, SwapFlag::PreimageConflict, "two preimages".into())
            .await
            .unwrap();
        let (status, _) = call(app, "POST", &retry).await;
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
