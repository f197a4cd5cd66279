//! HTTP query surfaces.
//!
//! Two routers share one state type: the standalone indexer surface
//! (`/status`, `/events`, `/events-latest-ordered`) and the service surface,
//! which adds the contract-aware event queries and the admin registry route.
//! Handlers are a thin layer over the store; every list endpoint returns an
//! empty 200 rather than a 404 when nothing matches.

use axum::extract::{Query, State};
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use starknet::core::types::Felt;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::config::{ApiConfig, Config};
use crate::error::StorageError;
use crate::felt::normalize_hex;
use crate::indexer::{IndexerConfig, IndexerStatus};
use crate::registry::ContractRegistry;
use crate::storage::{EventStore, Order};

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub store: Arc<EventStore>,
    pub status: Arc<IndexerStatus>,
    config_echo: Arc<serde_json::Value>,
    order_by: i64,
    unique: i64,
    registry: Option<Arc<ContractRegistry>>,
    admin_enabled: bool,
}

impl ApiState {
    /// State for the standalone indexer surface.
    pub fn standalone(
        store: Arc<EventStore>,
        status: Arc<IndexerStatus>,
        config: &IndexerConfig,
    ) -> Self {
        Self {
            store,
            status,
            config_echo: Arc::new(serde_json::to_value(config).unwrap_or_default()),
            order_by: config.order_by,
            unique: config.unique,
            registry: None,
            admin_enabled: false,
        }
    }

    /// State for the registry-driven service surface.
    pub fn service(store: Arc<EventStore>, registry: Arc<ContractRegistry>, config: &Config) -> Self {
        let status = Arc::new(IndexerStatus::default());
        status.running.store(true, AtomicOrdering::SeqCst);
        Self {
            store,
            status,
            config_echo: Arc::new(serde_json::to_value(config).unwrap_or_default()),
            order_by: -1,
            unique: -1,
            registry: Some(registry),
            admin_enabled: config.api.admin,
        }
    }
}

/// Router for the standalone indexer.
pub fn standalone_router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/events", get(events_handler))
        .route("/events-latest-ordered", get(events_latest_ordered_handler))
        .with_state(state)
}

/// Router for the registry-driven service.
pub fn service_router(state: ApiState) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/status", get(status_handler))
        .route("/registry/add-registry-contract", post(add_registry_handler))
        .route("/events/get-block-events", get(block_events_handler))
        .route("/events/get-latest-event", get(latest_event_handler))
        .route("/events/get-latest-with", post(latest_with_handler))
        .route("/events/get-events-ordered", post(events_ordered_handler))
        .route("/events/get-unique-ordered", get(unique_ordered_handler))
        .with_state(state)
}

/// CORS layer derived from the Api configuration. Empty lists and `*` open
/// the corresponding dimension.
pub fn cors_layer(api: &ApiConfig) -> CorsLayer {
    let mut cors = CorsLayer::new();

    cors = if api.allow_origins.is_empty() || api.allow_origins.iter().any(|o| o == "*") {
        cors.allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> = api
            .allow_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors.allow_origin(origins)
    };

    cors = if api.allow_methods.is_empty() || api.allow_methods.iter().any(|m| m == "*") {
        cors.allow_methods(Any)
    } else {
        let methods: Vec<Method> = api
            .allow_methods
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        cors.allow_methods(methods)
    };

    if api.allow_headers.is_empty() || api.allow_headers.iter().any(|h| h == "*") {
        cors.allow_headers(Any)
    } else {
        let headers: Vec<HeaderName> = api
            .allow_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();
        cors.allow_headers(headers)
    }
}

/// Handler-level error: status code plus a `{"error": …}` body.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<StorageError> for ApiError {
    fn from(e: StorageError) -> Self {
        tracing::error!(target: "hasira::http", error = %e, "Storage query failed");
        Self::internal("Failed to query events")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

// ---- standalone surface ----------------------------------------------------

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    page: Option<String>,
    #[serde(rename = "pageLength")]
    page_length: Option<String>,
    order: Option<String>,
}

fn parse_page_query(query: &PageQuery) -> Result<(usize, usize, Order), ApiError> {
    let page = match &query.page {
        None => 0,
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|_| ApiError::bad_request("invalid page parameter: must be >= 0"))?,
    };
    let page_length = match &query.page_length {
        None => 20,
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .filter(|v| *v > 0 && *v < 100)
            .ok_or_else(|| {
                ApiError::bad_request("invalid pageLength parameter: must be > 0 and < 100")
            })?,
    };
    let order = match &query.order {
        None => Order::Asc,
        Some(raw) => Order::parse(raw)
            .ok_or_else(|| ApiError::bad_request("invalid order parameter: must be 'asc' or 'desc'"))?,
    };
    Ok((page, page_length, order))
}

async fn status_handler(State(state): State<ApiState>) -> Result<Json<serde_json::Value>, ApiError> {
    let mut body = json!({
        "running": state.status.running(),
        "current_block": state.status.current_block(),
        "event_count": state.store.event_count()?,
        "unique_event_count": state.store.unique_event_count()?,
        "unique_enabled": state.unique >= 0,
        "config": (*state.config_echo).clone(),
    });
    if let Some(registry) = &state.registry {
        body["registry"] = serde_json::to_value(registry.counts()).unwrap_or_default();
    }
    Ok(Json(body))
}

async fn events_handler(
    State(state): State<ApiState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (page, page_length, order) = parse_page_query(&query)?;
    let (events, total) = state.store.list(order, page, page_length)?;
    Ok(Json(json!({
        "total_count": total,
        "page": page,
        "page_length": page_length,
        "order": order.to_string(),
        "count": events.len(),
        "events": events,
    })))
}

async fn events_latest_ordered_handler(
    State(state): State<ApiState>,
    Query(query): Query<PageQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let (page, page_length, order) = parse_page_query(&query)?;
    let unique_enabled = state.unique >= 0;
    // Without a unique constraint this surface degrades to the plain listing.
    let (events, total) = if unique_enabled {
        state.store.list_unique(order, page, page_length)?
    } else {
        state.store.list(order, page, page_length)?
    };
    Ok(Json(json!({
        "total_count": total,
        "page": page,
        "page_length": page_length,
        "order": order.to_string(),
        "count": events.len(),
        "unique_enabled": unique_enabled,
        "order_by_index": state.order_by,
        "unique_key_index": state.unique,
        "events": events,
    })))
}

// ---- service surface -------------------------------------------------------

async fn root_handler() -> StatusCode {
    StatusCode::OK
}

async fn add_registry_handler(
    State(state): State<ApiState>,
    body: Option<Json<serde_json::Value>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if !state.admin_enabled {
        return Err(ApiError::unauthorized(
            "Only the admin can add registry contracts",
        ));
    }
    let Some(Json(body)) = body else {
        return Err(ApiError::bad_request("Invalid JSON body"));
    };
    let address = body
        .get("address")
        .and_then(|v| v.as_str())
        .ok_or_else(|| ApiError::bad_request("Missing 'address' field in JSON body"))?;
    let address = Felt::from_hex(address)
        .map_err(|_| ApiError::bad_request("Invalid 'address' field in JSON body"))?;

    let registry = state
        .registry
        .as_ref()
        .ok_or_else(|| ApiError::internal("Registry unavailable"))?;
    registry.add_registry_contract(address).await.map_err(|e| {
        tracing::error!(target: "hasira::http", error = %e, "Failed to add registry contract");
        ApiError::internal("Failed to add registry contract")
    })?;

    Ok(Json(json!({ "result": "Registry contract added successfully" })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContractQuery {
    contract_address: Option<String>,
    event_type: Option<String>,
    block_number: Option<String>,
    unique_key: Option<String>,
    page: Option<String>,
    limit: Option<String>,
}

fn require<'a>(value: &'a Option<String>, name: &str) -> Result<&'a str, ApiError> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ApiError::bad_request(format!("Missing {name} parameter")))
}

fn parse_page_limit(query: &ContractQuery) -> Result<(usize, usize), ApiError> {
    let page = match &query.page {
        None => 1,
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .filter(|v| *v >= 1)
            .ok_or_else(|| ApiError::bad_request("Invalid page parameter"))?,
    };
    let limit = match &query.limit {
        None => 10,
        Some(raw) => raw
            .parse::<usize>()
            .ok()
            .filter(|v| *v >= 1 && *v <= 100)
            .ok_or_else(|| ApiError::bad_request("Invalid limit parameter"))?,
    };
    Ok((page, limit))
}

fn filters_from_body(
    body: Option<Json<serde_json::Value>>,
) -> Result<serde_json::Map<String, serde_json::Value>, ApiError> {
    let Some(Json(value)) = body else {
        return Err(ApiError::bad_request("Invalid filters parameter"));
    };
    value
        .as_object()
        .cloned()
        .ok_or_else(|| ApiError::bad_request("Invalid filters parameter"))
}

async fn block_events_handler(
    State(state): State<ApiState>,
    Query(query): Query<ContractQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let block_number = require(&query.block_number, "blockNumber")?
        .parse::<u64>()
        .map_err(|_| ApiError::bad_request("Invalid blockNumber parameter"))?;
    let events = state.store.events_by_block(block_number)?;
    Ok(Json(json!({ "data": events })))
}

async fn latest_event_handler(
    State(state): State<ApiState>,
    Query(query): Query<ContractQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let contract = normalize_hex(require(&query.contract_address, "contractAddress")?);
    let event_type = require(&query.event_type, "eventType")?;
    let event = state
        .store
        .latest_matching(&contract, event_type, &serde_json::Map::new())?;
    Ok(Json(json!({ "data": event })))
}

async fn latest_with_handler(
    State(state): State<ApiState>,
    Query(query): Query<ContractQuery>,
    body: Option<Json<serde_json::Value>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let contract = normalize_hex(require(&query.contract_address, "contractAddress")?);
    let event_type = require(&query.event_type, "eventType")?.to_string();
    let filters = filters_from_body(body)?;
    let event = state.store.latest_matching(&contract, &event_type, &filters)?;
    Ok(Json(json!({ "data": event })))
}

async fn events_ordered_handler(
    State(state): State<ApiState>,
    Query(query): Query<ContractQuery>,
    body: Option<Json<serde_json::Value>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let contract = normalize_hex(require(&query.contract_address, "contractAddress")?);
    let event_type = require(&query.event_type, "eventType")?.to_string();
    let (page, limit) = parse_page_limit(&query)?;
    let filters = filters_from_body(body)?;
    let events = state
        .store
        .events_matching(&contract, &event_type, &filters, page, limit)?;
    Ok(Json(json!({ "data": events })))
}

async fn unique_ordered_handler(
    State(state): State<ApiState>,
    Query(query): Query<ContractQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let contract = normalize_hex(require(&query.contract_address, "contractAddress")?);
    let event_type = require(&query.event_type, "eventType")?.to_string();
    let group_field = require(&query.unique_key, "uniqueKey")?.to_string();
    let (page, limit) = parse_page_limit(&query)?;
    let events = state
        .store
        .unique_groups(&contract, &event_type, &group_field, page, limit)?;
    Ok(Json(json!({ "data": events })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ChainProvider;
    use crate::storage::StoredEvent;
    use axum::body::Body;
    use axum::http::Request;
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    fn stored(block: u64, tx: &str, order_key: &str, unique: Option<&str>) -> StoredEvent {
        StoredEvent {
            block_number: block,
            transaction_hash: normalize_hex(tx),
            from_address: normalize_hex("0xc0ffee"),
            keys: vec![normalize_hex("0x1")],
            data: vec![],
            timestamp: 1_700_000_000,
            order_key: normalize_hex(order_key),
            unique_key: unique.map(normalize_hex),
            decoded: None,
        }
    }

    fn standalone_fixture(unique: i64) -> (Router, Arc<EventStore>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(EventStore::open(dir.path()).unwrap());
        let config = IndexerConfig {
            contract: "0xc0ffee".to_string(),
            event: "Transfer".to_string(),
            order_by: 0,
            unique,
            start_block: 0,
            rpc_url: "http://localhost:5050".to_string(),
            network: "sepolia".to_string(),
            data_dir: dir.path().to_path_buf(),
        };
        let state = ApiState::standalone(store.clone(), Arc::new(IndexerStatus::default()), &config);
        (standalone_router(state), store, dir)
    }

    fn service_fixture(admin: bool) -> (Router, Arc<EventStore>, tempfile::TempDir) {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(EventStore::open(dir.path()).unwrap());
        let provider = Arc::new(ChainProvider::new("http://localhost:5050").unwrap());
        let (tx, _rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ContractRegistry::new(provider, store.clone(), tx).unwrap());
        let mut config = Config::default();
        config.api.admin = admin;
        let state = ApiState::service(store.clone(), registry, &config);
        (service_router(state), store, dir)
    }

    async fn get_json(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .clone()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    async fn post_json(router: &Router, uri: &str, body: &str) -> (StatusCode, serde_json::Value) {
        let response = router
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(uri)
                    .header("content-type", "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn events_endpoint_paginates_with_envelope() {
        let (router, store, _dir) = standalone_fixture(-1);
        for block in 0..5u64 {
            store
                .store_event(&stored(block, &format!("0x{block:x}"), &format!("0x{block:x}"), None))
                .unwrap();
        }

        let (status, body) = get_json(&router, "/events?page=1&pageLength=2&order=asc").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_count"], 5);
        assert_eq!(body["count"], 2);
        assert_eq!(body["order"], "asc");
        assert_eq!(body["events"][0]["block_number"], 2);
    }

    #[tokio::test]
    async fn empty_results_are_200_with_empty_arrays() {
        let (router, _store, _dir) = standalone_fixture(-1);
        let (status, body) = get_json(&router, "/events").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_count"], 0);
        assert_eq!(body["events"], json!([]));
    }

    #[tokio::test]
    async fn invalid_parameters_are_400() {
        let (router, _store, _dir) = standalone_fixture(-1);
        for uri in [
            "/events?page=abc",
            "/events?pageLength=0",
            "/events?pageLength=100",
            "/events?order=sideways",
        ] {
            let (status, body) = get_json(&router, uri).await;
            assert_eq!(status, StatusCode::BAD_REQUEST, "{uri}");
            assert!(body["error"].is_string(), "{uri}");
        }
    }

    #[tokio::test]
    async fn latest_ordered_collapses_by_unique_key() {
        let (router, store, _dir) = standalone_fixture(0);
        store.store_event(&stored(1, "0xa", "0x1", Some("0xaa"))).unwrap();
        store.store_event(&stored(2, "0xb", "0x2", Some("0xaa"))).unwrap();
        store.store_event(&stored(3, "0xc", "0x3", Some("0xbb"))).unwrap();

        let (status, body) = get_json(&router, "/events-latest-ordered").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_count"], 2);
        assert_eq!(body["unique_enabled"], true);
    }

    #[tokio::test]
    async fn latest_ordered_without_unique_degrades_to_listing() {
        let (router, store, _dir) = standalone_fixture(-1);
        store.store_event(&stored(1, "0xa", "0x1", None)).unwrap();
        let (status, body) = get_json(&router, "/events-latest-ordered").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["total_count"], 1);
        assert_eq!(body["unique_enabled"], false);
    }

    #[tokio::test]
    async fn status_reports_counts_and_config() {
        let (router, store, _dir) = standalone_fixture(-1);
        store.store_event(&stored(9, "0xa", "0x1", None)).unwrap();
        let (status, body) = get_json(&router, "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["event_count"], 1);
        assert_eq!(body["config"]["event"], "Transfer");
    }

    #[tokio::test]
    async fn admin_route_requires_admin_config() {
        let (router, _store, _dir) = service_fixture(false);
        let (status, body) =
            post_json(&router, "/registry/add-registry-contract", r#"{"address":"0x1"}"#).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn block_events_requires_block_number() {
        let (router, store, _dir) = service_fixture(true);
        let (status, _) = get_json(&router, "/events/get-block-events").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        store.store_event(&stored(7, "0xa", "0x1", None)).unwrap();
        let (status, body) = get_json(&router, "/events/get-block-events?blockNumber=7").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"].as_array().unwrap().len(), 1);

        let (status, body) = get_json(&router, "/events/get-block-events?blockNumber=8").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], json!([]));
    }

    #[tokio::test]
    async fn latest_event_returns_null_when_empty() {
        let (router, _store, _dir) = service_fixture(true);
        let (status, body) = get_json(
            &router,
            "/events/get-latest-event?contractAddress=0x1&eventType=Transfer",
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn latest_with_filters_decoded_fields() {
        let (router, store, _dir) = service_fixture(true);
        let mut event = stored(5, "0xa", "0x5", None);
        event.from_address = normalize_hex("0x1");
        event.decoded = Some(json!({
            "player": "alice",
            "event_type": "Scored",
            "contract_address": normalize_hex("0x1"),
        }));
        store.store_event(&event).unwrap();

        let (status, body) = post_json(
            &router,
            "/events/get-latest-with?contractAddress=0x1&eventType=Scored",
            r#"{"player":"alice"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"]["block_number"], 5);

        let (status, body) = post_json(
            &router,
            "/events/get-latest-with?contractAddress=0x1&eventType=Scored",
            r#"{"player":"bob"}"#,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["data"], serde_json::Value::Null);
    }

    #[tokio::test]
    async fn root_route_answers_ok() {
        let (router, _store, _dir) = service_fixture(false);
        let (status, _) = get_json(&router, "/").await;
        assert_eq!(status, StatusCode::OK);
    }
}
