//! End-to-end flow without a chain node: events enter through the registry
//! task, land in the store under all indexes, and come back out through the
//! HTTP query surfaces.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use hasira::config::Config;
use hasira::felt::{event_selector, normalize_hex};
use hasira::http::{service_router, standalone_router, ApiState};
use hasira::indexer::{IndexerConfig, IndexerStatus};
use hasira::storage::Order;
use hasira::{
    ChainProvider, ContractAbi, ContractEntry, ContractRegistry, EventStore, RawEvent, StoredEvent,
};
use starknet::core::types::Felt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tower::ServiceExt;

const GAME_ABI: &str = r#"[
    {"type": "event", "name": "arena::game::Scored", "kind": "struct", "members": [
        {"name": "player", "type": "core::starknet::contract_address::ContractAddress", "kind": "key"},
        {"name": "points", "type": "core::integer::u64", "kind": "data"}
    ]},
    {"type": "event", "name": "arena::game::Event", "kind": "enum", "variants": [
        {"name": "Scored", "type": "arena::game::Scored", "kind": "nested"}
    ]}
]"#;

fn scored_event(block: u64, tx: u64, player: u64, points: u64, contract: Felt) -> RawEvent {
    RawEvent {
        block_number: block,
        from_address: contract,
        transaction_hash: Felt::from(tx),
        keys: vec![event_selector("Scored").unwrap(), Felt::from(player)],
        data: vec![Felt::from(points)],
    }
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn registry_ingest_to_query_roundtrip() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(EventStore::open(dir.path()).unwrap());
    let provider = Arc::new(ChainProvider::new("http://localhost:5050").unwrap());
    let (subscribe_tx, _subscribe_rx) = mpsc::unbounded_channel();
    let registry =
        Arc::new(ContractRegistry::new(provider, store.clone(), subscribe_tx).unwrap());

    let game = Felt::from(0xabc_u64);
    registry.insert_registered_contract(ContractEntry {
        address: game,
        class_hash: Felt::from(0x99_u64),
        abi: ContractAbi::from_json(GAME_ABI).unwrap(),
    });

    // Three scoring events from two players, observed in chain order.
    for (block, tx, player, points) in
        [(10, 1, 0x5, 100), (11, 2, 0x6, 250), (12, 3, 0x5, 400)]
    {
        registry
            .process_event(&scored_event(block, tx, player, points, game))
            .await;
    }

    // Storage invariants.
    assert_eq!(store.last_processed_block().unwrap(), 12);
    let (asc, total) = store.list(Order::Asc, 0, 10).unwrap();
    assert_eq!(total, 3);
    let (desc, _) = store.list(Order::Desc, 0, 10).unwrap();
    let mut mirrored = desc.clone();
    mirrored.reverse();
    assert_eq!(asc, mirrored);

    // Query surface.
    let config = Config::default();
    let router = service_router(ApiState::service(store.clone(), registry.clone(), &config));
    let contract = normalize_hex("0xabc");

    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/events/get-latest-event?contractAddress={contract}&eventType=arena::game::Scored"
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["data"]["block_number"], 12);
    assert_eq!(body["data"]["decoded"]["points"], 400);

    // Latest per player, newest representative first.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri(format!(
                    "/events/get-unique-ordered?contractAddress={contract}&eventType=arena::game::Scored&uniqueKey=player"
                ))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    let groups = body["data"].as_array().unwrap();
    assert_eq!(groups.len(), 2);
    assert_eq!(groups[0]["decoded"]["points"], 400);
    assert_eq!(groups[1]["decoded"]["points"], 250);

    // Equality filter on a decoded field.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(format!(
                    "/events/get-latest-with?contractAddress={contract}&eventType=arena::game::Scored"
                ))
                .header("content-type", "application/json")
                .body(Body::from(format!(
                    "{{\"player\":\"{}\"}}",
                    normalize_hex("0x6")
                )))
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["data"]["block_number"], 11);
}

#[tokio::test]
async fn standalone_surface_serves_stored_events() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = Arc::new(EventStore::open(dir.path()).unwrap());

    for (block, tx, order, unique) in [(5, "0xa", "0x2", "0xaa"), (6, "0xb", "0x1", "0xaa")] {
        store
            .store_event(&StoredEvent {
                block_number: block,
                transaction_hash: normalize_hex(tx),
                from_address: normalize_hex("0xc0ffee"),
                keys: vec![normalize_hex("0x1"), normalize_hex(order)],
                data: vec![],
                timestamp: 1_700_000_000,
                order_key: normalize_hex(order),
                unique_key: Some(normalize_hex(unique)),
                decoded: None,
            })
            .unwrap();
    }

    let config = IndexerConfig {
        contract: "0xc0ffee".to_string(),
        event: "Transfer".to_string(),
        order_by: 0,
        unique: 0,
        start_block: 0,
        rpc_url: "http://localhost:5050".to_string(),
        network: "sepolia".to_string(),
        data_dir: dir.path().to_path_buf(),
    };
    let router = standalone_router(ApiState::standalone(
        store.clone(),
        Arc::new(IndexerStatus::default()),
        &config,
    ));

    // Ordered by order key, not block number.
    let response = router
        .clone()
        .oneshot(Request::builder().uri("/events").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["total_count"], 2);
    assert_eq!(body["events"][0]["block_number"], 6);

    // Unique collapse keeps the latest stored event for the shared key.
    let response = router
        .clone()
        .oneshot(
            Request::builder()
                .uri("/events-latest-ordered")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let body = body_json(response).await;
    assert_eq!(body["total_count"], 1);
    assert_eq!(body["events"][0]["block_number"], 6);
}
