//! Dual-mode ingestion engine.
//!
//! The engine follows one (contract, event selector) pair. It always attempts
//! push mode first: a WebSocket subscription delivering events as they are
//! emitted. When the node cannot provide a subscription, it falls back to
//! pull mode: windowed `starknet_getEvents` polling with continuation tokens.
//! Both paths persist through the same store and resume from the durable
//! cursor after a restart.

mod polling;
mod push;
mod retry;

pub use polling::poll_window_end;
pub use retry::RetryPolicy;

use anyhow::{Context, Result};
use serde::Serialize;
use starknet::core::types::Felt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::StorageError;
use crate::felt::{block_key, event_selector, normalize_felt};
use crate::provider::ChainProvider;
use crate::storage::{EventStore, StoredEvent};

/// Configuration of one standalone indexing run.
#[derive(Debug, Clone, Serialize)]
pub struct IndexerConfig {
    pub contract: String,
    pub event: String,
    /// Index into `keys[1..] ++ data` used as the order key; out of range
    /// falls back to the block number.
    pub order_by: i64,
    /// Index into `keys[1..] ++ data` used as the unique key; negative
    /// disables the unique index.
    pub unique: i64,
    pub start_block: u64,
    pub rpc_url: String,
    pub network: String,
    pub data_dir: PathBuf,
}

/// Shared, externally visible engine state (served by `/status`).
#[derive(Debug, Default)]
pub struct IndexerStatus {
    pub running: AtomicBool,
    pub current_block: AtomicU64,
}

impl IndexerStatus {
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn current_block(&self) -> u64 {
        self.current_block.load(Ordering::SeqCst)
    }
}

/// Resume floor after a restart: the block after the last durably persisted
/// one, unless the configured start is ahead of it.
pub fn effective_start(last_processed_block: u64, configured_start: u64) -> u64 {
    if last_processed_block == 0 {
        return configured_start;
    }
    (last_processed_block + 1).max(configured_start)
}

/// Selects the order key from the virtual array `keys[1..] ++ data`; the
/// selector key itself is excluded. Out-of-range indices fall back to the
/// fixed-width block number.
pub fn derive_order_key(order_by: i64, keys: &[Felt], data: &[Felt], block_number: u64) -> String {
    if order_by >= 0 {
        if let Some(felt) = virtual_payload_get(keys, data, order_by as usize) {
            return normalize_felt(felt);
        }
    }
    block_key(block_number)
}

/// Selects the unique key from `keys[1..] ++ data`; negative or out-of-range
/// indices disable the unique index for this event.
pub fn derive_unique_key(unique: i64, keys: &[Felt], data: &[Felt]) -> Option<String> {
    if unique < 0 {
        return None;
    }
    virtual_payload_get(keys, data, unique as usize).map(normalize_felt)
}

fn virtual_payload_get<'a>(keys: &'a [Felt], data: &'a [Felt], index: usize) -> Option<&'a Felt> {
    let key_count = keys.len().saturating_sub(1);
    if index < key_count {
        keys.get(index + 1)
    } else {
        data.get(index - key_count)
    }
}

/// The ingestion engine for one (contract, event) pair.
pub struct Indexer {
    config: IndexerConfig,
    provider: ChainProvider,
    store: Arc<EventStore>,
    contract: Felt,
    selector: Felt,
    status: Arc<IndexerStatus>,
    shutdown: CancellationToken,
    retry: RetryPolicy,
}

impl Indexer {
    pub fn new(
        config: IndexerConfig,
        store: Arc<EventStore>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let contract = Felt::from_hex(&config.contract)
            .with_context(|| format!("invalid contract address: {}", config.contract))?;
        let selector = event_selector(&config.event)?;
        let provider = ChainProvider::new(&config.rpc_url)?;

        let last = store.last_processed_block()?;
        let start = effective_start(last, config.start_block);
        let status = Arc::new(IndexerStatus::default());
        status.current_block.store(start, Ordering::SeqCst);

        if last > 0 {
            tracing::info!(
                target: "hasira::indexer",
                last_processed = last,
                resume_from = start,
                "Resuming from stored cursor"
            );
        }

        Ok(Self {
            config,
            provider,
            store,
            contract,
            selector,
            status,
            shutdown,
            retry: RetryPolicy::default(),
        })
    }

    pub fn status(&self) -> Arc<IndexerStatus> {
        self.status.clone()
    }

    pub fn config(&self) -> &IndexerConfig {
        &self.config
    }

    /// Runs until shutdown. Push mode first; a failed connect or subscribe
    /// falls back to polling for the life of the process.
    pub async fn run(&self) -> Result<()> {
        self.status.running.store(true, Ordering::SeqCst);
        tracing::info!(
            target: "hasira::indexer",
            contract = %normalize_felt(&self.contract),
            event = %self.config.event,
            selector = %normalize_felt(&self.selector),
            start_block = self.status.current_block(),
            "Starting indexer"
        );

        let result = match self.run_push().await {
            Ok(()) => Ok(()),
            Err(e) if self.shutdown.is_cancelled() => {
                tracing::debug!(target: "hasira::indexer", error = %e, "Push ended during shutdown");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(
                    target: "hasira::indexer",
                    error = %e,
                    "Push mode unavailable, falling back to polling"
                );
                self.run_polling().await
            }
        };

        self.status.running.store(false, Ordering::SeqCst);
        result
    }

    /// Derives keys, normalizes and persists one raw event, then advances the
    /// in-memory current block.
    fn index_event(
        &self,
        block_number: u64,
        transaction_hash: &Felt,
        from_address: &Felt,
        keys: &[Felt],
        data: &[Felt],
    ) -> Result<(), StorageError> {
        let order_key = derive_order_key(self.config.order_by, keys, data, block_number);
        let unique_key = derive_unique_key(self.config.unique, keys, data);

        let event = StoredEvent {
            block_number,
            transaction_hash: normalize_felt(transaction_hash),
            from_address: normalize_felt(from_address),
            keys: keys.iter().map(normalize_felt).collect(),
            data: data.iter().map(normalize_felt).collect(),
            timestamp: chrono::Utc::now().timestamp(),
            order_key,
            unique_key,
            decoded: None,
        };
        self.store.store_event(&event)?;

        self.status
            .current_block
            .fetch_max(block_number, Ordering::SeqCst);
        Ok(())
    }

    /// Client-side reassertion of the selector filter; nodes are not trusted
    /// to apply key filters.
    fn selector_matches(&self, keys: &[Felt]) -> bool {
        keys.first() == Some(&self.selector)
    }

    /// Sleeps unless shutdown arrives first; returns false on shutdown.
    async fn sleep_or_shutdown(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.shutdown.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn effective_start_prefers_stored_cursor() {
        // Fresh database: honor the configured start.
        assert_eq!(effective_start(0, 100), 100);
        // Stored through block 500, configured 0: resume at 501.
        assert_eq!(effective_start(500, 0), 501);
        // Configured start ahead of the cursor: skip forward.
        assert_eq!(effective_start(500, 800), 800);
        assert_eq!(effective_start(500, 501), 501);
    }

    #[test]
    fn order_key_excludes_selector() {
        let keys = vec![Felt::from(0xdead_u64), Felt::from(0x11_u64)];
        let data = vec![Felt::from(0x22_u64), Felt::from(0x33_u64)];

        // Index 0 is keys[1], not the selector.
        assert_eq!(
            derive_order_key(0, &keys, &data, 7),
            normalize_felt(&Felt::from(0x11_u64))
        );
        // Indices continue into data.
        assert_eq!(
            derive_order_key(1, &keys, &data, 7),
            normalize_felt(&Felt::from(0x22_u64))
        );
        assert_eq!(
            derive_order_key(2, &keys, &data, 7),
            normalize_felt(&Felt::from(0x33_u64))
        );
    }

    #[test]
    fn out_of_range_order_key_falls_back_to_block() {
        let keys = vec![Felt::from(0xdead_u64)];
        let data = vec![Felt::from(0x22_u64)];
        assert_eq!(derive_order_key(5, &keys, &data, 42), block_key(42));
        assert_eq!(derive_order_key(-1, &keys, &data, 42), block_key(42));
    }

    #[test]
    fn unique_key_is_optional() {
        let keys = vec![Felt::from(0xdead_u64), Felt::from(0x11_u64)];
        let data = vec![Felt::from(0x22_u64)];

        assert_eq!(derive_unique_key(-1, &keys, &data), None);
        assert_eq!(derive_unique_key(9, &keys, &data), None);
        assert_eq!(
            derive_unique_key(0, &keys, &data),
            Some(normalize_felt(&Felt::from(0x11_u64)))
        );
        assert_eq!(
            derive_unique_key(1, &keys, &data),
            Some(normalize_felt(&Felt::from(0x22_u64)))
        );
    }
}
