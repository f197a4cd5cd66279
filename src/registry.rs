//! Contract registry: routes incoming events to the right ABI.
//!
//! The directory distinguishes registry contracts (whose events announce new
//! contracts to follow) from regular registered contracts. Classification is
//! by emitting address; announcements pull the child contract's ABI from the
//! chain, extend the directory, and ask the subscription layer to follow the
//! new address. Administrative adds and the registry task synchronize through
//! the directory mutex; the mutex is never held across an await point.

use anyhow::{Context, Result};
use starknet::core::types::Felt;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

use crate::abi::ContractAbi;
use crate::felt::{block_key, event_selector, normalize_felt};
use crate::provider::ChainProvider;
use crate::storage::{EventStore, StoredEvent};
use crate::subscription::{RawEvent, SubscribeRequest};

/// Event name announcing a child contract on a registry contract.
pub const CONTRACT_REGISTERED_EVENT: &str = "ContractRegistered";

/// A contract the indexer follows, with its fetched ABI.
#[derive(Debug, Clone)]
pub struct ContractEntry {
    pub address: Felt,
    pub class_hash: Felt,
    pub abi: ContractAbi,
}

#[derive(Default)]
struct Directory {
    registry_addresses: HashSet<Felt>,
    registry_contracts: HashMap<Felt, ContractEntry>,
    registered_contracts: HashMap<Felt, ContractEntry>,
    last_completed_block: u64,
}

/// How an incoming event relates to the directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Classification {
    Announcement,
    Registered,
    Unknown,
}

/// Directory counters for the status surface.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RegistryCounts {
    pub registry_contracts: usize,
    pub registered_contracts: usize,
    pub last_completed_block: u64,
}

pub struct ContractRegistry {
    directory: Mutex<Directory>,
    provider: Arc<ChainProvider>,
    store: Arc<EventStore>,
    subscribe_tx: mpsc::UnboundedSender<SubscribeRequest>,
    registered_selector: Felt,
}

impl ContractRegistry {
    pub fn new(
        provider: Arc<ChainProvider>,
        store: Arc<EventStore>,
        subscribe_tx: mpsc::UnboundedSender<SubscribeRequest>,
    ) -> Result<Self> {
        let registered_selector = event_selector(CONTRACT_REGISTERED_EVENT)?;
        Ok(Self {
            directory: Mutex::new(Directory::default()),
            provider,
            store,
            subscribe_tx,
            registered_selector,
        })
    }

    /// Administrative add: fetches the registry contract's ABI, records the
    /// address as a registry both in memory and durably, and requests a
    /// subscription for it.
    pub async fn add_registry_contract(&self, address: Felt) -> Result<()> {
        let abi = self
            .provider
            .class_at(address)
            .await
            .with_context(|| format!("failed to fetch registry ABI for {address:#x}"))?;

        // Persist first: an add that cannot be recorded must not silently
        // disappear on the next restart.
        let cursor = self.store.last_processed_block()?;
        self.store
            .add_registry_address(&normalize_felt(&address), cursor)
            .context("failed to persist registry address")?;

        self.insert_registry_contract(ContractEntry {
            address,
            // The class hash is only learned from announcements; admin adds
            // reference the contract by address alone.
            class_hash: Felt::ZERO,
            abi,
        });

        self.request_subscription(address, 0);
        tracing::info!(
            target: "hasira::registry",
            address = %normalize_felt(&address),
            "Registry contract added"
        );
        Ok(())
    }

    /// Rebuilds the in-memory directory from the store after a restart:
    /// admin-added registry addresses first, then every contract named by a
    /// persisted announcement. ABIs are re-fetched from the chain; a contract
    /// whose class can no longer be read is skipped with a warning.
    /// Subscriptions for restored contracts resume from the durable cursor.
    pub async fn load_from_store(&self) -> Result<()> {
        let from_block = self.store.last_processed_block()?;

        for address in self.store.registry_addresses()? {
            let felt = match Felt::from_hex(&address) {
                Ok(felt) => felt,
                Err(e) => {
                    tracing::warn!(
                        target: "hasira::registry",
                        address = %address,
                        error = %e,
                        "Skipping malformed stored registry address"
                    );
                    continue;
                }
            };
            match self.provider.class_at(felt).await {
                Ok(abi) => {
                    self.insert_registry_contract(ContractEntry {
                        address: felt,
                        class_hash: Felt::ZERO,
                        abi,
                    });
                    self.request_subscription(felt, from_block);
                    tracing::info!(
                        target: "hasira::registry",
                        address = %address,
                        from_block,
                        "Restored registry contract"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        target: "hasira::registry",
                        address = %address,
                        error = %e,
                        "Failed to restore registry contract"
                    );
                }
            }
        }

        for event in self.store.announcement_events()? {
            // The raw announcement still carries the announced address and
            // class hash at keys[1] / data[0].
            let (Some(announced), Some(class_hash)) = (event.keys.get(1), event.data.first())
            else {
                tracing::warn!(
                    target: "hasira::registry",
                    block = event.block_number,
                    "Stored announcement is missing address or class hash"
                );
                continue;
            };
            let (Ok(announced), Ok(class_hash)) =
                (Felt::from_hex(announced), Felt::from_hex(class_hash))
            else {
                tracing::warn!(
                    target: "hasira::registry",
                    block = event.block_number,
                    "Stored announcement has malformed address or class hash"
                );
                continue;
            };

            let already_registered = {
                let directory = self.directory.lock().expect("directory poisoned");
                directory.registered_contracts.contains_key(&announced)
            };
            if already_registered {
                continue;
            }

            match self.provider.class_at(announced).await {
                Ok(abi) => {
                    self.insert_registered_contract(ContractEntry {
                        address: announced,
                        class_hash,
                        abi,
                    });
                    self.request_subscription(announced, from_block);
                    tracing::info!(
                        target: "hasira::registry",
                        address = %normalize_felt(&announced),
                        from_block,
                        "Restored registered contract"
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        target: "hasira::registry",
                        address = %normalize_felt(&announced),
                        error = %e,
                        "Failed to restore registered contract"
                    );
                }
            }
        }

        Ok(())
    }

    /// Inserts a registry contract entry directly (no ABI fetch).
    pub fn insert_registry_contract(&self, entry: ContractEntry) {
        let mut directory = self.directory.lock().expect("directory poisoned");
        directory.registry_addresses.insert(entry.address);
        directory.registry_contracts.insert(entry.address, entry);
    }

    /// Inserts a followed contract entry directly (no ABI fetch). A repeated
    /// address overwrites in place.
    pub fn insert_registered_contract(&self, entry: ContractEntry) {
        let mut directory = self.directory.lock().expect("directory poisoned");
        directory.registered_contracts.insert(entry.address, entry);
    }

    pub fn counts(&self) -> RegistryCounts {
        let directory = self.directory.lock().expect("directory poisoned");
        RegistryCounts {
            registry_contracts: directory.registry_contracts.len(),
            registered_contracts: directory.registered_contracts.len(),
            last_completed_block: directory.last_completed_block,
        }
    }

    pub fn last_completed_block(&self) -> u64 {
        self.directory
            .lock()
            .expect("directory poisoned")
            .last_completed_block
    }

    /// Classifies and processes one incoming event. Unknown senders are
    /// logged and dropped; per-event failures never propagate out of the
    /// registry task.
    pub async fn process_event(&self, raw: &RawEvent) {
        self.track_completed_block(raw.block_number);

        match self.classify(&raw.from_address) {
            Classification::Announcement => {
                if let Err(e) = self.process_announcement(raw).await {
                    tracing::warn!(
                        target: "hasira::registry",
                        block = raw.block_number,
                        error = %e,
                        "Failed to process registry announcement"
                    );
                }
            }
            Classification::Registered => self.process_contract_event(raw),
            Classification::Unknown => {
                tracing::debug!(
                    target: "hasira::registry",
                    address = %normalize_felt(&raw.from_address),
                    "Dropping event from unknown contract"
                );
            }
        }
    }

    fn classify(&self, from_address: &Felt) -> Classification {
        let directory = self.directory.lock().expect("directory poisoned");
        if directory.registry_addresses.contains(from_address) {
            Classification::Announcement
        } else if directory.registered_contracts.contains_key(from_address) {
            Classification::Registered
        } else {
            Classification::Unknown
        }
    }

    /// Handles a `ContractRegistered` announcement: fetch the child ABI,
    /// extend the directory, persist the decoded announcement, and follow
    /// the child from the announcement block onward.
    async fn process_announcement(&self, raw: &RawEvent) -> Result<()> {
        if raw.keys.first() != Some(&self.registered_selector) {
            let selector = raw.keys.first().map(normalize_felt).unwrap_or_default();
            tracing::debug!(
                target: "hasira::registry",
                selector = %selector,
                "Ignoring non-announcement registry event"
            );
            return Ok(());
        }

        let announced = *raw
            .keys
            .get(1)
            .context("announcement is missing the contract address key")?;
        let class_hash = *raw
            .data
            .first()
            .context("announcement is missing the class hash")?;

        let abi = self
            .provider
            .class_at(announced)
            .await
            .with_context(|| format!("failed to fetch ABI for announced contract {announced:#x}"))?;

        self.insert_registered_contract(ContractEntry {
            address: announced,
            class_hash,
            abi,
        });

        // The announcement itself is decodable against the registry's ABI;
        // persisting it makes the directory reconstructible after a restart.
        let registry_abi = {
            let directory = self.directory.lock().expect("directory poisoned");
            directory
                .registry_contracts
                .get(&raw.from_address)
                .map(|entry| entry.abi.clone())
        };
        if let Some(registry_abi) = registry_abi {
            self.store_decoded(raw, &registry_abi, "registry_address");
        }

        self.request_subscription(announced, raw.block_number);
        tracing::info!(
            target: "hasira::registry",
            address = %normalize_felt(&announced),
            class_hash = %normalize_felt(&class_hash),
            block = raw.block_number,
            "Contract registered"
        );
        Ok(())
    }

    /// Decodes and persists an event from a followed contract.
    fn process_contract_event(&self, raw: &RawEvent) {
        let abi = {
            let directory = self.directory.lock().expect("directory poisoned");
            directory
                .registered_contracts
                .get(&raw.from_address)
                .map(|entry| entry.abi.clone())
        };
        let Some(abi) = abi else {
            // Raced with a concurrent directory change; treat as unknown.
            return;
        };
        self.store_decoded(raw, &abi, "contract_address");
    }

    /// Decodes `raw` against `abi` and stores it. Decode failures are logged
    /// and the event is skipped; ingestion never halts on one bad event.
    fn store_decoded(&self, raw: &RawEvent, abi: &ContractAbi, address_field: &str) {
        let Some(selector) = raw.keys.first() else {
            tracing::warn!(target: "hasira::registry", block = raw.block_number, "Event without keys");
            return;
        };

        let payload: Vec<Felt> = raw
            .keys
            .iter()
            .skip(1)
            .chain(raw.data.iter())
            .copied()
            .collect();

        let record = match abi.decode_event(selector, &payload) {
            Ok(decoded) => decoded.into_record(
                address_field,
                &raw.from_address,
                raw.block_number,
                &raw.transaction_hash,
            ),
            Err(e) => {
                tracing::warn!(
                    target: "hasira::registry",
                    block = raw.block_number,
                    selector = %normalize_felt(selector),
                    error = %e,
                    "Skipping undecodable event"
                );
                return;
            }
        };

        let event = StoredEvent {
            block_number: raw.block_number,
            transaction_hash: normalize_felt(&raw.transaction_hash),
            from_address: normalize_felt(&raw.from_address),
            keys: raw.keys.iter().map(normalize_felt).collect(),
            data: raw.data.iter().map(normalize_felt).collect(),
            timestamp: chrono::Utc::now().timestamp(),
            // Registry-driven ingestion orders by chain position.
            order_key: block_key(raw.block_number),
            unique_key: None,
            decoded: Some(record),
        };

        if let Err(e) = self.store.store_event(&event) {
            tracing::error!(
                target: "hasira::registry",
                block = raw.block_number,
                error = %e,
                "Failed to store decoded event"
            );
        }
    }

    fn request_subscription(&self, address: Felt, from_block: u64) {
        if self
            .subscribe_tx
            .send(SubscribeRequest { address, from_block })
            .is_err()
        {
            tracing::warn!(
                target: "hasira::registry",
                address = %normalize_felt(&address),
                "Subscription channel closed"
            );
        }
    }

    /// Conservative watermark: seeing block `B` means `B - 1` is fully
    /// drained upstream.
    fn track_completed_block(&self, block_number: u64) {
        let mut directory = self.directory.lock().expect("directory poisoned");
        if block_number > directory.last_completed_block + 1 {
            directory.last_completed_block = block_number - 1;
        }
    }
}
