//! Hasira - chain-event indexing core.
//!
//! A long-running indexer for Starknet-style chains: it follows emitted
//! events over a WebSocket subscription (falling back to range polling),
//! decodes them against contract ABIs, persists them under multiple ordering
//! indexes in an embedded key-value store, and serves paginated read APIs.

pub mod abi;
pub mod config;
pub mod error;
pub mod felt;
pub mod http;
pub mod indexer;
pub mod provider;
pub mod registry;
pub mod storage;
pub mod subscription;

pub use abi::{ContractAbi, DecodedEvent, Value};
pub use error::{DecodeError, StorageError};
pub use indexer::{Indexer, IndexerConfig, IndexerStatus};
pub use provider::ChainProvider;
pub use registry::{ContractEntry, ContractRegistry};
pub use storage::{EventStore, Order, StoredEvent};
pub use subscription::{RawEvent, SubscribeRequest};
