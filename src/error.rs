//! Typed failures for the decode and storage components.
//!
//! Decode errors are per-event: the ingestion loop logs and skips the
//! offending event without halting. Storage errors are fatal at open time and
//! surfaced to the ingestion loop per write.

use thiserror::Error;

/// Failure while walking an ABI tree or decoding an event payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// No event-enum variant matches the selector, or the ABI has no usable
    /// top-level event enum.
    #[error("unknown event selector {selector}")]
    UnknownEvent { selector: String },

    /// The ABI names a type this decoder cannot interpret.
    #[error("unknown ABI type `{type_name}`")]
    UnknownType { type_name: String },

    /// A struct type referenced by the ABI is not declared in it.
    #[error("unresolved struct type `{type_name}`")]
    UnresolvedStruct { type_name: String },

    /// The flat payload ended before the type tree was fully consumed.
    #[error("payload exhausted while decoding `{type_name}`")]
    ShortPayload { type_name: String },

    /// A field element does not fit the primitive it should decode to.
    #[error("value {value} out of range for `{type_name}`")]
    OutOfRange { type_name: String, value: String },

    /// The contract class carries no ABI this decoder understands.
    #[error("unusable contract ABI: {0}")]
    InvalidAbi(String),
}

/// Failure inside the embedded event store.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to open event store")]
    Open(#[from] redb::DatabaseError),

    #[error("storage transaction failed")]
    Transaction(#[from] redb::TransactionError),

    #[error("storage table unavailable")]
    Table(#[from] redb::TableError),

    #[error("storage read/write failed")]
    Io(#[from] redb::StorageError),

    #[error("storage commit failed")]
    Commit(#[from] redb::CommitError),

    #[error("failed to encode stored event")]
    Encode(#[from] serde_json::Error),

    #[error("failed to create data directory {path}")]
    DataDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
