#![deny(
    trivial_numeric_casts,
    missing_docs,
    unsafe_code,
    unstable_features,
    unused_import_braces,
    unused_qualifications,
    unused_extern_crates,
    unused_results
)]
#![warn(rust_2021_compatibility, unreachable_pub)]

//! Definition of the `SearchIndexClient` trait: the Bulk Writer contract
//! between the pipeline runner and whatever search cluster documents are
//! written to. The concrete Elasticsearch adapter lives in [`elastic`]; an
//! in-memory recorder for tests and demos lives in [`testing`].

/// The concrete `SearchIndexClient` backed by a real Elasticsearch cluster.
pub mod elastic;
/// An in-memory `SearchIndexClient` for tests and demos.
pub mod testing;

use std::collections::HashMap;

use async_trait::async_trait;

/// All the errors this crate can raise.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The client could not be constructed (bad node URL, TLS setup, ...).
    #[error("invalid search client configuration: {0}")]
    InvalidConfig(String),

    /// A bulk request failed outright, or came back with one or more
    /// per-item failures.
    #[error("bulk flush failed: {reason}")]
    Flush {
        /// Human readable explanation.
        reason: String,
        /// Per-document failures, keyed by document id, if the transport
        /// call itself succeeded but individual items were rejected.
        item_failures: HashMap<String, String>,
    },
}

/// One operation accumulated by the Bulk Writer, ready to be sent to the
/// destination index.
#[derive(Debug, Clone, PartialEq)]
pub enum BulkOp {
    /// Upsert-by-id with the full document (emitted for `insert` events).
    Index {
        /// Destination index.
        index: String,
        /// Document id (the row's stringified primary key).
        id: String,
        /// Document body.
        doc: row::IntermediateRow,
    },
    /// Update-by-id with `doc_as_upsert=true` (emitted for `update` events).
    Update {
        /// Destination index.
        index: String,
        /// Document id.
        id: String,
        /// Partial (or full) document to merge.
        doc: row::IntermediateRow,
    },
    /// Delete-by-id (emitted for `delete` events). A delete of a nonexistent
    /// id is treated as success, not a failure.
    Delete {
        /// Destination index.
        index: String,
        /// Document id.
        id: String,
    },
}

impl BulkOp {
    /// The document id this operation targets.
    pub fn id(&self) -> &str {
        match self {
            BulkOp::Index { id, .. } | BulkOp::Update { id, .. } | BulkOp::Delete { id, .. } => id,
        }
    }

    /// The destination index this operation targets.
    pub fn index(&self) -> &str {
        match self {
            BulkOp::Index { index, .. } | BulkOp::Update { index, .. } | BulkOp::Delete { index, .. } => index,
        }
    }
}

/// The Bulk Writer contract: accumulates operations and flushes them to the
/// destination search cluster. `flush` submits all pending operations
/// atomically from the writer's point of view and clears the buffer only on
/// success.
#[async_trait]
pub trait SearchIndexClient: Send {
    /// Called once before the first `add`/`flush`.
    async fn init(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Called during shutdown, after the last flush has completed.
    async fn stop(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Buffers one operation. Never fails; failures only ever surface at `flush`.
    fn add(&mut self, op: BulkOp);

    /// Number of operations currently buffered.
    fn pending(&self) -> usize;

    /// Submits every buffered operation. On success the buffer is cleared;
    /// on failure the buffer is left untouched so the caller can decide
    /// whether to retry or abort (this crate's policy, set by the pipeline
    /// consumer loop, is to abort — see the error handling design).
    async fn flush(&mut self) -> Result<(), Error>;
}
