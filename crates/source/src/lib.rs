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

//! Definition of the `ReplicationSource` trait: the contract between the
//! pipeline and whatever is tailing the upstream replication log. The
//! concrete MySQL adapter lives in [`mysql`]; a canned in-memory adapter for
//! tests and demos lives in [`testing`].

/// `EffectHandler`: how a `ReplicationSource` emits onto the pipeline channel.
pub mod effect;
/// The concrete `ReplicationSource` backed by a live MySQL binlog stream.
pub mod mysql;
/// An in-memory `ReplicationSource` for tests and demos.
pub mod testing;

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use context::Context;
use row::PositionMarker;
use task::TaskManager;
use tokio_util::sync::CancellationToken;

use crate::effect::EffectHandler;

/// All the errors this crate can raise.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The source could not be configured (bad DSN, required row-image mode
    /// not set, unreachable server, ...). Always fatal at startup.
    #[error("invalid source configuration: {0}")]
    InvalidConfig(String),

    /// The connection to the upstream replication log was lost or a protocol
    /// error occurred while streaming it.
    #[error("upstream transport error: {0}")]
    Upstream(String),

    /// Sending an event downstream failed (the consumer side of the channel
    /// is gone).
    #[error("failed to emit event: {0}")]
    Emit(String),
}

/// Handed to a `ReplicationSource` at `init` time so it can register its
/// background task with the supervisor's task manager.
pub struct EngineHandler {
    task_manager: TaskManager,
    context: Arc<Context>,
}

impl EngineHandler {
    /// Creates a new `EngineHandler`.
    pub fn new(task_manager: TaskManager, context: Arc<Context>) -> Self {
        Self { task_manager, context }
    }

    /// Returns the task manager.
    pub fn task_manager(&self) -> TaskManager {
        self.task_manager.clone()
    }

    /// Returns the initialization context.
    pub fn context(&self) -> Arc<Context> {
        self.context.clone()
    }
}

/// The set of `schema.table` keys the pipeline has been configured to care
/// about. Built once at startup from the projection configuration and never
/// mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    keys: HashSet<String>,
}

impl TableFilter {
    /// Builds a filter from an iterator of `(schema, table)` pairs.
    pub fn new(tables: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            keys: tables.into_iter().map(|(schema, table)| format!("{schema}.{table}")).collect(),
        }
    }

    /// Returns `true` if `schema.table` is in the filter.
    pub fn contains(&self, schema: &str, table: &str) -> bool {
        self.keys.contains(&format!("{schema}.{table}"))
    }
}

/// A replication-log adapter: tails the upstream log and emits row events
/// and position markers through an `EffectHandler`.
#[async_trait]
pub trait ReplicationSource: Send {
    /// Called once before `run`. May perform startup checks (e.g. requiring
    /// full row images) and register background state with the engine.
    async fn init(&mut self, _engine_handler: EngineHandler) -> Result<(), Error> {
        Ok(())
    }

    /// Called during shutdown, after `run` has observed cancellation.
    async fn stop(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Streams row events and position markers to `effect_handler` until
    /// `cancellation` is triggered, then returns without emitting further
    /// events. `resume_from` is the position loaded from the position store
    /// at startup; `None` means this is a fresh deployment and the source
    /// should snapshot the configured tables before streaming.
    async fn run(
        &mut self,
        resume_from: Option<PositionMarker>,
        cancellation: CancellationToken,
        effect_handler: EffectHandler,
    ) -> Result<(), Error>;
}
