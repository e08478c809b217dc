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

//! The stage dispatcher: an explicit name-to-implementation registry for
//! projection pipeline stages, replacing the reflection-based dispatch of
//! the system this crate is modeled on. Each stage consumes one row and
//! produces zero or more rows; a stage that needs to read other rows in the
//! same schema does so through the read-only SQL pool it is handed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use row::IntermediateRow;
use serde_json::Value;
use sql::SqlPool;

/// The stages shipped with this crate: `noop`, `set_field`, `expand_list`, `sql_lookup`.
pub mod builtins;

/// All the errors this crate can raise.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A projection configuration referenced a stage name that was never registered.
    #[error("unknown stage: {0}")]
    UnknownStage(String),
    /// A required parameter was missing or had the wrong shape.
    #[error("stage {stage} invalid parameter {param}: {reason}")]
    InvalidParam {
        /// Name of the stage being invoked.
        stage: String,
        /// Name of the offending parameter.
        param: String,
        /// Human readable explanation.
        reason: String,
    },
    /// A read-only enrichment query against the source database failed.
    #[error("stage {stage} sql lookup failed: {source}")]
    Sql {
        /// Name of the stage being invoked.
        stage: String,
        /// Underlying sql error.
        #[source]
        source: sql::Error,
    },
    /// The stage panicked while processing a row.
    #[error("stage {0} panicked")]
    Panicked(String),
}

/// Context a stage is invoked with: the schema the event came from (used to
/// pick the right pool) and the connection pools built at startup.
pub struct StageContext<'a> {
    /// Schema the current event originated from.
    pub schema: &'a str,
    /// Connection pools, keyed by schema.
    pub sql_pool: &'a SqlPool,
}

/// A named, registered pipeline stage. Implementations must be pure with
/// respect to the input row (no mutation through shared state) but may issue
/// read-only queries through `StageContext::sql_pool`.
#[async_trait]
pub trait Stage: Send + Sync {
    /// Runs this stage against one row, producing zero or more rows.
    ///
    /// Returning zero rows is a valid, expected outcome (the pipeline runner
    /// treats it as an early-out for the current projection configuration,
    /// not an error).
    async fn run(
        &self,
        row: &IntermediateRow,
        params: &[(String, Value)],
        ctx: &StageContext<'_>,
    ) -> Result<Vec<IntermediateRow>, Error>;
}

/// Resolves stage names (as they appear in a projection's `pipeline` object)
/// to their implementation. Built once at startup; unknown names fail
/// startup rather than surfacing as a runtime error mid-stream.
#[derive(Clone, Default)]
pub struct StageDispatcher {
    stages: HashMap<String, Arc<dyn Stage>>,
}

impl StageDispatcher {
    /// An empty dispatcher with none of the built-ins registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// The dispatcher with every built-in stage registered under its
    /// conventional name (`noop`, `set_field`, `expand_list`, `sql_lookup`).
    pub fn with_builtins() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register("noop", Arc::new(builtins::NoOp));
        dispatcher.register("set_field", Arc::new(builtins::SetField));
        dispatcher.register("expand_list", Arc::new(builtins::ExpandList));
        dispatcher.register("sql_lookup", Arc::new(builtins::SqlLookup));
        dispatcher
    }

    /// Registers (or overwrites) a stage implementation under `name`.
    pub fn register(&mut self, name: &str, stage: Arc<dyn Stage>) {
        let _ = self.stages.insert(name.to_string(), stage);
    }

    /// Resolves `name`, failing if it was never registered. Projection
    /// loading calls this for every stage in every configuration so unknown
    /// names are caught at startup.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Stage>, Error> {
        self.stages.get(name).cloned().ok_or_else(|| Error::UnknownStage(name.to_string()))
    }

    /// Validates that every stage name in `names` is registered, without
    /// running anything. Used to fail projection loading fast.
    pub fn validate_all<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> Result<(), Error> {
        for name in names {
            let _ = self.resolve(name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_are_registered_under_conventional_names() {
        let dispatcher = StageDispatcher::with_builtins();
        assert!(dispatcher.resolve("noop").is_ok());
        assert!(dispatcher.resolve("set_field").is_ok());
        assert!(dispatcher.resolve("expand_list").is_ok());
        assert!(dispatcher.resolve("sql_lookup").is_ok());
    }

    #[test]
    fn unknown_stage_is_an_error() {
        let dispatcher = StageDispatcher::with_builtins();
        assert!(matches!(dispatcher.resolve("not_a_stage"), Err(Error::UnknownStage(_))));
    }

    #[test]
    fn validate_all_surfaces_first_unknown_name() {
        let dispatcher = StageDispatcher::with_builtins();
        assert!(dispatcher.validate_all(["noop", "missing"]).is_err());
        assert!(dispatcher.validate_all(["noop", "set_field"]).is_ok());
    }
}
