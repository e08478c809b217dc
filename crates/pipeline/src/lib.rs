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

//! The Pipeline Runner and Flush Controller: the consumer side of the
//! replication channel. The runner walks a row event through its configured
//! projection stages and turns the result into bulk operations; the flush
//! controller owns the consumer loop that decides when those operations (and
//! the replication position) actually get persisted.

/// The Flush Controller consumer loop.
pub mod flush;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use projection::ProjectionRegistry;
use row::{Action, IntermediateRow, RowEvent};
use search::{BulkOp, SearchIndexClient};
use sql::SqlPool;
use stage::{Stage, StageContext, StageDispatcher};

pub use flush::{FlushController, FlushControllerConfig};

/// All the errors this crate can raise.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The row could not be normalized into the pipeline's working shape.
    #[error("row error: {0}")]
    Row(#[from] row::RowError),
    /// A stage failed or panicked while processing a row.
    #[error(transparent)]
    Stage(#[from] stage::Error),
    /// The bulk writer could not flush its pending operations.
    #[error("bulk writer flush failed: {0}")]
    Flush(#[from] search::Error),
    /// The position store could not persist a checkpoint.
    #[error("position store error: {0}")]
    Position(#[from] position::Error),
}

/// Walks a `RowEvent` through its matching projection configurations,
/// producing bulk operations on the search-index writer.
///
/// Holds no mutable state of its own: the projection registry and stage
/// dispatcher are both immutable after startup, so a single runner is shared
/// (by reference) across every event the flush controller processes.
pub struct PipelineRunner {
    registry: ProjectionRegistry,
    dispatcher: StageDispatcher,
}

impl PipelineRunner {
    /// Builds a runner from an already-loaded registry and dispatcher.
    pub fn new(registry: ProjectionRegistry, dispatcher: StageDispatcher) -> Self {
        Self { registry, dispatcher }
    }

    /// Runs one row event through every configuration registered for its
    /// `schema_table_action` key, adding one bulk operation per resulting row
    /// to `writer`. An empty configuration list is a no-op, not an error.
    pub async fn run_event(
        &self,
        event: &RowEvent,
        sql_pool: &SqlPool,
        writer: &mut dyn SearchIndexClient,
    ) -> Result<(), Error> {
        let configs = self.registry.lookup(&event.registry_key());
        if configs.is_empty() {
            return Ok(());
        }

        let seed = event.seed_row()?;
        let ctx = StageContext {
            schema: &event.schema,
            sql_pool,
        };

        for config in configs {
            let mut working_set = vec![seed.clone()];

            for stage_spec in &config.pipeline {
                let stage = self.dispatcher.resolve(&stage_spec.name)?;

                let mut next = Vec::with_capacity(working_set.len());
                for row in &working_set {
                    let produced = invoke_stage(&stage, &stage_spec.name, row, &stage_spec.params, &ctx).await?;
                    next.extend(produced);
                }

                if next.is_empty() {
                    // Per-configuration early-out: this configuration yields
                    // no output, but sibling configurations for the same key
                    // still run.
                    working_set.clear();
                    break;
                }
                working_set = next;
            }

            if working_set.is_empty() {
                continue;
            }

            for row in working_set {
                writer.add(bulk_op_for(event.action, &config.dest.index, row)?);
            }
        }

        Ok(())
    }
}

/// Invokes a stage, converting a panic inside it into `stage::Error::Panicked`
/// instead of unwinding through the consumer task.
async fn invoke_stage(
    stage: &Arc<dyn Stage>,
    name: &str,
    row: &IntermediateRow,
    params: &[(String, serde_json::Value)],
    ctx: &StageContext<'_>,
) -> Result<Vec<IntermediateRow>, Error> {
    match AssertUnwindSafe(stage.run(row, params, ctx)).catch_unwind().await {
        Ok(result) => Ok(result?),
        Err(_) => Err(Error::Stage(stage::Error::Panicked(name.to_string()))),
    }
}

fn bulk_op_for(action: Action, index: &str, row: IntermediateRow) -> Result<BulkOp, Error> {
    let id_value = row.get("id").ok_or(row::RowError::MissingId)?;
    let id = row::coerce_id(id_value)?;

    Ok(match action {
        Action::Insert => BulkOp::Index {
            index: index.to_string(),
            id,
            doc: row,
        },
        Action::Update => BulkOp::Update {
            index: index.to_string(),
            id,
            doc: row,
        },
        Action::Delete => BulkOp::Delete {
            index: index.to_string(),
            id,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use projection::{Destination, ProjectionConfig, StageSpec};
    use row::RowEvent;
    use search::testing::RecordingSearchIndexClient;
    use serde_json::json;

    fn config_with_pipeline(stages: Vec<&str>, index: &str) -> ProjectionConfig {
        ProjectionConfig {
            schema: "shop".into(),
            tables: vec!["orders".into()],
            actions: vec!["insert".into(), "update".into(), "delete".into()],
            pipeline: stages
                .into_iter()
                .map(|name| StageSpec {
                    name: name.to_string(),
                    params: Vec::new(),
                })
                .collect(),
            dest: Destination { index: index.into() },
        }
    }

    fn row_event(action: Action, fields: serde_json::Value) -> RowEvent {
        RowEvent {
            schema: "shop".into(),
            table: "orders".into(),
            action,
            row: fields.as_object().unwrap().clone(),
        }
    }

    #[tokio::test]
    async fn insert_happy_path_emits_one_index_op() {
        let registry = ProjectionRegistry::from_configs(vec![config_with_pipeline(vec!["noop"], "orders_idx")]);
        let runner = PipelineRunner::new(registry, StageDispatcher::with_builtins());
        let sql_pool = SqlPool::empty();
        let (mut writer, flushed) = RecordingSearchIndexClient::new();

        let event = row_event(Action::Insert, json!({"id": 42, "status": "new"}));
        runner.run_event(&event, &sql_pool, &mut writer).await.unwrap();
        writer.flush().await.unwrap();

        let flushed = flushed.lock().unwrap();
        assert_eq!(flushed.len(), 1);
        match &flushed[0] {
            BulkOp::Index { index, id, doc } => {
                assert_eq!(index, "orders_idx");
                assert_eq!(id, "42");
                assert_eq!(doc.get("status"), Some(&serde_json::Value::String("new".into())));
            }
            other => panic!("expected Index op, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn update_path_emits_upsert_op() {
        let registry = ProjectionRegistry::from_configs(vec![config_with_pipeline(vec!["noop"], "orders_idx")]);
        let runner = PipelineRunner::new(registry, StageDispatcher::with_builtins());
        let sql_pool = SqlPool::empty();
        let (mut writer, flushed) = RecordingSearchIndexClient::new();

        let event = row_event(Action::Update, json!({"id": 42, "status": "paid"}));
        runner.run_event(&event, &sql_pool, &mut writer).await.unwrap();
        writer.flush().await.unwrap();

        assert!(matches!(flushed.lock().unwrap()[0], BulkOp::Update { .. }));
    }

    #[tokio::test]
    async fn unconfigured_schema_table_action_is_a_no_op() {
        let registry = ProjectionRegistry::from_configs(vec![]);
        let runner = PipelineRunner::new(registry, StageDispatcher::with_builtins());
        let sql_pool = SqlPool::empty();
        let (mut writer, flushed) = RecordingSearchIndexClient::new();

        let event = row_event(Action::Insert, json!({"id": 1}));
        runner.run_event(&event, &sql_pool, &mut writer).await.unwrap();

        assert_eq!(writer.pending(), 0);
        assert!(flushed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fan_out_stage_produces_one_op_per_expanded_row() {
        let mut config = config_with_pipeline(vec!["expand_list"], "tags_idx");
        config.pipeline[0].params = vec![("field".to_string(), json!("tags")), ("as".to_string(), json!("tag"))];
        let registry = ProjectionRegistry::from_configs(vec![config]);
        let runner = PipelineRunner::new(registry, StageDispatcher::with_builtins());
        let sql_pool = SqlPool::empty();
        let (mut writer, flushed) = RecordingSearchIndexClient::new();

        let event = row_event(Action::Insert, json!({"id": 7, "tags": ["a", "b"]}));
        runner.run_event(&event, &sql_pool, &mut writer).await.unwrap();
        writer.flush().await.unwrap();

        let flushed = flushed.lock().unwrap();
        assert_eq!(flushed.len(), 2);
        assert_eq!(flushed[0].id(), "7-0");
        assert_eq!(flushed[1].id(), "7-1");
    }
}
