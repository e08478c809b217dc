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

//! The Supervisor: wires every component named in the system overview in
//! dependency order, drives the per-instance state machine
//! (`Init -> Running -> Draining -> Closed`, with a terminal `Failed`), and
//! owns the single `CancellationToken` that every long-running task
//! cooperatively watches.

use std::sync::Arc;

use context::Context;
use pipeline::{FlushController, PipelineRunner};
use position::FilePositionStore;
use projection::ProjectionRegistry;
use row::PositionMarker;
use search::elastic::ElasticsearchBulkWriter;
use search::SearchIndexClient;
use source::effect::EffectHandler;
use source::mysql::MySqlReplicationSource;
use source::{EngineHandler, ReplicationSource};
use stage::StageDispatcher;
use task::{
    labels::{ProcessLabels, TaskLabels},
    TaskManager,
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// All the errors that can occur while wiring or running the pipeline.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The program config failed to load or validate.
    #[error(transparent)]
    Config(#[from] config::Error),
    /// The projection config failed to load, or referenced an unregistered stage.
    #[error(transparent)]
    Projection(#[from] projection::Error),
    /// A referenced stage name was never registered in the dispatcher.
    #[error(transparent)]
    Stage(#[from] stage::Error),
    /// The SQL connection pools could not be built or failed their liveness probe.
    #[error(transparent)]
    Sql(#[from] sql::Error),
    /// The position store could not be read at startup.
    #[error(transparent)]
    Position(#[from] position::Error),
    /// The replication source could not be configured, or failed while streaming.
    #[error(transparent)]
    Source(#[from] source::Error),
    /// The search client could not be constructed.
    #[error(transparent)]
    Search(#[from] search::Error),
    /// The consumer loop (pipeline runner / flush controller) failed fatally.
    #[error(transparent)]
    Pipeline(#[from] pipeline::Error),
}

/// Lifecycle state of one pipeline instance, per the state machine named in
/// the component design.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Components are being wired; not yet safe to stream.
    Init,
    /// Event Source and consumer task are both running.
    Running,
    /// Shutdown has started: the Event Source is being stopped and the
    /// channel is being drained.
    Draining,
    /// Shutdown completed cleanly.
    Closed,
    /// A non-recoverable error occurred; the instance drained via the same
    /// path as a clean shutdown but exits non-zero.
    Failed,
}

impl State {
    /// The process exit code this terminal state maps to. Only meaningful
    /// for `Closed`/`Failed`.
    pub fn exit_code(self) -> i32 {
        match self {
            State::Closed => 0,
            _ => 1,
        }
    }
}

/// The bounded channel capacity between the replication source and the
/// consumer task (§3: "capacity ≈ 4096").
const CHANNEL_CAPACITY: usize = 4096;

/// Wires and runs one instance of the CDC pipeline: one replication source,
/// one search client, one flush controller, sharing a single ordered channel
/// and a single cancellation token.
pub struct Supervisor {
    state: State,
    task_manager: TaskManager,
    cancellation: CancellationToken,
    source: Box<dyn ReplicationSource>,
    resume_position: Option<PositionMarker>,
    flush_controller: FlushController<ElasticsearchBulkWriter, FilePositionStore>,
}

impl Supervisor {
    /// Wires every component in the dependency order named in the system
    /// overview: Position Store, Table Filter (folded into the source
    /// config), Projection Registry, Stage Dispatcher, SQL pools, replication
    /// source, search client, Pipeline Runner, Flush Controller.
    ///
    /// Any failure here is a config error per the error taxonomy: missing
    /// file, unknown stage name, unresolvable schema/table, or an
    /// unreachable database/cluster. None of it streams yet.
    pub async fn wire(config: &config::Config, projections_path: impl AsRef<std::path::Path>) -> Result<Self, Error> {
        let position_store = FilePositionStore::new(&config.data_dir);
        let resume_position = position_store.load()?;

        let registry = ProjectionRegistry::load(projections_path)?;

        let dispatcher = StageDispatcher::with_builtins();
        let stage_names = registry.stage_names();
        dispatcher.validate_all(stage_names.iter().map(String::as_str))?;

        let sql_pool = sql::SqlPool::connect(&config.mysql_connection_settings(), &registry.schemas()).await?;

        let search_client = ElasticsearchBulkWriter::connect(&config.elasticsearch_config())?;

        let runner = PipelineRunner::new(registry, dispatcher);
        let flush_controller = FlushController::new(runner, sql_pool, search_client, position_store, config.flush_controller_config());

        let source = MySqlReplicationSource::new(config.mysql_source_config());

        info!(resume = ?resume_position, "pipeline wired, ready to run");

        Ok(Self {
            state: State::Init,
            task_manager: TaskManager::with_process_labels(ProcessLabels::new("tidewatch")),
            cancellation: CancellationToken::new(),
            source: Box::new(source),
            resume_position,
            flush_controller,
        })
    }

    /// A clone of the supervisor's cancellation token, for the process
    /// entry point to flip on `SIGINT`/`SIGTERM`.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Runs the pipeline until the cancellation token fires or a fatal error
    /// occurs, then drains: stops the Event Source, lets the consumer loop
    /// observe cancellation and discard remaining channel items, and closes
    /// the search client and SQL pools (done inside the flush controller's
    /// own shutdown path) before the SQL pools/search client's owning task
    /// manager is joined. Returns the terminal state.
    pub async fn run(mut self) -> State {
        self.state = State::Running;

        let (sender, receiver) = flume::bounded(CHANNEL_CAPACITY);
        let effect_handler = EffectHandler::with_channel("mysql".to_string(), sender);
        let resume_position = self.resume_position.take();
        let source_cancellation = self.cancellation.clone();
        let process_labels = self.task_manager.process_labels();

        let task_labels = TaskLabels {
            task_cat: "source".into(),
            task_id: "source/mysql".into(),
            task_source: "NA".into(),
        };
        let task_labels_clone = task_labels.clone();
        let task_manager_for_source = self.task_manager.clone();
        let mut source = self.source;

        let join_handle = tokio::task::spawn(async move {
            let engine_handler = EngineHandler::new(task_manager_for_source, Arc::new(Context::new()));

            if let Err(error) = source.init(engine_handler).await {
                error!(%error, task_id = %task_labels_clone.task_id, "replication source initialization failed");
                source_cancellation.cancel();
                return TaskManager::no_task_cleaner(process_labels, task_labels_clone);
            }

            if let Err(error) = source.run(resume_position, source_cancellation.clone(), effect_handler).await {
                error!(%error, task_id = %task_labels_clone.task_id, "replication source stopped with an error");
                source_cancellation.cancel();
            }

            if let Err(error) = source.stop().await {
                warn!(%error, task_id = %task_labels_clone.task_id, "replication source did not stop cleanly");
            }

            info!(task_id = %task_labels_clone.task_id, "replication source has stopped");
            TaskManager::no_task_cleaner(process_labels, task_labels_clone)
        });

        self.task_manager.register(join_handle, &task_labels);

        let consumer_cancellation = self.cancellation.clone();
        let consumer_result = self.flush_controller.run(receiver, consumer_cancellation).await;

        self.state = State::Draining;
        self.cancellation.cancel();
        self.task_manager.join().await;

        match consumer_result {
            Ok(()) => {
                self.state = State::Closed;
                info!("pipeline shut down cleanly");
            }
            Err(error) => {
                self.state = State::Failed;
                error!(%error, "pipeline failed");
            }
        }

        self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_state_exits_zero_every_other_state_exits_nonzero() {
        assert_eq!(State::Closed.exit_code(), 0);
        assert_eq!(State::Failed.exit_code(), 1);
        assert_eq!(State::Init.exit_code(), 1);
        assert_eq!(State::Running.exit_code(), 1);
        assert_eq!(State::Draining.exit_code(), 1);
    }
}
