//! Wires the Pipeline Runner and Flush Controller against in-memory fakes —
//! a canned `FakeReplicationSource` and a `RecordingSearchIndexClient` — so
//! the streaming core can be exercised end to end without a live MySQL
//! server or Elasticsearch cluster.

use std::time::Duration;

use pipeline::{FlushController, FlushControllerConfig, PipelineRunner};
use position::MemoryPositionStore;
use projection::{Destination, ProjectionConfig, ProjectionRegistry, StageSpec};
use row::{Action, ChannelMessage, PositionMarker, RowEvent};
use search::testing::RecordingSearchIndexClient;
use serde_json::json;
use source::testing::FakeReplicationSource;
use source::ReplicationSource;
use sql::SqlPool;
use stage::StageDispatcher;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt().with_max_level(tracing::Level::INFO).init();

    let registry = ProjectionRegistry::from_configs(vec![ProjectionConfig {
        schema: "shop".into(),
        tables: vec!["orders".into()],
        actions: vec!["insert".into(), "update".into()],
        pipeline: vec![StageSpec {
            name: "noop".into(),
            params: Vec::new(),
        }],
        dest: Destination {
            index: "orders_idx".into(),
        },
    }]);

    let runner = PipelineRunner::new(registry, StageDispatcher::with_builtins());
    let (writer, flushed) = RecordingSearchIndexClient::new();
    let position_store = MemoryPositionStore::default();

    let flush_controller = FlushController::new(
        runner,
        SqlPool::empty(),
        writer,
        position_store,
        FlushControllerConfig {
            flush_duration: Duration::from_secs(3600),
            bulk_size: 1_000,
            checkpoint_interval: Duration::from_secs(3),
        },
    );

    let mut source = FakeReplicationSource::new(vec![
        ChannelMessage::Row(RowEvent {
            schema: "shop".into(),
            table: "orders".into(),
            action: Action::Insert,
            row: json!({"id": 42, "status": "new"}).as_object().unwrap().clone(),
        }),
        ChannelMessage::Row(RowEvent {
            schema: "shop".into(),
            table: "orders".into(),
            action: Action::Update,
            row: json!({"id": 42, "status": "paid"}).as_object().unwrap().clone(),
        }),
        ChannelMessage::Position(PositionMarker {
            log_name: "bin.000002".into(),
            log_offset: 4,
            force: true,
        }),
    ]);

    let (sender, receiver) = flume::bounded(64);
    let effect_handler = source::effect::EffectHandler::with_channel("fake".into(), sender);
    let cancellation = CancellationToken::new();

    let engine_handler = source::EngineHandler::new(task::TaskManager::new(), std::sync::Arc::new(context::Context::new()));
    source.init(engine_handler).await.expect("fake source init never fails");

    let producer = tokio::spawn(async move {
        source.run(None, cancellation, effect_handler).await.expect("fake source never fails");
    });

    flush_controller
        .run(receiver, CancellationToken::new())
        .await
        .expect("flush controller never fails against fakes");

    producer.await.expect("producer task panicked");

    for op in flushed.lock().unwrap().iter() {
        println!("{op:?}");
    }
}
