//! The Flush Controller: the single consumer loop that owns the Bulk Writer
//! and Position Store, and decides when each actually gets flushed/saved.
//!
//! Structured as a `tokio::select!` over the channel receiver, a periodic
//! `tokio::time::interval`, and a `CancellationToken` — the same
//! timer-vs-channel race idiom the engine crate's sequential processor chain
//! uses, specialized here to the three-flag decision table this crate is
//! named for instead of a generic signal enum.

use std::time::Duration;

use position::PositionStore;
use row::ChannelMessage;
use search::SearchIndexClient;
use sql::SqlPool;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::{Error, PipelineRunner};

/// Tunables that drive the flush controller's three-flag decision table.
#[derive(Debug, Clone, Copy)]
pub struct FlushControllerConfig {
    /// Periodic tick interval; a tick always sets `flush`.
    pub flush_duration: Duration,
    /// Pending-operation threshold that sets `flush` after piping an event.
    pub bulk_size: usize,
    /// Minimum time between non-forced checkpoints.
    pub checkpoint_interval: Duration,
}

/// Owns the Bulk Writer and Position Store and drives the consumer loop
/// described in the flush controller's trigger table. There is exactly one
/// of these per running pipeline; it is not `Clone` or shared.
pub struct FlushController<W, P> {
    runner: PipelineRunner,
    sql_pool: SqlPool,
    writer: W,
    position_store: P,
    config: FlushControllerConfig,
}

impl<W, P> FlushController<W, P>
where
    W: SearchIndexClient,
    P: PositionStore,
{
    /// Builds a flush controller around its collaborators.
    pub fn new(runner: PipelineRunner, sql_pool: SqlPool, writer: W, position_store: P, config: FlushControllerConfig) -> Self {
        Self {
            runner,
            sql_pool,
            writer,
            position_store,
            config,
        }
    }

    /// Runs the consumer loop until `cancellation` fires or the channel is
    /// closed. A row event is run through the pipeline immediately (piping);
    /// a position marker sets `flush`/`save_pos` per the trigger table; the
    /// periodic tick always sets `flush`; the bulk-size threshold is checked
    /// after every iteration. A failure at any step is fatal: the error is
    /// returned and the caller is expected to cancel the rest of the
    /// supervisor's tasks.
    ///
    /// On the way out (clean shutdown or error alike) the bulk writer and the
    /// sql pools are stopped, in that order, matching the draining order
    /// named in the component design (search client, then sql pools; the
    /// position store has no handle to close).
    pub async fn run(mut self, receiver: flume::Receiver<ChannelMessage>, cancellation: CancellationToken) -> Result<(), Error> {
        let result = self.drive(&receiver, &cancellation).await;

        if let Err(error) = self.writer.stop().await {
            tracing::warn!(%error, "bulk writer did not stop cleanly");
        }
        let sql_pool = std::mem::replace(&mut self.sql_pool, SqlPool::empty());
        if let Err(error) = sql_pool.close().await {
            tracing::warn!(%error, "sql pool did not close cleanly");
        }

        result
    }

    async fn drive(&mut self, receiver: &flume::Receiver<ChannelMessage>, cancellation: &CancellationToken) -> Result<(), Error> {
        let mut ticker = tokio::time::interval(self.config.flush_duration);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut last_checkpoint = Instant::now();

        loop {
            let mut flush = false;
            let mut save_pos = false;
            let mut to_save = None;

            tokio::select! {
                biased;

                () = cancellation.cancelled() => {
                    tracing::info!("flush controller cancelled, draining");
                    return Ok(());
                }

                message = receiver.recv_async() => {
                    match message {
                        Ok(ChannelMessage::Row(event)) => {
                            self.runner.run_event(&event, &self.sql_pool, &mut self.writer).await?;
                        }
                        Ok(ChannelMessage::Position(marker)) => {
                            let forced = marker.force;
                            let debounced = !forced && last_checkpoint.elapsed() >= self.config.checkpoint_interval;
                            if forced || debounced {
                                flush = true;
                                save_pos = true;
                            }
                            to_save = Some(marker);
                        }
                        Err(_) => {
                            tracing::info!("replication channel closed, flush controller exiting");
                            return Ok(());
                        }
                    }
                }

                _ = ticker.tick() => {
                    flush = true;
                }
            }

            if !flush && self.writer.pending() >= self.config.bulk_size {
                flush = true;
            }

            if flush && self.writer.pending() > 0 {
                self.writer.flush().await?;
                tracing::debug!(pending = 0, "bulk writer flushed");
            }

            if save_pos {
                if let Some(marker) = &to_save {
                    self.position_store.save(marker)?;
                    last_checkpoint = Instant::now();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use position::MemoryPositionStore;
    use projection::{Destination, ProjectionConfig, ProjectionRegistry, StageSpec};
    use row::{Action, PositionMarker, RowEvent};
    use search::testing::RecordingSearchIndexClient;
    use serde_json::json;
    use stage::StageDispatcher;

    fn controller_with_shared_position() -> (
        FlushController<RecordingSearchIndexClient, std::sync::Arc<MemoryPositionStore>>,
        std::sync::Arc<std::sync::Mutex<Vec<search::BulkOp>>>,
        std::sync::Arc<MemoryPositionStore>,
    ) {
        let registry = ProjectionRegistry::from_configs(vec![ProjectionConfig {
            schema: "shop".into(),
            tables: vec!["orders".into()],
            actions: vec!["insert".into()],
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
        let position_store = std::sync::Arc::new(MemoryPositionStore::default());

        let controller = FlushController::new(
            runner,
            SqlPool::empty(),
            writer,
            position_store.clone(),
            FlushControllerConfig {
                flush_duration: Duration::from_secs(3600),
                bulk_size: 1_000,
                checkpoint_interval: Duration::from_secs(3),
            },
        );
        (controller, flushed, position_store)
    }

    #[tokio::test]
    async fn forced_checkpoint_flushes_and_saves_position() {
        let (controller, flushed, position_store) = controller_with_shared_position();
        let (sender, receiver) = flume::bounded(8);
        let cancellation = CancellationToken::new();

        sender
            .send_async(ChannelMessage::Row(RowEvent {
                schema: "shop".into(),
                table: "orders".into(),
                action: Action::Insert,
                row: json!({"id": 1, "status": "new"}).as_object().unwrap().clone(),
            }))
            .await
            .unwrap();
        sender
            .send_async(ChannelMessage::Position(PositionMarker {
                log_name: "bin.000002".into(),
                log_offset: 4,
                force: true,
            }))
            .await
            .unwrap();
        drop(sender);

        assert!(position_store.load().unwrap().is_none());

        controller.run(receiver, cancellation).await.unwrap();

        assert_eq!(flushed.lock().unwrap().len(), 1);
        let saved = position_store.load().unwrap().expect("position should have been saved");
        assert_eq!(saved.log_name, "bin.000002");
        assert_eq!(saved.log_offset, 4);
    }

    #[tokio::test]
    async fn zero_pending_forced_checkpoint_still_saves_position() {
        let (controller, flushed, position_store) = controller_with_shared_position();

        let (sender, receiver) = flume::bounded(8);
        sender
            .send_async(ChannelMessage::Position(PositionMarker {
                log_name: "bin.000001".into(),
                log_offset: 10,
                force: true,
            }))
            .await
            .unwrap();
        drop(sender);

        controller.run(receiver, CancellationToken::new()).await.unwrap();

        assert!(flushed.lock().unwrap().is_empty());
        assert!(position_store.load().unwrap().is_some());
    }
}
