//! An in-memory `ReplicationSource` for tests and the `demos/` wiring
//! example: replays a canned sequence of channel messages instead of
//! tailing a live MySQL server.

use row::{ChannelMessage, PositionMarker};
use tokio_util::sync::CancellationToken;

use crate::effect::EffectHandler;
use crate::{EngineHandler, Error, ReplicationSource};

/// A `ReplicationSource` that emits a fixed, caller-supplied sequence of
/// messages and then returns. Ignores `resume_from` entirely — it has no
/// notion of "already streamed past this point".
pub struct FakeReplicationSource {
    messages: Vec<ChannelMessage>,
}

impl FakeReplicationSource {
    /// Builds a fake source that will emit exactly `messages`, in order.
    pub fn new(messages: Vec<ChannelMessage>) -> Self {
        Self { messages }
    }
}

#[async_trait::async_trait]
impl ReplicationSource for FakeReplicationSource {
    async fn init(&mut self, _engine_handler: EngineHandler) -> Result<(), Error> {
        Ok(())
    }

    async fn run(
        &mut self,
        _resume_from: Option<PositionMarker>,
        cancellation: CancellationToken,
        effect_handler: EffectHandler,
    ) -> Result<(), Error> {
        for message in self.messages.drain(..) {
            if cancellation.is_cancelled() {
                return Ok(());
            }
            effect_handler.emit(message).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use context::Context;
    use row::{Action, RowEvent};
    use serde_json::json;
    use std::sync::Arc;
    use task::TaskManager;

    #[tokio::test]
    async fn fake_source_emits_every_message_in_order() {
        let (sender, receiver) = flume::bounded(8);
        let effect_handler = EffectHandler::with_channel("fake".into(), sender);

        let mut source = FakeReplicationSource::new(vec![ChannelMessage::Row(RowEvent {
            schema: "shop".into(),
            table: "orders".into(),
            action: Action::Insert,
            row: json!({"id": 1}).as_object().unwrap().clone(),
        })]);

        source
            .init(EngineHandler::new(TaskManager::new(), Arc::new(Context::new())))
            .await
            .unwrap();
        source
            .run(None, CancellationToken::new(), effect_handler)
            .await
            .unwrap();

        let received = receiver.recv_async().await.unwrap();
        assert!(matches!(received, ChannelMessage::Row(_)));
    }
}
