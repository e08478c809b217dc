//! `EffectHandler` for replication sources.

use row::ChannelMessage;

use crate::Error;

/// Handler used by a `ReplicationSource` to emit events onto the pipeline's
/// single ordered channel.
///
/// The struct makes the inner enum opaque so the channel implementation
/// (currently `flume`) is not part of the public contract; this mirrors the
/// private-enum-behind-a-public-struct pattern used throughout this crate's
/// ancestry.
#[derive(Clone)]
pub struct EffectHandler {
    inner: PrivateEffectHandler,
}

impl EffectHandler {
    /// Creates a new `EffectHandler` backed by a bounded channel sender.
    pub fn with_channel(source_name: String, sender: flume::Sender<ChannelMessage>) -> Self {
        EffectHandler {
            inner: PrivateEffectHandler::Channel { source_name, sender },
        }
    }

    /// Emits one channel message, blocking (asynchronously) if the channel
    /// is currently full. This is the system's only backpressure point: a
    /// full channel slows the replication source down rather than dropping
    /// events.
    pub async fn emit(&self, message: ChannelMessage) -> Result<(), Error> {
        let PrivateEffectHandler::Channel { source_name, sender } = &self.inner;
        sender
            .send_async(message)
            .await
            .map_err(|e| Error::Emit(format!("source {source_name}: {e}")))
    }
}

#[derive(Clone)]
enum PrivateEffectHandler {
    Channel {
        source_name: String,
        sender: flume::Sender<ChannelMessage>,
    },
}
