//! An in-memory `SearchIndexClient` for tests and the `demos/` wiring
//! example: records every flushed operation instead of talking to a real
//! Elasticsearch cluster.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{BulkOp, Error, SearchIndexClient};

/// A `SearchIndexClient` that records flushed operations into a shared
/// buffer the test can inspect afterwards.
#[derive(Default)]
pub struct RecordingSearchIndexClient {
    pending: Vec<BulkOp>,
    flushed: Arc<Mutex<Vec<BulkOp>>>,
}

impl RecordingSearchIndexClient {
    /// Builds a client along with a handle to the flushed-operations buffer.
    pub fn new() -> (Self, Arc<Mutex<Vec<BulkOp>>>) {
        let flushed = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                pending: Vec::new(),
                flushed: flushed.clone(),
            },
            flushed,
        )
    }
}

#[async_trait]
impl SearchIndexClient for RecordingSearchIndexClient {
    fn add(&mut self, op: BulkOp) {
        self.pending.push(op);
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }

    async fn flush(&mut self) -> Result<(), Error> {
        self.flushed.lock().expect("flushed mutex poisoned").extend(self.pending.drain(..));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use row::IntermediateRow;

    #[tokio::test]
    async fn flush_moves_pending_into_the_shared_buffer() {
        let (mut client, flushed) = RecordingSearchIndexClient::new();

        client.add(BulkOp::Index {
            index: "orders_idx".into(),
            id: "42".into(),
            doc: IntermediateRow::new(),
        });
        assert_eq!(client.pending(), 1);

        client.flush().await.unwrap();
        assert_eq!(client.pending(), 0);
        assert_eq!(flushed.lock().unwrap().len(), 1);
    }
}
