//! `ElasticsearchBulkWriter`: a `SearchIndexClient` backed by the official
//! `elasticsearch` client crate's bulk API.

use std::collections::HashMap;

use async_trait::async_trait;
use elasticsearch::http::transport::Transport;
use elasticsearch::{BulkOperation, BulkParts, Elasticsearch};
use url::Url;

use crate::{BulkOp, Error, SearchIndexClient};

/// Connection settings for the destination cluster.
#[derive(Debug, Clone)]
pub struct ElasticsearchConfig {
    /// Cluster node URLs. The transport round-robins across these.
    pub nodes: Vec<String>,
}

/// A `SearchIndexClient` that buffers operations and submits them to a real
/// Elasticsearch cluster's `_bulk` endpoint, requesting a refresh on every
/// operation (an explicit durability/visibility tradeoff, not a default).
pub struct ElasticsearchBulkWriter {
    client: Elasticsearch,
    pending: Vec<BulkOp>,
}

impl ElasticsearchBulkWriter {
    /// Builds a client against the first configured node. (A production
    /// multi-node transport would instead build a `TransportBuilder` with a
    /// connection pool and a `CloudId`/static node list; a single node is
    /// the smallest thing that satisfies this crate's contract.)
    pub fn connect(config: &ElasticsearchConfig) -> Result<Self, Error> {
        let node = config
            .nodes
            .first()
            .ok_or_else(|| Error::InvalidConfig("es.nodes must not be empty".to_string()))?;

        let url = Url::parse(node).map_err(|e| Error::InvalidConfig(format!("invalid es node url {node}: {e}")))?;
        let transport = Transport::single_node(url.as_str())
            .map_err(|e| Error::InvalidConfig(format!("failed to build es transport: {e}")))?;

        Ok(Self {
            client: Elasticsearch::new(transport),
            pending: Vec::new(),
        })
    }
}

#[async_trait]
impl SearchIndexClient for ElasticsearchBulkWriter {
    fn add(&mut self, op: BulkOp) {
        self.pending.push(op);
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }

    async fn flush(&mut self) -> Result<(), Error> {
        if self.pending.is_empty() {
            return Ok(());
        }

        let body: Vec<BulkOperation<serde_json::Value>> = self
            .pending
            .iter()
            .map(|op| match op {
                BulkOp::Index { index, id, doc } => BulkOperation::index(serde_json::Value::Object(doc.clone()))
                    .id(id)
                    .index(index)
                    .into(),
                BulkOp::Update { index, id, doc } => BulkOperation::update(serde_json::Value::Object(doc.clone()))
                    .id(id)
                    .index(index)
                    .doc_as_upsert(true)
                    .into(),
                BulkOp::Delete { index, id } => BulkOperation::<serde_json::Value>::delete(id).index(index).into(),
            })
            .collect();

        // `BulkParts::None` plus a per-operation `.index(...)` override lets
        // operations for different destination indices share one flush.
        let response = self
            .client
            .bulk(BulkParts::None)
            .body(body)
            .refresh(elasticsearch::params::Refresh::True)
            .send()
            .await
            .map_err(|e| Error::Flush {
                reason: e.to_string(),
                item_failures: HashMap::new(),
            })?;

        let status = response.status_code();
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Flush {
                reason: format!("failed to parse bulk response: {e}"),
                item_failures: HashMap::new(),
            })?;

        if !status.is_success() || body.get("errors").and_then(serde_json::Value::as_bool).unwrap_or(false) {
            let item_failures = collect_item_failures(&body);
            return Err(Error::Flush {
                reason: format!("bulk request returned status {status}"),
                item_failures,
            });
        }

        tracing::debug!(count = self.pending.len(), "bulk flush succeeded");
        self.pending.clear();

        Ok(())
    }
}

fn collect_item_failures(body: &serde_json::Value) -> HashMap<String, String> {
    let mut failures = HashMap::new();

    if let Some(items) = body.get("items").and_then(serde_json::Value::as_array) {
        for item in items {
            let Some(action) = item.as_object().and_then(|o| o.values().next()) else {
                continue;
            };
            let Some(error) = action.get("error") else {
                continue;
            };
            let id = action.get("_id").and_then(serde_json::Value::as_str).unwrap_or("?").to_string();
            let _ = failures.insert(id, error.to_string());
        }
    }

    failures
}
