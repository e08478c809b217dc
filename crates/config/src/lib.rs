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

//! Program configuration: the YAML document that names the source MySQL
//! server, the destination Elasticsearch cluster, the schemas/tables the
//! pipeline cares about, and the handful of tunables that drive the flush
//! controller's decision table. Loaded once at startup; never hot-reloaded.
//!
//! The projection configuration (the per-table stage pipelines) is a
//! separate JSON document, loaded directly by the `projection` crate from
//! its own CLI flag — it is not nested inside this one.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use validator::Validate;

/// All the errors this crate can raise. Config errors are always fatal at
/// startup; there is no partial/degraded load.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The config file could not be read.
    #[error("could not read config file {file}: {source}")]
    Io {
        /// Path of the file being read.
        file: String,
        /// Underlying io error.
        #[source]
        source: std::io::Error,
    },
    /// The config file was not valid YAML, or did not match the expected shape.
    #[error("could not parse config file {file}: {source}")]
    Decode {
        /// Path of the file being read.
        file: String,
        /// Underlying decode error.
        #[source]
        source: serde_yaml::Error,
    },
    /// The config file parsed but failed validation (e.g. an empty `nodes`
    /// list, a `bulk_size` of zero).
    #[error("invalid config file {file}: {message}")]
    Invalid {
        /// Path of the file being read.
        file: String,
        /// Human readable explanation, naming the offending field(s).
        message: String,
    },
}

/// Identity and connection settings for the source MySQL server.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct MysqlConfig {
    /// `host:port` of the source server.
    #[validate(length(min = 1))]
    pub addr: String,
    /// Replication user.
    #[validate(length(min = 1))]
    pub user: String,
    /// Replication user's password.
    pub pwd: String,
    /// Connection charset.
    #[serde(default = "default_charset")]
    pub charset: String,
    /// Must be unique across the source replication topology.
    #[validate(range(min = 1))]
    pub server_id: u32,
}

fn default_charset() -> String {
    "utf8mb4".to_string()
}

/// Destination cluster settings and the flush controller's size/time tunables.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct EsConfig {
    /// Cluster node URLs.
    #[validate(length(min = 1))]
    pub nodes: Vec<String>,
    /// Drives the flush controller's periodic tick.
    #[serde(default = "default_flush_duration_ms")]
    #[validate(range(min = 1))]
    pub flush_duration_ms: u64,
    /// Pending-operation threshold that forces a flush after piping an event.
    #[serde(default = "default_bulk_size")]
    #[validate(range(min = 1))]
    pub bulk_size: usize,
}

fn default_flush_duration_ms() -> u64 {
    1_000
}

fn default_bulk_size() -> usize {
    200
}

/// One schema's worth of tables the pipeline cares about; drives both the
/// Table Filter and the initial snapshot's table list.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SourceConfig {
    /// Source schema (database) name.
    #[validate(length(min = 1))]
    pub schema: String,
    /// Tables within `schema` to filter, snapshot, and stream.
    #[validate(length(min = 1))]
    pub tables: Vec<String>,
}

/// The as-loaded, pre-validation shape of the program config file.
#[derive(Debug, Clone, Deserialize)]
struct RawConfig {
    mysql: MysqlConfig,
    es: EsConfig,
    #[serde(default)]
    sources: Vec<SourceConfig>,
    data_dir: PathBuf,
    #[serde(default = "default_checkpoint_interval_secs")]
    checkpoint_interval_secs: u64,
    #[serde(default)]
    io_timeout_ms: Option<u64>,
}

fn default_checkpoint_interval_secs() -> u64 {
    3
}

/// The validated program configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Source MySQL connection identity.
    pub mysql: MysqlConfig,
    /// Destination Elasticsearch cluster and flush tunables.
    pub es: EsConfig,
    /// Schemas/tables the pipeline is configured to care about.
    pub sources: Vec<SourceConfig>,
    /// Directory holding the Position Store file.
    pub data_dir: PathBuf,
    /// Minimum time between non-forced checkpoints (the "≥3s" debounce window).
    pub checkpoint_interval_secs: u64,
    /// Deadline for bulk flush / SQL enrichment queries; `None` is unbounded.
    pub io_timeout_ms: Option<u64>,
}

impl Config {
    /// Loads and validates the program config from a YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let file = path.as_ref().display().to_string();

        let contents = fs::read_to_string(&path).map_err(|source| Error::Io { file: file.clone(), source })?;
        let raw: RawConfig = serde_yaml::from_str(&contents).map_err(|source| Error::Decode { file: file.clone(), source })?;

        let config = Config {
            mysql: raw.mysql,
            es: raw.es,
            sources: raw.sources,
            data_dir: raw.data_dir,
            checkpoint_interval_secs: raw.checkpoint_interval_secs,
            io_timeout_ms: raw.io_timeout_ms,
        };

        config.validate(&file)?;

        tracing::info!(file = %file, sources = config.sources.len(), "loaded program config");

        Ok(config)
    }

    fn validate(&self, file: &str) -> Result<(), Error> {
        let mut problems = Vec::new();

        if let Err(errors) = self.mysql.validate() {
            problems.push(format!("mysql: {errors}"));
        }
        if let Err(errors) = self.es.validate() {
            problems.push(format!("es: {errors}"));
        }
        if self.sources.is_empty() {
            problems.push("sources: must not be empty".to_string());
        }
        for source in &self.sources {
            if let Err(errors) = source.validate() {
                problems.push(format!("sources[{}]: {errors}", source.schema));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::Invalid {
                file: file.to_string(),
                message: problems.join("; "),
            })
        }
    }

    /// The connection settings shared by every per-schema SQL pool.
    pub fn mysql_connection_settings(&self) -> sql::MysqlConnectionSettings {
        sql::MysqlConnectionSettings {
            addr: self.mysql.addr.clone(),
            user: self.mysql.user.clone(),
            pwd: self.mysql.pwd.clone(),
        }
    }

    /// Settings for the concrete `MySqlReplicationSource` adapter.
    pub fn mysql_source_config(&self) -> source::mysql::MySqlSourceConfig {
        source::mysql::MySqlSourceConfig {
            addr: self.mysql.addr.clone(),
            user: self.mysql.user.clone(),
            pwd: self.mysql.pwd.clone(),
            charset: self.mysql.charset.clone(),
            server_id: self.mysql.server_id,
            sources: self.sources.iter().map(|s| (s.schema.clone(), s.tables.clone())).collect(),
        }
    }

    /// Settings for the concrete `ElasticsearchBulkWriter` adapter.
    pub fn elasticsearch_config(&self) -> search::elastic::ElasticsearchConfig {
        search::elastic::ElasticsearchConfig {
            nodes: self.es.nodes.clone(),
        }
    }

    /// Tunables for the flush controller's three-flag decision table.
    pub fn flush_controller_config(&self) -> pipeline::FlushControllerConfig {
        pipeline::FlushControllerConfig {
            flush_duration: Duration::from_millis(self.es.flush_duration_ms),
            bulk_size: self.es.bulk_size,
            checkpoint_interval: Duration::from_secs(self.checkpoint_interval_secs),
        }
    }

    /// The deadline bulk flush and SQL enrichment queries should inherit, if configured.
    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_ms.map(Duration::from_millis)
    }

    /// Every `(schema, tables)` pair, used to build the Table Filter and the snapshot list.
    pub fn source_tables(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.sources.iter().map(|s| (s.schema.as_str(), s.tables.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("config.yaml");
        fs::write(&path, body).unwrap();
        path
    }

    const VALID: &str = r#"
mysql:
  addr: "127.0.0.1:3306"
  user: "repl"
  pwd: "secret"
  server_id: 1001
es:
  nodes:
    - "http://127.0.0.1:9200"
  flush_duration_ms: 500
  bulk_size: 100
sources:
  - schema: "shop"
    tables: ["orders"]
data_dir: "/var/lib/tidewatch"
"#;

    #[test]
    fn loads_a_valid_config_and_applies_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_config(dir.path(), VALID);

        let config = Config::load(&path).unwrap();
        assert_eq!(config.mysql.addr, "127.0.0.1:3306");
        assert_eq!(config.mysql.charset, "utf8mb4");
        assert_eq!(config.checkpoint_interval_secs, 3);
        assert_eq!(config.io_timeout(), None);
    }

    #[test]
    fn rejects_empty_sources() {
        let dir = tempfile::tempdir().unwrap();
        let body = VALID.replace(
            "sources:\n  - schema: \"shop\"\n    tables: [\"orders\"]",
            "sources: []",
        );
        let path = write_config(dir.path(), &body);

        assert!(matches!(Config::load(&path), Err(Error::Invalid { .. })));
    }

    #[test]
    fn rejects_zero_bulk_size() {
        let dir = tempfile::tempdir().unwrap();
        let body = VALID.replace("bulk_size: 100", "bulk_size: 0");
        let path = write_config(dir.path(), &body);

        assert!(matches!(Config::load(&path), Err(Error::Invalid { .. })));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        assert!(matches!(Config::load("/nonexistent/path.yaml"), Err(Error::Io { .. })));
    }
}
