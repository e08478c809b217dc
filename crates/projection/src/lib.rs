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

//! Projection configuration: the file that maps a source row change to the
//! ordered chain of enrichment stages that produce its destination
//! document(s), loaded once at startup and never mutated afterwards.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// All the errors this crate can raise.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// The projection file could not be read.
    #[error("failed to read projection config at {path}: {source}")]
    Io {
        /// Path of the file being read.
        path: String,
        /// Underlying io error.
        #[source]
        source: std::io::Error,
    },
    /// The projection file was not valid JSON, or did not match the expected shape.
    #[error("failed to parse projection config at {path}: {source}")]
    Decode {
        /// Path of the file being read.
        path: String,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },
}

/// A single named stage invocation inside a projection's pipeline, together
/// with its static parameters in declaration order.
#[derive(Debug, Clone)]
pub struct StageSpec {
    /// The registered stage name (looked up in the stage dispatcher).
    pub name: String,
    /// Parameters in the order they were declared in the source JSON object.
    pub params: Vec<(String, Value)>,
}

/// Destination index for the rows this configuration produces.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Destination {
    /// Name of the destination search index.
    pub index: String,
}

/// One entry of the projection configuration file: which source changes it
/// applies to, the stage pipeline it runs them through, and where the result
/// is written.
#[derive(Debug, Clone)]
pub struct ProjectionConfig {
    /// Source schema this configuration applies to.
    pub schema: String,
    /// Source tables this configuration applies to.
    pub tables: Vec<String>,
    /// Row-change actions this configuration applies to.
    pub actions: Vec<String>,
    /// Ordered stage chain.
    pub pipeline: Vec<StageSpec>,
    /// Destination index.
    pub dest: Destination,
}

/// The on-disk shape of one projection entry, kept close to the wire format
/// described in the external interfaces (an ordered `pipeline` object) and
/// converted into `ProjectionConfig` once loaded.
#[derive(Debug, Deserialize, Serialize)]
struct RawProjectionConfig {
    schema: String,
    tables: Vec<String>,
    actions: Vec<String>,
    pipeline: serde_json::Map<String, Value>,
    dest: Destination,
}

impl From<RawProjectionConfig> for ProjectionConfig {
    fn from(raw: RawProjectionConfig) -> Self {
        let pipeline = raw
            .pipeline
            .into_iter()
            .map(|(name, params)| StageSpec {
                name,
                params: match params {
                    Value::Object(map) => map.into_iter().collect(),
                    _ => Vec::new(),
                },
            })
            .collect();

        ProjectionConfig {
            schema: raw.schema,
            tables: raw.tables,
            actions: raw.actions,
            pipeline,
            dest: raw.dest,
        }
    }
}

/// Immutable, read-only-after-startup map from `schema_table_action` to the
/// ordered list of projection configurations that apply to it. Order among
/// configurations sharing a key follows file order and is significant: their
/// outputs are concatenated.
#[derive(Debug, Default)]
pub struct ProjectionRegistry {
    by_key: HashMap<String, Vec<ProjectionConfig>>,
}

impl ProjectionRegistry {
    /// Loads a projection registry from a JSON array of projection configs on disk.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path_str = path.as_ref().display().to_string();
        let bytes = fs::read(&path).map_err(|source| Error::Io {
            path: path_str.clone(),
            source,
        })?;

        let raw_configs: Vec<RawProjectionConfig> =
            serde_json::from_slice(&bytes).map_err(|source| Error::Decode {
                path: path_str.clone(),
                source,
            })?;

        let mut registry = ProjectionRegistry::default();
        for raw in raw_configs {
            registry.insert(raw.into());
        }

        tracing::info!(path = %path_str, schemas = registry.by_key.len(), "loaded projection registry");

        Ok(registry)
    }

    /// Builds a registry directly from a list of configurations — used by
    /// tests and the in-memory demo wiring.
    pub fn from_configs(configs: Vec<ProjectionConfig>) -> Self {
        let mut registry = ProjectionRegistry::default();
        for config in configs {
            registry.insert(config);
        }
        registry
    }

    fn insert(&mut self, config: ProjectionConfig) {
        for table in &config.tables {
            for action in &config.actions {
                let key = format!("{}_{}_{}", config.schema, table, action);
                self.by_key.entry(key).or_default().push(config.clone());
            }
        }
    }

    /// Looks up the configurations (in file order) that apply to a given
    /// `schema_table_action` key. An empty slice is a normal, expected
    /// outcome (no projection registered for this change), not an error.
    pub fn lookup(&self, key: &str) -> &[ProjectionConfig] {
        self.by_key.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All schema names referenced by any loaded configuration — used to
    /// build the per-schema SQL connection pool at startup.
    pub fn schemas(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        for configs in self.by_key.values() {
            for config in configs {
                let _ = seen.insert(config.schema.clone());
            }
        }
        seen.into_iter().collect()
    }

    /// Every stage name referenced by any loaded configuration's pipeline —
    /// used to validate the stage dispatcher has every stage registered
    /// before streaming starts.
    pub fn stage_names(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        for configs in self.by_key.values() {
            for config in configs {
                for stage in &config.pipeline {
                    let _ = seen.insert(stage.name.clone());
                }
            }
        }
        seen.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_config() -> ProjectionConfig {
        RawProjectionConfig {
            schema: "shop".into(),
            tables: vec!["orders".into()],
            actions: vec!["insert".into(), "update".into()],
            pipeline: json!({"noop": {}}).as_object().unwrap().clone(),
            dest: Destination {
                index: "orders_idx".into(),
            },
        }
        .into()
    }

    #[test]
    fn registry_indexes_by_schema_table_action() {
        let registry = ProjectionRegistry::from_configs(vec![sample_config()]);

        assert_eq!(registry.lookup("shop_orders_insert").len(), 1);
        assert_eq!(registry.lookup("shop_orders_update").len(), 1);
        assert!(registry.lookup("shop_orders_delete").is_empty());
        assert!(registry.lookup("audit_log_insert").is_empty());
    }

    #[test]
    fn registry_preserves_file_order_for_shared_keys() {
        let mut first = sample_config();
        first.dest.index = "first_idx".into();
        let mut second = sample_config();
        second.dest.index = "second_idx".into();

        let registry = ProjectionRegistry::from_configs(vec![first, second]);
        let matches = registry.lookup("shop_orders_insert");
        assert_eq!(matches.len(), 2);
        assert_eq!(matches[0].dest.index, "first_idx");
        assert_eq!(matches[1].dest.index, "second_idx");
    }

    #[test]
    fn schemas_collects_unique_schema_names() {
        let registry = ProjectionRegistry::from_configs(vec![sample_config()]);
        assert_eq!(registry.schemas(), vec!["shop".to_string()]);
    }

    #[test]
    fn stage_names_collects_every_referenced_stage() {
        let registry = ProjectionRegistry::from_configs(vec![sample_config()]);
        assert_eq!(registry.stage_names(), vec!["noop".to_string()]);
    }

    #[test]
    fn stage_params_preserve_declaration_order() {
        let raw: RawProjectionConfig = serde_json::from_value(json!({
            "schema": "shop",
            "tables": ["orders"],
            "actions": ["insert"],
            "pipeline": {
                "set_field": {"b": 1, "a": 2}
            },
            "dest": {"index": "orders_idx"}
        }))
        .unwrap();
        let config: ProjectionConfig = raw.into();
        let names: Vec<&str> = config.pipeline[0].params.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
    }
}
