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

//! A per-schema connection pool against the replication source database,
//! used read-only by enrichment stages to join a changed row against other
//! tables in the same schema it came from.

use std::collections::HashMap;

use mysql_async::prelude::Queryable;
use mysql_async::{Opts, OptsBuilder, Pool};

/// All the errors this crate can raise.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// A pool could not be created or a connection could not be checked out.
    #[error("mysql pool error for schema {schema}: {source}")]
    Pool {
        /// The schema the pool is scoped to.
        schema: String,
        /// The underlying driver error.
        #[source]
        source: mysql_async::Error,
    },
    /// The liveness probe (`SELECT 1`) failed against a schema's pool.
    #[error("liveness probe failed for schema {schema}: {source}")]
    Probe {
        /// The schema the pool is scoped to.
        schema: String,
        /// The underlying driver error.
        #[source]
        source: mysql_async::Error,
    },
}

/// Connection settings shared by every per-schema pool; only the schema
/// (database) name varies between pools.
#[derive(Debug, Clone)]
pub struct MysqlConnectionSettings {
    /// Host:port of the source MySQL server.
    pub addr: String,
    /// Username.
    pub user: String,
    /// Password.
    pub pwd: String,
}

/// A mapping from schema name to a live connection pool against that schema,
/// built once at startup from every schema referenced by any loaded
/// projection configuration.
pub struct SqlPool {
    pools: HashMap<String, Pool>,
}

impl SqlPool {
    /// A pool with no registered schemas. Used by tests and by projections
    /// that need no SQL enrichment at all.
    pub fn empty() -> Self {
        Self { pools: HashMap::new() }
    }

    /// Builds one pool per schema in `schemas`, verifying each with a
    /// `SELECT 1` liveness probe before returning.
    pub async fn connect(settings: &MysqlConnectionSettings, schemas: &[String]) -> Result<Self, Error> {
        let mut pools = HashMap::with_capacity(schemas.len());

        for schema in schemas {
            let opts: Opts = OptsBuilder::default()
                .ip_or_hostname(host_of(&settings.addr))
                .tcp_port(port_of(&settings.addr))
                .user(Some(settings.user.clone()))
                .pass(Some(settings.pwd.clone()))
                .db_name(Some(schema.clone()))
                .into();

            let pool = Pool::new(opts);

            let mut conn = pool.get_conn().await.map_err(|source| Error::Pool {
                schema: schema.clone(),
                source,
            })?;
            let _: u8 = conn.query_first("SELECT 1").await.map_err(|source| Error::Probe {
                schema: schema.clone(),
                source,
            })?.unwrap_or(0);
            drop(conn);

            tracing::info!(schema = %schema, addr = %settings.addr, "connected to mysql schema pool");
            let _ = pools.insert(schema.clone(), pool);
        }

        Ok(Self { pools })
    }

    /// Returns the pool for `schema`, if one was built at startup.
    pub fn get(&self, schema: &str) -> Option<&Pool> {
        self.pools.get(schema)
    }

    /// Closes every pool. Called during the drain/shutdown path after the
    /// search client and position store have stopped being used.
    pub async fn close(self) -> Result<(), Error> {
        for (schema, pool) in self.pools {
            pool.disconnect().await.map_err(|source| Error::Pool { schema, source })?;
        }
        Ok(())
    }
}

fn host_of(addr: &str) -> String {
    addr.rsplit_once(':').map(|(h, _)| h.to_string()).unwrap_or_else(|| addr.to_string())
}

fn port_of(addr: &str) -> u16 {
    addr.rsplit_once(':')
        .and_then(|(_, p)| p.parse().ok())
        .unwrap_or(3306)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_and_port_split_standard_addr() {
        assert_eq!(host_of("127.0.0.1:3306"), "127.0.0.1");
        assert_eq!(port_of("127.0.0.1:3306"), 3306);
    }

    #[test]
    fn port_defaults_when_missing() {
        assert_eq!(port_of("127.0.0.1"), 3306);
    }
}
