//! `MySqlReplicationSource`: a `ReplicationSource` that tails a real MySQL
//! server's row-based binary log.
//!
//! The control connection is used for the startup `binlog_row_image` check,
//! the initial table snapshot, and resolving column names per table (binlog
//! row events carry column values but not names). Streaming itself is driven
//! by registering as a replica and reading the raw binlog event stream, the
//! same two-step handshake a production binlog connector performs
//! (`register_as_replica` + `request_binlog`).

use std::collections::HashMap;

use mysql_async::prelude::Queryable;
use mysql_async::{Conn, Opts, OptsBuilder, Value as MysqlValue};
use mysql_common::binlog::consts::{BinlogVersion, EventType};
use mysql_common::binlog::events::{Event, TableMapEvent};
use mysql_common::binlog::EventStreamReader;
use mysql_common::packets::{ComBinlogDump, ComRegisterSlave};
use row::{Action, ChannelMessage, PositionMarker, RowEvent};
use serde_json::Value as JsonValue;
use tokio_util::sync::CancellationToken;

use crate::effect::EffectHandler;
use crate::{EngineHandler, Error, ReplicationSource, TableFilter};

const CHECKSUM_QUERY: &str = "SET @master_binlog_checksum='CRC32'";

/// Everything needed to connect to the source MySQL server and to know which
/// tables this deployment cares about.
#[derive(Debug, Clone)]
pub struct MySqlSourceConfig {
    /// `host:port` of the source server.
    pub addr: String,
    /// Replication user.
    pub user: String,
    /// Replication user's password.
    pub pwd: String,
    /// Connection charset.
    pub charset: String,
    /// Must be unique across the replica topology.
    pub server_id: u32,
    /// `(schema, table)` pairs to snapshot and filter the live stream by.
    pub sources: Vec<(String, Vec<String>)>,
}

impl MySqlSourceConfig {
    fn table_filter(&self) -> TableFilter {
        TableFilter::new(self.sources.iter().flat_map(|(schema, tables)| {
            tables.iter().map(move |table| (schema.clone(), table.clone()))
        }))
    }

    fn opts(&self) -> Opts {
        let (host, port) = self.addr.rsplit_once(':').unwrap_or((self.addr.as_str(), "3306"));
        OptsBuilder::default()
            .ip_or_hostname(host)
            .tcp_port(port.parse().unwrap_or(3306))
            .user(Some(self.user.clone()))
            .pass(Some(self.pwd.clone()))
            .into()
    }
}

struct TableSchema {
    schema: String,
    table: String,
    columns: Vec<String>,
}

/// A `ReplicationSource` backed by a live MySQL binlog stream.
pub struct MySqlReplicationSource {
    config: MySqlSourceConfig,
    table_filter: TableFilter,
    table_schemas: HashMap<u64, TableSchema>,
    control: Option<Conn>,
}

impl MySqlReplicationSource {
    /// Builds a source that is not yet connected; `init` performs the
    /// control connection and startup checks.
    pub fn new(config: MySqlSourceConfig) -> Self {
        let table_filter = config.table_filter();
        Self {
            config,
            table_filter,
            table_schemas: HashMap::new(),
            control: None,
        }
    }

    async fn connect_control(&self) -> Result<Conn, Error> {
        Conn::new(self.config.opts())
            .await
            .map_err(|e| Error::InvalidConfig(format!("could not connect to {}: {e}", self.config.addr)))
    }

    async fn check_full_row_image(conn: &mut Conn) -> Result<(), Error> {
        let mode: Option<String> = conn
            .query_first("SELECT @@GLOBAL.binlog_row_image")
            .await
            .map_err(|e| Error::InvalidConfig(format!("could not read binlog_row_image: {e}")))?;

        match mode.as_deref() {
            Some(m) if m.eq_ignore_ascii_case("full") => Ok(()),
            other => Err(Error::InvalidConfig(format!(
                "binlog_row_image must be FULL, found {other:?}"
            ))),
        }
    }

    async fn current_position(conn: &mut Conn) -> Result<PositionMarker, Error> {
        let row: Option<(String, u64)> = conn
            .query_first("SHOW MASTER STATUS")
            .await
            .map_err(|e| Error::Upstream(format!("SHOW MASTER STATUS failed: {e}")))?;

        let (log_name, log_offset) =
            row.ok_or_else(|| Error::Upstream("SHOW MASTER STATUS returned no rows; is binary logging enabled?".into()))?;

        Ok(PositionMarker {
            log_name,
            log_offset,
            force: true,
        })
    }

    /// Emits one insert event per row of every configured table, then
    /// returns the position the snapshot was taken at. Run only when no
    /// position has ever been saved.
    async fn snapshot(&self, cancellation: &CancellationToken, effect_handler: &EffectHandler) -> Result<PositionMarker, Error> {
        let mut conn = self.connect_control().await?;
        let position = Self::current_position(&mut conn).await?;

        for (schema, tables) in &self.config.sources {
            for table in tables {
                let query = format!("SELECT * FROM `{schema}`.`{table}`");
                let rows: Vec<mysql_async::Row> = conn
                    .query(query)
                    .await
                    .map_err(|e| Error::Upstream(format!("snapshot of {schema}.{table} failed: {e}")))?;

                for mysql_row in rows {
                    if cancellation.is_cancelled() {
                        return Ok(position);
                    }

                    let row = mysql_row_to_intermediate(&mysql_row);
                    let event = RowEvent {
                        schema: schema.clone(),
                        table: table.clone(),
                        action: Action::Insert,
                        row,
                    };
                    effect_handler.emit(ChannelMessage::Row(event)).await?;
                }
            }
        }

        tracing::info!(position = ?position, "snapshot complete");
        Ok(position)
    }

    async fn register_as_replica(&self, conn: &mut Conn) -> Result<(), Error> {
        conn.query_drop(CHECKSUM_QUERY)
            .await
            .map_err(|e| Error::Upstream(format!("failed to set checksum mode: {e}")))?;

        let cmd = ComRegisterSlave::new(self.config.server_id);
        conn.write_command(&cmd)
            .await
            .map_err(|e| Error::Upstream(format!("failed to register as replica: {e}")))?;
        let _ = conn
            .read_packet()
            .await
            .map_err(|e| Error::Upstream(format!("failed to read replica registration ack: {e}")))?;

        Ok(())
    }

    async fn request_binlog(&self, conn: &mut Conn, position: &PositionMarker) -> Result<(), Error> {
        let cmd = ComBinlogDump::new(self.config.server_id)
            .with_pos(position.log_offset as u32)
            .with_filename(position.log_name.as_bytes());

        conn.write_command(&cmd)
            .await
            .map_err(|e| Error::Upstream(format!("failed to request binlog stream: {e}")))?;
        let _ = conn
            .read_packet()
            .await
            .map_err(|e| Error::Upstream(format!("failed to read binlog dump ack: {e}")))?;

        Ok(())
    }

    async fn resolve_table_schema(&mut self, db: &str, table: &str) -> Result<Vec<String>, Error> {
        let conn = self
            .control
            .as_mut()
            .expect("control connection initialized during init()");

        let columns: Vec<String> = conn
            .exec(
                "SELECT column_name FROM information_schema.columns \
                 WHERE table_schema = ? AND table_name = ? ORDER BY ordinal_position",
                (db, table),
            )
            .await
            .map_err(|e| Error::Upstream(format!("failed to resolve columns for {db}.{table}: {e}")))?;

        Ok(columns)
    }

    async fn schema_for(&mut self, tme: &TableMapEvent<'static>) -> Result<&TableSchema, Error> {
        let table_id = tme.table_id();
        if !self.table_schemas.contains_key(&table_id) {
            let db = tme.database_name().to_string();
            let table = tme.table_name().to_string();
            let columns = self.resolve_table_schema(&db, &table).await?;
            let _ = self.table_schemas.insert(
                table_id,
                TableSchema {
                    schema: db,
                    table,
                    columns,
                },
            );
        }

        Ok(self.table_schemas.get(&table_id).expect("just inserted"))
    }
}

#[async_trait::async_trait]
impl ReplicationSource for MySqlReplicationSource {
    async fn init(&mut self, _engine_handler: EngineHandler) -> Result<(), Error> {
        let mut conn = self.connect_control().await?;
        Self::check_full_row_image(&mut conn).await?;
        self.control = Some(conn);
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), Error> {
        if let Some(conn) = self.control.take() {
            let _ = conn.disconnect().await;
        }
        Ok(())
    }

    async fn run(
        &mut self,
        resume_from: Option<PositionMarker>,
        cancellation: CancellationToken,
        effect_handler: EffectHandler,
    ) -> Result<(), Error> {
        let position = match resume_from {
            Some(position) => position,
            None => self.snapshot(&cancellation, &effect_handler).await?,
        };

        if cancellation.is_cancelled() {
            return Ok(());
        }

        let mut stream_conn = self.connect_control().await?;
        self.register_as_replica(&mut stream_conn).await?;
        self.request_binlog(&mut stream_conn, &position).await?;

        let mut reader = EventStreamReader::new(BinlogVersion::Version4);
        let mut current_log_name = position.log_name.clone();

        loop {
            if cancellation.is_cancelled() {
                return Ok(());
            }

            let packet = tokio::select! {
                _ = cancellation.cancelled() => return Ok(()),
                packet = stream_conn.read_packet() => packet.map_err(|e| Error::Upstream(format!("binlog stream read failed: {e}")))?,
            };

            let event: Event = reader
                .read(&packet[1..])
                .map_err(|e| Error::Upstream(format!("failed to decode binlog event: {e}")))?;

            let event_type = event
                .header()
                .event_type()
                .map_err(|t| Error::Upstream(format!("unknown binlog event type {t}")))?;

            match event_type {
                EventType::ROTATE_EVENT => {
                    let ev = event
                        .read_event::<mysql_common::binlog::events::RotateEvent>()
                        .map_err(|e| Error::Upstream(format!("failed to decode rotate event: {e}")))?;
                    current_log_name = ev.name().to_string();
                    effect_handler
                        .emit(ChannelMessage::Position(PositionMarker {
                            log_name: current_log_name.clone(),
                            log_offset: ev.position(),
                            force: true,
                        }))
                        .await?;
                }

                EventType::QUERY_EVENT => {
                    // DDL boundary: only used to force a checkpoint, the
                    // statement itself is never translated into index schema
                    // changes (see Non-goals).
                    effect_handler
                        .emit(ChannelMessage::Position(PositionMarker {
                            log_name: current_log_name.clone(),
                            log_offset: event.header().log_pos() as u64,
                            force: true,
                        }))
                        .await?;
                }

                EventType::XID_EVENT => {
                    effect_handler
                        .emit(ChannelMessage::Position(PositionMarker {
                            log_name: current_log_name.clone(),
                            log_offset: event.header().log_pos() as u64,
                            force: false,
                        }))
                        .await?;
                }

                EventType::TABLE_MAP_EVENT => {
                    // Implicitly cached by `EventStreamReader`; column-name
                    // resolution happens lazily the first time a row event
                    // references this table id, in `schema_for`.
                }

                EventType::WRITE_ROWS_EVENT => {
                    self.emit_rows_event::<mysql_common::binlog::events::WriteRowsEvent>(
                        &event,
                        &reader,
                        Action::Insert,
                        &cancellation,
                        &effect_handler,
                    )
                    .await?;
                }

                EventType::UPDATE_ROWS_EVENT => {
                    self.emit_rows_event::<mysql_common::binlog::events::UpdateRowsEvent>(
                        &event,
                        &reader,
                        Action::Update,
                        &cancellation,
                        &effect_handler,
                    )
                    .await?;
                }

                EventType::DELETE_ROWS_EVENT => {
                    self.emit_rows_event::<mysql_common::binlog::events::DeleteRowsEvent>(
                        &event,
                        &reader,
                        Action::Delete,
                        &cancellation,
                        &effect_handler,
                    )
                    .await?;
                }

                _ => {}
            }
        }
    }
}

impl MySqlReplicationSource {
    async fn emit_rows_event<E>(
        &mut self,
        event: &Event,
        reader: &EventStreamReader,
        action: Action,
        cancellation: &CancellationToken,
        effect_handler: &EffectHandler,
    ) -> Result<(), Error>
    where
        E: mysql_common::binlog::events::BinlogRowsEvent,
    {
        let ev: E = event
            .read_event()
            .map_err(|e| Error::Upstream(format!("failed to decode rows event: {e}")))?;

        let tme = reader
            .get_tme(ev.table_id())
            .ok_or_else(|| Error::Upstream(format!("no table map event cached for table id {}", ev.table_id())))?;

        let schema = self.schema_for(tme).await?;
        if !self.table_filter.contains(&schema.schema, &schema.table) {
            return Ok(());
        }

        for row_pair in ev.rows(tme) {
            if cancellation.is_cancelled() {
                return Ok(());
            }

            let (before, after) = row_pair.map_err(|e| Error::Upstream(format!("failed to decode row: {e}")))?;
            let row_image = match action {
                Action::Delete => before,
                _ => after,
            };
            let Some(row_image) = row_image else {
                continue;
            };

            let row = binlog_row_to_intermediate(&row_image, &schema.columns);
            effect_handler
                .emit(ChannelMessage::Row(RowEvent {
                    schema: schema.schema.clone(),
                    table: schema.table.clone(),
                    action,
                    row,
                }))
                .await?;
        }

        Ok(())
    }
}

fn mysql_row_to_intermediate(row: &mysql_async::Row) -> row::IntermediateRow {
    let mut map = row::IntermediateRow::new();
    for column in row.columns_ref() {
        let name = column.name_str().to_string();
        let value: MysqlValue = row.get(name.as_str()).unwrap_or(MysqlValue::NULL);
        let _ = map.insert(name, mysql_value_to_json(&value));
    }
    map
}

fn binlog_row_to_intermediate(
    binlog_row: &mysql_common::binlog::row::BinlogRow,
    columns: &[String],
) -> row::IntermediateRow {
    let mut map = row::IntermediateRow::new();
    for (idx, name) in columns.iter().enumerate() {
        let value = match binlog_row.as_ref(idx) {
            Some(mysql_common::binlog::value::BinlogValue::Value(v)) => mysql_value_to_json(v),
            _ => JsonValue::Null,
        };
        let _ = map.insert(name.clone(), value);
    }
    map
}

fn mysql_value_to_json(value: &MysqlValue) -> JsonValue {
    match value {
        MysqlValue::NULL => JsonValue::Null,
        MysqlValue::Bytes(bytes) => match std::str::from_utf8(bytes) {
            Ok(s) => JsonValue::String(s.to_string()),
            Err(_) => JsonValue::Null,
        },
        MysqlValue::Int(i) => JsonValue::Number((*i).into()),
        MysqlValue::UInt(u) => JsonValue::Number((*u).into()),
        MysqlValue::Float(f) => serde_json::Number::from_f64(*f as f64).map(JsonValue::Number).unwrap_or(JsonValue::Null),
        MysqlValue::Double(d) => serde_json::Number::from_f64(*d).map(JsonValue::Number).unwrap_or(JsonValue::Null),
        _ => JsonValue::Null,
    }
}
