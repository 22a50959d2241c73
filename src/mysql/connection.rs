//! MySQL 데이터베이스 연결 관리

use super::binlog::MySqlBinlogReader;
use super::{build_opts, key_to_value, quote_ident, value_to_cell, SYSTEM_SCHEMAS};
use crate::config::ConnectionConfig;
use crate::dialect::{LogReader, SourceConnection};
use crate::error::{CdcError, Result};
use crate::events::{CellValue, KeyValue, Row};
use crate::offset::LogPosition;
use crate::table::{Column, ColumnType, TableId, TableSchema};
use async_trait::async_trait;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, Params, Value};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// 같은 server_id로 접속한 복제 클라이언트는 서로를 끊으므로 리더마다 다른 값을 사용
static NEXT_READER_OFFSET: AtomicU32 = AtomicU32::new(0);

/// MySQL 연결 래퍼
pub struct MySqlConnection {
    /// None이면 닫힌 연결
    conn: Option<Conn>,
    opts: Opts,
    server_id: u32,
    poll_interval: Duration,
}

impl MySqlConnection {
    pub fn new(conn: Conn, config: &ConnectionConfig, poll_interval: Duration) -> Self {
        MySqlConnection {
            conn: Some(conn),
            opts: build_opts(config),
            server_id: config.server_id,
            poll_interval,
        }
    }

    pub async fn connect(config: &ConnectionConfig, poll_interval: Duration) -> Result<Self> {
        let opts = build_opts(config);
        let conn = tokio::time::timeout(config.timeout, Conn::new(opts))
            .await
            .map_err(|_| {
                CdcError::ConnectionError(format!(
                    "{}:{} 연결 시간 초과",
                    config.hostname, config.port
                ))
            })?
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to MySQL: {}", e)))?;

        debug!("Connected to MySQL {}:{}", config.hostname, config.port);
        Ok(MySqlConnection::new(conn, config, poll_interval))
    }

    fn conn(&mut self) -> Result<&mut Conn> {
        self.conn
            .as_mut()
            .ok_or_else(|| CdcError::ConnectionLost("이미 닫힌 연결입니다".to_string()))
    }

    /// Binlog 상태 조회 (8.4 이전 서버는 SHOW MASTER STATUS)
    async fn binlog_status(&mut self) -> Result<Option<mysql_async::Row>> {
        let conn = self.conn()?;
        let rows: Vec<mysql_async::Row> = match conn.query("SHOW BINARY LOG STATUS").await {
            Ok(rows) => rows,
            Err(mysql_async::Error::Server(e)) => {
                debug!("SHOW BINARY LOG STATUS unsupported ({}), falling back", e.message);
                conn.query("SHOW MASTER STATUS").await.map_err(|e| {
                    CdcError::QueryError(format!("Failed to query binlog status: {}", e))
                })?
            }
            Err(e) => return Err(e.into()),
        };
        Ok(rows.into_iter().next())
    }

    fn params(values: Vec<Value>) -> Params {
        if values.is_empty() {
            Params::Empty
        } else {
            Params::Positional(values)
        }
    }

    /// 단일 키 값을 반환하는 쿼리
    async fn query_key(&mut self, query: String, params: Vec<Value>) -> Result<Option<KeyValue>> {
        let value: Option<Value> = self
            .conn()?
            .exec_first(query, Self::params(params))
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query chunk key: {}", e)))?;

        Ok(value.and_then(|v| KeyValue::from_cell(&value_to_cell(v, None))))
    }
}

#[async_trait]
impl SourceConnection for MySqlConnection {
    async fn list_tables(&mut self) -> Result<Vec<TableId>> {
        let excluded = SYSTEM_SCHEMAS
            .iter()
            .map(|s| format!("'{}'", s))
            .collect::<Vec<_>>()
            .join(", ");
        let query = format!(
            "SELECT TABLE_SCHEMA, TABLE_NAME FROM INFORMATION_SCHEMA.TABLES \
             WHERE TABLE_TYPE = 'BASE TABLE' AND TABLE_SCHEMA NOT IN ({}) \
             ORDER BY TABLE_SCHEMA, TABLE_NAME",
            excluded
        );

        let result: Vec<(String, String)> = self
            .conn()?
            .query(query)
            .await
            .map_err(|e| CdcError::DiscoveryError(format!("Failed to list tables: {}", e)))?;

        Ok(result
            .into_iter()
            .map(|(database, table)| TableId::new(database, table))
            .collect())
    }

    async fn describe_table(&mut self, table: &TableId) -> Result<Option<TableSchema>> {
        let conn = self.conn()?;
        let params = (table.database.clone(), table.table.clone());

        let columns: Vec<(String, String, String)> = conn
            .exec(
                "SELECT COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                params.clone(),
            )
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query table schema: {}", e)))?;

        if columns.is_empty() {
            return Ok(None);
        }

        let primary_key: Vec<String> = conn
            .exec(
                "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY' \
                 ORDER BY ORDINAL_POSITION",
                params,
            )
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query primary key: {}", e)))?;

        let columns = columns
            .into_iter()
            .map(|(name, column_type, is_nullable)| Column {
                name,
                column_type: ColumnType::from_sql_type(&column_type),
                nullable: is_nullable == "YES",
            })
            .collect();

        Ok(Some(TableSchema::new(table.clone(), columns, primary_key)))
    }

    async fn current_position(&mut self) -> Result<LogPosition> {
        let row = self.binlog_status().await?.ok_or_else(|| {
            CdcError::QueryError("No binlog status available (log_bin 비활성?)".to_string())
        })?;

        let file = row.get_opt::<String, _>(0).and_then(|r| r.ok());
        let position = row.get_opt::<u64, _>(1).and_then(|r| r.ok());
        match (file, position) {
            (Some(file), Some(position)) => Ok(LogPosition::new(file, position)),
            _ => Err(CdcError::QueryError(
                "binlog 상태 결과를 해석할 수 없습니다".to_string(),
            )),
        }
    }

    async fn approximate_row_count(&mut self, table: &TableId) -> Result<u64> {
        let rows: Option<Option<u64>> = self
            .conn()?
            .exec_first(
                "SELECT TABLE_ROWS FROM INFORMATION_SCHEMA.TABLES \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?",
                (table.database.clone(), table.table.clone()),
            )
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query row count: {}", e)))?;

        Ok(rows.flatten().unwrap_or(0))
    }

    async fn key_bounds(
        &mut self,
        table: &TableId,
        column: &str,
    ) -> Result<Option<(KeyValue, KeyValue)>> {
        let column = quote_ident(column);
        let query = format!(
            "SELECT MIN({c}), MAX({c}) FROM {}.{}",
            quote_ident(&table.database),
            quote_ident(&table.table),
            c = column
        );

        let bounds: Option<(Value, Value)> = self
            .conn()?
            .exec_first(query, Params::Empty)
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query key bounds: {}", e)))?;

        Ok(bounds.and_then(|(min, max)| {
            let min = KeyValue::from_cell(&value_to_cell(min, None))?;
            let max = KeyValue::from_cell(&value_to_cell(max, None))?;
            Some((min, max))
        }))
    }

    async fn next_chunk_max(
        &mut self,
        table: &TableId,
        column: &str,
        start: &KeyValue,
        chunk_size: u64,
    ) -> Result<Option<KeyValue>> {
        let column = quote_ident(column);
        let query = format!(
            "SELECT MAX({c}) FROM (SELECT {c} FROM {}.{} WHERE {c} >= ? ORDER BY {c} ASC LIMIT {}) AS chunk",
            quote_ident(&table.database),
            quote_ident(&table.table),
            chunk_size,
            c = column
        );
        self.query_key(query, vec![key_to_value(start)]).await
    }

    async fn min_key_after(
        &mut self,
        table: &TableId,
        column: &str,
        key: &KeyValue,
    ) -> Result<Option<KeyValue>> {
        let column = quote_ident(column);
        let query = format!(
            "SELECT MIN({c}) FROM {}.{} WHERE {c} > ?",
            quote_ident(&table.database),
            quote_ident(&table.table),
            c = column
        );
        self.query_key(query, vec![key_to_value(key)]).await
    }

    async fn scan_range(
        &mut self,
        schema: &TableSchema,
        chunk_column: Option<&str>,
        lower: Option<&KeyValue>,
        upper: Option<&KeyValue>,
    ) -> Result<Vec<Row>> {
        let columns = schema
            .columns
            .iter()
            .map(|c| quote_ident(&c.name))
            .collect::<Vec<_>>()
            .join(", ");
        let mut query = format!(
            "SELECT {} FROM {}.{}",
            columns,
            quote_ident(&schema.table_id.database),
            quote_ident(&schema.table_id.table)
        );

        let (conditions, params) = match chunk_column {
            Some(column) => range_conditions(column, lower, upper),
            None => (Vec::new(), Vec::new()),
        };
        if !conditions.is_empty() {
            query.push_str(" WHERE ");
            query.push_str(&conditions.join(" AND "));
        }

        let order_by: Vec<String> = if schema.has_primary_key() {
            schema.primary_key.iter().map(|c| quote_ident(c)).collect()
        } else {
            chunk_column.map(quote_ident).into_iter().collect()
        };
        if !order_by.is_empty() {
            query.push_str(" ORDER BY ");
            query.push_str(&order_by.join(", "));
        }

        let rows: Vec<mysql_async::Row> = self
            .conn()?
            .exec(query, Self::params(params))
            .await
            .map_err(|e| {
                CdcError::QueryError(format!("Failed to scan {}: {}", schema.table_id, e))
            })?;

        Ok(rows
            .into_iter()
            .map(|row| {
                let values: Vec<CellValue> = row
                    .unwrap()
                    .into_iter()
                    .zip(&schema.columns)
                    .map(|(value, column)| value_to_cell(value, Some(&column.column_type)))
                    .collect();
                schema.decode_row(values)
            })
            .collect())
    }

    async fn open_log_reader(&mut self, start: Option<LogPosition>) -> Result<Box<dyn LogReader>> {
        let start = match start {
            Some(start) => start,
            None => self.current_position().await?,
        };
        let offset = NEXT_READER_OFFSET.fetch_add(1, Ordering::Relaxed);
        let server_id = self.server_id.wrapping_add(offset).max(1);

        let reader =
            MySqlBinlogReader::open(self.opts.clone(), server_id, start, self.poll_interval)
                .await?;
        Ok(Box::new(reader))
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(conn) = self.conn.take() {
            if let Err(e) = conn.disconnect().await {
                warn!("Failed to disconnect cleanly: {}", e);
            }
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.conn.is_none()
    }
}

/// `[lower, upper)` 범위 조건과 파라미터. NULL 키는 하한이 열린 첫 범위에서 읽음
fn range_conditions(
    column: &str,
    lower: Option<&KeyValue>,
    upper: Option<&KeyValue>,
) -> (Vec<String>, Vec<Value>) {
    let column = quote_ident(column);
    let mut conditions = Vec::new();
    let mut params = Vec::new();
    if let Some(lower) = lower {
        conditions.push(format!("{} >= ?", column));
        params.push(key_to_value(lower));
    }
    if let Some(upper) = upper {
        conditions.push(match lower {
            Some(_) => format!("{} < ?", column),
            None => format!("({c} IS NULL OR {c} < ?)", c = column),
        });
        params.push(key_to_value(upper));
    }
    (conditions, params)
}
