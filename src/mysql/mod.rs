//! MySQL Dialect
//!
//! - 메타데이터: INFORMATION_SCHEMA 조회
//! - 워터마크: `SHOW BINARY LOG STATUS` (구버전은 `SHOW MASTER STATUS`)
//! - 변경 로그: mysql_async binlog 스트림 (ROW 포맷, FULL row image 필요)

pub mod binlog;
pub mod connection;

pub use binlog::MySqlBinlogReader;
pub use connection::MySqlConnection;

use crate::config::{ConnectionConfig, SourceConfig};
use crate::dialect::{ConnectionPool, ConnectionPoolFactory, Dialect, SourceConnection};
use crate::error::{CdcError, Result};
use crate::events::{CellValue, KeyValue};
use crate::schema::SchemaCache;
use crate::table::ColumnType;
use async_trait::async_trait;
use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};
use mysql_async::{Opts, OptsBuilder, Pool, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// 풀 연결에서 연 로그 리더의 폴링 간격
const POOLED_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// 시스템 스키마 (디스커버리에서 제외)
pub(crate) const SYSTEM_SCHEMAS: [&str; 4] =
    ["mysql", "information_schema", "performance_schema", "sys"];

pub struct MySqlDialect {
    schema_cache: SchemaCache,
}

impl MySqlDialect {
    pub fn new() -> Self {
        MySqlDialect {
            schema_cache: SchemaCache::new(true),
        }
    }
}

impl Default for MySqlDialect {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dialect for MySqlDialect {
    fn name(&self) -> &str {
        "mysql"
    }

    /// 테이블 이름은 파일 시스템을 따르므로 구분한다고 가정
    fn is_case_sensitive(&self) -> bool {
        true
    }

    fn schema_cache(&self) -> &SchemaCache {
        &self.schema_cache
    }

    async fn open_connection(&self, config: &SourceConfig) -> Result<Box<dyn SourceConnection>> {
        let connection =
            MySqlConnection::connect(&config.connection, config.poll_interval()).await?;
        Ok(Box::new(connection))
    }

    fn pooled_connection_factory(&self) -> Arc<dyn ConnectionPoolFactory> {
        Arc::new(MySqlPoolFactory)
    }
}

pub struct MySqlPoolFactory;

impl ConnectionPoolFactory for MySqlPoolFactory {
    fn create_pool(&self, config: &ConnectionConfig) -> Result<Arc<dyn ConnectionPool>> {
        Ok(Arc::new(MySqlPool {
            pool: Pool::new(build_opts(config)),
            config: config.clone(),
        }))
    }
}

pub struct MySqlPool {
    pool: Pool,
    config: ConnectionConfig,
}

#[async_trait]
impl ConnectionPool for MySqlPool {
    async fn acquire(&self) -> Result<Box<dyn SourceConnection>> {
        let conn = tokio::time::timeout(self.config.timeout, self.pool.get_conn())
            .await
            .map_err(|_| {
                CdcError::ConnectionError(format!(
                    "{}:{} 연결 시간 초과",
                    self.config.hostname, self.config.port
                ))
            })??;
        Ok(Box::new(MySqlConnection::new(
            conn,
            &self.config,
            POOLED_POLL_INTERVAL,
        )))
    }

    async fn disconnect(&self) -> Result<()> {
        debug!("Disconnecting MySQL pool {}", self.config.hostname);
        self.pool.clone().disconnect().await?;
        Ok(())
    }
}

pub(crate) fn build_opts(config: &ConnectionConfig) -> Opts {
    OptsBuilder::default()
        .ip_or_hostname(config.hostname.clone())
        .tcp_port(config.port)
        .user(Some(config.username.clone()))
        .pass(Some(config.password.clone()))
        .db_name(config.database.clone())
        .into()
}

/// 식별자를 백틱으로 감쌈
pub(crate) fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// 범위 조건 파라미터
pub(crate) fn key_to_value(key: &KeyValue) -> Value {
    match key {
        KeyValue::Int(v) => Value::Int(*v),
        KeyValue::UInt(v) => Value::UInt(*v),
        KeyValue::Text(s) => Value::Bytes(s.clone().into_bytes()),
        KeyValue::Bytes(b) => Value::Bytes(b.clone()),
        KeyValue::Timestamp(dt) => {
            let naive = dt.naive_utc();
            Value::Date(
                naive.year() as u16,
                naive.month() as u8,
                naive.day() as u8,
                naive.hour() as u8,
                naive.minute() as u8,
                naive.second() as u8,
                naive.nanosecond() / 1_000,
            )
        }
    }
}

/// MySQL 값 변환. 컬럼 타입을 알면 그에 맞춰 해석
pub(crate) fn value_to_cell(value: Value, column_type: Option<&ColumnType>) -> CellValue {
    match value {
        Value::NULL => CellValue::Null,
        Value::Int(n) => match column_type {
            Some(ColumnType::Boolean) => CellValue::Bool(n != 0),
            _ => CellValue::Int64(n),
        },
        Value::UInt(n) => CellValue::UInt64(n),
        Value::Float(f) => CellValue::Float(f),
        Value::Double(d) => CellValue::Double(d),
        Value::Bytes(bytes) => bytes_to_cell(bytes, column_type),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let date = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32);
            let time =
                NaiveTime::from_hms_micro_opt(hour as u32, minute as u32, second as u32, micros);
            match (date, time, column_type) {
                (Some(date), _, Some(ColumnType::Date)) => {
                    CellValue::Date(date.format("%Y-%m-%d").to_string())
                }
                (Some(date), Some(time), _) => {
                    CellValue::DateTime(Utc.from_utc_datetime(&NaiveDateTime::new(date, time)))
                }
                // 0000-00-00 같은 값
                _ => CellValue::Null,
            }
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let total_hours = days * 24 + hours as u32;
            let sign = if negative { "-" } else { "" };
            let text = if micros > 0 {
                format!(
                    "{}{:02}:{:02}:{:02}.{:06}",
                    sign, total_hours, minutes, seconds, micros
                )
            } else {
                format!("{}{:02}:{:02}:{:02}", sign, total_hours, minutes, seconds)
            };
            CellValue::Time(text)
        }
    }
}

fn bytes_to_cell(bytes: Vec<u8>, column_type: Option<&ColumnType>) -> CellValue {
    match column_type {
        Some(ColumnType::Binary) => CellValue::Bytes(bytes),
        Some(ColumnType::Decimal) => CellValue::Decimal(String::from_utf8_lossy(&bytes).into_owned()),
        Some(ColumnType::Json) => serde_json::from_slice(&bytes)
            .map(CellValue::Json)
            .unwrap_or_else(|_| CellValue::String(String::from_utf8_lossy(&bytes).into_owned())),
        Some(ColumnType::Integer) => match std::str::from_utf8(&bytes).ok().and_then(|s| s.parse().ok()) {
            Some(n) => CellValue::Int64(n),
            None => CellValue::Bytes(bytes),
        },
        Some(ColumnType::UnsignedInteger) => {
            match std::str::from_utf8(&bytes).ok().and_then(|s| s.parse().ok()) {
                Some(n) => CellValue::UInt64(n),
                None => CellValue::Bytes(bytes),
            }
        }
        _ => match String::from_utf8(bytes) {
            Ok(s) => CellValue::String(s),
            Err(e) => CellValue::Bytes(e.into_bytes()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("orders"), "`orders`");
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_value_to_cell_with_types() {
        assert_eq!(value_to_cell(Value::NULL, None), CellValue::Null);
        assert_eq!(
            value_to_cell(Value::Int(1), Some(&ColumnType::Boolean)),
            CellValue::Bool(true)
        );
        assert_eq!(
            value_to_cell(Value::Bytes(b"12.50".to_vec()), Some(&ColumnType::Decimal)),
            CellValue::Decimal("12.50".to_string())
        );
        assert_eq!(
            value_to_cell(Value::Bytes(b"42".to_vec()), Some(&ColumnType::Integer)),
            CellValue::Int64(42)
        );
        assert_eq!(
            value_to_cell(Value::Bytes(b"hello".to_vec()), None),
            CellValue::String("hello".to_string())
        );
        assert_eq!(
            value_to_cell(Value::Date(2024, 2, 29, 0, 0, 0, 0), Some(&ColumnType::Date)),
            CellValue::Date("2024-02-29".to_string())
        );
        assert_eq!(
            value_to_cell(Value::Date(0, 0, 0, 0, 0, 0, 0), None),
            CellValue::Null
        );
        assert_eq!(
            value_to_cell(Value::Time(true, 1, 2, 3, 4, 0), None),
            CellValue::Time("-26:03:04".to_string())
        );
    }

    #[test]
    fn test_binlog_and_scan_values_build_the_same_keys() {
        use crate::table::{Column, TableId, TableSchema};

        let schema = TableSchema::new(
            TableId::new("shop", "visits"),
            vec![
                Column::new("day", ColumnType::Date).not_null(),
                Column::new("flag", ColumnType::Boolean).not_null(),
                Column::new("tag", ColumnType::Binary).not_null(),
            ],
            vec!["day".to_string(), "flag".to_string(), "tag".to_string()],
        );
        let raw = || {
            vec![
                Value::Date(2024, 2, 29, 0, 0, 0, 0),
                Value::Int(1),
                Value::Bytes(b"a1".to_vec()),
            ]
        };

        // 범위 스캔은 컬럼 타입을 알고 변환, binlog 행은 타입 없이 변환
        let scanned = schema.decode_row(
            raw()
                .into_iter()
                .zip(&schema.columns)
                .map(|(v, c)| value_to_cell(v, Some(&c.column_type)))
                .collect(),
        );
        let logged = schema.decode_row(raw().into_iter().map(|v| value_to_cell(v, None)).collect());

        assert_eq!(schema.chunk_key(&logged, "day"), schema.chunk_key(&scanned, "day"));
        assert_eq!(schema.row_key(&logged), schema.row_key(&scanned));
        assert!(schema.row_key(&logged).is_some());
    }

    #[test]
    fn test_key_roundtrip_through_value() {
        let ts = Utc.with_ymd_and_hms(2024, 5, 1, 12, 30, 0).unwrap();
        let key = KeyValue::Timestamp(ts);
        let cell = value_to_cell(key_to_value(&key), Some(&ColumnType::Timestamp));
        assert_eq!(KeyValue::from_cell(&cell), Some(key));

        let cell = value_to_cell(key_to_value(&KeyValue::UInt(u64::MAX)), None);
        assert_eq!(cell, CellValue::UInt64(u64::MAX));
    }

    #[test]
    fn test_dialect_identity() {
        let dialect = MySqlDialect::new();
        assert_eq!(dialect.name(), "mysql");
        assert!(dialect.is_case_sensitive());
        assert!(dialect.schema_cache().is_empty());
    }
}
