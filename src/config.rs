//! 소스 설정
//!
//! 설정은 시작 시 한 번 만들어지고 이후에는 변경되지 않습니다.
//! 모든 컴포넌트는 `Arc<SourceConfig>` 또는 참조로 같은 값을 전달받습니다.

use crate::error::{CdcError, Result};
use crate::offset::LogPosition;
use crate::table::{TableFilters, TableId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// 데이터베이스 연결 설정
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    /// 로그 복제 클라이언트로 접속할 때 사용하는 서버 ID
    pub server_id: u32,
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            server_id: 5400,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }
}

/// 시작 모드
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupMode {
    /// 스냅샷 후 스트리밍
    #[default]
    Initial,
    /// 스냅샷 없이 현재 위치부터 스트리밍
    Latest,
    /// 스냅샷 없이 지정한 위치부터 스트리밍
    Specific(LogPosition),
}

/// 재시도 정책 (스냅샷/증분 태스크 공통)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// n번째 재시도 전 대기 시간 (선형 증가)
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_ms.saturating_mul(attempt.max(1) as u64))
    }
}

/// CDC 소스 설정
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// 사용할 Dialect 이름 (e.g. "mysql")
    pub dialect: String,
    pub connection: ConnectionConfig,
    pub filters: TableFilters,
    pub startup_mode: StartupMode,
    /// 스냅샷 split 하나에 담을 목표 행 수
    pub chunk_size: u64,
    /// 예상 행 수가 이 값보다 적으면 테이블을 나누지 않음 (chunk_size 이하도 마찬가지)
    pub split_threshold: u64,
    /// 균등 분할을 허용하는 분포 계수 범위
    pub distribution_factor_lower: f64,
    pub distribution_factor_upper: f64,
    /// "db.table" → 청크 키 컬럼 (기본값: 기본 키 첫 컬럼)
    pub chunk_key_columns: HashMap<String, String>,
    pub snapshot_parallelism: usize,
    /// 레코드 싱크 채널 크기 (back-pressure 경계)
    pub sink_capacity: usize,
    /// 증분 태스크가 진행 상황을 로그로 남기는 레코드 간격
    pub checkpoint_interval: u64,
    /// 새 로그가 없을 때 대기하는 시간
    pub poll_interval_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            dialect: "mysql".to_string(),
            connection: ConnectionConfig::default(),
            filters: TableFilters::default(),
            startup_mode: StartupMode::Initial,
            chunk_size: 8096,
            split_threshold: 0,
            distribution_factor_lower: 0.05,
            distribution_factor_upper: 100.0,
            chunk_key_columns: HashMap::new(),
            snapshot_parallelism: 4,
            sink_capacity: 1024,
            checkpoint_interval: 100,
            poll_interval_ms: 500,
            retry: RetryPolicy::default(),
        }
    }
}

impl SourceConfig {
    /// JSON 문자열에서 설정 로드
    pub fn from_json(json: &str) -> Result<Self> {
        let config: SourceConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// 환경 변수에서 설정 로드
    ///
    /// 연결 정보는 `DB_HOST`, `DB_PORT`, `DB_USER`, `DB_PASSWORD`, `DB_NAME`,
    /// 나머지는 `CDC_` 접두사를 사용합니다.
    pub fn from_env() -> Result<Self> {
        let defaults = SourceConfig::default();
        let connection = ConnectionConfig {
            hostname: env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env_parse("DB_PORT", defaults.connection.port)?,
            username: env::var("DB_USER").unwrap_or_else(|_| "root".to_string()),
            password: env::var("DB_PASSWORD").unwrap_or_default(),
            database: env::var("DB_NAME").ok(),
            server_id: env_parse("CDC_SERVER_ID", defaults.connection.server_id)?,
            timeout: Duration::from_secs(env_parse("DB_TIMEOUT_SECS", 30u64)?),
        };

        let startup_mode = match env::var("CDC_STARTUP_MODE").as_deref() {
            Err(_) | Ok("initial") => StartupMode::Initial,
            Ok("latest") => StartupMode::Latest,
            Ok(other) => {
                return Err(CdcError::ConfigError(format!(
                    "알 수 없는 시작 모드: {}",
                    other
                )))
            }
        };

        let config = SourceConfig {
            dialect: env::var("CDC_DIALECT").unwrap_or(defaults.dialect),
            connection,
            filters: TableFilters {
                databases: env_list("CDC_DATABASES"),
                include: env_list("CDC_INCLUDE_TABLES"),
                exclude: env_list("CDC_EXCLUDE_TABLES"),
            },
            startup_mode,
            chunk_size: env_parse("CDC_CHUNK_SIZE", defaults.chunk_size)?,
            split_threshold: env_parse("CDC_SPLIT_THRESHOLD", defaults.split_threshold)?,
            snapshot_parallelism: env_parse("CDC_PARALLELISM", defaults.snapshot_parallelism)?,
            ..defaults
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(CdcError::ConfigError("chunk_size는 0보다 커야 합니다".to_string()));
        }
        if self.snapshot_parallelism == 0 || self.sink_capacity == 0 {
            return Err(CdcError::ConfigError(
                "snapshot_parallelism과 sink_capacity는 0보다 커야 합니다".to_string(),
            ));
        }
        if !(self.distribution_factor_lower > 0.0
            && self.distribution_factor_lower < self.distribution_factor_upper)
        {
            return Err(CdcError::ConfigError(format!(
                "잘못된 분포 계수 범위: [{}, {}]",
                self.distribution_factor_lower, self.distribution_factor_upper
            )));
        }
        if self.retry.max_attempts == 0 {
            return Err(CdcError::ConfigError("retry.max_attempts는 1 이상이어야 합니다".to_string()));
        }
        for table in self.chunk_key_columns.keys() {
            TableId::parse(table)?;
        }
        self.filters.compile(true)?;
        Ok(())
    }

    pub fn chunk_key_column(&self, table: &TableId) -> Option<&str> {
        self.chunk_key_columns
            .get(&table.to_string())
            .map(String::as_str)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| CdcError::ConfigError(format!("{} 값을 해석할 수 없습니다: {}", name, raw))),
        Err(_) => Ok(default),
    }
}

fn env_list(name: &str) -> Vec<String> {
    env::var(name)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 3306);
    }

    #[test]
    fn test_from_json_with_defaults() {
        let config = SourceConfig::from_json(
            r#"{
                "dialect": "memory",
                "connection": { "hostname": "db1", "port": 3307 },
                "filters": { "include": ["shop\\..*"] },
                "chunk_size": 100,
                "chunk_key_columns": { "shop.orders": "order_no" },
                "startup_mode": "latest"
            }"#,
        )
        .unwrap();

        assert_eq!(config.dialect, "memory");
        assert_eq!(config.connection.hostname, "db1");
        assert_eq!(config.connection.username, "root");
        assert_eq!(config.chunk_size, 100);
        assert_eq!(config.startup_mode, StartupMode::Latest);
        assert_eq!(
            config.chunk_key_column(&TableId::new("shop", "orders")),
            Some("order_no")
        );
        assert_eq!(config.retry, RetryPolicy::default());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = SourceConfig {
            chunk_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(CdcError::ConfigError(_))));

        let config = SourceConfig {
            filters: TableFilters::include_tables(["shop\\.(orders"]),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SourceConfig {
            chunk_key_columns: HashMap::from([("orders".to_string(), "id".to_string())]),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_backoff() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_ms: 100,
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
    }
}
