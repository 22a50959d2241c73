//! CDC 관련 에러 타입
//!
//! 에러는 세 부류로 나뉩니다:
//! - 재시도 가능 (연결 끊김, 스캔 실패): 로컬에서 재시도
//! - 구조적 실패 (디스커버리 실패, 테이블 없음): 호출자에게 그대로 전파
//! - 경고 수준 (알 수 없는 테이블의 로그 변경): 레코드를 건너뛰고 계속 진행

use crate::table::TableId;
use std::io;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CdcError {
    #[error("테이블 디스커버리 실패: {0}")]
    DiscoveryError(String),

    #[error("청크 분할 실패 ({table}): {reason}")]
    SplitError { table: TableId, reason: String },

    #[error("스냅샷 태스크 실패 ({split_id}): {source}")]
    SnapshotTaskError {
        split_id: String,
        #[source]
        source: Box<CdcError>,
    },

    #[error("증분 태스크 실패 ({attempts}회 시도 후): {source}")]
    IncrementalTaskError {
        attempts: u32,
        #[source]
        source: Box<CdcError>,
    },

    #[error("스키마 불일치: 캐시에 없는 테이블 {0}")]
    SchemaMismatch(TableId),

    #[error("테이블을 찾을 수 없음: {0}")]
    TableNotFound(TableId),

    #[error("연결 에러: {0}")]
    ConnectionError(String),

    #[error("연결이 끊어졌습니다: {0}")]
    ConnectionLost(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("로그 읽기 에러: {0}")]
    LogReadError(String),

    #[error("설정 에러: {0}")]
    ConfigError(String),

    #[error("지원하지 않는 Dialect: {0}")]
    UnknownDialect(String),

    #[error("I/O 에러: {0}")]
    IoError(String),

    #[error("직렬화 에러: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("작업이 취소되었습니다")]
    Cancelled,

    #[error("채널이 닫혔습니다")]
    ChannelClosed,

    #[error("예상치 못한 에러: {0}")]
    Other(String),
}

impl CdcError {
    /// 같은 작업을 처음부터 (또는 마지막 보고 위치부터) 다시 시도해도 되는지 여부
    pub fn is_retryable(&self) -> bool {
        match self {
            CdcError::ConnectionError(_)
            | CdcError::ConnectionLost(_)
            | CdcError::QueryError(_)
            | CdcError::LogReadError(_)
            | CdcError::IoError(_) => true,
            CdcError::SnapshotTaskError { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    /// 실행 전체를 중단해야 하는 에러인지 여부
    pub fn is_fatal(&self) -> bool {
        match self {
            CdcError::DiscoveryError(_)
            | CdcError::TableNotFound(_)
            | CdcError::ConfigError(_)
            | CdcError::UnknownDialect(_)
            | CdcError::IncrementalTaskError { .. } => true,
            CdcError::SnapshotTaskError { source, .. } => !source.is_retryable(),
            _ => false,
        }
    }

    pub fn snapshot_task(split_id: impl Into<String>, source: CdcError) -> Self {
        CdcError::SnapshotTaskError {
            split_id: split_id.into(),
            source: Box::new(source),
        }
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

impl From<mysql_async::Error> for CdcError {
    fn from(err: mysql_async::Error) -> Self {
        match err {
            mysql_async::Error::Io(e) => CdcError::ConnectionLost(e.to_string()),
            mysql_async::Error::Driver(e) => CdcError::ConnectionError(e.to_string()),
            other => CdcError::QueryError(other.to_string()),
        }
    }
}

impl From<regex::Error> for CdcError {
    fn from(err: regex::Error) -> Self {
        CdcError::ConfigError(format!("잘못된 테이블 패턴: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, CdcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(CdcError::ConnectionLost("reset".into()).is_retryable());
        assert!(!CdcError::DiscoveryError("denied".into()).is_retryable());
        assert!(CdcError::DiscoveryError("denied".into()).is_fatal());

        let wrapped = CdcError::snapshot_task("db.t:0", CdcError::QueryError("timeout".into()));
        assert!(wrapped.is_retryable());
        assert!(!wrapped.is_fatal());
    }

    #[test]
    fn test_cause_chain() {
        use std::error::Error;
        let err = CdcError::IncrementalTaskError {
            attempts: 3,
            source: Box::new(CdcError::ConnectionLost("broken pipe".into())),
        };
        assert!(err.is_fatal());
        let cause = err.source().map(|e| e.to_string()).unwrap_or_default();
        assert!(cause.contains("broken pipe"));
    }
}
