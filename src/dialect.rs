//! Dialect 계약 및 레지스트리
//!
//! 새 데이터베이스 엔진을 지원하려면 `Dialect`와 그 연결 타입(`SourceConnection`,
//! `LogReader`)만 구현하면 됩니다. split 분할과 fetch 태스크 실행은 엔진과 무관하게
//! 이 크레이트가 처리합니다.

use crate::config::{ConnectionConfig, SourceConfig};
use crate::discovery;
use crate::error::{CdcError, Result};
use crate::events::{KeyValue, LogEntry, Row};
use crate::fetch::{FetchTask, FetchTaskContext};
use crate::offset::LogPosition;
use crate::schema::SchemaCache;
use crate::split::SourceSplit;
use crate::splitter::ChunkSplitter;
use crate::table::{TableId, TableSchema};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// 소스 데이터베이스 연결 (메타데이터 조회, 범위 스캔, 워터마크 조회)
///
/// `close()`는 여러 번 호출해도 안전해야 하며, 닫지 않고 drop되어도 자원이 해제되어야 합니다.
#[async_trait]
pub trait SourceConnection: Send {
    /// 시스템 스키마를 제외한 모든 테이블 (필터 적용 전)
    async fn list_tables(&mut self) -> Result<Vec<TableId>>;

    /// 테이블 구조 조회. 테이블이 없으면 `Ok(None)`
    async fn describe_table(&mut self, table: &TableId) -> Result<Option<TableSchema>>;

    /// 다음 변경이 기록될 로그 위치
    async fn current_position(&mut self) -> Result<LogPosition>;

    async fn approximate_row_count(&mut self, table: &TableId) -> Result<u64>;

    /// 키 컬럼의 (최소, 최대). 빈 테이블이면 None
    async fn key_bounds(
        &mut self,
        table: &TableId,
        column: &str,
    ) -> Result<Option<(KeyValue, KeyValue)>>;

    /// `start` 이상인 키를 오름차순으로 `chunk_size`개 읽었을 때의 최대 키
    async fn next_chunk_max(
        &mut self,
        table: &TableId,
        column: &str,
        start: &KeyValue,
        chunk_size: u64,
    ) -> Result<Option<KeyValue>>;

    /// `key`보다 큰 최소 키
    async fn min_key_after(
        &mut self,
        table: &TableId,
        column: &str,
        key: &KeyValue,
    ) -> Result<Option<KeyValue>>;

    /// `[lower, upper)` 범위의 행을 키 순서로 읽음. 키 컬럼이 없으면 전체 테이블
    async fn scan_range(
        &mut self,
        schema: &TableSchema,
        chunk_column: Option<&str>,
        lower: Option<&KeyValue>,
        upper: Option<&KeyValue>,
    ) -> Result<Vec<Row>>;

    /// 주어진 위치(없으면 현재 위치)부터 변경 로그를 읽는 리더를 엶
    async fn open_log_reader(&mut self, start: Option<LogPosition>) -> Result<Box<dyn LogReader>>;

    async fn close(&mut self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// 변경 로그 리더
#[async_trait]
pub trait LogReader: Send {
    /// 도착한 로그 변경을 위치 순서대로 반환. 새 변경이 없으면 폴링 간격만큼 기다린 뒤 빈 목록
    async fn read_entries(&mut self) -> Result<Vec<LogEntry>>;

    /// 이 위치 이전의 변경은 모두 반환됨
    fn position(&self) -> &LogPosition;

    async fn close(&mut self) -> Result<()>;
}

/// 연결 풀 (내부 구현은 엔진 플러그인 소관)
#[async_trait]
pub trait ConnectionPool: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn SourceConnection>>;

    async fn disconnect(&self) -> Result<()>;
}

pub trait ConnectionPoolFactory: Send + Sync {
    fn create_pool(&self, config: &ConnectionConfig) -> Result<Arc<dyn ConnectionPool>>;
}

/// 데이터베이스 엔진별 전략
#[async_trait]
pub trait Dialect: Send + Sync {
    fn name(&self) -> &str;

    /// 테이블 식별자 비교 시 대소문자를 구분하는지
    fn is_case_sensitive(&self) -> bool;

    /// Dialect가 소유하는 스키마 캐시
    fn schema_cache(&self) -> &SchemaCache;

    /// 새 관리용 연결. 호출자가 소유하고 해제합니다
    async fn open_connection(&self, config: &SourceConfig) -> Result<Box<dyn SourceConnection>>;

    fn pooled_connection_factory(&self) -> Arc<dyn ConnectionPoolFactory>;

    /// 필터에 맞는 테이블 목록. 메타데이터 조회 실패는 `DiscoveryError`
    async fn discover_tables(&self, config: &SourceConfig) -> Result<Vec<TableId>> {
        discovery::discover_tables(self, config).await
    }

    /// 멱등 조회: 같은 실행 중에는 항상 같은 스키마를 반환
    async fn query_table_schema(
        &self,
        conn: &mut dyn SourceConnection,
        table: &TableId,
    ) -> Result<Arc<TableSchema>> {
        self.schema_cache().get_or_load(conn, table).await
    }

    fn create_chunk_splitter(&self, config: &SourceConfig) -> ChunkSplitter {
        ChunkSplitter::new(config)
    }

    /// split 실행에 필요한 연결 두 개와 참조 테이블 스키마를 준비
    async fn create_fetch_task_context(
        &self,
        split: &SourceSplit,
        config: Arc<SourceConfig>,
    ) -> Result<FetchTaskContext> {
        let mut connection = self.open_connection(&config).await?;
        // 두 번째 연결이 실패하면 첫 번째 연결은 여기서 drop되어 해제됩니다
        let metadata_connection = self.open_connection(&config).await?;

        let mut schemas = HashMap::new();
        for table in split.table_ids() {
            let key = table.normalized(self.is_case_sensitive());
            if schemas.contains_key(&key) {
                continue;
            }
            let schema = self.query_table_schema(connection.as_mut(), table).await?;
            schemas.insert(key, schema);
        }

        debug!(
            "Created fetch context for {} with {} table schemas",
            split.split_id(),
            schemas.len()
        );

        Ok(FetchTaskContext::new(
            config,
            self.name().to_string(),
            self.is_case_sensitive(),
            connection,
            metadata_connection,
            schemas,
        ))
    }

    /// split 종류에 따른 태스크 선택 (유일한 분기 지점)
    fn create_fetch_task(&self, split: SourceSplit) -> FetchTask {
        FetchTask::for_split(split)
    }
}

/// 이름 → Dialect
#[derive(Clone, Default)]
pub struct DialectRegistry {
    dialects: HashMap<String, Arc<dyn Dialect>>,
}

impl DialectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 기본 제공 Dialect(MySQL)가 등록된 레지스트리
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(crate::mysql::MySqlDialect::new()));
        registry
    }

    pub fn register(&mut self, dialect: Arc<dyn Dialect>) {
        self.dialects.insert(dialect.name().to_lowercase(), dialect);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Dialect>> {
        self.dialects
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| CdcError::UnknownDialect(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.dialects.keys().cloned().collect();
        names.sort();
        names
    }
}
