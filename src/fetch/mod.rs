//! Fetch 태스크: split 하나를 변경 레코드 스트림으로 변환
//!
//! 태스크는 컨텍스트(연결, 스키마)를 독점 소유하며 종료나 실패 시 반드시 해제합니다.

pub mod incremental;
pub mod snapshot;

pub use incremental::{IncrementalFetchTask, IncrementalTaskState};
pub use snapshot::{SnapshotFetchTask, SnapshotResult, SnapshotTaskState};

use crate::config::SourceConfig;
use crate::dialect::SourceConnection;
use crate::error::Result;
use crate::events::ChangeRecord;
use crate::offset::IncrementalOffset;
use crate::split::{SourceSplit, SplitKind};
use crate::table::{TableId, TableSchema};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::warn;

/// 레코드 싱크. 채널이 가득 차면 send가 대기하므로 스캔/스트리밍도 멈춥니다
pub type RecordSink = mpsc::Sender<ChangeRecord>;

pub fn record_channel(capacity: usize) -> (RecordSink, mpsc::Receiver<ChangeRecord>) {
    mpsc::channel(capacity)
}

/// 증분 태스크의 최신 확인 위치
pub type OffsetReporter = watch::Sender<Option<IncrementalOffset>>;

pub fn offset_channel() -> (OffsetReporter, watch::Receiver<Option<IncrementalOffset>>) {
    watch::channel(None)
}

/// 취소 요청 측
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn signal(&self) -> CancelSignal {
        CancelSignal {
            rx: self.tx.subscribe(),
        }
    }
}

/// 취소 감지 측
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// 취소될 때까지 대기. 요청 측이 사라지면 영원히 대기
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx: Arc::new(tx) }, CancelSignal { rx })
}

/// split이 참조하는 테이블의 스키마
///
/// 연결과 분리되어 있어 스트리밍 중에도 공유 참조로 넘길 수 있습니다.
#[derive(Debug, Clone, Default)]
pub struct SplitTables {
    case_sensitive: bool,
    schemas: HashMap<TableId, Arc<TableSchema>>,
}

impl SplitTables {
    pub fn new(case_sensitive: bool, schemas: HashMap<TableId, Arc<TableSchema>>) -> Self {
        let schemas = schemas
            .into_iter()
            .map(|(table, schema)| (table.normalized(case_sensitive), schema))
            .collect();
        SplitTables {
            case_sensitive,
            schemas,
        }
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    pub fn schema(&self, table: &TableId) -> Option<&Arc<TableSchema>> {
        self.schemas.get(&table.normalized(self.case_sensitive))
    }

    pub fn same_table(&self, a: &TableId, b: &TableId) -> bool {
        a.normalized(self.case_sensitive) == b.normalized(self.case_sensitive)
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

/// split 실행 중 필요한 상태: 연결 두 개와 참조 테이블의 스키마
pub struct FetchTaskContext {
    config: Arc<SourceConfig>,
    dialect_name: String,
    tables: SplitTables,
    connection: Box<dyn SourceConnection>,
    metadata_connection: Box<dyn SourceConnection>,
}

impl FetchTaskContext {
    pub fn new(
        config: Arc<SourceConfig>,
        dialect_name: String,
        case_sensitive: bool,
        connection: Box<dyn SourceConnection>,
        metadata_connection: Box<dyn SourceConnection>,
        schemas: HashMap<TableId, Arc<TableSchema>>,
    ) -> Self {
        FetchTaskContext {
            config,
            dialect_name,
            tables: SplitTables::new(case_sensitive, schemas),
            connection,
            metadata_connection,
        }
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn dialect_name(&self) -> &str {
        &self.dialect_name
    }

    pub fn tables(&self) -> &SplitTables {
        &self.tables
    }

    pub fn is_case_sensitive(&self) -> bool {
        self.tables.is_case_sensitive()
    }

    pub fn schema(&self, table: &TableId) -> Option<&Arc<TableSchema>> {
        self.tables.schema(table)
    }

    /// 데이터 연결 (범위 스캔, 로그 리더)
    pub fn connection(&mut self) -> &mut dyn SourceConnection {
        self.connection.as_mut()
    }

    /// 메타데이터 연결 (워터마크 조회)
    pub fn metadata_connection(&mut self) -> &mut dyn SourceConnection {
        self.metadata_connection.as_mut()
    }

    /// 두 연결을 모두 닫음. 여러 번 호출해도 안전
    pub async fn release(&mut self) -> Result<()> {
        let data = self.connection.close().await;
        let metadata = self.metadata_connection.close().await;
        if let Err(ref e) = metadata {
            warn!("Failed to close metadata connection: {}", e);
        }
        data.and(metadata)
    }
}

impl fmt::Debug for FetchTaskContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchTaskContext")
            .field("dialect", &self.dialect_name)
            .field("tables", &self.tables.schemas.keys().collect::<Vec<_>>())
            .field("closed", &self.connection.is_closed())
            .finish()
    }
}

/// 태스크 실행 결과
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    /// 스냅샷 split 완료 (워터마크 포함)
    SnapshotFinished(SnapshotResult),
    /// 증분 태스크 중단 (마지막 확인 위치 포함)
    IncrementalStopped(IncrementalOffset),
}

/// split 종류별 태스크
#[derive(Debug)]
pub enum FetchTask {
    Snapshot(SnapshotFetchTask),
    Incremental(IncrementalFetchTask),
}

impl FetchTask {
    pub fn for_split(split: SourceSplit) -> Self {
        match split {
            SourceSplit::Snapshot(split) => FetchTask::Snapshot(SnapshotFetchTask::new(split)),
            SourceSplit::Incremental(split) => {
                FetchTask::Incremental(IncrementalFetchTask::new(split))
            }
        }
    }

    pub fn kind(&self) -> SplitKind {
        match self {
            FetchTask::Snapshot(_) => SplitKind::Snapshot,
            FetchTask::Incremental(_) => SplitKind::Incremental,
        }
    }

    pub async fn execute(
        &mut self,
        context: FetchTaskContext,
        sink: &RecordSink,
        cancel: &mut CancelSignal,
        reporter: Option<&OffsetReporter>,
    ) -> Result<TaskOutcome> {
        match self {
            FetchTask::Snapshot(task) => task
                .execute(context, sink, cancel)
                .await
                .map(TaskOutcome::SnapshotFinished),
            FetchTask::Incremental(task) => task
                .execute(context, sink, cancel, reporter)
                .await
                .map(TaskOutcome::IncrementalStopped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::Dialect;
    use crate::memory::{MemoryDatabase, MemoryDialect};
    use crate::events::CellValue;
    use crate::split::IncrementalSplit;
    use crate::splitter::ChunkSplitter;
    use crate::table::{Column, ColumnType};

    #[tokio::test]
    async fn test_dispatch_per_split_kind() {
        let db = MemoryDatabase::new();
        let schema = TableSchema::new(
            TableId::new("shop", "orders"),
            vec![Column::new("id", ColumnType::Integer).not_null()],
            vec!["id".to_string()],
        );
        db.create_table(schema.clone());
        for id in 1..=1000 {
            db.insert(&schema.table_id, vec![CellValue::Int64(id)]).unwrap();
        }
        let dialect = MemoryDialect::new(db);
        let config = SourceConfig {
            chunk_size: 100,
            ..Default::default()
        };
        let mut conn = dialect.open_connection(&config).await.unwrap();

        let splits = ChunkSplitter::new(&config)
            .generate_splits(conn.as_mut(), &schema)
            .await
            .unwrap();
        assert_eq!(splits.len(), 10);
        for split in splits {
            let task = dialect.create_fetch_task(SourceSplit::Snapshot(split));
            assert_eq!(task.kind(), SplitKind::Snapshot);
            assert!(matches!(task, FetchTask::Snapshot(_)));
        }

        let residual = IncrementalSplit::new(vec![schema.table_id.clone()], None);
        let task = dialect.create_fetch_task(residual.into());
        assert!(matches!(task, FetchTask::Incremental(_)));
        assert_eq!(task.kind(), SplitKind::Incremental);
    }

    #[tokio::test]
    async fn test_cancel_signal() {
        let (handle, mut signal) = cancel_pair();
        assert!(!signal.is_cancelled());

        let waiter = tokio::spawn(async move {
            signal.cancelled().await;
            signal.is_cancelled()
        });
        handle.cancel();
        assert!(waiter.await.unwrap());
        assert!(handle.signal().is_cancelled());
    }
}
