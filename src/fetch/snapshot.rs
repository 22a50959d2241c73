//! 스냅샷 Fetch 태스크
//!
//! 1. low 워터마크 기록 (스캔 직전 로그 위치)
//! 2. `[lower, upper)` 범위 스캔
//! 3. high 워터마크 기록 (스캔 직후 로그 위치)
//! 4. `[low, high)` 구간의 같은 테이블 로그 변경을 스캔 결과에 덮어써서 병합
//! 5. 병합된 행을 키 순서로 `Read` 레코드로 내보냄
//!
//! 병합 버퍼는 split 범위의 행만 담으므로 메모리 사용량은 split 크기에 비례합니다.

use super::{CancelSignal, FetchTaskContext, RecordSink, SplitTables};
use crate::dialect::LogReader;
use crate::error::{CdcError, Result};
use crate::events::{ChangeRecord, LogEntry, OperationType, Row, RowKey};
use crate::offset::SplitWatermark;
use crate::split::SnapshotSplit;
use crate::table::TableSchema;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotTaskState {
    Open,
    Scanning,
    WatermarkCapture,
    Done,
    Failed,
}

/// split 완료 보고 (스케줄러가 증분 단계 시작 위치를 정하는 데 사용)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotResult {
    pub split: SnapshotSplit,
    pub watermark: SplitWatermark,
    pub rows_emitted: u64,
    /// 워터마크 구간에서 병합한 로그 변경 수
    pub backfilled: u64,
}

#[derive(Debug)]
pub struct SnapshotFetchTask {
    split: SnapshotSplit,
    state: SnapshotTaskState,
}

impl SnapshotFetchTask {
    pub fn new(split: SnapshotSplit) -> Self {
        SnapshotFetchTask {
            split,
            state: SnapshotTaskState::Open,
        }
    }

    pub fn split(&self) -> &SnapshotSplit {
        &self.split
    }

    pub fn state(&self) -> SnapshotTaskState {
        self.state
    }

    /// split 하나를 실행. 성공/실패/취소 모두 컨텍스트를 해제한 뒤 반환합니다
    ///
    /// 실패는 `SnapshotTaskError`로 감싸며, split은 원본에 부작용이 없으므로 처음부터 다시
    /// 실행할 수 있습니다.
    pub async fn execute(
        &mut self,
        mut context: FetchTaskContext,
        sink: &RecordSink,
        cancel: &mut CancelSignal,
    ) -> Result<SnapshotResult> {
        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CdcError::Cancelled),
            result = self.run(&mut context, sink) => result,
        };

        if let Err(e) = context.release().await {
            warn!("Failed to release context for {}: {}", self.split.split_key(), e);
        }

        match result {
            Ok(result) => {
                self.state = SnapshotTaskState::Done;
                info!(
                    "Snapshot split {} finished: {} rows ({} backfilled), watermark [{}, {})",
                    self.split,
                    result.rows_emitted,
                    result.backfilled,
                    result.watermark.low,
                    result.watermark.high
                );
                Ok(result)
            }
            Err(CdcError::Cancelled) => {
                self.state = SnapshotTaskState::Failed;
                debug!("Snapshot split {} cancelled", self.split.split_key());
                Err(CdcError::Cancelled)
            }
            Err(e) => {
                self.state = SnapshotTaskState::Failed;
                Err(CdcError::snapshot_task(self.split.split_key(), e))
            }
        }
    }

    async fn run(
        &mut self,
        context: &mut FetchTaskContext,
        sink: &RecordSink,
    ) -> Result<SnapshotResult> {
        self.state = SnapshotTaskState::Open;
        let schema = context
            .schema(&self.split.table_id)
            .cloned()
            .ok_or_else(|| CdcError::SchemaMismatch(self.split.table_id.clone()))?;

        let low = context.metadata_connection().current_position().await?;

        self.state = SnapshotTaskState::Scanning;
        debug!("Scanning {} from low watermark {}", self.split, low);
        let rows = context
            .connection()
            .scan_range(
                &schema,
                self.split.chunk_column.as_deref(),
                self.split.lower.as_ref(),
                self.split.upper.as_ref(),
            )
            .await?;

        let mut buffer = SnapshotBuffer::new(&schema, &self.split);
        for row in rows {
            buffer.insert(row);
        }

        self.state = SnapshotTaskState::WatermarkCapture;
        let high = context.metadata_connection().current_position().await?;
        let watermark = SplitWatermark::new(low, high);

        let backfilled = if watermark.is_quiet() {
            0
        } else {
            let mut reader = context
                .connection()
                .open_log_reader(Some(watermark.low.clone()))
                .await?;
            let backfilled =
                backfill(reader.as_mut(), context.tables(), &watermark, &mut buffer).await;
            if let Err(e) = reader.close().await {
                debug!("Failed to close backfill reader: {}", e);
            }
            backfilled?
        };

        let mut rows_emitted = 0;
        for row in buffer.into_rows() {
            sink.send(ChangeRecord::read(self.split.table_id.clone(), row))
                .await
                .map_err(|_| CdcError::ChannelClosed)?;
            rows_emitted += 1;
        }

        Ok(SnapshotResult {
            split: self.split.clone(),
            watermark,
            rows_emitted,
            backfilled,
        })
    }
}

/// `[low, high)` 구간의 로그 변경을 버퍼에 적용
async fn backfill(
    reader: &mut dyn LogReader,
    tables: &SplitTables,
    watermark: &SplitWatermark,
    buffer: &mut SnapshotBuffer<'_>,
) -> Result<u64> {
    let mut applied = 0;
    while *reader.position() < watermark.high {
        for entry in reader.read_entries().await? {
            if entry.position >= watermark.high {
                return Ok(applied);
            }
            if !watermark.contains(&entry.position)
                || !tables.same_table(&entry.table_id, &buffer.split.table_id)
            {
                continue;
            }
            if buffer.apply(entry) {
                applied += 1;
            }
        }
    }
    Ok(applied)
}

/// split 범위의 병합 버퍼
///
/// 기본 키가 있는 행은 키로 식별하고(같은 키는 나중 변경이 덮어씀), 키를 만들 수 없는 행은
/// 값 전체가 같은 행을 같은 행으로 취급합니다.
struct SnapshotBuffer<'a> {
    schema: &'a TableSchema,
    split: &'a SnapshotSplit,
    keyed: BTreeMap<RowKey, Row>,
    unkeyed: Vec<Row>,
}

impl<'a> SnapshotBuffer<'a> {
    fn new(schema: &'a TableSchema, split: &'a SnapshotSplit) -> Self {
        SnapshotBuffer {
            schema,
            split,
            keyed: BTreeMap::new(),
            unkeyed: Vec::new(),
        }
    }

    fn in_range(&self, row: &Row) -> bool {
        match &self.split.chunk_column {
            None => true,
            Some(column) => self
                .split
                .contains(self.schema.chunk_key(row, column).as_ref()),
        }
    }

    fn insert(&mut self, row: Row) {
        match self.schema.row_key(&row) {
            Some(key) => {
                self.keyed.insert(key, row);
            }
            None => self.unkeyed.push(row),
        }
    }

    fn remove(&mut self, row: &Row) {
        match self.schema.row_key(row) {
            Some(key) => {
                self.keyed.remove(&key);
            }
            None => {
                if let Some(index) = self.unkeyed.iter().position(|r| r == row) {
                    self.unkeyed.remove(index);
                }
            }
        }
    }

    /// 로그 변경 하나를 적용. 범위 밖 변경이면 false
    fn apply(&mut self, entry: LogEntry) -> bool {
        let mut touched = false;

        if let Some(before) = entry.before.map(|values| self.schema.decode_row(values)) {
            if self.in_range(&before) {
                self.remove(&before);
                touched = true;
            }
        }

        if matches!(entry.op, OperationType::Insert | OperationType::Update) {
            if let Some(after) = entry.after.map(|values| self.schema.decode_row(values)) {
                if self.in_range(&after) {
                    self.insert(after);
                    touched = true;
                }
            }
        }

        touched
    }

    /// 키 순서, 키 없는 행은 스캔 순서
    fn into_rows(self) -> impl Iterator<Item = Row> {
        self.keyed.into_values().chain(self.unkeyed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::dialect::Dialect;
    use crate::events::{CellValue, KeyValue};
    use crate::fetch::{cancel_pair, record_channel};
    use crate::memory::{MemoryDatabase, MemoryDialect, Mutation};
    use crate::split::SourceSplit;
    use crate::table::{Column, ColumnType, TableId};
    use std::sync::Arc;
    use tokio_test::assert_ok;

    fn orders() -> TableSchema {
        TableSchema::new(
            TableId::new("shop", "orders"),
            vec![
                Column::new("id", ColumnType::Integer).not_null(),
                Column::new("status", ColumnType::Text),
            ],
            vec!["id".to_string()],
        )
    }

    fn values(id: i64, status: &str) -> Vec<CellValue> {
        vec![CellValue::Int64(id), CellValue::String(status.to_string())]
    }

    fn key(id: i64) -> RowKey {
        RowKey(vec![KeyValue::Int(id)])
    }

    fn seeded(ids: impl IntoIterator<Item = i64>) -> (MemoryDatabase, MemoryDialect) {
        let db = MemoryDatabase::new();
        db.create_table(orders());
        for id in ids {
            db.insert(&orders().table_id, values(id, "new")).unwrap();
        }
        let dialect = MemoryDialect::new(db.clone());
        (db, dialect)
    }

    async fn run_split(
        dialect: &MemoryDialect,
        split: SnapshotSplit,
    ) -> (Result<SnapshotResult>, Vec<ChangeRecord>) {
        let context = dialect
            .create_fetch_task_context(
                &SourceSplit::Snapshot(split.clone()),
                Arc::new(SourceConfig::default()),
            )
            .await
            .unwrap();
        let (sink, mut records) = record_channel(1024);
        let (_handle, mut cancel) = cancel_pair();

        let mut task = SnapshotFetchTask::new(split);
        let result = task.execute(context, &sink, &mut cancel).await;
        drop(sink);

        let mut emitted = Vec::new();
        while let Some(record) = records.recv().await {
            emitted.push(record);
        }
        (result, emitted)
    }

    fn ids(records: &[ChangeRecord]) -> Vec<i64> {
        records
            .iter()
            .map(|r| match r.after.as_ref().and_then(|row| row.get("id")) {
                Some(CellValue::Int64(id)) => *id,
                other => panic!("unexpected id: {:?}", other),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_quiet_scan_emits_rows_in_key_order() {
        let (db, dialect) = seeded([30, 10, 20]);
        let split = SnapshotSplit::unbounded(orders().table_id);

        let (result, records) = run_split(&dialect, split).await;
        let result = result.unwrap();

        assert!(result.watermark.is_quiet());
        assert_eq!(result.rows_emitted, 3);
        assert_eq!(ids(&records), vec![10, 20, 30]);
        assert!(records.iter().all(|r| r.op == OperationType::Read && r.is_snapshot()));
        assert_eq!(db.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_delete_during_scan_is_reconciled() {
        let (db, dialect) = seeded([50, 75]);
        let table = orders().table_id;
        db.interleave_on_next_scan(&table, vec![Mutation::Delete { key: key(50) }]);

        let split = SnapshotSplit::new(
            table,
            0,
            Some("id".to_string()),
            Some(KeyValue::Int(1)),
            Some(KeyValue::Int(100)),
        );
        let (result, records) = run_split(&dialect, split).await;
        let result = result.unwrap();

        assert!(!result.watermark.is_quiet());
        assert_eq!(result.backfilled, 1);
        assert_eq!(ids(&records), vec![75]);
    }

    #[tokio::test]
    async fn test_each_key_emitted_once_under_concurrent_writes() {
        let (db, dialect) = seeded(1..=10);
        let table = orders().table_id;
        db.interleave_on_next_scan(
            &table,
            vec![
                Mutation::Update {
                    key: key(3),
                    values: values(3, "paid"),
                },
                Mutation::Delete { key: key(5) },
                Mutation::Insert {
                    values: values(11, "new"),
                },
                // 범위 밖으로 이동
                Mutation::Update {
                    key: key(7),
                    values: values(40, "moved"),
                },
                // 범위 밖 삽입
                Mutation::Insert {
                    values: values(25, "new"),
                },
                Mutation::Update {
                    key: key(3),
                    values: values(3, "shipped"),
                },
            ],
        );

        let split = SnapshotSplit::new(
            table.clone(),
            0,
            Some("id".to_string()),
            None,
            Some(KeyValue::Int(15)),
        );
        let (result, records) = run_split(&dialect, split.clone()).await;
        assert_ok!(&result);

        let expected: Vec<Row> = db
            .rows(&table)
            .into_iter()
            .filter(|row| {
                split.contains(orders().chunk_key(row, "id").as_ref())
            })
            .collect();
        let emitted: Vec<Row> = records.iter().filter_map(|r| r.after.clone()).collect();

        assert_eq!(emitted, expected);
        assert_eq!(ids(&records), vec![1, 2, 3, 4, 6, 8, 9, 10, 11]);
        assert_eq!(
            records[2].after.as_ref().unwrap().get("status"),
            Some(&CellValue::String("shipped".to_string()))
        );
    }

    #[tokio::test]
    async fn test_backfill_failure_is_retryable_and_releases() {
        let (db, dialect) = seeded([1, 2]);
        let table = orders().table_id;
        db.interleave_on_next_scan(&table, vec![Mutation::Delete { key: key(1) }]);
        db.fail_next_log_reads(1);

        let (result, records) = run_split(&dialect, SnapshotSplit::unbounded(table)).await;
        let err = result.unwrap_err();

        assert!(matches!(err, CdcError::SnapshotTaskError { .. }));
        assert!(err.is_retryable());
        assert!(records.is_empty());
        assert_eq!(db.open_connections(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_before_scan() {
        let (db, dialect) = seeded([1]);
        let split = SnapshotSplit::unbounded(orders().table_id);
        let context = dialect
            .create_fetch_task_context(
                &SourceSplit::Snapshot(split.clone()),
                Arc::new(SourceConfig::default()),
            )
            .await
            .unwrap();
        let (sink, _records) = record_channel(8);
        let (handle, mut cancel) = cancel_pair();
        handle.cancel();

        let mut task = SnapshotFetchTask::new(split);
        let result = task.execute(context, &sink, &mut cancel).await;

        assert!(matches!(result, Err(CdcError::Cancelled)));
        assert_eq!(task.state(), SnapshotTaskState::Failed);
        assert_eq!(db.open_connections(), 0);
    }
}
