//! 메모리 기반 Dialect
//!
//! 테이블과 변경 로그를 프로세스 메모리에 두는 엔진입니다. 로그 위치는 파일 구분이 없는
//! 순번(`LogPosition::at`)이며, 다음 변경이 기록될 위치가 곧 현재 위치입니다.
//! 로컬 데모와 테스트에서 장애 주입(연결 실패, 로그 읽기 실패, 스캔 중 동시 쓰기)에 사용합니다.

use crate::config::{ConnectionConfig, SourceConfig};
use crate::dialect::{ConnectionPool, ConnectionPoolFactory, Dialect, LogReader, SourceConnection};
use crate::error::{CdcError, Result};
use crate::events::{chunk_in_range, CellValue, KeyValue, LogEntry, OperationType, Row, RowKey};
use crate::offset::LogPosition;
use crate::schema::SchemaCache;
use crate::table::{TableId, TableSchema};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

/// 로그 리더가 한 번에 반환하는 최대 변경 수
const MAX_BATCH: usize = 256;

/// 스캔 중 끼워 넣을 쓰기
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    Insert { values: Vec<CellValue> },
    Update { key: RowKey, values: Vec<CellValue> },
    Delete { key: RowKey },
}

struct MemoryTable {
    schema: TableSchema,
    rows: Vec<Vec<CellValue>>,
}

impl MemoryTable {
    fn find(&self, key: &RowKey) -> Option<usize> {
        self.rows.iter().position(|values| {
            self.schema.row_key(&self.schema.decode_row(values.clone())).as_ref() == Some(key)
        })
    }

    fn decoded(&self) -> impl Iterator<Item = Row> + '_ {
        self.rows.iter().map(|values| self.schema.decode_row(values.clone()))
    }

    fn chunk_keys(&self, column: &str) -> Vec<KeyValue> {
        let mut keys: Vec<_> = self
            .decoded()
            .filter_map(|row| self.schema.chunk_key(&row, column))
            .collect();
        keys.sort();
        keys
    }
}

#[derive(Default)]
struct MemoryState {
    tables: BTreeMap<TableId, MemoryTable>,
    log: Vec<LogEntry>,
    pending_writes: HashMap<TableId, Vec<Mutation>>,
    /// 대기 중인 쓰기를 적용하기 전에 건너뛸 스캔 수
    scans_to_skip: HashMap<TableId, usize>,
    open_connections: usize,
    /// None이면 제한 없음
    connection_budget: Option<usize>,
    failing_log_reads: usize,
    failing_discovery: bool,
    schema_queries: usize,
    log_reader_opens: usize,
}

impl MemoryState {
    fn table_mut(&mut self, table: &TableId) -> Result<&mut MemoryTable> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| CdcError::TableNotFound(table.clone()))
    }

    fn table(&self, table: &TableId) -> Result<&MemoryTable> {
        self.tables
            .get(table)
            .ok_or_else(|| CdcError::TableNotFound(table.clone()))
    }

    fn append(
        &mut self,
        table: &TableId,
        op: OperationType,
        before: Option<Vec<CellValue>>,
        after: Option<Vec<CellValue>>,
    ) {
        let position = LogPosition::at(self.log.len() as u64);
        self.log.push(LogEntry {
            position,
            table_id: table.clone(),
            op,
            before,
            after,
            timestamp: Utc::now(),
        });
    }

    fn apply(&mut self, table: &TableId, mutation: Mutation) -> Result<()> {
        let target = self.table_mut(table)?;
        match mutation {
            Mutation::Insert { values } => {
                target.rows.push(values.clone());
                self.append(table, OperationType::Insert, None, Some(values));
            }
            Mutation::Update { key, values } => {
                let index = target.find(&key).ok_or_else(|| {
                    CdcError::QueryError(format!("{}에 키 {:?}인 행이 없습니다", table, key))
                })?;
                let before = std::mem::replace(&mut target.rows[index], values.clone());
                self.append(table, OperationType::Update, Some(before), Some(values));
            }
            Mutation::Delete { key } => {
                let index = target.find(&key).ok_or_else(|| {
                    CdcError::QueryError(format!("{}에 키 {:?}인 행이 없습니다", table, key))
                })?;
                let before = target.rows.remove(index);
                self.append(table, OperationType::Delete, Some(before), None);
            }
        }
        Ok(())
    }
}

/// 공유 가능한 메모리 데이터베이스 핸들
#[derive(Clone, Default)]
pub struct MemoryDatabase {
    state: Arc<Mutex<MemoryState>>,
    log_appended: Arc<Notify>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_table(&self, schema: TableSchema) {
        let table = schema.table_id.clone();
        self.state.lock().tables.insert(
            table,
            MemoryTable {
                schema,
                rows: Vec::new(),
            },
        );
    }

    pub fn insert(&self, table: &TableId, values: Vec<CellValue>) -> Result<()> {
        self.write(table, Mutation::Insert { values })
    }

    pub fn update(&self, table: &TableId, key: &RowKey, values: Vec<CellValue>) -> Result<()> {
        self.write(
            table,
            Mutation::Update {
                key: key.clone(),
                values,
            },
        )
    }

    pub fn delete(&self, table: &TableId, key: &RowKey) -> Result<()> {
        self.write(table, Mutation::Delete { key: key.clone() })
    }

    fn write(&self, table: &TableId, mutation: Mutation) -> Result<()> {
        self.state.lock().apply(table, mutation)?;
        self.log_appended.notify_waiters();
        Ok(())
    }

    /// 다음 범위 스캔이 행을 읽은 직후(high 워터마크 이전)에 이 쓰기들을 적용
    pub fn interleave_on_next_scan(&self, table: &TableId, writes: Vec<Mutation>) {
        self.interleave_on_scan(table, 0, writes);
    }

    /// `skip`번의 범위 스캔을 건너뛰고 그다음 스캔 직후에 이 쓰기들을 적용
    pub fn interleave_on_scan(&self, table: &TableId, skip: usize, writes: Vec<Mutation>) {
        let mut state = self.state.lock();
        state.scans_to_skip.insert(table.clone(), skip);
        state
            .pending_writes
            .entry(table.clone())
            .or_default()
            .extend(writes);
    }

    /// 다음 n번의 로그 읽기를 연결 끊김으로 실패시킴
    pub fn fail_next_log_reads(&self, n: usize) {
        self.state.lock().failing_log_reads = n;
    }

    pub fn fail_discovery(&self, fail: bool) {
        self.state.lock().failing_discovery = fail;
    }

    /// 앞으로 n개의 연결만 허용
    pub fn fail_connections_after(&self, n: usize) {
        self.state.lock().connection_budget = Some(n);
    }

    pub fn open_connections(&self) -> usize {
        self.state.lock().open_connections
    }

    pub fn schema_queries(&self) -> usize {
        self.state.lock().schema_queries
    }

    pub fn log_reader_opens(&self) -> usize {
        self.state.lock().log_reader_opens
    }

    pub fn current_position(&self) -> LogPosition {
        LogPosition::at(self.state.lock().log.len() as u64)
    }

    /// 테이블의 현재 행 (키 순서, 키가 없으면 삽입 순서)
    pub fn rows(&self, table: &TableId) -> Vec<Row> {
        let state = self.state.lock();
        let target = match state.tables.get(table) {
            Some(target) => target,
            None => return Vec::new(),
        };
        let mut rows: Vec<_> = target.decoded().collect();
        rows.sort_by_key(|row| target.schema.row_key(row));
        rows
    }

    pub fn connect(&self) -> Result<MemoryConnection> {
        let mut state = self.state.lock();
        if let Some(budget) = state.connection_budget.as_mut() {
            if *budget == 0 {
                return Err(CdcError::ConnectionError(
                    "연결 한도를 초과했습니다".to_string(),
                ));
            }
            *budget -= 1;
        }
        state.open_connections += 1;
        Ok(MemoryConnection {
            db: self.clone(),
            poll_interval: Duration::from_millis(50),
            closed: false,
        })
    }
}

pub struct MemoryConnection {
    db: MemoryDatabase,
    poll_interval: Duration,
    closed: bool,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(CdcError::ConnectionLost("연결이 이미 닫혔습니다".to_string()))
        } else {
            Ok(())
        }
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.db.state.lock().open_connections -= 1;
        }
    }
}

#[async_trait]
impl SourceConnection for MemoryConnection {
    async fn list_tables(&mut self) -> Result<Vec<TableId>> {
        self.ensure_open()?;
        let state = self.db.state.lock();
        if state.failing_discovery {
            return Err(CdcError::QueryError("메타데이터 조회 실패".to_string()));
        }
        Ok(state.tables.keys().cloned().collect())
    }

    async fn describe_table(&mut self, table: &TableId) -> Result<Option<TableSchema>> {
        self.ensure_open()?;
        let mut state = self.db.state.lock();
        state.schema_queries += 1;
        Ok(state.tables.get(table).map(|t| t.schema.clone()))
    }

    async fn current_position(&mut self) -> Result<LogPosition> {
        self.ensure_open()?;
        Ok(self.db.current_position())
    }

    async fn approximate_row_count(&mut self, table: &TableId) -> Result<u64> {
        self.ensure_open()?;
        let state = self.db.state.lock();
        Ok(state.table(table)?.rows.len() as u64)
    }

    async fn key_bounds(
        &mut self,
        table: &TableId,
        column: &str,
    ) -> Result<Option<(KeyValue, KeyValue)>> {
        self.ensure_open()?;
        let state = self.db.state.lock();
        let keys = state.table(table)?.chunk_keys(column);
        Ok(keys.first().cloned().zip(keys.last().cloned()))
    }

    async fn next_chunk_max(
        &mut self,
        table: &TableId,
        column: &str,
        start: &KeyValue,
        chunk_size: u64,
    ) -> Result<Option<KeyValue>> {
        self.ensure_open()?;
        let state = self.db.state.lock();
        Ok(state
            .table(table)?
            .chunk_keys(column)
            .into_iter()
            .filter(|k| k >= start)
            .take(chunk_size as usize)
            .last())
    }

    async fn min_key_after(
        &mut self,
        table: &TableId,
        column: &str,
        key: &KeyValue,
    ) -> Result<Option<KeyValue>> {
        self.ensure_open()?;
        let state = self.db.state.lock();
        Ok(state
            .table(table)?
            .chunk_keys(column)
            .into_iter()
            .find(|k| k > key))
    }

    async fn scan_range(
        &mut self,
        schema: &TableSchema,
        chunk_column: Option<&str>,
        lower: Option<&KeyValue>,
        upper: Option<&KeyValue>,
    ) -> Result<Vec<Row>> {
        self.ensure_open()?;
        let mut state = self.db.state.lock();
        let target = state.table(&schema.table_id)?;

        let mut rows: Vec<Row> = target
            .decoded()
            .filter(|row| match chunk_column {
                None => true,
                Some(column) => chunk_in_range(schema.chunk_key(row, column).as_ref(), lower, upper),
            })
            .collect();
        rows.sort_by_key(|row| schema.row_key(row));

        let pending = match state.scans_to_skip.get_mut(&schema.table_id) {
            Some(skip) if *skip > 0 => {
                *skip -= 1;
                Vec::new()
            }
            _ => state
                .pending_writes
                .remove(&schema.table_id)
                .unwrap_or_default(),
        };
        let interleaved = !pending.is_empty();
        for mutation in pending {
            state.apply(&schema.table_id, mutation)?;
        }
        drop(state);
        if interleaved {
            self.db.log_appended.notify_waiters();
        }

        Ok(rows)
    }

    async fn open_log_reader(&mut self, start: Option<LogPosition>) -> Result<Box<dyn LogReader>> {
        self.ensure_open()?;
        let next = match start {
            Some(position) => position.position as usize,
            None => self.db.state.lock().log.len(),
        };
        self.db.state.lock().log_reader_opens += 1;
        debug!("Opened memory log reader at {}", next);
        Ok(Box::new(MemoryLogReader {
            db: self.db.clone(),
            next,
            position: LogPosition::at(next as u64),
            poll_interval: self.poll_interval,
            closed: false,
        }))
    }

    async fn close(&mut self) -> Result<()> {
        if !self.closed {
            self.closed = true;
            self.db.state.lock().open_connections -= 1;
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}

pub struct MemoryLogReader {
    db: MemoryDatabase,
    next: usize,
    position: LogPosition,
    poll_interval: Duration,
    closed: bool,
}

impl MemoryLogReader {
    fn take_batch(&mut self) -> Result<Vec<LogEntry>> {
        let mut state = self.db.state.lock();
        if state.failing_log_reads > 0 {
            state.failing_log_reads -= 1;
            return Err(CdcError::ConnectionLost("로그 스트림이 끊어졌습니다".to_string()));
        }
        let end = state.log.len().min(self.next + MAX_BATCH);
        let batch = state
            .log
            .get(self.next..end)
            .map(<[LogEntry]>::to_vec)
            .unwrap_or_default();
        self.next += batch.len();
        self.position = LogPosition::at(self.next as u64);
        Ok(batch)
    }
}

#[async_trait]
impl LogReader for MemoryLogReader {
    async fn read_entries(&mut self) -> Result<Vec<LogEntry>> {
        if self.closed {
            return Err(CdcError::ConnectionLost("로그 리더가 닫혔습니다".to_string()));
        }

        let notify = self.db.log_appended.clone();
        let appended = notify.notified();
        let batch = self.take_batch()?;
        if !batch.is_empty() {
            return Ok(batch);
        }

        let _ = tokio::time::timeout(self.poll_interval, appended).await;
        self.take_batch()
    }

    fn position(&self) -> &LogPosition {
        &self.position
    }

    async fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

pub struct MemoryPool {
    db: MemoryDatabase,
}

#[async_trait]
impl ConnectionPool for MemoryPool {
    async fn acquire(&self) -> Result<Box<dyn SourceConnection>> {
        Ok(Box::new(self.db.connect()?))
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }
}

pub struct MemoryPoolFactory {
    db: MemoryDatabase,
}

impl ConnectionPoolFactory for MemoryPoolFactory {
    fn create_pool(&self, config: &ConnectionConfig) -> Result<Arc<dyn ConnectionPool>> {
        debug!("Creating memory pool for {}", config.hostname);
        Ok(Arc::new(MemoryPool {
            db: self.db.clone(),
        }))
    }
}

pub struct MemoryDialect {
    db: MemoryDatabase,
    schema_cache: SchemaCache,
    case_sensitive: bool,
}

impl MemoryDialect {
    pub fn new(db: MemoryDatabase) -> Self {
        Self::with_case_sensitivity(db, true)
    }

    pub fn with_case_sensitivity(db: MemoryDatabase, case_sensitive: bool) -> Self {
        MemoryDialect {
            db,
            schema_cache: SchemaCache::new(case_sensitive),
            case_sensitive,
        }
    }

    pub fn database(&self) -> &MemoryDatabase {
        &self.db
    }
}

#[async_trait]
impl Dialect for MemoryDialect {
    fn name(&self) -> &str {
        "memory"
    }

    fn is_case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    fn schema_cache(&self) -> &SchemaCache {
        &self.schema_cache
    }

    async fn open_connection(&self, config: &SourceConfig) -> Result<Box<dyn SourceConnection>> {
        let mut connection = self.db.connect()?;
        connection.poll_interval = config.poll_interval();
        Ok(Box::new(connection))
    }

    fn pooled_connection_factory(&self) -> Arc<dyn ConnectionPoolFactory> {
        Arc::new(MemoryPoolFactory {
            db: self.db.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Column, ColumnType};

    fn schema() -> TableSchema {
        TableSchema::new(
            TableId::new("shop", "orders"),
            vec![
                Column::new("id", ColumnType::Integer).not_null(),
                Column::new("qty", ColumnType::Integer),
            ],
            vec!["id".to_string()],
        )
    }

    fn key(id: i64) -> RowKey {
        RowKey(vec![KeyValue::Int(id)])
    }

    #[tokio::test]
    async fn test_writes_are_logged_in_order() {
        let db = MemoryDatabase::new();
        let table = schema().table_id;
        db.create_table(schema());

        db.insert(&table, vec![CellValue::Int64(1), CellValue::Int64(10)]).unwrap();
        db.update(&table, &key(1), vec![CellValue::Int64(1), CellValue::Int64(11)])
            .unwrap();
        db.delete(&table, &key(1)).unwrap();
        assert!(db.delete(&table, &key(1)).is_err());

        let mut conn = db.connect().unwrap();
        let mut reader = conn.open_log_reader(Some(LogPosition::at(0))).await.unwrap();
        let entries = reader.read_entries().await.unwrap();

        let ops: Vec<_> = entries.iter().map(|e| e.op).collect();
        assert_eq!(
            ops,
            vec![OperationType::Insert, OperationType::Update, OperationType::Delete]
        );
        assert_eq!(entries[1].before.as_ref().unwrap()[1], CellValue::Int64(10));
        assert_eq!(*reader.position(), db.current_position());
        assert!(db.rows(&table).is_empty());
    }

    #[tokio::test]
    async fn test_reader_wakes_on_new_writes() {
        let db = MemoryDatabase::new();
        let table = schema().table_id;
        db.create_table(schema());

        let mut conn = db.connect().unwrap();
        let mut reader = conn.open_log_reader(None).await.unwrap();
        let writer = db.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            writer
                .insert(&table, vec![CellValue::Int64(7), CellValue::Null])
                .unwrap();
        });

        let mut entries = Vec::new();
        while entries.is_empty() {
            entries = reader.read_entries().await.unwrap();
        }
        handle.await.unwrap();
        assert_eq!(entries[0].position, LogPosition::at(0));
    }

    #[tokio::test]
    async fn test_scan_reads_null_chunk_keys_in_first_range() {
        let db = MemoryDatabase::new();
        let table = schema().table_id;
        db.create_table(schema());
        db.insert(&table, vec![CellValue::Int64(1), CellValue::Null]).unwrap();
        db.insert(&table, vec![CellValue::Int64(2), CellValue::Int64(5)]).unwrap();
        db.insert(&table, vec![CellValue::Int64(3), CellValue::Int64(20)]).unwrap();

        let mut conn = db.connect().unwrap();
        let bound = KeyValue::Int(10);
        let first = conn.scan_range(&schema(), Some("qty"), None, Some(&bound)).await.unwrap();
        let rest = conn.scan_range(&schema(), Some("qty"), Some(&bound), None).await.unwrap();

        let ids = |rows: &[Row]| -> Vec<CellValue> { rows.iter().map(|r| r["id"].clone()).collect() };
        assert_eq!(ids(&first), vec![CellValue::Int64(1), CellValue::Int64(2)]);
        assert_eq!(ids(&rest), vec![CellValue::Int64(3)]);
    }

    #[tokio::test]
    async fn test_interleave_after_skipped_scans() {
        let db = MemoryDatabase::new();
        let table = schema().table_id;
        db.create_table(schema());
        db.insert(&table, vec![CellValue::Int64(1), CellValue::Int64(1)]).unwrap();
        db.interleave_on_scan(&table, 1, vec![Mutation::Delete { key: key(1) }]);

        let mut conn = db.connect().unwrap();
        conn.scan_range(&schema(), None, None, None).await.unwrap();
        assert_eq!(db.current_position(), LogPosition::at(1));
        let rows = conn.scan_range(&schema(), None, None, None).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(db.current_position(), LogPosition::at(2));
        assert!(db.rows(&table).is_empty());
    }

    #[tokio::test]
    async fn test_connection_accounting() {
        let db = MemoryDatabase::new();
        let first = db.connect().unwrap();
        let mut second = db.connect().unwrap();
        assert_eq!(db.open_connections(), 2);

        drop(first);
        second.close().await.unwrap();
        second.close().await.unwrap();
        assert_eq!(db.open_connections(), 0);
        assert!(second.list_tables().await.is_err());

        db.fail_connections_after(0);
        assert!(db.connect().is_err());
    }
}
