//! Split 모델
//!
//! - `SnapshotSplit`: 테이블 하나의 키 범위 `[lower, upper)`, 경계가 None이면 열린 범위
//! - `IncrementalSplit`: 여러 테이블의 로그 스트리밍 (실행당 하나)

use crate::events::{chunk_in_range, KeyValue, Row};
use crate::offset::LogPosition;
use crate::table::{TableId, TableSchema};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub const INCREMENTAL_SPLIT_ID: &str = "incremental-split";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SplitKind {
    Snapshot,
    Incremental,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSplit {
    pub table_id: TableId,
    /// 테이블 내 순번 (0부터)
    pub split_id: usize,
    /// 범위 비교에 쓰는 컬럼. None이면 테이블 전체를 한 번에 읽음
    pub chunk_column: Option<String>,
    pub lower: Option<KeyValue>,
    pub upper: Option<KeyValue>,
}

impl SnapshotSplit {
    pub fn new(
        table_id: TableId,
        split_id: usize,
        chunk_column: Option<String>,
        lower: Option<KeyValue>,
        upper: Option<KeyValue>,
    ) -> Self {
        SnapshotSplit {
            table_id,
            split_id,
            chunk_column,
            lower,
            upper,
        }
    }

    /// 테이블 전체를 덮는 단일 split
    pub fn unbounded(table_id: TableId) -> Self {
        SnapshotSplit::new(table_id, 0, None, None, None)
    }

    /// 체크포인트/로그용 고유 키 (e.g. "shop.orders:3")
    pub fn split_key(&self) -> String {
        format!("{}:{}", self.table_id, self.split_id)
    }

    pub fn is_unbounded(&self) -> bool {
        self.lower.is_none() && self.upper.is_none()
    }

    /// 청크 키가 범위에 속하는지. NULL 키는 첫 split에 속함
    pub fn contains(&self, key: Option<&KeyValue>) -> bool {
        chunk_in_range(key, self.lower.as_ref(), self.upper.as_ref())
    }
}

impl fmt::Display for SnapshotSplit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bound = |b: &Option<KeyValue>| b.as_ref().map_or("∞".to_string(), |k| k.to_string());
        write!(
            f,
            "{} [{}, {})",
            self.split_key(),
            bound(&self.lower),
            bound(&self.upper)
        )
    }
}

/// 완료된 스냅샷 split의 범위와 high 워터마크
///
/// 증분 단계에서 이 범위의 키에 대한 변경 중 high 워터마크 이전 것은 이미 스냅샷 결과에
/// 반영되어 있으므로 건너뜁니다.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishedSplitInfo {
    pub table_id: TableId,
    pub split_id: usize,
    pub chunk_column: Option<String>,
    pub lower: Option<KeyValue>,
    pub upper: Option<KeyValue>,
    pub high_watermark: LogPosition,
}

impl FinishedSplitInfo {
    pub fn new(split: &SnapshotSplit, high_watermark: LogPosition) -> Self {
        FinishedSplitInfo {
            table_id: split.table_id.clone(),
            split_id: split.split_id,
            chunk_column: split.chunk_column.clone(),
            lower: split.lower.clone(),
            upper: split.upper.clone(),
            high_watermark,
        }
    }

    fn covers(&self, schema: &TableSchema, row: &Row) -> bool {
        match &self.chunk_column {
            None => true,
            Some(column) => chunk_in_range(
                schema.chunk_key(row, column).as_ref(),
                self.lower.as_ref(),
                self.upper.as_ref(),
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalSplit {
    pub split_id: String,
    pub table_ids: Vec<TableId>,
    /// 시작 로그 위치. None이면 현재 위치부터
    pub start: Option<LogPosition>,
    #[serde(default)]
    pub finished_splits: Vec<FinishedSplitInfo>,
}

impl IncrementalSplit {
    pub fn new(table_ids: Vec<TableId>, start: Option<LogPosition>) -> Self {
        IncrementalSplit {
            split_id: INCREMENTAL_SPLIT_ID.to_string(),
            table_ids,
            start,
            finished_splits: Vec::new(),
        }
    }

    pub fn with_finished_splits(mut self, finished: Vec<FinishedSplitInfo>) -> Self {
        self.finished_splits = finished;
        self
    }

    pub fn includes(&self, table: &TableId, case_sensitive: bool) -> bool {
        let wanted = table.normalized(case_sensitive);
        self.table_ids
            .iter()
            .any(|t| t.normalized(case_sensitive) == wanted)
    }

    /// 행 이미지 하나에 대한 로그 변경을 내보내야 하는지
    ///
    /// 행이 완료된 스냅샷 split 범위에 속하고 위치가 그 split의 high 워터마크보다 앞서면
    /// 이미 스냅샷에 반영된 것이므로 false. 키를 바꾸는 UPDATE는 이전/이후 이미지가 서로
    /// 다른 split에 속할 수 있으므로 이미지마다 따로 판단해야 합니다.
    pub fn should_emit(
        &self,
        schema: &TableSchema,
        row: &Row,
        position: &LogPosition,
        case_sensitive: bool,
    ) -> bool {
        let table = schema.table_id.normalized(case_sensitive);
        let mut finished = self
            .finished_splits
            .iter()
            .filter(|f| f.table_id.normalized(case_sensitive) == table)
            .peekable();

        if finished.peek().is_none() {
            return true;
        }

        finished
            .find(|f| f.covers(schema, row))
            .map_or(true, |f| *position >= f.high_watermark)
    }
}

/// 스케줄러가 워커에 배정하는 작업 단위
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SourceSplit {
    Snapshot(SnapshotSplit),
    Incremental(IncrementalSplit),
}

impl SourceSplit {
    pub fn kind(&self) -> SplitKind {
        match self {
            SourceSplit::Snapshot(_) => SplitKind::Snapshot,
            SourceSplit::Incremental(_) => SplitKind::Incremental,
        }
    }

    pub fn split_id(&self) -> String {
        match self {
            SourceSplit::Snapshot(s) => s.split_key(),
            SourceSplit::Incremental(s) => s.split_id.clone(),
        }
    }

    /// 참조하는 테이블 (중복 제거, 정렬)
    pub fn table_ids(&self) -> Vec<&TableId> {
        match self {
            SourceSplit::Snapshot(s) => vec![&s.table_id],
            SourceSplit::Incremental(s) => s
                .table_ids
                .iter()
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        }
    }

    pub fn as_snapshot(&self) -> Option<&SnapshotSplit> {
        match self {
            SourceSplit::Snapshot(s) => Some(s),
            SourceSplit::Incremental(_) => None,
        }
    }
}

impl From<SnapshotSplit> for SourceSplit {
    fn from(split: SnapshotSplit) -> Self {
        SourceSplit::Snapshot(split)
    }
}

impl From<IncrementalSplit> for SourceSplit {
    fn from(split: IncrementalSplit) -> Self {
        SourceSplit::Incremental(split)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CellValue;
    use crate::table::{Column, ColumnType};

    fn schema() -> TableSchema {
        TableSchema::new(
            TableId::new("shop", "orders"),
            vec![Column::new("id", ColumnType::Integer)],
            vec!["id".to_string()],
        )
    }

    fn row(id: i64) -> Row {
        Row::from([("id".to_string(), CellValue::Int64(id))])
    }

    fn split(id: usize, lower: Option<i64>, upper: Option<i64>) -> SnapshotSplit {
        SnapshotSplit::new(
            TableId::new("shop", "orders"),
            id,
            Some("id".to_string()),
            lower.map(KeyValue::Int),
            upper.map(KeyValue::Int),
        )
    }

    #[test]
    fn test_split_kind_and_ids() {
        let snapshot: SourceSplit = split(3, Some(10), Some(20)).into();
        assert_eq!(snapshot.kind(), SplitKind::Snapshot);
        assert_eq!(snapshot.split_id(), "shop.orders:3");

        let incremental: SourceSplit = IncrementalSplit::new(
            vec![TableId::new("shop", "b"), TableId::new("shop", "a"), TableId::new("shop", "b")],
            None,
        )
        .into();
        assert_eq!(incremental.kind(), SplitKind::Incremental);
        assert_eq!(incremental.table_ids().len(), 2);
        assert!(incremental.as_snapshot().is_none());
    }

    #[test]
    fn test_should_emit_filters_finished_ranges() {
        let finished = vec![
            FinishedSplitInfo::new(&split(0, None, Some(100)), LogPosition::at(50)),
            FinishedSplitInfo::new(&split(1, Some(100), None), LogPosition::at(80)),
        ];
        let incremental = IncrementalSplit::new(vec![TableId::new("shop", "orders")], None)
            .with_finished_splits(finished);
        let schema = schema();

        // split 0 범위, high 워터마크 이전 → 이미 반영됨
        assert!(!incremental.should_emit(&schema, &row(5), &LogPosition::at(40), true));
        assert!(incremental.should_emit(&schema, &row(5), &LogPosition::at(50), true));
        // split 1 범위는 high 워터마크가 더 늦음
        assert!(!incremental.should_emit(&schema, &row(150), &LogPosition::at(60), true));
        assert!(incremental.should_emit(&schema, &row(150), &LogPosition::at(80), true));
    }

    #[test]
    fn test_should_emit_judges_each_image_of_key_change() {
        let finished = vec![
            FinishedSplitInfo::new(&split(0, None, Some(3)), LogPosition::at(4)),
            FinishedSplitInfo::new(&split(1, Some(3), None), LogPosition::at(5)),
        ];
        let incremental = IncrementalSplit::new(vec![TableId::new("shop", "orders")], None)
            .with_finished_splits(finished);
        let schema = schema();
        let position = LogPosition::at(4);

        // id 1 → 10: split 0은 이동 전 행을 내보냈고 split 1은 이동 후 행을 이미 담음
        assert!(incremental.should_emit(&schema, &row(1), &position, true));
        assert!(!incremental.should_emit(&schema, &row(10), &position, true));
    }

    #[test]
    fn test_null_chunk_key_belongs_to_first_split() {
        let schema = TableSchema::new(
            TableId::new("shop", "orders"),
            vec![
                Column::new("id", ColumnType::Integer).not_null(),
                Column::new("code", ColumnType::Integer),
            ],
            vec!["id".to_string()],
        );
        let by_code = |id: usize, lower: Option<i64>, upper: Option<i64>| {
            SnapshotSplit::new(
                TableId::new("shop", "orders"),
                id,
                Some("code".to_string()),
                lower.map(KeyValue::Int),
                upper.map(KeyValue::Int),
            )
        };
        assert!(by_code(0, None, Some(10)).contains(None));
        assert!(!by_code(1, Some(10), None).contains(None));

        let incremental = IncrementalSplit::new(vec![TableId::new("shop", "orders")], None)
            .with_finished_splits(vec![
                FinishedSplitInfo::new(&by_code(0, None, Some(10)), LogPosition::at(7)),
                FinishedSplitInfo::new(&by_code(1, Some(10), None), LogPosition::at(3)),
            ]);
        let null_row = Row::from([
            ("id".to_string(), CellValue::Int64(1)),
            ("code".to_string(), CellValue::Null),
        ]);
        assert!(!incremental.should_emit(&schema, &null_row, &LogPosition::at(5), true));
        assert!(incremental.should_emit(&schema, &null_row, &LogPosition::at(7), true));
    }

    #[test]
    fn test_should_emit_without_finished_splits() {
        let incremental = IncrementalSplit::new(vec![TableId::new("shop", "orders")], None);
        assert!(incremental.should_emit(&schema(), &row(1), &LogPosition::at(0), true));
        assert!(incremental.includes(&TableId::new("SHOP", "Orders"), false));
        assert!(!incremental.includes(&TableId::new("SHOP", "Orders"), true));
    }

    #[test]
    fn test_split_json_roundtrip() {
        let original = SourceSplit::Snapshot(split(2, Some(1), None));
        let json = serde_json::to_string(&original).unwrap();
        let restored: SourceSplit = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, original);
    }
}
