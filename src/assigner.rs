//! Split 할당기
//!
//! 테이블 디스커버리와 청크 분할로 스냅샷 split 목록을 만들고, 완료된 split의 워터마크를
//! 모아 증분 split을 구성합니다. 상태는 직렬화해서 체크포인트로 저장할 수 있습니다.

use crate::config::SourceConfig;
use crate::dialect::{Dialect, SourceConnection};
use crate::error::{CdcError, Result};
use crate::offset::{LogPosition, SplitWatermark};
use crate::split::{FinishedSplitInfo, IncrementalSplit, SnapshotSplit};
use crate::table::TableId;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tracing::{debug, info};

/// 체크포인트로 저장하는 할당기 상태
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignerState {
    pub tables: Vec<TableId>,
    /// 분할 계획 시점의 로그 위치
    pub start_position: Option<LogPosition>,
    /// 아직 완료되지 않은 split (실행 중이던 것 포함)
    pub remaining: Vec<SnapshotSplit>,
    pub finished: Vec<FinishedSplitInfo>,
}

#[derive(Debug, Default)]
pub struct SplitAssigner {
    tables: Vec<TableId>,
    start_position: Option<LogPosition>,
    pending: VecDeque<SnapshotSplit>,
    in_flight: HashMap<String, SnapshotSplit>,
    finished: BTreeMap<String, FinishedSplitInfo>,
}

impl SplitAssigner {
    /// 대상 테이블을 찾고 각 테이블을 split으로 나눔
    ///
    /// 시작 위치는 어떤 스냅샷 스캔보다도 먼저 기록되므로 이후의 변경을 놓치지 않습니다.
    pub async fn plan(
        dialect: &dyn Dialect,
        config: &SourceConfig,
        conn: &mut dyn SourceConnection,
    ) -> Result<Self> {
        let tables = dialect.discover_tables(config).await?;
        let start_position = conn.current_position().await?;
        let splitter = dialect.create_chunk_splitter(config);

        let mut pending = VecDeque::new();
        for table in &tables {
            let schema = dialect.query_table_schema(conn, table).await?;
            let splits = splitter.generate_splits(conn, &schema).await?;
            debug!("{} planned as {} splits", table, splits.len());
            pending.extend(splits);
        }

        info!(
            "Planned {} snapshot splits for {} tables, log position {}",
            pending.len(),
            tables.len(),
            start_position
        );

        Ok(SplitAssigner {
            tables,
            start_position: Some(start_position),
            pending,
            ..Default::default()
        })
    }

    /// 스냅샷 없이 스트리밍만 하는 할당기
    pub fn streaming_only(tables: Vec<TableId>, start: Option<LogPosition>) -> Self {
        SplitAssigner {
            tables,
            start_position: start,
            ..Default::default()
        }
    }

    pub fn restore(state: AssignerState) -> Self {
        let finished = state
            .finished
            .into_iter()
            .map(|info| (format!("{}:{}", info.table_id, info.split_id), info))
            .collect();
        SplitAssigner {
            tables: state.tables,
            start_position: state.start_position,
            pending: state.remaining.into(),
            in_flight: HashMap::new(),
            finished,
        }
    }

    /// 실행 중인 split은 미완료로 저장 (복구 후 처음부터 다시 실행)
    pub fn snapshot_state(&self) -> AssignerState {
        let mut in_flight: Vec<_> = self.in_flight.values().cloned().collect();
        in_flight.sort_by(|a, b| (&a.table_id, a.split_id).cmp(&(&b.table_id, b.split_id)));

        AssignerState {
            tables: self.tables.clone(),
            start_position: self.start_position.clone(),
            remaining: in_flight
                .into_iter()
                .chain(self.pending.iter().cloned())
                .collect(),
            finished: self.finished.values().cloned().collect(),
        }
    }

    pub fn tables(&self) -> &[TableId] {
        &self.tables
    }

    pub fn next_split(&mut self) -> Option<SnapshotSplit> {
        let split = self.pending.pop_front()?;
        self.in_flight.insert(split.split_key(), split.clone());
        Some(split)
    }

    pub fn on_split_finished(&mut self, split_key: &str, watermark: &SplitWatermark) -> Result<()> {
        let split = self.in_flight.remove(split_key).ok_or_else(|| {
            CdcError::Other(format!("할당되지 않은 split 완료 보고: {}", split_key))
        })?;
        self.finished.insert(
            split_key.to_string(),
            FinishedSplitInfo::new(&split, watermark.high.clone()),
        );
        Ok(())
    }

    /// 실패한 split을 대기열 앞으로 되돌림
    pub fn on_split_failed(&mut self, split_key: &str) {
        if let Some(split) = self.in_flight.remove(split_key) {
            self.pending.push_front(split);
        }
    }

    pub fn remaining(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    pub fn finished_count(&self) -> usize {
        self.finished.len()
    }

    pub fn is_snapshot_finished(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    /// 남은 로그 변경을 처리할 증분 split
    ///
    /// 모든 스냅샷 split이 끝났으면 가장 이른 high 워터마크부터 읽습니다. 그보다 앞선 변경은
    /// 모든 split에 이미 반영되어 있습니다.
    pub fn incremental_split(&self) -> IncrementalSplit {
        let start = if self.is_snapshot_finished() {
            self.finished
                .values()
                .map(|f| &f.high_watermark)
                .min()
                .cloned()
                .or_else(|| self.start_position.clone())
        } else {
            self.start_position.clone()
        };

        IncrementalSplit::new(self.tables.clone(), start)
            .with_finished_splits(self.finished.values().cloned().collect())
    }
}
