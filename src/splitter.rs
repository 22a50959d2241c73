//! 청크 분할기
//!
//! 테이블의 키 도메인을 `[start, end)` 범위들로 나눕니다. 첫 범위의 시작과 마지막 범위의
//! 끝은 열려 있으므로 범위들의 합집합은 항상 키 도메인 전체이며 서로 겹치지 않습니다.
//!
//! - 정수 키이고 분포가 고르면 (max - min + 1) / 행 수 비율로 산술 분할
//! - 그 외에는 "chunk_size번째 키" 조회를 반복하여 분할
//! - 키가 없거나 행 수가 적으면 단일 split

use crate::config::SourceConfig;
use crate::dialect::SourceConnection;
use crate::error::{CdcError, Result};
use crate::events::KeyValue;
use crate::split::SnapshotSplit;
use crate::table::{Column, TableId, TableSchema};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// 분할 결과 범위 하나
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub start: Option<KeyValue>,
    pub end: Option<KeyValue>,
}

impl ChunkRange {
    pub fn new(start: Option<KeyValue>, end: Option<KeyValue>) -> Self {
        ChunkRange { start, end }
    }

    pub fn all() -> Self {
        ChunkRange::new(None, None)
    }
}

#[derive(Debug, Clone)]
pub struct ChunkSplitter {
    chunk_size: u64,
    split_threshold: u64,
    distribution_factor_lower: f64,
    distribution_factor_upper: f64,
    chunk_key_columns: HashMap<String, String>,
}

impl ChunkSplitter {
    pub fn new(config: &SourceConfig) -> Self {
        ChunkSplitter {
            chunk_size: config.chunk_size,
            split_threshold: config.split_threshold,
            distribution_factor_lower: config.distribution_factor_lower,
            distribution_factor_upper: config.distribution_factor_upper,
            chunk_key_columns: config.chunk_key_columns.clone(),
        }
    }

    /// 테이블 하나를 스냅샷 split 목록으로 분할
    ///
    /// 키 타입을 지원하지 않거나 키가 없으면 경고 후 단일 split으로 대체합니다.
    pub async fn generate_splits(
        &self,
        conn: &mut dyn SourceConnection,
        schema: &TableSchema,
    ) -> Result<Vec<SnapshotSplit>> {
        let table = &schema.table_id;
        let (column, ranges) = match self.split_chunks(conn, schema).await {
            Ok(split) => split,
            Err(CdcError::SplitError { reason, .. }) => {
                warn!(
                    "Cannot split {} ({}), falling back to a single snapshot split",
                    table, reason
                );
                return Ok(vec![SnapshotSplit::unbounded(table.clone())]);
            }
            Err(e) => return Err(e),
        };

        let splits: Vec<SnapshotSplit> = ranges
            .into_iter()
            .enumerate()
            .map(|(id, range)| {
                SnapshotSplit::new(table.clone(), id, Some(column.clone()), range.start, range.end)
            })
            .collect();

        info!("Split {} into {} snapshot splits", table, splits.len());
        Ok(splits)
    }

    /// 청크 키 컬럼과 범위 목록. 키 타입을 지원하지 않으면 `SplitError`
    pub async fn split_chunks(
        &self,
        conn: &mut dyn SourceConnection,
        schema: &TableSchema,
    ) -> Result<(String, Vec<ChunkRange>)> {
        let table = &schema.table_id;
        let configured = self.chunk_key_columns.get(&table.to_string()).map(String::as_str);
        let column = schema.chunk_key_column(configured)?;

        if !column.column_type.is_splittable() {
            return Err(CdcError::SplitError {
                table: table.clone(),
                reason: format!(
                    "컬럼 '{}'의 타입 {:?}은(는) 범위 비교를 지원하지 않습니다",
                    column.name, column.column_type
                ),
            });
        }

        let row_count = conn.approximate_row_count(table).await?;
        if row_count <= self.chunk_size || row_count < self.split_threshold {
            debug!("{} has ~{} rows, using a single split", table, row_count);
            return Ok((column.name.clone(), vec![ChunkRange::all()]));
        }

        let (min, max) = match conn.key_bounds(table, &column.name).await? {
            Some((min, max)) => (
                column.column_type.coerce_key(min),
                column.column_type.coerce_key(max),
            ),
            None => return Ok((column.name.clone(), vec![ChunkRange::all()])),
        };

        let ranges = match self.even_chunk_size(column, &min, &max, row_count) {
            Some(size) => {
                debug!("Splitting {} evenly with chunk size {}", table, size);
                split_evenly(&min, &max, size)
            }
            None => self.split_unevenly(conn, table, column, &min, &max).await?,
        };
        Ok((column.name.clone(), ranges))
    }

    /// 균등 분할이 가능하면 키 간격 기준 청크 크기
    fn even_chunk_size(
        &self,
        column: &Column,
        min: &KeyValue,
        max: &KeyValue,
        row_count: u64,
    ) -> Option<i128> {
        if !column.column_type.is_integral() {
            return None;
        }
        let (min, max) = (min.as_i128()?, max.as_i128()?);
        let factor = (max - min + 1) as f64 / row_count as f64;
        if factor < self.distribution_factor_lower || factor > self.distribution_factor_upper {
            return None;
        }
        Some(((factor * self.chunk_size as f64) as i128).max(1))
    }

    async fn split_unevenly(
        &self,
        conn: &mut dyn SourceConnection,
        table: &TableId,
        column: &Column,
        min: &KeyValue,
        max: &KeyValue,
    ) -> Result<Vec<ChunkRange>> {
        let mut ranges = Vec::new();
        let mut chunk_start: Option<KeyValue> = None;
        let mut chunk_end = self.next_chunk_end(conn, table, column, min, max).await?;

        while let Some(end) = chunk_end {
            ranges.push(ChunkRange::new(chunk_start.take(), Some(end.clone())));
            chunk_end = self.next_chunk_end(conn, table, column, &end, max).await?;
            chunk_start = Some(end);
        }
        ranges.push(ChunkRange::new(chunk_start, None));
        Ok(ranges)
    }

    /// 다음 청크 끝. 최대 키에 도달하면 None (마지막 범위는 열린 끝)
    async fn next_chunk_end(
        &self,
        conn: &mut dyn SourceConnection,
        table: &TableId,
        column: &Column,
        previous: &KeyValue,
        max: &KeyValue,
    ) -> Result<Option<KeyValue>> {
        let coerce = |key: KeyValue| column.column_type.coerce_key(key);
        let mut end = conn
            .next_chunk_max(table, &column.name, previous, self.chunk_size)
            .await?
            .map(coerce);
        // 같은 키가 chunk_size개 이상이면 제자리걸음을 하므로 다음 키로 이동
        if end.as_ref() == Some(previous) {
            end = conn
                .min_key_after(table, &column.name, previous)
                .await?
                .map(coerce);
        }
        Ok(end.filter(|e| e < max))
    }
}

/// `[min, max]`를 `size` 간격으로 분할
fn split_evenly(min: &KeyValue, max: &KeyValue, size: i128) -> Vec<ChunkRange> {
    let (min, max) = match (min.as_i128(), max.as_i128()) {
        (Some(min), Some(max)) => (min, max),
        _ => return vec![ChunkRange::all()],
    };

    let mut ranges = Vec::new();
    let mut chunk_start: Option<KeyValue> = None;
    let mut chunk_end = min + size;
    while chunk_end <= max {
        let end = KeyValue::from_i128(chunk_end);
        ranges.push(ChunkRange::new(chunk_start.take(), end.clone()));
        chunk_start = end;
        chunk_end += size;
    }
    ranges.push(ChunkRange::new(chunk_start, None));
    ranges
}
