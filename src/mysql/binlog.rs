//! MySQL Binlog 리더
//!
//! 복제 클라이언트로 접속해 ROW 포맷 이벤트를 `LogEntry`로 변환합니다.
//! 테이블 필터링은 하지 않습니다 (fetch 태스크 소관).

use super::value_to_cell;
use crate::dialect::LogReader;
use crate::error::{CdcError, Result};
use crate::events::{CellValue, LogEntry, OperationType};
use crate::offset::LogPosition;
use crate::table::TableId;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use futures::{FutureExt, StreamExt};
use mysql_async::binlog::events::{Event, EventData};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Opts};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// 한 번의 `read_entries`에서 반환할 최대 변경 수
const MAX_BATCH: usize = 512;

pub struct MySqlBinlogReader {
    stream: Option<BinlogStream>,
    /// 마지막으로 끝까지 읽은 트랜잭션의 다음 위치
    position: LogPosition,
    poll_interval: Duration,
}

impl MySqlBinlogReader {
    pub async fn open(
        opts: Opts,
        server_id: u32,
        start: LogPosition,
        poll_interval: Duration,
    ) -> Result<Self> {
        let conn = Conn::new(opts)
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect binlog client: {}", e)))?;

        let request = BinlogStreamRequest::new(server_id)
            .with_filename(start.file.as_bytes())
            .with_pos(start.position);
        let stream = conn
            .get_binlog_stream(request)
            .await
            .map_err(|e| CdcError::LogReadError(format!("Failed to request binlog dump: {}", e)))?;

        debug!("Binlog stream opened at {} (server_id {})", start, server_id);
        Ok(MySqlBinlogReader {
            stream: Some(stream),
            position: start,
            poll_interval,
        })
    }
}

#[async_trait]
impl LogReader for MySqlBinlogReader {
    async fn read_entries(&mut self) -> Result<Vec<LogEntry>> {
        let MySqlBinlogReader {
            stream,
            position,
            poll_interval,
        } = self;
        let stream = stream
            .as_mut()
            .ok_or_else(|| CdcError::ConnectionLost("binlog 스트림이 닫혔습니다".to_string()))?;

        let mut entries = Vec::new();
        let first = match tokio::time::timeout(*poll_interval, stream.next()).await {
            Err(_) => return Ok(entries),
            Ok(None) => {
                return Err(CdcError::ConnectionLost(
                    "binlog 스트림이 종료되었습니다".to_string(),
                ))
            }
            Ok(Some(event)) => event?,
        };
        handle_event(stream, position, first, &mut entries)?;

        // 이미 도착한 이벤트만 이어서 처리
        while entries.len() < MAX_BATCH {
            match stream.next().now_or_never() {
                Some(Some(event)) => handle_event(stream, position, event?, &mut entries)?,
                Some(None) | None => break,
            }
        }

        trace!("Read {} binlog entries up to {}", entries.len(), position);
        Ok(entries)
    }

    fn position(&self) -> &LogPosition {
        &self.position
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            if let Err(e) = stream.close().await {
                warn!("Failed to close binlog stream: {}", e);
            }
        }
        Ok(())
    }
}

fn handle_event(
    stream: &BinlogStream,
    position: &mut LogPosition,
    event: Event,
    entries: &mut Vec<LogEntry>,
) -> Result<()> {
    let header = event.header();
    let log_pos = header.log_pos() as u64;
    let timestamp = event_time(header.timestamp());

    let data = event
        .read_data()
        .map_err(|e| CdcError::LogReadError(format!("Failed to parse binlog event: {}", e)))?;

    let mut boundary = false;
    match data {
        Some(EventData::RotateEvent(rotate)) => {
            *position = LogPosition::new(rotate.name().into_owned(), rotate.position());
            debug!("Binlog rotated to {}", position);
            return Ok(());
        }
        Some(EventData::RowsEvent(rows_event)) => {
            let tme = stream.get_tme(rows_event.table_id()).ok_or_else(|| {
                CdcError::LogReadError(format!(
                    "TABLE_MAP 이벤트 없이 ROWS 이벤트 수신 (table_id {})",
                    rows_event.table_id()
                ))
            })?;
            let table_id = TableId::new(tme.database_name().into_owned(), tme.table_name().into_owned());
            let column_count = tme.columns_count() as usize;
            let entry_position = LogPosition::new(
                position.file.clone(),
                event_start(log_pos, header.event_size() as u64),
            );

            for row in rows_event.rows(tme) {
                let (before, after) = row.map_err(|e| {
                    CdcError::LogReadError(format!("Failed to decode rows of {}: {}", table_id, e))
                })?;
                let before = before.map(|r| row_values(r, column_count)).transpose()?;
                let after = after.map(|r| row_values(r, column_count)).transpose()?;
                let Some(op) = row_op(before.is_some(), after.is_some()) else {
                    continue;
                };

                entries.push(LogEntry {
                    position: entry_position.clone(),
                    table_id: table_id.clone(),
                    op,
                    before,
                    after,
                    timestamp,
                });
            }
        }
        // 트랜잭션 경계: COMMIT(XID) 또는 BEGIN 이외의 쿼리 (DDL, 비트랜잭션 엔진의 COMMIT)
        Some(EventData::XidEvent(_)) => boundary = true,
        Some(EventData::QueryEvent(query)) => boundary = query.query() != "BEGIN",
        _ => {}
    }

    // 위치는 트랜잭션 경계에서만 전진하므로 재시작은 항상 TABLE_MAP 이전에서 시작
    if boundary && log_pos > 0 {
        position.position = log_pos;
    }
    Ok(())
}

/// 컬럼 타입 정보가 없으므로 값은 기본 변환만 함. 타입 보정은 `TableSchema::decode_row` 소관
fn row_values(row: BinlogRow, column_count: usize) -> Result<Vec<CellValue>> {
    if row.len() != column_count {
        return Err(CdcError::LogReadError(format!(
            "부분 행 이미지 ({} / {} 컬럼): binlog_row_image=FULL 설정이 필요합니다",
            row.len(),
            column_count
        )));
    }

    Ok(row
        .unwrap()
        .into_iter()
        .map(|value| match value {
            BinlogValue::Value(v) => value_to_cell(v, None),
            other => CellValue::String(format!("{:?}", other)),
        })
        .collect())
}

fn row_op(has_before: bool, has_after: bool) -> Option<OperationType> {
    match (has_before, has_after) {
        (false, true) => Some(OperationType::Insert),
        (true, true) => Some(OperationType::Update),
        (true, false) => Some(OperationType::Delete),
        (false, false) => None,
    }
}

/// 헤더의 log_pos는 이벤트 끝 위치
fn event_start(log_pos: u64, event_size: u64) -> u64 {
    log_pos.saturating_sub(event_size)
}

fn event_time(seconds: u32) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds as i64, 0)
        .single()
        .unwrap_or_else(Utc::now)
}
