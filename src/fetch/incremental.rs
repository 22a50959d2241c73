//! 증분 Fetch 태스크 (로그 스트리밍)
//!
//! 자연 종료가 없으며 취소 또는 재시도 한도 초과로만 멈춥니다. 배치 하나를 싱크에 모두
//! 전달한 뒤에만 위치를 확정하므로, 재시작은 확정 위치부터 변경을 놓치지 않고 이어집니다.

use super::{CancelSignal, FetchTaskContext, OffsetReporter, RecordSink, SplitTables};
use crate::dialect::LogReader;
use crate::error::{CdcError, Result};
use crate::events::{ChangeRecord, LogEntry, OperationType, Row};
use crate::offset::{IncrementalOffset, LogPosition};
use crate::split::IncrementalSplit;
use tracing::{debug, error, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IncrementalTaskState {
    Open,
    Streaming,
    Stopped,
    Failed,
}

#[derive(Debug)]
pub struct IncrementalFetchTask {
    split: IncrementalSplit,
    state: IncrementalTaskState,
    /// 이 위치 이전의 변경은 모두 싱크에 전달됨
    last_confirmed: Option<LogPosition>,
    records_emitted: u64,
}

impl IncrementalFetchTask {
    pub fn new(split: IncrementalSplit) -> Self {
        IncrementalFetchTask {
            split,
            state: IncrementalTaskState::Open,
            last_confirmed: None,
            records_emitted: 0,
        }
    }

    /// 체크포인트에서 복구: split 시작 위치 대신 이 위치부터 읽음
    pub fn resume_from(mut self, position: LogPosition) -> Self {
        self.last_confirmed = Some(position);
        self
    }

    pub fn split(&self) -> &IncrementalSplit {
        &self.split
    }

    pub fn state(&self) -> IncrementalTaskState {
        self.state
    }

    pub fn last_confirmed(&self) -> Option<&LogPosition> {
        self.last_confirmed.as_ref()
    }

    /// 재시작할 위치: 확정 위치, 없으면 split 시작 위치. 둘 다 없으면 None (현재 위치부터)
    fn resume_position(&self) -> Option<LogPosition> {
        self.last_confirmed
            .clone()
            .or_else(|| self.split.start.clone())
    }

    /// 아직 로그 위치를 하나도 알지 못하면 None
    pub fn offset(&self) -> Option<IncrementalOffset> {
        self.resume_position()
            .map(|position| IncrementalOffset::new(position, self.records_emitted))
    }

    /// 취소로 멈출 때의 결과. 위치를 알기 전에 취소되면 `Cancelled`
    fn stopped(&self) -> Result<IncrementalOffset> {
        self.offset().ok_or(CdcError::Cancelled)
    }

    /// 취소될 때까지 스트리밍. 취소 시 마지막 확정 위치를 반환
    pub async fn execute(
        &mut self,
        mut context: FetchTaskContext,
        sink: &RecordSink,
        cancel: &mut CancelSignal,
        reporter: Option<&OffsetReporter>,
    ) -> Result<IncrementalOffset> {
        let result = self
            .stream_with_retry(&mut context, sink, cancel, reporter)
            .await;

        if let Err(e) = context.release().await {
            warn!("Failed to release incremental context: {}", e);
        }

        match result {
            Ok(offset) => {
                self.state = IncrementalTaskState::Stopped;
                info!(
                    "Incremental streaming stopped at {} after {} records",
                    offset.position, offset.records_emitted
                );
                Ok(offset)
            }
            Err(CdcError::Cancelled) => {
                self.state = IncrementalTaskState::Stopped;
                debug!("Incremental streaming cancelled before reaching the log");
                Err(CdcError::Cancelled)
            }
            Err(e) => {
                self.state = IncrementalTaskState::Failed;
                error!("Incremental streaming failed: {}", e);
                Err(e)
            }
        }
    }

    async fn stream_with_retry(
        &mut self,
        context: &mut FetchTaskContext,
        sink: &RecordSink,
        cancel: &mut CancelSignal,
        reporter: Option<&OffsetReporter>,
    ) -> Result<IncrementalOffset> {
        let retry = context.config().retry.clone();
        let mut failures = 0u32;

        loop {
            self.state = IncrementalTaskState::Open;
            match self
                .stream(context, sink, cancel, reporter, &mut failures)
                .await
            {
                Ok(()) => return self.stopped(),
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    if failures >= retry.max_attempts {
                        return Err(CdcError::IncrementalTaskError {
                            attempts: failures,
                            source: Box::new(e),
                        });
                    }

                    let delay = retry.backoff(failures);
                    let from = self
                        .resume_position()
                        .map_or_else(|| "the current position".to_string(), |p| p.to_string());
                    warn!(
                        "Log stream interrupted ({}), resuming from {} in {:?} (attempt {}/{})",
                        e,
                        from,
                        delay,
                        failures,
                        retry.max_attempts
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return self.stopped(),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 리더 하나의 수명. 취소되면 Ok, 리더/싱크 에러는 Err
    async fn stream(
        &mut self,
        context: &mut FetchTaskContext,
        sink: &RecordSink,
        cancel: &mut CancelSignal,
        reporter: Option<&OffsetReporter>,
        failures: &mut u32,
    ) -> Result<()> {
        let mut reader = context
            .connection()
            .open_log_reader(self.resume_position())
            .await?;

        self.state = IncrementalTaskState::Streaming;
        info!(
            "Streaming {} tables from {} ({})",
            self.split.table_ids.len(),
            reader.position(),
            context.dialect_name()
        );
        if self.last_confirmed.is_none() {
            self.confirm(reader.position().clone(), reporter);
        }

        let interval = context.config().checkpoint_interval.max(1);
        let result = self
            .pump(
                context.tables(),
                reader.as_mut(),
                sink,
                cancel,
                reporter,
                failures,
                interval,
            )
            .await;

        if let Err(e) = reader.close().await {
            debug!("Failed to close log reader: {}", e);
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn pump(
        &mut self,
        tables: &SplitTables,
        reader: &mut dyn LogReader,
        sink: &RecordSink,
        cancel: &mut CancelSignal,
        reporter: Option<&OffsetReporter>,
        failures: &mut u32,
        interval: u64,
    ) -> Result<()> {
        loop {
            let entries = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                entries = reader.read_entries() => entries?,
            };
            *failures = 0;

            for entry in entries {
                let record = match self.decode(tables, entry) {
                    Some(record) => record,
                    None => continue,
                };

                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Ok(()),
                    sent = sink.send(record) => sent.map_err(|_| CdcError::ChannelClosed)?,
                }

                self.records_emitted += 1;
                if self.records_emitted % interval == 0 {
                    info!(
                        "Streamed {} records, reading at {}",
                        self.records_emitted,
                        reader.position()
                    );
                }
            }

            if self.last_confirmed.as_ref() != Some(reader.position()) {
                self.confirm(reader.position().clone(), reporter);
            }
        }
    }

    /// 로그 변경을 레코드로 변환. 대상 테이블이 아니거나 이미 스냅샷에 반영된 변경이면 None
    ///
    /// 키를 바꾸는 UPDATE의 한쪽 이미지만 스냅샷에 반영되어 있으면 나머지 한쪽을
    /// DELETE(이전 이미지) 또는 INSERT(이후 이미지)로 내보냅니다.
    fn decode(&self, tables: &SplitTables, entry: LogEntry) -> Option<ChangeRecord> {
        let case_sensitive = tables.is_case_sensitive();
        if !self.split.includes(&entry.table_id, case_sensitive) {
            return None;
        }

        let schema = match tables.schema(&entry.table_id) {
            Some(schema) => schema.clone(),
            None => {
                warn!(
                    "No cached schema for {}, skipping change at {}",
                    entry.table_id, entry.position
                );
                return None;
            }
        };

        let emit = |row: &Row| {
            self.split
                .should_emit(&schema, row, &entry.position, case_sensitive)
        };
        let before = entry
            .before
            .map(|values| schema.decode_row(values))
            .filter(|row| emit(row));
        let after = entry
            .after
            .map(|values| schema.decode_row(values))
            .filter(|row| emit(row));

        let op = match (entry.op, before.is_some(), after.is_some()) {
            (OperationType::Update, true, false) => OperationType::Delete,
            (OperationType::Update, false, true) => OperationType::Insert,
            (OperationType::Update, true, true)
            | (OperationType::Insert, _, true)
            | (OperationType::Delete, true, _) => entry.op,
            _ => {
                trace!("Change at {} already covered by snapshot", entry.position);
                return None;
            }
        };

        Some(ChangeRecord {
            table_id: schema.table_id.clone(),
            op,
            before,
            after,
            position: Some(entry.position),
            timestamp: entry.timestamp,
        })
    }

    fn confirm(&mut self, position: LogPosition, reporter: Option<&OffsetReporter>) {
        self.last_confirmed = Some(position);
        if let Some(reporter) = reporter {
            reporter.send_replace(self.offset());
        }
    }
}
