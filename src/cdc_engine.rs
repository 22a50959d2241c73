//! CDC 엔진 - split 계획, 스냅샷 병렬 실행, 스트리밍
//!
//! CDC 엔진은 다음 단계로 진행됩니다:
//! 1. 분할 계획 (테이블 디스커버리 + 청크 분할)
//! 2. 스냅샷 split 병렬 실행 (워터마크 병합)
//! 3. 증분 split 스트리밍 (완료된 split 범위의 중복 변경은 건너뜀)

use crate::assigner::{AssignerState, SplitAssigner};
use crate::config::{SourceConfig, StartupMode};
use crate::dialect::{Dialect, DialectRegistry};
use crate::error::{CdcError, Result};
use crate::fetch::{CancelSignal, OffsetReporter, RecordSink, TaskOutcome};
use crate::offset::{IncrementalOffset, ProcessingState};
use crate::pool::ConnectionPools;
use crate::split::{SnapshotSplit, SourceSplit};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub struct CdcEngine {
    dialect: Arc<dyn Dialect>,
    config: Arc<SourceConfig>,
    pools: ConnectionPools,
    state: ProcessingState,
    assigner: Option<SplitAssigner>,
}

impl CdcEngine {
    pub fn new(dialect: Arc<dyn Dialect>, config: SourceConfig) -> Self {
        CdcEngine {
            dialect,
            config: Arc::new(config),
            pools: ConnectionPools::new(),
            state: ProcessingState::Idle,
            assigner: None,
        }
    }

    /// 설정의 Dialect 이름으로 엔진 생성
    pub fn from_registry(registry: &DialectRegistry, config: SourceConfig) -> Result<Self> {
        config.validate()?;
        let dialect = registry.get(&config.dialect)?;
        Ok(Self::new(dialect, config))
    }

    /// 체크포인트에서 할당기 상태 복구 (계획 단계 생략)
    pub fn with_assigner_state(mut self, state: AssignerState) -> Self {
        self.assigner = Some(SplitAssigner::restore(state));
        self
    }

    pub fn state(&self) -> ProcessingState {
        self.state
    }

    pub fn config(&self) -> &SourceConfig {
        &self.config
    }

    pub fn assigner(&self) -> Option<&SplitAssigner> {
        self.assigner.as_ref()
    }

    /// 시작 모드에 따라 할당기 구성
    pub async fn plan(&mut self) -> Result<()> {
        info!(
            "Planning {} source ({:?})",
            self.dialect.name(),
            self.config.startup_mode
        );

        let factory = self.dialect.pooled_connection_factory();
        let pool = self
            .pools
            .get_or_create(factory.as_ref(), &self.config.connection)?;
        let mut conn = pool.acquire().await?;

        let planned = match &self.config.startup_mode {
            StartupMode::Initial => {
                SplitAssigner::plan(self.dialect.as_ref(), &self.config, conn.as_mut()).await
            }
            StartupMode::Latest => match self.dialect.discover_tables(&self.config).await {
                Ok(tables) => conn
                    .current_position()
                    .await
                    .map(|position| SplitAssigner::streaming_only(tables, Some(position))),
                Err(e) => Err(e),
            },
            StartupMode::Specific(position) => self
                .dialect
                .discover_tables(&self.config)
                .await
                .map(|tables| SplitAssigner::streaming_only(tables, Some(position.clone()))),
        };

        if let Err(e) = conn.close().await {
            warn!("Failed to close planning connection: {}", e);
        }
        self.assigner = Some(planned?);
        Ok(())
    }

    /// 남은 스냅샷 split을 병렬로 실행
    ///
    /// 재시도 가능한 실패는 split을 처음부터 다시 실행하며, 한도를 넘기면 실행 전체를 중단합니다.
    pub async fn run_snapshot(&mut self, sink: &RecordSink, cancel: &CancelSignal) -> Result<u64> {
        let assigner = self
            .assigner
            .as_mut()
            .ok_or_else(|| CdcError::Other("분할 계획 전에 스냅샷을 실행할 수 없습니다".to_string()))?;
        self.state = ProcessingState::Snapshotting;

        let parallelism = self.config.snapshot_parallelism.max(1);
        let retry = self.config.retry.clone();
        let mut attempts: HashMap<String, u32> = HashMap::new();
        let mut workers = JoinSet::new();
        let mut completed = 0u64;

        info!(
            "Running {} snapshot splits with parallelism {}",
            assigner.remaining(),
            parallelism
        );

        loop {
            while workers.len() < parallelism {
                let split = match assigner.next_split() {
                    Some(split) => split,
                    None => break,
                };
                workers.spawn(run_split(
                    self.dialect.clone(),
                    self.config.clone(),
                    split,
                    sink.clone(),
                    cancel.clone(),
                ));
            }

            let joined = match workers.join_next().await {
                Some(joined) => joined,
                None => break,
            };
            let (split, result) = joined.map_err(|e| CdcError::Other(e.to_string()))?;
            let key = split.split_key();

            match result {
                Ok(result) => {
                    assigner.on_split_finished(&key, &result.watermark)?;
                    completed += 1;
                    debug!("{} snapshot splits remaining", assigner.remaining());
                }
                Err(CdcError::Cancelled) => {
                    workers.abort_all();
                    return Err(CdcError::Cancelled);
                }
                Err(e) if e.is_retryable() => {
                    let count = attempts.entry(key.clone()).or_insert(0);
                    *count += 1;
                    if *count >= retry.max_attempts {
                        error!("Snapshot split {} failed {} times: {}", key, count, e);
                        workers.abort_all();
                        return Err(e);
                    }
                    warn!(
                        "Snapshot split {} failed ({}), retrying (attempt {}/{})",
                        key, e, count, retry.max_attempts
                    );
                    tokio::time::sleep(retry.backoff(*count)).await;
                    assigner.on_split_failed(&key);
                }
                Err(e) => {
                    error!("Snapshot split {} failed: {}", key, e);
                    workers.abort_all();
                    return Err(e);
                }
            }
        }

        info!("Snapshot phase finished: {} splits", completed);
        Ok(completed)
    }

    /// 증분 split 스트리밍. 취소되면 마지막 확정 위치를 반환
    pub async fn stream(
        &mut self,
        sink: &RecordSink,
        mut cancel: CancelSignal,
        reporter: Option<&OffsetReporter>,
    ) -> Result<IncrementalOffset> {
        let assigner = self
            .assigner
            .as_ref()
            .ok_or_else(|| CdcError::Other("분할 계획 전에 스트리밍할 수 없습니다".to_string()))?;
        if !assigner.is_snapshot_finished() {
            warn!(
                "Streaming with {} snapshot splits unfinished",
                assigner.remaining()
            );
        }

        let split = SourceSplit::Incremental(assigner.incremental_split());
        let context = self
            .dialect
            .create_fetch_task_context(&split, self.config.clone())
            .await?;
        let mut task = self.dialect.create_fetch_task(split);

        self.state = ProcessingState::Streaming;
        let outcome = task.execute(context, sink, &mut cancel, reporter).await;
        self.state = ProcessingState::Stopped;

        match outcome? {
            TaskOutcome::IncrementalStopped(offset) => Ok(offset),
            TaskOutcome::SnapshotFinished(result) => Err(CdcError::Other(format!(
                "증분 split이 스냅샷 결과를 반환했습니다: {}",
                result.split
            ))),
        }
    }

    /// 계획 → 스냅샷 → 스트리밍
    pub async fn run(
        &mut self,
        sink: RecordSink,
        cancel: CancelSignal,
        reporter: Option<&OffsetReporter>,
    ) -> Result<IncrementalOffset> {
        if self.assigner.is_none() {
            self.plan().await?;
        }

        let snapshot_pending = self
            .assigner
            .as_ref()
            .map_or(false, |a| !a.is_snapshot_finished());
        if snapshot_pending {
            self.run_snapshot(&sink, &cancel).await?;
        }

        let result = self.stream(&sink, cancel, reporter).await;
        self.stop().await;
        result
    }

    /// 엔진 종료
    pub async fn stop(&mut self) {
        info!("Stopping CDC Engine");
        self.pools.close_all().await;
        self.state = ProcessingState::Stopped;
    }
}

/// 스냅샷 split 하나: 컨텍스트 생성부터 실행까지
async fn run_split(
    dialect: Arc<dyn Dialect>,
    config: Arc<SourceConfig>,
    split: SnapshotSplit,
    sink: RecordSink,
    mut cancel: CancelSignal,
) -> (SnapshotSplit, Result<crate::fetch::SnapshotResult>) {
    let source = SourceSplit::Snapshot(split.clone());
    let context = match dialect.create_fetch_task_context(&source, config).await {
        Ok(context) => context,
        Err(e) => return (split.clone(), Err(CdcError::snapshot_task(split.split_key(), e))),
    };

    let mut task = dialect.create_fetch_task(source);
    let result = match task.execute(context, &sink, &mut cancel, None).await {
        Ok(TaskOutcome::SnapshotFinished(result)) => Ok(result),
        Ok(TaskOutcome::IncrementalStopped(_)) => Err(CdcError::Other(format!(
            "스냅샷 split {}이(가) 증분 태스크로 실행되었습니다",
            split.split_key()
        ))),
        Err(e) => Err(e),
    };
    (split, result)
}
