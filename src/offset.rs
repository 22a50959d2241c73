//! 로그 위치 추적 (LogPosition, 워터마크, 체크포인트 오프셋)
//!
//! 로그 위치는 "파일명 + 위치" 쌍입니다. 예: "mysql-bin.000003" 파일의 4097 바이트.
//! 파일이 하나뿐인 로그(LSN 등)는 파일명을 비워 두고 위치만 사용합니다.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// 전순서가 보장되는 로그 위치
///
/// 순서는 (파일 시퀀스 번호, 파일명, 위치) 순으로 비교합니다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogPosition {
    /// 로그 파일명 (e.g., "mysql-bin.000001"), 단일 스트림 로그는 빈 문자열
    pub file: String,
    /// 파일 내 위치
    pub position: u64,
}

impl LogPosition {
    pub fn new(file: impl Into<String>, position: u64) -> Self {
        LogPosition {
            file: file.into(),
            position,
        }
    }

    /// 파일 구분이 없는 로그의 위치
    pub fn at(position: u64) -> Self {
        LogPosition::new(String::new(), position)
    }

    /// 파일명에서 시퀀스 번호 추출 (없으면 0)
    pub fn file_sequence(&self) -> u64 {
        self.file
            .rsplit('.')
            .next()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    }
}

impl Ord for LogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.file_sequence()
            .cmp(&other.file_sequence())
            .then_with(|| self.file.cmp(&other.file))
            .then_with(|| self.position.cmp(&other.position))
    }
}

impl PartialOrd for LogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for LogPosition {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for LogPosition {}

impl Hash for LogPosition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.file.hash(state);
        self.position.hash(state);
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.file.is_empty() {
            write!(f, "{}", self.position)
        } else {
            write!(f, "{}:{}", self.file, self.position)
        }
    }
}

/// 스냅샷 스캔 직전/직후의 로그 위치 쌍
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitWatermark {
    pub low: LogPosition,
    pub high: LogPosition,
}

impl SplitWatermark {
    pub fn new(low: LogPosition, high: LogPosition) -> Self {
        SplitWatermark { low, high }
    }

    /// 스캔 중 로그 변경이 없었는지
    pub fn is_quiet(&self) -> bool {
        self.low >= self.high
    }

    /// 워터마크 구간 `[low, high)`에 속하는지
    ///
    /// low는 스캔 시작 시점에 "다음에 기록될" 위치이므로 low 위치의 변경은 스캔 이후에 일어난 것입니다.
    pub fn contains(&self, position: &LogPosition) -> bool {
        *position >= self.low && *position < self.high
    }
}

/// 증분 태스크가 주기적으로 보고하는 체크포인트
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncrementalOffset {
    /// 이 위치 이전의 변경은 모두 싱크에 전달됨
    pub position: LogPosition,
    /// 지금까지 전달한 레코드 수
    pub records_emitted: u64,
    pub reported_at: DateTime<Utc>,
}

impl IncrementalOffset {
    pub fn new(position: LogPosition, records_emitted: u64) -> Self {
        IncrementalOffset {
            position,
            records_emitted,
            reported_at: Utc::now(),
        }
    }
}

/// CDC 처리 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessingState {
    /// 분할 계획 전
    Idle,
    /// 스냅샷 처리 중
    Snapshotting,
    /// 스트리밍 처리 중
    Streaming,
    /// 중단됨
    Stopped,
}
