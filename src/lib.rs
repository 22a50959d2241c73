//! Split 기반 CDC (Change Data Capture) 읽기 엔진
//!
//! 테이블을 키 범위 split으로 나눠 병렬로 스냅샷을 읽고, 각 split을 읽는 동안의
//! 로그 변경을 워터마크 구간으로 보정한 뒤 변경 로그 스트리밍으로 이어집니다.
//! 주요 기능:
//! - Dialect 계약 및 레지스트리 (MySQL 기본 제공, 메모리 Dialect 포함)
//! - 청크 분할 (균등/불균등)
//! - 스냅샷/증분 fetch 태스크와 low/high 워터마크 보정
//! - 스키마 캐시

pub mod assigner;
pub mod cdc_engine;
pub mod config;
pub mod dialect;
pub mod discovery;
pub mod error;
pub mod events;
pub mod fetch;
pub mod memory;
pub mod mysql;
pub mod offset;
pub mod pool;
pub mod schema;
pub mod split;
pub mod splitter;
pub mod table;

pub use assigner::{AssignerState, SplitAssigner};
pub use cdc_engine::CdcEngine;
pub use config::{ConnectionConfig, SourceConfig, StartupMode};
pub use dialect::{Dialect, DialectRegistry, LogReader, SourceConnection};
pub use error::{CdcError, Result};
pub use events::{CellValue, ChangeRecord, KeyValue, OperationType, Row};
pub use fetch::{cancel_pair, offset_channel, record_channel, FetchTask, FetchTaskContext};
pub use offset::{IncrementalOffset, LogPosition, SplitWatermark};
pub use schema::SchemaCache;
pub use split::{IncrementalSplit, SnapshotSplit, SourceSplit};
pub use splitter::ChunkSplitter;
pub use table::{TableId, TableSchema};
