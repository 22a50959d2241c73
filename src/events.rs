//! 변경 레코드 및 값 타입 정의

use crate::offset::LogPosition;
use crate::table::TableId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

/// 셀 값 (다양한 SQL 타입 지원)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Bool(bool),
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<Utc>),
    Date(String),
    Time(String),
    Decimal(String),
    Json(serde_json::Value),
}

impl CellValue {
    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }

    pub(crate) fn as_i128(&self) -> Option<i128> {
        match *self {
            CellValue::Int8(v) => Some(v as i128),
            CellValue::Int16(v) => Some(v as i128),
            CellValue::Int32(v) => Some(v as i128),
            CellValue::Int64(v) => Some(v as i128),
            CellValue::UInt8(v) => Some(v as i128),
            CellValue::UInt16(v) => Some(v as i128),
            CellValue::UInt32(v) => Some(v as i128),
            CellValue::UInt64(v) => Some(v as i128),
            _ => None,
        }
    }
}

/// 컬럼 이름 → 값
pub type Row = HashMap<String, CellValue>;

/// 범위 비교가 가능한 키 값
///
/// 같은 컬럼의 값은 항상 같은 variant로 정규화됩니다. 정수는 `Int`를 쓰고,
/// `i64` 범위를 넘는 부호 없는 값만 `UInt`가 되므로 variant 순서가 곧 값 순서입니다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KeyValue {
    Int(i64),
    UInt(u64),
    Text(String),
    Bytes(Vec<u8>),
    Timestamp(DateTime<Utc>),
}

impl KeyValue {
    /// 비교할 수 없는 값(NULL, 부동소수점, JSON, 소수)이면 None. 불리언은 0/1 정수
    pub fn from_cell(cell: &CellValue) -> Option<KeyValue> {
        match cell {
            CellValue::String(s) | CellValue::Date(s) | CellValue::Time(s) => {
                Some(KeyValue::Text(s.clone()))
            }
            CellValue::Bytes(b) => Some(KeyValue::Bytes(b.clone())),
            CellValue::DateTime(dt) => Some(KeyValue::Timestamp(*dt)),
            CellValue::Bool(b) => Some(KeyValue::Int(*b as i64)),
            other => other.as_i128().and_then(KeyValue::from_i128),
        }
    }

    pub fn from_i128(value: i128) -> Option<KeyValue> {
        if let Ok(v) = i64::try_from(value) {
            Some(KeyValue::Int(v))
        } else {
            u64::try_from(value).ok().map(KeyValue::UInt)
        }
    }

    pub fn as_i128(&self) -> Option<i128> {
        match *self {
            KeyValue::Int(v) => Some(v as i128),
            KeyValue::UInt(v) => Some(v as i128),
            _ => None,
        }
    }

    pub fn to_cell(&self) -> CellValue {
        match self {
            KeyValue::Int(v) => CellValue::Int64(*v),
            KeyValue::UInt(v) => CellValue::UInt64(*v),
            KeyValue::Text(s) => CellValue::String(s.clone()),
            KeyValue::Bytes(b) => CellValue::Bytes(b.clone()),
            KeyValue::Timestamp(dt) => CellValue::DateTime(*dt),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Int(v) => write!(f, "{}", v),
            KeyValue::UInt(v) => write!(f, "{}", v),
            KeyValue::Text(s) => write!(f, "'{}'", s),
            KeyValue::Bytes(b) => write!(f, "0x{}", b.iter().map(|x| format!("{:02x}", x)).collect::<String>()),
            KeyValue::Timestamp(dt) => write!(f, "{}", dt.to_rfc3339()),
        }
    }
}

/// 기본 키 전체 값 (복합 키 포함)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowKey(pub Vec<KeyValue>);

/// `[lower, upper)` 범위에 키가 포함되는지. None은 열린 경계
pub fn key_in_range(key: &KeyValue, lower: Option<&KeyValue>, upper: Option<&KeyValue>) -> bool {
    let above_lower = lower.map_or(true, |l| key.cmp(l) != Ordering::Less);
    let below_upper = upper.map_or(true, |u| key.cmp(u) == Ordering::Less);
    above_lower && below_upper
}

/// 청크 키가 `[lower, upper)`에 속하는지. NULL 키(None)는 하한이 열린 첫 범위에 속함
pub fn chunk_in_range(
    key: Option<&KeyValue>,
    lower: Option<&KeyValue>,
    upper: Option<&KeyValue>,
) -> bool {
    match key {
        Some(key) => key_in_range(key, lower, upper),
        None => lower.is_none(),
    }
}

/// 변경 연산 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    Insert,
    Update,
    Delete,
    /// 스냅샷에서 읽은 행
    Read,
}

impl OperationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "INSERT",
            OperationType::Update => "UPDATE",
            OperationType::Delete => "DELETE",
            OperationType::Read => "READ",
        }
    }
}

/// 로그에서 읽은 변경 (디코딩 전, 위치 기반 값)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// 이 변경이 기록된 로그 위치
    pub position: LogPosition,
    pub table_id: TableId,
    pub op: OperationType,
    pub before: Option<Vec<CellValue>>,
    pub after: Option<Vec<CellValue>>,
    pub timestamp: DateTime<Utc>,
}

/// CDC 변경 레코드 (스냅샷과 로그 출처를 동일하게 취급)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeRecord {
    pub table_id: TableId,
    pub op: OperationType,
    /// 변경 전 데이터 (UPDATE/DELETE의 경우)
    pub before: Option<Row>,
    /// 변경 후 데이터 (INSERT/UPDATE/READ의 경우)
    pub after: Option<Row>,
    /// 로그 출처이면 원본 로그 위치, 스냅샷 읽기이면 None
    pub position: Option<LogPosition>,
    pub timestamp: DateTime<Utc>,
}

impl ChangeRecord {
    pub fn read(table_id: TableId, row: Row) -> Self {
        ChangeRecord {
            table_id,
            op: OperationType::Read,
            before: None,
            after: Some(row),
            position: None,
            timestamp: Utc::now(),
        }
    }

    pub fn is_snapshot(&self) -> bool {
        self.position.is_none()
    }

    /// 최종 이미지: 삭제이면 이전 이미지, 그 외에는 이후 이미지
    pub fn image(&self) -> Option<&Row> {
        match self.op {
            OperationType::Delete => self.before.as_ref(),
            _ => self.after.as_ref(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_value_normalization() {
        assert_eq!(KeyValue::from_cell(&CellValue::Int32(5)), Some(KeyValue::Int(5)));
        assert_eq!(KeyValue::from_cell(&CellValue::UInt64(5)), Some(KeyValue::Int(5)));
        assert_eq!(
            KeyValue::from_cell(&CellValue::UInt64(u64::MAX)),
            Some(KeyValue::UInt(u64::MAX))
        );
        assert!(KeyValue::from_cell(&CellValue::Double(1.5)).is_none());
        assert!(KeyValue::from_cell(&CellValue::Null).is_none());
        assert_eq!(KeyValue::from_cell(&CellValue::Bool(true)), Some(KeyValue::Int(1)));
    }

    #[test]
    fn test_key_ordering_across_widths() {
        let big = KeyValue::from_cell(&CellValue::UInt64(u64::MAX)).unwrap();
        let small = KeyValue::from_cell(&CellValue::Int64(i64::MAX)).unwrap();
        assert!(small < big);
    }

    #[test]
    fn test_key_in_range() {
        let k = KeyValue::Int(10);
        assert!(key_in_range(&k, None, None));
        assert!(key_in_range(&k, Some(&KeyValue::Int(10)), Some(&KeyValue::Int(11))));
        assert!(!key_in_range(&k, Some(&KeyValue::Int(11)), None));
        assert!(!key_in_range(&k, None, Some(&KeyValue::Int(10))));
    }

    #[test]
    fn test_null_chunk_key_in_first_range() {
        assert!(chunk_in_range(None, None, Some(&KeyValue::Int(5))));
        assert!(chunk_in_range(None, None, None));
        assert!(!chunk_in_range(None, Some(&KeyValue::Int(5)), None));
        assert!(chunk_in_range(Some(&KeyValue::Int(7)), Some(&KeyValue::Int(5)), None));
    }
}
