//! 테이블 식별자, 필터, 스키마 정의

use crate::error::{CdcError, Result};
use crate::events::{CellValue, KeyValue, Row, RowKey};
use chrono::{TimeZone, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// 완전한 테이블 이름 (database.table)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    pub database: String,
    pub table: String,
}

impl TableId {
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        TableId {
            database: database.into(),
            table: table.into(),
        }
    }

    /// "db.table" 형식 파싱
    pub fn parse(qualified: &str) -> Result<Self> {
        match qualified.split_once('.') {
            Some((db, table)) if !db.is_empty() && !table.is_empty() => Ok(TableId::new(db, table)),
            _ => Err(CdcError::ConfigError(format!(
                "테이블은 'database.table' 형식이어야 합니다: '{}'",
                qualified
            ))),
        }
    }

    /// 대소문자를 구분하지 않는 Dialect에서는 소문자로 정규화
    pub fn normalized(&self, case_sensitive: bool) -> TableId {
        if case_sensitive {
            self.clone()
        } else {
            TableId::new(self.database.to_lowercase(), self.table.to_lowercase())
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.database, self.table)
    }
}

/// include/exclude 패턴 집합 (설정 원본)
///
/// 패턴은 "database.table" 전체에 매칭되는 정규식입니다. include가 비어 있으면
/// 모든 테이블이 포함 대상입니다.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableFilters {
    #[serde(default)]
    pub databases: Vec<String>,
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl TableFilters {
    pub fn include_tables<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TableFilters {
            include: patterns.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn compile(&self, case_sensitive: bool) -> Result<TableMatcher> {
        let build = |pattern: &String| -> Result<Regex> {
            Ok(RegexBuilder::new(&format!("^(?:{})$", pattern))
                .case_insensitive(!case_sensitive)
                .build()?)
        };

        Ok(TableMatcher {
            databases: self
                .databases
                .iter()
                .map(|db| if case_sensitive { db.clone() } else { db.to_lowercase() })
                .collect(),
            include: self.include.iter().map(build).collect::<Result<_>>()?,
            exclude: self.exclude.iter().map(build).collect::<Result<_>>()?,
            case_sensitive,
        })
    }
}

/// 컴파일된 테이블 필터
#[derive(Debug, Clone)]
pub struct TableMatcher {
    databases: Vec<String>,
    include: Vec<Regex>,
    exclude: Vec<Regex>,
    case_sensitive: bool,
}

impl TableMatcher {
    pub fn accepts_database(&self, database: &str) -> bool {
        if self.databases.is_empty() {
            return true;
        }
        if self.case_sensitive {
            self.databases.iter().any(|db| db == database)
        } else {
            let lowered = database.to_lowercase();
            self.databases.iter().any(|db| *db == lowered)
        }
    }

    pub fn matches(&self, table: &TableId) -> bool {
        if !self.accepts_database(&table.database) {
            return false;
        }
        let qualified = table.to_string();
        let included = self.include.is_empty() || self.include.iter().any(|r| r.is_match(&qualified));
        included && !self.exclude.iter().any(|r| r.is_match(&qualified))
    }
}

/// 컬럼 타입 (엔진 중립)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    Integer,
    UnsignedInteger,
    Decimal,
    Float,
    Text,
    Binary,
    Date,
    Time,
    Timestamp,
    Boolean,
    Json,
    Other(String),
}

impl ColumnType {
    /// SQL 타입 이름에서 변환 (e.g. "bigint unsigned", "varchar(255)")
    pub fn from_sql_type(sql_type: &str) -> Self {
        let lowered = sql_type.trim().to_lowercase();
        let base = lowered
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or_default();
        let unsigned = lowered.contains("unsigned");

        match base {
            "tinyint" if lowered.starts_with("tinyint(1)") => ColumnType::Boolean,
            "bool" | "boolean" => ColumnType::Boolean,
            "tinyint" | "smallint" | "mediumint" | "int" | "integer" | "bigint" | "year" => {
                if unsigned {
                    ColumnType::UnsignedInteger
                } else {
                    ColumnType::Integer
                }
            }
            "decimal" | "numeric" => ColumnType::Decimal,
            "float" | "double" | "real" => ColumnType::Float,
            "char" | "varchar" | "text" | "tinytext" | "mediumtext" | "longtext" | "enum"
            | "set" => ColumnType::Text,
            "binary" | "varbinary" | "blob" | "tinyblob" | "mediumblob" | "longblob" | "bit" => {
                ColumnType::Binary
            }
            "date" => ColumnType::Date,
            "time" => ColumnType::Time,
            "datetime" | "timestamp" => ColumnType::Timestamp,
            "json" => ColumnType::Json,
            _ => ColumnType::Other(base.to_string()),
        }
    }

    /// 범위 비교(청크 분할)에 사용할 수 있는 타입인지
    pub fn is_splittable(&self) -> bool {
        matches!(
            self,
            ColumnType::Integer
                | ColumnType::UnsignedInteger
                | ColumnType::Text
                | ColumnType::Binary
                | ColumnType::Date
                | ColumnType::Time
                | ColumnType::Timestamp
        )
    }

    pub fn is_integral(&self) -> bool {
        matches!(self, ColumnType::Integer | ColumnType::UnsignedInteger)
    }

    /// 타입 정보 없이 변환된 값(로그 이벤트, 집계 쿼리 결과)을 이 타입의 표현으로 맞춤
    ///
    /// 범위 스캔 결과와 로그 변경이 같은 키 값을 만들어야 버퍼 병합과 split 범위 판정이
    /// 일치합니다. 이미 맞는 값은 그대로 반환합니다.
    pub fn coerce(&self, value: CellValue) -> CellValue {
        match (self, value) {
            (ColumnType::Boolean, value) => match value.as_i128() {
                Some(n) => CellValue::Bool(n != 0),
                None => value,
            },
            (ColumnType::Date, CellValue::DateTime(dt)) => {
                CellValue::Date(dt.format("%Y-%m-%d").to_string())
            }
            (ColumnType::Timestamp, CellValue::Int64(seconds)) => Utc
                .timestamp_opt(seconds, 0)
                .single()
                .map_or(CellValue::Int64(seconds), CellValue::DateTime),
            (ColumnType::Binary, CellValue::String(s)) => CellValue::Bytes(s.into_bytes()),
            (ColumnType::Text, CellValue::Bytes(bytes)) => match String::from_utf8(bytes) {
                Ok(s) => CellValue::String(s),
                Err(e) => CellValue::Bytes(e.into_bytes()),
            },
            (ColumnType::Decimal, CellValue::String(s)) => CellValue::Decimal(s),
            (ColumnType::Json, CellValue::String(s)) => serde_json::from_str(&s)
                .map(CellValue::Json)
                .unwrap_or(CellValue::String(s)),
            (_, value) => value,
        }
    }

    /// 타입 정보 없이 얻은 키 값을 이 타입의 키 표현으로 맞춤
    pub fn coerce_key(&self, key: KeyValue) -> KeyValue {
        KeyValue::from_cell(&self.coerce(key.to_cell())).unwrap_or(key)
    }
}

/// 테이블 컬럼
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Column {
            name: name.into(),
            column_type,
            nullable: true,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }
}

/// 테이블 구조 메타데이터
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub table_id: TableId,
    /// 원본 순서의 컬럼 목록
    pub columns: Vec<Column>,
    /// 기본 키 컬럼 이름 (키 순서)
    pub primary_key: Vec<String>,
}

impl TableSchema {
    pub fn new(table_id: TableId, columns: Vec<Column>, primary_key: Vec<String>) -> Self {
        TableSchema {
            table_id,
            columns,
            primary_key,
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_primary_key(&self) -> bool {
        !self.primary_key.is_empty()
    }

    /// 청크 분할 키 컬럼: 설정된 컬럼, 없으면 기본 키 첫 컬럼
    pub fn chunk_key_column(&self, configured: Option<&str>) -> Result<&Column> {
        let name = match configured {
            Some(name) => name,
            None => self
                .primary_key
                .first()
                .map(String::as_str)
                .ok_or_else(|| CdcError::SplitError {
                    table: self.table_id.clone(),
                    reason: "기본 키가 없습니다".to_string(),
                })?,
        };

        self.column(name).ok_or_else(|| CdcError::SplitError {
            table: self.table_id.clone(),
            reason: format!("청크 키 컬럼 '{}'이(가) 존재하지 않습니다", name),
        })
    }

    /// 위치 기반 값 목록을 컬럼 이름 맵으로 변환. 값은 컬럼 타입의 표현으로 맞춤
    pub fn decode_row(&self, values: Vec<CellValue>) -> Row {
        self.columns
            .iter()
            .zip(values)
            .map(|(column, value)| (column.name.clone(), column.column_type.coerce(value)))
            .collect::<HashMap<_, _>>()
    }

    /// 행의 기본 키 값. 키가 없거나 비교할 수 없는 값이면 None
    pub fn row_key(&self, row: &Row) -> Option<RowKey> {
        if self.primary_key.is_empty() {
            return None;
        }
        self.primary_key
            .iter()
            .map(|name| row.get(name).and_then(KeyValue::from_cell))
            .collect::<Option<Vec<_>>>()
            .map(RowKey)
    }

    /// 행의 청크 키 값
    pub fn chunk_key(&self, row: &Row, chunk_column: &str) -> Option<KeyValue> {
        row.get(chunk_column).and_then(KeyValue::from_cell)
    }
}
