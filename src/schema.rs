//! 테이블 스키마 캐시
//!
//! Dialect가 소유하는 프로세스 범위 캐시입니다. 스키마는 실행 중 변하지 않는다고 가정하므로
//! 제거(eviction)는 없습니다. 같은 테이블을 동시에 채우는 경쟁은 무해합니다: 먼저 들어간 값이
//! 남고, 두 결과는 구조적으로 동일합니다.

use crate::dialect::SourceConnection;
use crate::error::{CdcError, Result};
use crate::table::{TableId, TableSchema};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

#[derive(Debug, Default)]
pub struct SchemaCache {
    entries: RwLock<HashMap<TableId, Arc<TableSchema>>>,
    case_sensitive: bool,
}

impl SchemaCache {
    pub fn new(case_sensitive: bool) -> Self {
        SchemaCache {
            entries: RwLock::new(HashMap::new()),
            case_sensitive,
        }
    }

    pub fn get(&self, table: &TableId) -> Option<Arc<TableSchema>> {
        self.entries
            .read()
            .get(&table.normalized(self.case_sensitive))
            .cloned()
    }

    /// 이미 있으면 기존 값을, 없으면 새 값을 넣고 반환
    pub fn insert_if_absent(&self, schema: TableSchema) -> Arc<TableSchema> {
        let key = schema.table_id.normalized(self.case_sensitive);
        self.entries
            .write()
            .entry(key)
            .or_insert_with(|| Arc::new(schema))
            .clone()
    }

    /// 캐시에 없으면 연결에서 조회 후 저장
    pub async fn get_or_load(
        &self,
        conn: &mut dyn SourceConnection,
        table: &TableId,
    ) -> Result<Arc<TableSchema>> {
        if let Some(schema) = self.get(table) {
            return Ok(schema);
        }

        // 락을 잡지 않은 채로 조회
        let schema = conn
            .describe_table(table)
            .await?
            .ok_or_else(|| CdcError::TableNotFound(table.clone()))?;

        debug!(
            "Loaded schema for {} ({} columns, key {:?})",
            table,
            schema.columns.len(),
            schema.primary_key
        );
        Ok(self.insert_if_absent(schema))
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{Column, ColumnType};
    use std::thread;

    fn schema(table: &str) -> TableSchema {
        TableSchema::new(
            TableId::new("shop", table),
            vec![Column::new("id", ColumnType::Integer)],
            vec!["id".to_string()],
        )
    }

    #[test]
    fn test_insert_if_absent_keeps_first() {
        let cache = SchemaCache::new(true);
        let first = cache.insert_if_absent(schema("orders"));
        let mut other = schema("orders");
        other.columns.push(Column::new("extra", ColumnType::Text));
        let second = cache.insert_if_absent(other);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let cache = SchemaCache::new(false);
        cache.insert_if_absent(schema("Orders"));
        assert!(cache.get(&TableId::new("SHOP", "orders")).is_some());

        let strict = SchemaCache::new(true);
        strict.insert_if_absent(schema("Orders"));
        assert!(strict.get(&TableId::new("shop", "orders")).is_none());
    }

    #[test]
    fn test_concurrent_population() {
        let cache = Arc::new(SchemaCache::new(true));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                thread::spawn(move || cache.insert_if_absent(schema("orders")))
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(results.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(cache.len(), 1);
    }
}
