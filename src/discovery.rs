//! 테이블 디스커버리
//!
//! 카탈로그를 한 번에 모두 조회한 뒤 필터를 적용합니다. 조회 도중 실패하면 부분 결과를
//! 돌려주지 않고 `DiscoveryError`로 실패합니다.

use crate::config::SourceConfig;
use crate::dialect::Dialect;
use crate::error::{CdcError, Result};
use crate::table::TableId;
use std::collections::BTreeSet;
use tracing::{info, warn};

pub async fn discover_tables<D>(dialect: &D, config: &SourceConfig) -> Result<Vec<TableId>>
where
    D: Dialect + ?Sized,
{
    let matcher = config.filters.compile(dialect.is_case_sensitive())?;

    let mut conn = dialect.open_connection(config).await.map_err(|e| {
        CdcError::DiscoveryError(format!("{} 연결 실패: {}", dialect.name(), e))
    })?;

    let listed = conn.list_tables().await;
    if let Err(e) = conn.close().await {
        warn!("Failed to close discovery connection: {}", e);
    }

    let all = listed.map_err(|e| {
        CdcError::DiscoveryError(format!("{} 테이블 목록 조회 실패: {}", dialect.name(), e))
    })?;
    let candidates = all.len();

    let tables: BTreeSet<TableId> = all.into_iter().filter(|t| matcher.matches(t)).collect();

    info!(
        "Discovered {} of {} tables via {} dialect",
        tables.len(),
        candidates,
        dialect.name()
    );
    Ok(tables.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{MemoryDatabase, MemoryDialect};
    use crate::table::{Column, ColumnType, TableFilters, TableSchema};

    fn database() -> MemoryDatabase {
        let db = MemoryDatabase::new();
        for (database, table) in [("shop", "orders"), ("shop", "orders_archive"), ("crm", "leads")] {
            db.create_table(TableSchema::new(
                TableId::new(database, table),
                vec![Column::new("id", ColumnType::Integer)],
                vec!["id".to_string()],
            ));
        }
        db
    }

    #[tokio::test]
    async fn test_discovery_applies_filters() {
        let dialect = MemoryDialect::new(database());
        let config = SourceConfig {
            filters: TableFilters {
                databases: vec!["shop".to_string()],
                include: vec![],
                exclude: vec![".*_archive".to_string()],
            },
            ..Default::default()
        };

        let tables = dialect.discover_tables(&config).await.unwrap();
        assert_eq!(tables, vec![TableId::new("shop", "orders")]);
    }

    #[tokio::test]
    async fn test_discovery_no_match_is_empty() {
        let dialect = MemoryDialect::new(database());
        let config = SourceConfig {
            filters: TableFilters::include_tables(["warehouse\\..*"]),
            ..Default::default()
        };

        let tables = dialect.discover_tables(&config).await.unwrap();
        assert!(tables.is_empty());
    }

    #[tokio::test]
    async fn test_discovery_failure_is_fatal() {
        let db = database();
        db.fail_discovery(true);
        let dialect = MemoryDialect::new(db.clone());

        let err = dialect
            .discover_tables(&SourceConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, CdcError::DiscoveryError(_)));
        assert!(err.is_fatal());
        assert_eq!(db.open_connections(), 0);
    }
}
