//! 연결 풀 레지스트리
//!
//! 같은 연결 설정에 대해서는 풀을 한 번만 만들고 재사용합니다. 풀 내부 동작은
//! Dialect의 `ConnectionPoolFactory`가 담당합니다.

use crate::config::ConnectionConfig;
use crate::dialect::{ConnectionPool, ConnectionPoolFactory};
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Default)]
pub struct ConnectionPools {
    pools: Mutex<HashMap<ConnectionConfig, Arc<dyn ConnectionPool>>>,
}

impl ConnectionPools {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(
        &self,
        factory: &dyn ConnectionPoolFactory,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn ConnectionPool>> {
        let mut pools = self.pools.lock();
        if let Some(pool) = pools.get(config) {
            return Ok(pool.clone());
        }

        debug!(
            "Creating connection pool for {}@{}:{}",
            config.username, config.hostname, config.port
        );
        let pool = factory.create_pool(config)?;
        pools.insert(config.clone(), pool.clone());
        Ok(pool)
    }

    pub fn len(&self) -> usize {
        self.pools.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.lock().is_empty()
    }

    /// 모든 풀을 닫고 레지스트리를 비움
    pub async fn close_all(&self) {
        let pools: Vec<_> = self.pools.lock().drain().map(|(_, pool)| pool).collect();
        for pool in pools {
            if let Err(e) = pool.disconnect().await {
                warn!("Failed to disconnect pool: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{Dialect, SourceConnection};
    use crate::memory::{MemoryDatabase, MemoryDialect};

    #[tokio::test]
    async fn test_pool_reused_per_config() {
        let dialect = MemoryDialect::new(MemoryDatabase::new());
        let factory = dialect.pooled_connection_factory();
        let pools = ConnectionPools::new();

        let a = pools
            .get_or_create(factory.as_ref(), &ConnectionConfig::default())
            .unwrap();
        let b = pools
            .get_or_create(factory.as_ref(), &ConnectionConfig::default())
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = ConnectionConfig::new("replica", "cdc");
        pools.get_or_create(factory.as_ref(), &other).unwrap();
        assert_eq!(pools.len(), 2);

        let mut conn = a.acquire().await.unwrap();
        assert!(!conn.is_closed());
        conn.close().await.unwrap();

        pools.close_all().await;
        assert!(pools.is_empty());
    }
}
