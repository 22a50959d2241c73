/// Split CDC 엔진 실행 예제
///
/// 환경 변수로 설정을 읽고, 스냅샷 후 변경 로그를 스트리밍하면서 레코드를 로그로 출력합니다.
/// `CDC_DIALECT=memory`이면 시드 데이터가 들어 있는 메모리 데이터베이스를 사용합니다.
use split_cdc::events::CellValue;
use split_cdc::memory::{MemoryDatabase, MemoryDialect};
use split_cdc::table::{Column, ColumnType};
use split_cdc::{
    cancel_pair, offset_channel, record_channel, CdcEngine, CdcError, DialectRegistry, SourceConfig,
    TableId, TableSchema,
};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn seeded_memory_dialect() -> split_cdc::Result<MemoryDialect> {
    let db = MemoryDatabase::new();
    let orders = TableSchema::new(
        TableId::new("shop", "orders"),
        vec![
            Column::new("id", ColumnType::Integer).not_null(),
            Column::new("status", ColumnType::Text),
        ],
        vec!["id".to_string()],
    );
    db.create_table(orders.clone());
    for id in 1..=1000 {
        db.insert(
            &orders.table_id,
            vec![CellValue::Int64(id), CellValue::String("created".to_string())],
        )?;
    }
    Ok(MemoryDialect::new(db))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // 로깅 초기화
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = SourceConfig::from_env()?;
    let mut registry = DialectRegistry::with_builtin();
    if config.dialect == "memory" {
        registry.register(Arc::new(seeded_memory_dialect()?));
    }

    info!("Starting split CDC engine ({})", config.dialect);
    info!(
        "Connecting to {}:{}",
        config.connection.hostname, config.connection.port
    );

    let (sink, mut records) = record_channel(config.sink_capacity);
    let (reporter, mut offsets) = offset_channel();
    let (cancel, signal) = cancel_pair();
    let mut engine = CdcEngine::from_registry(&registry, config)?;

    let consumer = tokio::spawn(async move {
        let mut count = 0u64;
        while let Some(record) = records.recv().await {
            count += 1;
            info!(
                "{} {} {:?}",
                record.op.as_str(),
                record.table_id,
                record.image()
            );
        }
        count
    });

    let offset_logger = tokio::spawn(async move {
        while offsets.changed().await.is_ok() {
            if let Some(offset) = offsets.borrow_and_update().clone() {
                info!(
                    "Checkpoint {} ({} records)",
                    offset.position, offset.records_emitted
                );
            }
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            cancel.cancel();
        }
    });

    let result = engine.run(sink, signal, Some(&reporter)).await;
    drop(reporter);

    let count = consumer.await?;
    offset_logger.await?;
    match result {
        Ok(offset) => info!("Stopped at {} after {} records", offset.position, count),
        Err(CdcError::Cancelled) => info!("Stopped before streaming after {} records", count),
        Err(e) => {
            warn!("Engine failed after {} records: {}", count, e);
            return Err(e.into());
        }
    }

    Ok(())
}

/// CDC 통합 테스트 예제
#[cfg(test)]
mod integration_tests {
    use super::*;
    use split_cdc::config::StartupMode;

    #[tokio::test]
    async fn test_seeded_memory_snapshot() {
        let dialect = Arc::new(seeded_memory_dialect().unwrap());
        let config = SourceConfig {
            dialect: "memory".to_string(),
            chunk_size: 100,
            ..Default::default()
        };
        let mut engine = CdcEngine::new(dialect, config);
        engine.plan().await.unwrap();

        let (sink, mut records) = record_channel(2000);
        let (_cancel, signal) = cancel_pair();
        assert_eq!(engine.run_snapshot(&sink, &signal).await.unwrap(), 10);
        drop(sink);

        let mut count = 0;
        while records.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 1000);
        engine.stop().await;
    }

    #[tokio::test]
    #[ignore] // 실제 MySQL 연결 필요
    async fn test_mysql_engine_plan() -> Result<(), Box<dyn std::error::Error>> {
        let config = SourceConfig {
            startup_mode: StartupMode::Latest,
            ..Default::default()
        };
        let mut engine = CdcEngine::from_registry(&DialectRegistry::with_builtin(), config)?;
        engine.plan().await?;
        assert!(engine.assigner().is_some());
        engine.stop().await;
        Ok(())
    }
}
