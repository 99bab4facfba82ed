//! 积分账本服务入口
//!
//! 加载配置、迁移数据库，然后启动订单对账流水线，
//! 直到收到 Ctrl+C / SIGTERM 后优雅停机。

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tracing::info;

use loyalty_ledger_service::accrual::AccrualPipeline;
use loyalty_ledger_service::store::{LedgerStorage, PgLedgerStore};
use loyalty_shared::{config::AppConfig, database::Database, observability};

#[tokio::main]
async fn main() -> Result<()> {
    // 1. 加载配置（配置文件 + 环境变量覆盖）
    let config = AppConfig::load("loyalty-ledger-service").unwrap_or_else(|e| {
        eprintln!("配置加载失败，使用默认配置: {e}");
        AppConfig::default()
    });

    // 2. 初始化日志
    observability::init(&config.observability)?;

    info!(
        environment = %config.environment,
        accrual_base_url = %config.accrual.base_url,
        "积分账本服务启动中"
    );

    // 3. 连接数据库并执行迁移
    let db = Database::connect(&config.database).await?;
    sqlx::migrate!("./migrations").run(db.pool()).await?;
    info!("数据库迁移完成");

    // 4. 装配存储与对账流水线
    let store: Arc<dyn LedgerStorage> = Arc::new(PgLedgerStore::new(db.pool().clone()));
    let pipeline = AccrualPipeline::from_config(store, &config.accrual, &config.scanner)?;
    let handle = pipeline.start();

    info!("积分账本服务已就绪");

    // 5. 等待停机信号，然后按序收尾：流水线先停，连接池后关
    shutdown_signal().await;
    handle.shutdown().await;
    db.close().await;

    info!("积分账本服务已退出");
    Ok(())
}

/// 优雅关闭信号处理
///
/// 监听 Ctrl+C 和 SIGTERM 信号，用于容器环境优雅关闭
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("收到 Ctrl+C，开始优雅停机");
        }
        _ = terminate => {
            info!("收到 SIGTERM，开始优雅停机");
        }
    }
}
