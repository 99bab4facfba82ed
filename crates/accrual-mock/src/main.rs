//! 积分计算服务模拟器入口
//!
//! 默认监听 0.0.0.0:8090，可用环境变量调整：
//! - ACCRUAL_MOCK_ADDR: 监听地址
//! - ACCRUAL_MOCK_RATE_LIMIT_EVERY: 每 N 个查询限流一次，0 关闭
//! - ACCRUAL_MOCK_RETRY_AFTER: 429 响应的 Retry-After 秒数

use anyhow::Result;
use tracing::info;

use accrual_mock_service::{router, MockAccrual};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let addr = std::env::var("ACCRUAL_MOCK_ADDR").unwrap_or_else(|_| "0.0.0.0:8090".to_string());
    let rate_limit_every = std::env::var("ACCRUAL_MOCK_RATE_LIMIT_EVERY")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let retry_after = std::env::var("ACCRUAL_MOCK_RETRY_AFTER")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(60);

    let state = MockAccrual::new(rate_limit_every, retry_after);
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr, rate_limit_every, "积分计算模拟器已启动");

    axum::serve(listener, app).await?;
    Ok(())
}
