//! 订单对账流水线
//!
//! 组装扫描器、任务队列、worker 池与限流暂停门，形成完整的
//! 后台对账管道：
//!
//! ```text
//! SourceScanner --(非终态订单号)--> OrderQueue --> Dispatcher workers
//!                                                   |        |
//!                                              PauseGate  AccrualApi
//!                                                   |        |
//!                                              LedgerStorage 入账
//! ```
//!
//! 生命周期是显式的：[`AccrualPipeline::start`] 消耗流水线返回
//! [`PipelineHandle`]，重复启动在类型上就不可能；
//! [`PipelineHandle::shutdown`] 广播停机信号并等待全部任务退出。

pub mod client;
pub mod dispatcher;
pub mod gate;
pub mod scanner;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use loyalty_shared::config::{AccrualConfig, ScannerConfig};
use loyalty_shared::Result;

pub use client::{AccrualApi, AccrualOutcome, HttpAccrualClient};
pub use dispatcher::{Dispatcher, OrderQueue};
pub use gate::PauseGate;
pub use scanner::SourceScanner;

use crate::store::LedgerStorage;

/// 未启动的对账流水线
pub struct AccrualPipeline {
    store: Arc<dyn LedgerStorage>,
    client: Arc<dyn AccrualApi>,
    workers: usize,
    cooldown: Duration,
    scan_interval: Duration,
}

impl AccrualPipeline {
    /// 手工装配，测试时可注入任意客户端和存储
    pub fn new(
        store: Arc<dyn LedgerStorage>,
        client: Arc<dyn AccrualApi>,
        workers: usize,
        cooldown: Duration,
        scan_interval: Duration,
    ) -> Self {
        Self {
            store,
            client,
            workers: workers.max(1),
            cooldown,
            scan_interval,
        }
    }

    /// 按配置装配生产流水线（HTTP 客户端指向真实计算服务）
    pub fn from_config(
        store: Arc<dyn LedgerStorage>,
        accrual: &AccrualConfig,
        scanner: &ScannerConfig,
    ) -> Result<Self> {
        let client = Arc::new(HttpAccrualClient::new(accrual)?);
        Ok(Self::new(
            store,
            client,
            accrual.effective_workers(),
            Duration::from_secs(accrual.cooldown_seconds),
            Duration::from_secs(scanner.interval_seconds),
        ))
    }

    /// 启动扫描器与 worker 池
    pub fn start(self) -> PipelineHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let gate = Arc::new(PauseGate::new(self.cooldown));
        let (queue, rx) = OrderQueue::new();

        let dispatcher = Arc::new(Dispatcher::new(
            self.store.clone(),
            self.client,
            gate,
            queue.clone(),
        ));
        let mut tasks = dispatcher.spawn_workers(self.workers, rx, shutdown_rx.clone());

        let scanner = SourceScanner::new(self.store, queue, self.scan_interval);
        tasks.push(tokio::spawn(scanner.run(shutdown_rx)));

        info!(workers = self.workers, "对账流水线已启动");

        PipelineHandle { shutdown_tx, tasks }
    }
}

/// 运行中流水线的句柄
pub struct PipelineHandle {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    /// 广播停机信号并等待扫描器与全部 worker 退出
    pub async fn shutdown(self) {
        // 接收端全部退出后 send 才会失败，此时目的已经达成
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
        info!("对账流水线已停止");
    }
}
