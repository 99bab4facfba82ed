//! 订单源扫描器
//!
//! 周期性从账本捞出全部非终态订单投入对账队列。
//! 重复投喂由队列的在途去重吸收，扫描器本身不维护任何状态，
//! 崩溃重启后凭数据库里的订单状态即可恢复。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::accrual::dispatcher::OrderQueue;
use crate::store::LedgerStorage;

/// 非终态订单扫描器
pub struct SourceScanner {
    store: Arc<dyn LedgerStorage>,
    queue: Arc<OrderQueue>,
    interval: Duration,
}

impl SourceScanner {
    pub fn new(store: Arc<dyn LedgerStorage>, queue: Arc<OrderQueue>, interval: Duration) -> Self {
        Self {
            store,
            queue,
            interval,
        }
    }

    /// 扫描循环，直到收到停机信号
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        // 单轮扫描耗时超过周期时跳过积压的 tick，不追赶
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(interval_seconds = self.interval.as_secs(), "订单扫描器已启动");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.scan_once().await;
                }
            }
        }

        info!("订单扫描器已停止");
    }

    async fn scan_once(&self) {
        let numbers = match self.store.orders_for_processing().await {
            Ok(numbers) => numbers,
            // 查询失败只影响本轮，下个 tick 重试
            Err(e) => {
                error!(error = %e, "扫描非终态订单失败");
                return;
            }
        };

        if numbers.is_empty() {
            return;
        }

        let total = numbers.len();
        let enqueued = numbers
            .into_iter()
            .filter(|number| self.queue.enqueue(number))
            .count();

        debug!(total, enqueued, "扫描轮次完成");
    }
}
