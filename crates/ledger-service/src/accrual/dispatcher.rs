//! 对账任务队列与 worker 池
//!
//! 扫描器把非终态订单号投入 [`OrderQueue`]，worker 池并发消费，
//! 逐单调用计算服务并把终态结论写回账本。
//!
//! 队列带在途去重：同一订单号从入队到处理完毕只会在管道中出现一次，
//! 扫描器的周期性重复投喂因此不会造成重复请求。正因为有去重，
//! 队列长度被在途订单数天然封顶，无界 channel 不会失控增长。

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::accrual::client::{AccrualApi, AccrualOutcome};
use crate::accrual::gate::PauseGate;
use crate::models::CreditOutcome;
use crate::store::LedgerStorage;

/// 带在途去重的订单号队列
pub struct OrderQueue {
    tx: mpsc::UnboundedSender<String>,
    in_flight: DashMap<String, ()>,
}

impl OrderQueue {
    /// 创建队列，接收端交给 worker 池
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Arc::new(Self {
            tx,
            in_flight: DashMap::new(),
        });
        (queue, rx)
    }

    /// 入队一个订单号，已在途则跳过
    pub fn enqueue(&self, number: &str) -> bool {
        use dashmap::mapref::entry::Entry;

        match self.in_flight.entry(number.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(());
                // 接收端只在整体停机时关闭，此时丢弃即可
                if self.tx.send(number.to_string()).is_err() {
                    self.in_flight.remove(number);
                    return false;
                }
                true
            }
        }
    }

    /// 重新入队（保留在途标记，扫描器不会重复投喂）
    fn requeue(&self, number: String) {
        if self.tx.send(number.clone()).is_err() {
            self.in_flight.remove(&number);
        }
    }

    /// 处理完毕，清除在途标记
    fn finish(&self, number: &str) {
        self.in_flight.remove(number);
    }

    /// 当前在途订单数
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }
}

/// 对账 worker 池
///
/// 所有 worker 共享同一个接收端（互斥锁保护），
/// 任务在 worker 间自然负载均衡。
pub struct Dispatcher {
    store: Arc<dyn LedgerStorage>,
    client: Arc<dyn AccrualApi>,
    gate: Arc<PauseGate>,
    queue: Arc<OrderQueue>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn LedgerStorage>,
        client: Arc<dyn AccrualApi>,
        gate: Arc<PauseGate>,
        queue: Arc<OrderQueue>,
    ) -> Self {
        Self {
            store,
            client,
            gate,
            queue,
        }
    }

    /// 启动 worker 池，返回各 worker 的任务句柄
    pub fn spawn_workers(
        self: Arc<Self>,
        count: usize,
        rx: mpsc::UnboundedReceiver<String>,
        shutdown: watch::Receiver<bool>,
    ) -> Vec<JoinHandle<()>> {
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        (0..count)
            .map(|worker_id| {
                let dispatcher = self.clone();
                let rx = rx.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    dispatcher.worker_loop(worker_id, rx, shutdown).await;
                })
            })
            .collect()
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(worker_id, "对账 worker 已启动");

        loop {
            tokio::select! {
                // 停机信号随时生效，包括限流冷却睡眠期间
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                maybe = async {
                    // 限流冷却期间不取任务
                    self.gate.wait_ready().await;
                    rx.lock().await.recv().await
                } => {
                    match maybe {
                        Some(number) => self.handle_order(&number).await,
                        // 发送端全部关闭，队列不会再有任务
                        None => break,
                    }
                }
            }
        }

        info!(worker_id, "对账 worker 已停止");
    }

    /// 处理单个订单的对账
    ///
    /// - 终态结论 -> 入账并清除在途标记
    /// - Pending / 服务不可用 -> 清除标记，等下个扫描周期重试
    /// - 限流 -> 关闭暂停门并重新入队（保留标记，冷却后立即重试）
    async fn handle_order(&self, number: &str) {
        // 取任务前的 wait_ready 不够：已经阻塞在 recv 上的 worker
        // 早就通过了那次检查，门关闭后仍可能立刻收到被重新入队的订单。
        // 因此外呼前必须再次确认门是开的，关着就放回队列退回等待，
        // 每个 worker 最多弹回一次，随后都会停在 wait_ready 上。
        if self.gate.is_raised() {
            self.queue.requeue(number.to_string());
            return;
        }

        let outcome = match self.client.order_status(number).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(order = number, error = %e, "对账查询失败");
                self.queue.finish(number);
                return;
            }
        };

        match outcome {
            AccrualOutcome::Resolved {
                status,
                accrual_minor,
            } => {
                match self.store.apply_accrual(number, status, accrual_minor).await {
                    Ok(CreditOutcome::Applied) => {
                        info!(order = number, status = %status, accrual_minor, "订单对账完成");
                    }
                    Ok(CreditOutcome::AlreadyFinal) => {
                        debug!(order = number, "订单已是终态，忽略本次结论");
                    }
                    Ok(CreditOutcome::UnknownOrder) => {
                        warn!(order = number, "计算服务返回了账本中不存在的订单");
                    }
                    Err(e) => {
                        // 入账失败不丢任务：订单仍是非终态，扫描器会重新投喂
                        error!(order = number, error = %e, "入账失败，等待重试");
                    }
                }
                self.queue.finish(number);
            }
            AccrualOutcome::Pending => {
                debug!(order = number, "订单仍在计算中");
                self.queue.finish(number);
            }
            AccrualOutcome::RateLimited { retry_after } => {
                if self.gate.raise(retry_after) {
                    warn!(order = number, "触发限流，流水线暂停");
                }
                self.queue.requeue(number.to_string());
            }
            AccrualOutcome::Unavailable { reason } => {
                warn!(order = number, reason, "计算服务不可用，等待下个扫描周期");
                self.queue.finish(number);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::time::Duration;
    use tokio::time::Instant;

    use crate::models::{OrderStatus, SubmissionOutcome};
    use crate::store::MemoryLedger;
    use loyalty_shared::Result;

    /// 脚本化的计算服务：按订单号依次吐出预设结果，并记录每次调用时刻
    struct ScriptedAccrual {
        scripts: Mutex<HashMap<String, VecDeque<AccrualOutcome>>>,
        calls: Mutex<Vec<(String, Instant)>>,
    }

    impl ScriptedAccrual {
        fn new() -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn script(&self, number: &str, outcomes: Vec<AccrualOutcome>) {
            self.scripts
                .lock()
                .insert(number.to_string(), outcomes.into());
        }

        fn calls(&self) -> Vec<(String, Instant)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl AccrualApi for ScriptedAccrual {
        async fn order_status(&self, number: &str) -> Result<AccrualOutcome> {
            self.calls.lock().push((number.to_string(), Instant::now()));
            let outcome = self
                .scripts
                .lock()
                .get_mut(number)
                .and_then(|queue| queue.pop_front())
                .unwrap_or(AccrualOutcome::Pending);
            Ok(outcome)
        }
    }

    struct Harness {
        store: Arc<MemoryLedger>,
        client: Arc<ScriptedAccrual>,
        queue: Arc<OrderQueue>,
        shutdown_tx: watch::Sender<bool>,
        workers: Vec<JoinHandle<()>>,
    }

    impl Harness {
        fn start(workers: usize, cooldown: Duration) -> Self {
            let store = Arc::new(MemoryLedger::new());
            let client = Arc::new(ScriptedAccrual::new());
            let gate = Arc::new(PauseGate::new(cooldown));
            let (queue, rx) = OrderQueue::new();
            let (shutdown_tx, shutdown_rx) = watch::channel(false);

            let dispatcher = Arc::new(Dispatcher::new(
                store.clone(),
                client.clone(),
                gate,
                queue.clone(),
            ));
            let handles = dispatcher.spawn_workers(workers, rx, shutdown_rx);

            Self {
                store,
                client,
                queue,
                shutdown_tx,
                workers: handles,
            }
        }

        async fn stop(self) {
            self.shutdown_tx.send(true).unwrap();
            for handle in self.workers {
                handle.await.unwrap();
            }
        }
    }

    async fn seed_order(store: &MemoryLedger, number: &str) {
        store.create_account("alice").await.unwrap();
        assert_eq!(
            store.submit_order("alice", number).await.unwrap(),
            SubmissionOutcome::Accepted
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolved_order_is_credited_and_cleared() {
        let harness = Harness::start(2, Duration::from_secs(60));
        seed_order(&harness.store, "79927398713").await;

        harness.client.script(
            "79927398713",
            vec![AccrualOutcome::Resolved {
                status: OrderStatus::Processed,
                accrual_minor: 250,
            }],
        );

        assert!(harness.queue.enqueue("79927398713"));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let balance = harness.store.balance("alice").await.unwrap();
        assert_eq!(balance.current_minor, 250);
        // 处理完毕后在途标记清空，后续扫描可以重新投喂
        assert_eq!(harness.queue.in_flight_count(), 0);

        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_deduplicates_in_flight_orders() {
        let harness = Harness::start(1, Duration::from_secs(60));
        seed_order(&harness.store, "79927398713").await;

        // worker 还没来得及消费时连续投喂三次，只有第一次入队
        assert!(harness.queue.enqueue("79927398713"));
        assert!(!harness.queue.enqueue("79927398713"));
        assert!(!harness.queue.enqueue("79927398713"));

        tokio::time::sleep(Duration::from_millis(100)).await;

        // 脚本只配了默认 Pending，一次调用即处理完
        assert_eq!(harness.client.calls().len(), 1);

        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_pauses_pipeline_for_cooldown() {
        let cooldown = Duration::from_secs(60);
        let harness = Harness::start(2, cooldown);
        seed_order(&harness.store, "79927398713").await;

        harness.client.script(
            "79927398713",
            vec![
                AccrualOutcome::RateLimited { retry_after: None },
                AccrualOutcome::Resolved {
                    status: OrderStatus::Processed,
                    accrual_minor: 250,
                },
            ],
        );

        harness.queue.enqueue("79927398713");
        // 虚拟时钟自动推进，直到重试完成
        tokio::time::sleep(cooldown + Duration::from_secs(5)).await;

        let calls = harness.client.calls();
        assert_eq!(calls.len(), 2, "限流后应恰好重试一次");
        // 两次调用之间的间隔不小于冷却期
        let gap = calls[1].1.duration_since(calls[0].1);
        assert!(gap >= cooldown, "重试间隔 {gap:?} 小于冷却期 {cooldown:?}");

        let balance = harness.store.balance("alice").await.unwrap();
        assert_eq!(balance.current_minor, 250);

        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_parked_worker_does_not_bypass_cooldown() {
        let cooldown = Duration::from_secs(60);
        let harness = Harness::start(4, cooldown);
        seed_order(&harness.store, "79927398713").await;

        harness.client.script(
            "79927398713",
            vec![
                AccrualOutcome::RateLimited { retry_after: None },
                AccrualOutcome::Resolved {
                    status: OrderStatus::Processed,
                    accrual_minor: 250,
                },
            ],
        );

        // 让所有 worker 先阻塞在取任务上——它们都已通过取任务前的
        // 门检查。此时限流并重新入队的订单会立刻被某个 worker 收到，
        // 外呼仍然必须等到冷却期结束。
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.queue.enqueue("79927398713");
        tokio::time::sleep(cooldown + Duration::from_secs(5)).await;

        let calls = harness.client.calls();
        assert_eq!(calls.len(), 2, "冷却期内不得发起外呼");
        let gap = calls[1].1.duration_since(calls[0].1);
        assert!(gap >= cooldown, "重试间隔 {gap:?} 小于冷却期 {cooldown:?}");

        assert_eq!(
            harness.store.balance("alice").await.unwrap().current_minor,
            250
        );

        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_order_clears_marker_for_next_scan() {
        let harness = Harness::start(1, Duration::from_secs(60));
        seed_order(&harness.store, "79927398713").await;

        harness
            .client
            .script("79927398713", vec![AccrualOutcome::Pending]);

        harness.queue.enqueue("79927398713");
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(harness.queue.in_flight_count(), 0);
        // 订单仍是非终态，扫描器下轮还会看到它
        assert_eq!(
            harness.store.orders_for_processing().await.unwrap(),
            vec!["79927398713".to_string()]
        );

        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unavailable_service_does_not_stall_workers() {
        let harness = Harness::start(2, Duration::from_secs(60));
        seed_order(&harness.store, "79927398713").await;
        harness
            .store
            .submit_order("alice", "4561261212345467")
            .await
            .unwrap();

        harness.client.script(
            "79927398713",
            vec![AccrualOutcome::Unavailable {
                reason: "connection refused".to_string(),
            }],
        );
        harness.client.script(
            "4561261212345467",
            vec![AccrualOutcome::Resolved {
                status: OrderStatus::Invalid,
                accrual_minor: 0,
            }],
        );

        harness.queue.enqueue("79927398713");
        harness.queue.enqueue("4561261212345467");
        tokio::time::sleep(Duration::from_millis(100)).await;

        // 一个订单失败不影响另一个订单完成
        let orders = harness.store.orders("alice").await.unwrap();
        let invalid = orders
            .iter()
            .find(|o| o.number == "4561261212345467")
            .unwrap();
        assert_eq!(invalid.status, OrderStatus::Invalid);
        assert_eq!(harness.queue.in_flight_count(), 0);

        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_workers_drain_and_exit_on_shutdown() {
        let harness = Harness::start(4, Duration::from_secs(60));
        seed_order(&harness.store, "79927398713").await;

        harness.queue.enqueue("79927398713");
        tokio::time::sleep(Duration::from_millis(100)).await;

        // stop 内部会等待全部 worker 退出，悬挂即测试失败
        harness.stop().await;
    }
}
