//! 限流暂停门
//!
//! 计算服务返回 429 时，整条对账流水线要统一静默一个冷却期，
//! 而不是各 worker 各自退避。PauseGate 持有一个「恢复时刻」，
//! 所有 worker 取任务前先经过它：
//! - `raise` 是幂等的，冷却期内的重复限流信号不会延长暂停
//! - `wait_ready` 在门开启时立即返回，否则睡到恢复时刻

use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::info;

/// 流水线暂停门
pub struct PauseGate {
    cooldown: Duration,
    paused_until: Mutex<Option<Instant>>,
}

impl PauseGate {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            paused_until: Mutex::new(None),
        }
    }

    /// 发出限流信号，返回是否真正触发了新的暂停
    ///
    /// 门已关闭时调用是空操作——同一轮限流中多个 worker
    /// 几乎同时收到 429，只有第一个信号生效。
    pub fn raise(&self, retry_after: Option<Duration>) -> bool {
        let mut paused_until = self.paused_until.lock();
        let now = Instant::now();

        if let Some(until) = *paused_until {
            if until > now {
                return false;
            }
        }

        let pause = retry_after.unwrap_or(self.cooldown);
        *paused_until = Some(now + pause);
        info!(pause_seconds = pause.as_secs(), "对账流水线进入冷却");
        true
    }

    /// 门当前是否关闭
    pub fn is_raised(&self) -> bool {
        self.paused_until
            .lock()
            .is_some_and(|until| until > Instant::now())
    }

    /// 等待门开启
    ///
    /// 睡眠期间若有新的 `raise`（冷却结束后再次限流），
    /// 循环会读到新的恢复时刻继续等待。
    pub async fn wait_ready(&self) {
        loop {
            let until = {
                let mut paused_until = self.paused_until.lock();
                match *paused_until {
                    Some(until) if until > Instant::now() => until,
                    _ => {
                        *paused_until = None;
                        return;
                    }
                }
            };
            tokio::time::sleep_until(until).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_open_gate_passes_immediately() {
        let gate = PauseGate::new(Duration::from_secs(60));
        assert!(!gate.is_raised());
        // 不应悬挂
        gate.wait_ready().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_raise_is_idempotent_within_cooldown() {
        let gate = PauseGate::new(Duration::from_secs(60));

        assert!(gate.raise(None));
        assert!(gate.is_raised());

        // 冷却期内的重复信号不生效、不延长
        assert!(!gate.raise(None));
        assert!(!gate.raise(Some(Duration::from_secs(600))));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(!gate.is_raised());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_ready_blocks_for_cooldown() {
        let gate = PauseGate::new(Duration::from_secs(60));
        gate.raise(None);

        let start = Instant::now();
        // 虚拟时钟下所有 sleep 自动推进，elapsed 反映等待时长
        gate.wait_ready().await;
        assert!(start.elapsed() >= Duration::from_secs(60));
        assert!(!gate.is_raised());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_overrides_default_cooldown() {
        let gate = PauseGate::new(Duration::from_secs(60));
        gate.raise(Some(Duration::from_secs(5)));

        let start = Instant::now();
        gate.wait_ready().await;
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(5));
        assert!(waited < Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_raise_again_after_cooldown() {
        let gate = PauseGate::new(Duration::from_secs(60));

        assert!(gate.raise(None));
        tokio::time::advance(Duration::from_secs(61)).await;

        // 冷却结束后新一轮限流重新生效
        assert!(gate.raise(None));
        assert!(gate.is_raised());
    }
}
