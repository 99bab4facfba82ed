//! 订单受理服务
//!
//! 负责订单号校验与上传入口。通过校验的订单以 REGISTERED 状态入库，
//! 之后由扫描器捡起、送往对账流水线。

use std::sync::Arc;

use tracing::{info, warn};

use loyalty_shared::{luhn, LoyaltyError, Result};

use crate::models::{Order, SubmissionOutcome};
use crate::store::LedgerStorage;

/// 订单受理服务
#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn LedgerStorage>,
}

impl OrderService {
    pub fn new(store: Arc<dyn LedgerStorage>) -> Self {
        Self { store }
    }

    /// 上传订单号
    ///
    /// 订单号必须通过 Luhn 校验，否则返回 `InvalidOrderNumber`，
    /// 不产生任何状态变化。
    pub async fn submit(&self, username: &str, number: &str) -> Result<SubmissionOutcome> {
        if !luhn::is_valid(number) {
            warn!(username, order = number, "订单号未通过校验，拒绝受理");
            return Err(LoyaltyError::InvalidOrderNumber {
                number: number.to_string(),
            });
        }

        let outcome = self.store.submit_order(username, number).await?;
        if outcome == SubmissionOutcome::AlreadyUploaded {
            info!(username, order = number, "订单已上传过，幂等返回");
        }
        Ok(outcome)
    }

    /// 用户订单列表，按上传时间倒序
    pub async fn orders(&self, username: &str) -> Result<Vec<Order>> {
        self.store.orders(username).await
    }
}
