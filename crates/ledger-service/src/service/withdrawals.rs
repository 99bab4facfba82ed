//! 积分核销处理器
//!
//! 出账入口：校验订单号与金额后交给存储层的单事务出账。
//! 余额检查、重复核销检查都在存储层的行锁内完成，
//! 这里不做任何「先查后改」的余额判断。

use std::sync::Arc;

use tracing::warn;

use loyalty_shared::{luhn, LoyaltyError, Result};

use crate::models::{AccountBalance, Withdrawal};
use crate::store::LedgerStorage;

/// 积分核销处理器
#[derive(Clone)]
pub struct WithdrawalProcessor {
    store: Arc<dyn LedgerStorage>,
}

impl WithdrawalProcessor {
    pub fn new(store: Arc<dyn LedgerStorage>) -> Self {
        Self { store }
    }

    /// 针对某订单核销积分
    ///
    /// 订单号必须通过 Luhn 校验，金额必须为正。
    /// 余额不足与重复核销由存储层在锁内裁决。
    pub async fn withdraw(&self, username: &str, number: &str, amount_minor: i64) -> Result<()> {
        if !luhn::is_valid(number) {
            warn!(username, order = number, "核销目标订单号未通过校验");
            return Err(LoyaltyError::InvalidOrderNumber {
                number: number.to_string(),
            });
        }
        if amount_minor <= 0 {
            return Err(LoyaltyError::InvalidAmount {
                amount: amount_minor,
            });
        }

        self.store.withdraw(username, number, amount_minor).await
    }

    /// 账户余额快照
    pub async fn balance(&self, username: &str) -> Result<AccountBalance> {
        self.store.balance(username).await
    }

    /// 核销记录，按时间倒序
    pub async fn withdrawals(&self, username: &str) -> Result<Vec<Withdrawal>> {
        self.store.withdrawals(username).await
    }
}
