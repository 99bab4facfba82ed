//! 进程内账本实现
//!
//! 与 `PgLedgerStore` 遵守完全相同的语义（终态不可改写、幂等入账、
//! 单订单单次核销、余额非负），供流水线和服务层测试使用，
//! 无需真实数据库。所有操作在一把互斥锁内完成，天然满足串行化要求。

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use loyalty_shared::{LoyaltyError, Result};

use super::LedgerStorage;
use crate::models::{
    AccountBalance, CreditOutcome, Order, OrderStatus, SubmissionOutcome, Withdrawal,
};

#[derive(Debug, Clone)]
struct OrderState {
    username: String,
    status: OrderStatus,
    accrual_minor: i64,
    withdrawn_minor: i64,
    uploaded_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct AccountState {
    current_minor: i64,
    withdrawn_minor: i64,
}

#[derive(Default)]
struct Inner {
    accounts: HashMap<String, AccountState>,
    orders: HashMap<String, OrderState>,
}

/// 进程内账本
#[derive(Default)]
pub struct MemoryLedger {
    inner: Mutex<Inner>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStorage for MemoryLedger {
    async fn create_account(&self, username: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.accounts.contains_key(username) {
            return Err(LoyaltyError::AlreadyExists {
                entity: "user".to_string(),
                id: username.to_string(),
            });
        }
        inner
            .accounts
            .insert(username.to_string(), AccountState::default());
        Ok(())
    }

    async fn submit_order(&self, username: &str, number: &str) -> Result<SubmissionOutcome> {
        let mut inner = self.inner.lock();
        if let Some(order) = inner.orders.get(number) {
            if order.username == username {
                return Ok(SubmissionOutcome::AlreadyUploaded);
            }
            return Err(LoyaltyError::OrderConflict {
                number: number.to_string(),
            });
        }
        inner.orders.insert(
            number.to_string(),
            OrderState {
                username: username.to_string(),
                status: OrderStatus::Registered,
                accrual_minor: 0,
                withdrawn_minor: 0,
                uploaded_at: Utc::now(),
                processed_at: None,
            },
        );
        Ok(SubmissionOutcome::Accepted)
    }

    async fn orders(&self, username: &str) -> Result<Vec<Order>> {
        let inner = self.inner.lock();
        let mut orders: Vec<Order> = inner
            .orders
            .iter()
            .filter(|(_, o)| o.username == username)
            .map(|(number, o)| Order {
                number: number.clone(),
                username: o.username.clone(),
                status: o.status,
                accrual_minor: o.accrual_minor,
                uploaded_at: o.uploaded_at,
                processed_at: o.processed_at,
            })
            .collect();
        orders.sort_by(|a, b| b.uploaded_at.cmp(&a.uploaded_at));
        Ok(orders)
    }

    async fn orders_for_processing(&self) -> Result<Vec<String>> {
        let inner = self.inner.lock();
        let mut numbers: Vec<String> = inner
            .orders
            .iter()
            .filter(|(_, o)| !o.status.is_terminal())
            .map(|(number, _)| number.clone())
            .collect();
        numbers.sort();
        Ok(numbers)
    }

    async fn apply_accrual(
        &self,
        number: &str,
        status: OrderStatus,
        accrual_minor: i64,
    ) -> Result<CreditOutcome> {
        if accrual_minor < 0 {
            return Err(LoyaltyError::Internal(format!(
                "入账金额不得为负: {accrual_minor}"
            )));
        }

        let mut inner = self.inner.lock();
        let Some(order) = inner.orders.get(number) else {
            return Ok(CreditOutcome::UnknownOrder);
        };
        if order.status.is_terminal() {
            return Ok(CreditOutcome::AlreadyFinal);
        }

        let username = order.username.clone();
        let order = inner.orders.get_mut(number).expect("订单在锁内必然存在");
        order.status = status;
        order.accrual_minor = accrual_minor;
        order.processed_at = Some(Utc::now());

        if status == OrderStatus::Processed && accrual_minor > 0 {
            let account = inner.accounts.entry(username).or_default();
            account.current_minor += accrual_minor;
        }
        Ok(CreditOutcome::Applied)
    }

    async fn balance(&self, username: &str) -> Result<AccountBalance> {
        let inner = self.inner.lock();
        let account = inner
            .accounts
            .get(username)
            .ok_or_else(|| LoyaltyError::NotFound {
                entity: "loyalty_account".to_string(),
                id: username.to_string(),
            })?;
        Ok(AccountBalance {
            current_minor: account.current_minor,
            withdrawn_minor: account.withdrawn_minor,
        })
    }

    async fn withdraw(&self, username: &str, number: &str, amount_minor: i64) -> Result<()> {
        if amount_minor <= 0 {
            return Err(LoyaltyError::InvalidAmount {
                amount: amount_minor,
            });
        }

        let mut inner = self.inner.lock();

        let order = inner
            .orders
            .get(number)
            .ok_or_else(|| LoyaltyError::NotFound {
                entity: "order".to_string(),
                id: number.to_string(),
            })?;
        if order.username != username {
            return Err(LoyaltyError::OrderConflict {
                number: number.to_string(),
            });
        }
        let already_withdrawn = order.withdrawn_minor;

        let balance = inner
            .accounts
            .get(username)
            .map(|a| a.current_minor)
            .ok_or_else(|| LoyaltyError::NotFound {
                entity: "loyalty_account".to_string(),
                id: username.to_string(),
            })?;

        // 校验顺序与 Postgres 实现一致：先余额，后重复核销
        if amount_minor > balance {
            return Err(LoyaltyError::InsufficientFunds {
                requested: amount_minor,
                available: balance,
            });
        }
        if already_withdrawn != 0 {
            return Err(LoyaltyError::AlreadySettled {
                number: number.to_string(),
            });
        }

        let order = inner.orders.get_mut(number).expect("订单在锁内必然存在");
        order.withdrawn_minor = amount_minor;
        order.processed_at = Some(Utc::now());

        let account = inner
            .accounts
            .get_mut(username)
            .expect("账户在锁内必然存在");
        account.current_minor -= amount_minor;
        account.withdrawn_minor += amount_minor;
        Ok(())
    }

    async fn withdrawals(&self, username: &str) -> Result<Vec<Withdrawal>> {
        let inner = self.inner.lock();
        let mut withdrawals: Vec<Withdrawal> = inner
            .orders
            .iter()
            .filter(|(_, o)| o.username == username && o.withdrawn_minor > 0)
            .map(|(number, o)| Withdrawal {
                order_number: number.clone(),
                amount_minor: o.withdrawn_minor,
                processed_at: o.processed_at.unwrap_or_else(Utc::now),
            })
            .collect();
        withdrawals.sort_by(|a, b| b.processed_at.cmp(&a.processed_at));
        Ok(withdrawals)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn ledger_with_alice() -> MemoryLedger {
        let ledger = MemoryLedger::new();
        ledger.create_account("alice").await.unwrap();
        ledger
    }

    #[tokio::test]
    async fn test_create_account_rejects_duplicate() {
        let ledger = ledger_with_alice().await;
        let err = ledger.create_account("alice").await.unwrap_err();
        assert_eq!(err.code(), "ALREADY_EXISTS");
    }

    #[tokio::test]
    async fn test_submit_order_idempotent_for_owner() {
        let ledger = ledger_with_alice().await;

        let first = ledger.submit_order("alice", "79927398713").await.unwrap();
        assert_eq!(first, SubmissionOutcome::Accepted);

        let second = ledger.submit_order("alice", "79927398713").await.unwrap();
        assert_eq!(second, SubmissionOutcome::AlreadyUploaded);
    }

    #[tokio::test]
    async fn test_submit_order_conflict_for_other_user() {
        let ledger = ledger_with_alice().await;
        ledger.create_account("bob").await.unwrap();
        ledger.submit_order("alice", "79927398713").await.unwrap();

        let err = ledger
            .submit_order("bob", "79927398713")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ORDER_CONFLICT");
    }

    #[tokio::test]
    async fn test_credit_is_idempotent() {
        let ledger = ledger_with_alice().await;
        ledger.submit_order("alice", "79927398713").await.unwrap();

        let first = ledger
            .apply_accrual("79927398713", OrderStatus::Processed, 500)
            .await
            .unwrap();
        assert_eq!(first, CreditOutcome::Applied);

        // 第二次入账必须是空操作，余额只增加一次
        let second = ledger
            .apply_accrual("79927398713", OrderStatus::Processed, 500)
            .await
            .unwrap();
        assert_eq!(second, CreditOutcome::AlreadyFinal);

        let balance = ledger.balance("alice").await.unwrap();
        assert_eq!(balance.current_minor, 500);
    }

    #[tokio::test]
    async fn test_terminal_status_is_monotonic() {
        let ledger = ledger_with_alice().await;
        ledger.submit_order("alice", "79927398713").await.unwrap();
        ledger
            .apply_accrual("79927398713", OrderStatus::Processed, 250)
            .await
            .unwrap();

        // 终态订单不可被改回 PROCESSING，也不可改成 INVALID
        let outcome = ledger
            .apply_accrual("79927398713", OrderStatus::Invalid, 0)
            .await
            .unwrap();
        assert_eq!(outcome, CreditOutcome::AlreadyFinal);

        let orders = ledger.orders("alice").await.unwrap();
        assert_eq!(orders[0].status, OrderStatus::Processed);
        assert_eq!(orders[0].accrual_minor, 250);
    }

    #[tokio::test]
    async fn test_invalid_order_credits_nothing() {
        let ledger = ledger_with_alice().await;
        ledger.submit_order("alice", "79927398713").await.unwrap();

        ledger
            .apply_accrual("79927398713", OrderStatus::Invalid, 0)
            .await
            .unwrap();

        let balance = ledger.balance("alice").await.unwrap();
        assert_eq!(balance.current_minor, 0);
        // INVALID 是终态，不再出现在待处理列表
        assert!(ledger.orders_for_processing().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pending_status_keeps_order_in_scan() {
        let ledger = ledger_with_alice().await;
        ledger.submit_order("alice", "79927398713").await.unwrap();

        ledger
            .apply_accrual("79927398713", OrderStatus::Processing, 0)
            .await
            .unwrap();

        let pending = ledger.orders_for_processing().await.unwrap();
        assert_eq!(pending, vec!["79927398713".to_string()]);
    }

    #[tokio::test]
    async fn test_unknown_order_credit() {
        let ledger = ledger_with_alice().await;
        let outcome = ledger
            .apply_accrual("4561261212345467", OrderStatus::Processed, 100)
            .await
            .unwrap();
        assert_eq!(outcome, CreditOutcome::UnknownOrder);
    }

    #[tokio::test]
    async fn test_withdraw_insufficient_funds() {
        let ledger = ledger_with_alice().await;
        ledger.submit_order("alice", "79927398713").await.unwrap();
        ledger
            .apply_accrual("79927398713", OrderStatus::Processed, 1000)
            .await
            .unwrap();

        let err = ledger
            .withdraw("alice", "79927398713", 1500)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LoyaltyError::InsufficientFunds {
                requested: 1500,
                available: 1000
            }
        ));

        // 拒绝后余额不变
        let balance = ledger.balance("alice").await.unwrap();
        assert_eq!(balance.current_minor, 1000);
        assert_eq!(balance.withdrawn_minor, 0);
    }

    #[tokio::test]
    async fn test_withdraw_once_per_order() {
        let ledger = ledger_with_alice().await;
        ledger.submit_order("alice", "79927398713").await.unwrap();
        ledger
            .apply_accrual("79927398713", OrderStatus::Processed, 1000)
            .await
            .unwrap();

        ledger.withdraw("alice", "79927398713", 300).await.unwrap();

        let err = ledger
            .withdraw("alice", "79927398713", 100)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "ALREADY_SETTLED");

        let balance = ledger.balance("alice").await.unwrap();
        assert_eq!(balance.current_minor, 700);
        assert_eq!(balance.withdrawn_minor, 300);
    }

    #[tokio::test]
    async fn test_withdraw_updates_history() {
        let ledger = ledger_with_alice().await;
        ledger.submit_order("alice", "79927398713").await.unwrap();
        ledger
            .apply_accrual("79927398713", OrderStatus::Processed, 1000)
            .await
            .unwrap();
        ledger.withdraw("alice", "79927398713", 400).await.unwrap();

        let history = ledger.withdrawals("alice").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].order_number, "79927398713");
        assert_eq!(history[0].amount_minor, 400);
    }

    #[tokio::test]
    async fn test_concurrent_credits_and_debits_balance() {
        use std::sync::Arc;

        let ledger = Arc::new(MemoryLedger::new());
        ledger.create_account("alice").await.unwrap();

        // 10 个订单各入账 100，交错发起 5 次 40 的核销
        for i in 0..10u32 {
            let number = format!("order-{i}");
            ledger.submit_order("alice", &number).await.unwrap();
        }

        let mut credit_tasks = Vec::new();
        for i in 0..10u32 {
            let ledger = ledger.clone();
            credit_tasks.push(tokio::spawn(async move {
                ledger
                    .apply_accrual(&format!("order-{i}"), OrderStatus::Processed, 100)
                    .await
                    .unwrap();
            }));
        }
        for task in credit_tasks {
            task.await.unwrap();
        }

        let mut debit_tasks = Vec::new();
        for i in 0..5u32 {
            let ledger = ledger.clone();
            debit_tasks.push(tokio::spawn(async move {
                ledger
                    .withdraw("alice", &format!("order-{i}"), 40)
                    .await
                    .unwrap();
            }));
        }
        for task in debit_tasks {
            task.await.unwrap();
        }

        // 最终余额 = Σ入账 - Σ出账，且过程中任何快照都不可能为负
        let balance = ledger.balance("alice").await.unwrap();
        assert_eq!(balance.current_minor, 10 * 100 - 5 * 40);
        assert_eq!(balance.withdrawn_minor, 5 * 40);
    }
}
