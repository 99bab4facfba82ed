//! PostgreSQL 账本实现
//!
//! 入账与出账都以锁序「订单行 -> 账户行」执行，避免两条路径交叉加锁
//! 造成死锁。事务句柄离开作用域即回滚，只有显式 commit 的路径会落盘，
//! 因此任何提前返回（包括业务拒绝）都不会留下部分写入。

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use tracing::{debug, info};

use loyalty_shared::{LoyaltyError, Result};

use super::LedgerStorage;
use crate::models::{
    AccountBalance, CreditOutcome, Order, OrderStatus, SubmissionOutcome, Withdrawal,
};

/// 基于 PostgreSQL 的账本存储
#[derive(Clone)]
pub struct PgLedgerStore {
    pool: PgPool,
}

impl PgLedgerStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 判断是否为唯一约束冲突（Postgres 错误码 23505）
    fn is_unique_violation(err: &sqlx::Error) -> bool {
        err.as_database_error()
            .and_then(|e| e.code())
            .is_some_and(|code| code == "23505")
    }

    /// 把库里的状态字符串解析为枚举，解析失败说明数据被外部篡改
    fn parse_status(raw: &str) -> Result<OrderStatus> {
        OrderStatus::from_str(raw).map_err(LoyaltyError::Internal)
    }
}

#[async_trait]
impl LedgerStorage for PgLedgerStore {
    async fn create_account(&self, username: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query("INSERT INTO users (username) VALUES ($1)")
            .bind(username)
            .execute(&mut *tx)
            .await;

        if let Err(e) = inserted {
            if Self::is_unique_violation(&e) {
                return Err(LoyaltyError::AlreadyExists {
                    entity: "user".to_string(),
                    id: username.to_string(),
                });
            }
            return Err(e.into());
        }

        // 积分账户与用户同一事务创建，任一失败整体回滚
        sqlx::query("INSERT INTO loyalty_accounts (username) VALUES ($1)")
            .bind(username)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        info!(username, "用户及积分账户已创建");
        Ok(())
    }

    async fn submit_order(&self, username: &str, number: &str) -> Result<SubmissionOutcome> {
        let owner: Option<String> =
            sqlx::query_scalar("SELECT username FROM orders WHERE order_number = $1")
                .bind(number)
                .fetch_optional(&self.pool)
                .await?;

        match owner {
            Some(owner) if owner == username => return Ok(SubmissionOutcome::AlreadyUploaded),
            Some(_) => {
                return Err(LoyaltyError::OrderConflict {
                    number: number.to_string(),
                });
            }
            None => {}
        }

        let inserted = sqlx::query(
            "INSERT INTO orders (order_number, username, status) VALUES ($1, $2, 'REGISTERED')",
        )
        .bind(number)
        .bind(username)
        .execute(&self.pool)
        .await;

        if let Err(e) = inserted {
            // 并发上传同一订单号时输掉竞争，按最终归属重新判定
            if Self::is_unique_violation(&e) {
                let owner: Option<String> =
                    sqlx::query_scalar("SELECT username FROM orders WHERE order_number = $1")
                        .bind(number)
                        .fetch_optional(&self.pool)
                        .await?;
                return match owner {
                    Some(owner) if owner == username => Ok(SubmissionOutcome::AlreadyUploaded),
                    _ => Err(LoyaltyError::OrderConflict {
                        number: number.to_string(),
                    }),
                };
            }
            return Err(e.into());
        }

        info!(username, order = number, "新订单已受理，等待对账");
        Ok(SubmissionOutcome::Accepted)
    }

    async fn orders(&self, username: &str) -> Result<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT order_number, username, status, accrual, withdrawn, uploaded_at, processed_at
            FROM orders
            WHERE username = $1
            ORDER BY uploaded_at DESC
            "#,
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await?;

        let mut orders = Vec::with_capacity(rows.len());
        for row in rows {
            let status: String = row.get("status");
            orders.push(Order {
                number: row.get("order_number"),
                username: row.get("username"),
                status: Self::parse_status(&status)?,
                accrual_minor: row.get("accrual"),
                uploaded_at: row.get("uploaded_at"),
                processed_at: row.get("processed_at"),
            });
        }
        Ok(orders)
    }

    async fn orders_for_processing(&self) -> Result<Vec<String>> {
        let numbers: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT order_number
            FROM orders
            WHERE status IN ('REGISTERED', 'PROCESSING')
            ORDER BY uploaded_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

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

        let mut tx = self.pool.begin().await?;

        // 条件更新：仅非终态订单可被改写，终态订单在这里天然免疫重复入账
        let owner: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE orders
            SET status = $2, accrual = $3, processed_at = now()
            WHERE order_number = $1
              AND status NOT IN ('PROCESSED', 'INVALID')
            RETURNING username
            "#,
        )
        .bind(number)
        .bind(status.as_str())
        .bind(accrual_minor)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(username) = owner else {
            // 没有命中行：要么订单不存在，要么已是终态
            let exists: Option<String> =
                sqlx::query_scalar("SELECT status FROM orders WHERE order_number = $1")
                    .bind(number)
                    .fetch_optional(&mut *tx)
                    .await?;
            return Ok(match exists {
                Some(_) => CreditOutcome::AlreadyFinal,
                None => CreditOutcome::UnknownOrder,
            });
        };

        // PROCESSED 才增加余额；此 UPDATE 对账户行加锁，
        // 并发入账/出账在这里串行化，增量不会丢失
        if status == OrderStatus::Processed && accrual_minor > 0 {
            sqlx::query(
                "UPDATE loyalty_accounts SET current_balance = current_balance + $2 WHERE username = $1",
            )
            .bind(&username)
            .bind(accrual_minor)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        info!(
            order = number,
            username,
            status = %status,
            accrual_minor,
            "对账结果已入账"
        );
        Ok(CreditOutcome::Applied)
    }

    async fn balance(&self, username: &str) -> Result<AccountBalance> {
        let row = sqlx::query(
            "SELECT current_balance, total_withdrawn FROM loyalty_accounts WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| LoyaltyError::NotFound {
            entity: "loyalty_account".to_string(),
            id: username.to_string(),
        })?;

        Ok(AccountBalance {
            current_minor: row.get("current_balance"),
            withdrawn_minor: row.get("total_withdrawn"),
        })
    }

    async fn withdraw(&self, username: &str, number: &str, amount_minor: i64) -> Result<()> {
        if amount_minor <= 0 {
            return Err(LoyaltyError::InvalidAmount {
                amount: amount_minor,
            });
        }

        let mut tx = self.pool.begin().await?;

        // 锁序与入账一致：先订单行，后账户行
        let order_row = sqlx::query(
            "SELECT username, withdrawn FROM orders WHERE order_number = $1 FOR UPDATE",
        )
        .bind(number)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| LoyaltyError::NotFound {
            entity: "order".to_string(),
            id: number.to_string(),
        })?;

        let owner: String = order_row.get("username");
        let withdrawn: i64 = order_row.get("withdrawn");

        if owner != username {
            return Err(LoyaltyError::OrderConflict {
                number: number.to_string(),
            });
        }

        let balance: i64 = sqlx::query_scalar(
            "SELECT current_balance FROM loyalty_accounts WHERE username = $1 FOR UPDATE",
        )
        .bind(username)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| LoyaltyError::NotFound {
            entity: "loyalty_account".to_string(),
            id: username.to_string(),
        })?;

        // 校验顺序：先余额，后重复核销
        if amount_minor > balance {
            return Err(LoyaltyError::InsufficientFunds {
                requested: amount_minor,
                available: balance,
            });
        }
        if withdrawn != 0 {
            return Err(LoyaltyError::AlreadySettled {
                number: number.to_string(),
            });
        }

        sqlx::query(
            "UPDATE orders SET withdrawn = $2, processed_at = now() WHERE order_number = $1",
        )
        .bind(number)
        .bind(amount_minor)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            UPDATE loyalty_accounts
            SET current_balance = current_balance - $2,
                total_withdrawn = total_withdrawn + $2
            WHERE username = $1
            "#,
        )
        .bind(username)
        .bind(amount_minor)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        info!(username, order = number, amount_minor, "积分核销完成");
        Ok(())
    }

    async fn withdrawals(&self, username: &str) -> Result<Vec<Withdrawal>> {
        let rows = sqlx::query(
            r#"
            SELECT order_number, withdrawn, processed_at
            FROM orders
            WHERE username = $1 AND withdrawn > 0
            ORDER BY processed_at DESC
            "#,
        )
        .bind(username)
        .fetch_all(&self.pool)
        .await?;

        let withdrawals = rows
            .into_iter()
            .map(|row| {
                let processed_at: Option<DateTime<Utc>> = row.get("processed_at");
                Withdrawal {
                    order_number: row.get("order_number"),
                    amount_minor: row.get("withdrawn"),
                    // withdrawn > 0 的行必然写过 processed_at，容错取当前时间
                    processed_at: processed_at.unwrap_or_else(Utc::now),
                }
            })
            .collect();

        debug!(username, "核销记录查询完成");
        Ok(withdrawals)
    }
}
