//! 账本存储层
//!
//! `LedgerStorage` 是核心与关系存储之间唯一的边界：
//! 对账流水线（入账）与核销处理器（出账）都通过它修改余额和订单状态，
//! 两条路径共用同一套事务纪律，保证余额永不为负。
//!
//! 提供两个实现：
//! - [`postgres::PgLedgerStore`]：生产实现，基于 sqlx 事务
//! - [`memory::MemoryLedger`]：进程内实现，供流水线测试使用

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use loyalty_shared::Result;

use crate::models::{
    AccountBalance, CreditOutcome, Order, OrderStatus, SubmissionOutcome, Withdrawal,
};

pub use memory::MemoryLedger;
pub use postgres::PgLedgerStore;

/// 账本存储接口
///
/// 实现方必须保证：
/// - 终态订单（PROCESSED / INVALID）的状态与积分不被改写
/// - 入账与出账对同一账户串行化，余额任何时刻 >= 0
/// - 任何失败都整体回滚，不留下部分写入
#[async_trait]
pub trait LedgerStorage: Send + Sync {
    /// 创建用户及其积分账户（单事务，二者同生同灭）
    async fn create_account(&self, username: &str) -> Result<()>;

    /// 上传订单号
    ///
    /// 同一用户重复上传幂等返回 `AlreadyUploaded`；
    /// 订单号已归属其他用户时返回 `OrderConflict`。
    async fn submit_order(&self, username: &str, number: &str) -> Result<SubmissionOutcome>;

    /// 用户订单列表，按上传时间倒序
    async fn orders(&self, username: &str) -> Result<Vec<Order>>;

    /// 全部非终态订单号，供扫描器投喂对账队列
    async fn orders_for_processing(&self) -> Result<Vec<String>>;

    /// 入账：写入对账结果并在 PROCESSED 时增加余额（单事务）
    ///
    /// 终态订单再次入账是空操作，返回 `AlreadyFinal`。
    async fn apply_accrual(
        &self,
        number: &str,
        status: OrderStatus,
        accrual_minor: i64,
    ) -> Result<CreditOutcome>;

    /// 账户余额
    async fn balance(&self, username: &str) -> Result<AccountBalance>;

    /// 出账：针对某订单核销积分（单事务）
    ///
    /// 余额不足返回 `InsufficientFunds`；该订单已有核销记录返回
    /// `AlreadySettled`；订单不存在或不属于该用户分别返回
    /// `NotFound` / `OrderConflict`。
    async fn withdraw(&self, username: &str, number: &str, amount_minor: i64) -> Result<()>;

    /// 用户核销记录，按核销时间倒序
    async fn withdrawals(&self, username: &str) -> Result<Vec<Withdrawal>>;
}
