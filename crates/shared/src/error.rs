//! 统一错误处理模块
//!
//! 定义系统中所有共享的错误类型，使用 thiserror 提供良好的错误信息。
//! 对账循环依赖 `is_retryable` 区分瞬时故障（记录日志后等下一轮扫描重试）
//! 与业务拒绝（直接向调用方返回，不重试）。

use thiserror::Error;

/// 系统错误类型
#[derive(Debug, Error)]
pub enum LoyaltyError {
    // ==================== 数据库错误 ====================
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库迁移失败: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("记录未找到: {entity} {id}")]
    NotFound { entity: String, id: String },

    #[error("记录已存在: {entity} {id}")]
    AlreadyExists { entity: String, id: String },

    // ==================== 业务逻辑错误 ====================
    /// 订单号未通过 Luhn 校验
    #[error("订单号不合法: {number}")]
    InvalidOrderNumber { number: String },

    /// 订单号已被其他用户上传，归属不可转移
    #[error("订单号已被其他用户占用: {number}")]
    OrderConflict { number: String },

    /// 账户余额不足以完成本次扣减
    #[error("积分余额不足: 需要 {requested}, 当前 {available}")]
    InsufficientFunds { requested: i64, available: i64 },

    /// 每个订单最多支持一次非零核销
    #[error("该订单已存在核销记录: {number}")]
    AlreadySettled { number: String },

    /// 核销金额必须为正数
    #[error("核销金额不合法: {amount}")]
    InvalidAmount { amount: i64 },

    // ==================== 外部服务错误 ====================
    #[error("外部服务错误: {service} - {message}")]
    ExternalService { service: String, message: String },

    #[error("外部服务超时: {service}")]
    ExternalServiceTimeout { service: String },

    // ==================== 通用错误 ====================
    #[error("内部错误: {0}")]
    Internal(String),
}

/// 错误结果类型别名
pub type Result<T> = std::result::Result<T, LoyaltyError>;

impl LoyaltyError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Database(_) => "DATABASE_ERROR",
            Self::Migrate(_) => "MIGRATE_ERROR",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::AlreadyExists { .. } => "ALREADY_EXISTS",
            Self::InvalidOrderNumber { .. } => "INVALID_ORDER_NUMBER",
            Self::OrderConflict { .. } => "ORDER_CONFLICT",
            Self::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            Self::AlreadySettled { .. } => "ALREADY_SETTLED",
            Self::InvalidAmount { .. } => "INVALID_AMOUNT",
            Self::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            Self::ExternalServiceTimeout { .. } => "EXTERNAL_SERVICE_TIMEOUT",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 是否为可重试错误
    ///
    /// 数据库故障与外部服务故障视为瞬时，由下一轮扫描重试；
    /// 业务拒绝（冲突、余额不足、重复核销）重试也不会成功，不在此列。
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Database(_)
                | Self::ExternalService { .. }
                | Self::ExternalServiceTimeout { .. }
        )
    }
}
