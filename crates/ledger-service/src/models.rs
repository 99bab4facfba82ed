//! 账本领域模型
//!
//! 订单状态机：REGISTERED -> PROCESSING -> {PROCESSED, INVALID}。
//! PROCESSED / INVALID 为终态，后续对账不得再改写。
//! 所有金额字段均为最小单位（分）的整数。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 订单状态
///
/// 与外部计算服务交换、落库存储时均使用大写字符串形式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Registered,
    Processing,
    Processed,
    Invalid,
}

impl OrderStatus {
    /// 是否为终态（不再参与对账）
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Processed | Self::Invalid)
    }

    /// 落库/传输使用的字符串形式
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "REGISTERED",
            Self::Processing => "PROCESSING",
            Self::Processed => "PROCESSED",
            Self::Invalid => "INVALID",
        }
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "REGISTERED" => Ok(Self::Registered),
            "PROCESSING" => Ok(Self::Processing),
            "PROCESSED" => Ok(Self::Processed),
            "INVALID" => Ok(Self::Invalid),
            other => Err(format!("未知的订单状态: {other}")),
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 订单
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub number: String,
    pub username: String,
    pub status: OrderStatus,
    /// 已确认的积分（最小单位）
    pub accrual_minor: i64,
    pub uploaded_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// 账户余额快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountBalance {
    /// 当前可用余额（最小单位），任何时刻不为负
    pub current_minor: i64,
    /// 累计核销金额（最小单位），单调不减
    pub withdrawn_minor: i64,
}

/// 核销记录
///
/// 每个订单最多对应一条非零核销。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdrawal {
    pub order_number: String,
    pub amount_minor: i64,
    pub processed_at: DateTime<Utc>,
}

/// 入账事务的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreditOutcome {
    /// 状态与积分已写入（PROCESSED 时余额同步增加）
    Applied,
    /// 订单已处于终态，本次调用为空操作
    AlreadyFinal,
    /// 订单号不在账本中
    UnknownOrder,
}

/// 订单上传的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionOutcome {
    /// 新订单已受理，等待对账
    Accepted,
    /// 同一用户重复上传，幂等接受
    AlreadyUploaded,
}
