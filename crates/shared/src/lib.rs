//! 积分账本系统共享库
//!
//! 提供各服务共用的基础设施：错误类型、配置加载、数据库连接池、
//! 日志初始化以及订单号校验。业务逻辑不放在这里——
//! 账本事务和对账流水线都在 `loyalty-ledger-service` 中实现。

pub mod config;
pub mod database;
pub mod error;
pub mod luhn;
pub mod observability;

pub use error::{LoyaltyError, Result};
