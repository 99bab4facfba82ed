//! 业务服务层
//!
//! 存储层只管事务与不变式，所有入口校验（订单号 Luhn、金额合法性）
//! 在这一层完成，非法请求根本不会触达数据库。

pub mod orders;
pub mod withdrawals;

pub use orders::OrderService;
pub use withdrawals::WithdrawalProcessor;
