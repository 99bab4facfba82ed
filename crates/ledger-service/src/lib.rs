//! 积分账本服务
//!
//! 维护用户的积分余额与订单记录：用户上传的订单由后台对账流水线
//! 向外部计算服务逐单确认，确认的积分入账；用户可针对新订单
//! 核销积分出账。两条资金路径共用同一套事务与幂等纪律，
//! 保证余额任何时刻非负、每笔积分只入账一次、每个订单只核销一次。

pub mod accrual;
pub mod models;
pub mod service;
pub mod store;
