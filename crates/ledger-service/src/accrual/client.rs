//! 外部积分计算服务客户端
//!
//! 封装 GET {base}/api/orders/{number} 调用，把 HTTP 层的各种响应
//! 归一成 [`AccrualOutcome`]。通过 AccrualApi trait 抽象，
//! 便于测试时注入脚本化的 mock 实现。
//!
//! 计算服务以浮点数返回积分，在这一层立即转换为最小单位整数，
//! 浮点数不会越过客户端边界进入账本。

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use loyalty_shared::config::AccrualConfig;
use loyalty_shared::{LoyaltyError, Result};

use crate::models::OrderStatus;

/// 对账查询的归一化结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccrualOutcome {
    /// 计算服务给出了终态结论，可以入账
    Resolved {
        status: OrderStatus,
        accrual_minor: i64,
    },
    /// 订单尚未注册或仍在计算，稍后由扫描器重新投喂
    Pending,
    /// 收到限流信号，调用方应暂停整条流水线
    RateLimited { retry_after: Option<Duration> },
    /// 服务不可达或响应异常，下个扫描周期重试
    Unavailable { reason: String },
}

/// 积分计算服务的抽象接口
#[async_trait]
pub trait AccrualApi: Send + Sync {
    /// 查询单个订单的计算结果
    ///
    /// 所有可预期的失败（超时、5xx、限流）都折叠进 [`AccrualOutcome`]，
    /// 只有构造请求这类本地错误才返回 `Err`。
    async fn order_status(&self, number: &str) -> Result<AccrualOutcome>;
}

/// 计算服务返回的响应体（order 字段与请求一致，不重复读取）
#[derive(Debug, Deserialize)]
struct AccrualReply {
    status: OrderStatus,
    #[serde(default)]
    accrual: Option<f64>,
}

/// 浮点积分转最小单位（四舍五入到分）
fn to_minor_units(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

/// 解析 Retry-After 头（只支持秒数形式）
fn parse_retry_after(raw: Option<&str>) -> Option<Duration> {
    raw.and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

/// 把 200 响应体归一为结果
///
/// REGISTERED / PROCESSING 等价于 Pending；无法解析的响应体视为
/// 服务异常，留待下个扫描周期重试。
fn classify_reply(body: &[u8]) -> AccrualOutcome {
    let reply: AccrualReply = match serde_json::from_slice(body) {
        Ok(reply) => reply,
        Err(e) => {
            return AccrualOutcome::Unavailable {
                reason: format!("响应体解析失败: {e}"),
            };
        }
    };

    match reply.status {
        OrderStatus::Processed => AccrualOutcome::Resolved {
            status: OrderStatus::Processed,
            accrual_minor: reply.accrual.map(to_minor_units).unwrap_or(0),
        },
        // INVALID 也是终态结论，只是积分为零
        OrderStatus::Invalid => AccrualOutcome::Resolved {
            status: OrderStatus::Invalid,
            accrual_minor: 0,
        },
        OrderStatus::Registered | OrderStatus::Processing => AccrualOutcome::Pending,
    }
}

/// 基于 reqwest 的计算服务客户端
pub struct HttpAccrualClient {
    http: reqwest::Client,
    base_url: String,
}

impl HttpAccrualClient {
    /// 创建客户端，单次请求超时由配置决定
    pub fn new(config: &AccrualConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .map_err(|e| LoyaltyError::Internal(format!("HTTP 客户端构建失败: {e}")))?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl AccrualApi for HttpAccrualClient {
    async fn order_status(&self, number: &str) -> Result<AccrualOutcome> {
        let url = format!("{}/api/orders/{}", self.base_url, number);

        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            // 超时与连接失败都按服务不可用处理，不中断流水线
            Err(e) => {
                return Ok(AccrualOutcome::Unavailable {
                    reason: e.to_string(),
                });
            }
        };

        let status = response.status();
        match status {
            reqwest::StatusCode::OK => {
                let body = match response.bytes().await {
                    Ok(body) => body,
                    Err(e) => {
                        return Ok(AccrualOutcome::Unavailable {
                            reason: format!("读取响应体失败: {e}"),
                        });
                    }
                };
                let outcome = classify_reply(&body);
                debug!(order = number, outcome = ?outcome, "对账查询完成");
                Ok(outcome)
            }
            // 计算服务尚不知道这个订单
            reqwest::StatusCode::NO_CONTENT => Ok(AccrualOutcome::Pending),
            reqwest::StatusCode::TOO_MANY_REQUESTS => {
                let retry_after = parse_retry_after(
                    response
                        .headers()
                        .get(reqwest::header::RETRY_AFTER)
                        .and_then(|v| v.to_str().ok()),
                );
                warn!(order = number, retry_after = ?retry_after, "计算服务限流");
                Ok(AccrualOutcome::RateLimited { retry_after })
            }
            other => Ok(AccrualOutcome::Unavailable {
                reason: format!("非预期状态码: {other}"),
            }),
        }
    }
}
