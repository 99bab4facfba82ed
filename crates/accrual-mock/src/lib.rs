//! 积分计算服务模拟器
//!
//! 本地开发与联调用：实现账本服务依赖的查询协议
//! `GET /api/orders/{number}`，并提供一个注册接口用来预置订单结果。
//!
//! 行为模拟：
//! - 未注册的订单返回 204
//! - 已注册的订单先经历若干轮 PROCESSING，再落到预置的终态
//! - 可配置限流：每 N 个查询请求返回一次 429 + Retry-After

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

/// 预置的订单结果
#[derive(Debug, Clone, Deserialize)]
pub struct OrderScript {
    pub order: String,
    /// 终态：PROCESSED 或 INVALID
    pub status: String,
    /// 终态积分（积分单位，浮点）
    #[serde(default)]
    pub accrual: Option<f64>,
    /// 落到终态前返回 PROCESSING 的轮数
    #[serde(default)]
    pub processing_polls: u32,
}

/// 查询响应体，与真实计算服务的 JSON 结构一致
#[derive(Debug, Serialize)]
struct OrderReply {
    order: String,
    status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    accrual: Option<f64>,
}

#[derive(Debug)]
struct ScriptState {
    script: OrderScript,
    polls_seen: u32,
}

#[derive(Debug, Default)]
struct Inner {
    orders: HashMap<String, ScriptState>,
    requests_seen: u64,
}

/// 模拟器状态
#[derive(Clone)]
pub struct MockAccrual {
    inner: Arc<Mutex<Inner>>,
    /// 每隔多少个查询请求返回一次 429，0 表示不限流
    rate_limit_every: u64,
    /// 429 响应携带的 Retry-After 秒数
    retry_after_seconds: u64,
}

impl MockAccrual {
    pub fn new(rate_limit_every: u64, retry_after_seconds: u64) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            rate_limit_every,
            retry_after_seconds,
        }
    }

    /// 预置一个订单结果
    pub fn seed(&self, script: OrderScript) {
        let mut inner = self.inner.lock();
        inner.orders.insert(
            script.order.clone(),
            ScriptState {
                script,
                polls_seen: 0,
            },
        );
    }
}

/// 构建路由
pub fn router(state: MockAccrual) -> Router {
    Router::new()
        .route("/api/orders/{number}", get(get_order))
        .route("/api/orders", post(register_order))
        .with_state(state)
}

async fn get_order(State(state): State<MockAccrual>, Path(number): Path<String>) -> Response {
    let mut inner = state.inner.lock();
    inner.requests_seen += 1;

    // 限流档位：每 N 个请求打回一次
    if state.rate_limit_every > 0 && inner.requests_seen % state.rate_limit_every == 0 {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            [(
                header::RETRY_AFTER,
                state.retry_after_seconds.to_string(),
            )],
            "No more than N requests per minute allowed",
        )
            .into_response();
    }

    let Some(entry) = inner.orders.get_mut(&number) else {
        return StatusCode::NO_CONTENT.into_response();
    };

    if entry.polls_seen < entry.script.processing_polls {
        entry.polls_seen += 1;
        let reply = OrderReply {
            order: number,
            status: "PROCESSING".to_string(),
            accrual: None,
        };
        return (StatusCode::OK, Json(reply)).into_response();
    }

    let reply = OrderReply {
        order: number,
        status: entry.script.status.clone(),
        // INVALID 订单不携带积分字段
        accrual: if entry.script.status == "PROCESSED" {
            entry.script.accrual
        } else {
            None
        },
    };
    (StatusCode::OK, Json(reply)).into_response()
}

async fn register_order(
    State(state): State<MockAccrual>,
    Json(script): Json<OrderScript>,
) -> StatusCode {
    info!(order = %script.order, status = %script.status, "预置订单结果");
    state.seed(script);
    StatusCode::ACCEPTED
}
