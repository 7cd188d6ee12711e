//! 健康检查模块
//!
//! 提供 /health、/ready 和 /metrics 端点

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
};
use relay_common::{AggregatedHealthResult, BreakerSnapshot};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::metrics::MetricsRecorder;

/// 健康状态来源（由中继编排器实现）
pub trait HealthReporter: Send + Sync {
    /// 聚合的数据源健康状态
    fn health(&self) -> AggregatedHealthResult;

    /// 当前生命周期状态名
    fn state(&self) -> &'static str;

    /// 是否已进入轮询
    fn is_ready(&self) -> bool;

    /// 各断路器快照
    fn breakers(&self) -> Vec<BreakerSnapshot> {
        Vec::new()
    }
}

/// /health 响应体
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub state: &'static str,
    #[serde(flatten)]
    pub health: AggregatedHealthResult,
    pub breakers: Vec<BreakerSnapshot>,
}

/// /ready 响应体
#[derive(Debug, Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub state: &'static str,
}

#[derive(Clone)]
struct HealthServerState {
    reporter: Arc<dyn HealthReporter>,
    metrics: Option<MetricsRecorder>,
}

/// HTTP 健康检查服务器
pub struct HealthServer {
    reporter: Arc<dyn HealthReporter>,
    metrics: Option<MetricsRecorder>,
    addr: SocketAddr,
}

impl HealthServer {
    pub fn new(reporter: Arc<dyn HealthReporter>, addr: SocketAddr) -> Self {
        Self {
            reporter,
            metrics: None,
            addr,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricsRecorder) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// 构建路由（测试直接使用）
    pub fn router(&self) -> Router {
        let state = HealthServerState {
            reporter: self.reporter.clone(),
            metrics: self.metrics.clone(),
        };

        Router::new()
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/metrics", get(metrics_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// 启动 HTTP 服务器，token 取消后优雅退出
    pub async fn serve(self, shutdown: CancellationToken) -> Result<(), std::io::Error> {
        let app = self.router();

        info!(addr = %self.addr, "Health check HTTP server starting");

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
    }
}

/// 聚合健康：负载均衡因子 > 0.5 时返回 200，否则 503
async fn health_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    let health = state.reporter.health();
    let code = if health.healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = HealthResponse {
        status: if health.healthy { "healthy" } else { "unhealthy" },
        state: state.reporter.state(),
        health,
        breakers: state.reporter.breakers(),
    };
    (code, Json(body))
}

async fn ready_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    let ready = state.reporter.is_ready();
    let code = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        code,
        Json(ReadyResponse {
            ready,
            state: state.reporter.state(),
        }),
    )
}

async fn metrics_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    match state.metrics {
        Some(metrics) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            metrics.render(),
        ),
        None => (
            StatusCode::NOT_FOUND,
            [("content-type", "text/plain; charset=utf-8")],
            "metrics recorder not installed".to_string(),
        ),
    }
}
