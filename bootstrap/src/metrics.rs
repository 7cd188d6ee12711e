//! Metrics 导出

use metrics_exporter_prometheus::{BuildError, PrometheusHandle};

/// Prometheus 记录器句柄
#[derive(Clone)]
pub struct MetricsRecorder {
    handle: PrometheusHandle,
}

impl MetricsRecorder {
    /// 安装全局 Prometheus 记录器（进程内只能调用一次）
    pub fn install() -> Result<Self, BuildError> {
        relay_telemetry::init_metrics().map(Self::from_handle)
    }

    pub fn from_handle(handle: PrometheusHandle) -> Self {
        Self { handle }
    }

    /// 获取 Prometheus 格式的 metrics
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
