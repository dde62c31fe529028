//! 可观测性
//!
//! tracing 初始化与进程级指标：查询生命周期、工具执行、会话存量。
//! 指标全部是原子计数，导出为 JSON 供 web 适配层暴露。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// 初始化日志：RUST_LOG 优先，未设置时退回 info
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();
}

/// 全局指标收集器
#[derive(Debug, Default)]
pub struct Metrics {
    pub queries: QueryMetrics,
    pub tools: ToolMetrics,
    pub sessions: SessionMetrics,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取全局指标实例
    pub fn global() -> &'static Metrics {
        static INSTANCE: std::sync::OnceLock<Metrics> = std::sync::OnceLock::new();
        INSTANCE.get_or_init(Metrics::new)
    }

    /// 导出为 JSON 格式
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "queries": {
                "total": self.queries.total.load(Ordering::Relaxed),
                "with_error": self.queries.with_error.load(Ordering::Relaxed),
                "empty_plan": self.queries.empty_plan.load(Ordering::Relaxed),
                "canceled": self.queries.canceled.load(Ordering::Relaxed),
                "average_latency_ms": self.queries.average_latency_ms(),
            },
            "tools": {
                "total_executions": self.tools.total_executions.load(Ordering::Relaxed),
                "successful_executions": self.tools.successful_executions.load(Ordering::Relaxed),
                "failed_executions": self.tools.failed_executions.load(Ordering::Relaxed),
                "total_duration_ms": self.tools.total_duration_ms.load(Ordering::Relaxed),
            },
            "sessions": {
                "created": self.sessions.created.load(Ordering::Relaxed),
                "evicted": self.sessions.evicted.load(Ordering::Relaxed),
            },
        })
    }
}

/// 查询级指标
#[derive(Debug, Default)]
pub struct QueryMetrics {
    pub total: AtomicU64,
    pub with_error: AtomicU64,
    pub empty_plan: AtomicU64,
    pub canceled: AtomicU64,
    pub total_latency_ms: AtomicU64,
}

impl QueryMetrics {
    pub fn record(&self, latency: Duration, had_error: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms
            .fetch_add(latency.as_millis() as u64, Ordering::Relaxed);
        if had_error {
            self.with_error.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn average_latency_ms(&self) -> u64 {
        let total = self.total.load(Ordering::Relaxed);
        if total == 0 {
            return 0;
        }
        self.total_latency_ms.load(Ordering::Relaxed) / total
    }
}

/// 工具执行指标
#[derive(Debug, Default)]
pub struct ToolMetrics {
    pub total_executions: AtomicU64,
    pub successful_executions: AtomicU64,
    pub failed_executions: AtomicU64,
    pub total_duration_ms: AtomicU64,
}

impl ToolMetrics {
    pub fn record_execution(&self, success: bool, duration: Duration) {
        self.total_executions.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful_executions.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed_executions.fetch_add(1, Ordering::Relaxed);
        }
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
    }
}

/// 会话指标
#[derive(Debug, Default)]
pub struct SessionMetrics {
    pub created: AtomicU64,
    pub evicted: AtomicU64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_accumulate() {
        let metrics = Metrics::new();
        metrics.queries.record(Duration::from_millis(100), false);
        metrics.queries.record(Duration::from_millis(300), true);
        metrics.tools.record_execution(true, Duration::from_millis(50));

        assert_eq!(metrics.queries.total.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.queries.with_error.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.queries.average_latency_ms(), 200);

        let json = metrics.to_json();
        assert_eq!(json["tools"]["total_executions"], 1);
    }
}
