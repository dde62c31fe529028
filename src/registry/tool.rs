//! 工具 trait 与声明式元数据
//!
//! 工具实现 Tool::execute(input, ctx)；ctx 携带计划/步骤标识、截止时间、
//! 依赖步骤输出与注册表句柄（内省类工具在调用期取用，避免注册期循环引用）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type ToolId = String;

/// 工具执行错误；Transient 触发执行器重试，其余走 fallback 或标记失败
#[derive(Error, Debug, Clone)]
pub enum ToolError {
    /// 网络抖动、限流带 retry-after 等，可重试
    #[error("transient tool failure: {0}")]
    Transient(String),
    /// 不可恢复失败
    #[error("tool failure: {0}")]
    Failed(String),
}

impl ToolError {
    pub fn retryable(&self) -> bool {
        matches!(self, ToolError::Transient(_))
    }
}

/// 工具调用上下文：由执行器在每次调用前装配
pub struct StepContext {
    pub plan_id: String,
    pub step_id: String,
    /// 本次调用剩余的截止时间；工具应在此之内返回，deadline 为零视为立即中止
    pub deadline: Duration,
    /// 依赖步骤输出，按边标签（依赖步骤 id）取用
    pub dependency_outputs: HashMap<String, Value>,
    /// 注册表句柄，仅内省类工具使用；调用期注入，工具定义保持纯值
    pub registry: Option<Arc<crate::registry::ToolRegistry>>,
    /// 部分输出提示通道；工具可随时推送中间结果，执行器转为进度事件
    pub progress_hint: Option<tokio::sync::mpsc::UnboundedSender<Value>>,
}

impl StepContext {
    /// 最小上下文（测试与简单调用场景）
    pub fn bare(plan_id: impl Into<String>, step_id: impl Into<String>, deadline: Duration) -> Self {
        Self {
            plan_id: plan_id.into(),
            step_id: step_id.into(),
            deadline,
            dependency_outputs: HashMap::new(),
            registry: None,
            progress_hint: None,
        }
    }
}

/// 工具 trait：输入输出均为 JSON 值
#[async_trait]
pub trait Tool: Send + Sync {
    async fn execute(&self, input: Value, ctx: &StepContext) -> Result<Value, ToolError>;
}

fn default_version() -> String {
    "0.1.0".to_string()
}

/// 工具声明式元数据；注册后不可变，execute 句柄单独携带、不参与序列化
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// 稳定 id；注册时为空则分配
    #[serde(default)]
    pub id: ToolId,
    pub name: String,
    #[serde(default)]
    pub category: String,
    #[serde(default = "default_version")]
    pub version: String,
    /// 声明可消费的输入类型（如 text/query、text/plain）
    #[serde(default)]
    pub input_types: Vec<String>,
    /// 声明产出的输出类型
    #[serde(default)]
    pub output_types: Vec<String>,
    /// 能力标签
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// 关键词标签，recommend 按子串匹配打分
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub description: String,
}

impl ToolDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            name: name.into(),
            category: String::new(),
            version: default_version(),
            input_types: Vec::new(),
            output_types: Vec::new(),
            capabilities: Vec::new(),
            keywords: Vec::new(),
            description: String::new(),
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    pub fn with_io(mut self, inputs: &[&str], outputs: &[&str]) -> Self {
        self.input_types = inputs.iter().map(|s| s.to_string()).collect();
        self.output_types = outputs.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_keywords(mut self, keywords: &[&str]) -> Self {
        self.keywords = keywords.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_capabilities(mut self, capabilities: &[&str]) -> Self {
        self.capabilities = capabilities.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// 每工具滚动遥测；只由执行器在步骤完成时更新
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ToolStats {
    pub successes: u64,
    pub failures: u64,
    pub total_invocations: u64,
    /// 滚动平均执行耗时（毫秒）：ewma_new = (prior·n + dur)/(n+1)
    pub ewma_ms: f64,
    /// 最近一次使用时间（毫秒时间戳）
    pub last_used_ms: Option<i64>,
}

impl ToolStats {
    /// 成功与失败的耗时同样计入滚动平均
    pub fn record(&mut self, success: bool, duration_ms: u64) {
        let n = self.total_invocations as f64;
        self.ewma_ms = (self.ewma_ms * n + duration_ms as f64) / (n + 1.0);
        self.total_invocations += 1;
        if success {
            self.successes += 1;
        } else {
            self.failures += 1;
        }
        self.last_used_ms = Some(chrono::Utc::now().timestamp_millis());
    }

    pub fn success_rate(&self) -> f64 {
        self.successes as f64 / (self.successes + self.failures).max(1) as f64
    }
}
