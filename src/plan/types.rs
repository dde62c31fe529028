//! 执行计划类型定义
//!
//! Plan 一经执行器接手便不可变；步骤状态记录在执行器侧的 StepOutcome 中。

use std::time::Duration;

use rand::random;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::registry::ToolId;

pub type PlanId = String;
pub type StepId = String;

/// 步骤重试策略：指数退避 + 抖动
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// 瞬时错误的重试预算
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// 抖动幅度（0.2 即 ±20%）
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_delay_ms: 250,
            max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn with_budget(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// 第 attempt 次重试前的等待时间（attempt 从 0 起）
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base =
            self.initial_delay_ms as f64 / 1000.0 * self.backoff_multiplier.powi(attempt as i32);
        let jitter_factor = 1.0 + (random::<f64>() - 0.5) * 2.0 * self.jitter;
        let jittered = base * jitter_factor;
        let clamped = jittered.min(self.max_delay_ms as f64 / 1000.0).max(0.0);
        Duration::from_secs_f64(clamped)
    }
}

/// 执行 DAG 中的一个节点：一次工具调用
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanStep {
    pub id: StepId,
    pub tool_id: ToolId,
    /// 工具名（报告与进度展示用）
    pub tool_name: String,
    /// 该步骤对应的子目标从句
    pub goal: String,
    /// 绑定的输入模板；依赖输出由执行器按边标签（依赖步骤 id）注入
    pub input: Value,
    /// 依赖步骤 id；全部 Succeeded 后本步骤才可调度
    #[serde(default)]
    pub depends_on: Vec<StepId>,
    /// 单步超时
    pub timeout: Duration,
    pub retry: RetryPolicy,
    /// 失败时按序替换的备选工具（至多两个）
    #[serde(default)]
    pub fallbacks: Vec<ToolId>,
    /// 关键步骤：失败则整个计划判为失败
    #[serde(default)]
    pub critical: bool,
}

/// 一次查询的执行计划；steps 保持插入序
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub query: String,
    pub steps: Vec<PlanStep>,
    /// 估计完成时间（毫秒）：各拓扑层 EWMA 之和的最大值
    pub estimated_ms: u64,
    /// 整个计划的截止时长
    pub deadline: Duration,
    pub created_at_ms: i64,
}

impl Plan {
    pub fn step(&self, id: &str) -> Option<&PlanStep> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }
}
