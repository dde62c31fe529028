//! 步骤结果与计划报告
//!
//! Plan 本身不被改写：执行状态全部记录在按步骤 id 索引的 StepOutcome 中，
//! fallback 替换只体现在 outcome 的 tool_name 上。

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::plan::{Plan, StepId};

/// 步骤状态；单调推进，终止于 Succeeded / Failed / Skipped / TimedOut 之一
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
    TimedOut,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Succeeded | StepState::Failed | StepState::Skipped | StepState::TimedOut
        )
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StepState::Pending => "pending",
            StepState::Running => "running",
            StepState::Succeeded => "succeeded",
            StepState::Failed => "failed",
            StepState::Skipped => "skipped",
            StepState::TimedOut => "timed_out",
        };
        write!(f, "{s}")
    }
}

/// 单个步骤的可观测结果
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub state: StepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 实际尝试次数（重试与 fallback 都计入）
    pub attempts: u32,
    /// 实际执行的工具名（fallback 替换后与计划绑定可能不同）
    pub tool_name: String,
    pub started_at_ms: Option<i64>,
    pub ended_at_ms: Option<i64>,
}

impl StepOutcome {
    pub fn pending(tool_name: impl Into<String>) -> Self {
        Self {
            state: StepState::Pending,
            output: None,
            error: None,
            attempts: 0,
            tool_name: tool_name.into(),
            started_at_ms: None,
            ended_at_ms: None,
        }
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at_ms, self.ended_at_ms) {
            (Some(s), Some(e)) if e >= s => Some((e - s) as u64),
            _ => None,
        }
    }
}

/// 计划整体状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    /// 至少一个步骤成功且没有关键步骤失败
    Succeeded,
    /// 有关键步骤失败（或无任何步骤成功）
    Failed,
    /// 协作取消
    Canceled,
    /// 计划级截止时间被突破（附带部分结果）
    DeadlineExceeded,
}

/// 一次计划执行的汇总报告
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanReport {
    pub plan_id: String,
    pub status: PlanStatus,
    pub outcomes: HashMap<StepId, StepOutcome>,
    pub duration_ms: u64,
}

impl PlanReport {
    /// 成功步骤的 (工具名, 输出)，按计划插入序
    pub fn successful_outputs(&self, plan: &Plan) -> Vec<(String, Value)> {
        plan.steps
            .iter()
            .filter_map(|step| {
                let outcome = self.outcomes.get(&step.id)?;
                if outcome.state != StepState::Succeeded {
                    return None;
                }
                outcome
                    .output
                    .clone()
                    .map(|o| (outcome.tool_name.clone(), o))
            })
            .collect()
    }

    /// 实际执行过的工具及耗时（响应的 toolsUsed 摘要）
    pub fn tools_used(&self, plan: &Plan) -> Vec<(String, u64)> {
        plan.steps
            .iter()
            .filter_map(|step| {
                let outcome = self.outcomes.get(&step.id)?;
                if outcome.attempts == 0 {
                    return None;
                }
                Some((outcome.tool_name.clone(), outcome.duration_ms().unwrap_or(0)))
            })
            .collect()
    }

    pub fn count(&self, state: StepState) -> usize {
        self.outcomes.values().filter(|o| o.state == state).count()
    }

    pub fn any_succeeded(&self) -> bool {
        self.outcomes
            .values()
            .any(|o| o.state == StepState::Succeeded)
    }

    /// 是否有关键步骤成功（响应错误标注规则用）
    pub fn any_critical_succeeded(&self, plan: &Plan) -> bool {
        plan.steps.iter().any(|step| {
            step.critical
                && self
                    .outcomes
                    .get(&step.id)
                    .map(|o| o.state == StepState::Succeeded)
                    .unwrap_or(false)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_states() {
        assert!(!StepState::Pending.is_terminal());
        assert!(!StepState::Running.is_terminal());
        assert!(StepState::Succeeded.is_terminal());
        assert!(StepState::Skipped.is_terminal());
        assert!(StepState::TimedOut.is_terminal());
    }

    #[test]
    fn test_outcome_duration() {
        let mut outcome = StepOutcome::pending("echo");
        assert_eq!(outcome.duration_ms(), None);
        outcome.started_at_ms = Some(1000);
        outcome.ended_at_ms = Some(1250);
        assert_eq!(outcome.duration_ms(), Some(250));
    }
}
