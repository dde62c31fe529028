//! 计划执行器
//!
//! 以就绪队列 / 在飞集合 / 阻塞集合推进 DAG：步骤完成触发调度，在飞数不超过
//! 并发上限；每步在 min(步骤超时, 计划剩余时间) 内调用工具，瞬时错误按指数退避
//! 重试，耗尽后换 fallback 工具一次；失败向依赖者级联 Skip；每次状态迁移发布
//! 进度事件；取消在宽限期内返回，不依赖工具配合。

pub mod outcome;
pub mod progress;

pub use outcome::{PlanReport, PlanStatus, StepOutcome, StepState};
pub use progress::{Phase, ProgressChannel, ProgressEvent};

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::plan::{Plan, PlanGraph, PlanStep, StepId};
use crate::registry::{StepContext, ToolRegistry};

/// 执行参数
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// 同时在飞的步骤数上限
    pub parallelism: usize,
    /// 取消后等待在飞步骤退出的宽限期
    pub cancel_grace: Duration,
    /// 是否把执行结果写回工具遥测
    pub enable_tool_learning: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            cancel_grace: Duration::from_secs(2),
            enable_tool_learning: true,
        }
    }
}

/// 单步执行结论（任务内部使用）
enum StepVerdict {
    Succeeded {
        output: Value,
        attempts: u32,
        tool_name: String,
    },
    Failed {
        error: String,
        attempts: u32,
        tool_name: String,
    },
    TimedOut {
        error: String,
        attempts: u32,
        tool_name: String,
    },
    Canceled {
        attempts: u32,
        tool_name: String,
    },
}

/// 计划执行器
pub struct Executor {
    registry: Arc<ToolRegistry>,
    config: ExecutorConfig,
}

impl Executor {
    pub fn new(registry: Arc<ToolRegistry>, config: ExecutorConfig) -> Self {
        Self { registry, config }
    }

    /// 执行计划直到所有步骤终态；取消与计划级截止都只产生部分结果，不报错
    pub async fn run(
        &self,
        plan: &Plan,
        cancel: CancellationToken,
        progress: Arc<ProgressChannel>,
    ) -> PlanReport {
        let started = Instant::now();
        let deadline_at = started + plan.deadline;

        let steps: HashMap<StepId, PlanStep> = plan
            .steps
            .iter()
            .map(|s| (s.id.clone(), s.clone()))
            .collect();
        let mut graph = PlanGraph::new(&plan.steps);
        let mut outcomes: HashMap<StepId, StepOutcome> = plan
            .steps
            .iter()
            .map(|s| (s.id.clone(), StepOutcome::pending(&s.tool_name)))
            .collect();
        let mut outputs: HashMap<StepId, Value> = HashMap::new();
        let mut ready: VecDeque<StepId> = graph.initial_ready().into();
        let mut join_set: JoinSet<(StepId, StepVerdict)> = JoinSet::new();
        let mut in_flight = 0usize;
        let mut canceled = false;
        let mut deadline_hit = false;

        loop {
            // 调度：ready → in-flight，直到并发上限
            while in_flight < self.config.parallelism.max(1) {
                let Some(step_id) = ready.pop_front() else { break };
                let Some(oc) = outcomes.get_mut(&step_id) else { continue };
                if oc.state != StepState::Pending {
                    continue;
                }
                let Some(step) = steps.get(&step_id).cloned() else { continue };

                oc.state = StepState::Running;
                oc.started_at_ms = Some(chrono::Utc::now().timestamp_millis());
                progress.emit(&step_id, StepState::Running, None);

                let dep_outputs: HashMap<String, Value> = step
                    .depends_on
                    .iter()
                    .filter_map(|dep| outputs.get(dep).map(|v| (dep.clone(), v.clone())))
                    .collect();

                let task = StepTask {
                    registry: Arc::clone(&self.registry),
                    plan_id: plan.id.clone(),
                    step,
                    dep_outputs,
                    plan_remaining: deadline_at.saturating_duration_since(Instant::now()),
                    cancel: cancel.child_token(),
                    progress: Arc::clone(&progress),
                    learning: self.config.enable_tool_learning,
                };
                join_set.spawn(async move {
                    let id = task.step.id.clone();
                    let verdict = task.run().await;
                    (id, verdict)
                });
                in_flight += 1;
            }

            if in_flight == 0 {
                // 没有在飞也没有可调度的步骤：全部终态（或不可达），收工
                if ready.is_empty() {
                    break;
                }
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !canceled => {
                    canceled = true;
                    skip_non_started(&mut outcomes, &progress, "canceled");
                    ready.clear();

                    // 宽限期内收尾在飞步骤；不配合的直接 abort
                    let drained = tokio::time::timeout(self.config.cancel_grace, async {
                        while let Some(joined) = join_set.join_next().await {
                            if let Ok((id, verdict)) = joined {
                                apply_completion(
                                    &id, verdict, &mut outcomes, &mut graph,
                                    &mut outputs, &mut ready, &progress,
                                );
                            }
                        }
                    })
                    .await;
                    if drained.is_err() {
                        join_set.abort_all();
                        while join_set.join_next().await.is_some() {}
                    }
                    skip_non_started(&mut outcomes, &progress, "canceled");
                    // 中断时仍在 Running 的也标记 Skipped
                    for (id, oc) in outcomes.iter_mut() {
                        if !oc.state.is_terminal() {
                            oc.state = StepState::Skipped;
                            oc.error = Some("canceled".to_string());
                            oc.ended_at_ms = Some(chrono::Utc::now().timestamp_millis());
                            progress.emit(id, StepState::Skipped, None);
                        }
                    }
                    break;
                }
                _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline_at)), if !deadline_hit => {
                    deadline_hit = true;
                    // 未启动的步骤直接 Skip；在飞步骤的单步截止已被计划剩余时间钳住，
                    // 让它们自行超时落地
                    skip_non_started(&mut outcomes, &progress, "plan deadline exceeded");
                    ready.clear();
                }
                joined = join_set.join_next() => {
                    match joined {
                        Some(Ok((id, verdict))) => {
                            in_flight -= 1;
                            apply_completion(
                                &id, verdict, &mut outcomes, &mut graph,
                                &mut outputs, &mut ready, &progress,
                            );
                        }
                        Some(Err(join_error)) => {
                            in_flight -= 1;
                            tracing::error!("step task aborted: {}", join_error);
                        }
                        None => {}
                    }
                }
            }
        }

        let status = if canceled {
            PlanStatus::Canceled
        } else if deadline_hit {
            PlanStatus::DeadlineExceeded
        } else {
            let any_success = outcomes.values().any(|o| o.state == StepState::Succeeded);
            let critical_failed = plan.steps.iter().any(|s| {
                s.critical
                    && outcomes
                        .get(&s.id)
                        .map(|o| {
                            matches!(
                                o.state,
                                StepState::Failed | StepState::TimedOut | StepState::Skipped
                            )
                        })
                        .unwrap_or(false)
            });
            if any_success && !critical_failed {
                PlanStatus::Succeeded
            } else {
                PlanStatus::Failed
            }
        };

        PlanReport {
            plan_id: plan.id.clone(),
            status,
            outcomes,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

/// 尚未启动（Pending）的步骤标记为 Skipped
fn skip_non_started(
    outcomes: &mut HashMap<StepId, StepOutcome>,
    progress: &ProgressChannel,
    reason: &str,
) {
    for (id, oc) in outcomes.iter_mut() {
        if oc.state == StepState::Pending {
            oc.state = StepState::Skipped;
            oc.error = Some(reason.to_string());
            oc.ended_at_ms = Some(chrono::Utc::now().timestamp_millis());
            progress.emit(id, StepState::Skipped, None);
        }
    }
}

/// 步骤落地：更新 outcome、发布事件、推进依赖图或级联 Skip
fn apply_completion(
    id: &str,
    verdict: StepVerdict,
    outcomes: &mut HashMap<StepId, StepOutcome>,
    graph: &mut PlanGraph,
    outputs: &mut HashMap<StepId, Value>,
    ready: &mut VecDeque<StepId>,
    progress: &ProgressChannel,
) {
    let now = chrono::Utc::now().timestamp_millis();
    match verdict {
        StepVerdict::Succeeded {
            output,
            attempts,
            tool_name,
        } => {
            if let Some(oc) = outcomes.get_mut(id) {
                oc.state = StepState::Succeeded;
                oc.output = Some(output.clone());
                oc.attempts = attempts;
                oc.tool_name = tool_name;
                oc.ended_at_ms = Some(now);
            }
            progress.emit(id, StepState::Succeeded, None);
            outputs.insert(id.to_string(), output);
            for newly in graph.mark_succeeded(id) {
                if outcomes
                    .get(&newly)
                    .map(|o| o.state == StepState::Pending)
                    .unwrap_or(false)
                {
                    ready.push_back(newly);
                }
            }
        }
        StepVerdict::Failed {
            error,
            attempts,
            tool_name,
        } => {
            fail_step(
                id, StepState::Failed, error, attempts, tool_name,
                outcomes, graph, progress, now,
            );
        }
        StepVerdict::TimedOut {
            error,
            attempts,
            tool_name,
        } => {
            fail_step(
                id, StepState::TimedOut, error, attempts, tool_name,
                outcomes, graph, progress, now,
            );
        }
        StepVerdict::Canceled {
            attempts,
            tool_name,
        } => {
            if let Some(oc) = outcomes.get_mut(id) {
                oc.state = StepState::Skipped;
                oc.error = Some("canceled".to_string());
                oc.attempts = attempts;
                oc.tool_name = tool_name;
                oc.ended_at_ms = Some(now);
            }
            progress.emit(id, StepState::Skipped, None);
        }
    }
}

/// 失败/超时落地并向依赖者级联 Skip
#[allow(clippy::too_many_arguments)]
fn fail_step(
    id: &str,
    state: StepState,
    error: String,
    attempts: u32,
    tool_name: String,
    outcomes: &mut HashMap<StepId, StepOutcome>,
    graph: &mut PlanGraph,
    progress: &ProgressChannel,
    now: i64,
) {
    if let Some(oc) = outcomes.get_mut(id) {
        oc.state = state;
        oc.error = Some(error);
        oc.attempts = attempts;
        oc.tool_name = tool_name;
        oc.ended_at_ms = Some(now);
    }
    progress.emit(id, state, None);
    // 级联：依赖本步骤的全部标记 Skipped
    for dependent in graph.transitive_dependents(id) {
        if let Some(doc) = outcomes.get_mut(&dependent) {
            if doc.state == StepState::Pending {
                doc.state = StepState::Skipped;
                doc.error = Some(format!("dependency {id} did not succeed"));
                doc.ended_at_ms = Some(now);
                progress.emit(&dependent, StepState::Skipped, None);
            }
        }
    }
}

/// 单步执行任务：主工具带瞬时重试预算，耗尽后按序各试一次 fallback
struct StepTask {
    registry: Arc<ToolRegistry>,
    plan_id: String,
    step: PlanStep,
    dep_outputs: HashMap<String, Value>,
    /// spawn 时刻的计划剩余时间
    plan_remaining: Duration,
    cancel: CancellationToken,
    progress: Arc<ProgressChannel>,
    learning: bool,
}

impl StepTask {
    async fn run(self) -> StepVerdict {
        let spawned = Instant::now();
        let input = resolve_input(&self.step, &self.dep_outputs);

        let mut tool_chain: Vec<String> = Vec::with_capacity(1 + self.step.fallbacks.len());
        tool_chain.push(self.step.tool_id.clone());
        tool_chain.extend(self.step.fallbacks.iter().cloned());

        let mut attempts = 0u32;
        let mut last_error = format!("unknown tool: {}", self.step.tool_id);
        let mut last_timeout = false;
        let mut last_tool_name = self.step.tool_name.clone();

        for (chain_index, tool_id) in tool_chain.iter().enumerate() {
            let Some((definition, handler)) = self.registry.get(tool_id) else {
                last_error = format!("unknown tool: {tool_id}");
                last_timeout = false;
                continue;
            };
            last_tool_name = definition.name.clone();
            if chain_index > 0 {
                tracing::info!(
                    step = %self.step.id,
                    fallback = %definition.name,
                    "substituting fallback tool"
                );
            }

            // fallback 工具只试一次；瞬时重试预算仅属于主工具
            let retries = if chain_index == 0 {
                self.step.retry.max_retries
            } else {
                0
            };
            let mut tool_attempt = 0u32;

            loop {
                if self.cancel.is_cancelled() {
                    return StepVerdict::Canceled {
                        attempts,
                        tool_name: last_tool_name,
                    };
                }
                attempts += 1;
                tool_attempt += 1;

                let remaining = self.plan_remaining.saturating_sub(spawned.elapsed());
                let deadline = self.step.timeout.min(remaining);
                if deadline.is_zero() {
                    return StepVerdict::TimedOut {
                        error: "plan deadline exhausted before invocation".to_string(),
                        attempts,
                        tool_name: last_tool_name,
                    };
                }

                // 部分输出转发：工具推一条，进度发一条 Running 事件
                let (hint_tx, mut hint_rx) = mpsc::unbounded_channel::<Value>();
                let forward_progress = Arc::clone(&self.progress);
                let forward_step = self.step.id.clone();
                let forwarder = tokio::spawn(async move {
                    while let Some(partial) = hint_rx.recv().await {
                        forward_progress.emit(&forward_step, StepState::Running, Some(partial));
                    }
                });

                let ctx = StepContext {
                    plan_id: self.plan_id.clone(),
                    step_id: self.step.id.clone(),
                    deadline,
                    dependency_outputs: self.dep_outputs.clone(),
                    registry: Some(Arc::clone(&self.registry)),
                    progress_hint: Some(hint_tx),
                };

                let invoke_started = Instant::now();
                let result = tokio::select! {
                    r = tokio::time::timeout(deadline, handler.execute(input.clone(), &ctx)) => r,
                    _ = self.cancel.cancelled() => {
                        forwarder.abort();
                        return StepVerdict::Canceled { attempts, tool_name: last_tool_name };
                    }
                };
                forwarder.abort();
                let duration_ms = invoke_started.elapsed().as_millis() as u64;

                let (ok, outcome_label, success) = match &result {
                    Ok(Ok(_)) => (true, "ok", true),
                    Ok(Err(_)) => (false, "error", false),
                    Err(_) => (false, "timeout", false),
                };
                if self.learning {
                    self.registry.record_usage(&definition.id, success, duration_ms);
                }
                crate::observability::Metrics::global()
                    .tools
                    .record_execution(success, invoke_started.elapsed());
                let audit = serde_json::json!({
                    "event": "tool_audit",
                    "plan": self.plan_id,
                    "step": self.step.id,
                    "tool": definition.name,
                    "attempt": attempts,
                    "ok": ok,
                    "outcome": outcome_label,
                    "duration_ms": duration_ms,
                });
                tracing::info!(audit = %audit.to_string(), "tool");

                match result {
                    Ok(Ok(output)) => {
                        return StepVerdict::Succeeded {
                            output,
                            attempts,
                            tool_name: last_tool_name,
                        };
                    }
                    Ok(Err(e)) => {
                        last_timeout = false;
                        last_error = e.to_string();
                        if e.retryable() && tool_attempt <= retries {
                            let delay = self.step.retry.delay_for_attempt(tool_attempt - 1);
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = self.cancel.cancelled() => {
                                    return StepVerdict::Canceled { attempts, tool_name: last_tool_name };
                                }
                            }
                            continue;
                        }
                        break;
                    }
                    Err(_) => {
                        last_timeout = true;
                        last_error = format!(
                            "tool '{}' exceeded {:.1}s deadline",
                            definition.name,
                            deadline.as_secs_f64()
                        );
                        break;
                    }
                }
            }
        }

        if last_timeout {
            StepVerdict::TimedOut {
                error: last_error,
                attempts,
                tool_name: last_tool_name,
            }
        } else {
            StepVerdict::Failed {
                error: last_error,
                attempts,
                tool_name: last_tool_name,
            }
        }
    }
}

/// 输入解析：把依赖步骤输出按边标签（步骤 id）并入输入模板的 deps 字段
fn resolve_input(step: &PlanStep, dep_outputs: &HashMap<String, Value>) -> Value {
    let mut input = step.input.clone();
    if !dep_outputs.is_empty() {
        if let Value::Object(ref mut map) = input {
            let deps: serde_json::Map<String, Value> = dep_outputs
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            map.insert("deps".to_string(), Value::Object(deps));
        }
    }
    input
}
