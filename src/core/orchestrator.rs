//! 编排门面
//!
//! 每次查询：取会话 → 分析 → 规划 → 执行（转发进度）→ 合成 → 记录对话轮并快照。
//! 同一会话串行、排队有界；每查询持有关闭 token 的子 token，关闭时级联取消；
//! 除 Validation / SessionBusy / 无成功步骤的 DeadlineExceeded 外，一律返回
//! 带 error 标注的尽力结果。

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::core::error::{ErrorInfo, OrchestratorError};
use crate::core::shutdown::{ShutdownManager, ShutdownReason};
use crate::core::synthesizer::Synthesizer;
use crate::exec::{Executor, ExecutorConfig, Phase, PlanStatus, ProgressChannel, StepState};
use crate::intent::QueryAnalyzer;
use crate::llm::LanguageModel;
use crate::observability::Metrics;
use crate::plan::{PlanError, Planner, PlannerConfig, RetryPolicy};
use crate::registry::ToolRegistry;
use crate::session::{Context, RunSummary, SessionManager, SessionPersistence, Turn};

/// 一次查询请求
#[derive(Debug, Clone, Deserialize)]
pub struct QueryRequest {
    pub text: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl QueryRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            session_id: None,
            user_id: None,
            metadata: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// 响应中的单工具摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolUse {
    pub name: String,
    pub execution_time_ms: u64,
}

/// 统一响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub session_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html: Option<String>,
    pub sources: Vec<String>,
    pub tools_used: Vec<ToolUse>,
    pub processing_time_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

/// 会话门闸：同一会话同时只有一个查询推进，排队深度有界
struct SessionGate {
    semaphore: Arc<Semaphore>,
    queued: AtomicUsize,
}

impl SessionGate {
    fn new() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
            queued: AtomicUsize::new(0),
        }
    }
}

/// 编排器：组合注册表、规划器、执行器、会话层与 LLM 协作方
pub struct Orchestrator {
    config: AppConfig,
    registry: Arc<ToolRegistry>,
    planner: Planner,
    executor: Executor,
    sessions: Arc<SessionManager>,
    analyzer: QueryAnalyzer,
    synthesizer: Synthesizer,
    gates: DashMap<String, Arc<SessionGate>>,
    shutdown: Arc<ShutdownManager>,
    active_queries: AtomicUsize,
}

impl Orchestrator {
    pub fn new(
        config: AppConfig,
        registry: Arc<ToolRegistry>,
        lm: Arc<dyn LanguageModel>,
        persistence: Arc<dyn SessionPersistence>,
    ) -> Arc<Self> {
        let shutdown = Arc::new(ShutdownManager::new(Duration::from_secs(
            config.orchestrator.shutdown_grace_secs,
        )));

        let sessions = Arc::new(SessionManager::new(
            persistence,
            Duration::from_secs(config.session.idle_ttl_secs),
            config.session.max_turns,
        ));
        sessions.start_sweeper(
            Duration::from_secs(config.session.sweep_interval_secs),
            shutdown.token(),
        );

        let planner = Planner::new(
            Arc::clone(&registry),
            PlannerConfig {
                top_k: config.orchestrator.candidate_top_k,
                step_timeout: Duration::from_secs(config.orchestrator.step_timeout_secs),
                plan_timeout: Duration::from_secs(config.orchestrator.plan_timeout_secs),
                retry: RetryPolicy::default()
                    .with_budget(config.orchestrator.retry_budget_per_step),
            },
        );
        let executor = Executor::new(
            Arc::clone(&registry),
            ExecutorConfig {
                parallelism: config.orchestrator.parallelism,
                cancel_grace: Duration::from_secs(config.orchestrator.cancel_grace_secs),
                enable_tool_learning: config.orchestrator.enable_tool_learning,
            },
        );
        let analyzer = QueryAnalyzer::new(
            Arc::clone(&lm),
            Duration::from_secs(config.llm.analyze_timeout_secs),
        );
        let synthesizer = Synthesizer::new(
            lm,
            Duration::from_secs(config.llm.synthesize_timeout_secs),
            config.orchestrator.llm_fallback_enabled,
        );

        Arc::new(Self {
            config,
            registry,
            planner,
            executor,
            sessions,
            analyzer,
            synthesizer,
            gates: DashMap::new(),
            shutdown,
            active_queries: AtomicUsize::new(0),
        })
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn shutdown_manager(&self) -> &Arc<ShutdownManager> {
        &self.shutdown
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_shutdown()
    }

    /// 广播关闭并在宽限期内等待活跃查询收尾
    pub async fn shutdown(&self) {
        self.shutdown.shutdown(ShutdownReason::Interrupt);
        if !self.shutdown.drain(&self.active_queries).await {
            tracing::warn!(
                "shutdown grace expired with {} queries still active",
                self.active_queries.load(Ordering::SeqCst)
            );
        }
    }

    /// 一元查询入口
    pub async fn handle_query(
        &self,
        request: QueryRequest,
    ) -> Result<QueryResult, OrchestratorError> {
        self.handle_query_streaming(request, None, None).await
    }

    /// 流式查询入口：progress 由调用方订阅，caller_cancel 由调用方触发
    pub async fn handle_query_streaming(
        &self,
        request: QueryRequest,
        progress: Option<Arc<ProgressChannel>>,
        caller_cancel: Option<CancellationToken>,
    ) -> Result<QueryResult, OrchestratorError> {
        if self.shutdown.is_shutdown() {
            return Err(OrchestratorError::ShuttingDown);
        }
        let text = request.text.trim().to_string();
        if text.is_empty() {
            return Err(OrchestratorError::Validation("empty query text".to_string()));
        }

        let started = Instant::now();
        let user_id = request.user_id.as_deref().unwrap_or("anonymous");
        let (session_id, context) = self
            .sessions
            .get_or_create(request.session_id.as_deref(), user_id)
            .await;

        // 门闸：排队深度检查 + 串行许可
        let gate = Arc::clone(
            self.gates
                .entry(session_id.clone())
                .or_insert_with(|| Arc::new(SessionGate::new()))
                .value(),
        );
        if gate.queued.fetch_add(1, Ordering::SeqCst)
            >= self.config.orchestrator.max_queued_queries_per_session
        {
            gate.queued.fetch_sub(1, Ordering::SeqCst);
            return Err(OrchestratorError::SessionBusy(session_id));
        }
        let permit = match Arc::clone(&gate.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                gate.queued.fetch_sub(1, Ordering::SeqCst);
                return Err(OrchestratorError::ShuttingDown);
            }
        };
        gate.queued.fetch_sub(1, Ordering::SeqCst);
        let _permit = permit;

        // 每查询 token：关闭级联取消；调用方取消转发进来
        let query_token = self.shutdown.child_token();
        let done = CancellationToken::new();
        let _done_guard = done.clone().drop_guard();
        if let Some(caller) = caller_cancel {
            let forward = query_token.clone();
            let finished = done.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = caller.cancelled() => forward.cancel(),
                    _ = finished.cancelled() => {}
                }
            });
        }

        self.active_queries.fetch_add(1, Ordering::SeqCst);
        let query_deadline = Duration::from_secs(self.config.orchestrator.query_timeout_secs);
        let outcome = tokio::time::timeout(
            query_deadline,
            self.run_pipeline(&text, &session_id, &context, progress, query_token, started),
        )
        .await;
        self.active_queries.fetch_sub(1, Ordering::SeqCst);

        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(OrchestratorError::DeadlineExceeded(format!(
                "query exceeded {}s end-to-end budget",
                query_deadline.as_secs()
            ))),
        };
        Metrics::global().queries.record(
            started.elapsed(),
            result
                .as_ref()
                .map(|r| r.error.is_some())
                .unwrap_or(true),
        );
        result
    }

    async fn run_pipeline(
        &self,
        text: &str,
        session_id: &str,
        context: &Arc<Mutex<Context>>,
        progress: Option<Arc<ProgressChannel>>,
        cancel: CancellationToken,
        started: Instant,
    ) -> Result<QueryResult, OrchestratorError> {
        let progress = progress.unwrap_or_else(|| Arc::new(ProgressChannel::default()));

        // 分析：协作方失败在里面退化为 unknown，不会报错
        progress.emit_phase(Phase::Analyzing);
        let analysis = self.analyzer.analyze(text).await;
        tracing::debug!(
            intent = %analysis.intent.primary,
            confidence = analysis.intent.confidence,
            entities = analysis.entities.len(),
            "query analyzed"
        );

        // 规划（短暂持有上下文锁）；本轮意图/实体写入上下文，
        // 用户轮先入历史：规划开始时历史总是以 user 轮收尾
        progress.emit_phase(Phase::Planning);
        let (plan_result, history) = {
            let mut ctx = context.lock().await;
            if let Err(e) = ctx.push_turn(Turn::user(text)) {
                tracing::warn!("failed to append user turn: {}", e);
            }
            ctx.current_intent = Some(analysis.intent.clone());
            ctx.current_entities = analysis.entities.clone();
            let plan_result = self.planner.plan(text, &analysis, &ctx);
            (plan_result, ctx.recent_turns(6).to_vec())
        };

        let result = match plan_result {
            Err(PlanError::EmptyPlan) => {
                Metrics::global()
                    .queries
                    .empty_plan
                    .fetch_add(1, Ordering::Relaxed);
                let reply = self.synthesizer.empty_plan_reply(text, &history).await;
                QueryResult {
                    session_id: session_id.to_string(),
                    text: reply,
                    html: None,
                    sources: Vec::new(),
                    tools_used: Vec::new(),
                    processing_time_ms: started.elapsed().as_millis() as u64,
                    error: Some(ErrorInfo::new(
                        "empty_plan",
                        "No suitable tool was found for this request.",
                    )),
                }
            }
            Ok(plan) => {
                tracing::info!(
                    plan = %plan.id,
                    steps = plan.len(),
                    estimated_ms = plan.estimated_ms,
                    "plan built"
                );
                progress.emit_phase(Phase::Executing);
                let report = self.executor.run(&plan, cancel, Arc::clone(&progress)).await;

                {
                    let mut ctx = context.lock().await;
                    ctx.last_run = Some(RunSummary {
                        plan_id: plan.id.clone(),
                        succeeded: report.count(StepState::Succeeded),
                        failed: report.count(StepState::Failed)
                            + report.count(StepState::TimedOut),
                        skipped: report.count(StepState::Skipped),
                        duration_ms: report.duration_ms,
                    });
                }

                let outputs = report.successful_outputs(&plan);
                progress.emit_phase(Phase::Synthesizing);
                let synthesis = self.synthesizer.synthesize(text, &outputs, &history).await;
                let tools_used = report
                    .tools_used(&plan)
                    .into_iter()
                    .map(|(name, execution_time_ms)| ToolUse {
                        name,
                        execution_time_ms,
                    })
                    .collect();

                let error = match report.status {
                    PlanStatus::Canceled => {
                        Metrics::global()
                            .queries
                            .canceled
                            .fetch_add(1, Ordering::Relaxed);
                        Some(ErrorInfo::new("canceled", "The request was canceled."))
                    }
                    PlanStatus::DeadlineExceeded => {
                        if report.any_succeeded() {
                            Some(ErrorInfo::new(
                                "deadline_exceeded",
                                "The request ran out of time; showing partial results.",
                            ))
                        } else {
                            return Err(OrchestratorError::DeadlineExceeded(
                                "plan deadline exceeded before any step completed".to_string(),
                            ));
                        }
                    }
                    PlanStatus::Succeeded | PlanStatus::Failed => {
                        if report.any_critical_succeeded(&plan) {
                            None
                        } else {
                            Some(ErrorInfo::new(
                                "tool_failure",
                                "Some tools failed; showing what completed.",
                            ))
                        }
                    }
                };

                QueryResult {
                    session_id: session_id.to_string(),
                    text: synthesis.text,
                    html: synthesis.html,
                    sources: synthesis.sources,
                    tools_used,
                    processing_time_ms: started.elapsed().as_millis() as u64,
                    error,
                }
            }
        };

        // 记录助手轮并快照（快照失败只记日志）
        let tool_names: Vec<String> = result.tools_used.iter().map(|t| t.name.clone()).collect();
        if let Err(e) = self
            .sessions
            .append_turn(session_id, Turn::assistant(result.text.clone(), tool_names))
            .await
        {
            tracing::warn!("failed to append assistant turn: {}", e);
        }
        self.sessions.snapshot(session_id);

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockLm;
    use crate::registry::{register_builtins, ToolRegistry};
    use crate::session::NullSessionStore;

    fn orchestrator() -> Arc<Orchestrator> {
        let registry = Arc::new(ToolRegistry::new());
        register_builtins(&registry);
        Orchestrator::new(
            AppConfig::default(),
            registry,
            Arc::new(MockLm),
            Arc::new(NullSessionStore),
        )
    }

    #[tokio::test]
    async fn test_empty_query_is_validation_error() {
        let orchestrator = orchestrator();
        let result = orchestrator.handle_query(QueryRequest::new("   ")).await;
        assert!(matches!(result, Err(OrchestratorError::Validation(_))));
    }

    #[tokio::test]
    async fn test_simple_echo_query() {
        let orchestrator = orchestrator();
        let result = orchestrator
            .handle_query(QueryRequest::new("please echo hello"))
            .await
            .unwrap();
        assert!(result.text.contains("hello"));
        assert_eq!(result.tools_used.len(), 1);
        assert_eq!(result.tools_used[0].name, "echo");
        assert!(result.error.is_none());
    }

    #[tokio::test]
    async fn test_empty_plan_fallback() {
        let orchestrator = orchestrator();
        let result = orchestrator
            .handle_query(QueryRequest::new("paint my house purple"))
            .await
            .unwrap();
        let error = result.error.unwrap();
        assert_eq!(error.kind, "empty_plan");
        assert!(!result.text.is_empty());
    }

    #[tokio::test]
    async fn test_turns_recorded_per_query() {
        let orchestrator = orchestrator();
        let first = orchestrator
            .handle_query(QueryRequest::new("echo one"))
            .await
            .unwrap();
        orchestrator
            .handle_query(QueryRequest::new("echo two").with_session(&first.session_id))
            .await
            .unwrap();

        let (_, context) = orchestrator
            .sessions()
            .get_or_create(Some(&first.session_id), "anonymous")
            .await;
        let ctx = context.lock().await;
        assert_eq!(ctx.turns().len(), 4);
        assert_eq!(ctx.turns()[0].content, "echo one");
    }

    #[tokio::test]
    async fn test_shutdown_rejects_new_queries() {
        let orchestrator = orchestrator();
        orchestrator.shutdown().await;
        let result = orchestrator.handle_query(QueryRequest::new("echo hi")).await;
        assert!(matches!(result, Err(OrchestratorError::ShuttingDown)));
    }
}
