//! 编排器集成测试
//!
//! 针对 Mock LLM 跑完整查询回路：注册表 → 分析 → 规划 → 执行 → 合成。

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use hive::config::AppConfig;
use hive::core::{Orchestrator, OrchestratorError, QueryRequest};
use hive::exec::{ProgressChannel, StepState};
use hive::llm::MockLm;
use hive::registry::{
    register_builtins, StepContext, Tool, ToolDefinition, ToolError, ToolRegistry,
};
use hive::session::NullSessionStore;

struct PageTool;

#[async_trait]
impl Tool for PageTool {
    async fn execute(&self, _input: Value, _ctx: &StepContext) -> Result<Value, ToolError> {
        Ok(Value::String("front page content".to_string()))
    }
}

/// 读依赖输出做摘要
struct SummaryTool;

#[async_trait]
impl Tool for SummaryTool {
    async fn execute(&self, _input: Value, ctx: &StepContext) -> Result<Value, ToolError> {
        let upstream = ctx
            .dependency_outputs
            .values()
            .next()
            .and_then(|v| v.as_str())
            .unwrap_or("(nothing)");
        Ok(Value::String(format!("summary of: {upstream}")))
    }
}

struct NamedTool {
    output: &'static str,
}

#[async_trait]
impl Tool for NamedTool {
    async fn execute(&self, _input: Value, _ctx: &StepContext) -> Result<Value, ToolError> {
        Ok(Value::String(self.output.to_string()))
    }
}

struct BrokenTool;

#[async_trait]
impl Tool for BrokenTool {
    async fn execute(&self, _input: Value, _ctx: &StepContext) -> Result<Value, ToolError> {
        Err(ToolError::Failed("exploded".to_string()))
    }
}

/// 第一次瞬时失败，之后成功
struct FlakyTool {
    remaining: AtomicU32,
}

#[async_trait]
impl Tool for FlakyTool {
    async fn execute(&self, _input: Value, _ctx: &StepContext) -> Result<Value, ToolError> {
        if self.remaining.load(Ordering::SeqCst) > 0 {
            self.remaining.fetch_sub(1, Ordering::SeqCst);
            return Err(ToolError::Transient("rate limited".to_string()));
        }
        Ok(Value::String("flaky done".to_string()))
    }
}

struct SleepyTool {
    delay: Duration,
}

#[async_trait]
impl Tool for SleepyTool {
    async fn execute(&self, _input: Value, _ctx: &StepContext) -> Result<Value, ToolError> {
        tokio::time::sleep(self.delay).await;
        Ok(Value::String("slept".to_string()))
    }
}

fn orchestrator_with(registry: Arc<ToolRegistry>, config: AppConfig) -> Arc<Orchestrator> {
    Orchestrator::new(config, registry, Arc::new(MockLm), Arc::new(NullSessionStore))
}

#[tokio::test]
async fn test_simple_single_tool_query() {
    let registry = Arc::new(ToolRegistry::new());
    register_builtins(&registry);
    let orchestrator = orchestrator_with(registry, AppConfig::default());

    let result = orchestrator
        .handle_query(QueryRequest::new("please echo hello"))
        .await
        .unwrap();

    assert!(result.text.contains("hello"));
    assert_eq!(result.tools_used.len(), 1);
    assert_eq!(result.tools_used[0].name, "echo");
    assert!(result.error.is_none());
    assert!(!result.session_id.is_empty());
}

#[tokio::test]
async fn test_two_step_chain_with_progress_order() {
    let registry = Arc::new(ToolRegistry::new());
    registry
        .register(
            ToolDefinition::new("Fetch")
                .with_keywords(&["fetch"])
                .with_io(&["text/query"], &["text/plain"])
                .with_description("fetch the front page of a site"),
            Arc::new(PageTool),
        )
        .unwrap();
    registry
        .register(
            ToolDefinition::new("Summarize")
                .with_keywords(&["summarize", "summary"])
                .with_io(&["text/plain"], &["text/summary"])
                .with_description("summarize plain text into a digest"),
            Arc::new(SummaryTool),
        )
        .unwrap();
    let orchestrator = orchestrator_with(registry, AppConfig::default());

    let progress = Arc::new(ProgressChannel::new(64));
    let mut rx = progress.subscribe();

    let result = orchestrator
        .handle_query_streaming(
            QueryRequest::new("summarize the front page"),
            Some(Arc::clone(&progress)),
            None,
        )
        .await
        .unwrap();

    // 摘要步骤消费了抓取输出
    assert!(result.text.contains("summary of: front page content"));
    assert!(result.error.is_none());

    // 事件序：Fetch Running/Succeeded 先于 Summarize Running/Succeeded，seq 单调
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    let states: Vec<(String, StepState)> = events
        .iter()
        .map(|e| (e.step_id.clone(), e.state))
        .collect();
    assert_eq!(
        states,
        vec![
            ("step-1".to_string(), StepState::Running),
            ("step-1".to_string(), StepState::Succeeded),
            ("step-2".to_string(), StepState::Running),
            ("step-2".to_string(), StepState::Succeeded),
        ]
    );
    for pair in events.windows(2) {
        assert!(pair[1].seq > pair[0].seq);
    }
}

#[tokio::test]
async fn test_transient_failure_retried_then_succeeds() {
    let registry = Arc::new(ToolRegistry::new());
    let flaky_id = registry
        .register(
            ToolDefinition::new("Flaky")
                .with_keywords(&["flaky"])
                .with_io(&["text/query"], &["text/plain"]),
            Arc::new(FlakyTool {
                remaining: AtomicU32::new(1),
            }),
        )
        .unwrap();
    let orchestrator = orchestrator_with(Arc::clone(&registry), AppConfig::default());

    let result = orchestrator
        .handle_query(QueryRequest::new("run the flaky step"))
        .await
        .unwrap();

    assert!(result.text.contains("flaky done"));
    assert!(result.error.is_none());

    // 两次调用：一次瞬时失败 + 一次成功，遥测逐次记录
    let stats = registry.stats(&flaky_id).unwrap();
    assert_eq!(stats.total_invocations, 2);
    assert_eq!(stats.successes, 1);
    assert_eq!(stats.failures, 1);
}

#[tokio::test]
async fn test_partial_failure_keeps_best_effort_text() {
    let registry = Arc::new(ToolRegistry::new());
    registry
        .register(
            ToolDefinition::new("Alpha")
                .with_keywords(&["alpha"])
                .with_io(&["text/query"], &["text/alpha"]),
            Arc::new(NamedTool { output: "alpha output" }),
        )
        .unwrap();
    registry
        .register(
            ToolDefinition::new("Beta")
                .with_keywords(&["beta"])
                .with_io(&["text/query"], &["text/beta"]),
            Arc::new(BrokenTool),
        )
        .unwrap();
    registry
        .register(
            ToolDefinition::new("Gamma")
                .with_keywords(&["gamma"])
                .with_io(&["text/query"], &["text/gamma"]),
            Arc::new(NamedTool { output: "gamma output" }),
        )
        .unwrap();
    let orchestrator = orchestrator_with(registry, AppConfig::default());

    let result = orchestrator
        .handle_query(QueryRequest::new("alpha and then beta and then gamma"))
        .await
        .unwrap();

    // 两个成功步骤的输出都在；失败步骤不致命
    assert!(result.text.contains("alpha output"));
    assert!(result.text.contains("gamma output"));
    // 其余关键步骤成功：不标注错误
    assert!(result.error.is_none());
}

#[tokio::test]
async fn test_only_critical_step_fails_marks_tool_failure() {
    let registry = Arc::new(ToolRegistry::new());
    registry
        .register(
            ToolDefinition::new("Beta")
                .with_keywords(&["beta"])
                .with_io(&["text/query"], &["text/beta"]),
            Arc::new(BrokenTool),
        )
        .unwrap();
    let orchestrator = orchestrator_with(registry, AppConfig::default());

    let result = orchestrator
        .handle_query(QueryRequest::new("run beta"))
        .await
        .unwrap();

    let error = result.error.unwrap();
    assert_eq!(error.kind, "tool_failure");
    assert!(!result.text.is_empty());
}

#[tokio::test]
async fn test_cancellation_mid_step() {
    let registry = Arc::new(ToolRegistry::new());
    registry
        .register(
            ToolDefinition::new("Sleepy")
                .with_keywords(&["sleepy"])
                .with_io(&["text/query"], &["text/plain"]),
            Arc::new(SleepyTool {
                delay: Duration::from_secs(5),
            }),
        )
        .unwrap();
    let orchestrator = orchestrator_with(registry, AppConfig::default());

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let result = orchestrator
        .handle_query_streaming(
            QueryRequest::new("run the sleepy step"),
            None,
            Some(cancel),
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(result.error.unwrap().kind, "canceled");
}

#[tokio::test]
async fn test_idle_eviction_yields_fresh_context() {
    let registry = Arc::new(ToolRegistry::new());
    register_builtins(&registry);
    let mut config = AppConfig::default();
    config.session.idle_ttl_secs = 0;
    let orchestrator = orchestrator_with(registry, config);

    let result = orchestrator
        .handle_query(QueryRequest::new("echo remember me"))
        .await
        .unwrap();
    let session_id = result.session_id.clone();

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(orchestrator.sessions().sweep().await, 1);

    // 同 id 再取：全新（空）上下文
    let (_, context) = orchestrator
        .sessions()
        .get_or_create(Some(&session_id), "anonymous")
        .await;
    assert!(context.lock().await.turns().is_empty());
}

#[tokio::test]
async fn test_session_queue_saturation() {
    let registry = Arc::new(ToolRegistry::new());
    registry
        .register(
            ToolDefinition::new("Sleepy")
                .with_keywords(&["sleepy"])
                .with_io(&["text/query"], &["text/plain"]),
            Arc::new(SleepyTool {
                delay: Duration::from_millis(500),
            }),
        )
        .unwrap();
    let mut config = AppConfig::default();
    config.orchestrator.max_queued_queries_per_session = 1;
    let orchestrator = orchestrator_with(registry, config);

    let first = orchestrator
        .handle_query(QueryRequest::new("sleepy one"))
        .await
        .unwrap();
    let session_id = first.session_id.clone();

    // 一个在跑、一个在排队，第三个应拿到 SessionBusy
    let running = {
        let orchestrator = Arc::clone(&orchestrator);
        let session_id = session_id.clone();
        tokio::spawn(async move {
            orchestrator
                .handle_query(QueryRequest::new("sleepy two").with_session(session_id))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    let queued = {
        let orchestrator = Arc::clone(&orchestrator);
        let session_id = session_id.clone();
        tokio::spawn(async move {
            orchestrator
                .handle_query(QueryRequest::new("sleepy three").with_session(session_id))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let saturated = orchestrator
        .handle_query(QueryRequest::new("sleepy four").with_session(session_id.clone()))
        .await;
    assert!(matches!(saturated, Err(OrchestratorError::SessionBusy(_))));

    assert!(running.await.unwrap().is_ok());
    assert!(queued.await.unwrap().is_ok());
}

#[tokio::test]
async fn test_slow_session_does_not_block_others() {
    let registry = Arc::new(ToolRegistry::new());
    register_builtins(&registry);
    registry
        .register(
            ToolDefinition::new("Sleepy")
                .with_keywords(&["sleepy"])
                .with_io(&["text/query"], &["text/plain"]),
            Arc::new(SleepyTool {
                delay: Duration::from_secs(2),
            }),
        )
        .unwrap();
    let orchestrator = orchestrator_with(registry, AppConfig::default());

    let slow = {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            orchestrator
                .handle_query(QueryRequest::new("sleepy crawl"))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    // 另一个会话的查询不受慢会话影响
    let started = Instant::now();
    let quick = orchestrator
        .handle_query(QueryRequest::new("echo fast lane"))
        .await
        .unwrap();
    assert!(quick.text.contains("fast lane"));
    assert!(started.elapsed() < Duration::from_millis(1500));

    assert!(slow.await.unwrap().is_ok());
}
