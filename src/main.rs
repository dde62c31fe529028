//! Hive 控制台入口
//!
//! 无需任何 API Key 的最小回路：stdin 读查询 → 编排器 → stdout 打印回复。
//! 完整 HTTP/WebSocket 服务见 `hive-web`（feature = "web"）。

use std::io::Write;
use std::sync::Arc;

use anyhow::Context as _;
use tokio::io::AsyncBufReadExt;

use hive::config::load_config;
use hive::core::{Orchestrator, QueryRequest};
use hive::llm::openai::create_lm_from_config;
use hive::registry::{register_builtins, ToolRegistry};
use hive::session::{FileSessionStore, NullSessionStore, SessionPersistence};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let cfg = load_config(None).context("failed to load configuration")?;

    let registry = Arc::new(ToolRegistry::new());
    register_builtins(&registry);
    // tools/ 目录下的 JSON 清单（句柄按名绑定到内置实现）
    if std::path::Path::new("tools").is_dir() {
        let loaded = registry.load_from_directory("tools", &hive::registry::builtin_handlers());
        if loaded > 0 {
            tracing::info!("loaded {} tool manifests from tools/", loaded);
        }
    }

    let lm = create_lm_from_config(&cfg.llm);
    let persistence: Arc<dyn SessionPersistence> = match cfg.session.snapshot_dir.clone() {
        Some(dir) => Arc::new(FileSessionStore::new(dir)),
        None => Arc::new(NullSessionStore),
    };

    let orchestrator = Orchestrator::new(cfg, registry, lm, persistence);
    orchestrator.shutdown_manager().watch_signals();

    println!("hive ready ({} tools); type a query, 'quit' to exit", orchestrator.registry().len());

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    let mut session_id: Option<String> = None;

    loop {
        print!("> ");
        std::io::stdout().flush().ok();

        tokio::select! {
            _ = orchestrator.shutdown_manager().wait_for_shutdown() => break,
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                if line == "quit" {
                    break;
                }

                let mut request = QueryRequest::new(line);
                if let Some(ref id) = session_id {
                    request = request.with_session(id.clone());
                }
                match orchestrator.handle_query(request).await {
                    Ok(result) => {
                        session_id = Some(result.session_id.clone());
                        println!("{}", result.text);
                        if let Some(error) = result.error {
                            println!("({}: {})", error.kind, error.user_message);
                        }
                    }
                    Err(e) => eprintln!("error: {e}"),
                }
            }
        }
    }

    orchestrator.shutdown().await;
    Ok(())
}
