//! Hive Web 服务
//!
//! 启动: cargo run --bin hive-web --features web
//! 一元查询走 POST /api/query，流式走 GET /ws（agent:* 帧协议）。
//! 本层只做协议转接：进度/阶段事件重新装帧，不含任何编排逻辑。

#![cfg(feature = "web")]

use std::sync::Arc;

use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use hive::config::load_config;
use hive::core::{Orchestrator, OrchestratorError, QueryRequest, QueryResult};
use hive::exec::{Phase, ProgressChannel, ProgressEvent};
use hive::llm::openai::create_lm_from_config;
use hive::observability::Metrics;
use hive::registry::{register_builtins, ToolRegistry};
use hive::session::{FileSessionStore, NullSessionStore, SessionPersistence};

struct AppState {
    orchestrator: Arc<Orchestrator>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    hive::observability::init();

    let cfg = load_config(None)?;
    let port = cfg.web.port;

    let registry = Arc::new(ToolRegistry::new());
    register_builtins(&registry);
    let lm = create_lm_from_config(&cfg.llm);
    let persistence: Arc<dyn SessionPersistence> = match cfg.session.snapshot_dir.clone() {
        Some(dir) => Arc::new(FileSessionStore::new(dir)),
        None => Arc::new(NullSessionStore),
    };

    let orchestrator = Orchestrator::new(cfg, registry, lm, persistence);
    orchestrator.shutdown_manager().watch_signals();
    let shutdown = Arc::clone(orchestrator.shutdown_manager());

    let state = Arc::new(AppState {
        orchestrator: Arc::clone(&orchestrator),
    });

    let app = Router::new()
        .route("/api/query", post(query_handler))
        .route("/api/session/{id}/clear", post(clear_handler))
        .route("/api/metrics", get(metrics_handler))
        .route("/ws", get(ws_handler))
        .with_state(state);

    let addr = format!("127.0.0.1:{port}");
    tracing::info!("hive-web listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.wait_for_shutdown().await })
        .await?;

    orchestrator.shutdown().await;
    Ok(())
}

async fn query_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<QueryRequest>,
) -> Result<Json<QueryResult>, (StatusCode, String)> {
    state
        .orchestrator
        .handle_query(request)
        .await
        .map(Json)
        .map_err(map_error)
}

fn map_error(e: OrchestratorError) -> (StatusCode, String) {
    let code = match &e {
        OrchestratorError::Validation(_) => StatusCode::BAD_REQUEST,
        OrchestratorError::SessionBusy(_) => StatusCode::TOO_MANY_REQUESTS,
        OrchestratorError::DeadlineExceeded(_) => StatusCode::GATEWAY_TIMEOUT,
        OrchestratorError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, e.to_string())
}

async fn metrics_handler() -> Json<serde_json::Value> {
    Json(Metrics::global().to_json())
}

/// 清空历史但保留会话；注册表遥测不受影响
async fn clear_handler(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(id): axum::extract::Path<String>,
) -> StatusCode {
    state.orchestrator.sessions().clear(&id).await;
    StatusCode::NO_CONTENT
}

/// 客户端帧
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientFrame {
    #[serde(rename = "agent:query")]
    Query {
        #[serde(default)]
        query_id: Option<String>,
        text: String,
        #[serde(default)]
        session_id: Option<String>,
        #[serde(default)]
        user_id: Option<String>,
    },
    #[serde(rename = "agent:cancel")]
    Cancel { query_id: String },
}

/// 服务端帧
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ServerFrame {
    #[serde(rename = "agent:status")]
    Status { query_id: String, phase: Phase },
    #[serde(rename = "agent:progress")]
    Progress {
        query_id: String,
        #[serde(flatten)]
        event: ProgressEvent,
    },
    #[serde(rename = "agent:response")]
    Response {
        query_id: String,
        result: QueryResult,
    },
    #[serde(rename = "agent:error")]
    Error { query_id: String, error: String },
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ServerFrame>();
    let active: Arc<DashMap<String, CancellationToken>> = Arc::new(DashMap::new());

    // 写半边：序列化帧并发送
    let writer = tokio::spawn(async move {
        while let Some(frame) = out_rx.recv().await {
            let Ok(raw) = serde_json::to_string(&frame) else { continue };
            if sink.send(Message::Text(raw.into())).await.is_err() {
                break;
            }
        }
    });

    // 读半边：解析客户端帧并分发
    while let Some(incoming) = stream.next().await {
        match incoming {
            Ok(Message::Text(raw)) => match serde_json::from_str::<ClientFrame>(&raw) {
                Ok(ClientFrame::Query { query_id, text, session_id, user_id }) => {
                    let query_id = query_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
                    let cancel = CancellationToken::new();
                    active.insert(query_id.clone(), cancel.clone());
                    spawn_query(
                        Arc::clone(&state),
                        out_tx.clone(),
                        Arc::clone(&active),
                        query_id,
                        text,
                        session_id,
                        user_id,
                        cancel,
                    );
                }
                Ok(ClientFrame::Cancel { query_id }) => {
                    if let Some((_, token)) = active.remove(&query_id) {
                        token.cancel();
                    }
                }
                Err(e) => {
                    let _ = out_tx.send(ServerFrame::Error {
                        query_id: String::new(),
                        error: format!("malformed frame: {e}"),
                    });
                }
            },
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    // 客户端断连：在途查询全部取消
    for entry in active.iter() {
        entry.value().cancel();
    }
    writer.abort();
}

#[allow(clippy::too_many_arguments)]
fn spawn_query(
    state: Arc<AppState>,
    out_tx: mpsc::UnboundedSender<ServerFrame>,
    active: Arc<DashMap<String, CancellationToken>>,
    query_id: String,
    text: String,
    session_id: Option<String>,
    user_id: Option<String>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let progress = Arc::new(ProgressChannel::default());
        let mut steps = progress.subscribe();
        let mut phases = progress.subscribe_phases();

        // 事件重新装帧：阶段 → agent:status，步骤迁移 → agent:progress
        let forward_tx = out_tx.clone();
        let forward_id = query_id.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                tokio::select! {
                    step = steps.recv() => match step {
                        Ok(event) => {
                            let _ = forward_tx.send(ServerFrame::Progress {
                                query_id: forward_id.clone(),
                                event,
                            });
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    phase = phases.recv() => match phase {
                        Ok(phase) => {
                            let _ = forward_tx.send(ServerFrame::Status {
                                query_id: forward_id.clone(),
                                phase,
                            });
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        let mut request = QueryRequest::new(text);
        request.session_id = session_id;
        request.user_id = user_id;

        let result = state
            .orchestrator
            .handle_query_streaming(request, Some(Arc::clone(&progress)), Some(cancel))
            .await;

        forwarder.abort();
        active.remove(&query_id);

        match result {
            Ok(result) => {
                let _ = out_tx.send(ServerFrame::Response { query_id, result });
            }
            Err(e) => {
                let _ = out_tx.send(ServerFrame::Error {
                    query_id,
                    error: e.to_string(),
                });
            }
        }
    });
}
