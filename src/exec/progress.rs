//! 执行进度事件
//!
//! 每次状态迁移发布一条带 seq 的事件；底层是 broadcast 通道，
//! 订阅者滞后只会丢事件（可由 seq 检出空洞），绝不阻塞执行。

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use super::outcome::StepState;
use crate::plan::StepId;

/// 单条进度事件
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    /// 单调递增；消费端据此检测丢失
    pub seq: u64,
    pub step_id: StepId,
    pub state: StepState,
    /// 工具推送的中间结果（可选）
    #[serde(skip_serializing_if = "Option::is_none")]
    pub partial: Option<Value>,
    /// 自计划启动以来的毫秒数
    pub elapsed_ms: u64,
}

/// 查询处理阶段（传输层 agent:status 帧用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Analyzing,
    Planning,
    Executing,
    Synthesizing,
}

/// 进度发布端：每次查询独享，不跨查询共享
pub struct ProgressChannel {
    tx: broadcast::Sender<ProgressEvent>,
    phase_tx: broadcast::Sender<Phase>,
    seq: AtomicU64,
    started: Instant,
}

impl ProgressChannel {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        let (phase_tx, _) = broadcast::channel(8);
        Self {
            tx,
            phase_tx,
            seq: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    pub fn subscribe_phases(&self) -> broadcast::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    /// 发布阶段切换；无订阅者时静默丢弃
    pub fn emit_phase(&self, phase: Phase) {
        let _ = self.phase_tx.send(phase);
    }

    /// 发布一次状态迁移；无订阅者时静默丢弃
    pub fn emit(&self, step_id: &str, state: StepState, partial: Option<Value>) {
        let event = ProgressEvent {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            step_id: step_id.to_string(),
            state,
            partial,
            elapsed_ms: self.started.elapsed().as_millis() as u64,
        };
        let _ = self.tx.send(event);
    }
}

impl Default for ProgressChannel {
    fn default() -> Self {
        Self::new(64)
    }
}
