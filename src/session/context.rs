//! 会话上下文
//!
//! 跨查询的会话状态：交替的对话轮、本轮意图/实体、上次执行摘要与 scratch 键值。
//! 轮历史保留最近 N 轮（user+assistant 为一轮），超出自动剪枝。

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::intent::{Entity, Intent};

/// 对话轮角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    User,
    Assistant,
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TurnRole::User => write!(f, "user"),
            TurnRole::Assistant => write!(f, "assistant"),
        }
    }
}

/// 单个对话轮
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    /// 该轮使用的工具名（assistant 轮）
    #[serde(default)]
    pub tools_used: Vec<String>,
    pub at_ms: i64,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            content: content.into(),
            tools_used: Vec::new(),
            at_ms: Utc::now().timestamp_millis(),
        }
    }

    pub fn assistant(content: impl Into<String>, tools_used: Vec<String>) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            tools_used,
            at_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// 上次执行摘要（下一轮合成时可参考）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub plan_id: String,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
}

#[derive(Error, Debug)]
pub enum ContextError {
    /// 轮历史必须严格 user/assistant 交替
    #[error("turn role {0} does not alternate with previous turn")]
    RoleNotAlternating(TurnRole),
}

/// 会话上下文
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Context {
    pub id: String,
    pub user_id: String,
    turns: Vec<Turn>,
    /// 历史保留轮数（user+assistant 为一轮）
    max_turns: usize,
    /// 本轮查询的意图（仅保留一轮）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_intent: Option<Intent>,
    #[serde(default)]
    pub current_entities: Vec<Entity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<RunSummary>,
    /// scratch 键值：实体名可引用的会话级变量
    #[serde(default)]
    pub scratch: HashMap<String, serde_json::Value>,
    pub last_updated: DateTime<Utc>,
}

impl Context {
    pub fn new(id: impl Into<String>, user_id: impl Into<String>, max_turns: usize) -> Self {
        Self {
            id: id.into(),
            user_id: user_id.into(),
            turns: Vec::new(),
            max_turns: max_turns.max(1),
            current_intent: None,
            current_entities: Vec::new(),
            last_run: None,
            scratch: HashMap::new(),
            last_updated: Utc::now(),
        }
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// 最近 n 轮（合成 prompt 用）
    pub fn recent_turns(&self, n: usize) -> &[Turn] {
        &self.turns[self.turns.len().saturating_sub(n)..]
    }

    /// 追加一轮；角色必须与上一轮交替（首轮必须是 user）
    pub fn push_turn(&mut self, turn: Turn) -> Result<(), ContextError> {
        let expected = match self.turns.last() {
            None | Some(Turn { role: TurnRole::Assistant, .. }) => TurnRole::User,
            Some(Turn { role: TurnRole::User, .. }) => TurnRole::Assistant,
        };
        if turn.role != expected {
            return Err(ContextError::RoleNotAlternating(turn.role));
        }
        self.turns.push(turn);
        self.prune();
        self.touch();
        Ok(())
    }

    /// 清空历史与 scratch，保留会话 id（clear history 语义）
    pub fn clear(&mut self) {
        self.turns.clear();
        self.scratch.clear();
        self.current_intent = None;
        self.current_entities.clear();
        self.last_run = None;
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_updated = Utc::now();
    }

    /// 空闲时长是否超过 ttl
    pub fn idle_longer_than(&self, ttl: std::time::Duration) -> bool {
        let idle = Utc::now().signed_duration_since(self.last_updated);
        idle.to_std().map(|d| d > ttl).unwrap_or(false)
    }

    /// 超出 max_turns*2 时丢弃最旧消息；从 user 轮开始保留，维持交替不变量
    fn prune(&mut self) {
        let keep = self.max_turns * 2;
        if self.turns.len() > keep {
            let mut start = self.turns.len() - keep;
            if self.turns[start].role == TurnRole::Assistant {
                start += 1;
            }
            self.turns.drain(..start);
        }
    }
}
