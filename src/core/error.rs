//! 编排器错误分类
//!
//! 只有 Validation / SessionBusy / 无任何成功步骤的 DeadlineExceeded / 关闭中
//! 以 Err 直接暴露给调用方；工具失败、空计划、协作方失败、协作取消都落在
//! QueryResult.error 里，text 仍尽力给出。

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 对调用方可见的错误
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// 请求本身不合法（空查询、畸形载荷）
    #[error("validation error: {0}")]
    Validation(String),

    /// 同一会话排队深度超限
    #[error("session {0} is busy, try again later")]
    SessionBusy(String),

    /// 端到端或计划级截止被突破且没有任何成功步骤
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// 编排器正在关闭
    #[error("orchestrator is shutting down")]
    ShuttingDown,
}

/// QueryResult 内的错误标注（非致命失败：部分结果仍返回）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// tool_failure / empty_plan / deadline_exceeded / canceled
    #[serde(rename = "type")]
    pub kind: String,
    pub user_message: String,
}

impl ErrorInfo {
    pub fn new(kind: impl Into<String>, user_message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            user_message: user_message.into(),
        }
    }
}
