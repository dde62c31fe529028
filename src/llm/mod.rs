//! LLM 协作方抽象
//!
//! 规划与合成只依赖窄接口 LanguageModel（analyze / synthesize，均带 deadline），
//! 错误按 Transient / Permanent / QuotaExceeded 分类，由调用方决定重试或兜底。

pub mod mock;
pub mod openai;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::intent::{Entity, Intent};
use crate::session::Turn;

/// LLM 协作方错误分类（上层据此选择重试 / 兜底 / 放弃）
#[derive(Error, Debug, Clone)]
pub enum LmError {
    /// 网络抖动、限流带 retry-after 等，可重试
    #[error("transient LLM failure: {0}")]
    Transient(String),
    /// 请求本身不可恢复（参数、解析、鉴权）
    #[error("permanent LLM failure: {0}")]
    Permanent(String),
    #[error("LLM quota exceeded: {0}")]
    QuotaExceeded(String),
}

/// analyze 的结构化结果
#[derive(Debug, Clone)]
pub struct Analysis {
    pub intent: Intent,
    pub entities: Vec<Entity>,
}

/// synthesize 的输入：查询、成功步骤的 (工具名, 输出)、本会话近期对话
pub struct SynthesisRequest<'a> {
    pub query: &'a str,
    pub outputs: &'a [(String, serde_json::Value)],
    pub history: &'a [Turn],
}

/// synthesize 的结果
#[derive(Debug, Clone, Default)]
pub struct Synthesis {
    pub text: String,
    pub html: Option<String>,
    pub sources: Vec<String>,
}

/// LLM 客户端 trait：意图/实体分析与最终合成，两者都必须在 deadline 内返回
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn analyze(&self, text: &str, deadline: Duration) -> Result<Analysis, LmError>;

    async fn synthesize(
        &self,
        request: SynthesisRequest<'_>,
        deadline: Duration,
    ) -> Result<Synthesis, LmError>;
}

pub use mock::MockLm;
pub use openai::OpenAiLm;

/// 从 LLM 回复中提取 JSON 块（```json ... ``` 或首尾大括号之间）
pub(crate) fn extract_json(output: &str) -> Option<&str> {
    let trimmed = output.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return Some(rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim()));
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (start <= end).then(|| &trimmed[start..=end])
}
