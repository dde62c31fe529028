//! 合成器
//!
//! 把成功步骤的输出与近期对话交给 LLM 合成最终回复；协作方失败时退化为
//! 确定性拼接，绝不让协作方错误穿透到调用方。

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::llm::{LanguageModel, Synthesis, SynthesisRequest};
use crate::session::Turn;

/// 合成最终回复；空计划时提供 LLM 兜底叙述
pub struct Synthesizer {
    lm: Arc<dyn LanguageModel>,
    deadline: Duration,
    /// 空计划时是否用 LLM 产出叙述（否则固定话术）
    llm_fallback_enabled: bool,
}

impl Synthesizer {
    pub fn new(lm: Arc<dyn LanguageModel>, deadline: Duration, llm_fallback_enabled: bool) -> Self {
        Self {
            lm,
            deadline,
            llm_fallback_enabled,
        }
    }

    /// LLM 合成，失败退化为确定性拼接
    pub async fn synthesize(
        &self,
        query: &str,
        outputs: &[(String, Value)],
        history: &[Turn],
    ) -> Synthesis {
        let request = SynthesisRequest {
            query,
            outputs,
            history,
        };
        match self.lm.synthesize(request, self.deadline).await {
            Ok(synthesis) => synthesis,
            Err(e) => {
                tracing::warn!("LLM synthesize failed, using deterministic fallback: {}", e);
                deterministic_fallback(query, outputs)
            }
        }
    }

    /// 空计划兜底：LLM 仅凭原始查询生成叙述；禁用或失败时用固定话术
    pub async fn empty_plan_reply(&self, query: &str, history: &[Turn]) -> String {
        if self.llm_fallback_enabled {
            let request = SynthesisRequest {
                query,
                outputs: &[],
                history,
            };
            if let Ok(synthesis) = self.lm.synthesize(request, self.deadline).await {
                if !synthesis.text.trim().is_empty() {
                    return synthesis.text;
                }
            }
        }
        "I don't have a tool that can help with that yet.".to_string()
    }
}

/// 确定性拼接：逐条列出成功工具的输出
fn deterministic_fallback(query: &str, outputs: &[(String, Value)]) -> Synthesis {
    if outputs.is_empty() {
        return Synthesis {
            text: format!("No tool produced output for: {query}"),
            html: None,
            sources: Vec::new(),
        };
    }
    let mut lines = Vec::with_capacity(outputs.len());
    let mut sources = Vec::with_capacity(outputs.len());
    for (tool, output) in outputs {
        let rendered = match output {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        lines.push(format!("[{tool}] {rendered}"));
        sources.push(tool.clone());
    }
    Synthesis {
        text: lines.join("\n"),
        html: None,
        sources,
    }
}
