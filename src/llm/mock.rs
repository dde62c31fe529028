//! Mock LLM 客户端（用于测试，无需 API）
//!
//! analyze 用与快速规则相同的关键词分类；synthesize 把成功步骤输出拼接为列表。
//! 全部行为确定性，所有测试针对它运行。

use std::time::Duration;

use async_trait::async_trait;

use crate::intent::{extract_entities, Intent};
use crate::llm::{Analysis, LanguageModel, LmError, Synthesis, SynthesisRequest};

/// Mock 客户端：确定性分析与合成
#[derive(Debug, Default)]
pub struct MockLm;

#[async_trait]
impl LanguageModel for MockLm {
    async fn analyze(&self, text: &str, _deadline: Duration) -> Result<Analysis, LmError> {
        let lower = text.to_lowercase();
        let primary = if lower.contains("search") || lower.contains("搜索") {
            "search"
        } else if lower.contains("summarize") || lower.contains("总结") {
            "summarize"
        } else if lower.contains("http://") || lower.contains("https://") || lower.contains("fetch") {
            "fetch"
        } else if lower.contains("calculate") || lower.contains("计算") {
            "calculate"
        } else {
            "chat"
        };

        Ok(Analysis {
            intent: Intent::new(primary, 0.75),
            entities: extract_entities(text),
        })
    }

    async fn synthesize(
        &self,
        request: SynthesisRequest<'_>,
        _deadline: Duration,
    ) -> Result<Synthesis, LmError> {
        let mut lines = Vec::with_capacity(request.outputs.len());
        let mut sources = Vec::with_capacity(request.outputs.len());
        for (tool, output) in request.outputs {
            lines.push(format!("[{}] {}", tool, render_value(output)));
            sources.push(tool.clone());
        }

        let text = if lines.is_empty() {
            format!("No tool produced output for: {}", request.query)
        } else {
            lines.join("\n")
        };

        Ok(Synthesis {
            text,
            html: None,
            sources,
        })
    }
}

/// 字符串直接展开，其余类型保持 JSON 形式
pub(crate) fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_analyze_classifies() {
        let lm = MockLm;
        let analysis = lm
            .analyze("please search for rust", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(analysis.intent.primary, "search");
    }

    #[tokio::test]
    async fn test_mock_synthesize_concatenates() {
        let lm = MockLm;
        let outputs = vec![("echo".to_string(), serde_json::json!("hello"))];
        let synthesis = lm
            .synthesize(
                SynthesisRequest {
                    query: "say hello",
                    outputs: &outputs,
                    history: &[],
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert!(synthesis.text.contains("hello"));
        assert_eq!(synthesis.sources, vec!["echo".to_string()]);
    }
}
