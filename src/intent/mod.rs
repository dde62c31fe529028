//! 查询分析：意图与实体抽取
//!
//! 先走快速规则匹配（不调用 LLM），命中则直接返回；否则调用 LLM 协作方，
//! 失败时退化为 unknown 意图，绝不向上传播错误。

use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::llm::{Analysis, LanguageModel};

/// 归一化后的查询意图
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intent {
    /// 主标签（search / fetch / summarize / calculate / chat / unknown …）
    pub primary: String,
    /// 次要标签
    #[serde(default)]
    pub secondary: Vec<String>,
    /// 置信度 [0, 1]
    pub confidence: f32,
    /// 复合查询标记：多个祈使从句，规划器据此逐从句分解
    #[serde(default)]
    pub compound: bool,
}

impl Intent {
    pub fn new(primary: impl Into<String>, confidence: f32) -> Self {
        Self {
            primary: primary.into(),
            secondary: Vec::new(),
            confidence: confidence.clamp(0.0, 1.0),
            compound: false,
        }
    }

    /// LLM 协作方失败时的兜底意图
    pub fn unknown() -> Self {
        Self::new("unknown", 0.0)
    }
}

/// 从查询中抽出的实体
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    /// 实体类别（url / number / quoted …）
    pub kind: String,
    /// 原文
    pub text: String,
    /// 在查询中的字节区间 [start, end)
    pub span: (usize, usize),
    /// 解析后的值（可选）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// 复合查询连接词；按首个命中的连接词切分从句
const CLAUSE_CONNECTORS: [&str; 6] = [" and then ", "; then ", ", then ", " then ", "然后", "接着"];

/// 将复合查询切成子目标从句；非复合查询返回单元素
pub fn split_clauses(query: &str) -> Vec<String> {
    for sep in CLAUSE_CONNECTORS {
        if query.contains(sep) {
            return query
                .split(sep)
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect();
        }
    }
    vec![query.trim().to_string()]
}

fn is_compound(query: &str) -> bool {
    CLAUSE_CONNECTORS.iter().any(|sep| query.contains(sep))
}

/// 查询分析器：规则快速路径 + LLM 兜底
pub struct QueryAnalyzer {
    lm: Arc<dyn LanguageModel>,
    /// 启用快速规则匹配（不调用 LLM）
    enable_fast_match: bool,
    /// LLM analyze 超时
    deadline: Duration,
}

impl QueryAnalyzer {
    pub fn new(lm: Arc<dyn LanguageModel>, deadline: Duration) -> Self {
        Self {
            lm,
            enable_fast_match: true,
            deadline,
        }
    }

    pub fn with_fast_match(mut self, enabled: bool) -> Self {
        self.enable_fast_match = enabled;
        self
    }

    /// 分析查询；LLM 失败时返回 unknown 意图 + 规则实体，不报错
    pub async fn analyze(&self, query: &str) -> Analysis {
        if self.enable_fast_match {
            if let Some(analysis) = self.fast_match(query) {
                return analysis;
            }
        }

        match self.lm.analyze(query, self.deadline).await {
            Ok(mut analysis) => {
                analysis.intent.compound = analysis.intent.compound || is_compound(query);
                if analysis.entities.is_empty() {
                    analysis.entities = extract_entities(query);
                }
                analysis
            }
            Err(e) => {
                tracing::warn!("LLM analyze failed, falling back to unknown intent: {}", e);
                let mut intent = Intent::unknown();
                intent.compound = is_compound(query);
                Analysis {
                    intent,
                    entities: extract_entities(query),
                }
            }
        }
    }

    /// 快速规则匹配（不调用 LLM）
    fn fast_match(&self, query: &str) -> Option<Analysis> {
        let lower = query.to_lowercase();

        let primary = if lower.starts_with("search")
            || lower.starts_with("搜索")
            || lower.starts_with("查一下")
            || lower.starts_with("find ")
        {
            Some("search")
        } else if lower.contains("summarize") || lower.contains("总结") || lower.contains("概括") {
            Some("summarize")
        } else if lower.contains("http://") || lower.contains("https://") || lower.starts_with("fetch") {
            Some("fetch")
        } else if lower.starts_with("calculate")
            || lower.starts_with("计算")
            || lower.starts_with("compute")
        {
            Some("calculate")
        } else if lower.starts_with("translate") || lower.starts_with("翻译") {
            Some("translate")
        } else {
            None
        }?;

        let mut intent = Intent::new(primary, 0.9);
        intent.compound = is_compound(query);
        Some(Analysis {
            intent,
            entities: extract_entities(query),
        })
    }
}

/// 规则实体抽取：URL、引号字符串、数字
pub fn extract_entities(query: &str) -> Vec<Entity> {
    let mut entities = Vec::new();

    // 正则编译失败属于代码错误，这里静态模式不会触发
    let patterns: [(&str, &str); 3] = [
        ("url", r#"https?://[^\s"']+"#),
        ("quoted", r#""([^"]+)""#),
        ("number", r"\b\d+(\.\d+)?\b"),
    ];

    for (kind, pattern) in patterns {
        let Ok(re) = Regex::new(pattern) else { continue };
        for m in re.find_iter(query) {
            // quoted 取引号内内容作为 value
            let value = if kind == "quoted" {
                let inner = m.as_str().trim_matches('"');
                Some(serde_json::Value::String(inner.to_string()))
            } else if kind == "number" {
                m.as_str().parse::<f64>().ok().map(|n| serde_json::json!(n))
            } else {
                Some(serde_json::Value::String(m.as_str().to_string()))
            };
            entities.push(Entity {
                kind: kind.to_string(),
                text: m.as_str().to_string(),
                span: (m.start(), m.end()),
                value,
            });
        }
    }

    entities
}
