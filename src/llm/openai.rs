//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! analyze / synthesize 都要求模型输出 JSON，解析失败时 analyze 报 Permanent、synthesize 退化为纯文本。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessageArgs,
    ChatCompletionRequestUserMessageArgs, CreateChatCompletionRequestArgs,
};
use async_openai::Client;
use async_trait::async_trait;
use serde::Deserialize;

use crate::intent::{Entity, Intent};
use crate::llm::{extract_json, Analysis, LanguageModel, LmError, Synthesis, SynthesisRequest};

const ANALYZE_SYSTEM_PROMPT: &str = r#"You are a query analyzer. Given a user query, output ONLY a JSON object:
{
  "intent": {"primary": "<label>", "secondary": ["<label>"], "confidence": 0.0-1.0, "compound": true|false},
  "entities": [{"kind": "<kind>", "text": "<surface text>", "span": [start, end], "value": null}]
}
Labels: search, fetch, summarize, translate, calculate, chat, unknown.
"compound" is true when the query contains several imperative clauses to run in order.
No explanation, JSON only."#;

const SYNTHESIZE_SYSTEM_PROMPT: &str = r#"You are a response synthesizer. Combine the tool outputs into one answer for the user.
Output ONLY a JSON object: {"text": "<answer>", "html": null, "sources": ["<tool name>"]}.
Mention every tool whose output you used in "sources". No explanation, JSON only."#;

/// OpenAI 兼容客户端：持有 Client 与 model 名
pub struct OpenAiLm {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAiLm {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new().with_api_base(url).with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
        }
    }

    /// 单次 chat 调用，取首条 choice 的 content；deadline 超时报 Transient
    async fn complete(
        &self,
        system: &str,
        user: String,
        deadline: Duration,
    ) -> Result<String, LmError> {
        let messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestMessage::System(
                ChatCompletionRequestSystemMessageArgs::default()
                    .content(system.to_string())
                    .build()
                    .map_err(|e| LmError::Permanent(e.to_string()))?,
            ),
            ChatCompletionRequestMessage::User(
                ChatCompletionRequestUserMessageArgs::default()
                    .content(user)
                    .build()
                    .map_err(|e| LmError::Permanent(e.to_string()))?,
            ),
        ];

        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(messages)
            .build()
            .map_err(|e| LmError::Permanent(e.to_string()))?;

        let response = tokio::time::timeout(deadline, self.client.chat().create(request))
            .await
            .map_err(|_| LmError::Transient("LLM call exceeded deadline".to_string()))?
            .map_err(classify_error)?;

        response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| LmError::Permanent("empty completion".to_string()))
    }
}

/// 将 async_openai 错误映射到协作方错误分类
fn classify_error(e: OpenAIError) -> LmError {
    let msg = e.to_string();
    let lower = msg.to_lowercase();
    if lower.contains("quota") || lower.contains("rate limit") || lower.contains("429") {
        return LmError::QuotaExceeded(msg);
    }
    match e {
        // HTTP 层失败（连接、超时）可重试
        OpenAIError::Reqwest(_) => LmError::Transient(msg),
        _ => LmError::Permanent(msg),
    }
}

#[derive(Deserialize)]
struct AnalyzeReply {
    intent: IntentReply,
    #[serde(default)]
    entities: Vec<EntityReply>,
}

#[derive(Deserialize)]
struct IntentReply {
    primary: String,
    #[serde(default)]
    secondary: Vec<String>,
    #[serde(default)]
    confidence: f32,
    #[serde(default)]
    compound: bool,
}

#[derive(Deserialize)]
struct EntityReply {
    kind: String,
    text: String,
    #[serde(default)]
    span: Option<(usize, usize)>,
    #[serde(default)]
    value: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct SynthesizeReply {
    text: String,
    #[serde(default)]
    html: Option<String>,
    #[serde(default)]
    sources: Vec<String>,
}

#[async_trait]
impl LanguageModel for OpenAiLm {
    async fn analyze(&self, text: &str, deadline: Duration) -> Result<Analysis, LmError> {
        let content = self
            .complete(ANALYZE_SYSTEM_PROMPT, format!("Query: {}", text), deadline)
            .await?;

        let json = extract_json(&content)
            .ok_or_else(|| LmError::Permanent(format!("no JSON in analyze reply: {content}")))?;
        let reply: AnalyzeReply = serde_json::from_str(json)
            .map_err(|e| LmError::Permanent(format!("analyze reply parse error: {e}")))?;

        let mut intent = Intent::new(reply.intent.primary, reply.intent.confidence);
        intent.secondary = reply.intent.secondary;
        intent.compound = reply.intent.compound;

        let entities = reply
            .entities
            .into_iter()
            .map(|e| {
                // 模型给的 span 不可靠，以原文定位为准
                let span = e
                    .span
                    .or_else(|| text.find(&e.text).map(|s| (s, s + e.text.len())))
                    .unwrap_or((0, 0));
                Entity {
                    kind: e.kind,
                    text: e.text,
                    span,
                    value: e.value,
                }
            })
            .collect();

        Ok(Analysis { intent, entities })
    }

    async fn synthesize(
        &self,
        request: SynthesisRequest<'_>,
        deadline: Duration,
    ) -> Result<Synthesis, LmError> {
        let mut prompt = format!("User query: {}\n\nTool outputs:\n", request.query);
        for (tool, output) in request.outputs {
            prompt.push_str(&format!("- {}: {}\n", tool, output));
        }
        if !request.history.is_empty() {
            prompt.push_str("\nRecent conversation:\n");
            for turn in request.history {
                prompt.push_str(&format!("{}: {}\n", turn.role, turn.content));
            }
        }

        let content = self
            .complete(SYNTHESIZE_SYSTEM_PROMPT, prompt, deadline)
            .await?;

        // 合成回复不强制 JSON：解析失败时把原文当纯文本，sources 用工具名
        match extract_json(&content).and_then(|j| serde_json::from_str::<SynthesizeReply>(j).ok()) {
            Some(reply) => Ok(Synthesis {
                text: reply.text,
                html: reply.html,
                sources: reply.sources,
            }),
            None => Ok(Synthesis {
                text: content,
                html: None,
                sources: request.outputs.iter().map(|(t, _)| t.clone()).collect(),
            }),
        }
    }
}

/// 根据配置与环境变量选择 LLM 后端（OpenAI 兼容 / Mock）
pub fn create_lm_from_config(cfg: &crate::config::LlmSection) -> std::sync::Arc<dyn LanguageModel> {
    let has_key = std::env::var("OPENAI_API_KEY").is_ok() || std::env::var("DEEPSEEK_API_KEY").is_ok();
    if cfg.provider.to_lowercase() != "mock" && has_key {
        tracing::info!("Using OpenAI-compatible LLM ({})", cfg.model);
        std::sync::Arc::new(OpenAiLm::new(
            cfg.base_url.as_deref(),
            &cfg.model,
            std::env::var("OPENAI_API_KEY")
                .or_else(|_| std::env::var("DEEPSEEK_API_KEY"))
                .ok()
                .as_deref(),
        ))
    } else {
        tracing::warn!("No API key set or provider=mock, using Mock LLM");
        std::sync::Arc::new(crate::llm::MockLm)
    }
}
