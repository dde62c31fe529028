//! 内置工具
//!
//! echo 供测试与联调；introspect 列出注册表内容，注册表句柄在调用期经
//! StepContext 注入，工具定义保持纯值（避免注册期的自引用）。

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use super::catalog::ToolRegistry;
use super::tool::{StepContext, Tool, ToolDefinition, ToolError};

/// Echo 工具：回显 text 字段
pub struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    async fn execute(&self, input: Value, _ctx: &StepContext) -> Result<Value, ToolError> {
        let text = input
            .get("text")
            .or_else(|| input.get("query"))
            .and_then(|v| v.as_str())
            .map(String::from)
            .or_else(|| input.as_str().map(String::from))
            .unwrap_or_else(|| "(empty)".to_string());
        Ok(Value::String(text))
    }
}

/// 内省工具：列出注册表中的工具（名称、类别、描述）
pub struct IntrospectTool;

#[async_trait]
impl Tool for IntrospectTool {
    async fn execute(&self, _input: Value, ctx: &StepContext) -> Result<Value, ToolError> {
        let registry = ctx
            .registry
            .as_ref()
            .ok_or_else(|| ToolError::Failed("registry handle not provided".to_string()))?;
        let tools: Vec<Value> = registry
            .list()
            .into_iter()
            .map(|def| {
                serde_json::json!({
                    "name": def.name,
                    "category": def.category,
                    "description": def.description,
                })
            })
            .collect();
        Ok(Value::Array(tools))
    }
}

/// 内置工具句柄表（导入/目录加载时按小写名重绑）
pub fn builtin_handlers() -> HashMap<String, Arc<dyn Tool>> {
    let mut handlers: HashMap<String, Arc<dyn Tool>> = HashMap::new();
    handlers.insert("echo".to_string(), Arc::new(EchoTool));
    handlers.insert("introspect".to_string(), Arc::new(IntrospectTool));
    handlers
}

/// 注册内置工具
pub fn register_builtins(registry: &ToolRegistry) {
    let entries: Vec<(ToolDefinition, Arc<dyn Tool>)> = vec![
        (
            ToolDefinition::new("echo")
                .with_category("utility")
                .with_keywords(&["echo", "repeat"])
                .with_io(&["text/query"], &["text/plain"])
                .with_description("echo the given text back"),
            Arc::new(EchoTool),
        ),
        (
            ToolDefinition::new("introspect")
                .with_category("utility")
                .with_keywords(&["tools", "capabilities", "introspect"])
                .with_io(&["text/query"], &["application/json"])
                .with_description("list the tools currently available"),
            Arc::new(IntrospectTool),
        ),
    ];
    for (definition, handler) in entries {
        // 重复注册（名称冲突）只会发生在调用方自装同名工具时，忽略即可
        if let Err(e) = registry.register(definition, handler) {
            tracing::debug!("builtin registration skipped: {}", e);
        }
    }
}
