//! 工具注册表
//!
//! 主表 + 四套二级索引（名称不区分大小写、类别、能力、关键词）在一次写锁内同步维护，
//! 读路径（find / recommend / 导出）只拿读锁，互不阻塞。

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::tool::{Tool, ToolDefinition, ToolId, ToolStats};

/// 注册表错误
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("invalid tool definition: {0}")]
    Validation(String),
    #[error("tool name collision (case-insensitive): {0}")]
    NameCollision(String),
}

/// find 的筛选条件；缺省字段不参与过滤
#[derive(Debug, Clone, Default)]
pub struct FindCriteria {
    pub category: Option<String>,
    pub capability: Option<String>,
    pub keywords: Vec<String>,
    pub input_type: Option<String>,
    pub output_type: Option<String>,
}

/// recommend 的打分结果
#[derive(Debug, Clone)]
pub struct ScoredTool {
    pub definition: ToolDefinition,
    pub stats: ToolStats,
    pub score: f64,
}

/// 可序列化的注册表快照；execute 句柄不导出，导入时按名重绑
#[derive(Debug, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    pub exported_at_ms: i64,
    pub tools: Vec<ToolSnapshot>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolSnapshot {
    pub definition: ToolDefinition,
    pub stats: ToolStats,
}

struct RegisteredTool {
    definition: ToolDefinition,
    handler: Arc<dyn Tool>,
}

#[derive(Default)]
struct Inner {
    tools: HashMap<ToolId, RegisteredTool>,
    /// 小写名 -> id
    by_name: HashMap<String, ToolId>,
    by_category: HashMap<String, BTreeSet<ToolId>>,
    by_capability: HashMap<String, BTreeSet<ToolId>>,
    by_keyword: HashMap<String, BTreeSet<ToolId>>,
    stats: HashMap<ToolId, ToolStats>,
}

/// 工具注册表：单写多读
#[derive(Default)]
pub struct ToolRegistry {
    inner: RwLock<Inner>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册工具；name 必填且不得与现有名冲突（不区分大小写），id 为空时分配
    pub fn register(
        &self,
        mut definition: ToolDefinition,
        handler: Arc<dyn Tool>,
    ) -> Result<ToolId, RegistryError> {
        if definition.name.trim().is_empty() {
            return Err(RegistryError::Validation("missing tool name".to_string()));
        }

        let folded = definition.name.to_lowercase();
        let mut inner = self.inner.write();
        if inner.by_name.contains_key(&folded) {
            return Err(RegistryError::NameCollision(definition.name.clone()));
        }

        if definition.id.is_empty() {
            definition.id = uuid::Uuid::new_v4().to_string();
        }
        let id = definition.id.clone();

        inner.by_name.insert(folded, id.clone());
        if !definition.category.is_empty() {
            inner
                .by_category
                .entry(definition.category.to_lowercase())
                .or_default()
                .insert(id.clone());
        }
        for cap in &definition.capabilities {
            inner
                .by_capability
                .entry(cap.to_lowercase())
                .or_default()
                .insert(id.clone());
        }
        for kw in &definition.keywords {
            inner
                .by_keyword
                .entry(kw.to_lowercase())
                .or_default()
                .insert(id.clone());
        }
        inner.stats.entry(id.clone()).or_default();
        inner.tools.insert(
            id.clone(),
            RegisteredTool {
                definition,
                handler,
            },
        );

        Ok(id)
    }

    /// 带初始遥测注册（导入路径）
    fn register_with_stats(
        &self,
        definition: ToolDefinition,
        handler: Arc<dyn Tool>,
        stats: ToolStats,
    ) -> Result<ToolId, RegistryError> {
        let id = self.register(definition, handler)?;
        self.inner.write().stats.insert(id.clone(), stats);
        Ok(id)
    }

    /// 按 id 或名称注销；未知返回 false
    pub fn unregister(&self, key: &str) -> bool {
        let mut inner = self.inner.write();
        let id = if inner.tools.contains_key(key) {
            key.to_string()
        } else {
            match inner.by_name.get(&key.to_lowercase()) {
                Some(id) => id.clone(),
                None => return false,
            }
        };

        let Some(removed) = inner.tools.remove(&id) else {
            return false;
        };
        inner.by_name.remove(&removed.definition.name.to_lowercase());
        if let Some(set) = inner
            .by_category
            .get_mut(&removed.definition.category.to_lowercase())
        {
            set.remove(&id);
        }
        for cap in &removed.definition.capabilities {
            if let Some(set) = inner.by_capability.get_mut(&cap.to_lowercase()) {
                set.remove(&id);
            }
        }
        for kw in &removed.definition.keywords {
            if let Some(set) = inner.by_keyword.get_mut(&kw.to_lowercase()) {
                set.remove(&id);
            }
        }
        inner.stats.remove(&id);
        true
    }

    /// 按 id 取定义与句柄
    pub fn get(&self, id: &str) -> Option<(ToolDefinition, Arc<dyn Tool>)> {
        let inner = self.inner.read();
        inner
            .tools
            .get(id)
            .map(|t| (t.definition.clone(), Arc::clone(&t.handler)))
    }

    /// 按名称（不区分大小写）解析 id
    pub fn resolve_name(&self, name: &str) -> Option<ToolId> {
        self.inner.read().by_name.get(&name.to_lowercase()).cloned()
    }

    pub fn stats(&self, id: &str) -> Option<ToolStats> {
        self.inner.read().stats.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().tools.is_empty()
    }

    /// 全部定义（名称排序，供内省工具与导出使用）
    pub fn list(&self) -> Vec<ToolDefinition> {
        let inner = self.inner.read();
        let mut defs: Vec<_> = inner.tools.values().map(|t| t.definition.clone()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// 条件求交集；缺省条件不过滤
    pub fn find(&self, criteria: &FindCriteria) -> Vec<ToolDefinition> {
        let inner = self.inner.read();

        let mut candidates: Option<BTreeSet<ToolId>> = None;
        let mut intersect = |set: Option<&BTreeSet<ToolId>>| {
            let set = set.cloned().unwrap_or_default();
            candidates = Some(match candidates.take() {
                None => set,
                Some(prev) => prev.intersection(&set).cloned().collect(),
            });
        };

        if let Some(ref category) = criteria.category {
            intersect(inner.by_category.get(&category.to_lowercase()));
        }
        if let Some(ref capability) = criteria.capability {
            intersect(inner.by_capability.get(&capability.to_lowercase()));
        }
        for kw in &criteria.keywords {
            intersect(inner.by_keyword.get(&kw.to_lowercase()));
        }

        let ids: Vec<ToolId> = match candidates {
            Some(set) => set.into_iter().collect(),
            None => inner.tools.keys().cloned().collect(),
        };

        let mut result: Vec<ToolDefinition> = ids
            .into_iter()
            .filter_map(|id| inner.tools.get(&id).map(|t| t.definition.clone()))
            .filter(|def| {
                criteria
                    .input_type
                    .as_ref()
                    .map(|ty| def.input_types.iter().any(|t| t == ty))
                    .unwrap_or(true)
                    && criteria
                        .output_type
                        .as_ref()
                        .map(|ty| def.output_types.iter().any(|t| t == ty))
                        .unwrap_or(true)
            })
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name));
        result
    }

    /// 按查询打分推荐；hints 为上下文补充词（实体名、scratch 键）
    ///
    /// 关键词子串 +10，名称子串 +5，描述任一连续三词出现 +3，
    /// 总分乘以 0.5 + 0.5·成功率；零分剔除，并列先比成功率再比名称。
    pub fn recommend(&self, query: &str, hints: &[String]) -> Vec<ScoredTool> {
        let mut folded = query.to_lowercase();
        for hint in hints {
            folded.push(' ');
            folded.push_str(&hint.to_lowercase());
        }

        let inner = self.inner.read();
        let mut scored: Vec<ScoredTool> = inner
            .tools
            .values()
            .filter_map(|t| {
                let def = &t.definition;
                let mut base = 0.0_f64;
                for kw in &def.keywords {
                    if !kw.is_empty() && folded.contains(&kw.to_lowercase()) {
                        base += 10.0;
                    }
                }
                if folded.contains(&def.name.to_lowercase()) {
                    base += 5.0;
                }
                if description_trigram_hit(&def.description, &folded) {
                    base += 3.0;
                }
                if base == 0.0 {
                    return None;
                }
                let stats = inner.stats.get(&def.id).cloned().unwrap_or_default();
                let factor = 0.5
                    + 0.5 * (stats.successes as f64
                        / (stats.successes + stats.failures).max(1) as f64);
                Some(ScoredTool {
                    definition: def.clone(),
                    score: base * factor,
                    stats,
                })
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    b.stats
                        .success_rate()
                        .partial_cmp(&a.stats.success_rate())
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.definition.name.cmp(&b.definition.name))
        });
        scored
    }

    /// 写回一次执行遥测；成功失败的耗时同样计入滚动平均
    pub fn record_usage(&self, id: &str, success: bool, duration_ms: u64) {
        let mut inner = self.inner.write();
        if let Some(stats) = inner.stats.get_mut(id) {
            stats.record(success, duration_ms);
        }
    }

    /// 导出可序列化快照；execute 句柄不包含在内
    pub fn export(&self) -> RegistrySnapshot {
        let inner = self.inner.read();
        let mut tools: Vec<ToolSnapshot> = inner
            .tools
            .values()
            .map(|t| ToolSnapshot {
                definition: t.definition.clone(),
                stats: inner.stats.get(&t.definition.id).cloned().unwrap_or_default(),
            })
            .collect();
        tools.sort_by(|a, b| a.definition.name.cmp(&b.definition.name));
        RegistrySnapshot {
            exported_at_ms: chrono::Utc::now().timestamp_millis(),
            tools,
        }
    }

    /// 导入快照；句柄按小写名在 handlers 表中重绑，缺句柄报错
    pub fn import(
        &self,
        snapshot: RegistrySnapshot,
        handlers: &HashMap<String, Arc<dyn Tool>>,
    ) -> Result<usize, RegistryError> {
        let mut imported = 0;
        for entry in snapshot.tools {
            let folded = entry.definition.name.to_lowercase();
            let handler = handlers.get(&folded).ok_or_else(|| {
                RegistryError::Validation(format!("no handler for tool '{}'", entry.definition.name))
            })?;
            self.register_with_stats(entry.definition, Arc::clone(handler), entry.stats)?;
            imported += 1;
        }
        Ok(imported)
    }

    /// 扫描目录注册 *.json 工具清单；解析失败或缺句柄的条目记日志后跳过，返回注册数
    pub fn load_from_directory(
        &self,
        path: impl AsRef<Path>,
        handlers: &HashMap<String, Arc<dyn Tool>>,
    ) -> usize {
        let mut registered = 0;
        for entry in walkdir::WalkDir::new(path.as_ref())
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| e.path().extension().map(|x| x == "json").unwrap_or(false))
        {
            let raw = match std::fs::read_to_string(entry.path()) {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!("skipping unreadable manifest {:?}: {}", entry.path(), e);
                    continue;
                }
            };
            let definition: ToolDefinition = match serde_json::from_str(&raw) {
                Ok(def) => def,
                Err(e) => {
                    tracing::warn!("skipping unparseable manifest {:?}: {}", entry.path(), e);
                    continue;
                }
            };
            let Some(handler) = handlers.get(&definition.name.to_lowercase()) else {
                tracing::warn!(
                    "skipping manifest {:?}: no handler named '{}'",
                    entry.path(),
                    definition.name
                );
                continue;
            };
            match self.register(definition, Arc::clone(handler)) {
                Ok(id) => {
                    tracing::debug!("registered tool {} from {:?}", id, entry.path());
                    registered += 1;
                }
                Err(e) => {
                    tracing::warn!("skipping manifest {:?}: {}", entry.path(), e);
                }
            }
        }
        registered
    }
}

/// 描述任一连续三词（小写、空格连接）是否出现在折叠查询中
fn description_trigram_hit(description: &str, folded_query: &str) -> bool {
    let words: Vec<String> = description
        .to_lowercase()
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_string())
        .filter(|w| !w.is_empty())
        .collect();
    words
        .windows(3)
        .any(|w| folded_query.contains(&w.join(" ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::builtin::EchoTool;
    use crate::registry::tool::StepContext;
    use async_trait::async_trait;
    use serde_json::Value;
    use std::time::Duration;

    struct NoopTool;

    #[async_trait]
    impl Tool for NoopTool {
        async fn execute(&self, input: Value, _ctx: &StepContext) -> Result<Value, super::super::ToolError> {
            Ok(input)
        }
    }

    fn sample(name: &str) -> ToolDefinition {
        ToolDefinition::new(name)
            .with_category("test")
            .with_keywords(&[name])
            .with_io(&["text/query"], &["text/plain"])
    }

    #[test]
    fn test_register_and_resolve_case_insensitive() {
        let registry = ToolRegistry::new();
        let id = registry.register(sample("Echo"), Arc::new(NoopTool)).unwrap();
        assert_eq!(registry.resolve_name("echo"), Some(id.clone()));
        assert_eq!(registry.resolve_name("ECHO"), Some(id));
    }

    #[test]
    fn test_register_rejects_collision_and_missing_name() {
        let registry = ToolRegistry::new();
        registry.register(sample("fetch"), Arc::new(NoopTool)).unwrap();
        assert!(matches!(
            registry.register(sample("FETCH"), Arc::new(NoopTool)),
            Err(RegistryError::NameCollision(_))
        ));
        assert!(matches!(
            registry.register(ToolDefinition::new("  "), Arc::new(NoopTool)),
            Err(RegistryError::Validation(_))
        ));
    }

    #[test]
    fn test_unregister_cleans_indices() {
        let registry = ToolRegistry::new();
        registry.register(sample("fetch"), Arc::new(NoopTool)).unwrap();
        assert!(registry.unregister("fetch"));
        assert!(!registry.unregister("fetch"));
        assert_eq!(registry.len(), 0);
        assert!(registry
            .find(&FindCriteria {
                keywords: vec!["fetch".to_string()],
                ..Default::default()
            })
            .is_empty());
    }

    #[test]
    fn test_find_empty_criteria_returns_all() {
        let registry = ToolRegistry::new();
        registry.register(sample("a"), Arc::new(NoopTool)).unwrap();
        registry.register(sample("b"), Arc::new(NoopTool)).unwrap();
        registry.register(sample("c"), Arc::new(NoopTool)).unwrap();
        assert_eq!(registry.find(&FindCriteria::default()).len(), registry.len());
    }

    #[test]
    fn test_find_intersection() {
        let registry = ToolRegistry::new();
        registry
            .register(
                ToolDefinition::new("summarize")
                    .with_category("nlp")
                    .with_capabilities(&["summarization"])
                    .with_io(&["text/plain"], &["text/summary"]),
                Arc::new(NoopTool),
            )
            .unwrap();
        registry
            .register(
                ToolDefinition::new("translate")
                    .with_category("nlp")
                    .with_capabilities(&["translation"])
                    .with_io(&["text/plain"], &["text/plain"]),
                Arc::new(NoopTool),
            )
            .unwrap();

        let hits = registry.find(&FindCriteria {
            category: Some("nlp".to_string()),
            output_type: Some("text/summary".to_string()),
            ..Default::default()
        });
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "summarize");
    }

    #[test]
    fn test_recommend_scoring_and_order() {
        let registry = ToolRegistry::new();
        registry
            .register(
                ToolDefinition::new("Echo")
                    .with_keywords(&["echo"])
                    .with_description("echo the given text back"),
                Arc::new(EchoTool),
            )
            .unwrap();
        registry
            .register(
                ToolDefinition::new("Fetch")
                    .with_keywords(&["fetch", "download"])
                    .with_description("fetch a web page"),
                Arc::new(NoopTool),
            )
            .unwrap();

        let scored = registry.recommend("please echo hello", &[]);
        assert_eq!(scored.len(), 1);
        assert_eq!(scored[0].definition.name, "Echo");
        // 新工具成功率 0：关键词 10 + 名称 5，乘 0.5
        assert!((scored[0].score - 7.5).abs() < 1e-9);
    }

    #[test]
    fn test_recommend_success_factor() {
        let registry = ToolRegistry::new();
        let id = registry
            .register(
                ToolDefinition::new("Echo").with_keywords(&["echo"]),
                Arc::new(EchoTool),
            )
            .unwrap();
        registry.record_usage(&id, true, 10);
        registry.record_usage(&id, true, 20);

        let scored = registry.recommend("echo it", &[]);
        // 成功率 1.0：因子 1.0
        assert!((scored[0].score - 15.0).abs() < 1e-9);
    }

    #[test]
    fn test_export_import_round_trip() {
        let registry = ToolRegistry::new();
        let id = registry
            .register(
                ToolDefinition::new("Echo").with_keywords(&["echo"]),
                Arc::new(EchoTool),
            )
            .unwrap();
        registry.record_usage(&id, true, 42);
        registry.record_usage(&id, false, 10);
        let snapshot = registry.export();

        let mut handlers: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        handlers.insert("echo".to_string(), Arc::new(EchoTool));

        let restored = ToolRegistry::new();
        let imported = restored.import(snapshot, &handlers).unwrap();
        assert_eq!(imported, 1);
        assert_eq!(restored.resolve_name("echo"), Some(id.clone()));
        assert_eq!(restored.stats(&id), registry.stats(&id));
        assert_eq!(restored.find(&FindCriteria::default()).len(), 1);
    }

    #[test]
    fn test_import_missing_handler_errors() {
        let registry = ToolRegistry::new();
        registry
            .register(ToolDefinition::new("Echo"), Arc::new(EchoTool))
            .unwrap();
        let snapshot = registry.export();

        let restored = ToolRegistry::new();
        let handlers = HashMap::new();
        assert!(restored.import(snapshot, &handlers).is_err());
    }

    #[test]
    fn test_load_from_directory_skips_bad_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("echo.json"),
            r#"{"name": "echo", "keywords": ["echo"]}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "not json").unwrap();
        std::fs::write(
            dir.path().join("orphan.json"),
            r#"{"name": "no-handler"}"#,
        )
        .unwrap();

        let mut handlers: HashMap<String, Arc<dyn Tool>> = HashMap::new();
        handlers.insert("echo".to_string(), Arc::new(EchoTool));

        let registry = ToolRegistry::new();
        assert_eq!(registry.load_from_directory(dir.path(), &handlers), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_registered_handler_executes() {
        let registry = ToolRegistry::new();
        let id = registry
            .register(ToolDefinition::new("Echo"), Arc::new(EchoTool))
            .unwrap();
        let (_, handler) = registry.get(&id).unwrap();
        let ctx = StepContext::bare("p", "s", Duration::from_secs(1));
        let out = handler
            .execute(serde_json::json!({"text": "hi"}), &ctx)
            .await
            .unwrap();
        assert_eq!(out, serde_json::json!("hi"));
    }
}
