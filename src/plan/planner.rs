//! 规划器
//!
//! 候选挑选（registry.recommend 取 top-K）→ 从句分解 → 输入类型绑定
//! （缺失的输入类型可拉入候选中的生产者步骤）→ 依赖接线（按产出类型）→
//! 成环回退（移除引发环的依赖步骤）→ fallback 附加 → 成本估计。
//! 产出的 Plan 一经执行器接手即不可变。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::intent::split_clauses;
use crate::llm::Analysis;
use crate::registry::{ScoredTool, ToolRegistry};
use crate::session::Context;

use super::graph::PlanGraph;
use super::types::{Plan, PlanStep, RetryPolicy, StepId};

/// 原始查询对应的基础输入类型，所有工具都可直接消费
pub const QUERY_INPUT_TYPE: &str = "text/query";

#[derive(Error, Debug)]
pub enum PlanError {
    /// 没有任何候选工具覆盖任何子目标
    #[error("no tool covers any sub-goal of the query")]
    EmptyPlan,
}

/// 规划参数
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// 保留的候选数
    pub top_k: usize,
    pub step_timeout: Duration,
    pub plan_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            top_k: 8,
            step_timeout: Duration::from_secs(30),
            plan_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

/// 规划器：读注册表与会话上下文，产出执行计划
pub struct Planner {
    registry: Arc<ToolRegistry>,
    config: PlannerConfig,
}

impl Planner {
    pub fn new(registry: Arc<ToolRegistry>, config: PlannerConfig) -> Self {
        Self { registry, config }
    }

    pub fn plan(
        &self,
        query: &str,
        analysis: &Analysis,
        context: &Context,
    ) -> Result<Plan, PlanError> {
        // 候选：查询 + 实体原文 + scratch 键作为补充词
        let mut hints: Vec<String> = analysis.entities.iter().map(|e| e.text.clone()).collect();
        hints.extend(context.scratch.keys().cloned());
        let mut candidates = self.registry.recommend(query, &hints);
        candidates.truncate(self.config.top_k);
        if candidates.is_empty() {
            return Err(PlanError::EmptyPlan);
        }

        // 子目标：复合查询逐从句分解
        let clauses = if analysis.intent.compound {
            split_clauses(query)
        } else {
            vec![query.trim().to_string()]
        };

        // 基础可用输入：原始查询、实体类别、scratch 键
        let mut available: HashSet<String> = HashSet::new();
        available.insert(QUERY_INPUT_TYPE.to_string());
        for entity in &analysis.entities {
            available.insert(entity.kind.clone());
        }
        for key in context.scratch.keys() {
            available.insert(key.clone());
        }

        // 绑定
        let mut produced: HashMap<String, StepId> = HashMap::new();
        let mut steps: Vec<PlanStep> = Vec::new();
        let mut step_seq = 0usize;
        let push_step = |steps: &mut Vec<PlanStep>,
                             produced: &mut HashMap<String, StepId>,
                             step_seq: &mut usize,
                             chosen: &ScoredTool,
                             clause: &str,
                             input: serde_json::Value| {
            *step_seq += 1;
            let step_id = format!("step-{step_seq}");
            steps.push(PlanStep {
                id: step_id.clone(),
                tool_id: chosen.definition.id.clone(),
                tool_name: chosen.definition.name.clone(),
                goal: clause.to_string(),
                input,
                depends_on: Vec::new(),
                timeout: self.config.step_timeout,
                retry: self.config.retry.clone(),
                fallbacks: Vec::new(),
                critical: false,
            });
            for ty in &chosen.definition.output_types {
                produced.entry(ty.clone()).or_insert_with(|| step_id.clone());
            }
        };

        for clause in &clauses {
            let ranked = self.rank_for_clause(&candidates, clause, &hints);

            // 从句最高分候选优先；缺失输入类型时尝试从候选拉入生产者，
            // 拉不齐的候选跳过，换下一个
            'candidate: for &chosen in &ranked {
                let missing: Vec<&String> = chosen
                    .definition
                    .input_types
                    .iter()
                    .filter(|t| !available.contains(*t) && !produced.contains_key(*t))
                    .collect();

                let mut producers: Vec<&ScoredTool> = Vec::new();
                for ty in &missing {
                    let producer = ranked
                        .iter()
                        .find(|p| {
                            p.definition.id != chosen.definition.id
                                && p.definition.output_types.iter().any(|o| &o == ty)
                                && p.definition
                                    .input_types
                                    .iter()
                                    .all(|ti| available.contains(ti))
                        })
                        .copied();
                    match producer {
                        Some(p) => producers.push(p),
                        None => continue 'candidate,
                    }
                }

                for producer in producers {
                    push_step(
                        &mut steps,
                        &mut produced,
                        &mut step_seq,
                        producer,
                        clause,
                        self.bind_input(clause, analysis, context),
                    );
                }
                push_step(
                    &mut steps,
                    &mut produced,
                    &mut step_seq,
                    chosen,
                    clause,
                    self.bind_input(clause, analysis, context),
                );
                break;
            }
        }
        if steps.is_empty() {
            return Err(PlanError::EmptyPlan);
        }

        // 依赖接线：输入类型仅由其他已选步骤产出时，加该步骤为依赖
        let defs: HashMap<String, &ScoredTool> = candidates
            .iter()
            .map(|c| (c.definition.id.clone(), c))
            .collect();
        for step in &mut steps {
            let Some(scored) = defs.get(&step.tool_id) else { continue };
            for ty in &scored.definition.input_types {
                if available.contains(ty) {
                    continue;
                }
                if let Some(producer) = produced.get(ty) {
                    if producer != &step.id && !step.depends_on.contains(producer) {
                        step.depends_on.push(producer.clone());
                    }
                }
            }
        }

        // 成环回退：移除引发环的依赖步骤，直到图无环
        loop {
            let graph = PlanGraph::new(&steps);
            if graph.topological_order().is_some() {
                break;
            }
            let Some(pos) = steps.iter().rposition(|s| !s.depends_on.is_empty()) else {
                break;
            };
            let removed = steps.remove(pos);
            tracing::warn!(
                "dropping step {} ({}) to break dependency cycle",
                removed.id,
                removed.tool_name
            );
            for step in &mut steps {
                step.depends_on.retain(|d| d != &removed.id);
            }
        }
        if steps.is_empty() {
            return Err(PlanError::EmptyPlan);
        }

        // fallback：得分次序靠后、产出类型有交集的候选，至多两个
        for step in &mut steps {
            let Some(bound) = defs.get(&step.tool_id) else { continue };
            step.fallbacks = candidates
                .iter()
                .filter(|c| c.definition.id != step.tool_id)
                .filter(|c| {
                    c.definition
                        .output_types
                        .iter()
                        .any(|t| bound.definition.output_types.contains(t))
                })
                .map(|c| c.definition.id.clone())
                .take(2)
                .collect();
        }

        // 关键步骤：汇点（其输出进入合成器）
        let graph = PlanGraph::new(&steps);
        let sinks: HashSet<StepId> = graph.sinks().into_iter().collect();
        for step in &mut steps {
            step.critical = sinks.contains(&step.id);
        }

        // 成本估计：各拓扑层 EWMA 之和的最大值
        let ewma: HashMap<&str, f64> = steps
            .iter()
            .map(|s| {
                let ms = defs.get(&s.tool_id).map(|c| c.stats.ewma_ms).unwrap_or(0.0);
                (s.id.as_str(), ms)
            })
            .collect();
        let estimated_ms = graph
            .layers()
            .iter()
            .map(|layer| {
                layer
                    .iter()
                    .map(|id| ewma.get(id.as_str()).copied().unwrap_or(0.0))
                    .sum::<f64>()
            })
            .fold(0.0_f64, f64::max) as u64;

        Ok(Plan {
            id: uuid::Uuid::new_v4().to_string(),
            query: query.to_string(),
            steps,
            estimated_ms,
            deadline: self.config.plan_timeout,
            created_at_ms: chrono::Utc::now().timestamp_millis(),
        })
    }

    /// 候选按从句相关性重排：从句得分高者优先，零分保持全局序
    fn rank_for_clause<'a>(
        &self,
        candidates: &'a [ScoredTool],
        clause: &str,
        hints: &[String],
    ) -> Vec<&'a ScoredTool> {
        let clause_scores: HashMap<String, f64> = self
            .registry
            .recommend(clause, hints)
            .into_iter()
            .map(|s| (s.definition.id.clone(), s.score))
            .collect();

        let mut ranked: Vec<(usize, &ScoredTool)> = candidates.iter().enumerate().collect();
        ranked.sort_by(|(ia, a), (ib, b)| {
            let sa = clause_scores.get(&a.definition.id).copied().unwrap_or(0.0);
            let sb = clause_scores.get(&b.definition.id).copied().unwrap_or(0.0);
            sb.partial_cmp(&sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(ia.cmp(ib))
        });
        ranked.into_iter().map(|(_, c)| c).collect()
    }

    /// 步骤输入模板：子目标从句、实体、实体名引用到的 scratch 值
    fn bind_input(&self, clause: &str, analysis: &Analysis, context: &Context) -> serde_json::Value {
        let mut scratch = serde_json::Map::new();
        for (key, value) in &context.scratch {
            if analysis.entities.iter().any(|e| e.text.contains(key.as_str())) {
                scratch.insert(key.clone(), value.clone());
            }
        }
        serde_json::json!({
            "query": clause,
            "entities": analysis.entities,
            "scratch": scratch,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::Intent;
    use crate::registry::{EchoTool, ToolDefinition, ToolRegistry};

    fn analysis(compound: bool) -> Analysis {
        let mut intent = Intent::new("chat", 0.9);
        intent.compound = compound;
        Analysis {
            intent,
            entities: Vec::new(),
        }
    }

    fn context() -> Context {
        Context::new("s1", "u1", 10)
    }

    fn registry_with_chain() -> Arc<ToolRegistry> {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(
                ToolDefinition::new("Fetch")
                    .with_keywords(&["fetch"])
                    .with_io(&["text/query"], &["text/plain"])
                    .with_description("fetch the front page of a site"),
                Arc::new(EchoTool),
            )
            .unwrap();
        registry
            .register(
                ToolDefinition::new("Summarize")
                    .with_keywords(&["summarize", "summary"])
                    .with_io(&["text/plain"], &["text/summary"])
                    .with_description("summarize plain text into a short digest"),
                Arc::new(EchoTool),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_single_tool_plan() {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(
                ToolDefinition::new("Echo")
                    .with_keywords(&["echo"])
                    .with_io(&["text/query"], &["text/plain"]),
                Arc::new(EchoTool),
            )
            .unwrap();
        let planner = Planner::new(registry, PlannerConfig::default());

        let plan = planner
            .plan("please echo hello", &analysis(false), &context())
            .unwrap();
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.steps[0].tool_name, "Echo");
        assert!(plan.steps[0].critical);
        assert!(plan.steps[0].depends_on.is_empty());
    }

    #[test]
    fn test_chain_wired_from_single_clause() {
        // "summarize the front page"：Summarize 缺 text/plain，规划器拉入 Fetch 作为生产者
        let planner = Planner::new(registry_with_chain(), PlannerConfig::default());
        let plan = planner
            .plan("summarize the front page", &analysis(false), &context())
            .unwrap();

        assert_eq!(plan.len(), 2);
        let fetch = plan.steps.iter().find(|s| s.tool_name == "Fetch").unwrap();
        let summarize = plan.steps.iter().find(|s| s.tool_name == "Summarize").unwrap();
        assert!(fetch.depends_on.is_empty());
        assert_eq!(summarize.depends_on, vec![fetch.id.clone()]);
        // 只有汇点是关键步骤
        assert!(!fetch.critical);
        assert!(summarize.critical);
    }

    #[test]
    fn test_compound_clauses_bind_separately() {
        let planner = Planner::new(registry_with_chain(), PlannerConfig::default());
        let plan = planner
            .plan(
                "fetch the front page and then summarize the text",
                &analysis(true),
                &context(),
            )
            .unwrap();

        assert_eq!(plan.len(), 2);
        let summarize = plan.steps.iter().find(|s| s.tool_name == "Summarize").unwrap();
        let fetch = plan.steps.iter().find(|s| s.tool_name == "Fetch").unwrap();
        assert_eq!(summarize.depends_on, vec![fetch.id.clone()]);
    }

    #[test]
    fn test_empty_plan_when_nothing_matches() {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(
                ToolDefinition::new("Fetch").with_keywords(&["fetch"]),
                Arc::new(EchoTool),
            )
            .unwrap();
        let planner = Planner::new(registry, PlannerConfig::default());
        assert!(matches!(
            planner.plan("completely unrelated words", &analysis(false), &context()),
            Err(PlanError::EmptyPlan)
        ));
    }

    #[test]
    fn test_fallbacks_share_output_type() {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .register(
                ToolDefinition::new("Echo")
                    .with_keywords(&["echo"])
                    .with_io(&["text/query"], &["text/plain"]),
                Arc::new(EchoTool),
            )
            .unwrap();
        registry
            .register(
                ToolDefinition::new("EchoBackup")
                    .with_keywords(&["echo"])
                    .with_io(&["text/query"], &["text/plain"]),
                Arc::new(EchoTool),
            )
            .unwrap();
        let planner = Planner::new(registry, PlannerConfig::default());
        let plan = planner
            .plan("echo this", &analysis(false), &context())
            .unwrap();
        assert_eq!(plan.steps[0].fallbacks.len(), 1);
    }

    #[test]
    fn test_estimated_time_uses_recorded_ewma() {
        let registry = registry_with_chain();
        let fetch_id = registry.resolve_name("fetch").unwrap();
        let summarize_id = registry.resolve_name("summarize").unwrap();
        registry.record_usage(&fetch_id, true, 100);
        registry.record_usage(&summarize_id, true, 300);

        let planner = Planner::new(registry, PlannerConfig::default());
        let plan = planner
            .plan("summarize the front page", &analysis(false), &context())
            .unwrap();
        // 两层链：max(100, 300) = 300
        assert_eq!(plan.estimated_ms, 300);
    }
}
