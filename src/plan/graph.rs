//! 计划依赖图
//!
//! 使用邻接表和入度表实现 DAG 拓扑排序、分层与级联传播。

use std::collections::{HashMap, HashSet, VecDeque};

use super::types::{PlanStep, StepId};

/// 计划依赖图
pub struct PlanGraph {
    /// 邻接表：步骤 id -> 依赖该步骤的步骤列表
    adjacency: HashMap<StepId, Vec<StepId>>,
    /// 入度表：步骤 id -> 未完成的依赖数
    in_degree: HashMap<StepId, usize>,
}

impl PlanGraph {
    pub fn new(steps: &[PlanStep]) -> Self {
        let mut adjacency: HashMap<StepId, Vec<StepId>> = HashMap::new();
        let mut in_degree: HashMap<StepId, usize> = HashMap::new();

        for step in steps {
            in_degree.insert(step.id.clone(), 0);
            adjacency.entry(step.id.clone()).or_default();
        }

        for step in steps {
            for dep in &step.depends_on {
                adjacency.entry(dep.clone()).or_default().push(step.id.clone());
                *in_degree.entry(step.id.clone()).or_insert(0) += 1;
            }
        }

        Self {
            adjacency,
            in_degree,
        }
    }

    /// 入度为 0 的初始可执行步骤（排序保证确定性）
    pub fn initial_ready(&self) -> Vec<StepId> {
        let mut ready: Vec<StepId> = self
            .in_degree
            .iter()
            .filter(|(_, degree)| **degree == 0)
            .map(|(id, _)| id.clone())
            .collect();
        ready.sort();
        ready
    }

    /// 步骤成功后调用：依赖它的步骤入度减一，返回新变为可执行的步骤
    pub fn mark_succeeded(&mut self, step_id: &str) -> Vec<StepId> {
        let mut newly_ready = Vec::new();
        if let Some(dependents) = self.adjacency.get(step_id).cloned() {
            for dependent in dependents {
                if let Some(degree) = self.in_degree.get_mut(&dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        newly_ready.push(dependent);
                    }
                }
            }
        }
        newly_ready.sort();
        newly_ready
    }

    /// 直接与间接依赖 step_id 的全部步骤（失败级联 Skip 用）
    pub fn transitive_dependents(&self, step_id: &str) -> Vec<StepId> {
        let mut seen: HashSet<StepId> = HashSet::new();
        let mut queue: VecDeque<StepId> = VecDeque::new();
        queue.push_back(step_id.to_string());
        while let Some(current) = queue.pop_front() {
            if let Some(dependents) = self.adjacency.get(&current) {
                for dep in dependents {
                    if seen.insert(dep.clone()) {
                        queue.push_back(dep.clone());
                    }
                }
            }
        }
        let mut result: Vec<StepId> = seen.into_iter().collect();
        result.sort();
        result
    }

    /// Kahn 拓扑序；存在环返回 None
    pub fn topological_order(&self) -> Option<Vec<StepId>> {
        let mut in_degree = self.in_degree.clone();
        let mut queue: VecDeque<StepId> = {
            let mut zero: Vec<StepId> = in_degree
                .iter()
                .filter(|(_, d)| **d == 0)
                .map(|(id, _)| id.clone())
                .collect();
            zero.sort();
            zero.into()
        };

        let mut order = Vec::with_capacity(in_degree.len());
        while let Some(id) = queue.pop_front() {
            order.push(id.clone());
            if let Some(dependents) = self.adjacency.get(&id) {
                let mut unlocked: Vec<StepId> = Vec::new();
                for dep in dependents {
                    if let Some(d) = in_degree.get_mut(dep) {
                        *d -= 1;
                        if *d == 0 {
                            unlocked.push(dep.clone());
                        }
                    }
                }
                unlocked.sort();
                queue.extend(unlocked);
            }
        }

        (order.len() == in_degree.len()).then_some(order)
    }

    /// 拓扑分层：每层为可同时调度的步骤集合（成本估计用）
    pub fn layers(&self) -> Vec<Vec<StepId>> {
        let mut in_degree = self.in_degree.clone();
        let mut current: Vec<StepId> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| id.clone())
            .collect();
        current.sort();

        let mut layers = Vec::new();
        while !current.is_empty() {
            let mut next: Vec<StepId> = Vec::new();
            for id in &current {
                if let Some(dependents) = self.adjacency.get(id) {
                    for dep in dependents {
                        if let Some(d) = in_degree.get_mut(dep) {
                            *d -= 1;
                            if *d == 0 {
                                next.push(dep.clone());
                            }
                        }
                    }
                }
            }
            next.sort();
            layers.push(std::mem::replace(&mut current, next));
        }
        layers
    }

    /// 没有任何步骤依赖的汇点（默认的关键步骤）
    pub fn sinks(&self) -> Vec<StepId> {
        let mut sinks: Vec<StepId> = self
            .adjacency
            .iter()
            .filter(|(_, dependents)| dependents.is_empty())
            .map(|(id, _)| id.clone())
            .collect();
        sinks.sort();
        sinks
    }
}
