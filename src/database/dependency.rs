//! 模块依赖图
//!
//! 由连线状态构建的模块级依赖图：`A -> B` 表示 A 的某个修订连线到 B 提供的能力。
//! 连线允许成环，因此排序在遇到环时按模块 ID 打破，而不是报错。
//!
//! # 示例
//!
//! ```rust
//! use chips_container::database::dependency::DependencyGraph;
//! use std::collections::BTreeSet;
//!
//! let mut graph = DependencyGraph::new();
//! graph.add_dependency(2, 1);
//! graph.add_dependency(3, 2);
//!
//! assert_eq!(graph.start_order(&[1, 2, 3]), vec![1, 2, 3]);
//! assert_eq!(graph.dependents_closure(&[1]), BTreeSet::from([1, 2, 3]));
//! ```

use std::collections::{BTreeMap, BTreeSet, VecDeque};

use crate::module::ModuleId;

/// 模块依赖关系图
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// 正向边：模块 -> 它依赖的模块
    edges: BTreeMap<ModuleId, BTreeSet<ModuleId>>,
    /// 反向边：模块 -> 依赖它的模块
    reverse_edges: BTreeMap<ModuleId, BTreeSet<ModuleId>>,
}

impl DependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加模块节点，已存在时忽略
    pub fn add_module(&mut self, module: ModuleId) {
        self.edges.entry(module).or_default();
        self.reverse_edges.entry(module).or_default();
    }

    /// 添加依赖关系：`module` 依赖 `dependency`
    ///
    /// 自环（模块连线到自身能力）不记录。
    pub fn add_dependency(&mut self, module: ModuleId, dependency: ModuleId) {
        self.add_module(module);
        self.add_module(dependency);
        if module == dependency {
            return;
        }
        self.edges.entry(module).or_default().insert(dependency);
        self.reverse_edges.entry(dependency).or_default().insert(module);
    }

    /// 移除模块及其全部边
    pub fn remove_module(&mut self, module: ModuleId) {
        if let Some(deps) = self.edges.remove(&module) {
            for dep in deps {
                if let Some(rev) = self.reverse_edges.get_mut(&dep) {
                    rev.remove(&module);
                }
            }
        }
        if let Some(dependents) = self.reverse_edges.remove(&module) {
            for dependent in dependents {
                if let Some(deps) = self.edges.get_mut(&dependent) {
                    deps.remove(&module);
                }
            }
        }
    }

    /// 直接依赖
    pub fn dependencies(&self, module: ModuleId) -> BTreeSet<ModuleId> {
        self.edges.get(&module).cloned().unwrap_or_default()
    }

    /// 直接依赖方
    pub fn dependents(&self, module: ModuleId) -> BTreeSet<ModuleId> {
        self.reverse_edges.get(&module).cloned().unwrap_or_default()
    }

    /// 给定模块及其全部传递依赖方
    pub fn dependents_closure(&self, roots: &[ModuleId]) -> BTreeSet<ModuleId> {
        let mut closure = BTreeSet::new();
        let mut queue: VecDeque<ModuleId> = roots.iter().copied().collect();
        while let Some(module) = queue.pop_front() {
            if !closure.insert(module) {
                continue;
            }
            if let Some(dependents) = self.reverse_edges.get(&module) {
                queue.extend(dependents.iter().copied());
            }
        }
        closure
    }

    /// 给定模块的全部传递依赖（不含自身，除非处于环中）
    pub fn all_dependencies(&self, module: ModuleId) -> BTreeSet<ModuleId> {
        let mut result = BTreeSet::new();
        let mut queue: VecDeque<ModuleId> = self.dependencies(module).into_iter().collect();
        while let Some(next) = queue.pop_front() {
            if result.insert(next) {
                queue.extend(self.dependencies(next));
            }
        }
        result
    }

    /// 查找一个环，返回闭合路径
    pub fn find_cycle(&self) -> Option<Vec<ModuleId>> {
        let mut visited = BTreeSet::new();
        let mut stack = BTreeSet::new();
        let mut path = Vec::new();
        for &node in self.edges.keys() {
            if let Some(cycle) = self.find_cycle_from(node, &mut visited, &mut stack, &mut path) {
                return Some(cycle);
            }
        }
        None
    }

    fn find_cycle_from(
        &self,
        node: ModuleId,
        visited: &mut BTreeSet<ModuleId>,
        stack: &mut BTreeSet<ModuleId>,
        path: &mut Vec<ModuleId>,
    ) -> Option<Vec<ModuleId>> {
        if stack.contains(&node) {
            let start = path.iter().position(|n| *n == node)?;
            let mut cycle = path[start..].to_vec();
            cycle.push(node);
            return Some(cycle);
        }
        if !visited.insert(node) {
            return None;
        }
        stack.insert(node);
        path.push(node);
        if let Some(neighbors) = self.edges.get(&node) {
            for &neighbor in neighbors {
                if let Some(cycle) = self.find_cycle_from(neighbor, visited, stack, path) {
                    return Some(cycle);
                }
            }
        }
        path.pop();
        stack.remove(&node);
        None
    }

    pub fn has_cycle(&self) -> bool {
        self.find_cycle().is_some()
    }

    /// 启动顺序：依赖在前（Kahn 算法）
    ///
    /// 只考虑 `modules` 内部的边；剩余节点成环时取 ID 最小者继续。
    pub fn start_order(&self, modules: &[ModuleId]) -> Vec<ModuleId> {
        let members: BTreeSet<ModuleId> = modules.iter().copied().collect();
        let mut in_degree: BTreeMap<ModuleId, usize> = members
            .iter()
            .map(|&m| {
                let degree = self
                    .edges
                    .get(&m)
                    .map(|deps| deps.iter().filter(|d| members.contains(d)).count())
                    .unwrap_or(0);
                (m, degree)
            })
            .collect();

        let mut result = Vec::with_capacity(members.len());
        let mut ready: BTreeSet<ModuleId> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&m, _)| m)
            .collect();

        while result.len() < members.len() {
            let next = match ready.iter().next().copied() {
                Some(m) => {
                    ready.remove(&m);
                    m
                }
                None => match in_degree.keys().next().copied() {
                    Some(m) => m,
                    None => break,
                },
            };
            in_degree.remove(&next);
            result.push(next);
            for dependent in self.dependents(next) {
                if let Some(degree) = in_degree.get_mut(&dependent) {
                    *degree = degree.saturating_sub(1);
                    if *degree == 0 {
                        ready.insert(dependent);
                    }
                }
            }
        }
        result
    }

    /// 停止顺序：依赖方在前
    pub fn stop_order(&self, modules: &[ModuleId]) -> Vec<ModuleId> {
        let mut order = self.start_order(modules);
        order.reverse();
        order
    }

    pub fn contains_module(&self, module: ModuleId) -> bool {
        self.edges.contains_key(&module)
    }

    pub fn module_count(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_dependency() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(1, 2);
        assert!(graph.dependencies(1).contains(&2));
        assert!(graph.dependents(2).contains(&1));
        assert_eq!(graph.module_count(), 2);
    }

    #[test]
    fn test_self_loop_ignored() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(1, 1);
        assert!(graph.dependencies(1).is_empty());
        assert!(!graph.has_cycle());
    }

    #[test]
    fn test_remove_module() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(1, 2);
        graph.add_dependency(3, 2);
        graph.remove_module(2);
        assert!(!graph.contains_module(2));
        assert!(graph.dependencies(1).is_empty());
        assert!(graph.dependencies(3).is_empty());
    }

    #[test]
    fn test_find_cycle() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(1, 2);
        graph.add_dependency(2, 3);
        assert!(graph.find_cycle().is_none());

        graph.add_dependency(3, 1);
        let cycle = graph.find_cycle().unwrap();
        assert_eq!(cycle.first(), cycle.last());
        assert_eq!(cycle.len(), 4);
    }

    #[test]
    fn test_dependents_closure() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(2, 1);
        graph.add_dependency(3, 2);
        graph.add_dependency(5, 4);
        let closure = graph.dependents_closure(&[1]);
        assert_eq!(closure.into_iter().collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(graph.all_dependencies(3).into_iter().collect::<Vec<_>>(), vec![1, 2]);
    }

    #[test]
    fn test_start_order_with_diamond() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(4, 2);
        graph.add_dependency(4, 3);
        graph.add_dependency(2, 1);
        graph.add_dependency(3, 1);
        let order = graph.start_order(&[4, 3, 2, 1]);
        assert_eq!(order, vec![1, 2, 3, 4]);
        assert_eq!(graph.stop_order(&[1, 2, 3, 4]), vec![4, 3, 2, 1]);
    }

    #[test]
    fn test_start_order_breaks_cycles() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(1, 2);
        graph.add_dependency(2, 1);
        graph.add_dependency(3, 1);
        let order = graph.start_order(&[1, 2, 3]);
        assert_eq!(order.len(), 3);
        assert_eq!(order.last(), Some(&3));
    }

    #[test]
    fn test_start_order_ignores_outside_edges() {
        let mut graph = DependencyGraph::new();
        graph.add_dependency(2, 9);
        graph.add_dependency(1, 2);
        assert_eq!(graph.start_order(&[1, 2]), vec![2, 1]);
    }
}
