//! 启动级别
//!
//! 提升活动级别时逐级启动持久化启动的模块，降低时逐级停止。
//! 同一级别内按依赖顺序（依赖在前，其次模块 ID 升序）处理；
//! 标记为并行激活的模块与其余模块并发启动，其余模块依次启动。

use futures::future::join_all;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::container::Container;
use crate::database::DependencyGraph;
use crate::module::{
    Module, ModuleId, OperationContext, StartOptions, StopOptions, SYSTEM_MODULE_ID,
};
use crate::utils::Result;

/// 活动启动级别
#[derive(Debug, Default)]
pub(crate) struct StartLevels {
    active: AtomicU32,
    /// 串行化级别变更
    changing: tokio::sync::Mutex<()>,
}

impl StartLevels {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn active(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    /// 逐级移动到 `target`，返回级别是否发生变化
    ///
    /// 不发布 `StartLevelChanged`，由调用方在释放自身持有的锁之后发布。
    pub(crate) async fn move_to(&self, container: &Container, target: u32) -> Result<bool> {
        let _changing = self.changing.lock().await;
        let ctx = OperationContext::new("start-level");
        let from = self.active();
        if from == target {
            return Ok(false);
        }
        info!(from, to = target, "活动启动级别变更");

        if target > from {
            for level in from + 1..=target {
                self.active.store(level, Ordering::Release);
                let modules = eligible_to_start(container, level);
                start_level_group(container, &ctx, &modules).await;
            }
        } else {
            for level in (target + 1..=from).rev() {
                let modules = eligible_to_stop(container, level);
                for module in modules {
                    if let Err(e) = module.stop(&ctx, StopOptions::transient(), container).await {
                        warn!(module_id = module.id(), error = %e, "降低启动级别时停止模块失败");
                        container.publish_error(&module, &e);
                    }
                }
                self.active.store(level - 1, Ordering::Release);
            }
        }

        debug!(level = target, "活动启动级别已到达");
        Ok(true)
    }
}

/// 持久化启动标记对应的启动选项
pub(crate) fn persistent_start_options(module: &Module) -> StartOptions {
    StartOptions {
        transient: true,
        eager: !module.settings().use_activation_policy,
        lazy_trigger: false,
    }
}

/// 本级别需要启动的模块，按启动顺序
fn eligible_to_start(container: &Container, level: u32) -> Vec<Arc<Module>> {
    let candidates: Vec<Arc<Module>> = container
        .database()
        .modules()
        .into_iter()
        .filter(|m| m.id() != SYSTEM_MODULE_ID)
        .filter(|m| m.start_level() == level && m.settings().auto_start)
        .filter(|m| !m.state().is_active_set())
        .collect();
    activation_order(&container.database().dependency_graph(), candidates)
}

/// 本级别需要停止的模块，按停止顺序
fn eligible_to_stop(container: &Container, level: u32) -> Vec<Arc<Module>> {
    let candidates: Vec<Arc<Module>> = container
        .database()
        .modules()
        .into_iter()
        .filter(|m| m.id() != SYSTEM_MODULE_ID)
        .filter(|m| m.start_level() == level && m.state().is_active_set())
        .collect();
    let mut order = activation_order(&container.database().dependency_graph(), candidates);
    order.reverse();
    order
}

/// 按 (启动级别, 依赖, 模块 ID) 排序
pub(crate) fn activation_order(graph: &DependencyGraph, modules: Vec<Arc<Module>>) -> Vec<Arc<Module>> {
    let ids: Vec<ModuleId> = modules.iter().map(|m| m.id()).collect();
    let rank: std::collections::HashMap<ModuleId, usize> = graph
        .start_order(&ids)
        .into_iter()
        .enumerate()
        .map(|(i, id)| (id, i))
        .collect();
    let mut modules = modules;
    modules.sort_by_key(|m| {
        (
            m.start_level(),
            rank.get(&m.id()).copied().unwrap_or(usize::MAX),
            m.id(),
        )
    });
    modules
}

async fn start_level_group(container: &Container, ctx: &OperationContext, modules: &[Arc<Module>]) {
    let (parallel, sequential): (Vec<&Arc<Module>>, Vec<&Arc<Module>>) = modules
        .iter()
        .partition(|m| m.settings().parallel_activation);

    let parallel_starts = join_all(parallel.into_iter().map(|module| async move {
        // 并行启动使用独立的上下文
        let ctx = OperationContext::new("start-level-parallel");
        let result = module
            .start(&ctx, persistent_start_options(module), container)
            .await;
        (module, result)
    }));
    let sequential_starts = async {
        let mut results = Vec::new();
        for module in sequential {
            let result = module
                .start(ctx, persistent_start_options(module), container)
                .await;
            results.push((module, result));
        }
        results
    };

    let (parallel_results, sequential_results) =
        futures::future::join(parallel_starts, sequential_starts).await;
    for (module, result) in parallel_results.into_iter().chain(sequential_results) {
        if let Err(e) = result {
            warn!(module_id = module.id(), error = %e, "提升启动级别时启动模块失败");
            container.publish_error(module, &e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::ModuleSettings;

    fn module(id: ModuleId, level: u32) -> Arc<Module> {
        Arc::new(Module::new(id, format!("mem:{id}"), level, ModuleSettings::default(), 0))
    }

    #[test]
    fn test_order_by_level_then_dependency_then_id() {
        let mut graph = DependencyGraph::new();
        // 3 依赖 4
        graph.add_dependency(3, 4);
        for id in [1, 2, 5] {
            graph.add_module(id);
        }
        let modules = vec![module(5, 1), module(3, 2), module(4, 2), module(2, 2), module(1, 3)];
        let order: Vec<ModuleId> = activation_order(&graph, modules)
            .iter()
            .map(|m| m.id())
            .collect();
        assert_eq!(order, vec![5, 2, 4, 3, 1]);
    }
}
