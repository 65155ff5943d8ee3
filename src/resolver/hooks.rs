//! 解析钩子与冲突钩子
//!
//! 钩子只能缩小候选集合，不能添加。容器在调用钩子后把结果与原集合求交，
//! 钩子加入的任何元素都会被丢弃。

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;

use crate::module::{CapabilityRef, Module, ModuleRevision, RequirementRef};

/// 解析钩子
///
/// 每轮解析开始时调用 [`ResolverHook::begin`]，结束时调用 [`ResolverHook::end`]。
/// `begin` 返回错误表示拒绝本轮解析，容器将其转换为 `RejectedByHook`。
pub trait ResolverHook: Send + Sync {
    fn begin(&self, _triggers: &[Arc<ModuleRevision>]) -> anyhow::Result<()> {
        Ok(())
    }

    /// 缩小本轮可解析的修订
    fn filter_resolvable(&self, _candidates: &mut Vec<Arc<ModuleRevision>>) {}

    /// 缩小与 `singleton` 冲突的单例身份能力
    fn filter_singleton_collisions(
        &self,
        _singleton: &CapabilityRef,
        _collisions: &mut Vec<CapabilityRef>,
    ) {
    }

    /// 缩小需求的匹配能力
    fn filter_matches(&self, _requirement: &RequirementRef, _candidates: &mut Vec<CapabilityRef>) {}

    fn end(&self) {}
}

/// 冲突检查发生的操作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionOperation {
    Installing,
    Updating,
}

/// 安装 / 更新冲突钩子
pub trait CollisionHook: Send + Sync {
    /// 缩小与 `target`（将要安装或更新的模块）冲突的已安装模块
    ///
    /// 安装时 `target` 为发起安装的源模块。
    fn filter_collisions(
        &self,
        _operation: CollisionOperation,
        _target: Option<&Module>,
        _collisions: &mut Vec<Arc<Module>>,
    ) {
    }

    /// 已存在于同一位置的模块对发起安装的源模块是否可见
    fn is_visible(&self, _origin: Option<&Module>, _existing: &Module) -> bool {
        true
    }
}

/// 让钩子过滤 `items`，并丢弃钩子新增的元素
pub(crate) fn narrow<T, K, F>(items: &mut Vec<T>, key: impl Fn(&T) -> K, filter: F)
where
    T: Clone,
    K: Eq + Hash,
    F: FnOnce(&mut Vec<T>),
{
    let allowed: HashSet<K> = items.iter().map(&key).collect();
    let mut filtered = items.clone();
    filter(&mut filtered);
    let mut seen = HashSet::new();
    filtered.retain(|item| {
        let k = key(item);
        allowed.contains(&k) && seen.insert(k)
    });
    *items = filtered;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_narrow_discards_additions() {
        let mut items = vec![1, 2, 3];
        narrow(&mut items, |i| *i, |v| {
            v.retain(|i| *i != 2);
            v.push(9);
            v.push(3);
        });
        assert_eq!(items, vec![1, 3]);
    }
}
