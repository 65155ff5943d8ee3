//! 能力索引
//!
//! 按命名空间组织能力。命名空间内以同名属性（主键）的字符串值建立索引，
//! 主键缺失或不是字符串的能力放入未索引列表，查找时总是参与线性扫描。

use std::collections::HashMap;
use std::sync::Arc;

use crate::module::{CapabilityRef, ModuleRevision, Requirement, RevisionId};

#[derive(Debug, Clone, Default)]
struct NamespaceIndex {
    keyed: HashMap<String, Vec<CapabilityRef>>,
    unkeyed: Vec<CapabilityRef>,
    /// 按插入顺序保存的全部能力
    all: Vec<CapabilityRef>,
}

impl NamespaceIndex {
    fn insert(&mut self, cap: CapabilityRef) {
        match cap.capability().primary_key() {
            Some(key) => self
                .keyed
                .entry(key.to_string())
                .or_default()
                .push(cap.clone()),
            None => self.unkeyed.push(cap.clone()),
        }
        self.all.push(cap);
    }

    fn remove_revision(&mut self, revision: RevisionId) {
        self.keyed.retain(|_, caps| {
            caps.retain(|c| c.revision().id() != revision);
            !caps.is_empty()
        });
        self.unkeyed.retain(|c| c.revision().id() != revision);
        self.all.retain(|c| c.revision().id() != revision);
    }
}

/// 能力索引
///
/// 仅收录当前修订声明的有效能力。数据库按写时复制的方式持有索引，
/// 快照读取的是不可变副本。
#[derive(Debug, Clone, Default)]
pub struct CapabilityIndex {
    namespaces: HashMap<String, NamespaceIndex>,
    revisions: HashMap<RevisionId, Arc<ModuleRevision>>,
}

impl CapabilityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// 收录修订的全部有效能力
    pub fn add_revision(&mut self, revision: &Arc<ModuleRevision>) {
        if self.revisions.contains_key(&revision.id()) {
            return;
        }
        for (index, cap) in revision.capabilities().iter().enumerate() {
            if !cap.is_effective() {
                continue;
            }
            self.namespaces
                .entry(cap.namespace().to_string())
                .or_default()
                .insert(CapabilityRef::new(revision.clone(), index));
        }
        self.revisions.insert(revision.id(), revision.clone());
    }

    /// 移除修订的全部能力
    pub fn remove_revision(&mut self, revision: RevisionId) {
        if self.revisions.remove(&revision).is_none() {
            return;
        }
        for index in self.namespaces.values_mut() {
            index.remove_revision(revision);
        }
        self.namespaces.retain(|_, index| !index.all.is_empty());
    }

    pub fn contains(&self, revision: RevisionId) -> bool {
        self.revisions.contains_key(&revision)
    }

    /// 已收录的修订
    pub fn revisions(&self) -> impl Iterator<Item = &Arc<ModuleRevision>> {
        self.revisions.values()
    }

    /// 命名空间内的全部能力
    pub fn capabilities_in(&self, namespace: &str) -> Vec<CapabilityRef> {
        self.namespaces
            .get(namespace)
            .map(|index| index.all.clone())
            .unwrap_or_default()
    }

    /// 查找满足需求的能力
    ///
    /// 需求过滤器能提取主键时只检查该键下的能力和未索引能力，否则扫描整个命名空间；
    /// 候选能力随后按过滤器与 `mandatory` 指令逐一匹配。结果保持插入顺序。
    pub fn lookup(&self, requirement: &Requirement) -> Vec<CapabilityRef> {
        let Some(index) = self.namespaces.get(requirement.namespace()) else {
            return Vec::new();
        };
        match requirement.primary_key() {
            Some(key) => {
                let mut found: Vec<CapabilityRef> = index
                    .keyed
                    .get(key)
                    .into_iter()
                    .flatten()
                    .chain(index.unkeyed.iter())
                    .filter(|cap| requirement.matches(cap.capability()))
                    .cloned()
                    .collect();
                found.sort_by_key(|c| (c.revision().id(), c.index()));
                found
            }
            None => index
                .all
                .iter()
                .filter(|cap| requirement.matches(cap.capability()))
                .cloned()
                .collect(),
        }
    }

    /// 主键等于 `key` 的能力，按 (修订 ID, 下标) 排序
    ///
    /// 动态导入的过滤器含通配符，无法提取主键，按包名直接取该键下的能力。
    pub fn capabilities_with_key(&self, namespace: &str, key: &str) -> Vec<CapabilityRef> {
        let Some(index) = self.namespaces.get(namespace) else {
            return Vec::new();
        };
        let mut found: Vec<CapabilityRef> = index.keyed.get(key).cloned().unwrap_or_default();
        found.sort_by_key(|c| (c.revision().id(), c.index()));
        found
    }

    /// 已收录的能力总数
    pub fn len(&self) -> usize {
        self.namespaces.values().map(|index| index.all.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.revisions.is_empty()
    }
}
