//! 候选能力查找与排序
//!
//! 查找顺序：能力索引匹配，排除被禁用的修订，排除已解析修订未实际提供的能力
//! （被导入替代的导出），交给 `filter_matches` 钩子缩小，最后排序：
//! 已解析的提供方优先，其次版本降序，最后安装 ID 升序。

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use semver::Version;

use super::hooks::{narrow, ResolverHook};
use crate::database::{CapabilityIndex, ModuleWiring, WiringDelta, WiringMap};
use crate::module::metadata::namespace;
use crate::module::{CapabilityRef, ModuleRevision, RequirementRef, RevisionId};

/// 快照连线状态之上的本轮解析结果
#[derive(Debug, Clone)]
pub(crate) struct Overlay {
    base: Arc<WiringMap>,
    changed: BTreeMap<RevisionId, Arc<ModuleWiring>>,
}

impl Overlay {
    pub(crate) fn new(base: Arc<WiringMap>) -> Self {
        Self {
            base,
            changed: BTreeMap::new(),
        }
    }

    pub(crate) fn wiring(&self, revision: RevisionId) -> Option<&Arc<ModuleWiring>> {
        self.changed
            .get(&revision)
            .or_else(|| self.base.get(&revision))
    }

    pub(crate) fn is_resolved(&self, revision: RevisionId) -> bool {
        self.wiring(revision).is_some()
    }

    pub(crate) fn put(&mut self, wiring: ModuleWiring) {
        self.changed
            .insert(wiring.revision().id(), Arc::new(wiring));
    }

    /// 已解析片段所附加的宿主
    pub(crate) fn hosts_of(&self, fragment: RevisionId) -> Vec<Arc<ModuleRevision>> {
        self.wiring(fragment)
            .map(|w| {
                w.required_wires_in(namespace::HOST)
                    .iter()
                    .map(|wire| wire.raw_provider().clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 已解析修订实际提供能力的连线状态所属修订（片段能力为宿主）
    pub(crate) fn resolved_provider(&self, cap: &CapabilityRef) -> Option<Arc<ModuleRevision>> {
        let revision = cap.revision();
        if !revision.is_fragment() || cap.capability().namespace() == namespace::IDENTITY {
            return self.wiring(revision.id()).map(|w| w.revision().clone());
        }
        self.hosts_of(revision.id()).into_iter().find(|host| {
            self.wiring(host.id())
                .map(|w| w.capabilities().contains(cap))
                .unwrap_or(false)
        })
    }

    pub(crate) fn into_delta(self) -> WiringDelta {
        WiringDelta {
            wirings: self.changed.into_values().collect(),
        }
    }
}

/// 候选能力查找器
///
/// 结果按需求缓存；缓存依赖当前的已解析集合，批次之间调用 [`Candidates::reset`]。
pub(crate) struct Candidates<'a> {
    index: &'a CapabilityIndex,
    hooks: &'a [Arc<dyn ResolverHook>],
    disabled: HashSet<RevisionId>,
    cache: HashMap<(RevisionId, usize), Vec<CapabilityRef>>,
}

impl<'a> Candidates<'a> {
    pub(crate) fn new(
        index: &'a CapabilityIndex,
        hooks: &'a [Arc<dyn ResolverHook>],
        disabled: HashSet<RevisionId>,
    ) -> Self {
        Self {
            index,
            hooks,
            disabled,
            cache: HashMap::new(),
        }
    }

    pub(crate) fn index(&self) -> &'a CapabilityIndex {
        self.index
    }

    pub(crate) fn is_disabled(&self, revision: RevisionId) -> bool {
        self.disabled.contains(&revision)
    }

    pub(crate) fn reset(&mut self) {
        self.cache.clear();
    }

    /// 需求的候选能力（已过滤、已排序）
    pub(crate) fn find(&mut self, overlay: &Overlay, requirement: &RequirementRef) -> Vec<CapabilityRef> {
        if let Some(cached) = self.cache.get(&requirement.key()) {
            return cached.clone();
        }
        let mut found = self.index.lookup(requirement.requirement());
        found.retain(|cap| !self.disabled.contains(&cap.revision().id()) && is_provided(overlay, cap));
        self.filter_and_sort(overlay, requirement, &mut found);
        self.cache.insert(requirement.key(), found.clone());
        found
    }

    /// 交给钩子缩小并排序
    pub(crate) fn filter_and_sort(
        &self,
        overlay: &Overlay,
        requirement: &RequirementRef,
        found: &mut Vec<CapabilityRef>,
    ) {
        for hook in self.hooks {
            narrow(found, |c| c.key(), |caps| hook.filter_matches(requirement, caps));
        }
        sort_candidates(overlay, found);
    }
}

/// 能力在已解析修订上是否仍然实际提供
pub(crate) fn is_provided(overlay: &Overlay, cap: &CapabilityRef) -> bool {
    let revision = cap.revision();
    if !overlay.is_resolved(revision.id()) {
        return true;
    }
    overlay.resolved_provider(cap).is_some_and(|provider| {
        overlay
            .wiring(provider.id())
            .map(|w| w.capabilities().contains(cap))
            .unwrap_or(false)
    })
}

fn capability_version(cap: &CapabilityRef) -> Version {
    cap.capability()
        .version()
        .cloned()
        .unwrap_or_else(|| cap.revision().version().clone())
}

/// 已解析优先、版本降序、安装 ID 升序
pub(crate) fn sort_candidates(overlay: &Overlay, caps: &mut [CapabilityRef]) {
    caps.sort_by_cached_key(|cap| {
        (
            !overlay.is_resolved(cap.revision().id()),
            Reverse(capability_version(cap)),
            cap.revision().module_id(),
            cap.key(),
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::RevisionBuilder;
    use std::collections::BTreeSet;

    fn exporter(module: u64, version: &str) -> Arc<ModuleRevision> {
        Arc::new(
            RevisionBuilder::new(format!("m{}", module), "1.0")
                .unwrap()
                .export_package("p", version)
                .unwrap()
                .build(module, module)
                .unwrap(),
        )
    }

    #[test]
    fn test_resolved_first_then_version_then_id() {
        let a = exporter(1, "1.0");
        let b = exporter(2, "2.0");
        let c = exporter(3, "2.0");
        let importer = Arc::new(
            RevisionBuilder::new("imp", "1.0")
                .unwrap()
                .import_package("p", None)
                .unwrap()
                .build(4, 4)
                .unwrap(),
        );
        let mut index = CapabilityIndex::new();
        for rev in [&a, &b, &c, &importer] {
            index.add_revision(rev);
        }

        let mut base = WiringMap::new();
        base.insert(
            a.id(),
            Arc::new(ModuleWiring::new(
                a.clone(),
                a.capabilities().iter().enumerate().map(|(i, _)| CapabilityRef::new(a.clone(), i)).collect(),
                Vec::new(),
                Vec::new(),
                Vec::new(),
                BTreeSet::new(),
            )),
        );
        let overlay = Overlay::new(Arc::new(base));
        let hooks: Vec<Arc<dyn ResolverHook>> = Vec::new();
        let mut candidates = Candidates::new(&index, &hooks, HashSet::new());
        let found = candidates.find(&overlay, &importer.requirement_refs()[0]);
        let order: Vec<u64> = found.iter().map(|c| c.revision().module_id()).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_substituted_export_excluded() {
        let a = exporter(1, "1.0");
        let importer = Arc::new(
            RevisionBuilder::new("imp", "1.0")
                .unwrap()
                .import_package("p", None)
                .unwrap()
                .build(2, 2)
                .unwrap(),
        );
        let mut index = CapabilityIndex::new();
        index.add_revision(&a);
        index.add_revision(&importer);

        let mut substituted = BTreeSet::new();
        substituted.insert("p".to_string());
        let mut base = WiringMap::new();
        base.insert(
            a.id(),
            Arc::new(ModuleWiring::new(
                a.clone(),
                a.capabilities_in(namespace::IDENTITY),
                Vec::new(),
                Vec::new(),
                Vec::new(),
                substituted,
            )),
        );
        let overlay = Overlay::new(Arc::new(base));
        let hooks: Vec<Arc<dyn ResolverHook>> = Vec::new();
        let mut candidates = Candidates::new(&index, &hooks, HashSet::new());
        assert!(candidates
            .find(&overlay, &importer.requirement_refs()[0])
            .is_empty());
    }

    #[test]
    fn test_disabled_revision_excluded() {
        let a = exporter(1, "1.0");
        let importer = Arc::new(
            RevisionBuilder::new("imp", "1.0")
                .unwrap()
                .import_package("p", None)
                .unwrap()
                .build(2, 2)
                .unwrap(),
        );
        let mut index = CapabilityIndex::new();
        index.add_revision(&a);
        let overlay = Overlay::new(Arc::new(WiringMap::new()));
        let hooks: Vec<Arc<dyn ResolverHook>> = Vec::new();
        let mut candidates = Candidates::new(&index, &hooks, HashSet::from([a.id()]));
        assert!(candidates
            .find(&overlay, &importer.requirement_refs()[0])
            .is_empty());
    }
}
