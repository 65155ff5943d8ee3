//! 模块数据库
//!
//! 数据库是已安装模块、当前连线状态与变更时间戳的唯一权威存储：
//!
//! - `location -> Module`、`id -> Module` 两张表
//! - `RevisionId -> ModuleWiring` 连线表（写时复制，快照共享）
//! - 当前修订的能力索引（写时复制）
//! - 修订时间戳：任何能力或连线变化时递增
//! - 全量时间戳：修订时间戳变化，以及设置、启动级别变化时递增
//!
//! 全部修改在同一把写锁内完成，多字段读取在同一把读锁内完成，
//! 因此读者只会观察到一致的 (表, 时间戳) 组合。
//!
//! 解析遵循乐观并发：[`Database::snapshot`] 读取快照，解析器在无锁状态下计算
//! [`WiringDelta`]，[`Database::apply_resolution`] 在写锁内核对时间戳，
//! 时间戳已变化时返回 [`ApplyOutcome::Stale`]，由调用方重试。

pub mod capability_index;
pub mod dependency;
mod lock;
pub mod persistence;
pub mod wiring;

pub use capability_index::CapabilityIndex;
pub use dependency::DependencyGraph;
pub use wiring::{ModuleWiring, Wire};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, info, trace};

use crate::module::{
    Module, ModuleId, ModuleRevision, ModuleSettings, ModuleState, RevisionBuilder, RevisionId,
    SYSTEM_MODULE_ID, SYSTEM_MODULE_LOCATION,
};
use crate::utils::{ContainerError, Result};
use lock::DbLock;

/// 连线表
pub type WiringMap = HashMap<RevisionId, Arc<ModuleWiring>>;

#[derive(Debug)]
pub(crate) struct DbState {
    pub(crate) modules_by_location: HashMap<String, Arc<Module>>,
    pub(crate) modules_by_id: BTreeMap<ModuleId, Arc<Module>>,
    pub(crate) wirings: Arc<WiringMap>,
    pub(crate) index: Arc<CapabilityIndex>,
    pub(crate) revisions_timestamp: u64,
    pub(crate) all_timestamp: u64,
    pub(crate) next_module_id: u64,
    pub(crate) next_revision_id: u64,
    pub(crate) initial_module_start_level: u32,
}

impl DbState {
    fn new(initial_module_start_level: u32) -> Self {
        Self {
            modules_by_location: HashMap::new(),
            modules_by_id: BTreeMap::new(),
            wirings: Arc::new(WiringMap::new()),
            index: Arc::new(CapabilityIndex::new()),
            revisions_timestamp: 0,
            all_timestamp: 0,
            next_module_id: SYSTEM_MODULE_ID + 1,
            next_revision_id: 1,
            initial_module_start_level,
        }
    }

    fn bump_revisions(&mut self) {
        self.revisions_timestamp += 1;
        self.all_timestamp += 1;
    }

    fn bump_all(&mut self) {
        self.all_timestamp += 1;
    }

    fn allocate_revision_id(&mut self) -> RevisionId {
        let id = self.next_revision_id;
        self.next_revision_id += 1;
        id
    }

    fn current_revision_ids(&self) -> BTreeSet<RevisionId> {
        self.modules_by_id
            .values()
            .filter_map(|m| m.current_revision())
            .map(|r| r.id())
            .collect()
    }

    fn is_removal_pending(&self, revision: &ModuleRevision, current: &BTreeSet<RevisionId>) -> bool {
        self.wirings.contains_key(&revision.id()) && !current.contains(&revision.id())
    }

    /// 从全部连线状态构建模块依赖图
    fn graph(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::new();
        for module in self.modules_by_id.keys() {
            graph.add_module(*module);
        }
        for wiring in self.wirings.values() {
            let requirer = wiring.module_id();
            graph.add_module(requirer);
            for wire in wiring.required_wires() {
                graph.add_dependency(requirer, wire.raw_provider().module_id());
                // 片段需求的声明者依赖宿主所依赖的模块
                let declaring = wire.raw_requirement().revision().module_id();
                if declaring != requirer {
                    graph.add_dependency(declaring, wire.raw_provider().module_id());
                }
            }
        }
        graph
    }

    /// 移除不再被任何当前修订（直接或间接）使用的等待移除修订
    fn cleanup_removal_pending(&mut self) -> Vec<Arc<ModuleRevision>> {
        let current = self.current_revision_ids();
        let pending: BTreeSet<RevisionId> = self
            .wirings
            .keys()
            .filter(|id| !current.contains(id))
            .copied()
            .collect();
        if pending.is_empty() {
            return Vec::new();
        }

        // 从当前修订出发，沿需要连线标记仍在使用的等待移除修订
        let mut in_use = BTreeSet::new();
        let mut queue: Vec<RevisionId> = current
            .iter()
            .filter(|id| self.wirings.contains_key(id))
            .copied()
            .collect();
        let mut seen: BTreeSet<RevisionId> = queue.iter().copied().collect();
        while let Some(revision) = queue.pop() {
            let Some(wiring) = self.wirings.get(&revision) else {
                continue;
            };
            for wire in wiring.required_wires() {
                let provider = wire.provider_id();
                if pending.contains(&provider) {
                    in_use.insert(provider);
                }
                if seen.insert(provider) {
                    queue.push(provider);
                }
            }
            // 附加在仍在使用的宿主上的片段同样保留
            for wire in wiring.provided_wires() {
                if wire.namespace() == crate::module::metadata::namespace::HOST {
                    let fragment = wire.requirer_id();
                    if pending.contains(&fragment) {
                        in_use.insert(fragment);
                    }
                }
            }
        }

        let removable: BTreeSet<RevisionId> = pending.difference(&in_use).copied().collect();
        if removable.is_empty() {
            return Vec::new();
        }
        self.remove_wirings(&removable)
    }

    /// 删除连线状态，并从提供方连线状态中去掉指向它们的提供连线
    fn remove_wirings(&mut self, removed: &BTreeSet<RevisionId>) -> Vec<Arc<ModuleRevision>> {
        let wirings = Arc::make_mut(&mut self.wirings);
        let mut dropped = Vec::new();
        let mut providers = BTreeSet::new();
        for id in removed {
            if let Some(wiring) = wirings.remove(id) {
                for wire in wiring.required_wires() {
                    providers.insert(wire.provider_id());
                }
                wiring.invalidate();
                dropped.push(wiring.revision().clone());
            }
        }
        for provider in providers {
            if removed.contains(&provider) {
                continue;
            }
            if let Some(wiring) = wirings.get(&provider) {
                let rebuilt = wiring.without_requirers(removed);
                wirings.insert(provider, Arc::new(rebuilt));
            }
        }

        // 已卸载模块保留最后一个修订以供查询，只有仍安装的模块才丢弃旧修订
        let current = self.current_revision_ids();
        for revision in &dropped {
            if current.contains(&revision.id()) {
                continue;
            }
            if let Some(module) = self.modules_by_id.get(&revision.module_id()) {
                module.remove_revision(revision.id());
            }
            trace!(revision = %revision, "等待移除的修订已释放");
        }
        if !dropped.is_empty() {
            self.bump_revisions();
        }
        dropped
    }
}

/// 解析用快照
#[derive(Debug, Clone)]
pub struct Snapshot {
    timestamp: u64,
    wirings: Arc<WiringMap>,
    index: Arc<CapabilityIndex>,
    unresolved: Vec<Arc<ModuleRevision>>,
}

impl Snapshot {
    /// 读取快照时的修订时间戳
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn wirings(&self) -> &Arc<WiringMap> {
        &self.wirings
    }

    pub fn wiring(&self, revision: RevisionId) -> Option<&Arc<ModuleWiring>> {
        self.wirings.get(&revision)
    }

    pub fn is_resolved(&self, revision: RevisionId) -> bool {
        self.wirings.contains_key(&revision)
    }

    pub fn index(&self) -> &CapabilityIndex {
        &self.index
    }

    /// 当前未解析的修订，按模块 ID 排序
    pub fn unresolved(&self) -> &[Arc<ModuleRevision>] {
        &self.unresolved
    }
}

/// 解析结果需要写入数据库的连线变化
///
/// 每个条目是一个完整的连线状态，替换数据库中同一修订的旧连线状态（若存在）。
#[derive(Debug, Default, Clone)]
pub struct WiringDelta {
    pub wirings: Vec<Arc<ModuleWiring>>,
}

impl WiringDelta {
    pub fn is_empty(&self) -> bool {
        self.wirings.is_empty()
    }

    /// 相对快照新解析的修订
    pub fn newly_resolved(&self, snapshot: &Snapshot) -> Vec<Arc<ModuleRevision>> {
        self.wirings
            .iter()
            .filter(|w| !snapshot.is_resolved(w.revision().id()))
            .map(|w| w.revision().clone())
            .collect()
    }

    /// 受影响的模块 ID（升序）
    pub fn modules(&self) -> BTreeSet<ModuleId> {
        self.wirings.iter().map(|w| w.module_id()).collect()
    }
}

/// 应用解析结果的结果
#[derive(Debug)]
pub enum ApplyOutcome {
    /// 已写入，附带新进入 RESOLVED 的模块（按 ID 升序）
    Applied(Vec<Arc<Module>>),
    /// 快照已过期，需要重试
    Stale { expected: u64, actual: u64 },
}

/// 卸载结果
#[derive(Debug)]
pub struct UninstallOutcome {
    /// 卸载前是否处于已解析集合
    pub was_resolved: bool,
    /// 旧修订是否仍等待移除
    pub removal_pending: bool,
}

/// 模块数据库
#[derive(Debug)]
pub struct Database {
    state: DbLock<DbState>,
}

impl Database {
    /// 创建空数据库
    pub fn new(initial_module_start_level: u32) -> Self {
        Self {
            state: DbLock::new(DbState::new(initial_module_start_level)),
        }
    }

    pub(crate) fn read_state(&self) -> lock::DbReadGuard<'_, DbState> {
        self.state.read()
    }

    pub(crate) fn write_state(&self) -> Result<lock::DbWriteGuard<'_, DbState>> {
        self.state.write()
    }

    pub fn revisions_timestamp(&self) -> u64 {
        self.state.read().revisions_timestamp
    }

    pub fn all_timestamp(&self) -> u64 {
        self.state.read().all_timestamp
    }

    /// 数据库是否为空（没有任何模块）
    pub fn is_empty(&self) -> bool {
        self.state.read().modules_by_id.is_empty()
    }

    pub fn initial_module_start_level(&self) -> u32 {
        self.state.read().initial_module_start_level
    }

    pub fn set_initial_module_start_level(&self, level: u32) -> Result<()> {
        let mut state = self.state.write()?;
        if state.initial_module_start_level != level {
            state.initial_module_start_level = level;
            state.bump_all();
        }
        Ok(())
    }

    /// 安装系统模块（ID 0）
    pub fn install_system(&self, builder: &RevisionBuilder) -> Result<Arc<Module>> {
        self.install_with_id(SYSTEM_MODULE_LOCATION, builder, Some(SYSTEM_MODULE_ID))
    }

    /// 安装模块
    ///
    /// 调用方负责冲突检查与安装锁；位置已存在时返回 `InvalidState`。
    pub fn install(&self, location: &str, builder: &RevisionBuilder) -> Result<Arc<Module>> {
        self.install_with_id(location, builder, None)
    }

    fn install_with_id(
        &self,
        location: &str,
        builder: &RevisionBuilder,
        fixed_id: Option<ModuleId>,
    ) -> Result<Arc<Module>> {
        let mut state = self.state.write()?;
        if state.modules_by_location.contains_key(location) {
            return Err(ContainerError::InvalidState(format!(
                "位置 '{}' 已安装模块",
                location
            )));
        }
        let module_id = match fixed_id {
            Some(id) => {
                if state.modules_by_id.contains_key(&id) {
                    return Err(ContainerError::InvalidState(format!("模块 ID {} 已被占用", id)));
                }
                id
            }
            None => {
                let id = state.next_module_id;
                state.next_module_id += 1;
                id
            }
        };
        let revision_id = state.allocate_revision_id();
        let revision = Arc::new(builder.build(module_id, revision_id)?);

        let start_level = if module_id == SYSTEM_MODULE_ID {
            0
        } else {
            state.initial_module_start_level
        };
        let module = Arc::new(Module::new(
            module_id,
            location,
            start_level,
            ModuleSettings::default(),
            chrono::Utc::now().timestamp_millis(),
        ));
        module.push_revision(revision.clone());

        state
            .modules_by_location
            .insert(location.to_string(), module.clone());
        state.modules_by_id.insert(module_id, module.clone());
        Arc::make_mut(&mut state.index).add_revision(&revision);
        state.bump_revisions();

        info!(module_id, location = %location, revision = %revision, "模块已写入数据库");
        Ok(module)
    }

    /// 更新模块：追加新修订并将模块置回 INSTALLED
    ///
    /// 旧修订若已解析则保留为等待移除，随后尝试清理。
    pub fn update(&self, module: &Arc<Module>, builder: &RevisionBuilder) -> Result<Arc<ModuleRevision>> {
        let mut state = self.state.write()?;
        let old = module.current_revision().ok_or_else(|| {
            ContainerError::InvalidState(format!("模块 {} 已卸载，不能更新", module))
        })?;
        let revision_id = state.allocate_revision_id();
        let revision = Arc::new(builder.build(module.id(), revision_id)?);

        module.push_revision(revision.clone());
        {
            let index = Arc::make_mut(&mut state.index);
            index.remove_revision(old.id());
            index.add_revision(&revision);
        }
        if !state.wirings.contains_key(&old.id()) {
            module.remove_revision(old.id());
        }
        module.set_state(ModuleState::Installed);
        module.touch();
        state.bump_revisions();
        state.cleanup_removal_pending();

        info!(module_id = module.id(), from = %old, to = %revision, "模块修订已更新");
        Ok(revision)
    }

    /// 卸载模块：从位置表与 ID 表中移除，已解析的修订保留为等待移除
    pub fn uninstall(&self, module: &Arc<Module>) -> Result<UninstallOutcome> {
        let mut state = self.state.write()?;
        if module.state() == ModuleState::Uninstalled {
            return Err(ContainerError::InvalidState(format!("模块 {} 已卸载", module)));
        }
        let was_resolved = module.state().is_resolved_set();
        let current = module.current_revision();

        state.modules_by_location.remove(module.location());
        state.modules_by_id.remove(&module.id());
        if let Some(revision) = &current {
            Arc::make_mut(&mut state.index).remove_revision(revision.id());
        }
        module.set_state(ModuleState::Uninstalled);
        module.touch();
        state.bump_revisions();

        state.cleanup_removal_pending();
        let removal_pending = current
            .map(|r| state.wirings.contains_key(&r.id()))
            .unwrap_or(false);

        info!(module_id = module.id(), location = %module.location(), removal_pending, "模块已从数据库移除");
        Ok(UninstallOutcome {
            was_resolved,
            removal_pending,
        })
    }

    /// 读取解析快照
    pub fn snapshot(&self) -> Snapshot {
        let state = self.state.read();
        let unresolved = state
            .modules_by_id
            .values()
            .filter(|m| m.state() == ModuleState::Installed)
            .filter_map(|m| m.current_revision())
            .filter(|r| !state.wirings.contains_key(&r.id()))
            .collect();
        Snapshot {
            timestamp: state.revisions_timestamp,
            wirings: state.wirings.clone(),
            index: state.index.clone(),
            unresolved,
        }
    }

    /// 应用解析结果
    ///
    /// 时间戳与快照一致时合并连线状态，并把新解析修订所属模块置为 RESOLVED。
    /// 调用方必须已持有这些模块的 RESOLVED 状态变更锁。
    pub fn apply_resolution(&self, expected: u64, delta: &WiringDelta) -> Result<ApplyOutcome> {
        let mut state = self.state.write()?;
        if state.revisions_timestamp != expected {
            debug!(expected, actual = state.revisions_timestamp, "快照已过期");
            return Ok(ApplyOutcome::Stale {
                expected,
                actual: state.revisions_timestamp,
            });
        }
        if delta.is_empty() {
            return Ok(ApplyOutcome::Applied(Vec::new()));
        }

        let mut resolved = Vec::new();
        {
            let wirings = Arc::make_mut(&mut state.wirings);
            for wiring in &delta.wirings {
                let revision = wiring.revision();
                if wirings.insert(revision.id(), wiring.clone()).is_none() {
                    resolved.push(revision.clone());
                }
            }
        }

        let mut modules = Vec::new();
        for revision in resolved {
            if let Some(module) = state.modules_by_id.get(&revision.module_id()) {
                let is_current = module
                    .current_revision()
                    .map(|r| r.id() == revision.id())
                    .unwrap_or(false);
                if is_current && module.state() == ModuleState::Installed {
                    module.set_state(ModuleState::Resolved);
                    modules.push(module.clone());
                }
            }
        }
        modules.sort_by_key(|m| m.id());
        state.bump_revisions();
        debug!(
            timestamp = state.revisions_timestamp,
            wirings = delta.wirings.len(),
            resolved = modules.len(),
            "解析结果已写入数据库"
        );
        Ok(ApplyOutcome::Applied(modules))
    }

    /// 取消解析：删除模块当前修订及等待移除修订的连线状态，并置回 INSTALLED
    ///
    /// 返回此前处于已解析集合的模块。
    pub fn unresolve(&self, modules: &[Arc<Module>]) -> Result<Vec<Arc<Module>>> {
        let mut state = self.state.write()?;
        let mut removed = BTreeSet::new();
        let mut unresolved = Vec::new();
        for module in modules {
            for revision in module.revisions() {
                if state.wirings.contains_key(&revision.id()) {
                    removed.insert(revision.id());
                }
            }
            if module.state().is_resolved_set() {
                unresolved.push(module.clone());
            }
        }
        if !removed.is_empty() {
            state.remove_wirings(&removed);
        }
        for module in &unresolved {
            module.set_state(ModuleState::Installed);
        }
        state.cleanup_removal_pending();
        debug!(count = unresolved.len(), "模块已取消解析");
        Ok(unresolved)
    }

    /// 清理不再使用的等待移除修订，返回被移除的修订
    pub fn cleanup_removal_pending(&self) -> Result<Vec<Arc<ModuleRevision>>> {
        Ok(self.state.write()?.cleanup_removal_pending())
    }

    /// 等待移除的修订
    pub fn removal_pending(&self) -> Vec<Arc<ModuleRevision>> {
        let state = self.state.read();
        let current = state.current_revision_ids();
        let mut pending: Vec<Arc<ModuleRevision>> = state
            .wirings
            .values()
            .map(|w| w.revision())
            .filter(|r| state.is_removal_pending(r, &current))
            .cloned()
            .collect();
        pending.sort_by_key(|r| r.id());
        pending
    }

    /// 刷新闭包：给定模块与全部等待移除修订所属模块，加上它们的传递依赖方，
    /// 以及闭包中片段的宿主
    pub fn dependency_closure(&self, roots: &[ModuleId]) -> BTreeSet<ModuleId> {
        let state = self.state.read();
        let current = state.current_revision_ids();
        let graph = state.graph();

        let mut seeds: Vec<ModuleId> = roots.to_vec();
        seeds.extend(
            state
                .wirings
                .values()
                .filter(|w| state.is_removal_pending(w.revision(), &current))
                .map(|w| w.module_id()),
        );

        let mut closure = graph.dependents_closure(&seeds);
        loop {
            let hosts: Vec<ModuleId> = state
                .wirings
                .values()
                .filter(|w| closure.contains(&w.module_id()) && w.revision().is_fragment())
                .flat_map(|w| {
                    w.required_wires_in(crate::module::metadata::namespace::HOST)
                        .into_iter()
                        .map(|wire| wire.raw_provider().module_id())
                        .collect::<Vec<_>>()
                })
                .filter(|id| !closure.contains(id))
                .collect();
            if hosts.is_empty() {
                break;
            }
            closure.extend(graph.dependents_closure(&hosts));
        }
        closure
    }

    /// 当前依赖图
    pub fn dependency_graph(&self) -> DependencyGraph {
        self.state.read().graph()
    }

    /// 全部模块（按 ID 升序）
    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.state.read().modules_by_id.values().cloned().collect()
    }

    pub fn module_by_id(&self, id: ModuleId) -> Option<Arc<Module>> {
        self.state.read().modules_by_id.get(&id).cloned()
    }

    pub fn module_by_location(&self, location: &str) -> Option<Arc<Module>> {
        self.state.read().modules_by_location.get(location).cloned()
    }

    /// 修订的连线状态
    pub fn wiring(&self, revision: RevisionId) -> Option<Arc<ModuleWiring>> {
        self.state.read().wirings.get(&revision).cloned()
    }

    /// 模块当前修订的连线状态
    pub fn module_wiring(&self, module: &Module) -> Option<Arc<ModuleWiring>> {
        let revision = module.current_revision()?;
        self.wiring(revision.id())
    }

    /// 当前修订中与给定符号名和版本相同的模块
    pub fn find_collisions(
        &self,
        symbolic_name: &str,
        version: &semver::Version,
        exclude: Option<ModuleId>,
    ) -> Vec<Arc<Module>> {
        let state = self.state.read();
        state
            .modules_by_id
            .values()
            .filter(|m| Some(m.id()) != exclude)
            .filter(|m| {
                m.current_revision()
                    .map(|r| r.symbolic_name() == symbolic_name && r.version() == version)
                    .unwrap_or(false)
            })
            .cloned()
            .collect()
    }

    /// 设置模块启动级别
    pub fn set_start_level(&self, module: &Module, level: u32) -> Result<()> {
        let mut state = self.state.write()?;
        if module.start_level() != level {
            module.set_start_level(level);
            module.touch();
            state.bump_all();
        }
        Ok(())
    }

    /// 模块设置已变更
    pub fn settings_changed(&self, module: &Module) -> Result<()> {
        let mut state = self.state.write()?;
        module.touch();
        state.bump_all();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::metadata::namespace;

    fn exporter(name: &str) -> RevisionBuilder {
        RevisionBuilder::new(name, "1.0")
            .unwrap()
            .export_package("p", "1.0")
            .unwrap()
    }

    fn importer(name: &str) -> RevisionBuilder {
        RevisionBuilder::new(name, "1.0")
            .unwrap()
            .import_package("p", None)
            .unwrap()
    }

    /// 手工连线 B -> A 并写入数据库
    fn wire_b_to_a(db: &Database, a: &Arc<Module>, b: &Arc<Module>) {
        let snapshot = db.snapshot();
        let a_rev = a.current_revision().unwrap();
        let b_rev = b.current_revision().unwrap();
        let wire = Arc::new(Wire::new(
            b_rev.requirement_refs()[0].clone(),
            a_rev.capabilities_in(namespace::PACKAGE)[0].clone(),
            b_rev.clone(),
            a_rev.clone(),
        ));
        let a_wiring = ModuleWiring::new(
            a_rev.clone(),
            a_rev.capabilities_in(namespace::PACKAGE),
            Vec::new(),
            vec![wire.clone()],
            Vec::new(),
            BTreeSet::new(),
        );
        let b_wiring = ModuleWiring::new(
            b_rev.clone(),
            Vec::new(),
            b_rev.requirement_refs(),
            Vec::new(),
            vec![wire],
            BTreeSet::new(),
        );
        let delta = WiringDelta {
            wirings: vec![Arc::new(a_wiring), Arc::new(b_wiring)],
        };
        match db.apply_resolution(snapshot.timestamp(), &delta).unwrap() {
            ApplyOutcome::Applied(modules) => assert_eq!(modules.len(), 2),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_install_bumps_timestamps() {
        let db = Database::new(1);
        let before = db.revisions_timestamp();
        let module = db.install("loc:a", &exporter("a")).unwrap();
        assert_eq!(module.id(), 1);
        assert_eq!(module.start_level(), 1);
        assert!(db.revisions_timestamp() > before);
        assert!(db.install("loc:a", &exporter("a2")).is_err());
        assert_eq!(db.module_by_location("loc:a").unwrap().id(), 1);
    }

    #[test]
    fn test_settings_only_bump_all_timestamp() {
        let db = Database::new(1);
        let module = db.install("loc:a", &exporter("a")).unwrap();
        let revisions = db.revisions_timestamp();
        let all = db.all_timestamp();
        db.set_start_level(&module, 4).unwrap();
        assert_eq!(db.revisions_timestamp(), revisions);
        assert_eq!(db.all_timestamp(), all + 1);
        assert_eq!(module.start_level(), 4);
    }

    #[test]
    fn test_stale_apply() {
        let db = Database::new(1);
        db.install("loc:a", &exporter("a")).unwrap();
        let snapshot = db.snapshot();
        db.install("loc:b", &importer("b")).unwrap();
        let outcome = db.apply_resolution(snapshot.timestamp(), &WiringDelta::default()).unwrap();
        assert!(matches!(outcome, ApplyOutcome::Stale { .. }));
    }

    #[test]
    fn test_uninstall_keeps_removal_pending_until_unresolve() {
        let db = Database::new(1);
        let a = db.install("loc:a", &exporter("a")).unwrap();
        let b = db.install("loc:b", &importer("b")).unwrap();
        wire_b_to_a(&db, &a, &b);
        assert_eq!(b.state(), ModuleState::Resolved);

        let outcome = db.uninstall(&a).unwrap();
        assert!(outcome.was_resolved);
        assert!(outcome.removal_pending);
        assert_eq!(db.removal_pending().len(), 1);
        assert!(db.module_by_id(a.id()).is_none());
        assert!(a.latest_revision().is_some());

        let closure = db.dependency_closure(&[]);
        assert!(closure.contains(&a.id()));
        assert!(closure.contains(&b.id()));

        let a_rev = a.latest_revision().unwrap();
        db.unresolve(&[b.clone()]).unwrap();
        assert!(db.removal_pending().is_empty());
        assert!(db.wiring(a_rev.id()).is_none());
        assert_eq!(b.state(), ModuleState::Installed);
        assert_eq!(a.state(), ModuleState::Uninstalled);
    }

    #[test]
    fn test_update_unused_revision_is_dropped() {
        let db = Database::new(1);
        let a = db.install("loc:a", &exporter("a")).unwrap();
        let old = a.current_revision().unwrap();
        let new = db
            .update(&a, &RevisionBuilder::new("a", "2.0").unwrap())
            .unwrap();
        assert_ne!(old.id(), new.id());
        assert_eq!(a.revisions().len(), 1);
        assert!(db.removal_pending().is_empty());
    }

    #[test]
    fn test_update_wired_revision_kept() {
        let db = Database::new(1);
        let a = db.install("loc:a", &exporter("a")).unwrap();
        let b = db.install("loc:b", &importer("b")).unwrap();
        wire_b_to_a(&db, &a, &b);

        db.update(&a, &exporter("a")).unwrap();
        assert_eq!(a.state(), ModuleState::Installed);
        assert_eq!(a.revisions().len(), 2);
        assert_eq!(db.removal_pending().len(), 1);

        let wiring = db.module_wiring(&b).unwrap();
        assert!(wiring.required_wires()[0].is_valid());
    }

    #[test]
    fn test_find_collisions() {
        let db = Database::new(1);
        let a = db.install("loc:a", &exporter("same")).unwrap();
        let version = semver::Version::new(1, 0, 0);
        assert_eq!(db.find_collisions("same", &version, None).len(), 1);
        assert!(db.find_collisions("same", &version, Some(a.id())).is_empty());
    }

    #[test]
    fn test_system_module_id() {
        let db = Database::new(1);
        let system = db
            .install_system(&RevisionBuilder::new("system", "1.0").unwrap())
            .unwrap();
        assert_eq!(system.id(), SYSTEM_MODULE_ID);
        assert_eq!(system.start_level(), 0);
        let next = db.install("loc:a", &exporter("a")).unwrap();
        assert_eq!(next.id(), 1);
    }
}
