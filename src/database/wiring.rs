//! 连线与模块连线状态
//!
//! [`Wire`] 把某个修订的一条需求连到另一修订的一个能力。连线本身不可变，
//! 只携带一个有效标志；连线状态失效后，各访问器返回 `None` 而不是陈旧对象。
//!
//! [`ModuleWiring`] 是一个已解析修订的完整连线状态：实际提供的能力、实际使用的需求，
//! 以及提供 / 需要的连线列表。片段的能力与需求并入宿主的连线状态。

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::module::metadata::namespace;
use crate::module::{CapabilityRef, ModuleId, ModuleRevision, RequirementRef, RevisionId};

/// 需求到能力的连线
pub struct Wire {
    requirement: RequirementRef,
    capability: CapabilityRef,
    /// 拥有该需求的连线状态所属修订（片段需求为宿主）
    requirer: Arc<ModuleRevision>,
    /// 提供能力的连线状态所属修订（片段能力为宿主）
    provider: Arc<ModuleRevision>,
    valid: AtomicBool,
}

impl Wire {
    pub fn new(
        requirement: RequirementRef,
        capability: CapabilityRef,
        requirer: Arc<ModuleRevision>,
        provider: Arc<ModuleRevision>,
    ) -> Self {
        Self {
            requirement,
            capability,
            requirer,
            provider,
            valid: AtomicBool::new(true),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
    }

    pub fn requirement(&self) -> Option<&RequirementRef> {
        self.is_valid().then_some(&self.requirement)
    }

    pub fn capability(&self) -> Option<&CapabilityRef> {
        self.is_valid().then_some(&self.capability)
    }

    pub fn requirer(&self) -> Option<&Arc<ModuleRevision>> {
        self.is_valid().then_some(&self.requirer)
    }

    pub fn provider(&self) -> Option<&Arc<ModuleRevision>> {
        self.is_valid().then_some(&self.provider)
    }

    /// 连线的命名空间
    pub fn namespace(&self) -> &str {
        self.capability.capability().namespace()
    }

    pub(crate) fn requirer_id(&self) -> RevisionId {
        self.requirer.id()
    }

    pub(crate) fn provider_id(&self) -> RevisionId {
        self.provider.id()
    }

    pub(crate) fn raw_requirement(&self) -> &RequirementRef {
        &self.requirement
    }

    pub(crate) fn raw_capability(&self) -> &CapabilityRef {
        &self.capability
    }

    pub(crate) fn raw_requirer(&self) -> &Arc<ModuleRevision> {
        &self.requirer
    }

    pub(crate) fn raw_provider(&self) -> &Arc<ModuleRevision> {
        &self.provider
    }
}

impl fmt::Debug for Wire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wire")
            .field("requirer", &self.requirer.id())
            .field("provider", &self.provider.id())
            .field("namespace", &self.namespace())
            .field("valid", &self.is_valid())
            .finish()
    }
}

impl fmt::Display for Wire {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {} ({})",
            self.requirer,
            self.provider,
            self.requirement.requirement().describe()
        )
    }
}

/// 已解析修订的连线状态
pub struct ModuleWiring {
    revision: Arc<ModuleRevision>,
    capabilities: Vec<CapabilityRef>,
    requirements: Vec<RequirementRef>,
    provided: Vec<Arc<Wire>>,
    required: Vec<Arc<Wire>>,
    /// 被导入替代的导出包
    substituted: BTreeSet<String>,
    valid: AtomicBool,
    /// 动态导入未命中缓存：包名 -> 记录时的修订时间戳
    dynamic_misses: Mutex<HashMap<String, u64>>,
}

impl ModuleWiring {
    pub fn new(
        revision: Arc<ModuleRevision>,
        capabilities: Vec<CapabilityRef>,
        requirements: Vec<RequirementRef>,
        provided: Vec<Arc<Wire>>,
        required: Vec<Arc<Wire>>,
        substituted: BTreeSet<String>,
    ) -> Self {
        Self {
            revision,
            capabilities,
            requirements,
            provided,
            required,
            substituted,
            valid: AtomicBool::new(true),
            dynamic_misses: Mutex::new(HashMap::new()),
        }
    }

    pub fn revision(&self) -> &Arc<ModuleRevision> {
        &self.revision
    }

    pub fn module_id(&self) -> ModuleId {
        self.revision.module_id()
    }

    /// 实际提供的能力
    pub fn capabilities(&self) -> &[CapabilityRef] {
        &self.capabilities
    }

    /// 指定命名空间下实际提供的能力
    pub fn capabilities_in(&self, namespace: &str) -> Vec<CapabilityRef> {
        self.capabilities
            .iter()
            .filter(|c| c.capability().namespace() == namespace)
            .cloned()
            .collect()
    }

    /// 实际使用的需求
    pub fn requirements(&self) -> &[RequirementRef] {
        &self.requirements
    }

    pub fn provided_wires(&self) -> &[Arc<Wire>] {
        &self.provided
    }

    pub fn required_wires(&self) -> &[Arc<Wire>] {
        &self.required
    }

    pub fn required_wires_in(&self, namespace: &str) -> Vec<Arc<Wire>> {
        self.required
            .iter()
            .filter(|w| w.namespace() == namespace)
            .cloned()
            .collect()
    }

    pub fn provided_wires_in(&self, namespace: &str) -> Vec<Arc<Wire>> {
        self.provided
            .iter()
            .filter(|w| w.namespace() == namespace)
            .cloned()
            .collect()
    }

    /// 是否有包导出被导入替代
    pub fn is_substituted(&self, package: &str) -> bool {
        self.substituted.contains(package)
    }

    pub fn substituted(&self) -> &BTreeSet<String> {
        &self.substituted
    }

    /// 已附加的片段修订
    pub fn fragments(&self) -> Vec<Arc<ModuleRevision>> {
        self.provided
            .iter()
            .filter(|w| w.namespace() == namespace::HOST)
            .map(|w| w.raw_requirer().clone())
            .collect()
    }

    /// 为本修订提供能力的模块
    pub fn provider_modules(&self) -> BTreeSet<ModuleId> {
        self.required
            .iter()
            .map(|w| w.raw_provider().module_id())
            .filter(|id| *id != self.module_id())
            .collect()
    }

    /// 依赖本修订的模块
    pub fn dependent_modules(&self) -> BTreeSet<ModuleId> {
        self.provided
            .iter()
            .map(|w| w.raw_requirer().module_id())
            .filter(|id| *id != self.module_id())
            .collect()
    }

    /// 已连线的包名 -> 连线
    pub fn imported_package(&self, package: &str) -> Option<Arc<Wire>> {
        self.required
            .iter()
            .find(|w| {
                w.namespace() == namespace::PACKAGE
                    && w.raw_capability().capability().primary_key() == Some(package)
            })
            .cloned()
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// 使连线状态及其全部连线失效
    pub(crate) fn invalidate(&self) {
        self.valid.store(false, Ordering::Release);
        for wire in self.provided.iter().chain(self.required.iter()) {
            wire.invalidate();
        }
    }

    /// 追加提供连线，得到替换用的新连线状态
    pub(crate) fn with_provided(&self, extra: &[Arc<Wire>]) -> ModuleWiring {
        let mut provided = self.provided.clone();
        provided.extend(extra.iter().cloned());
        self.rebuilt(self.capabilities.clone(), self.requirements.clone(), provided, self.required.clone())
    }

    /// 追加需要连线（动态导入）
    pub(crate) fn with_required(&self, extra: &[Arc<Wire>]) -> ModuleWiring {
        let mut required = self.required.clone();
        required.extend(extra.iter().cloned());
        self.rebuilt(self.capabilities.clone(), self.requirements.clone(), self.provided.clone(), required)
    }

    /// 附加片段：并入片段的能力与需求，追加连线
    pub(crate) fn with_fragment(
        &self,
        capabilities: &[CapabilityRef],
        requirements: &[RequirementRef],
        provided: &[Arc<Wire>],
        required: &[Arc<Wire>],
    ) -> ModuleWiring {
        let mut caps = self.capabilities.clone();
        caps.extend(capabilities.iter().cloned());
        let mut reqs = self.requirements.clone();
        reqs.extend(requirements.iter().cloned());
        let mut prov = self.provided.clone();
        prov.extend(provided.iter().cloned());
        let mut req_wires = self.required.clone();
        req_wires.extend(required.iter().cloned());
        self.rebuilt(caps, reqs, prov, req_wires)
    }

    /// 移除来自指定修订的提供连线（清理等待移除的依赖方时使用）
    pub(crate) fn without_requirers(&self, removed: &BTreeSet<RevisionId>) -> ModuleWiring {
        let provided = self
            .provided
            .iter()
            .filter(|w| !removed.contains(&w.requirer_id()))
            .cloned()
            .collect();
        self.rebuilt(self.capabilities.clone(), self.requirements.clone(), provided, self.required.clone())
    }

    fn rebuilt(
        &self,
        capabilities: Vec<CapabilityRef>,
        requirements: Vec<RequirementRef>,
        provided: Vec<Arc<Wire>>,
        required: Vec<Arc<Wire>>,
    ) -> ModuleWiring {
        let wiring = ModuleWiring::new(
            self.revision.clone(),
            capabilities,
            requirements,
            provided,
            required,
            self.substituted.clone(),
        );
        *wiring.dynamic_misses.lock() = self.dynamic_misses.lock().clone();
        wiring
    }

    /// 记录动态导入未命中
    pub(crate) fn record_dynamic_miss(&self, package: &str, timestamp: u64) {
        self.dynamic_misses
            .lock()
            .insert(package.to_string(), timestamp);
    }

    /// 在给定修订时间戳下是否已知未命中
    pub(crate) fn is_dynamic_miss(&self, package: &str, timestamp: u64) -> bool {
        self.dynamic_misses.lock().get(package) == Some(&timestamp)
    }
}

impl fmt::Debug for ModuleWiring {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleWiring")
            .field("revision", &self.revision.id())
            .field("capabilities", &self.capabilities.len())
            .field("requirements", &self.requirements.len())
            .field("provided", &self.provided)
            .field("required", &self.required)
            .field("valid", &self.is_valid())
            .finish()
    }
}
