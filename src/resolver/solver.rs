//! 批次求解
//!
//! 一个批次从目标修订出发，沿候选能力收集所有可能参与的未解析修订，
//! 然后反复淘汰存在无法满足的必需需求的修订，直到不动点。互相依赖的修订
//! 在同一轮淘汰中一起存活或一起失败。存活修订再经过一层 uses 约束检查，
//! 最后生成完整的连线状态写入 [`Overlay`]。

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, trace};

use super::candidates::{Candidates, Overlay};
use super::report::{ReportEntry, ResolutionReport};
use crate::core::ResolverConfig;
use crate::database::{ModuleWiring, Wire};
use crate::module::metadata::namespace;
use crate::module::{CapabilityRef, FragmentAttachment, ModuleRevision, RequirementRef, RevisionId};

type ReqKey = (RevisionId, usize);

/// 批次因超时被取消
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Cancelled;

/// 一次解析请求内的求解会话，跨批次共享已解析结果与报告
pub(crate) struct Session<'a> {
    pub(crate) overlay: Overlay,
    pub(crate) candidates: Candidates<'a>,
    pub(crate) report: ResolutionReport,
    /// 本轮允许解析的未解析修订
    pool: BTreeMap<RevisionId, Arc<ModuleRevision>>,
    config: &'a ResolverConfig,
}

/// 单个批次的工作状态
#[derive(Default)]
struct Batch {
    members: BTreeMap<RevisionId, Arc<ModuleRevision>>,
    /// 片段 -> 可附加的批次内宿主及其宿主能力
    attachments: BTreeMap<RevisionId, Vec<(Arc<ModuleRevision>, CapabilityRef)>>,
    alive: BTreeSet<RevisionId>,
    failures: BTreeMap<RevisionId, ReportEntry>,
}

impl Batch {
    fn alive_hosts(&self, fragment: RevisionId) -> Vec<(Arc<ModuleRevision>, CapabilityRef)> {
        self.attachments
            .get(&fragment)
            .into_iter()
            .flatten()
            .filter(|(host, _)| self.alive.contains(&host.id()))
            .cloned()
            .collect()
    }

    /// 宿主及其存活的附加片段
    fn parts_of(&self, host: &Arc<ModuleRevision>) -> Vec<Arc<ModuleRevision>> {
        let mut parts = vec![host.clone()];
        for (fragment, hosts) in &self.attachments {
            if self.alive.contains(fragment) && hosts.iter().any(|(h, _)| h.id() == host.id()) {
                if let Some(rev) = self.members.get(fragment) {
                    parts.push(rev.clone());
                }
            }
        }
        parts
    }

    fn fail(&mut self, revision: RevisionId, entry: ReportEntry) {
        self.alive.remove(&revision);
        self.failures.insert(revision, entry);
    }
}

/// 一条需求的候选选择
#[derive(Debug, Clone)]
struct Choice {
    requirement: RequirementRef,
    options: Vec<CapabilityRef>,
    selected: usize,
}

impl Choice {
    fn selected(&self) -> Option<&CapabilityRef> {
        self.options.get(self.selected)
    }
}

/// uses 冲突
struct Conflict {
    /// 其提供方 uses 约束产生冲突的导入
    import: ReqKey,
    /// 本地对冲突包的导入（若有）
    local: Option<ReqKey>,
    package: String,
    expected: CapabilityRef,
}

/// 需求是否参与解析期连线
fn is_wired_at_resolve(requirement: &RequirementRef) -> bool {
    let req = requirement.requirement();
    req.namespace() != namespace::HOST && !req.is_dynamic() && req.is_effective()
}

impl<'a> Session<'a> {
    pub(crate) fn new(
        overlay: Overlay,
        candidates: Candidates<'a>,
        pool: BTreeMap<RevisionId, Arc<ModuleRevision>>,
        config: &'a ResolverConfig,
    ) -> Self {
        Self {
            overlay,
            candidates,
            report: ResolutionReport::new(),
            pool,
            config,
        }
    }

    pub(crate) fn is_resolved(&self, revision: RevisionId) -> bool {
        self.overlay.is_resolved(revision)
    }

    pub(crate) fn in_pool(&self, revision: RevisionId) -> bool {
        self.pool.contains_key(&revision)
    }

    /// 把无负载片段附加到允许运行期附加的已解析宿主
    ///
    /// 返回成功附加的片段。
    pub(crate) fn attach_to_resolved_hosts(&mut self, fragments: &[Arc<ModuleRevision>]) -> Vec<RevisionId> {
        let mut attached = Vec::new();
        for fragment in fragments {
            if !fragment.is_fragment()
                || !fragment.is_payload_free()
                || !self.in_pool(fragment.id())
                || self.is_resolved(fragment.id())
            {
                continue;
            }
            let Some(host_req) = fragment.host_requirement() else {
                continue;
            };
            let hosts: Vec<CapabilityRef> = self
                .candidates
                .find(&self.overlay, &host_req)
                .into_iter()
                .filter(|cap| {
                    !cap.revision().is_fragment()
                        && self.is_resolved(cap.revision().id())
                        && cap.capability().fragment_attachment() == FragmentAttachment::Always
                })
                .collect();
            if hosts.is_empty() {
                continue;
            }

            let mut host_wires = Vec::new();
            for cap in hosts {
                let host = cap.revision().clone();
                let Some(host_wiring) = self.overlay.wiring(host.id()).cloned() else {
                    continue;
                };
                let wire = Arc::new(Wire::new(host_req.clone(), cap, fragment.clone(), host.clone()));
                self.overlay
                    .put(host_wiring.with_fragment(&[], &[], &[wire.clone()], &[]));
                host_wires.push(wire);
            }
            self.overlay.put(ModuleWiring::new(
                fragment.clone(),
                fragment.capabilities_in(namespace::IDENTITY),
                vec![host_req],
                Vec::new(),
                host_wires,
                BTreeSet::new(),
            ));
            debug!(revision = %fragment, "片段已附加到已解析宿主");
            attached.push(fragment.id());
        }
        if !attached.is_empty() {
            self.candidates.reset();
        }
        attached
    }

    /// 求解一个批次
    ///
    /// `deadline` 在每轮淘汰开始时检查，已过期则返回 [`Cancelled`]，
    /// 此时本批次不写入任何结果。
    pub(crate) fn solve(
        &mut self,
        targets: &[Arc<ModuleRevision>],
        deadline: Option<Instant>,
    ) -> Result<BTreeSet<RevisionId>, Cancelled> {
        self.candidates.reset();
        let mut batch = Batch {
            members: self.explore(targets),
            ..Batch::default()
        };
        if batch.members.is_empty() {
            return Ok(BTreeSet::new());
        }
        batch.attachments = self.attachments(&batch.members);
        batch.alive = batch.members.keys().copied().collect();
        trace!(members = batch.members.len(), "批次成员已收集");

        let choices = loop {
            self.eliminate(&mut batch, deadline)?;
            let mut choices = self.choose(&batch);
            match self.check_uses(&batch, &mut choices) {
                Some((revision, entry)) => batch.fail(revision, entry),
                None => break choices,
            }
        };

        for (id, entry) in &batch.failures {
            if let Some(rev) = batch.members.get(id) {
                self.report.add(rev, entry.clone());
            }
        }
        for id in &batch.alive {
            self.report.clear(*id);
        }
        self.build(&batch, &choices);
        self.candidates.reset();
        debug!(
            resolved = batch.alive.len(),
            failed = batch.failures.len(),
            "批次求解完成"
        );
        Ok(batch.alive.clone())
    }

    /// 从目标出发收集批次成员
    fn explore(&mut self, targets: &[Arc<ModuleRevision>]) -> BTreeMap<RevisionId, Arc<ModuleRevision>> {
        let mut members = BTreeMap::new();
        let mut queue: VecDeque<Arc<ModuleRevision>> = targets.iter().cloned().collect();
        while let Some(rev) = queue.pop_front() {
            if !self.in_pool(rev.id()) || self.is_resolved(rev.id()) || members.contains_key(&rev.id()) {
                continue;
            }
            members.insert(rev.id(), rev.clone());

            if rev.is_fragment() {
                if let Some(host_req) = rev.host_requirement() {
                    for cap in self.candidates.find(&self.overlay, &host_req) {
                        queue.push_back(cap.revision().clone());
                    }
                }
            } else {
                queue.extend(self.fragments_for(&rev));
            }

            for req in rev.requirement_refs() {
                if !is_wired_at_resolve(&req) {
                    continue;
                }
                for cap in self.candidates.find(&self.overlay, &req) {
                    queue.push_back(cap.revision().clone());
                }
            }
        }
        members
    }

    /// 可附加到 `host` 的未解析片段
    fn fragments_for(&mut self, host: &Arc<ModuleRevision>) -> Vec<Arc<ModuleRevision>> {
        let fragments: Vec<Arc<ModuleRevision>> = self
            .pool
            .values()
            .filter(|r| r.is_fragment() && !self.overlay.is_resolved(r.id()))
            .cloned()
            .collect();
        fragments
            .into_iter()
            .filter(|fragment| {
                fragment.host_requirement().is_some_and(|req| {
                    self.candidates
                        .find(&self.overlay, &req)
                        .iter()
                        .any(|cap| cap.revision().id() == host.id())
                })
            })
            .collect()
    }

    fn attachments(
        &mut self,
        members: &BTreeMap<RevisionId, Arc<ModuleRevision>>,
    ) -> BTreeMap<RevisionId, Vec<(Arc<ModuleRevision>, CapabilityRef)>> {
        let mut attachments = BTreeMap::new();
        for fragment in members.values().filter(|r| r.is_fragment()) {
            let Some(host_req) = fragment.host_requirement() else {
                continue;
            };
            let hosts: Vec<(Arc<ModuleRevision>, CapabilityRef)> = self
                .candidates
                .find(&self.overlay, &host_req)
                .into_iter()
                .filter(|cap| {
                    let host = cap.revision();
                    !host.is_fragment()
                        && members.contains_key(&host.id())
                        && cap.capability().fragment_attachment() != FragmentAttachment::Never
                })
                .map(|cap| (cap.revision().clone(), cap))
                .collect();
            attachments.insert(fragment.id(), hosts);
        }
        attachments
    }

    /// 淘汰到不动点
    fn eliminate(&mut self, batch: &mut Batch, deadline: Option<Instant>) -> Result<(), Cancelled> {
        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(Cancelled);
            }
            let mut changed = false;
            let alive: Vec<RevisionId> = batch.alive.iter().copied().collect();
            for id in alive {
                let Some(rev) = batch.members.get(&id).cloned() else {
                    continue;
                };
                if let Some(entry) = self.first_unsatisfied(batch, &rev) {
                    trace!(revision = %rev, reason = entry.kind(), "修订被淘汰");
                    batch.fail(id, entry);
                    changed = true;
                }
            }
            if !changed {
                return Ok(());
            }
        }
    }

    fn first_unsatisfied(&mut self, batch: &Batch, rev: &Arc<ModuleRevision>) -> Option<ReportEntry> {
        if rev.is_fragment() && batch.alive_hosts(rev.id()).is_empty() {
            let requirement = rev
                .host_requirement()
                .map(|r| r.requirement().describe())
                .unwrap_or_else(|| namespace::HOST.to_string());
            let hosts = batch.attachments.get(&rev.id()).cloned().unwrap_or_default();
            return Some(if hosts.is_empty() {
                ReportEntry::MissingCapability { requirement }
            } else {
                ReportEntry::UnresolvedProvider {
                    requirement,
                    providers: hosts.iter().map(|(h, _)| h.to_string()).collect(),
                }
            });
        }

        for req in rev.requirement_refs() {
            if !is_wired_at_resolve(&req) || req.requirement().is_optional() {
                continue;
            }
            let found = self.candidates.find(&self.overlay, &req);
            if found.iter().any(|cap| self.is_available(batch, cap)) {
                continue;
            }
            let requirement = req.requirement().describe();
            if found.is_empty() {
                return Some(ReportEntry::MissingCapability { requirement });
            }
            let mut providers: Vec<String> = Vec::new();
            for cap in &found {
                let name = cap.revision().to_string();
                if !providers.contains(&name) {
                    providers.push(name);
                }
            }
            return Some(ReportEntry::UnresolvedProvider {
                requirement,
                providers,
            });
        }
        None
    }

    fn is_available(&self, batch: &Batch, cap: &CapabilityRef) -> bool {
        let rev = cap.revision();
        if self.is_resolved(rev.id()) {
            return true;
        }
        if !batch.alive.contains(&rev.id()) {
            return false;
        }
        self.provider_for(batch, cap).is_some()
    }

    /// 能力最终所在连线状态的修订
    fn provider_for(&self, batch: &Batch, cap: &CapabilityRef) -> Option<Arc<ModuleRevision>> {
        let rev = cap.revision();
        if self.is_resolved(rev.id()) {
            return self.overlay.resolved_provider(cap);
        }
        if !rev.is_fragment() || cap.capability().namespace() == namespace::IDENTITY {
            return Some(rev.clone());
        }
        batch.alive_hosts(rev.id()).into_iter().next().map(|(host, _)| host)
    }

    /// 为存活修订的需求选择候选
    fn choose(&mut self, batch: &Batch) -> BTreeMap<ReqKey, Choice> {
        let mut choices = BTreeMap::new();
        for id in &batch.alive {
            let Some(rev) = batch.members.get(id) else {
                continue;
            };
            for req in rev.requirement_refs() {
                if !is_wired_at_resolve(&req) {
                    continue;
                }
                let options: Vec<CapabilityRef> = self
                    .candidates
                    .find(&self.overlay, &req)
                    .into_iter()
                    .filter(|cap| self.is_available(batch, cap))
                    .collect();
                if options.is_empty() {
                    continue;
                }
                choices.insert(
                    req.key(),
                    Choice {
                        requirement: req,
                        options,
                        selected: 0,
                    },
                );
            }
        }
        choices
    }

    /// 宿主（含附加片段）的包空间：包名 -> (能力, 本地导入需求)
    fn package_space(
        &self,
        batch: &Batch,
        choices: &BTreeMap<ReqKey, Choice>,
        host: &Arc<ModuleRevision>,
    ) -> HashMap<String, (CapabilityRef, Option<ReqKey>)> {
        let parts = batch.parts_of(host);
        let part_ids: BTreeSet<RevisionId> = parts.iter().map(|p| p.id()).collect();
        let mut space = HashMap::new();
        for part in &parts {
            for cap in part.capabilities_in(namespace::PACKAGE) {
                if let Some(key) = cap.capability().primary_key() {
                    space.entry(key.to_string()).or_insert((cap.clone(), None));
                }
            }
        }
        for part in &parts {
            for req in part.requirement_refs() {
                if req.requirement().namespace() != namespace::PACKAGE || req.requirement().is_multiple() {
                    continue;
                }
                let Some(cap) = choices.get(&req.key()).and_then(|c| c.selected()) else {
                    continue;
                };
                if part_ids.contains(&cap.revision().id()) {
                    continue;
                }
                if let Some(key) = cap.capability().primary_key() {
                    space.insert(key.to_string(), (cap.clone(), Some(req.key())));
                }
            }
        }
        space
    }

    /// 提供方对某个包的来源
    fn package_source(
        &self,
        batch: &Batch,
        choices: &BTreeMap<ReqKey, Choice>,
        provider: &Arc<ModuleRevision>,
        package: &str,
    ) -> Option<CapabilityRef> {
        if let Some(wiring) = self.overlay.wiring(provider.id()) {
            if let Some(wire) = wiring.imported_package(package) {
                return Some(wire.raw_capability().clone());
            }
            return wiring
                .capabilities_in(namespace::PACKAGE)
                .into_iter()
                .find(|c| c.capability().primary_key() == Some(package));
        }
        if batch.alive.contains(&provider.id()) {
            return self
                .package_space(batch, choices, provider)
                .remove(package)
                .map(|(cap, _)| cap);
        }
        None
    }

    fn find_conflict(
        &self,
        batch: &Batch,
        choices: &BTreeMap<ReqKey, Choice>,
        host: &Arc<ModuleRevision>,
    ) -> Option<Conflict> {
        let space = self.package_space(batch, choices, host);
        let mut imports: Vec<(&String, &(CapabilityRef, Option<ReqKey>))> = space
            .iter()
            .filter(|(_, (_, local))| local.is_some())
            .collect();
        imports.sort_by(|a, b| a.0.cmp(b.0));

        // 包名 -> (期望来源, 产生期望的导入)
        let mut expected: HashMap<String, (CapabilityRef, ReqKey)> = HashMap::new();
        for (_, (cap, local)) in imports {
            let Some(import) = *local else {
                continue;
            };
            let Some(provider) = self.provider_for(batch, cap) else {
                continue;
            };
            for used in cap.capability().uses() {
                let Some(source) = self.package_source(batch, choices, &provider, &used) else {
                    continue;
                };
                if let Some((actual, local)) = space.get(&used) {
                    if *actual != source {
                        return Some(Conflict {
                            import,
                            local: *local,
                            package: used,
                            expected: source,
                        });
                    }
                }
                match expected.get(&used) {
                    Some((previous, _)) if *previous != source => {
                        return Some(Conflict {
                            import,
                            local: None,
                            package: used,
                            expected: previous.clone(),
                        });
                    }
                    Some(_) => {}
                    None => {
                        expected.insert(used, (source, import));
                    }
                }
            }
        }
        None
    }

    /// 一层 uses 约束检查，按需调整候选选择
    ///
    /// 返回第一个无法在排列上限内修复的宿主。
    fn check_uses(
        &self,
        batch: &Batch,
        choices: &mut BTreeMap<ReqKey, Choice>,
    ) -> Option<(RevisionId, ReportEntry)> {
        let max = self.config.max_uses_permutations.max(1);
        for id in &batch.alive {
            let Some(host) = batch.members.get(id) else {
                continue;
            };
            if host.is_fragment() {
                continue;
            }
            let mut attempts = 0;
            while let Some(conflict) = self.find_conflict(batch, choices, host) {
                attempts += 1;
                let fixed = attempts <= max && apply_fix(choices, &conflict);
                if !fixed {
                    let requirement = choices
                        .get(&conflict.import)
                        .map(|c| c.requirement.requirement().describe())
                        .unwrap_or_default();
                    let detail = format!("期望来源 {}", conflict.expected.revision());
                    return Some((
                        *id,
                        ReportEntry::UsesConstraintViolation {
                            requirement,
                            package: conflict.package,
                            detail,
                        },
                    ));
                }
            }
        }
        None
    }

    /// 能力被所在宿主导入替代时，改为该宿主导入的来源
    fn redirect(
        &self,
        batch: &Batch,
        choices: &BTreeMap<ReqKey, Choice>,
        substituted: &HashMap<RevisionId, BTreeSet<String>>,
        cap: &CapabilityRef,
    ) -> CapabilityRef {
        let mut current = cap.clone();
        for _ in 0..batch.members.len().max(1) {
            let Some(key) = current.capability().primary_key().map(str::to_string) else {
                break;
            };
            if current.capability().namespace() != namespace::PACKAGE {
                break;
            }
            let Some(provider) = self.provider_for(batch, &current) else {
                break;
            };
            if !substituted
                .get(&provider.id())
                .is_some_and(|s| s.contains(&key))
            {
                break;
            }
            match self
                .package_space(batch, choices, &provider)
                .remove(&key)
            {
                Some((next, Some(_))) if next != current => current = next,
                _ => break,
            }
        }
        current
    }

    /// 生成存活修订的连线状态并写入 overlay
    fn build(&mut self, batch: &Batch, choices: &BTreeMap<ReqKey, Choice>) {
        let hosts: Vec<Arc<ModuleRevision>> = batch
            .alive
            .iter()
            .filter_map(|id| batch.members.get(id))
            .filter(|r| !r.is_fragment())
            .cloned()
            .collect();

        let mut substituted: HashMap<RevisionId, BTreeSet<String>> = HashMap::new();
        for host in &hosts {
            let space = self.package_space(batch, choices, host);
            let own: BTreeSet<String> = batch
                .parts_of(host)
                .iter()
                .flat_map(|p| p.capabilities_in(namespace::PACKAGE))
                .filter_map(|c| c.capability().primary_key().map(str::to_string))
                .collect();
            let replaced: BTreeSet<String> = space
                .iter()
                .filter(|(pkg, (_, local))| local.is_some() && own.contains(*pkg))
                .map(|(pkg, _)| pkg.clone())
                .collect();
            if !replaced.is_empty() {
                substituted.insert(host.id(), replaced);
            }
        }

        let mut required: BTreeMap<RevisionId, Vec<Arc<Wire>>> = BTreeMap::new();
        let mut provided: BTreeMap<RevisionId, Vec<Arc<Wire>>> = BTreeMap::new();

        for host in &hosts {
            for part in batch.parts_of(host) {
                for req in part.requirement_refs() {
                    let Some(choice) = choices.get(&req.key()) else {
                        continue;
                    };
                    let selected: Vec<CapabilityRef> = if req.requirement().is_multiple() {
                        choice.options.clone()
                    } else {
                        choice
                            .selected()
                            .map(|c| vec![self.redirect(batch, choices, &substituted, c)])
                            .unwrap_or_default()
                    };
                    for cap in selected {
                        let Some(provider) = self.provider_for(batch, &cap) else {
                            continue;
                        };
                        if provider.id() == host.id() && cap.capability().namespace() == namespace::PACKAGE {
                            continue;
                        }
                        let wire = Arc::new(Wire::new(req.clone(), cap, host.clone(), provider.clone()));
                        required.entry(host.id()).or_default().push(wire.clone());
                        provided.entry(provider.id()).or_default().push(wire);
                    }
                }
            }
        }

        for fragment in batch
            .alive
            .iter()
            .filter_map(|id| batch.members.get(id))
            .filter(|r| r.is_fragment())
        {
            let Some(host_req) = fragment.host_requirement() else {
                continue;
            };
            for (host, cap) in batch.alive_hosts(fragment.id()) {
                let wire = Arc::new(Wire::new(host_req.clone(), cap, fragment.clone(), host.clone()));
                required.entry(fragment.id()).or_default().push(wire.clone());
                provided.entry(host.id()).or_default().push(wire);
            }
            self.overlay.put(ModuleWiring::new(
                fragment.clone(),
                fragment.capabilities_in(namespace::IDENTITY),
                vec![host_req],
                provided.remove(&fragment.id()).unwrap_or_default(),
                required.remove(&fragment.id()).unwrap_or_default(),
                BTreeSet::new(),
            ));
        }

        for host in &hosts {
            let replaced = substituted.remove(&host.id()).unwrap_or_default();
            let mut caps = Vec::new();
            let mut reqs = Vec::new();
            for part in batch.parts_of(host) {
                let is_fragment = part.is_fragment();
                for (index, cap) in part.capabilities().iter().enumerate() {
                    if !cap.is_effective() || (is_fragment && cap.namespace() == namespace::IDENTITY) {
                        continue;
                    }
                    if cap.namespace() == namespace::PACKAGE
                        && cap.primary_key().is_some_and(|k| replaced.contains(k))
                    {
                        continue;
                    }
                    caps.push(CapabilityRef::new(part.clone(), index));
                }
                reqs.extend(part.requirement_refs().into_iter().filter(|r| {
                    r.requirement().is_effective()
                        && !(is_fragment && r.requirement().namespace() == namespace::HOST)
                }));
            }
            self.overlay.put(ModuleWiring::new(
                host.clone(),
                caps,
                reqs,
                provided.remove(&host.id()).unwrap_or_default(),
                required.remove(&host.id()).unwrap_or_default(),
                replaced,
            ));
        }

        // 批次外已解析的提供方获得新的提供连线
        for (id, wires) in provided {
            match self.overlay.wiring(id).cloned() {
                Some(existing) => self.overlay.put(existing.with_provided(&wires)),
                None => trace!(revision = id, "提供方没有连线状态，忽略连线"),
            }
        }
    }
}

/// 尝试修复冲突：优先把本地导入切换到期望来源，否则推进产生冲突的导入
fn apply_fix(choices: &mut BTreeMap<ReqKey, Choice>, conflict: &Conflict) -> bool {
    if let Some(local) = conflict.local {
        if let Some(choice) = choices.get_mut(&local) {
            if let Some(pos) = choice.options.iter().position(|c| *c == conflict.expected) {
                if pos != choice.selected {
                    choice.selected = pos;
                    return true;
                }
            }
        }
    }
    match choices.get_mut(&conflict.import) {
        Some(choice) if choice.selected + 1 < choice.options.len() => {
            choice.selected += 1;
            true
        }
        _ => false,
    }
}
