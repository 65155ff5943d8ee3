//! 解析器
//!
//! 解析器是纯函数：输入数据库快照与触发修订，输出连线变化与报告，不修改数据库。
//! 容器负责获取解析许可、锁定模块状态并以乐观并发方式写回结果。
//!
//! 解析步骤：
//! 1. 解析钩子 `begin`，可拒绝本轮解析
//! 2. `filter_resolvable` 缩小可解析集合，被排除的修订记入报告
//! 3. 单例选择：同名单例中选择最高版本，已解析的单例不会被替换
//! 4. 无负载片段附加到允许运行期附加的已解析宿主
//! 5. 必需触发器一次求解，失败则整体报错；成功后其余未解析修订作为可选修订分批求解，
//!    批次超时后逐个求解

mod candidates;
pub mod hooks;
pub mod report;
mod solver;

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::core::ResolverConfig;
use crate::database::{Snapshot, Wire, WiringDelta};
use crate::module::metadata::namespace;
use crate::module::{CapabilityRef, ModuleRevision, RevisionId};
use crate::utils::{ContainerError, Result};

use candidates::{is_provided, Candidates, Overlay};
use hooks::narrow;
use solver::Session;

pub use hooks::{CollisionHook, CollisionOperation, ResolverHook};
pub use report::{ReportEntry, ResolutionReport, RevisionReport};

/// 一轮解析的结果
#[derive(Debug, Default)]
pub struct ResolutionOutcome {
    /// 需要写入数据库的连线状态
    pub delta: WiringDelta,
    pub report: ResolutionReport,
    /// 超时后回退为逐个解析的批次数
    pub batch_timeouts: u64,
    /// 未能解析的触发修订
    pub unresolved_triggers: Vec<Arc<ModuleRevision>>,
}

/// 动态导入的解析结果
#[derive(Debug)]
pub enum DynamicResolution {
    /// 包已经连线
    Existing(Arc<Wire>),
    /// 新建的连线及需要写入的连线状态
    New { wire: Arc<Wire>, delta: WiringDelta },
    /// 没有可用的提供方；`cached` 表示命中未命中缓存
    Miss { cached: bool },
}

/// 解析钩子的作用域，离开时调用全部钩子的 `end`
struct HookScope<'a> {
    hooks: &'a [Arc<dyn ResolverHook>],
}

impl<'a> HookScope<'a> {
    fn begin(hooks: &'a [Arc<dyn ResolverHook>], triggers: &[Arc<ModuleRevision>]) -> Result<Self> {
        for (i, hook) in hooks.iter().enumerate() {
            if let Err(e) = hook.begin(triggers) {
                for started in &hooks[..i] {
                    started.end();
                }
                return Err(ContainerError::RejectedByHook(e.to_string()));
            }
        }
        Ok(Self { hooks })
    }
}

impl Drop for HookScope<'_> {
    fn drop(&mut self) {
        for hook in self.hooks {
            hook.end();
        }
    }
}

/// 解析器
pub struct Resolver {
    config: ResolverConfig,
    batch_timeout: Option<Duration>,
    hooks: Vec<Arc<dyn ResolverHook>>,
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self {
            batch_timeout: config.batch_timeout(),
            config,
            hooks: Vec::new(),
        }
    }

    pub fn with_hook(mut self, hook: Arc<dyn ResolverHook>) -> Self {
        self.hooks.push(hook);
        self
    }

    /// 覆盖批次超时；`Some(Duration::ZERO)` 使每个批次立即取消
    pub fn with_batch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.batch_timeout = timeout;
        self
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub fn hooks(&self) -> &[Arc<dyn ResolverHook>] {
        &self.hooks
    }

    /// 解析
    ///
    /// `triggers` 为空时尝试解析全部未解析修订（可选）。`mandatory` 为真时
    /// 触发修订必须全部解析，否则返回 [`ContainerError::ResolutionFailed`]，不产生任何连线；
    /// 全部解析后其余未解析修订也会尝试解析，失败只记入报告。
    pub fn resolve(
        &self,
        snapshot: &Snapshot,
        triggers: &[Arc<ModuleRevision>],
        mandatory: bool,
    ) -> Result<ResolutionOutcome> {
        let started = Instant::now();
        let unresolved: HashSet<RevisionId> = snapshot.unresolved().iter().map(|r| r.id()).collect();
        let trigger_list: Vec<Arc<ModuleRevision>> = if triggers.is_empty() {
            snapshot.unresolved().to_vec()
        } else {
            triggers
                .iter()
                .filter(|t| !snapshot.is_resolved(t.id()))
                .cloned()
                .collect()
        };
        if mandatory {
            if let Some(stale) = trigger_list.iter().find(|t| !unresolved.contains(&t.id())) {
                return Err(ContainerError::InvalidState(format!(
                    "修订 {} 不是模块的当前修订",
                    stale
                )));
            }
        }

        let _scope = HookScope::begin(&self.hooks, &trigger_list)?;
        let mut session = self.session(snapshot);
        session.attach_to_resolved_hosts(&trigger_list);

        let mut batch_timeouts = 0;
        if mandatory {
            let pending: Vec<Arc<ModuleRevision>> = trigger_list
                .iter()
                .filter(|t| !session.is_resolved(t.id()))
                .cloned()
                .collect();
            if !pending.is_empty() && session.solve(&pending, None).is_err() {
                warn!("无超时的批次不应被取消");
            }
            let failed: Vec<String> = trigger_list
                .iter()
                .filter(|t| !session.is_resolved(t.id()))
                .map(|t| t.to_string())
                .collect();
            if !failed.is_empty() {
                debug!(report = %session.report, "必需修订解析失败");
                return Err(ContainerError::ResolutionFailed {
                    message: format!("必需修订未能解析: {}", failed.join(", ")),
                    report: session.report,
                });
            }

            // 必需触发器成功后，其余未解析修订作为可选修订尝试解析
            let triggered: HashSet<RevisionId> = trigger_list.iter().map(|t| t.id()).collect();
            let optional: Vec<Arc<ModuleRevision>> = snapshot
                .unresolved()
                .iter()
                .filter(|r| !triggered.contains(&r.id()))
                .cloned()
                .collect();
            batch_timeouts += self.solve_in_batches(&mut session, &optional);
        } else {
            batch_timeouts += self.solve_in_batches(&mut session, &trigger_list);
        }

        let unresolved_triggers: Vec<Arc<ModuleRevision>> = trigger_list
            .iter()
            .filter(|t| !session.is_resolved(t.id()))
            .cloned()
            .collect();
        let report = session.report;
        let delta = session.overlay.into_delta();
        info!(
            triggers = trigger_list.len(),
            wirings = delta.wirings.len(),
            unresolved = unresolved_triggers.len(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "解析完成"
        );
        Ok(ResolutionOutcome {
            delta,
            report,
            batch_timeouts,
            unresolved_triggers,
        })
    }

    /// 分批求解可选修订，返回超时的批次数
    ///
    /// 批次超时后取消该批次，改为逐个求解；单个修订失败只记入报告。
    fn solve_in_batches(&self, session: &mut Session<'_>, revisions: &[Arc<ModuleRevision>]) -> u64 {
        let mut batch_timeouts = 0;
        for chunk in revisions.chunks(self.config.batch_size.max(1)) {
            let targets: Vec<Arc<ModuleRevision>> = chunk
                .iter()
                .filter(|t| !session.is_resolved(t.id()))
                .cloned()
                .collect();
            if targets.is_empty() {
                continue;
            }
            let deadline = self.batch_timeout.map(|t| Instant::now() + t);
            if session.solve(&targets, deadline).is_err() {
                batch_timeouts += 1;
                warn!(
                    batch = targets.len(),
                    timeout_ms = self.batch_timeout.map(|t| t.as_millis() as u64).unwrap_or(0),
                    "批次解析超时，回退为逐个解析"
                );
                for target in targets {
                    if !session.is_resolved(target.id()) {
                        let _ = session.solve(std::slice::from_ref(&target), None);
                    }
                }
            }
        }
        batch_timeouts
    }

    /// 动态导入：为已解析修订 `revision` 查找包 `package` 的提供方
    ///
    /// 提供方尚未解析时先解析提供方。没有提供方时在修订的连线状态上记录未命中，
    /// 直到修订时间戳变化前不再重复查找。
    pub fn resolve_dynamic(
        &self,
        snapshot: &Snapshot,
        revision: &Arc<ModuleRevision>,
        package: &str,
    ) -> Result<DynamicResolution> {
        let Some(wiring) = snapshot.wiring(revision.id()).cloned() else {
            return Err(ContainerError::InvalidState(format!(
                "修订 {} 尚未解析，不能动态导入",
                revision
            )));
        };
        if let Some(wire) = wiring.imported_package(package) {
            return Ok(DynamicResolution::Existing(wire));
        }
        let exports_locally = wiring
            .capabilities_in(namespace::PACKAGE)
            .iter()
            .any(|c| c.capability().primary_key() == Some(package));
        if exports_locally {
            return Ok(DynamicResolution::Miss { cached: false });
        }
        if self.config.dynamic_miss_cache && wiring.is_dynamic_miss(package, snapshot.timestamp()) {
            return Ok(DynamicResolution::Miss { cached: true });
        }

        let dynamic_reqs: Vec<_> = wiring
            .requirements()
            .iter()
            .filter(|r| r.requirement().is_dynamic() && r.requirement().namespace() == namespace::PACKAGE)
            .cloned()
            .collect();

        if !dynamic_reqs.is_empty() {
            let _scope = HookScope::begin(&self.hooks, std::slice::from_ref(revision))?;
            let mut session = self.session(snapshot);
            let host = wiring.revision().clone();

            for req in &dynamic_reqs {
                let mut found: Vec<CapabilityRef> = session
                    .candidates
                    .index()
                    .capabilities_with_key(namespace::PACKAGE, package)
                    .into_iter()
                    .filter(|cap| {
                        cap.revision().module_id() != host.module_id()
                            && !session.candidates.is_disabled(cap.revision().id())
                            && req.requirement().matches(cap.capability())
                            && is_provided(&session.overlay, cap)
                    })
                    .collect();
                session
                    .candidates
                    .filter_and_sort(&session.overlay, req, &mut found);

                for cap in found {
                    let provider_rev = cap.revision().clone();
                    if !session.is_resolved(provider_rev.id()) {
                        if !session.in_pool(provider_rev.id()) {
                            continue;
                        }
                        let _ = session.solve(std::slice::from_ref(&provider_rev), None);
                        if !session.is_resolved(provider_rev.id()) {
                            continue;
                        }
                    }
                    let Some(provider) = session.overlay.resolved_provider(&cap) else {
                        continue;
                    };
                    let (Some(requirer_wiring), Some(provider_wiring)) = (
                        session.overlay.wiring(host.id()).cloned(),
                        session.overlay.wiring(provider.id()).cloned(),
                    ) else {
                        continue;
                    };
                    let wire = Arc::new(Wire::new(req.clone(), cap, host.clone(), provider.clone()));
                    session.overlay.put(requirer_wiring.with_required(&[wire.clone()]));
                    session.overlay.put(provider_wiring.with_provided(&[wire.clone()]));
                    debug!(revision = %host, package, provider = %provider, "动态导入已连线");
                    return Ok(DynamicResolution::New {
                        wire,
                        delta: session.overlay.into_delta(),
                    });
                }
            }
        }

        if self.config.dynamic_miss_cache {
            wiring.record_dynamic_miss(package, snapshot.timestamp());
        }
        debug!(revision = %revision, package, "动态导入没有可用的提供方");
        Ok(DynamicResolution::Miss { cached: false })
    }

    /// 准备求解会话：钩子过滤、单例选择
    fn session<'a>(&'a self, snapshot: &'a Snapshot) -> Session<'a> {
        let mut report = ResolutionReport::new();
        let mut resolvable: Vec<Arc<ModuleRevision>> = snapshot.unresolved().to_vec();
        for hook in &self.hooks {
            narrow(&mut resolvable, |r| r.id(), |v| hook.filter_resolvable(v));
        }
        let enabled: HashSet<RevisionId> = resolvable.iter().map(|r| r.id()).collect();
        let mut disabled = HashSet::new();
        for rev in snapshot.unresolved() {
            if !enabled.contains(&rev.id()) {
                disabled.insert(rev.id());
                report.add(rev, ReportEntry::FilteredByResolverHook);
            }
        }

        self.select_singletons(snapshot, &enabled, &mut disabled, &mut report);

        let pool: BTreeMap<RevisionId, Arc<ModuleRevision>> = resolvable
            .into_iter()
            .filter(|r| !disabled.contains(&r.id()))
            .map(|r| (r.id(), r))
            .collect();
        let overlay = Overlay::new(snapshot.wirings().clone());
        let candidates = Candidates::new(snapshot.index(), &self.hooks, disabled);
        let mut session = Session::new(overlay, candidates, pool, &self.config);
        session.report = report;
        session
    }

    /// 单例选择
    ///
    /// 同名单例按版本降序、安装 ID 升序依次选择；与已选择者（包括已解析的单例）
    /// 冲突的候选被禁用，并记录选中的一方。
    fn select_singletons(
        &self,
        snapshot: &Snapshot,
        enabled: &HashSet<RevisionId>,
        disabled: &mut HashSet<RevisionId>,
        report: &mut ResolutionReport,
    ) {
        let mut by_name: BTreeMap<String, Vec<CapabilityRef>> = BTreeMap::new();
        for cap in snapshot.index().capabilities_in(namespace::IDENTITY) {
            if !cap.capability().is_singleton() {
                continue;
            }
            if let Some(name) = cap.capability().primary_key() {
                by_name.entry(name.to_string()).or_default().push(cap.clone());
            }
        }

        for (name, caps) in by_name {
            if caps.len() < 2 {
                continue;
            }
            let mut selected: Vec<CapabilityRef> = caps
                .iter()
                .filter(|c| snapshot.is_resolved(c.revision().id()))
                .cloned()
                .collect();
            let mut pending: Vec<CapabilityRef> = caps
                .iter()
                .filter(|c| {
                    let id = c.revision().id();
                    !snapshot.is_resolved(id) && enabled.contains(&id) && !disabled.contains(&id)
                })
                .cloned()
                .collect();
            pending.sort_by_cached_key(|c| (Reverse(c.revision().version().clone()), c.revision().module_id()));

            let mut collisions: BTreeMap<RevisionId, Vec<CapabilityRef>> = BTreeMap::new();
            for cap in &pending {
                let mut others: Vec<CapabilityRef> = caps.iter().filter(|c| *c != cap).cloned().collect();
                for hook in &self.hooks {
                    narrow(&mut others, |c| c.key(), |v| hook.filter_singleton_collisions(cap, v));
                }
                collisions.insert(cap.revision().id(), others);
            }
            let collides = |a: &CapabilityRef, b: &CapabilityRef| {
                let listed = |x: &CapabilityRef, y: &CapabilityRef| {
                    collisions
                        .get(&x.revision().id())
                        .is_some_and(|list| list.contains(y))
                };
                listed(a, b) || listed(b, a)
            };

            for cap in pending {
                match selected.iter().find(|s| collides(&cap, *s)) {
                    Some(winner) => {
                        debug!(singleton = %name, loser = %cap.revision(), winner = %winner.revision(), "单例选择");
                        disabled.insert(cap.revision().id());
                        report.add(
                            cap.revision(),
                            ReportEntry::SingletonSelection {
                                winner: winner.revision().to_string(),
                            },
                        );
                    }
                    None => selected.push(cap),
                }
            }
        }
    }
}
