//! 模块容器
//!
//! [`Container`] 编排安装、更新、卸载、解析、刷新与动态导入，并实现
//! [`LifecycleHost`] 供模块状态机回调。
//!
//! 解析遵循乐观并发：读取快照，在不持锁的情况下求解，按模块 ID 升序锁定新解析模块的
//! RESOLVED 状态变更锁，再由数据库核对时间戳后写入；时间戳已变化时释放全部锁并重试。
//! RESOLVED 事件在释放锁之后发布。

use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn, Instrument};

use super::events::{EventDispatcher, EventKind};
use super::locks::{InstallLocks, ResolutionPermits};
use super::start_level::{activation_order, persistent_start_options, StartLevels};
use crate::core::ContainerConfig;
use crate::database::{ApplyOutcome, Database, DependencyGraph, ModuleWiring, Wire};
use crate::module::{
    Module, ModuleId, ModuleRevision, ModuleState, ModuleWorker, OperationContext,
    RevisionBuilder, StartOptions, StopOptions, TransitionEvent, TransitionGuard,
    LifecycleHost, SYSTEM_MODULE_ID,
};
use crate::module::lifecycle::PendingEvents;
use crate::module_span;
use crate::resolver::hooks::narrow;
use crate::resolver::{CollisionHook, CollisionOperation, DynamicResolution, ResolutionReport, Resolver};
use crate::utils::{ContainerError, MetricsReport, ResolutionMetrics, Result};

/// 模块容器
pub struct Container {
    config: ContainerConfig,
    database: Arc<Database>,
    resolver: Resolver,
    collision_hook: Option<Arc<dyn CollisionHook>>,
    worker: Arc<dyn ModuleWorker>,
    events: EventDispatcher,
    metrics: ResolutionMetrics,
    permits: ResolutionPermits,
    install_locks: InstallLocks,
    start_levels: StartLevels,
    /// 系统模块是否处于停止状态
    stopped: watch::Sender<bool>,
    self_ref: Weak<Container>,
}

impl Container {
    pub(crate) fn new(
        config: ContainerConfig,
        database: Arc<Database>,
        resolver: Resolver,
        collision_hook: Option<Arc<dyn CollisionHook>>,
        worker: Arc<dyn ModuleWorker>,
        events: EventDispatcher,
    ) -> Arc<Self> {
        let permits = ResolutionPermits::new(config.locks.resolution_permits);
        let (stopped, _) = watch::channel(true);
        Arc::new_cyclic(|self_ref| Self {
            config,
            database,
            resolver,
            collision_hook,
            worker,
            events,
            metrics: ResolutionMetrics::new(),
            permits,
            install_locks: InstallLocks::new(),
            start_levels: StartLevels::new(),
            stopped,
            self_ref: self_ref.clone(),
        })
    }

    // ==================== 访问器 ====================

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.database
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }

    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    pub fn metrics(&self) -> &ResolutionMetrics {
        &self.metrics
    }

    pub fn metrics_report(&self) -> MetricsReport {
        self.metrics.export()
    }

    pub fn permits(&self) -> &ResolutionPermits {
        &self.permits
    }

    // ==================== 查询 ====================

    pub fn modules(&self) -> Vec<Arc<Module>> {
        self.database.modules()
    }

    pub fn module_by_id(&self, id: ModuleId) -> Option<Arc<Module>> {
        self.database.module_by_id(id)
    }

    pub fn module_by_location(&self, location: &str) -> Option<Arc<Module>> {
        self.database.module_by_location(location)
    }

    pub fn system_module(&self) -> Result<Arc<Module>> {
        self.database
            .module_by_id(SYSTEM_MODULE_ID)
            .ok_or_else(|| ContainerError::ModuleNotFound("系统模块".to_string()))
    }

    /// 模块当前修订的连线状态
    pub fn module_wiring(&self, module: &Module) -> Option<Arc<ModuleWiring>> {
        self.database.module_wiring(module)
    }

    pub fn removal_pending(&self) -> Vec<Arc<ModuleRevision>> {
        self.database.removal_pending()
    }

    pub fn dependency_closure(&self, modules: &[Arc<Module>]) -> BTreeSet<ModuleId> {
        let ids: Vec<ModuleId> = modules.iter().map(|m| m.id()).collect();
        self.database.dependency_closure(&ids)
    }

    pub fn dependency_graph(&self) -> DependencyGraph {
        self.database.dependency_graph()
    }

    /// (修订时间戳, 全量时间戳)
    pub fn timestamps(&self) -> (u64, u64) {
        (
            self.database.revisions_timestamp(),
            self.database.all_timestamp(),
        )
    }

    // ==================== 事件 ====================

    pub(crate) fn publish_event(&self, kind: EventKind, module: &Module) {
        self.events
            .publish_raw(kind, module.id(), module.location(), None);
    }

    pub(crate) fn publish_error(&self, module: &Module, err: &ContainerError) {
        self.events
            .publish_raw(EventKind::Error, module.id(), module.location(), Some(err.to_string()));
    }

    /// 发布状态变更期间记录的事件；调用时不得持有状态变更锁
    fn flush(&self, pending: PendingEvents) {
        pending.flush(|kind, module, message| {
            self.events
                .publish_raw(kind, module.id(), module.location(), message)
        });
    }

    // ==================== 安装 / 更新 / 卸载 ====================

    /// 安装模块
    ///
    /// 位置已安装时，若对 `origin` 可见则直接返回已有模块。
    pub async fn install(
        &self,
        origin: Option<&Arc<Module>>,
        location: &str,
        builder: RevisionBuilder,
    ) -> Result<Arc<Module>> {
        let span = module_span!("install", 0u64, location);
        async {
            let timeout = self.config.locks.install_lock_timeout();
            let _install = self
                .install_locks
                .lock(location, Some(builder.symbolic_name()), timeout)
                .await?;

            if let Some(existing) = self.database.module_by_location(location) {
                let visible = self
                    .collision_hook
                    .as_ref()
                    .map(|hook| hook.is_visible(origin.map(|o| o.as_ref()), &existing))
                    .unwrap_or(true);
                if !visible {
                    return Err(ContainerError::RejectedByHook(format!(
                        "位置 '{}' 上的模块对调用方不可见",
                        location
                    )));
                }
                debug!(module_id = existing.id(), "位置已安装，返回已有模块");
                return Ok(existing);
            }

            self.check_collisions(
                CollisionOperation::Installing,
                origin.map(|o| o.as_ref()),
                &builder,
                None,
            )?;

            let module = self.database.install(location, &builder)?;
            info!(module_id = module.id(), symbolic_name = %builder.symbolic_name(), "模块已安装");
            self.publish_event(EventKind::Installed, &module);
            Ok(module)
        }
        .instrument(span)
        .await
    }

    fn check_collisions(
        &self,
        operation: CollisionOperation,
        target: Option<&Module>,
        builder: &RevisionBuilder,
        exclude: Option<ModuleId>,
    ) -> Result<()> {
        let mut collisions =
            self.database
                .find_collisions(builder.symbolic_name(), builder.version(), exclude);
        if collisions.is_empty() {
            return Ok(());
        }
        if let Some(hook) = &self.collision_hook {
            narrow(&mut collisions, |m| m.id(), |list| {
                hook.filter_collisions(operation, target, list)
            });
        }
        if collisions.is_empty() {
            return Ok(());
        }
        Err(ContainerError::Collision {
            symbolic_name: builder.symbolic_name().to_string(),
            version: builder.version().to_string(),
            existing: collisions.iter().map(|m| m.id()).collect(),
        })
    }

    /// 更新模块
    ///
    /// 活动模块先停止，更新后以临时方式重新启动；重启失败只记录，不影响更新结果。
    pub async fn update(&self, module: &Arc<Module>, builder: RevisionBuilder) -> Result<()> {
        if module.id() == SYSTEM_MODULE_ID {
            return Err(ContainerError::InvalidState("系统模块不能更新".to_string()));
        }
        let span = module_span!("update", module.id(), module.location());
        async {
            let ctx = OperationContext::new("update");
            let _install = self
                .install_locks
                .lock(
                    module.location(),
                    Some(builder.symbolic_name()),
                    self.config.locks.install_lock_timeout(),
                )
                .await?;
            let guard = self.lock(&ctx, module, TransitionEvent::Updated).await?;
            if module.state() == ModuleState::Uninstalled {
                return Err(ContainerError::InvalidState(format!("模块 {} 已卸载", module)));
            }
            self.check_collisions(
                CollisionOperation::Updating,
                Some(module.as_ref()),
                &builder,
                Some(module.id()),
            )?;

            let mut pending = PendingEvents::new();
            let was_active = module.state().is_active_set();
            if was_active {
                if let Err(e) = module
                    .stop_deferred(&ctx, StopOptions::transient(), self, &mut pending)
                    .await
                {
                    warn!(error = %e, "更新前停止模块失败");
                    pending.push_error(module, &e);
                }
            }
            let was_resolved = module.state().is_resolved_set();
            let updated = self.database.update(module, &builder);
            drop(guard);
            self.flush(pending);
            updated?;

            if was_resolved {
                self.publish_event(EventKind::Unresolved, module);
            }
            self.publish_event(EventKind::Updated, module);

            if was_active {
                if let Err(e) = module
                    .start(&ctx, persistent_start_options(module), self)
                    .await
                {
                    warn!(error = %e, "更新后重新启动模块失败");
                    self.publish_error(module, &e);
                }
            }
            Ok(())
        }
        .instrument(span)
        .await
    }

    /// 卸载模块
    pub async fn uninstall(&self, module: &Arc<Module>) -> Result<()> {
        if module.id() == SYSTEM_MODULE_ID {
            return Err(ContainerError::InvalidState("系统模块不能卸载".to_string()));
        }
        let span = module_span!("uninstall", module.id(), module.location());
        async {
            let ctx = OperationContext::new("uninstall");
            let guard = self.lock(&ctx, module, TransitionEvent::Uninstalled).await?;
            if module.state() == ModuleState::Uninstalled {
                return Err(ContainerError::InvalidState(format!("模块 {} 已卸载", module)));
            }
            let mut pending = PendingEvents::new();
            if module.state().is_active_set() {
                if let Err(e) = module
                    .stop_deferred(&ctx, StopOptions::transient(), self, &mut pending)
                    .await
                {
                    warn!(error = %e, "卸载前停止模块失败");
                    pending.push_error(module, &e);
                }
            }
            let outcome = self.database.uninstall(module);
            drop(guard);
            self.flush(pending);
            let outcome = outcome?;

            if outcome.was_resolved {
                self.publish_event(EventKind::Unresolved, module);
            }
            self.publish_event(EventKind::Uninstalled, module);
            Ok(())
        }
        .instrument(span)
        .await
    }

    async fn lock(
        &self,
        ctx: &OperationContext,
        module: &Module,
        event: TransitionEvent,
    ) -> Result<TransitionGuard> {
        module
            .lock_state_change(ctx, event, self.config.locks.state_change_timeout())
            .await
    }

    // ==================== 解析 ====================

    /// 解析模块
    ///
    /// `modules` 为空时尝试解析全部未解析模块。`mandatory` 为真时任一模块未能解析即返回
    /// [`ContainerError::ResolutionFailed`]；否则未解析的模块保持 INSTALLED，原因记录在返回的报告中。
    pub async fn resolve(&self, modules: &[Arc<Module>], mandatory: bool) -> Result<ResolutionReport> {
        let ctx = OperationContext::new("resolve");
        self.resolve_in(&ctx, modules, mandatory, None).await
    }

    /// 解析驱动：快照、求解、加锁、写入，快照过期时重试
    pub(crate) async fn resolve_in(
        &self,
        ctx: &OperationContext,
        modules: &[Arc<Module>],
        mandatory: bool,
        skip_auto_start: Option<ModuleId>,
    ) -> Result<ResolutionReport> {
        let mut triggers = Vec::with_capacity(modules.len());
        for module in modules {
            match module.current_revision() {
                Some(revision) => triggers.push(revision),
                None if mandatory => {
                    return Err(ContainerError::InvalidState(format!("模块 {} 已卸载", module)));
                }
                None => {}
            }
        }
        if !modules.is_empty() && triggers.is_empty() {
            return Ok(ResolutionReport::new());
        }

        let _permit = self
            .permits
            .acquire(ctx, self.config.locks.resolution_permit_timeout())
            .await?;
        let started = Instant::now();
        let lock_deadline = started + self.config.locks.state_change_timeout();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let snapshot = self.database.snapshot();
            let outcome = match self.resolver.resolve(&snapshot, &triggers, mandatory) {
                Ok(outcome) => outcome,
                Err(e) => {
                    self.metrics
                        .record_cycle(false, started.elapsed().as_micros() as u64);
                    return Err(e);
                }
            };
            for _ in 0..outcome.batch_timeouts {
                self.metrics.record_batch_timeout();
            }
            if outcome.delta.is_empty() {
                self.metrics
                    .record_cycle(true, started.elapsed().as_micros() as u64);
                return Ok(outcome.report);
            }

            let newly: BTreeSet<ModuleId> = outcome
                .delta
                .newly_resolved(&snapshot)
                .iter()
                .map(|r| r.module_id())
                .collect();
            let guards = match self.lock_resolved(ctx, &newly, lock_deadline).await {
                Ok(guards) => guards,
                Err(e) if e.is_retryable() && Instant::now() < lock_deadline => {
                    self.metrics.record_contention_retry();
                    debug!(attempt, error = %e, "解析写入前锁竞争，重试");
                    continue;
                }
                Err(e) => return Err(e),
            };

            match self
                .database
                .apply_resolution(snapshot.timestamp(), &outcome.delta)?
            {
                ApplyOutcome::Stale { expected, actual } => {
                    drop(guards);
                    self.metrics.record_stale_retry();
                    debug!(attempt, expected, actual, "快照已过期，重新解析");
                }
                ApplyOutcome::Applied(resolved) => {
                    drop(guards);
                    self.metrics
                        .record_cycle(true, started.elapsed().as_micros() as u64);
                    let ordered = activation_order(&self.database.dependency_graph(), resolved);
                    for module in &ordered {
                        self.publish_event(EventKind::Resolved, module);
                    }
                    info!(
                        resolved = ordered.len(),
                        attempt,
                        elapsed_us = started.elapsed().as_micros() as u64,
                        "解析结果已应用"
                    );
                    if self.config.resolver.auto_start_on_resolve {
                        self.auto_start(ctx, &ordered, skip_auto_start).await;
                    }
                    return Ok(outcome.report);
                }
            }
        }
    }

    /// 按模块 ID 升序获取 RESOLVED 锁
    ///
    /// 上下文已持有除 STARTED 之外的事件时跳过该模块。
    async fn lock_resolved(
        &self,
        ctx: &OperationContext,
        modules: &BTreeSet<ModuleId>,
        deadline: Instant,
    ) -> Result<Vec<TransitionGuard>> {
        let timeout = self.config.locks.state_change_timeout();
        let wait = (timeout / 10).max(Duration::from_millis(10));
        let mut guards = Vec::with_capacity(modules.len());
        for id in modules {
            let Some(module) = self.database.module_by_id(*id) else {
                continue;
            };
            let held = module.held_transitions(ctx);
            if !held.is_empty() && !held.contains(&TransitionEvent::Started) {
                trace!(module_id = id, ?held, "上下文已持有状态锁，跳过 RESOLVED 锁");
                continue;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = wait.min(remaining).max(Duration::from_millis(1));
            guards.push(
                module
                    .lock_state_change(ctx, TransitionEvent::Resolved, wait)
                    .await?,
            );
        }
        Ok(guards)
    }

    /// 启动刚解析、带持久化启动标记的模块
    async fn auto_start(&self, ctx: &OperationContext, modules: &[Arc<Module>], skip: Option<ModuleId>) {
        let active_level = self.start_levels.active();
        for module in modules {
            if Some(module.id()) == skip
                || module.id() == SYSTEM_MODULE_ID
                || !module.settings().auto_start
                || module.start_level() > active_level
            {
                continue;
            }
            if let Err(e) = module
                .start(ctx, persistent_start_options(module), self)
                .await
            {
                warn!(module_id = module.id(), error = %e, "解析后自动启动失败");
                self.publish_error(module, &e);
            }
        }
    }

    /// 刷新模块
    ///
    /// 停止并取消解析依赖闭包（含等待移除修订的依赖方），随后重新解析并重启此前活动的模块。
    /// 闭包包含系统模块时改为异步停止整个系统。
    pub async fn refresh(&self, modules: &[Arc<Module>]) -> Result<()> {
        let ctx = OperationContext::new("refresh");
        let ids: Vec<ModuleId> = modules.iter().map(|m| m.id()).collect();
        let closure = self.database.dependency_closure(&ids);
        if closure.contains(&SYSTEM_MODULE_ID) {
            info!("刷新系统模块，异步停止容器");
            if let Some(container) = self.self_ref.upgrade() {
                tokio::spawn(async move {
                    if let Err(e) = container.stop_system().await {
                        error!(error = %e, "异步停止容器失败");
                    }
                });
            }
            return Ok(());
        }

        let members: Vec<Arc<Module>> = closure
            .iter()
            .filter_map(|id| self.database.module_by_id(*id))
            .collect();
        let graph = self.database.dependency_graph();
        let mut stop_order = activation_order(&graph, members.clone());
        stop_order.reverse();

        let mut guards = Vec::with_capacity(members.len());
        for module in &members {
            guards.push(self.lock(&ctx, module, TransitionEvent::Unresolved).await?);
        }

        let mut pending = PendingEvents::new();
        let previously_active: Vec<Arc<Module>> = stop_order
            .iter()
            .filter(|m| m.state().is_active_set())
            .cloned()
            .collect();
        for module in &previously_active {
            if let Err(e) = module
                .stop_deferred(&ctx, StopOptions::transient(), self, &mut pending)
                .await
            {
                warn!(module_id = module.id(), error = %e, "刷新时停止模块失败");
                pending.push_error(module, &e);
            }
        }
        let unresolved = self.database.unresolve(&stop_order);
        drop(guards);
        self.flush(pending);
        let unresolved = unresolved?;

        let unresolved_ids: BTreeSet<ModuleId> = unresolved.iter().map(|m| m.id()).collect();
        for module in stop_order.iter().filter(|m| unresolved_ids.contains(&m.id())) {
            self.publish_event(EventKind::Unresolved, module);
        }
        info!(closure = members.len(), unresolved = unresolved.len(), "刷新闭包已取消解析");

        if !members.is_empty() {
            self.resolve_in(&ctx, &members, false, None).await?;
        }

        let mut restart = previously_active;
        restart.reverse();
        for module in &restart {
            if module.state().is_active_set() {
                continue;
            }
            if let Err(e) = module
                .start(&ctx, persistent_start_options(module), self)
                .await
            {
                warn!(module_id = module.id(), error = %e, "刷新后重新启动模块失败");
                self.publish_error(module, &e);
            }
        }

        let system = self.system_module()?;
        self.publish_event(EventKind::Refreshed, &system);
        Ok(())
    }

    /// 动态导入
    ///
    /// 为已解析模块查找包 `package` 的提供方，返回连线；没有提供方时返回 `None`。
    /// 提供方处于延迟激活状态时触发其激活。
    pub async fn resolve_dynamic(&self, module: &Arc<Module>, package: &str) -> Result<Option<Arc<Wire>>> {
        let ctx = OperationContext::new("resolve-dynamic");
        let _permit = self
            .permits
            .acquire(&ctx, self.config.locks.resolution_permit_timeout())
            .await?;
        let lock_deadline = Instant::now() + self.config.locks.state_change_timeout();

        loop {
            let revision = module
                .current_revision()
                .ok_or_else(|| ContainerError::InvalidState(format!("模块 {} 已卸载", module)))?;
            let snapshot = self.database.snapshot();
            let (wire, delta) = match self.resolver.resolve_dynamic(&snapshot, &revision, package)? {
                DynamicResolution::Existing(wire) => {
                    self.metrics.record_dynamic(true);
                    return Ok(Some(wire));
                }
                DynamicResolution::Miss { cached: true } => {
                    self.metrics.record_dynamic_cached_miss();
                    return Ok(None);
                }
                DynamicResolution::Miss { cached: false } => {
                    self.metrics.record_dynamic(false);
                    return Ok(None);
                }
                DynamicResolution::New { wire, delta } => (wire, delta),
            };

            let newly: BTreeSet<ModuleId> = delta
                .newly_resolved(&snapshot)
                .iter()
                .map(|r| r.module_id())
                .collect();
            let guards = match self.lock_resolved(&ctx, &newly, lock_deadline).await {
                Ok(guards) => guards,
                Err(e) if e.is_retryable() && Instant::now() < lock_deadline => {
                    self.metrics.record_contention_retry();
                    continue;
                }
                Err(e) => return Err(e),
            };
            match self.database.apply_resolution(snapshot.timestamp(), &delta)? {
                ApplyOutcome::Stale { .. } => {
                    drop(guards);
                    self.metrics.record_stale_retry();
                }
                ApplyOutcome::Applied(resolved) => {
                    drop(guards);
                    for resolved in &resolved {
                        self.publish_event(EventKind::Resolved, resolved);
                    }
                    self.metrics.record_dynamic(true);
                    self.activate_provider(&ctx, &wire).await;
                    return Ok(Some(wire));
                }
            }
        }
    }

    async fn activate_provider(&self, ctx: &OperationContext, wire: &Wire) {
        let provider_module = wire.raw_provider().module_id();
        let Some(provider) = self.database.module_by_id(provider_module) else {
            return;
        };
        if provider.state() == ModuleState::LazyStarting {
            if let Err(e) = provider.start(ctx, StartOptions::lazy_trigger(), self).await {
                warn!(module_id = provider.id(), error = %e, "延迟激活失败");
                self.publish_error(&provider, &e);
            }
        }
    }

    // ==================== 生命周期 ====================

    /// 启动模块
    pub async fn start(&self, module: &Arc<Module>, options: StartOptions) -> Result<()> {
        let ctx = OperationContext::new("start");
        module
            .start(&ctx, options, self)
            .instrument(module_span!("start", module.id(), module.location()))
            .await
    }

    /// 停止模块
    pub async fn stop(&self, module: &Arc<Module>, options: StopOptions) -> Result<()> {
        let ctx = OperationContext::new("stop");
        module
            .stop(&ctx, options, self)
            .instrument(module_span!("stop", module.id(), module.location()))
            .await
    }

    /// 触发延迟激活：LAZY_STARTING 的模块完成真正的启动
    pub async fn trigger_lazy_activation(&self, module: &Arc<Module>) -> Result<()> {
        if module.state() != ModuleState::LazyStarting {
            return Ok(());
        }
        let ctx = OperationContext::new("lazy-activation");
        module.start(&ctx, StartOptions::lazy_trigger(), self).await
    }

    /// 标记模块在启动级别变化时可与同级模块并行启动
    pub fn set_parallel_activation(&self, module: &Module, enabled: bool) -> Result<()> {
        if module.update_settings(|s| s.parallel_activation = enabled) {
            self.database.settings_changed(module)?;
        }
        Ok(())
    }

    // ==================== 启动级别 ====================

    pub fn active_start_level(&self) -> u32 {
        self.start_levels.active()
    }

    /// 设置活动启动级别，逐级启动或停止模块
    pub async fn set_active_start_level(&self, level: u32) -> Result<()> {
        if self.start_levels.move_to(self, level).await? {
            self.publish_start_level_changed()?;
        }
        Ok(())
    }

    fn publish_start_level_changed(&self) -> Result<()> {
        let system = self.system_module()?;
        self.publish_event(EventKind::StartLevelChanged, &system);
        Ok(())
    }

    /// 设置模块启动级别
    ///
    /// 新级别不高于活动级别且带持久化启动标记时启动模块，高于活动级别时停止模块。
    pub async fn set_module_start_level(&self, module: &Arc<Module>, level: u32) -> Result<()> {
        if module.id() == SYSTEM_MODULE_ID {
            return Err(ContainerError::InvalidState("不能修改系统模块的启动级别".to_string()));
        }
        if level == 0 {
            return Err(ContainerError::InvalidState("模块启动级别必须大于 0".to_string()));
        }
        if module.state() == ModuleState::Uninstalled {
            return Err(ContainerError::InvalidState(format!("模块 {} 已卸载", module)));
        }
        self.database.set_start_level(module, level)?;
        self.publish_event(EventKind::StartLevelChanged, module);

        let active = self.active_start_level();
        if level <= active && module.settings().auto_start && !module.state().is_active_set() {
            let ctx = OperationContext::new("module-start-level");
            module.start(&ctx, persistent_start_options(module), self).await?;
        } else if level > active && module.state().is_active_set() {
            let ctx = OperationContext::new("module-start-level");
            module.stop(&ctx, StopOptions::transient(), self).await?;
        }
        Ok(())
    }

    // ==================== 系统模块 ====================

    /// 启动容器：解析并激活系统模块，然后提升到起始启动级别
    pub async fn launch(&self) -> Result<()> {
        let ctx = OperationContext::new("launch");
        let system = self.system_module()?;
        self.resolve_in(&ctx, std::slice::from_ref(&system), true, None)
            .await?;
        let mut pending = PendingEvents::new();
        {
            let _guard = self.lock(&ctx, &system, TransitionEvent::Started).await?;
            if system.state() != ModuleState::Active {
                system.set_state(ModuleState::Starting);
                pending.push(EventKind::Starting, &system);
                system.set_state(ModuleState::Active);
            }
        }
        pending.push(EventKind::Started, &system);
        self.flush(pending);
        self.stopped.send_replace(false);
        info!("容器已启动");
        self.set_active_start_level(self.config.start_level.beginning_start_level)
            .await
    }

    /// 停止容器：降到启动级别 0，持久化数据库，系统模块回到 RESOLVED
    pub async fn stop_system(&self) -> Result<()> {
        let ctx = OperationContext::new("stop-system");
        let system = self.system_module()?;
        if *self.stopped.borrow() {
            return Ok(());
        }
        let guard = self.lock(&ctx, &system, TransitionEvent::Stopped).await?;
        if *self.stopped.borrow() {
            return Ok(());
        }
        system.set_state(ModuleState::Stopping);
        let lowered = match self.start_levels.move_to(self, 0).await {
            Ok(changed) => changed,
            Err(e) => {
                error!(error = %e, "停止容器时降低启动级别失败");
                false
            }
        };
        if let Err(e) = self.store().await {
            error!(error = %e, "停止容器时持久化失败");
        }
        system.set_state(ModuleState::Resolved);
        self.stopped.send_replace(true);
        drop(guard);

        self.publish_event(EventKind::Stopping, &system);
        if lowered {
            self.publish_event(EventKind::StartLevelChanged, &system);
        }
        self.publish_event(EventKind::Stopped, &system);
        info!("容器已停止");
        Ok(())
    }

    /// 等待容器停止
    ///
    /// `timeout` 为零时无限等待。返回是否已停止。
    pub async fn wait_for_stop(&self, timeout: Duration) -> Result<bool> {
        let mut rx = self.stopped.subscribe();
        let wait = async move { rx.wait_for(|stopped| *stopped).await.map(|_| ()) };
        if timeout.is_zero() {
            wait.await
                .map_err(|_| ContainerError::Internal("停止通知通道已关闭".to_string()))?;
            return Ok(true);
        }
        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => {
                result.map_err(|_| ContainerError::Internal("停止通知通道已关闭".to_string()))?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    // ==================== 持久化 ====================

    /// 保存到配置的数据文件；未配置时不做任何操作
    pub async fn store(&self) -> Result<()> {
        match &self.config.storage.data_file {
            Some(path) => self.store_to(path).await,
            None => Ok(()),
        }
    }

    pub async fn store_to(&self, path: &Path) -> Result<()> {
        self.database
            .save(path, self.config.storage.persist_wirings)
            .await?;
        info!(path = %path.display(), "数据库已保存");
        Ok(())
    }
}

#[async_trait]
impl LifecycleHost for Container {
    async fn resolve_for_start(&self, ctx: &OperationContext, module: &Arc<Module>) -> Result<()> {
        self.resolve_in(ctx, std::slice::from_ref(module), true, Some(module.id()))
            .await
            .map(|_| ())
    }

    fn worker(&self) -> Arc<dyn ModuleWorker> {
        self.worker.clone()
    }

    fn publish(&self, kind: EventKind, module: &Module) {
        self.publish_event(kind, module);
    }

    fn state_change_timeout(&self) -> Duration {
        self.config.locks.state_change_timeout()
    }

    fn active_start_level(&self) -> u32 {
        self.start_levels.active()
    }

    fn settings_changed(&self, module: &Module) {
        if let Err(e) = self.database.settings_changed(module) {
            warn!(module_id = module.id(), error = %e, "记录设置变更失败");
        }
    }
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("modules", &self.database.modules().len())
            .field("active_start_level", &self.start_levels.active())
            .field("timestamps", &self.timestamps())
            .finish()
    }
}
