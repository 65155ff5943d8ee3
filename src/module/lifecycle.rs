//! 模块生命周期
//!
//! [`Module`] 持有模块状态、持久化设置、修订历史和状态变更锁，并实现启动 / 停止状态机：
//!
//! ```text
//! INSTALLED → RESOLVED → {STARTING | LAZY_STARTING} → ACTIVE → STOPPING → RESOLVED
//! ```
//!
//! 激活与停用回调通过 [`ModuleWorker`] 注入；解析、事件发布等容器能力通过
//! [`LifecycleHost`] 提供。

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::metadata::{ActivationPolicy, ModuleId, ModuleSettings, ModuleState};
use super::revision::ModuleRevision;
use super::transition::{OperationContext, StateChangeLock, TransitionEvent, TransitionGuard};
use crate::container::events::EventKind;
use crate::utils::{ContainerError, Result};

/// 激活 / 停用回调
///
/// 回调失败不会让状态机停留在中间状态：启动失败回到 RESOLVED，停止失败同样结束于 RESOLVED，
/// 原始错误随后返回给调用方。
#[async_trait]
pub trait ModuleWorker: Send + Sync {
    /// 模块进入 STARTING 后调用
    async fn start(&self, module: &Module) -> anyhow::Result<()>;

    /// 模块进入 STOPPING 后调用
    async fn stop(&self, module: &Module) -> anyhow::Result<()>;
}

/// 不执行任何操作的回调
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopWorker;

#[async_trait]
impl ModuleWorker for NoopWorker {
    async fn start(&self, _module: &Module) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self, _module: &Module) -> anyhow::Result<()> {
        Ok(())
    }
}

/// 模块状态机依赖的容器能力
#[async_trait]
pub trait LifecycleHost: Send + Sync {
    /// 将模块作为必需触发器解析
    async fn resolve_for_start(&self, ctx: &OperationContext, module: &Arc<Module>) -> Result<()>;

    /// 激活回调
    fn worker(&self) -> Arc<dyn ModuleWorker>;

    /// 发布生命周期事件
    fn publish(&self, kind: EventKind, module: &Module);

    /// 状态变更锁等待时间
    fn state_change_timeout(&self) -> Duration;

    /// 当前活动启动级别
    fn active_start_level(&self) -> u32;

    /// 模块设置已变更
    fn settings_changed(&self, module: &Module);
}

/// 启动选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StartOptions {
    /// 不修改持久化启动标记
    pub transient: bool,
    /// 忽略延迟激活策略
    pub eager: bool,
    /// 由延迟激活触发的真实启动
    pub lazy_trigger: bool,
}

impl StartOptions {
    pub fn transient() -> Self {
        Self {
            transient: true,
            ..Self::default()
        }
    }

    pub fn eager() -> Self {
        Self {
            eager: true,
            ..Self::default()
        }
    }

    pub fn lazy_trigger() -> Self {
        Self {
            transient: true,
            lazy_trigger: true,
            ..Self::default()
        }
    }
}

/// 停止选项
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopOptions {
    /// 不清除持久化启动标记
    pub transient: bool,
}

impl StopOptions {
    pub fn transient() -> Self {
        Self { transient: true }
    }
}

/// 状态变更期间记录的事件
///
/// 持有状态变更锁时只记录，释放全部锁后再按记录顺序发布。
#[derive(Default)]
pub(crate) struct PendingEvents {
    events: Vec<(Arc<Module>, EventKind, Option<String>)>,
}

impl PendingEvents {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn push(&mut self, kind: EventKind, module: &Arc<Module>) {
        self.events.push((module.clone(), kind, None));
    }

    pub(crate) fn push_error(&mut self, module: &Arc<Module>, err: &ContainerError) {
        self.events
            .push((module.clone(), EventKind::Error, Some(err.to_string())));
    }

    /// 依次发布；调用方此时不得持有任何状态变更锁
    pub(crate) fn flush(self, mut publish: impl FnMut(EventKind, &Module, Option<String>)) {
        for (module, kind, message) in self.events {
            publish(kind, &module, message);
        }
    }
}

/// 已安装的模块
pub struct Module {
    id: ModuleId,
    location: String,
    state: RwLock<ModuleState>,
    settings: Mutex<ModuleSettings>,
    start_level: AtomicU32,
    last_modified: AtomicI64,
    /// 修订历史，最新的在末尾；仅在数据库写锁内修改
    revisions: RwLock<Vec<Arc<ModuleRevision>>>,
    transition: Arc<StateChangeLock>,
}

impl Module {
    pub(crate) fn new(
        id: ModuleId,
        location: impl Into<String>,
        start_level: u32,
        settings: ModuleSettings,
        last_modified: i64,
    ) -> Self {
        Self {
            id,
            location: location.into(),
            state: RwLock::new(ModuleState::Installed),
            settings: Mutex::new(settings),
            start_level: AtomicU32::new(start_level),
            last_modified: AtomicI64::new(last_modified),
            revisions: RwLock::new(Vec::new()),
            transition: Arc::new(StateChangeLock::new()),
        }
    }

    pub fn id(&self) -> ModuleId {
        self.id
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn state(&self) -> ModuleState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: ModuleState) {
        let mut current = self.state.write();
        if *current != state {
            debug!(module_id = self.id, from = %*current, to = %state, "模块状态变更");
            *current = state;
        }
    }

    pub fn settings(&self) -> ModuleSettings {
        *self.settings.lock()
    }

    pub(crate) fn update_settings(&self, f: impl FnOnce(&mut ModuleSettings)) -> bool {
        let mut settings = self.settings.lock();
        let before = *settings;
        f(&mut settings);
        before != *settings
    }

    pub fn start_level(&self) -> u32 {
        self.start_level.load(Ordering::Acquire)
    }

    pub(crate) fn set_start_level(&self, level: u32) {
        self.start_level.store(level, Ordering::Release);
    }

    /// 最后修改时间（Unix 毫秒）
    pub fn last_modified(&self) -> i64 {
        self.last_modified.load(Ordering::Acquire)
    }

    pub(crate) fn touch(&self) {
        self.last_modified
            .store(Utc::now().timestamp_millis(), Ordering::Release);
    }

    /// 当前修订；卸载后为 `None`
    pub fn current_revision(&self) -> Option<Arc<ModuleRevision>> {
        if self.state() == ModuleState::Uninstalled {
            return None;
        }
        self.revisions.read().last().cloned()
    }

    /// 最近一次修订，卸载后仍可查询
    pub fn latest_revision(&self) -> Option<Arc<ModuleRevision>> {
        self.revisions.read().last().cloned()
    }

    /// 仍被保留的全部修订（含等待移除的旧修订）
    pub fn revisions(&self) -> Vec<Arc<ModuleRevision>> {
        self.revisions.read().clone()
    }

    pub fn symbolic_name(&self) -> String {
        self.latest_revision()
            .map(|r| r.symbolic_name().to_string())
            .unwrap_or_default()
    }

    pub(crate) fn push_revision(&self, revision: Arc<ModuleRevision>) {
        self.revisions.write().push(revision);
    }

    /// 移除修订，返回是否已无任何修订
    pub(crate) fn remove_revision(&self, revision_id: u64) -> bool {
        let mut revisions = self.revisions.write();
        revisions.retain(|r| r.id() != revision_id);
        revisions.is_empty()
    }

    /// 获取本模块的状态变更锁
    pub async fn lock_state_change(
        &self,
        ctx: &OperationContext,
        event: TransitionEvent,
        timeout: Duration,
    ) -> Result<TransitionGuard> {
        let subject = self.to_string();
        self.transition.acquire(ctx, event, timeout, &subject).await
    }

    /// 指定上下文当前持有的状态变更事件
    pub fn held_transitions(&self, ctx: &OperationContext) -> Vec<TransitionEvent> {
        self.transition.held_by(ctx)
    }

    fn ensure_installed(&self) -> Result<()> {
        if self.state() == ModuleState::Uninstalled {
            return Err(ContainerError::InvalidState(format!("模块 {} 已卸载", self)));
        }
        Ok(())
    }

    /// 启动模块
    ///
    /// 生命周期事件在释放状态变更锁之后发布。
    pub async fn start(
        self: &Arc<Self>,
        ctx: &OperationContext,
        options: StartOptions,
        host: &dyn LifecycleHost,
    ) -> Result<()> {
        let mut pending = PendingEvents::new();
        let result = self.start_deferred(ctx, options, host, &mut pending).await;
        pending.flush(|kind, module, _| host.publish(kind, module));
        result
    }

    /// 启动模块，事件记录到 `pending` 由调用方在释放锁后发布
    pub(crate) async fn start_deferred(
        self: &Arc<Self>,
        ctx: &OperationContext,
        options: StartOptions,
        host: &dyn LifecycleHost,
        pending: &mut PendingEvents,
    ) -> Result<()> {
        let timeout = host.state_change_timeout();
        let mut guard = self
            .lock_state_change(ctx, TransitionEvent::Started, timeout)
            .await?;
        self.ensure_installed()?;

        if !options.transient {
            let changed = self.update_settings(|s| {
                s.auto_start = true;
                s.use_activation_policy = !options.eager;
            });
            if changed {
                host.settings_changed(self);
            }
        }

        let active_level = host.active_start_level();
        if self.start_level() > active_level {
            if options.transient {
                return Err(ContainerError::StartLevelNotMet {
                    module: self.to_string(),
                    module_level: self.start_level(),
                    active_level,
                });
            }
            debug!(module_id = self.id, "启动级别未满足，仅记录持久化启动标记");
            return Ok(());
        }

        if self.state() == ModuleState::Active {
            return Ok(());
        }

        if self.state() == ModuleState::Installed {
            drop(guard);
            host.resolve_for_start(ctx, self).await?;
            guard = self
                .lock_state_change(ctx, TransitionEvent::Started, timeout)
                .await?;
            self.ensure_installed()?;
            match self.state() {
                ModuleState::Active => return Ok(()),
                ModuleState::Installed => {
                    return Err(ContainerError::InvalidState(format!(
                        "模块 {} 在解析后被并发取消解析",
                        self
                    )))
                }
                _ => {}
            }
        }

        let revision = self
            .current_revision()
            .ok_or_else(|| ContainerError::InvalidState(format!("模块 {} 没有当前修订", self)))?;
        let lazy = revision.activation_policy() == ActivationPolicy::Lazy
            && !options.eager
            && !options.lazy_trigger;
        if lazy {
            if self.state() != ModuleState::LazyStarting {
                self.set_state(ModuleState::LazyStarting);
                pending.push(EventKind::LazyActivation, self);
                info!(module_id = self.id, "模块等待延迟激活");
            }
            return Ok(());
        }

        self.set_state(ModuleState::Starting);
        pending.push(EventKind::Starting, self);

        let worker = host.worker();
        match worker.start(self).await {
            Ok(()) => {
                self.set_state(ModuleState::Active);
                drop(guard);
                info!(module_id = self.id, location = %self.location, "模块已启动");
                pending.push(EventKind::Started, self);
                Ok(())
            }
            Err(source) => {
                warn!(module_id = self.id, error = %source, "激活回调失败，回滚到 RESOLVED");
                self.set_state(ModuleState::Stopping);
                pending.push(EventKind::Stopping, self);
                self.set_state(ModuleState::Resolved);
                drop(guard);
                pending.push(EventKind::Stopped, self);
                Err(ContainerError::WorkerFailed {
                    module: self.to_string(),
                    transition: TransitionEvent::Started,
                    source,
                })
            }
        }
    }

    /// 停止模块
    pub async fn stop(
        self: &Arc<Self>,
        ctx: &OperationContext,
        options: StopOptions,
        host: &dyn LifecycleHost,
    ) -> Result<()> {
        let mut pending = PendingEvents::new();
        let result = self.stop_deferred(ctx, options, host, &mut pending).await;
        pending.flush(|kind, module, _| host.publish(kind, module));
        result
    }

    /// 停止模块，事件记录到 `pending`
    ///
    /// 在更新、卸载、刷新持有外层状态锁时调用。
    pub(crate) async fn stop_deferred(
        self: &Arc<Self>,
        ctx: &OperationContext,
        options: StopOptions,
        host: &dyn LifecycleHost,
        pending: &mut PendingEvents,
    ) -> Result<()> {
        let guard = self
            .lock_state_change(ctx, TransitionEvent::Stopped, host.state_change_timeout())
            .await?;
        self.ensure_installed()?;

        if !options.transient && self.update_settings(|s| s.auto_start = false) {
            host.settings_changed(self);
        }

        let previous = self.state();
        if !previous.is_active_set() {
            return Ok(());
        }

        self.set_state(ModuleState::Stopping);
        pending.push(EventKind::Stopping, self);

        let result = if previous == ModuleState::LazyStarting {
            Ok(())
        } else {
            host.worker().stop(self).await
        };

        self.set_state(ModuleState::Resolved);
        drop(guard);
        info!(module_id = self.id, location = %self.location, "模块已停止");
        pending.push(EventKind::Stopped, self);

        result.map_err(|source| ContainerError::WorkerFailed {
            module: self.to_string(),
            transition: TransitionEvent::Stopped,
            source,
        })
    }
}

impl fmt::Display for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.location, self.id)
    }
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("id", &self.id)
            .field("location", &self.location)
            .field("state", &self.state())
            .field("start_level", &self.start_level())
            .finish()
    }
}
