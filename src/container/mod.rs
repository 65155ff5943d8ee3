//! 容器
//!
//! 包含容器编排与其依赖的组件：
//! - 生命周期事件分发
//! - 解析许可与安装锁
//! - 启动级别
//! - 容器构建器

#[allow(clippy::module_inception)]
pub mod container;
pub mod events;
pub mod locks;
mod start_level;

pub use container::Container;
pub use events::{ContainerEvent, ContainerListener, DispatchStats, EventDispatcher, EventKind};
pub use locks::{InstallLocks, PermitGuard, ResolutionPermits};

use std::sync::Arc;
use tracing::info;

use crate::core::ContainerConfig;
use crate::database::Database;
use crate::module::{ModuleWorker, NoopWorker, RevisionBuilder, SYSTEM_MODULE_ID};
use crate::resolver::{CollisionHook, Resolver, ResolverHook};
use crate::utils::Result;

/// 系统模块的符号名
pub const SYSTEM_SYMBOLIC_NAME: &str = "chips.container.system";

/// 容器构建器
///
/// # Example
///
/// ```rust
/// use chips_container::container::ContainerBuilder;
/// use chips_container::core::ContainerConfig;
///
/// #[tokio::main]
/// async fn main() {
///     let container = ContainerBuilder::new(ContainerConfig::default())
///         .system_package("chips.api", "1.0.0")
///         .build()
///         .await
///         .unwrap();
///     assert!(container.system_module().is_ok());
/// }
/// ```
pub struct ContainerBuilder {
    config: ContainerConfig,
    resolver_hooks: Vec<Arc<dyn ResolverHook>>,
    collision_hook: Option<Arc<dyn CollisionHook>>,
    worker: Arc<dyn ModuleWorker>,
    system_packages: Vec<(String, String)>,
    event_capacity: usize,
}

impl ContainerBuilder {
    pub fn new(config: ContainerConfig) -> Self {
        Self {
            config,
            resolver_hooks: Vec::new(),
            collision_hook: None,
            worker: Arc::new(NoopWorker),
            system_packages: Vec::new(),
            event_capacity: events::DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn resolver_hook(mut self, hook: Arc<dyn ResolverHook>) -> Self {
        self.resolver_hooks.push(hook);
        self
    }

    pub fn collision_hook(mut self, hook: Arc<dyn CollisionHook>) -> Self {
        self.collision_hook = Some(hook);
        self
    }

    /// 激活 / 停用回调
    pub fn worker(mut self, worker: Arc<dyn ModuleWorker>) -> Self {
        self.worker = worker;
        self
    }

    /// 系统模块导出的包
    pub fn system_package(mut self, package: impl Into<String>, version: impl Into<String>) -> Self {
        self.system_packages.push((package.into(), version.into()));
        self
    }

    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// 构建容器
    ///
    /// 配置了数据文件且文件存在时先加载持久化数据；数据库中没有系统模块时安装系统模块。
    pub async fn build(self) -> Result<Arc<Container>> {
        self.config.validate()?;
        let database = Arc::new(Database::new(
            self.config.start_level.initial_module_start_level,
        ));
        if let Some(path) = &self.config.storage.data_file {
            if tokio::fs::try_exists(path).await? {
                database.load(path).await?;
                info!(path = %path.display(), modules = database.modules().len(), "已加载持久化数据");
            }
        }
        if database.module_by_id(SYSTEM_MODULE_ID).is_none() {
            let mut system = RevisionBuilder::new(SYSTEM_SYMBOLIC_NAME, env!("CARGO_PKG_VERSION"))?;
            for (package, version) in &self.system_packages {
                system = system.export_package(package, version)?;
            }
            database.install_system(&system)?;
        }

        let mut resolver = Resolver::new(self.config.resolver.clone());
        for hook in self.resolver_hooks {
            resolver = resolver.with_hook(hook);
        }
        Ok(Container::new(
            self.config,
            database,
            resolver,
            self.collision_hook,
            self.worker,
            EventDispatcher::new(self.event_capacity),
        ))
    }
}
