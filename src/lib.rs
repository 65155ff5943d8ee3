//! # Chips Container - 薯片模块容器
//!
//! 薯片模块容器负责模块的安装、依赖解析、连线与生命周期管理：
//!
//! - **模块数据库**: 已安装模块、修订与连线状态的唯一权威存储，带版本时间戳
//! - **解析器**: 候选过滤与排序、单例选择、片段附加、uses 约束、批次超时回退
//! - **乐观并发**: 快照求解、按固定顺序加锁、时间戳核对后写入，过期时重试
//! - **生命周期**: 模块状态机、状态变更锁、启动级别、生命周期事件
//! - **持久化**: bincode 编码的数据库存储
//!
//! ## 快速开始
//!
//! ```rust,no_run
//! use chips_container::{ContainerBuilder, ContainerConfig, RevisionBuilder};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let container = ContainerBuilder::new(ContainerConfig::default()).build().await?;
//!     container.launch().await?;
//!
//!     let a = container
//!         .install(None, "mem:a", RevisionBuilder::new("a", "1.0.0")?.export_package("p", "1.0.0")?)
//!         .await?;
//!     let b = container
//!         .install(None, "mem:b", RevisionBuilder::new("b", "1.0.0")?.import_package("p", None)?)
//!         .await?;
//!     container.resolve(&[b.clone()], true).await?;
//!     assert!(container.module_wiring(&a).is_some());
//!
//!     container.stop_system().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## 模块结构
//!
//! - `utils` - 错误类型、ID、日志与解析指标
//! - `core` - 容器配置
//! - `module` - 模块元数据、过滤器、修订、状态变更锁与状态机
//! - `database` - 能力索引、连线、依赖图、数据库与持久化
//! - `resolver` - 钩子、报告、候选与求解
//! - `container` - 事件、锁、启动级别与容器编排

#![warn(rustdoc::missing_crate_level_docs)]

pub mod container;
pub mod core;
pub mod database;
pub mod module;
pub mod resolver;
pub mod utils;

// 重导出常用类型，方便使用
pub use container::{
    Container, ContainerBuilder, ContainerEvent, ContainerListener, EventKind,
};

pub use module::{
    Capability, Filter, LifecycleHost, Module, ModuleId, ModuleRevision, ModuleSettings,
    ModuleState, ModuleWorker, NoopWorker, OperationContext, Requirement, RevisionBuilder,
    StartOptions, StopOptions, TransitionEvent,
};

pub use database::{Database, ModuleWiring, Wire};
pub use resolver::{CollisionHook, ResolutionReport, Resolver, ResolverHook};

pub use utils::{error_code, generate_id, generate_uuid, ContainerError, Result};
pub use utils::logger::{fields, LogGuard, Logger, LoggerConfig, LoggerConfigBuilder, RotationStrategy};

pub use core::config::{ContainerConfig, ContainerConfigBuilder, LogConfig};

/// 库版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// 持久化格式版本
pub use database::persistence::FORMAT_VERSION;
