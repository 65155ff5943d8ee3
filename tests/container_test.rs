//! 容器安装、更新、卸载、刷新与动态导入集成测试

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

use chips_container::resolver::{CollisionOperation, ReportEntry};
use chips_container::{
    CollisionHook, Container, ContainerBuilder, ContainerConfig, ContainerError, ContainerEvent,
    EventKind, Module, ModuleId, ModuleState, RevisionBuilder, StartOptions,
};

async fn launched(builder: ContainerBuilder) -> Arc<Container> {
    let container = builder.build().await.unwrap();
    container.launch().await.unwrap();
    container
}

async fn default_container() -> Arc<Container> {
    launched(ContainerBuilder::new(ContainerConfig::default())).await
}

fn exporter(name: &str, version: &str, package: &str) -> RevisionBuilder {
    RevisionBuilder::new(name, version)
        .unwrap()
        .export_package(package, version)
        .unwrap()
}

fn importer(name: &str, package: &str) -> RevisionBuilder {
    RevisionBuilder::new(name, "1.0.0")
        .unwrap()
        .import_package(package, None)
        .unwrap()
}

/// 记录 (事件类型, 模块 ID) 序列
fn record_events(container: &Container) -> Arc<Mutex<Vec<(EventKind, ModuleId)>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    container
        .events()
        .add_listener(move |event: &ContainerEvent| sink.lock().push((event.kind, event.module_id)));
    log
}

fn kinds_for(log: &Mutex<Vec<(EventKind, ModuleId)>>, id: ModuleId) -> Vec<EventKind> {
    log.lock()
        .iter()
        .filter(|(_, m)| *m == id)
        .map(|(k, _)| *k)
        .collect()
}

/// 测试导出方与导入方连线、卸载后等待移除、刷新后清理
#[tokio::test]
async fn test_wire_removal_pending_and_refresh_cleanup() {
    let container = default_container().await;
    let a = container.install(None, "mem:a", exporter("a", "1.0.0", "p")).await.unwrap();
    let b = container.install(None, "mem:b", importer("b", "p")).await.unwrap();

    container.resolve(&[b.clone()], true).await.unwrap();
    assert_eq!(a.state(), ModuleState::Resolved);
    assert_eq!(b.state(), ModuleState::Resolved);

    let wiring = container.module_wiring(&b).unwrap();
    let wires = wiring.required_wires_in("package");
    assert_eq!(wires.len(), 1);
    assert_eq!(wires[0].provider().unwrap().module_id(), a.id());

    container.uninstall(&a).await.unwrap();
    assert_eq!(a.state(), ModuleState::Uninstalled);
    let pending = container.removal_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].module_id(), a.id());
    // 依赖方保持已解析，仍连接到旧修订
    assert_eq!(b.state(), ModuleState::Resolved);
    assert!(container.module_wiring(&b).unwrap().is_valid());

    container.refresh(&[b.clone()]).await.unwrap();
    assert!(container.removal_pending().is_empty());
    // 没有提供方后 b 无法重新解析
    assert_eq!(b.state(), ModuleState::Installed);
    assert!(container.module_wiring(&b).is_none());
}

/// 测试同一位置重复安装返回已有模块
#[tokio::test]
async fn test_install_same_location_returns_existing() {
    let container = default_container().await;
    let first = container.install(None, "mem:a", exporter("a", "1.0.0", "p")).await.unwrap();
    let second = container.install(None, "mem:a", exporter("other", "2.0.0", "q")).await.unwrap();
    assert_eq!(first.id(), second.id());
    assert_eq!(second.symbolic_name(), "a");
}

struct AllowAll;

impl CollisionHook for AllowAll {
    fn filter_collisions(
        &self,
        _operation: CollisionOperation,
        _target: Option<&Module>,
        collisions: &mut Vec<Arc<Module>>,
    ) {
        collisions.clear();
    }
}

/// 测试同名同版本安装冲突与钩子放行
#[tokio::test]
async fn test_install_collision() {
    let container = default_container().await;
    let a = container.install(None, "mem:a", exporter("a", "1.0.0", "p")).await.unwrap();
    let err = container
        .install(None, "mem:a-copy", exporter("a", "1.0.0", "p"))
        .await
        .unwrap_err();
    match err {
        ContainerError::Collision { symbolic_name, existing, .. } => {
            assert_eq!(symbolic_name, "a");
            assert_eq!(existing, vec![a.id()]);
        }
        other => panic!("unexpected error: {other}"),
    }
    // 不同版本不冲突
    assert!(container
        .install(None, "mem:a2", exporter("a", "2.0.0", "p"))
        .await
        .is_ok());

    let permissive = launched(
        ContainerBuilder::new(ContainerConfig::default()).collision_hook(Arc::new(AllowAll)),
    )
    .await;
    permissive.install(None, "mem:a", exporter("a", "1.0.0", "p")).await.unwrap();
    assert!(permissive
        .install(None, "mem:a-copy", exporter("a", "1.0.0", "p"))
        .await
        .is_ok());
}

struct Invisible;

impl CollisionHook for Invisible {
    fn is_visible(&self, origin: Option<&Module>, _existing: &Module) -> bool {
        origin.is_none()
    }
}

/// 测试已有模块对源模块不可见时拒绝安装
#[tokio::test]
async fn test_install_existing_not_visible() {
    let container =
        launched(ContainerBuilder::new(ContainerConfig::default()).collision_hook(Arc::new(Invisible)))
            .await;
    let origin = container.install(None, "mem:origin", exporter("o", "1.0.0", "o")).await.unwrap();
    container.install(None, "mem:a", exporter("a", "1.0.0", "p")).await.unwrap();

    let err = container
        .install(Some(&origin), "mem:a", exporter("a", "1.0.0", "p"))
        .await
        .unwrap_err();
    assert!(matches!(err, ContainerError::RejectedByHook(_)));
    assert!(container.install(None, "mem:a", exporter("a", "1.0.0", "p")).await.is_ok());
}

/// 测试更新活动模块：停止、取消解析、更新、重新解析并启动
#[tokio::test]
async fn test_update_active_module() {
    let container = default_container().await;
    let a = container.install(None, "mem:a", exporter("a", "1.0.0", "p")).await.unwrap();
    container.start(&a, StartOptions::default()).await.unwrap();
    assert_eq!(a.state(), ModuleState::Active);

    let log = record_events(&container);
    container.update(&a, exporter("a", "2.0.0", "p")).await.unwrap();

    assert_eq!(a.state(), ModuleState::Active);
    assert_eq!(a.current_revision().unwrap().version().to_string(), "2.0.0");
    assert_eq!(
        kinds_for(&log, a.id()),
        vec![
            EventKind::Stopping,
            EventKind::Stopped,
            EventKind::Unresolved,
            EventKind::Updated,
            EventKind::Resolved,
            EventKind::Starting,
            EventKind::Started,
        ]
    );
    // 旧修订没有依赖方，不等待移除
    assert!(container.removal_pending().is_empty());
}

/// 测试更新仍被使用的模块时旧修订等待移除
#[tokio::test]
async fn test_update_keeps_old_revision_for_dependents() {
    let container = default_container().await;
    let a = container.install(None, "mem:a", exporter("a", "1.0.0", "p")).await.unwrap();
    let b = container.install(None, "mem:b", importer("b", "p")).await.unwrap();
    container.resolve(&[b.clone()], true).await.unwrap();
    let old = a.current_revision().unwrap();

    container.update(&a, exporter("a", "2.0.0", "p")).await.unwrap();
    assert_eq!(a.state(), ModuleState::Installed);
    let pending = container.removal_pending();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].id(), old.id());
    assert_eq!(
        container.module_wiring(&b).unwrap().required_wires_in("package")[0]
            .provider()
            .unwrap()
            .id(),
        old.id()
    );

    container.refresh(&[a.clone()]).await.unwrap();
    assert!(container.removal_pending().is_empty());
    assert_eq!(a.state(), ModuleState::Resolved);
    assert_eq!(b.state(), ModuleState::Resolved);
    let provider = container.module_wiring(&b).unwrap().required_wires_in("package")[0]
        .provider()
        .unwrap()
        .clone();
    assert_eq!(provider.version().to_string(), "2.0.0");
}

/// 测试卸载活动模块的事件顺序
#[tokio::test]
async fn test_uninstall_active_module_events() {
    let container = default_container().await;
    let a = container.install(None, "mem:a", exporter("a", "1.0.0", "p")).await.unwrap();
    container.start(&a, StartOptions::default()).await.unwrap();

    let log = record_events(&container);
    container.uninstall(&a).await.unwrap();
    assert_eq!(
        kinds_for(&log, a.id()),
        vec![
            EventKind::Stopping,
            EventKind::Stopped,
            EventKind::Unresolved,
            EventKind::Uninstalled,
        ]
    );
    assert!(container.module_by_id(a.id()).is_none());
    assert!(container.module_by_location("mem:a").is_none());
    assert!(matches!(
        container.uninstall(&a).await,
        Err(ContainerError::InvalidState(_))
    ));
}

/// 测试重复解析不产生事件也不改变时间戳
#[tokio::test]
async fn test_resolve_is_idempotent() {
    let container = default_container().await;
    container.install(None, "mem:a", exporter("a", "1.0.0", "p")).await.unwrap();
    let b = container.install(None, "mem:b", importer("b", "p")).await.unwrap();
    container.resolve(&[b.clone()], true).await.unwrap();

    let before = container.timestamps();
    let log = record_events(&container);
    let report = container.resolve(&[b.clone()], true).await.unwrap();
    assert!(report.is_empty());
    assert!(log.lock().is_empty());
    assert_eq!(container.timestamps(), before);
}

/// 测试必需触发器解析成功后，其余未解析模块也尝试解析，失败的不影响结果
#[tokio::test]
async fn test_mandatory_resolve_also_resolves_others() {
    let container = default_container().await;
    let a = container.install(None, "mem:a", exporter("a", "1.0.0", "p")).await.unwrap();
    let b = container.install(None, "mem:b", importer("b", "p")).await.unwrap();
    let c = container
        .install(None, "mem:c", RevisionBuilder::new("c", "1.0.0").unwrap())
        .await
        .unwrap();
    let d = container.install(None, "mem:d", importer("d", "missing")).await.unwrap();

    let report = container.resolve(&[b.clone()], true).await.unwrap();
    assert_eq!(a.state(), ModuleState::Resolved);
    assert_eq!(b.state(), ModuleState::Resolved);
    assert_eq!(c.state(), ModuleState::Resolved);
    assert_eq!(d.state(), ModuleState::Installed);
    assert!(report
        .entries_for_module(d.id())
        .iter()
        .any(|e| matches!(e, ReportEntry::MissingCapability { .. })));
}

/// 测试强制解析失败时返回带诊断报告的错误
#[tokio::test]
async fn test_mandatory_resolution_failure_report() {
    let container = default_container().await;
    let b = container.install(None, "mem:b", importer("b", "missing")).await.unwrap();

    let err = container.resolve(&[b.clone()], true).await.unwrap_err();
    let report = err.resolution_report().unwrap();
    let entries = report.entries_for_module(b.id());
    assert!(entries
        .iter()
        .any(|e| matches!(e, ReportEntry::MissingCapability { .. })));
    assert_eq!(b.state(), ModuleState::Installed);

    // 非强制解析只返回报告
    let report = container.resolve(&[b.clone()], false).await.unwrap();
    assert!(!report.entries_for_module(b.id()).is_empty());
}

/// 测试持久化启动的模块在依赖到达并解析后自动启动
#[tokio::test]
async fn test_auto_start_after_resolution() {
    let container = default_container().await;
    let b = container.install(None, "mem:b", importer("b", "p")).await.unwrap();
    assert!(container.start(&b, StartOptions::default()).await.is_err());
    assert!(b.settings().auto_start);
    assert_eq!(b.state(), ModuleState::Installed);

    container.install(None, "mem:a", exporter("a", "1.0.0", "p")).await.unwrap();
    container.resolve(&[], false).await.unwrap();
    assert_eq!(b.state(), ModuleState::Active);
}

/// 测试刷新后重新启动此前活动的模块
#[tokio::test]
async fn test_refresh_restarts_active_modules() {
    let container = default_container().await;
    let a = container.install(None, "mem:a", exporter("a", "1.0.0", "p")).await.unwrap();
    let b = container.install(None, "mem:b", importer("b", "p")).await.unwrap();
    container.start(&b, StartOptions::default()).await.unwrap();
    assert_eq!(a.state(), ModuleState::Resolved);

    let log = record_events(&container);
    container.refresh(&[a.clone()]).await.unwrap();
    assert_eq!(b.state(), ModuleState::Active);
    assert_eq!(a.state(), ModuleState::Resolved);

    let b_events = kinds_for(&log, b.id());
    assert_eq!(
        b_events,
        vec![
            EventKind::Stopping,
            EventKind::Stopped,
            EventKind::Unresolved,
            EventKind::Resolved,
            EventKind::Starting,
            EventKind::Started,
        ]
    );
    let system = container.system_module().unwrap();
    assert_eq!(kinds_for(&log, system.id()).last(), Some(&EventKind::Refreshed));
}

/// 测试刷新系统模块会异步停止容器
#[tokio::test]
async fn test_refresh_system_module_stops_container() {
    let container = default_container().await;
    let system = container.system_module().unwrap();
    assert!(!container.wait_for_stop(Duration::from_millis(10)).await.unwrap());

    container.refresh(&[system.clone()]).await.unwrap();
    assert!(container.wait_for_stop(Duration::from_secs(5)).await.unwrap());
    assert_eq!(system.state(), ModuleState::Resolved);
    assert_eq!(container.active_start_level(), 0);
}

/// 测试动态导入：新建连线、复用连线与未命中缓存
#[tokio::test]
async fn test_dynamic_import() {
    let container = default_container().await;
    let b = container
        .install(
            None,
            "mem:b",
            RevisionBuilder::new("b", "1.0.0").unwrap().dynamic_import("*"),
        )
        .await
        .unwrap();
    container.resolve(&[b.clone()], true).await.unwrap();
    // 提供方在导入方解析之后安装，由动态导入负责解析
    let a = container.install(None, "mem:a", exporter("a", "1.0.0", "p")).await.unwrap();
    assert_eq!(a.state(), ModuleState::Installed);

    let wire = container.resolve_dynamic(&b, "p").await.unwrap().unwrap();
    assert_eq!(wire.provider().unwrap().module_id(), a.id());
    assert_eq!(a.state(), ModuleState::Resolved);
    assert!(container.module_wiring(&b).unwrap().imported_package("p").is_some());

    let again = container.resolve_dynamic(&b, "p").await.unwrap().unwrap();
    assert!(Arc::ptr_eq(&wire, &again));

    assert!(container.resolve_dynamic(&b, "missing").await.unwrap().is_none());
    assert!(container.resolve_dynamic(&b, "missing").await.unwrap().is_none());

    let report = container.metrics_report();
    assert_eq!(report.dynamic.hits, 2);
    assert_eq!(report.dynamic.misses, 1);
    assert_eq!(report.dynamic.cached_misses, 1);
}

/// 测试动态导入触发提供方的延迟激活
#[tokio::test]
async fn test_dynamic_import_triggers_lazy_provider() {
    let container = default_container().await;
    let a = container
        .install(
            None,
            "mem:a",
            exporter("a", "1.0.0", "p").lazy_activation(),
        )
        .await
        .unwrap();
    let b = container
        .install(
            None,
            "mem:b",
            RevisionBuilder::new("b", "1.0.0").unwrap().dynamic_import("p"),
        )
        .await
        .unwrap();
    container.start(&a, StartOptions::default()).await.unwrap();
    assert_eq!(a.state(), ModuleState::LazyStarting);
    container.resolve(&[b.clone()], true).await.unwrap();

    assert!(container.resolve_dynamic(&b, "p").await.unwrap().is_some());
    assert_eq!(a.state(), ModuleState::Active);
}
