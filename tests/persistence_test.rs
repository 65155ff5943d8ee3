//! 数据库持久化集成测试

use std::sync::Arc;
use tempfile::TempDir;

use chips_container::{
    Container, ContainerBuilder, ContainerConfig, ContainerError, Database, ModuleState,
    RevisionBuilder, StartOptions,
};

fn exporter(version: &str) -> RevisionBuilder {
    RevisionBuilder::new("a", version)
        .unwrap()
        .export_package("p", version)
        .unwrap()
}

fn importer() -> RevisionBuilder {
    RevisionBuilder::new("b", "1.0.0")
        .unwrap()
        .import_package("p", None)
        .unwrap()
}

async fn build(config: &ContainerConfig) -> Arc<Container> {
    ContainerBuilder::new(config.clone()).build().await.unwrap()
}

/// 测试停止容器时保存，重建容器后恢复模块、连线与持久化启动标记
#[tokio::test]
async fn test_store_on_stop_and_reload() {
    let temp_dir = TempDir::new().unwrap();
    let data_file = temp_dir.path().join("state").join("container.db");
    let config = ContainerConfig::builder().data_file(&data_file).build();

    let (a_id, b_id) = {
        let container = build(&config).await;
        container.launch().await.unwrap();
        let a = container.install(None, "mem:a", exporter("1.0.0")).await.unwrap();
        let b = container.install(None, "mem:b", importer()).await.unwrap();
        container.start(&b, StartOptions::default()).await.unwrap();
        container.set_module_start_level(&a, 4).await.unwrap();
        container.stop_system().await.unwrap();
        (a.id(), b.id())
    };
    assert!(data_file.exists());

    let container = build(&config).await;
    let a = container.module_by_location("mem:a").unwrap();
    let b = container.module_by_location("mem:b").unwrap();
    assert_eq!(a.id(), a_id);
    assert_eq!(b.id(), b_id);
    assert_eq!(a.start_level(), 4);
    assert_eq!(b.state(), ModuleState::Resolved);
    assert!(b.settings().auto_start);
    assert!(!a.settings().auto_start);
    let wire = &container.module_wiring(&b).unwrap().required_wires_in("package")[0];
    assert_eq!(wire.provider().unwrap().module_id(), a_id);

    container.launch().await.unwrap();
    assert_eq!(b.state(), ModuleState::Active);

    // 新安装的模块不会复用已分配的 ID
    let c = container
        .install(None, "mem:c", RevisionBuilder::new("c", "1.0.0").unwrap())
        .await
        .unwrap();
    assert!(c.id() > b_id);
}

/// 测试存在等待移除的修订时不保存连线
#[tokio::test]
async fn test_wirings_dropped_when_removal_pending() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("pending.db");

    let container = build(&ContainerConfig::default()).await;
    container.launch().await.unwrap();
    let a = container.install(None, "mem:a", exporter("1.0.0")).await.unwrap();
    let b = container.install(None, "mem:b", importer()).await.unwrap();
    container.resolve(&[b.clone()], true).await.unwrap();
    container.update(&a, exporter("2.0.0")).await.unwrap();
    assert_eq!(container.removal_pending().len(), 1);
    container.store_to(&path).await.unwrap();

    let restored = Database::new(1);
    restored.load(&path).await.unwrap();
    let a = restored.module_by_location("mem:a").unwrap();
    let b = restored.module_by_location("mem:b").unwrap();
    assert_eq!(a.current_revision().unwrap().version().to_string(), "2.0.0");
    assert_eq!(b.state(), ModuleState::Installed);
    assert!(restored.module_wiring(&b).is_none());
    assert!(restored.removal_pending().is_empty());
}

/// 测试关闭连线持久化后全部模块以 INSTALLED 状态恢复
#[tokio::test]
async fn test_persist_wirings_disabled() {
    let temp_dir = TempDir::new().unwrap();
    let data_file = temp_dir.path().join("container.db");
    let config = ContainerConfig::builder()
        .data_file(&data_file)
        .persist_wirings(false)
        .build();

    {
        let container = build(&config).await;
        container.launch().await.unwrap();
        container.install(None, "mem:a", exporter("1.0.0")).await.unwrap();
        let b = container.install(None, "mem:b", importer()).await.unwrap();
        container.start(&b, StartOptions::default()).await.unwrap();
        container.stop_system().await.unwrap();
    }

    let container = build(&config).await;
    assert!(container
        .modules()
        .iter()
        .all(|m| m.state() == ModuleState::Installed));

    // 启动后按持久化启动标记重新解析并启动
    container.launch().await.unwrap();
    let b = container.module_by_location("mem:b").unwrap();
    assert_eq!(b.state(), ModuleState::Active);
}

/// 测试只能向空数据库加载
#[tokio::test]
async fn test_load_requires_empty_database() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("db.bin");
    let container = build(&ContainerConfig::default()).await;
    container.store_to(&path).await.unwrap();

    let err = container.database().load(&path).await.unwrap_err();
    assert!(matches!(err, ContainerError::InvalidState(_)));
}

/// 测试损坏的数据文件导致构建失败
#[tokio::test]
async fn test_corrupted_data_file() {
    let temp_dir = TempDir::new().unwrap();
    let data_file = temp_dir.path().join("broken.db");
    tokio::fs::write(&data_file, b"definitely not bincode").await.unwrap();

    let config = ContainerConfig::builder().data_file(&data_file).build();
    assert!(ContainerBuilder::new(config).build().await.is_err());
}
