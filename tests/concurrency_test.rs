//! 并发解析与状态变更集成测试

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use chips_container::{
    Container, ContainerBuilder, ContainerConfig, ContainerError, Database, ModuleRevision,
    ModuleState, OperationContext, ResolverHook, RevisionBuilder, StartOptions, StopOptions,
};

const INTERLEAVINGS: u64 = 1000;

async fn launched(config: ContainerConfig) -> Arc<Container> {
    let container = ContainerBuilder::new(config).build().await.unwrap();
    container.launch().await.unwrap();
    container
}

fn exporter(name: &str, version: &str) -> RevisionBuilder {
    RevisionBuilder::new(name, version)
        .unwrap()
        .export_package("p", version)
        .unwrap()
}

fn importer(name: &str) -> RevisionBuilder {
    RevisionBuilder::new(name, "1.0.0")
        .unwrap()
        .import_package("p", None)
        .unwrap()
}

/// 测试相互连线的两个模块以随机交错方式并发启动，不死锁且最终都处于 ACTIVE
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_starts_randomized() {
    for seed in 0..INTERLEAVINGS {
        let mut rng = StdRng::seed_from_u64(seed);
        let config = ContainerConfig::builder()
            .state_change_timeout(Duration::from_secs(5))
            .build();
        let container = launched(config).await;
        let a = container.install(None, "mem:a", exporter("a", "1.0.0")).await.unwrap();
        let b = container.install(None, "mem:b", importer("b")).await.unwrap();

        let delays: Vec<u64> = (0..4).map(|_| rng.gen_range(0..3)).collect();
        let stop_first = rng.gen_bool(0.3);
        let order = if rng.gen_bool(0.5) {
            [a.clone(), b.clone()]
        } else {
            [b.clone(), a.clone()]
        };

        let tasks: Vec<_> = order
            .into_iter()
            .enumerate()
            .map(|(i, module)| {
                let container = container.clone();
                let before = delays[i];
                let between = delays[i + 2];
                tokio::spawn(async move {
                    for _ in 0..before {
                        tokio::task::yield_now().await;
                    }
                    container.start(&module, StartOptions::default()).await?;
                    if stop_first {
                        for _ in 0..between {
                            tokio::task::yield_now().await;
                        }
                        container.stop(&module, StopOptions::transient()).await?;
                        container.start(&module, StartOptions::default()).await?;
                    }
                    Ok::<_, ContainerError>(())
                })
            })
            .collect();

        let joined = tokio::time::timeout(Duration::from_secs(10), futures::future::join_all(tasks))
            .await
            .unwrap_or_else(|_| panic!("interleaving {seed} deadlocked"));
        for result in joined {
            result.unwrap().unwrap_or_else(|e| panic!("interleaving {seed} failed: {e}"));
        }
        assert_eq!(a.state(), ModuleState::Active, "interleaving {seed}");
        assert_eq!(b.state(), ModuleState::Active, "interleaving {seed}");
        let wiring = container.module_wiring(&b).unwrap();
        assert_eq!(wiring.required_wires_in("package").len(), 1);
    }
}

/// 第一次解析开始时向数据库安装更高版本的提供方，使快照过期
struct InstallDuringResolve {
    armed: AtomicBool,
    database: OnceLock<Arc<Database>>,
}

impl ResolverHook for InstallDuringResolve {
    fn begin(&self, _triggers: &[Arc<ModuleRevision>]) -> anyhow::Result<()> {
        if self.armed.swap(false, Ordering::SeqCst) {
            if let Some(database) = self.database.get() {
                database.install("mem:a2", &exporter("a", "2.0.0"))?;
            }
        }
        Ok(())
    }
}

/// 测试快照过期后重试，并选择新安装的更高版本提供方
#[tokio::test]
async fn test_stale_snapshot_retries() {
    let hook = Arc::new(InstallDuringResolve {
        armed: AtomicBool::new(false),
        database: OnceLock::new(),
    });
    let container = ContainerBuilder::new(ContainerConfig::default())
        .resolver_hook(hook.clone())
        .build()
        .await
        .unwrap();
    container.launch().await.unwrap();
    let _ = hook.database.set(container.database().clone());

    container.install(None, "mem:a1", exporter("a", "1.0.0")).await.unwrap();
    let b = container.install(None, "mem:b", importer("b")).await.unwrap();

    hook.armed.store(true, Ordering::SeqCst);
    container.resolve(&[b.clone()], true).await.unwrap();

    assert_eq!(container.metrics().stale_retries(), 1);
    let a2 = container.module_by_location("mem:a2").unwrap();
    let wiring = container.module_wiring(&b).unwrap();
    let provider = wiring.required_wires_in("package")[0].provider().unwrap().clone();
    assert_eq!(provider.module_id(), a2.id());
    assert_eq!(a2.state(), ModuleState::Resolved);
}

/// 测试解析许可耗尽时超时失败，并且错误可重试
#[tokio::test]
async fn test_resolution_permit_exhausted() {
    let config = ContainerConfig::builder()
        .resolution_permits(1)
        .resolution_permit_timeout(Duration::from_millis(50))
        .build();
    let container = launched(config).await;
    let a = container.install(None, "mem:a", exporter("a", "1.0.0")).await.unwrap();

    let holder = OperationContext::new("holder");
    let permit = container
        .permits()
        .acquire(&holder, Duration::from_secs(1))
        .await
        .unwrap();
    let err = container.resolve(&[a.clone()], true).await.unwrap_err();
    assert!(matches!(err, ContainerError::ResolutionPermitTimeout { available: 0, .. }));
    assert!(err.is_retryable());

    drop(permit);
    container.resolve(&[a.clone()], true).await.unwrap();
    assert_eq!(a.state(), ModuleState::Resolved);
}

/// 测试并发安装同一位置只产生一个模块
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_install_same_location() {
    let container = launched(ContainerConfig::default()).await;
    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let container = container.clone();
            tokio::spawn(async move {
                container
                    .install(None, "mem:shared", exporter("shared", "1.0.0"))
                    .await
            })
        })
        .collect();
    let ids: Vec<u64> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap().unwrap().id())
        .collect();
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    // 系统模块 + 共享模块
    assert_eq!(container.modules().len(), 2);
}

/// 测试并发解析大量模块，每个模块恰好解析一次
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_resolves_converge() {
    let container = launched(ContainerConfig::default()).await;
    container.install(None, "mem:provider", exporter("provider", "1.0.0")).await.unwrap();
    let mut consumers = Vec::new();
    for i in 0..20 {
        consumers.push(
            container
                .install(None, &format!("mem:c{i}"), importer(&format!("c{i}")))
                .await
                .unwrap(),
        );
    }
    let resolved = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let counter = resolved.clone();
    container.events().add_listener(move |e: &chips_container::ContainerEvent| {
        if e.kind == chips_container::EventKind::Resolved {
            counter.fetch_add(1, Ordering::SeqCst);
        }
    });

    let tasks: Vec<_> = consumers
        .chunks(5)
        .map(|chunk| {
            let container = container.clone();
            let chunk = chunk.to_vec();
            tokio::spawn(async move { container.resolve(&chunk, true).await })
        })
        .chain((0..3).map(|_| {
            let container = container.clone();
            tokio::spawn(async move { container.resolve(&[], false).await })
        }))
        .collect();
    for result in futures::future::join_all(tasks).await {
        result.unwrap().unwrap();
    }
    assert!(consumers.iter().all(|c| c.state() == ModuleState::Resolved));
    // 20 个消费方 + 1 个提供方
    assert_eq!(resolved.load(Ordering::SeqCst), 21);
}
