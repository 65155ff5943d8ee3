//! 解析器性能基准测试
//!
//! 使用 Criterion 框架进行性能测试，包括：
//! - 链式依赖求解基准
//! - 带 uses 约束的求解基准
//! - 容器并发解析基准

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use chips_container::core::config::ResolverConfig;
use chips_container::{ContainerBuilder, ContainerConfig, Database, Resolver, RevisionBuilder};
use std::sync::Arc;

// ============================================================================
// 测试辅助函数
// ============================================================================

/// 安装一条长度为 `len` 的导入链：m{i} 导出 p{i} 并导入 p{i-1}
fn chain(len: usize) -> Database {
    let db = Database::new(1);
    for i in 0..len {
        let mut builder = RevisionBuilder::new(format!("m{i}"), "1.0.0")
            .unwrap()
            .export_package(&format!("p{i}"), "1.0.0")
            .unwrap();
        if i > 0 {
            builder = builder.import_package(&format!("p{}", i - 1), None).unwrap();
        }
        db.install(&format!("mem:m{i}"), &builder).unwrap();
    }
    db
}

/// 每个包有两个版本的提供方，消费方的 uses 约束迫使解析器回溯
fn uses_fanout(width: usize) -> Database {
    let db = Database::new(1);
    for (i, version) in ["1.0.0", "2.0.0"].into_iter().enumerate() {
        db.install(
            &format!("mem:q{i}"),
            &RevisionBuilder::new(format!("q{i}"), version)
                .unwrap()
                .export_package("q", version)
                .unwrap(),
        )
        .unwrap();
    }
    for i in 0..width {
        db.install(
            &format!("mem:api{i}"),
            &RevisionBuilder::new(format!("api{i}"), "1.0.0")
                .unwrap()
                .export_package_with(&format!("api{i}"), "1.0.0", &["q"], &[], Default::default())
                .unwrap()
                .import_package("q", Some("[1.0.0,2.0.0)"))
                .unwrap(),
        )
        .unwrap();
        db.install(
            &format!("mem:user{i}"),
            &RevisionBuilder::new(format!("user{i}"), "1.0.0")
                .unwrap()
                .import_package(&format!("api{i}"), None)
                .unwrap()
                .import_package("q", None)
                .unwrap(),
        )
        .unwrap();
    }
    db
}

// ============================================================================
// 求解基准测试
// ============================================================================

/// 链式依赖求解基准测试
fn chain_resolve_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve_chain");
    for len in [10usize, 100, 500] {
        let db = chain(len);
        let resolver = Resolver::new(ResolverConfig::default());
        group.throughput(Throughput::Elements(len as u64));
        group.bench_with_input(BenchmarkId::from_parameter(len), &len, |b, _| {
            b.iter(|| {
                let snapshot = db.snapshot();
                black_box(resolver.resolve(&snapshot, &[], false).unwrap())
            })
        });
    }
    group.finish();
}

/// uses 约束回溯基准测试
fn uses_resolve_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("resolve_uses");
    for width in [5usize, 25, 100] {
        let db = uses_fanout(width);
        let resolver = Resolver::new(ResolverConfig::default());
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| {
                let snapshot = db.snapshot();
                black_box(resolver.resolve(&snapshot, &[], false).unwrap())
            })
        });
    }
    group.finish();
}

// ============================================================================
// 容器基准测试
// ============================================================================

/// 容器安装并解析一批模块的完整流程基准测试
fn container_resolve_benchmark(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let mut group = c.benchmark_group("container_resolve");
    for modules in [10usize, 50] {
        group.bench_with_input(BenchmarkId::from_parameter(modules), &modules, |b, &modules| {
            b.to_async(&rt).iter(|| async move {
                let container = ContainerBuilder::new(ContainerConfig::default())
                    .build()
                    .await
                    .unwrap();
                container
                    .install(
                        None,
                        "mem:provider",
                        RevisionBuilder::new("provider", "1.0.0")
                            .unwrap()
                            .export_package("p", "1.0.0")
                            .unwrap(),
                    )
                    .await
                    .unwrap();
                let mut consumers = Vec::with_capacity(modules);
                for i in 0..modules {
                    consumers.push(
                        container
                            .install(
                                None,
                                &format!("mem:c{i}"),
                                RevisionBuilder::new(format!("c{i}"), "1.0.0")
                                    .unwrap()
                                    .import_package("p", None)
                                    .unwrap(),
                            )
                            .await
                            .unwrap(),
                    );
                }

                // 分成四组并发解析
                let tasks: Vec<_> = consumers
                    .chunks(modules.div_ceil(4))
                    .map(|chunk| {
                        let container = Arc::clone(&container);
                        let chunk = chunk.to_vec();
                        tokio::spawn(async move { container.resolve(&chunk, false).await })
                    })
                    .collect();
                for task in futures::future::join_all(tasks).await {
                    black_box(task.unwrap().unwrap());
                }
            })
        });
    }
    group.finish();
}

criterion_group!(
    name = solver_benches;
    config = Criterion::default().sample_size(50);
    targets = chain_resolve_benchmark, uses_resolve_benchmark
);

criterion_group!(
    name = container_benches;
    config = Criterion::default().sample_size(20);
    targets = container_resolve_benchmark
);

criterion_main!(solver_benches, container_benches);
