//! Effect chain resolution and stage planning benchmarks. CPU only.
//! Run: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use framelift::algorithms::AlgorithmLibrary;
use framelift::effect_chain::resolve;
use framelift::pipeline_builder::plan;
use framelift::schema::{BaseMode, Dimensions, PerformanceTier};

fn bench_resolve(c: &mut Criterion) {
    let mut group = c.benchmark_group("effect_chain");
    group.bench_function("resolve_all_modes_all_tiers", |b| {
        b.iter(|| {
            for mode in BaseMode::ALL {
                for tier in PerformanceTier::ALL {
                    black_box(resolve(black_box(mode), black_box(tier)));
                }
            }
        });
    });
    group.finish();
}

fn bench_plan(c: &mut Criterion) {
    let library = AlgorithmLibrary::builtin();
    let effects = resolve(BaseMode::AA, PerformanceTier::Ultra);

    let mut group = c.benchmark_group("stage_planning");
    group.bench_function("plan_aa_ultra_1080p_to_4k", |b| {
        b.iter(|| {
            black_box(plan(
                &library,
                black_box(Dimensions::new(1920, 1080)),
                black_box(Dimensions::new(3840, 2160)),
                &effects,
            ))
        });
    });
    group.bench_function("plan_aa_ultra_480p_to_4k", |b| {
        b.iter(|| {
            black_box(plan(
                &library,
                black_box(Dimensions::new(854, 480)),
                black_box(Dimensions::new(3840, 2160)),
                &effects,
            ))
        });
    });
    group.finish();
}

criterion_group!(benches, bench_resolve, bench_plan);
criterion_main!(benches);
