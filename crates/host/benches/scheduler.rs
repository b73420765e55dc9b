//! Benchmarks for periodic bandwidth admission
//!
//! Measures:
//! - Admit/release of a single reservation on an idle schedule
//! - Filling a schedule with mixed interrupt requests until it refuses
//! - Full enumeration of a small simulated topology

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use host::config::SimulationSettings;
use host::{
    BandwidthRequest, EnumerationSettings, Scheduler, SchedulerSettings, SimController,
    UsbController,
};
use protocol::ControllerId;
use std::sync::Arc;

fn benchmark_admit_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("admit_release");

    for frame_period in [1u32, 8, 256] {
        let scheduler = Scheduler::new(SchedulerSettings::ehci());
        let request = BandwidthRequest::new(frame_period, 8, 200);
        group.bench_with_input(
            BenchmarkId::from_parameter(frame_period),
            &request,
            |b, request| {
                b.iter(|| {
                    let handle = scheduler.admit(black_box(*request)).unwrap();
                    scheduler.release(handle).unwrap();
                })
            },
        );
    }

    group.finish();
}

fn benchmark_fill(c: &mut Criterion) {
    let requests: Vec<BandwidthRequest> = (0..64u32)
        .map(|i| BandwidthRequest::new(1 << (i % 6), 1 << (i % 4), 64 + (i * 37) % 900))
        .collect();

    c.bench_function("fill_schedule", |b| {
        b.iter(|| {
            let scheduler = Scheduler::new(SchedulerSettings::ehci());
            let mut admitted = 0;
            for request in requests.iter().cycle().take(512) {
                if scheduler.admit(*request).is_ok() {
                    admitted += 1;
                }
            }
            black_box(admitted)
        })
    });
}

fn benchmark_enumeration(c: &mut Criterion) {
    c.bench_function("enumerate_default_topology", |b| {
        b.iter(|| {
            let sim = SimController::from_settings(&SimulationSettings::default()).unwrap();
            let controller = UsbController::new(
                ControllerId(0),
                Arc::new(sim),
                SchedulerSettings::ehci(),
                EnumerationSettings::immediate(),
                None,
            );
            controller.start().unwrap();
            black_box(controller.scan().unwrap())
        })
    });
}

criterion_group!(
    benches,
    benchmark_admit_release,
    benchmark_fill,
    benchmark_enumeration
);
criterion_main!(benches);
