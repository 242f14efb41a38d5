use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use dog_server::{
    config::BalanceConfig,
    hardware::Attitude,
    motion::balance::{AttitudeBalancer, BodyFrame, posture_transform},
};

fn posture_transform_bench(c: &mut Criterion) {
    let attitude = Attitude { roll: 4.0, pitch: -3.0, yaw: 1.5 };
    c.bench_function("posture_transform_raised", |b| {
        b.iter(|| posture_transform(black_box(attitude), black_box(99.0), BodyFrame::Raised))
    });
}

fn balance_tick_bench(c: &mut Criterion) {
    let mut balancer = AttitudeBalancer::new(BalanceConfig::default());
    let sample = Attitude { roll: 2.0, pitch: -1.0, yaw: 0.0 };

    c.bench_function("balance_correct_and_transform", |b| {
        b.iter(|| {
            let correction = balancer.correct(black_box(sample));
            posture_transform(correction, 99.0, BodyFrame::Raised)
        })
    });
}

criterion_group!(benches, posture_transform_bench, balance_tick_bench);
criterion_main!(benches);
