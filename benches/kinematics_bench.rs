use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

use dog_server::motion::{
    calibration::derive_offsets,
    gait::Gait,
    kinematics::{LegPose, coordinate_to_angle, solve_pose},
};

fn single_leg_ik_bench(c: &mut Criterion) {
    c.bench_function("ik_single_leg", |b| {
        b.iter(|| coordinate_to_angle(black_box(10.0), black_box(99.0), black_box(-10.0)))
    });
}

fn full_pose_bench(c: &mut Criterion) {
    let offsets = derive_offsets(&LegPose::initial(99.0));
    let pose = LegPose::neutral(99.0);

    c.bench_function("solve_pose_four_legs", |b| {
        b.iter(|| solve_pose(black_box(&pose), black_box(&offsets)))
    });

    // One forward cycle at default speed: every phase solved once.
    let phases = Gait::Forward.phases(8);
    c.bench_function("forward_gait_cycle", |b| {
        b.iter(|| {
            for &phase in &phases {
                let target = Gait::Forward.pose_at(phase, 99.0);
                let _ = black_box(solve_pose(&target, &offsets));
            }
        })
    });
}

criterion_group!(benches, single_leg_ik_bench, full_pose_bench);
criterion_main!(benches);
