use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use glam::{DMat3, DVec3};

use facescan_linalg::{rigid, svd};

fn bench_svd3(c: &mut Criterion) {
    let mut group = c.benchmark_group("svd3");

    let matrix = DMat3::from_cols(
        DVec3::new(2.0, -1.0, 0.5),
        DVec3::new(0.3, 4.0, -2.0),
        DVec3::new(1.5, 0.2, 3.0),
    );

    group.bench_function(BenchmarkId::new("svd3", ""), |b| {
        b.iter(|| black_box(svd::svd3(black_box(&matrix))));
    });

    group.bench_function(BenchmarkId::new("symmetric_eigen3", ""), |b| {
        let symmetric = matrix.transpose() * matrix;
        b.iter(|| black_box(svd::symmetric_eigen3(black_box(&symmetric))));
    });
}

fn bench_kabsch(c: &mut Criterion) {
    let mut group = c.benchmark_group("kabsch");

    for num_points in [5, 100, 1000, 10000].iter() {
        group.throughput(criterion::Throughput::Elements(*num_points as u64));

        let points_src = (0..*num_points)
            .map(|_| {
                [
                    rand::random::<f64>() * 100.0,
                    rand::random::<f64>() * 100.0,
                    rand::random::<f64>() * 100.0 + 300.0,
                ]
            })
            .collect::<Vec<_>>();

        let rotation = DMat3::from_rotation_y(20f64.to_radians());
        let translation = DVec3::new(10.0, -5.0, 30.0);
        let points_dst = points_src
            .iter()
            .map(|p| (rotation * DVec3::from_array(*p) + translation).to_array())
            .collect::<Vec<_>>();

        group.bench_with_input(
            BenchmarkId::new("kabsch", num_points),
            &(&points_src, &points_dst),
            |b, i| {
                let (src, dst) = *i;
                b.iter(|| black_box(rigid::kabsch(src, dst)));
            },
        );
    }
}

criterion_group!(benches, bench_svd3, bench_kabsch);
criterion_main!(benches);
