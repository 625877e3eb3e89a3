use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::Normal;
use riskgap::lowess::{LowessConfig, lowess};

fn noisy_curve(size: usize) -> (Vec<f64>, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(0x10E55 + size as u64);
    let noise = Normal::new(0.0, 0.3).expect("valid standard deviation");
    let x: Vec<f64> = (0..size).map(|i| i as f64 * 100.0 / size as f64).collect();
    let y = x
        .iter()
        .map(|&xi| (0.03 * xi).exp() + rng.sample(noise))
        .collect();
    (x, y)
}

fn benchmark_lowess(c: &mut Criterion) {
    let sizes = [101_usize, 1_000, 10_000];
    let inputs: Vec<_> = sizes.iter().map(|&size| (size, noisy_curve(size))).collect();

    let mut group = c.benchmark_group("lowess");
    for (size, (x, y)) in inputs.iter() {
        group.throughput(Throughput::Elements(*size as u64));

        group.bench_with_input(BenchmarkId::new("every_point", size), size, |b, _| {
            let config = LowessConfig {
                delta_fraction: 0.0,
                ..LowessConfig::default()
            };
            b.iter(|| black_box(lowess(black_box(x), black_box(y), &config)));
        });

        group.bench_with_input(BenchmarkId::new("delta_skipping", size), size, |b, _| {
            let config = LowessConfig::default();
            b.iter(|| black_box(lowess(black_box(x), black_box(y), &config)));
        });
    }
    group.finish();
}

criterion_group!(lowess_smoother, benchmark_lowess);
criterion_main!(lowess_smoother);
