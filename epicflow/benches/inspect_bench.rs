//! Benchmarks for log inspection on large tool logs.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use epicflow::anomaly::AnomalyResolver;
use epicflow::core::ExposurePrefix;
use epicflow::inspect::{self, markers};

fn filter_log(exposures: usize, lines_per_exposure: usize) -> String {
    let mut lines = Vec::with_capacity(exposures * lines_per_exposure);
    for e in 0..exposures {
        lines.push(format!("{}S{:03}", 1 + e % 2, e));
        for ccd in 2..=7 {
            if (e + ccd) % 5 == 0 {
                lines.push(format!("    CCD {ccd} in anomalous state ****"));
            } else {
                lines.push(format!("    CCD {ccd} nominal"));
            }
        }
        for i in 7..lines_per_exposure {
            lines.push(format!("espfilt: exposure {e} step {i} rate 0.{i:04}"));
        }
    }
    lines.join("\n")
}

fn inspect_benchmark(c: &mut Criterion) {
    let log = filter_log(40, 2_500);

    c.bench_function("anomaly_line_offsets", |b| {
        b.iter(|| inspect::anomaly_line_offsets(black_box(&log)));
    });

    c.bench_function("has_marker_miss", |b| {
        b.iter(|| inspect::has_marker(black_box(&log), markers::TOO_FEW_TCX_POINTS));
    });

    let prefixes: Vec<ExposurePrefix> = (0..40)
        .map(|e| format!("{}S{:03}", 1 + e % 2, e).parse().unwrap())
        .collect();
    c.bench_function("anomaly_vectors", |b| {
        b.iter(|| {
            let resolver = AnomalyResolver::new(black_box(&log));
            prefixes
                .iter()
                .filter_map(|p| resolver.vector_for(p))
                .count()
        });
    });
}

criterion_group!(benches, inspect_benchmark);
criterion_main!(benches);
