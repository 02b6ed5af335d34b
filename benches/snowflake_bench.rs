//! Snowflake ID 生成性能基准测试

use std::sync::Arc;
use std::thread;

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use flare_im_core::id::{SnowflakeGenerator, parse_id};

fn bench_generate(c: &mut Criterion) {
    let generator = SnowflakeGenerator::new(1).unwrap();

    let mut group = c.benchmark_group("snowflake");
    group.throughput(Throughput::Elements(1));
    group.bench_function("generate", |b| b.iter(|| black_box(generator.generate())));
    group.bench_function("parse_id", |b| {
        let id = generator.generate();
        b.iter(|| black_box(parse_id(black_box(id))))
    });
    group.finish();
}

fn bench_contended_generate(c: &mut Criterion) {
    const THREADS: usize = 4;
    const IDS_PER_THREAD: usize = 1_000;

    let generator = Arc::new(SnowflakeGenerator::new(2).unwrap());

    let mut group = c.benchmark_group("snowflake_contended");
    group.throughput(Throughput::Elements((THREADS * IDS_PER_THREAD) as u64));
    group.bench_function("generate_4_threads", |b| {
        b.iter(|| {
            let handles: Vec<_> = (0..THREADS)
                .map(|_| {
                    let generator = generator.clone();
                    thread::spawn(move || {
                        for _ in 0..IDS_PER_THREAD {
                            black_box(generator.generate());
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        })
    });
    group.finish();
}

criterion_group!(benches, bench_generate, bench_contended_generate);
criterion_main!(benches);
