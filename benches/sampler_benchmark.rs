//! Sampler benchmarks for lightlda

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use lightlda::{AliasBuilder, AliasEntry, LdaConfig, LdaEngine, LocalRow, XorShiftRng};

/// Zipf-like synthetic corpus: `docs` documents of `len` tokens over `vocab` words.
fn generate_corpus(docs: usize, len: usize, vocab: usize) -> Vec<(Vec<i32>, Vec<i32>)> {
    let mut rng = XorShiftRng::with_seed(42);
    (0..docs)
        .map(|_| {
            let mut ids = Vec::with_capacity(len);
            for _ in 0..len {
                // Squaring a uniform draw skews towards small word ids.
                let u = rng.rand_real();
                ids.push(((u * u) * vocab as f32) as i32);
            }
            let freqs = vec![1; ids.len()];
            (ids, freqs)
        })
        .collect()
}

fn hybrid_map_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("hybrid_map");
    let keys: Vec<i32> = {
        let mut rng = XorShiftRng::new();
        (0..1_000).map(|_| rng.rand_k(1_000)).collect()
    };
    group.throughput(Throughput::Elements(keys.len() as u64));

    group.bench_function("sparse_inc_dec", |b| {
        let row = LocalRow::sparse(1_024);
        let mut scratch = Vec::with_capacity(2_048);
        b.iter(|| {
            let map = row.map();
            for &k in &keys[..256] {
                map.inc(black_box(k), 1, &mut scratch);
            }
            for &k in &keys[..256] {
                map.inc(black_box(k), -1, &mut scratch);
            }
        })
    });

    group.bench_function("sparse_get", |b| {
        let row = LocalRow::sparse(1_024);
        let mut scratch = Vec::new();
        for &k in &keys[..256] {
            row.map().inc(k, 1, &mut scratch);
        }
        b.iter(|| {
            let map = row.map();
            keys.iter().map(|&k| map.get(black_box(k))).sum::<i32>()
        })
    });

    group.finish();
}

fn alias_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("alias");
    let k = 1_000;
    let weights: Vec<f32> = (0..k).map(|i| 1.0 / (i + 1) as f32).collect();
    let mass: f32 = weights.iter().sum();

    group.throughput(Throughput::Elements(k as u64));
    group.bench_function("build_1000", |b| {
        let mut builder = AliasBuilder::with_capacity(k);
        let mut entries = vec![AliasEntry::default(); k];
        let mut proportion = weights.clone();
        b.iter(|| {
            proportion.copy_from_slice(&weights);
            builder.build(black_box(&mut proportion), mass, &mut entries)
        })
    });

    let mut builder = AliasBuilder::with_capacity(k);
    let mut entries = vec![AliasEntry::default(); k];
    let mut proportion = weights.clone();
    let height = builder.build(&mut proportion, mass, &mut entries);
    group.throughput(Throughput::Elements(10_000));
    group.bench_function("sample_10k", |b| {
        let mut rng = XorShiftRng::new();
        b.iter(|| {
            let mut acc = 0i64;
            for _ in 0..10_000 {
                acc += i64::from(lightlda::alias::sample_entries(&entries, height, &mut rng));
            }
            acc
        })
    });

    group.finish();
}

fn training_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("train");
    group.sample_size(10);

    let vocab = 2_000;
    let corpus = generate_corpus(500, 100, vocab);
    let tokens: usize = corpus.iter().map(|(ids, _)| ids.len()).sum();
    let size: usize = corpus.iter().map(|(ids, _)| 1 + 2 * ids.len()).sum();
    group.throughput(Throughput::Elements(tokens as u64));

    for threads in [1, 4] {
        group.bench_function(format!("one_iteration_{}t", threads), |b| {
            b.iter(|| {
                let config = LdaConfig::new(50, vocab)
                    .with_threads(threads)
                    .with_iterations(1);
                let mut engine = LdaEngine::new(config).unwrap();
                engine.allocate_data_memory(corpus.len(), size);
                for (ids, freqs) in &corpus {
                    engine.feed_in_data(ids, freqs).unwrap();
                }
                engine.initialize_before_train().unwrap();
                engine.train(None).unwrap();
                black_box(engine.summary_row())
            })
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    hybrid_map_benchmark,
    alias_benchmark,
    training_benchmark
);
criterion_main!(benches);
