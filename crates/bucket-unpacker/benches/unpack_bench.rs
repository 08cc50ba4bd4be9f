//! Benchmarks for bucket unpacking.
//!
//! Run with: cargo bench --package bucket-unpacker
//!
//! ## Benchmark Categories
//!
//! - **Sequential unpack**: reset plus full drain, per encoding
//! - **Random access**: `extract_single_measurement` over a loaded bucket
//! - **Measurement count**: size-derived count of a raw bucket

use bson::{doc, DateTime, Document, RawDocumentBuf};
use bucket_unpacker::{
    compress_bucket, compute_measurement_count, Behavior, BucketSpec, BucketUnpacker,
    ColumnCodecConfig,
};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

/// Generate a typical version 1 bucket (regular timestamps, slowly varying
/// values, one sparse column).
fn generate_bucket(rows: usize) -> Document {
    let mut time = Document::new();
    let mut cpu = Document::new();
    let mut host = Document::new();
    let mut alert = Document::new();

    let mut value = 50.0;
    for i in 0..rows {
        let key = i.to_string();
        value += (i as f64 * 0.1).sin() * 0.1;
        time.insert(key.clone(), DateTime::from_millis(1_000_000 + i as i64 * 1_000));
        cpu.insert(key.clone(), value);
        host.insert(key.clone(), format!("server{}", i % 4));
        if i % 10 == 0 {
            alert.insert(key, true);
        }
    }

    doc! {
        "control": { "version": 1 },
        "meta": { "region": "us-east" },
        "data": { "time": time, "cpu": cpu, "host": host, "alert": alert },
    }
}

fn spec() -> BucketSpec {
    BucketSpec::new("time").with_meta_field("tags")
}

fn bench_sequential_unpack(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequential_unpack");

    for rows in [100, 1_000] {
        let plain = generate_bucket(rows);
        let compressed = compress_bucket(&plain, &ColumnCodecConfig::default()).unwrap();
        group.throughput(Throughput::Elements(rows as u64));

        for (label, bucket) in [("uncompressed", plain), ("compressed", compressed)] {
            group.bench_with_input(BenchmarkId::new(label, rows), &bucket, |b, bucket| {
                let mut unpacker = BucketUnpacker::new(spec(), Behavior::Exclude);
                b.iter(|| {
                    unpacker.reset(bucket.clone()).unwrap();
                    let mut n = 0;
                    while unpacker.has_next() {
                        black_box(unpacker.get_next().unwrap());
                        n += 1;
                    }
                    n
                })
            });
        }
    }

    group.finish();
}

fn bench_projection(c: &mut Criterion) {
    let bucket = generate_bucket(1_000);
    let compressed = compress_bucket(&bucket, &ColumnCodecConfig::default()).unwrap();

    c.bench_function("compressed_include_cpu_1k", |b| {
        let spec = spec().with_fields(["cpu"]);
        let mut unpacker = BucketUnpacker::new(spec, Behavior::Include);
        b.iter(|| {
            unpacker.reset(compressed.clone()).unwrap();
            unpacker.by_ref().count()
        })
    });
}

fn bench_random_access(c: &mut Criterion) {
    let bucket = generate_bucket(1_000);
    let mut unpacker = BucketUnpacker::new(spec(), Behavior::Exclude);
    unpacker.reset(bucket).unwrap();

    c.bench_function("extract_single_measurement_1k", |b| {
        b.iter(|| {
            for row in (0..1_000u32).step_by(37) {
                black_box(unpacker.extract_single_measurement(row).unwrap());
            }
        })
    });
}

fn bench_measurement_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("measurement_count");

    for rows in [1_000, 100_000] {
        let raw = RawDocumentBuf::from_document(&generate_bucket(rows)).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(rows), &raw, |b, raw| {
            b.iter(|| compute_measurement_count(black_box(raw), "time").unwrap())
        });
    }

    group.finish();
}

fn bench_compress(c: &mut Criterion) {
    let bucket = generate_bucket(1_000);
    let config = ColumnCodecConfig::default();

    c.bench_function("compress_bucket_1k", |b| {
        b.iter(|| compress_bucket(black_box(&bucket), &config).unwrap())
    });
}

criterion_group!(
    benches,
    bench_sequential_unpack,
    bench_projection,
    bench_random_access,
    bench_measurement_count,
    bench_compress,
);
criterion_main!(benches);
