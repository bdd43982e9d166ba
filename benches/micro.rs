//! Micro-benchmarks for layerio raw-data paths.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro              # run all micro-benchmarks
//! cargo bench --bench micro -- sieve     # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use rand::Rng;

use layerio::StorageConfig;
use layerio::dataset::{Container, Dataset};
use layerio::layout::{Dataspace, Datatype, Hyperslab, LayoutOps, LayoutSpec, Selection};
use layerio::onion::{OnionConfig, OnionFile};
use layerio::store::{FileStore, MemStore};
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// Rows and columns of the benchmark dataset (4-byte elements, 1 MiB).
const ROWS: u64 = 512;
const COLS: u64 = 512;

fn element_row(r: u64, c: u64, n: u64) -> Selection {
    Selection::Block(Hyperslab::new(&[r, c], &[1, n]))
}

fn container(sieve_buf_size: usize) -> (Container, Dataset) {
    let config = StorageConfig {
        sieve_buf_size,
        ..StorageConfig::default()
    };
    let mut file = Container::new(Box::new(MemStore::new()), config).unwrap();
    let mut dset = Dataset::create(
        &mut file,
        Dataspace::simple(&[ROWS, COLS]),
        Datatype::le(4),
        &LayoutSpec::Contiguous,
    )
    .unwrap();
    let zeros = vec![0u8; (ROWS * COLS * 4) as usize];
    dset.write(&mut file, &Selection::All, &zeros).unwrap();
    (file, dset)
}

// ================================================================================================
// Sieve benchmarks
// ================================================================================================

/// Benchmark group for small contiguous writes.
///
/// # Sub-benchmarks
///
/// ## `small_writes/direct` and `small_writes/sieved`
///
/// **Scenario:** Writes 4 elements (16 bytes) at consecutive positions of
/// one row, once with sieving disabled and once with the default 64 KiB
/// sieve buffer.
///
/// **What it measures:** How much the sieve buffer saves by coalescing
/// small neighbouring writes into one staged window.
///
/// **Expected behaviour:** The sieved variant is faster; each direct
/// write reaches the store.
///
/// ## `random_reads/sieved`
///
/// **Scenario:** Reads 4 elements at random positions across the dataset.
///
/// **What it measures:** The miss path: most reads fall outside the
/// current window and reload it.
fn bench_sieve(c: &mut Criterion) {
    let mut group = c.benchmark_group("sieve");
    group.throughput(Throughput::Bytes(16));

    for &(label, size) in &[("direct", 0usize), ("sieved", 64 * 1024)] {
        group.bench_function(BenchmarkId::new("small_writes", label), |b| {
            let (mut file, mut dset) = container(size);
            let payload = [0xABu8; 16];
            let mut col = 0u64;
            b.iter(|| {
                let sel = element_row(col / COLS % ROWS, col % COLS, 4);
                dset.write(&mut file, black_box(&sel), black_box(&payload))
                    .unwrap();
                col = (col + 4) % (ROWS * COLS);
            });
        });
    }

    group.bench_function(BenchmarkId::new("random_reads", "sieved"), |b| {
        let (mut file, mut dset) = container(64 * 1024);
        let mut rng = rand::rng();
        let mut buf = [0u8; 16];
        b.iter(|| {
            let sel = element_row(rng.random_range(0..ROWS), rng.random_range(0..COLS - 4), 4);
            dset.read(&mut file, black_box(&sel), &mut buf).unwrap();
        });
    });

    group.finish();
}

// ================================================================================================
// Layout benchmarks
// ================================================================================================

/// Benchmark group for whole-row writes per layout.
///
/// # Sub-benchmarks
///
/// ## `row_write/contiguous` and `row_write/chunked`
///
/// **Scenario:** Writes one full row of 512 elements into a file-backed
/// dataset.
///
/// **What it measures:** Cost of mapping a selection onto storage: a
/// single run for contiguous data against eight chunk-sized pieces for a
/// 64x64-chunked dataset.
fn bench_layouts(c: &mut Criterion) {
    let mut group = c.benchmark_group("layout");
    group.throughput(Throughput::Bytes(COLS * 4));

    let specs = [
        ("contiguous", LayoutSpec::Contiguous),
        (
            "chunked",
            LayoutSpec::Chunked {
                chunk_dims: vec![64, 64],
                filtered: false,
            },
        ),
    ];
    for (label, spec) in specs {
        group.bench_function(BenchmarkId::new("row_write", label), |b| {
            let dir = TempDir::new().unwrap();
            let store = FileStore::create(dir.path().join("bench.bin")).unwrap();
            let mut file = Container::new(Box::new(store), StorageConfig::default()).unwrap();
            let mut dset = Dataset::create(
                &mut file,
                Dataspace::simple(&[ROWS, COLS]),
                Datatype::le(4),
                &spec,
            )
            .unwrap();
            let row = vec![0x5Au8; (COLS * 4) as usize];
            let mut r = 0u64;
            b.iter(|| {
                dset.write(&mut file, &element_row(r, 0, COLS), black_box(&row))
                    .unwrap();
                r = (r + 1) % ROWS;
            });
            dset.close(&mut file).unwrap();
        });
    }

    group.finish();
}

// ================================================================================================
// Onion benchmarks
// ================================================================================================

/// Benchmark group for the revisioned store.
///
/// # Sub-benchmarks
///
/// ## `page_write`
///
/// **Scenario:** Writes one 4 KiB page-aligned block per iteration in a
/// single open session.
///
/// **What it measures:** Copy-on-write cost: every write appends a page
/// to the onion file and updates the live index.
///
/// ## `revision_read`
///
/// **Scenario:** Reads a 4 KiB block from a committed revision opened
/// read-only.
///
/// **What it measures:** Archival index lookup plus one positional read.
fn bench_onion(c: &mut Criterion) {
    let mut group = c.benchmark_group("onion");
    group.throughput(Throughput::Bytes(4096));
    let config = OnionConfig::default();
    let space = Dataspace::simple(&[256, 4096]);
    let storage = StorageConfig {
        sieve_buf_size: 0,
        ..StorageConfig::default()
    };

    group.bench_function("page_write", |b| {
        let dir = TempDir::new().unwrap();
        let mut onion = OnionFile::create(dir.path().join("bench.h5"), &config).unwrap();
        let mut dset =
            Dataset::new(space.clone(), Datatype::le(1), &LayoutSpec::Contiguous, &storage)
                .unwrap();
        let page = vec![0xC3u8; 4096];
        let mut r = 0u64;
        b.iter(|| {
            dset.write_to(&mut onion, &element_row(r, 0, 4096), black_box(&page))
                .unwrap();
            r = (r + 1) % 256;
        });
        onion.close().unwrap();
    });

    group.bench_function("revision_read", |b| {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bench.h5");
        let mut onion = OnionFile::create(&path, &config).unwrap();
        let mut dset =
            Dataset::new(space.clone(), Datatype::le(1), &LayoutSpec::Contiguous, &storage)
                .unwrap();
        let data = vec![0x3Cu8; 256 * 4096];
        dset.write_to(&mut onion, &Selection::All, &data).unwrap();
        dset.layout_mut().flush(&mut onion).unwrap();
        let descriptor = dset.descriptor();
        onion.close().unwrap();

        let mut onion = OnionFile::open(&path, &config, false).unwrap();
        let mut dset =
            Dataset::open_from(&onion, &storage, space.clone(), Datatype::le(1), &descriptor)
                .unwrap();
        let mut rng = rand::rng();
        let mut buf = vec![0u8; 4096];
        b.iter(|| {
            let sel = element_row(rng.random_range(0..256), 0, 4096);
            dset.read_from(&mut onion, black_box(&sel), &mut buf).unwrap();
        });
        onion.close().unwrap();
    });

    group.finish();
}

// ================================================================================================
// Group registration
// ================================================================================================

criterion_group!(benches, bench_sieve, bench_layouts, bench_onion);

criterion_main!(benches);
