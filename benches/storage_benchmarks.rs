//! Local store benchmarks
//!
//! - MD5 over files of increasing size (remove verification, checksum jobs)
//! - Upload throughput (fetch into temp, rename into place)
//! - Get at an offset
//! - Checksum batch job over a directory of files

use bitarchive::admission::{AdmissionController, FixedSpaceProbe};
use bitarchive::batch::{BatchJob, ChecksumJob};
use bitarchive::checksum::md5_file;
use bitarchive::storage::ArchiveStore;
use bitarchive::transfer::{LocalFileTransfer, RemoteFile};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::RngCore;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

/// Write `size` random bytes to `path`
fn create_random_file(path: &Path, size: usize) {
    let mut data = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut data);
    std::fs::write(path, data).unwrap();
}

fn open_store(tmp: &TempDir) -> ArchiveStore {
    let root: PathBuf = tmp.path().join("ba");
    let admission = Arc::new(AdmissionController::new(
        Arc::new(FixedSpaceProbe::new(u64::MAX)),
        vec![root.clone()],
        0,
        false,
    ));
    let transfer = Arc::new(LocalFileTransfer::new(tmp.path().join("staging")).unwrap());
    ArchiveStore::open(&[root], admission, transfer, "bench").unwrap()
}

/// Benchmark MD5 of a file on disk
fn bench_md5_file(c: &mut Criterion) {
    let mut group = c.benchmark_group("md5_file");
    let tmp = tempfile::tempdir().unwrap();

    for size in [64 * 1024, 1024 * 1024, 16 * 1024 * 1024] {
        let path = tmp.path().join(format!("md5-{size}.arc"));
        create_random_file(&path, size);

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &path, |b, path| {
            b.iter(|| black_box(md5_file(path).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark upload of a fresh file name each iteration
fn bench_upload(c: &mut Criterion) {
    let mut group = c.benchmark_group("upload");
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp);
    let counter = AtomicU64::new(0);

    for size in [64 * 1024, 1024 * 1024] {
        let path = tmp.path().join(format!("source-{size}.arc"));
        create_random_file(&path, size);
        let source = RemoteFile::local(&path).unwrap();

        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &source, |b, source| {
            b.iter(|| {
                let n = counter.fetch_add(1, Ordering::Relaxed);
                black_box(store.upload(source, &format!("f{size}-{n}.arc")).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark get from the middle of a stored file
fn bench_get_at_offset(c: &mut Criterion) {
    let mut group = c.benchmark_group("get_at_offset");
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp);

    for size in [64 * 1024, 4 * 1024 * 1024] {
        let path = tmp.path().join(format!("get-src-{size}.arc"));
        create_random_file(&path, size);
        let name = format!("get-{size}.arc");
        store.upload(&RemoteFile::local(&path).unwrap(), &name).unwrap();

        group.throughput(Throughput::Bytes((size / 2) as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &name, |b, name| {
            b.iter(|| black_box(store.get(name, (size / 2) as u64).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark checksum job over every stored file
fn bench_checksum_job(c: &mut Criterion) {
    let mut group = c.benchmark_group("checksum_job");
    let tmp = tempfile::tempdir().unwrap();
    let store = open_store(&tmp);

    for i in 0..64 {
        let path = tmp.path().join(format!("job-src-{i}.arc"));
        create_random_file(&path, 64 * 1024);
        store
            .upload(&RemoteFile::local(&path).unwrap(), &format!("job-{i}.arc"))
            .unwrap();
    }
    let files = store.file_paths().unwrap();

    group.bench_function("64_files_64k", |b| {
        b.iter(|| {
            let mut job = ChecksumJob::new();
            let mut output = Vec::new();
            for file in &files {
                job.process_file(file, &mut output).unwrap();
            }
            black_box(output);
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_md5_file,
    bench_upload,
    bench_get_at_offset,
    bench_checksum_job
);
criterion_main!(benches);
