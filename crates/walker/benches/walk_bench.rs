//! Tree walk benchmarks

use constellation_core::SnapshotRef;
use constellation_walker::{ExcludeRules, TreeWalker};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// `dirs` directories of `files_per_dir` small source files each
fn build_tree(root: &Path, dirs: usize, files_per_dir: usize) {
    for d in 0..dirs {
        let dir = root.join(format!("module_{d:03}"));
        fs::create_dir_all(&dir).unwrap();
        for f in 0..files_per_dir {
            fs::write(
                dir.join(format!("file_{f:03}.rs")),
                format!("pub fn f_{d}_{f}() -> usize {{\n    {d} * {f}\n}}\n"),
            )
            .unwrap();
        }
    }
}

fn bench_walk(c: &mut Criterion) {
    let mut group = c.benchmark_group("walk");
    for (dirs, files) in [(10, 10), (50, 20)] {
        let temp = TempDir::new().unwrap();
        build_tree(temp.path(), dirs, files);
        let walker = TreeWalker::new(temp.path(), ExcludeRules::builtin(temp.path()));

        group.bench_with_input(BenchmarkId::from_parameter(dirs * files), &walker, |b, walker| {
            b.iter(|| black_box(walker.walk().unwrap()));
        });
    }
    group.finish();
}

fn bench_incremental_rewalk(c: &mut Criterion) {
    let temp = TempDir::new().unwrap();
    build_tree(temp.path(), 50, 20);
    let walker = TreeWalker::new(temp.path(), ExcludeRules::builtin(temp.path()));
    walker.walk().unwrap();

    // Edit a few files so every walk re-hashes the same small set
    for f in 0..5 {
        fs::write(temp.path().join(format!("module_007/file_{f:03}.rs")), "changed").unwrap();
    }

    c.bench_function("snapshot_after_edits_1000", |b| {
        b.iter(|| black_box(walker.snapshot(2, SnapshotRef::Sequence(2), 0).unwrap()));
    });
}

criterion_group!(benches, bench_walk, bench_incremental_rewalk);
criterion_main!(benches);
