//! Benchmarks for full versus incremental project parsing
//!
//! Each project is a chain of N models where every model refs the previous
//! two, plus one properties file patching every model.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dagforge_core::Config;
use dagforge_incremental::IncrementalParser;
use dagforge_parser::ProjectParser;
use std::path::Path;

fn write(root: &Path, path: &str, contents: &str) {
    let full = root.join(path);
    std::fs::create_dir_all(full.parent().unwrap()).unwrap();
    std::fs::write(full, contents).unwrap();
}

fn model_sql(i: usize) -> String {
    match i {
        0 => "select 1 as id".to_string(),
        1 => "select * from {{ ref('model_0') }}".to_string(),
        _ => format!(
            "select a.id from {{{{ ref('model_{}') }}}} a join {{{{ ref('model_{}') }}}} b on a.id = b.id",
            i - 1,
            i - 2
        ),
    }
}

fn generate_project(root: &Path, num_models: usize) {
    write(root, "dbt_project.yml", "name: bench\nconfig-version: 2\n");
    let mut yaml = String::from("models:\n");
    for i in 0..num_models {
        write(root, &format!("models/model_{}.sql", i), &model_sql(i));
        yaml.push_str(&format!(
            "  - name: model_{}\n    columns:\n      - name: id\n        data_tests: [not_null]\n",
            i
        ));
    }
    write(root, "models/schema.yml", &yaml);
}

fn config_for(root: &Path) -> Config {
    Config {
        project_root: root.to_path_buf(),
        ..Config::default()
    }
}

fn bench_full_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("full_parse");
    for size in [10, 100, 500] {
        let dir = tempfile::tempdir().unwrap();
        generate_project(dir.path(), size);
        let config = config_for(dir.path());

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let parser = ProjectParser::new(&config).unwrap();
                black_box(parser.parse().unwrap())
            });
        });
    }
    group.finish();
}

fn bench_single_file_edit(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_file_edit");
    for size in [10, 100, 500] {
        let dir = tempfile::tempdir().unwrap();
        generate_project(dir.path(), size);
        let config = config_for(dir.path());
        let mut session = IncrementalParser::new(ProjectParser::new(&config).unwrap());
        session.parse().unwrap();

        let edited = format!("models/model_{}.sql", size / 2);
        let mut toggle = false;
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                toggle = !toggle;
                let sql = if toggle { "select 2 as id" } else { "select 3 as id" };
                write(dir.path(), &edited, sql);
                black_box(session.parse().unwrap())
            });
        });
    }
    group.finish();
}

fn bench_saved_parse(c: &mut Criterion) {
    let mut group = c.benchmark_group("saved_parse");
    for size in [100, 500] {
        let dir = tempfile::tempdir().unwrap();
        generate_project(dir.path(), size);
        let config = config_for(dir.path());
        let mut session = IncrementalParser::for_config(&config).unwrap();
        session.parse().unwrap();
        session.save().unwrap();

        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let mut next = IncrementalParser::for_config(&config).unwrap();
                black_box(next.parse().unwrap())
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_full_parse, bench_single_file_edit, bench_saved_parse);
criterion_main!(benches);
