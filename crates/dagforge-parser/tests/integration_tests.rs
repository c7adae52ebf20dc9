//! End-to-end parser tests over projects written to a temp directory

use dagforge_core::{Config, Diagnostic, DiagnosticCode, Report};
use dagforge_engine::{compile_manifest, CompileOptions};
use dagforge_manifest::{Language, ResourceType};
use dagforge_parser::{ParseOutput, ProjectParser};
use pretty_assertions::assert_eq;
use std::path::Path;
use tempfile::TempDir;

const PROJECT: &str = "name: shop\nconfig-version: 2\nprofile: shop\n";

fn write_project(files: &[(&str, &str)]) -> TempDir {
    let dir = tempfile::tempdir().unwrap();
    for (path, contents) in files {
        let full = dir.path().join(path);
        std::fs::create_dir_all(full.parent().unwrap()).unwrap();
        std::fs::write(full, contents).unwrap();
    }
    dir
}

fn config_for(root: &Path) -> Config {
    Config {
        project_root: root.to_path_buf(),
        ..Config::default()
    }
}

fn parse(files: &[(&str, &str)]) -> (TempDir, ProjectParser, ParseOutput) {
    let dir = write_project(files);
    let parser = ProjectParser::new(&config_for(dir.path())).unwrap();
    let output = parser.parse().unwrap();
    (dir, parser, output)
}

fn compile(parser: &ProjectParser, output: &mut ParseOutput) -> Report {
    let order = output.linked.as_ref().expect("acyclic graph").order.clone();
    let options = CompileOptions::new(parser.config().target.clone(), parser.resolve_context());
    compile_manifest(&mut output.manifest, &order, options)
}

fn with_code(report: &Report, code: DiagnosticCode) -> Vec<&Diagnostic> {
    report.diagnostics.iter().filter(|d| d.code == code).collect()
}

fn messages(report: &Report) -> Vec<String> {
    report.diagnostics.iter().map(|d| d.message.clone()).collect()
}

#[test]
fn project_config_sources_and_generic_tests() {
    let (_dir, _parser, output) = parse(&[
        (
            "dbt_project.yml",
            "name: shop\nconfig-version: 2\nmodels:\n  shop:\n    +tags: [nightly]\n    marts:\n      +materialized: table\n",
        ),
        ("models/staging/stg_orders.sql", "select * from {{ source('raw', 'orders') }}"),
        (
            "models/marts/orders.sql",
            "{{ config(tags=['finance']) }}\nselect * from {{ ref('stg_orders') }}",
        ),
        (
            "models/schema.yml",
            "sources:\n  - name: raw\n    tables:\n      - name: orders\nmodels:\n  - name: orders\n    description: One row per order\n    columns:\n      - name: id\n        data_tests: [unique, not_null]\n",
        ),
    ]);
    assert!(!output.report.has_errors(), "{:?}", messages(&output.report));

    let orders = &output.manifest.nodes["model.shop.orders"];
    assert_eq!(orders.config.materialized, "table");
    assert!(orders.config.tags.contains(&"nightly".to_string()));
    assert!(orders.config.tags.contains(&"finance".to_string()));
    assert_eq!(orders.description, "One row per order");
    assert_eq!(orders.patch_path.as_deref(), Some("shop://models/schema.yml"));
    assert_eq!(orders.depends_on.nodes, vec!["model.shop.stg_orders".to_string()]);

    let staging = &output.manifest.nodes["model.shop.stg_orders"];
    assert_eq!(staging.config.materialized, "view");
    assert_eq!(staging.depends_on.nodes, vec!["source.shop.raw.orders".to_string()]);

    let tests: Vec<_> = output
        .manifest
        .nodes
        .values()
        .filter(|n| n.resource_type == ResourceType::Test)
        .collect();
    assert_eq!(tests.len(), 2);
    for test in tests {
        assert_eq!(test.attached_node.as_deref(), Some("model.shop.orders"));
        assert_eq!(test.config.materialized, "test");
        assert_eq!(test.config.severity.as_deref(), Some("ERROR"));
        assert!(test.depends_on.nodes.contains(&"model.shop.orders".to_string()));
    }

    let schema_file = &output.manifest.files["shop://models/schema.yml"];
    assert!(schema_file.contributed.contains(&"source.shop.raw.orders".to_string()));
    assert!(schema_file.patches.contains(&"model.shop.orders".to_string()));
}

#[test]
fn ephemeral_models_are_injected_as_ctes() {
    let (_dir, parser, mut output) = parse(&[
        ("dbt_project.yml", PROJECT),
        (
            "models/ephemeral_level_two.sql",
            "{{ config(materialized='ephemeral') }}\nselect 1 as id",
        ),
        (
            "models/ephemeral.sql",
            "{{ config(materialized='ephemeral') }}\nselect * from {{ ref('ephemeral_level_two') }}",
        ),
        ("models/view_model.sql", "select * from {{ ref('ephemeral') }}"),
    ]);
    assert!(!output.report.has_errors(), "{:?}", messages(&output.report));

    let report = compile(&parser, &mut output);
    assert!(!report.has_errors(), "{:?}", messages(&report));
    let compiled = output.manifest.nodes["model.shop.view_model"]
        .compiled_code
        .clone()
        .unwrap();
    let level_two = compiled.find("__dbt__CTE__ephemeral_level_two as (").unwrap();
    let level_one = compiled.find("__dbt__CTE__ephemeral as (").unwrap();
    assert!(level_two < level_one);
    assert!(compiled.contains("from __dbt__CTE__ephemeral"));
}

#[test]
fn refs_to_disabled_models_fail_compilation() {
    let (_dir, parser, mut output) = parse(&[
        ("dbt_project.yml", PROJECT),
        ("models/a.sql", "select * from {{ ref('b') }}"),
        ("models/b.sql", "{{ config(enabled=false) }}\nselect 1 as id"),
    ]);
    assert!(!output.manifest.nodes.contains_key("model.shop.b"));
    assert!(output.manifest.disabled.contains_key("model.shop.b"));
    assert_eq!(
        output.manifest.disabled_refs["model.shop.a"],
        vec!["model.shop.b".to_string()]
    );

    let report = compile(&parser, &mut output);
    assert!(report.has_errors());
    assert!(messages(&report)
        .iter()
        .any(|m| m.contains("depends on disabled node model.shop.b")));
}

#[test]
fn ambiguous_refs_list_every_candidate() {
    let (_dir, _parser, output) = parse(&[
        ("dbt_project.yml", PROJECT),
        ("models/report.sql", "select * from {{ ref('shared') }}"),
        ("dbt_packages/pkg_a/dbt_project.yml", "name: pkg_a\n"),
        ("dbt_packages/pkg_a/models/shared.sql", "select 1 as id"),
        ("dbt_packages/pkg_b/dbt_project.yml", "name: pkg_b\n"),
        ("dbt_packages/pkg_b/models/shared.sql", "select 2 as id"),
    ]);
    let message = messages(&output.report)
        .into_iter()
        .find(|m| m.contains("more than one node"))
        .expect("ambiguity reported");
    assert!(message.contains("model.pkg_a.shared"));
    assert!(message.contains("model.pkg_b.shared"));
}

#[test]
fn private_models_are_only_visible_inside_their_group() {
    let (_dir, _parser, output) = parse(&[
        ("dbt_project.yml", PROJECT),
        ("models/revenue.sql", "select 1 as amount"),
        ("models/campaigns.sql", "select * from {{ ref('revenue') }}"),
        (
            "models/schema.yml",
            "groups:\n  - name: finance\n    owner: {name: Finance}\n  - name: marketing\n    owner: {name: Marketing}\nmodels:\n  - name: revenue\n    access: private\n    group: finance\n  - name: campaigns\n    group: marketing\n",
        ),
    ]);
    let denied = messages(&output.report)
        .into_iter()
        .find(|m| m.contains("not allowed"))
        .expect("access error");
    assert!(denied.contains("model.shop.campaigns"));
    assert!(denied.contains("model.shop.revenue"));
}

#[test]
fn column_tests_on_private_models_join_the_model_group() {
    let (_dir, _parser, output) = parse(&[
        ("dbt_project.yml", PROJECT),
        ("models/revenue.sql", "select 1 as id"),
        (
            "models/schema.yml",
            "groups:\n  - name: finance\n    owner: {name: Finance}\nmodels:\n  - name: revenue\n    access: private\n    group: finance\n    columns:\n      - name: id\n        data_tests: [not_null]\n",
        ),
    ]);
    assert!(!output.report.has_errors(), "{:?}", messages(&output.report));

    let test = output
        .manifest
        .nodes
        .values()
        .find(|n| n.resource_type == ResourceType::Test)
        .expect("generic test");
    assert_eq!(test.config.group.as_deref(), Some("finance"));
    assert_eq!(test.depends_on.nodes, vec!["model.shop.revenue".to_string()]);
}

#[test]
fn private_access_requires_a_group() {
    let (_dir, _parser, output) = parse(&[
        ("dbt_project.yml", PROJECT),
        ("models/revenue.sql", "select 1 as amount"),
        ("models/schema.yml", "models:\n  - name: revenue\n    access: private\n"),
    ]);
    assert!(!with_code(&output.report, DiagnosticCode::AccessWithoutGroup).is_empty());
}

#[test]
fn unpinned_refs_resolve_to_the_declared_latest_version() {
    let (_dir, parser, mut output) = parse(&[
        ("dbt_project.yml", PROJECT),
        ("models/dim_customers_v1.sql", "select 1 as id"),
        ("models/dim_customers_v2.sql", "select 1 as id, 'x' as name"),
        ("models/orders.sql", "select * from {{ ref('dim_customers') }}"),
        (
            "models/schema.yml",
            "models:\n  - name: dim_customers\n    latest_version: 1\n    versions:\n      - v: 1\n      - v: 2\n",
        ),
    ]);
    assert!(!output.report.has_errors(), "{:?}", messages(&output.report));

    let v1 = &output.manifest.nodes["model.shop.dim_customers.v1"];
    assert_eq!(v1.version.as_deref(), Some("1"));
    assert_eq!(v1.latest_version.as_deref(), Some("1"));
    assert_eq!(v1.alias, "dim_customers_v1");
    assert!(output.manifest.nodes.contains_key("model.shop.dim_customers.v2"));

    let orders = &output.manifest.nodes["model.shop.orders"];
    assert_eq!(orders.depends_on.nodes, vec!["model.shop.dim_customers.v1".to_string()]);

    let compiled = compile(&parser, &mut output);
    assert!(!compiled.has_errors(), "{:?}", messages(&compiled));
    assert!(messages(&compiled)
        .iter()
        .any(|m| m.contains("newer version v2 available")));
}

#[test]
fn declared_versions_need_a_file() {
    let (_dir, _parser, output) = parse(&[
        ("dbt_project.yml", PROJECT),
        ("models/dim_customers_v1.sql", "select 1 as id"),
        (
            "models/schema.yml",
            "models:\n  - name: dim_customers\n    versions:\n      - v: 1\n      - v: 2\n",
        ),
    ]);
    let errors = with_code(&output.report, DiagnosticCode::VersionedModelInvalid);
    assert_eq!(errors.len(), 1);
    assert!(errors[0].message.contains("version 2"));
}

#[test]
fn python_models_default_to_table() {
    let (_dir, _parser, output) = parse(&[
        ("dbt_project.yml", PROJECT),
        ("models/stg_orders.sql", "select 1 as id"),
        (
            "models/py_orders.py",
            "def model(dbt, session):\n    orders = dbt.ref('stg_orders')\n    return orders\n",
        ),
    ]);
    assert!(!output.report.has_errors(), "{:?}", messages(&output.report));
    let node = &output.manifest.nodes["model.shop.py_orders"];
    assert_eq!(node.language, Language::Python);
    assert_eq!(node.config.materialized, "table");
    assert_eq!(node.depends_on.nodes, vec!["model.shop.stg_orders".to_string()]);
}

#[test]
fn duplicate_yaml_keys_are_reported() {
    let (_dir, _parser, output) = parse(&[
        ("dbt_project.yml", PROJECT),
        ("models/a.sql", "select 1 as id"),
        (
            "models/schema.yml",
            "models:\n  - name: a\n    description: first\n    description: second\n",
        ),
    ]);
    assert!(!with_code(&output.report, DiagnosticCode::DuplicateYamlKey).is_empty());
    assert!(output.manifest.nodes.contains_key("model.shop.a"));
}

#[test]
fn hooks_unit_tests_and_env_vars() {
    std::env::set_var("DAGFORGE_PARSER_IT_SCHEMA", "reporting");
    let (_dir, _parser, output) = parse(&[
        (
            "dbt_project.yml",
            "name: shop\non-run-start:\n  - \"create schema if not exists audit\"\non-run-end: \"select 1\"\n",
        ),
        ("models/stg_orders.sql", "select 1 as id"),
        (
            "models/orders.sql",
            "{{ config(schema=env_var('DAGFORGE_PARSER_IT_SCHEMA')) }}\nselect * from {{ ref('stg_orders') }}",
        ),
        (
            "models/unit_tests.yml",
            "unit_tests:\n  - name: keeps_ids\n    model: orders\n    given:\n      - input: ref('stg_orders')\n        rows:\n          - {id: 1}\n    expect:\n      rows:\n        - {id: 1}\n",
        ),
    ]);
    assert!(!output.report.has_errors(), "{:?}", messages(&output.report));

    let start = &output.manifest.nodes["operation.shop.shop-on-run-start-0"];
    assert_eq!(start.config.tags, vec!["on-run-start".to_string()]);
    assert!(output.manifest.nodes.contains_key("operation.shop.shop-on-run-end-0"));

    let unit_test = &output.manifest.unit_tests["unit_test.shop.orders.keeps_ids"];
    assert_eq!(unit_test.given[0].input, "ref('stg_orders')");
    assert!(unit_test.depends_on.nodes.contains(&"model.shop.orders".to_string()));

    let orders = &output.manifest.nodes["model.shop.orders"];
    assert_eq!(orders.config.schema.as_deref(), Some("reporting"));
    assert_eq!(orders.schema, "public_reporting");
    let record = &output.manifest.files["shop://models/orders.sql"];
    assert!(record.env_vars.contains(&"DAGFORGE_PARSER_IT_SCHEMA".to_string()));
}

#[test]
fn missing_packages_stop_the_parse() {
    let dir = write_project(&[
        ("dbt_project.yml", PROJECT),
        ("packages.yml", "packages:\n  - package: dbt-labs/dbt_utils\n    version: 1.1.1\n"),
    ]);
    let err = ProjectParser::new(&config_for(dir.path())).unwrap_err();
    assert_eq!(err.code(), DiagnosticCode::PackageNotInstalled);
}
