//! Integration tests for SQL-side analysis

use dagforge_jinja::inspect;
use dagforge_manifest::{ColumnInfo, ContractConfig, ContractExtractor, Node, NodeConfig, ResourceType};
use dagforge_sql::{check_contract, compare, ContractOutcome, SamplingResult, SqlParser, StaticExtractor};
use std::collections::BTreeSet;

#[test]
fn sampling_over_typical_models() {
    let models = [
        ("select * from {{ ref('stg_orders') }}", SamplingResult::ExactMatch),
        (
            "{{ config(materialized='incremental', unique_key='id') }}\nselect * from {{ source('raw', 'events') }}",
            SamplingResult::ExactMatch,
        ),
        (
            "{% set cols = ['a', 'b'] %}select {{ cols | join(', ') }} from {{ ref('t') }}",
            SamplingResult::ExtractorUnsupported,
        ),
        ("select * from {{ ref('shop', 'orders', v=1) }}", SamplingResult::ExactMatch),
    ];

    for (sql, expected) in models {
        let inspected = inspect(sql, &BTreeSet::new()).unwrap();
        assert_eq!(compare(&StaticExtractor::extract(sql), &inspected), expected, "{}", sql);
    }
}

#[test]
fn contract_preflight_from_manifest_node() {
    let mut node = Node::new(ResourceType::Model, "shop", "orders", "models/orders.sql").with_config(NodeConfig {
        contract: ContractConfig {
            enforced: true,
            alias_types: true,
        },
        ..NodeConfig::default()
    });
    for name in ["order_id", "amount"] {
        node.columns.insert(
            name.to_string(),
            ColumnInfo {
                name: name.to_string(),
                data_type: Some("int".to_string()),
                ..ColumnInfo::default()
            },
        );
    }

    let contract = ContractExtractor::extract_from_node(&node).unwrap();
    let parser = SqlParser::for_adapter("postgres");

    let ok = check_contract(&parser, &contract, "select order_id, sum(x) as amount from t group by 1");
    assert_eq!(ok, Ok(ContractOutcome::Verified));

    let err = check_contract(&parser, &contract, "select order_id from t").unwrap_err();
    assert!(err.to_string().contains("missing columns [amount]"));
}
