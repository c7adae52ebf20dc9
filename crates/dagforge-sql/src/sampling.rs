//! Agreement between the static extractor and the template inspector

use crate::extractor::{ExtractedFacts, Unsupported};
use dagforge_jinja::TemplateFacts;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of one sampling comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SamplingResult {
    #[serde(rename = "00_exact_match")]
    ExactMatch,
    #[serde(rename = "01_extractor_unsupported")]
    ExtractorUnsupported,
    #[serde(rename = "02_false_positive_ref")]
    FalsePositiveRef,
    #[serde(rename = "03_missed_ref")]
    MissedRef,
    #[serde(rename = "04_false_positive_source")]
    FalsePositiveSource,
    #[serde(rename = "05_missed_source")]
    MissedSource,
    #[serde(rename = "06_false_positive_config")]
    FalsePositiveConfig,
    #[serde(rename = "07_missed_config")]
    MissedConfig,
}

impl SamplingResult {
    pub fn code(&self) -> &'static str {
        match self {
            SamplingResult::ExactMatch => "00_exact_match",
            SamplingResult::ExtractorUnsupported => "01_extractor_unsupported",
            SamplingResult::FalsePositiveRef => "02_false_positive_ref",
            SamplingResult::MissedRef => "03_missed_ref",
            SamplingResult::FalsePositiveSource => "04_false_positive_source",
            SamplingResult::MissedSource => "05_missed_source",
            SamplingResult::FalsePositiveConfig => "06_false_positive_config",
            SamplingResult::MissedConfig => "07_missed_config",
        }
    }

    /// Whether the two parsers disagreed on a supported template
    pub fn is_mismatch(&self) -> bool {
        !matches!(self, SamplingResult::ExactMatch | SamplingResult::ExtractorUnsupported)
    }
}

impl std::fmt::Display for SamplingResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Compare an extractor result with the inspector's facts
///
/// The first disagreement in code order is reported.
pub fn compare(extracted: &Result<ExtractedFacts, Unsupported>, inspected: &TemplateFacts) -> SamplingResult {
    let extracted = match extracted {
        Ok(facts) => facts,
        Err(_) => return SamplingResult::ExtractorUnsupported,
    };

    if extracted.refs.iter().any(|r| !inspected.refs.contains(r)) {
        return SamplingResult::FalsePositiveRef;
    }
    if inspected.refs.iter().any(|r| !extracted.refs.contains(r)) {
        return SamplingResult::MissedRef;
    }
    if extracted.sources.iter().any(|s| !inspected.sources.contains(s)) {
        return SamplingResult::FalsePositiveSource;
    }
    if inspected.sources.iter().any(|s| !extracted.sources.contains(s)) {
        return SamplingResult::MissedSource;
    }

    let inspected_configs: BTreeMap<&str, Option<&serde_json::Value>> = inspected
        .configs
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_literal()))
        .collect();

    if extracted
        .configs
        .iter()
        .any(|(k, v)| inspected_configs.get(k.as_str()) != Some(&Some(v)))
    {
        return SamplingResult::FalsePositiveConfig;
    }
    if inspected_configs.keys().any(|k| !extracted.configs.contains_key(*k)) {
        return SamplingResult::MissedConfig;
    }

    SamplingResult::ExactMatch
}

/// Counts of sampling results over a parse
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamplingStats {
    pub counts: BTreeMap<SamplingResult, usize>,
}

impl SamplingStats {
    pub fn record(&mut self, result: SamplingResult) {
        *self.counts.entry(result).or_insert(0) += 1;
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }

    pub fn mismatches(&self) -> usize {
        self.counts
            .iter()
            .filter(|(result, _)| result.is_mismatch())
            .map(|(_, count)| count)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::StaticExtractor;
    use dagforge_jinja::inspect;
    use std::collections::BTreeSet;

    fn sample(sql: &str) -> SamplingResult {
        let inspected = inspect(sql, &BTreeSet::new()).unwrap();
        compare(&StaticExtractor::extract(sql), &inspected)
    }

    #[test]
    fn supported_templates_match_exactly() {
        assert_eq!(
            sample("{{ config(materialized='table') }} select * from {{ ref('a') }} join {{ source('s', 't') }}"),
            SamplingResult::ExactMatch
        );
    }

    #[test]
    fn control_flow_is_unsupported() {
        assert_eq!(
            sample("{% if true %} select * from {{ ref('a') }} {% endif %}"),
            SamplingResult::ExtractorUnsupported
        );
    }

    #[test]
    fn disagreements_are_classified() {
        let mut inspected = inspect("select * from {{ ref('a') }}", &BTreeSet::new()).unwrap();
        let extracted = StaticExtractor::extract("select * from {{ ref('a') }} join {{ ref('b') }}");
        assert_eq!(compare(&extracted, &inspected), SamplingResult::FalsePositiveRef);

        inspected.refs.push(dagforge_jinja::RefCall::new("c"));
        let extracted = StaticExtractor::extract("select * from {{ ref('a') }}");
        assert_eq!(compare(&extracted, &inspected), SamplingResult::MissedRef);
    }

    #[test]
    fn stats_count_mismatches() {
        let mut stats = SamplingStats::default();
        stats.record(SamplingResult::ExactMatch);
        stats.record(SamplingResult::MissedConfig);
        stats.record(SamplingResult::ExtractorUnsupported);
        assert_eq!(stats.total(), 3);
        assert_eq!(stats.mismatches(), 1);
        assert_eq!(SamplingResult::MissedConfig.to_string(), "07_missed_config");
    }
}
