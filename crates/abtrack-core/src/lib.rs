//! Core domain model for A/B test tracking: per-variant counters, the one
//! conversion-rate formula, per-test aggregation, the client-side variant
//! selector ([`selector`]) and the export serializers ([`export`]).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};

pub mod export;
pub mod selector;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum StatsError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("storage failure: {0}")]
    StorageFailure(String),
    #[error("export failure: {0}")]
    Export(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    View,
    Conversion,
}

impl EventKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Conversion => "conversion",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "view" => Some(Self::View),
            "conversion" => Some(Self::Conversion),
            _ => None,
        }
    }
}

/// One tracking submission: a view or conversion for a (test, variant) pair.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct TrackingEvent {
    pub test_name: String,
    pub variant: String,
    pub kind: EventKind,
}

impl TrackingEvent {
    pub fn view(test_name: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            variant: variant.into(),
            kind: EventKind::View,
        }
    }

    pub fn conversion(test_name: impl Into<String>, variant: impl Into<String>) -> Self {
        Self {
            test_name: test_name.into(),
            variant: variant.into(),
            kind: EventKind::Conversion,
        }
    }

    /// Trims both keys, rejecting a pair that is empty after trimming.
    ///
    /// # Errors
    /// Returns [`StatsError::InvalidInput`] when `test_name` or `variant`
    /// trims down to the empty string.
    pub fn normalized(&self) -> Result<Self, StatsError> {
        Ok(Self {
            test_name: normalize_key(&self.test_name, "test_name")?,
            variant: normalize_key(&self.variant, "variant")?,
            kind: self.kind,
        })
    }
}

/// Trims a tracking key and rejects empties.
///
/// # Errors
/// Returns [`StatsError::InvalidInput`] when `raw` trims down to the empty
/// string.
pub fn normalize_key(raw: &str, field: &str) -> Result<String, StatsError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(StatsError::InvalidInput(format!(
            "{field} MUST be non-empty"
        )));
    }
    Ok(trimmed.to_string())
}

/// Durable view/conversion counters for one (test, variant) pair.
///
/// Exactly one counter exists per pair; both counts only ever grow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestVariantCounter {
    pub test_name: String,
    pub variant: String,
    pub views: u64,
    pub conversions: u64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl TestVariantCounter {
    #[must_use]
    pub fn conversion_rate(&self) -> f64 {
        conversion_rate(self.conversions, self.views)
    }
}

/// Summed counts across all variants of one test.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TestTotals {
    pub views: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
}

/// One test's counters plus its derived totals, in variant order.
#[derive(Debug, Clone, PartialEq)]
pub struct TestSummary {
    pub test_name: String,
    pub counters: Vec<TestVariantCounter>,
    pub totals: TestTotals,
}

/// Groups counters by test name and derives per-test totals.
///
/// Counters keep their input order inside each group, so feeding rows sorted
/// by `(test_name, variant)` yields tests sorted by name and variants sorted
/// inside each test.
#[must_use]
pub fn summarize_by_test(counters: &[TestVariantCounter]) -> Vec<TestSummary> {
    let mut grouped: BTreeMap<String, Vec<TestVariantCounter>> = BTreeMap::new();
    for counter in counters {
        grouped
            .entry(counter.test_name.clone())
            .or_default()
            .push(counter.clone());
    }

    grouped
        .into_iter()
        .map(|(test_name, counters)| {
            let views = counters.iter().map(|counter| counter.views).sum();
            let conversions = counters.iter().map(|counter| counter.conversions).sum();
            TestSummary {
                test_name,
                counters,
                totals: TestTotals {
                    views,
                    conversions,
                    conversion_rate: conversion_rate(conversions, views),
                },
            }
        })
        .collect()
}

/// The one conversion-rate formula, shared by the admin table and both
/// exporters: `conversions / views * 100` rounded to two decimals, `0` when
/// there are no views.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn conversion_rate(conversions: u64, views: u64) -> f64 {
    if views == 0 {
        return 0.0;
    }

    let raw = conversions as f64 / views as f64 * 100.0;
    (raw * 100.0).round() / 100.0
}

/// Display treatment for a rate figure: zero rates render neutral, anything
/// above zero is highlighted.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RateStyle {
    Neutral,
    Positive,
}

#[must_use]
pub fn rate_style(rate: f64) -> RateStyle {
    if rate > 0.0 {
        RateStyle::Positive
    } else {
        RateStyle::Neutral
    }
}

/// Parses an RFC3339 timestamp and requires UTC (`Z`) offset.
///
/// # Errors
/// Returns [`StatsError::InvalidInput`] when parsing fails or the timestamp
/// is not UTC.
pub fn parse_rfc3339_utc(value: &str) -> Result<OffsetDateTime, StatsError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| StatsError::InvalidInput(format!("invalid RFC3339 timestamp: {err}")))?;

    if parsed.offset() != UtcOffset::UTC {
        return Err(StatsError::InvalidInput(
            "timestamp MUST use UTC offset Z".to_string(),
        ));
    }

    Ok(parsed)
}

/// Formats a timestamp as RFC3339 after normalizing to UTC.
///
/// # Errors
/// Returns [`StatsError::InvalidInput`] when formatting fails.
pub fn format_rfc3339(value: OffsetDateTime) -> Result<String, StatsError> {
    value
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| StatsError::InvalidInput(format!("failed to format timestamp: {err}")))
}

#[must_use]
pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc().to_offset(UtcOffset::UTC)
}
