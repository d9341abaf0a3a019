//! CSV and JSON export of aggregated statistics.
//!
//! Both serializers recompute conversion rates from the raw counters through
//! [`conversion_rate`], so exports can never disagree with the admin table.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, UtcOffset};
use ulid::Ulid;

use crate::{
    conversion_rate, format_rfc3339, summarize_by_test, StatsError, TestTotals, TestVariantCounter,
};

/// Header row of the CSV export.
pub const CSV_HEADER: [&str; 5] = [
    "Test Name",
    "Variant",
    "Views",
    "Conversions",
    "Conversion Rate (%)",
];

const UTF8_BOM: [u8; 3] = [0xEF, 0xBB, 0xBF];

/// Serializes the counters to CSV: UTF-8 BOM, header row, then one row per
/// counter in input order.
///
/// # Errors
/// Returns [`StatsError::Export`] when the CSV writer fails.
pub fn export_csv(counters: &[TestVariantCounter]) -> Result<Vec<u8>, StatsError> {
    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(CSV_HEADER)
        .map_err(|err| StatsError::Export(format!("failed to write CSV header: {err}")))?;

    for counter in counters {
        let rate = conversion_rate(counter.conversions, counter.views);
        let record = [
            counter.test_name.clone(),
            counter.variant.clone(),
            counter.views.to_string(),
            counter.conversions.to_string(),
            rate.to_string(),
        ];
        writer
            .write_record(&record)
            .map_err(|err| StatsError::Export(format!("failed to write CSV row: {err}")))?;
    }

    let body = writer
        .into_inner()
        .map_err(|err| StatsError::Export(format!("failed to flush CSV writer: {err}")))?;

    let mut output = Vec::with_capacity(UTF8_BOM.len() + body.len());
    output.extend_from_slice(&UTF8_BOM);
    output.extend_from_slice(&body);
    Ok(output)
}

/// Per-variant figures in the JSON export.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VariantReport {
    pub variant: String,
    pub views: u64,
    pub conversions: u64,
    pub conversion_rate: f64,
    pub created_at: String,
    pub updated_at: String,
}

/// One test's variants plus derived totals in the JSON export.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestReport {
    pub test_name: String,
    pub variants: Vec<VariantReport>,
    pub totals: TestTotals,
}

/// Root of the JSON export artifact.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExportDocument {
    pub exported_at: String,
    pub tests: Vec<TestReport>,
}

/// Builds the JSON export document, grouping counters by test in input
/// order and deriving totals through the shared aggregation.
///
/// # Errors
/// Returns [`StatsError::InvalidInput`] when a stored timestamp cannot be
/// formatted.
pub fn export_json(
    counters: &[TestVariantCounter],
    exported_at: OffsetDateTime,
) -> Result<ExportDocument, StatsError> {
    let tests = summarize_by_test(counters)
        .into_iter()
        .map(|summary| {
            let variants = summary
                .counters
                .iter()
                .map(|counter| {
                    Ok(VariantReport {
                        variant: counter.variant.clone(),
                        views: counter.views,
                        conversions: counter.conversions,
                        conversion_rate: conversion_rate(counter.conversions, counter.views),
                        created_at: format_rfc3339(counter.created_at)?,
                        updated_at: format_rfc3339(counter.updated_at)?,
                    })
                })
                .collect::<Result<Vec<_>, StatsError>>()?;

            Ok(TestReport {
                test_name: summary.test_name,
                variants,
                totals: summary.totals,
            })
        })
        .collect::<Result<Vec<_>, StatsError>>()?;

    Ok(ExportDocument {
        exported_at: format_rfc3339(exported_at)?,
        tests,
    })
}

/// Generates the download filename for an export artifact, stamped with the
/// export time: `ab-test-stats-<YYYY-MM-DD-HH-MM-SS>.<ext>`.
///
/// # Errors
/// Returns [`StatsError::Export`] when the timestamp cannot be formatted.
pub fn export_filename(extension: &str, at: OffsetDateTime) -> Result<String, StatsError> {
    let format =
        time::format_description::parse("[year]-[month]-[day]-[hour]-[minute]-[second]")
            .map_err(|err| StatsError::Export(format!("invalid filename format: {err}")))?;

    let stamp = at
        .to_offset(UtcOffset::UTC)
        .format(&format)
        .map_err(|err| StatsError::Export(format!("failed to format filename stamp: {err}")))?;

    Ok(format!("ab-test-stats-{stamp}.{extension}"))
}

/// Issues fresh single-purpose anti-replay tokens for export links.
///
/// Each token redeems exactly once; the authorizing collaborator checks
/// `redeem` before invoking a serializer.
#[derive(Debug, Default)]
pub struct ExportTokenIssuer {
    outstanding: BTreeSet<String>,
}

impl ExportTokenIssuer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue(&mut self) -> String {
        let token = Ulid::new().to_string();
        self.outstanding.insert(token.clone());
        token
    }

    /// Consumes `token`. Returns `false` for unknown or already-redeemed
    /// tokens.
    pub fn redeem(&mut self, token: &str) -> bool {
        self.outstanding.remove(token)
    }
}
