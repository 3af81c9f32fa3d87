//! Post-load checks: row-count comparison and range predicates.
//!
//! Failures are recorded in the error log; nothing is remediated.

use anyhow::Result;
use ingest_core::{SharedErrorLog, Stage, TableProbe, ValidationSpec, Violation};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// What the load itself observed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct LoadCounts {
    /// Records read from the source
    pub source_rows: u64,
    /// Records the mapper rejected
    pub rejected_rows: u64,
    /// Rows the sink reports as written
    pub written_rows: u64,
    /// Destination row count before the load, when the destination can be probed
    pub table_rows_before: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub source_rows: u64,
    /// Rows the destination gained during this load
    pub loaded_rows: u64,
    pub rejected_rows: u64,
    /// Destination row count after the load, when it can be probed
    pub table_rows: Option<u64>,
    /// Loaded rows equal source rows, or the row count check is off
    pub count_matches: bool,
    pub violations: Vec<Violation>,
}

impl ValidationReport {
    /// True when the counts agree and no range check failed
    pub fn is_clean(&self) -> bool {
        self.count_matches && self.violations.is_empty()
    }
}

pub struct Validator {
    spec: ValidationSpec,
    errors: SharedErrorLog,
}

impl Validator {
    pub fn new(spec: ValidationSpec, errors: SharedErrorLog) -> Self {
        Self { spec, errors }
    }

    pub fn validate(
        &self,
        counts: LoadCounts,
        probe: Option<&dyn TableProbe>,
    ) -> Result<ValidationReport> {
        let (loaded_rows, table_rows) = match probe {
            Some(probe) => {
                let after = probe.count_rows()?;
                let before = counts.table_rows_before.unwrap_or(0);
                (after.saturating_sub(before), Some(after))
            }
            None => (counts.written_rows, None),
        };

        let count_matches = !self.spec.row_count || loaded_rows == counts.source_rows;
        if !count_matches {
            let target = probe.map_or("destination", |p| p.table());
            self.errors.record(
                Stage::Validate,
                format!(
                    "row count mismatch: source read {} records, {} gained {} rows ({} rejected by mapper)",
                    counts.source_rows, target, loaded_rows, counts.rejected_rows
                ),
            )?;
        }

        let mut violations = Vec::new();
        if !self.spec.checks.is_empty() {
            match probe {
                Some(probe) => {
                    for check in &self.spec.checks {
                        let found = probe.find_out_of_range(check)?;
                        for v in &found {
                            self.errors.record(
                                Stage::Validate,
                                format!(
                                    "range check failed: {} row {} has {} = {} (allowed {})",
                                    probe.table(),
                                    v.row_id,
                                    v.column,
                                    v.value,
                                    describe_bounds(check.min, check.max)
                                ),
                            )?;
                        }
                        info!(column = %check.column, violations = found.len(), "range check done");
                        violations.extend(found);
                    }
                }
                None => warn!(
                    checks = self.spec.checks.len(),
                    "destination cannot be queried, range checks skipped"
                ),
            }
        }

        let report = ValidationReport {
            source_rows: counts.source_rows,
            loaded_rows,
            rejected_rows: counts.rejected_rows,
            table_rows,
            count_matches,
            violations,
        };
        info!(
            source = report.source_rows,
            loaded = report.loaded_rows,
            rejected = report.rejected_rows,
            violations = report.violations.len(),
            "validation finished"
        );
        Ok(report)
    }
}

fn describe_bounds(min: Option<f64>, max: Option<f64>) -> String {
    match (min, max) {
        (Some(lo), Some(hi)) => format!("{lo}..={hi}"),
        (Some(lo), None) => format!(">= {lo}"),
        (None, Some(hi)) => format!("<= {hi}"),
        (None, None) => "any".to_string(),
    }
}
