/// Audit trail of files that did not make it into the rebuilt tree
///
/// Every entry the run could not place is recorded once, in the order the
/// failures occurred, and written at the end of the run as
/// `artefacts_non_extracted.csv` so the gaps can be investigated or re-run.
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Name of the audit file written at the output root
pub const NON_EXTRACTED_REPORT: &str = "artefacts_non_extracted.csv";

/// Why an entry is missing from the output
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCode {
    /// The collection tool itself did not capture the file
    NotExtractedByCollector,
    PathTooLong,
    IllegalPath,
    /// Corrupt entry, wrong or missing password, unsupported compression
    ArchiveReadError,
    WriteError,
    CollisionUnresolvable,
    /// A manifest could not be read or mapped
    ManifestError,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasonCode::NotExtractedByCollector => "not-extracted-by-collector",
            ReasonCode::PathTooLong => "path-too-long",
            ReasonCode::IllegalPath => "illegal-path",
            ReasonCode::ArchiveReadError => "archive-read-error",
            ReasonCode::WriteError => "write-error",
            ReasonCode::CollisionUnresolvable => "collision-unresolvable",
            ReasonCode::ManifestError => "manifest-error",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the non-extraction report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    #[serde(rename = "OriginalPath")]
    pub original_path: String,
    #[serde(rename = "VolumeID")]
    pub volume_id: String,
    #[serde(rename = "Reason")]
    pub reason: ReasonCode,
    #[serde(rename = "Detail")]
    pub detail: String,
}

impl AuditRecord {
    pub fn new(
        original_path: impl Into<String>,
        volume_id: impl Into<String>,
        reason: ReasonCode,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            original_path: original_path.into(),
            volume_id: volume_id.into(),
            reason,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("cannot write audit report {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Counts per reason
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuditStatistics {
    pub total_records: usize,
    pub by_reason: BTreeMap<ReasonCode, usize>,
}

/// Append-only accumulator for the run's audit records
#[derive(Debug, Default)]
pub struct AuditReport {
    records: Vec<AuditRecord>,
}

impl AuditReport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one failure. Records are never deduplicated.
    pub fn record(&mut self, record: AuditRecord) {
        tracing::warn!(
            "Not extracted [{}] {} ({})",
            record.reason,
            record.original_path,
            record.detail
        );
        self.records.push(record);
    }

    pub fn records(&self) -> &[AuditRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records with a given reason, in recording order
    pub fn records_by_reason(&self, reason: ReasonCode) -> Vec<&AuditRecord> {
        self.records.iter().filter(|r| r.reason == reason).collect()
    }

    pub fn statistics(&self) -> AuditStatistics {
        let mut by_reason = BTreeMap::new();
        for record in &self.records {
            *by_reason.entry(record.reason).or_insert(0) += 1;
        }
        AuditStatistics {
            total_records: self.records.len(),
            by_reason,
        }
    }

    /// Write the report as CSV into `output_root`, returning the file path.
    ///
    /// The file is written even when empty so a finished run always leaves one.
    pub fn write_csv(&self, output_root: impl AsRef<Path>) -> Result<PathBuf, AuditError> {
        let path = output_root.as_ref().join(NON_EXTRACTED_REPORT);
        let wrap = |source: csv::Error| AuditError::Write {
            path: path.clone(),
            source,
        };

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&path)
            .map_err(wrap)?;
        writer
            .write_record(["OriginalPath", "VolumeID", "Reason", "Detail"])
            .map_err(wrap)?;
        for record in &self.records {
            writer.serialize(record).map_err(wrap)?;
        }
        writer.flush().map_err(|e| wrap(e.into()))?;

        Ok(path)
    }
}

/// Read an audit file back, mainly for verification
pub fn read_csv(path: impl AsRef<Path>) -> Result<Vec<AuditRecord>, csv::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    reader.deserialize().collect()
}
