//! Typed views over manifest tables

use csv::StringRecord;
use serde::{Deserialize, Serialize};

use super::{ManifestError, ManifestTable, GETTHIS_MANIFEST};
use crate::archive::{join_entry_path, ArchiveLocation};

/// Snapshot identifier the collector writes for the live volume
pub const LIVE_SNAPSHOT_ID: &str = "{00000000-0000-0000-0000-000000000000}";

/// Column names a manifest schema reads. Defaults match `GetThis.csv`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ColumnNames {
    /// Location of the bundled file, relative to the manifest's directory
    pub archive_path: String,
    /// Absolute path on the source machine
    pub original_path: String,
    pub volume_id: String,
    pub snapshot_id: Option<String>,
    pub size: Option<String>,
    pub hash: Option<String>,
    /// Collector-side extraction status. Without it, an empty archive path
    /// marks a file the collector did not capture.
    pub status: Option<String>,
}

impl Default for ColumnNames {
    fn default() -> Self {
        Self {
            archive_path: "SampleName".to_string(),
            original_path: "FullName".to_string(),
            volume_id: "VolumeID".to_string(),
            snapshot_id: Some("SnapshotID".to_string()),
            size: Some("SizeInBytes".to_string()),
            hash: Some("SHA1".to_string()),
            status: None,
        }
    }
}

fn default_success_values() -> Vec<String> {
    ["success", "ok", "true", "yes", "1", "collected", "extracted"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// A manifest file name and how to read its rows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ManifestSchema {
    /// Manifest file name, matched case-insensitively in every directory
    pub file_name: String,
    #[serde(default)]
    pub columns: ColumnNames,
    /// Status values meaning the collector captured the file
    #[serde(default = "default_success_values")]
    pub success_values: Vec<String>,
}

impl ManifestSchema {
    /// The collector's primary manifest
    pub fn getthis() -> Self {
        Self {
            file_name: GETTHIS_MANIFEST.to_string(),
            columns: ColumnNames::default(),
            success_values: default_success_values(),
        }
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.file_name.eq_ignore_ascii_case(file_name)
    }
}

/// Whether the collection tool itself captured a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectorStatus {
    Extracted,
    NotExtracted,
}

/// One manifest row, normalised
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Container holding the manifest and the bundled file
    pub origin: ArchiveLocation,
    /// Where the manifest itself lives, for reporting
    pub manifest: String,
    /// Path of the bundled file inside `origin`; `None` when nothing was captured
    pub archive_path: Option<String>,
    pub original_path: String,
    pub volume_id: String,
    /// `None` for the live volume
    pub snapshot_id: Option<String>,
    pub size: Option<u64>,
    /// Passed through unverified
    pub hash: Option<String>,
    pub status: CollectorStatus,
}

impl ManifestEntry {
    pub fn is_collector_failure(&self) -> bool {
        self.status == CollectorStatus::NotExtracted
    }

    /// Address of the bundled file, or of the manifest when there is none
    pub fn source_display(&self) -> String {
        match &self.archive_path {
            Some(path) => self.origin.display_entry(path),
            None => self.manifest.clone(),
        }
    }
}

/// Normalise a snapshot column value: empty or all-zero means live volume
pub fn normalize_snapshot(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() || value.eq_ignore_ascii_case(LIVE_SNAPSHOT_ID) {
        None
    } else {
        Some(value.to_string())
    }
}

/// Column indices resolved once against a manifest header
#[derive(Debug, Clone)]
pub struct ColumnMapping {
    archive_path: usize,
    original_path: usize,
    volume_id: usize,
    snapshot_id: Option<usize>,
    size: Option<usize>,
    hash: Option<usize>,
    status: Option<usize>,
    success_values: Vec<String>,
}

impl ColumnMapping {
    /// Resolve `schema` against `table`'s header, failing on missing required columns
    pub fn new(table: &ManifestTable, schema: &ManifestSchema) -> Result<Self, ManifestError> {
        let columns = &schema.columns;
        let mut missing = Vec::new();
        let mut required = |name: &str| {
            let index = table.column_index(name);
            if index.is_none() {
                missing.push(name.to_string());
            }
            index.unwrap_or(0)
        };

        let archive_path = required(&columns.archive_path);
        let original_path = required(&columns.original_path);
        let volume_id = required(&columns.volume_id);

        if !missing.is_empty() {
            return Err(ManifestError::MissingColumns {
                manifest: table.name().to_string(),
                missing,
            });
        }

        let optional = |name: &Option<String>| name.as_deref().and_then(|n| table.column_index(n));

        Ok(Self {
            archive_path,
            original_path,
            volume_id,
            snapshot_id: optional(&columns.snapshot_id),
            size: optional(&columns.size),
            hash: optional(&columns.hash),
            status: optional(&columns.status),
            success_values: schema.success_values.clone(),
        })
    }

    /// Convert one row into an entry
    pub fn entry(
        &self,
        row: &StringRecord,
        origin: &ArchiveLocation,
        manifest_dir: &str,
        manifest_name: &str,
    ) -> ManifestEntry {
        let field = |index: usize| row.get(index).map(str::trim).unwrap_or("");
        let optional = |index: Option<usize>| {
            index
                .map(field)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };

        let sample = field(self.archive_path);
        let collector_ok = match self.status {
            Some(index) => {
                let value = field(index);
                self.success_values
                    .iter()
                    .any(|ok| ok.eq_ignore_ascii_case(value))
            }
            None => true,
        };

        let (status, archive_path) = if collector_ok && !sample.is_empty() {
            (
                CollectorStatus::Extracted,
                Some(join_entry_path(manifest_dir, sample)),
            )
        } else {
            (CollectorStatus::NotExtracted, None)
        };

        ManifestEntry {
            origin: origin.clone(),
            manifest: manifest_name.to_string(),
            archive_path,
            original_path: field(self.original_path).to_string(),
            volume_id: field(self.volume_id).to_string(),
            snapshot_id: self
                .snapshot_id
                .and_then(|index| normalize_snapshot(field(index))),
            size: optional(self.size).and_then(|s| s.parse().ok()),
            hash: optional(self.hash),
            status,
        }
    }

    /// Convert every row of `table`, in order
    pub fn entries(
        &self,
        table: &ManifestTable,
        origin: &ArchiveLocation,
        manifest_dir: &str,
    ) -> Vec<ManifestEntry> {
        table
            .rows()
            .iter()
            .map(|row| self.entry(row, origin, manifest_dir, table.name()))
            .collect()
    }
}

/// One `volstats.csv` row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolstatsRow {
    pub volume_id: String,
    /// Empty when the volume had no mount point
    pub mount_point: String,
}

impl VolstatsRow {
    pub const VOLUME_ID_COLUMN: &'static str = "VolumeID";
    pub const MOUNT_POINT_COLUMN: &'static str = "MountPoint";

    /// Read every row with a volume identifier
    pub fn from_table(table: &ManifestTable) -> Result<Vec<Self>, ManifestError> {
        let id_index =
            table
                .column_index(Self::VOLUME_ID_COLUMN)
                .ok_or_else(|| ManifestError::MissingColumns {
                    manifest: table.name().to_string(),
                    missing: vec![Self::VOLUME_ID_COLUMN.to_string()],
                })?;
        let mount_index = table.column_index(Self::MOUNT_POINT_COLUMN);

        Ok(table
            .rows()
            .iter()
            .filter_map(|row| {
                let volume_id = row.get(id_index).unwrap_or("").trim();
                if volume_id.is_empty() {
                    return None;
                }
                let mount_point = mount_index
                    .and_then(|i| row.get(i))
                    .unwrap_or("")
                    .trim()
                    .to_string();
                Some(Self {
                    volume_id: volume_id.to_string(),
                    mount_point,
                })
            })
            .collect())
    }
}
