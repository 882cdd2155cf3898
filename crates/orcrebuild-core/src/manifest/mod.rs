//! Collector manifest parsing
//!
//! Manifests are CSV tables written by the collection tool. This module turns
//! raw manifest bytes into a [`ManifestTable`] (header + string rows), and the
//! [`schema`] submodule maps a table onto typed records through a column
//! mapping validated once per manifest.

use encoding_rs::{Encoding, UTF_8};
use thiserror::Error;

pub mod schema;

pub use schema::{
    ColumnMapping, ColumnNames, CollectorStatus, ManifestEntry, ManifestSchema, VolstatsRow,
    LIVE_SNAPSHOT_ID,
};

/// File name of the primary collector manifest
pub const GETTHIS_MANIFEST: &str = "GetThis.csv";

/// File name of the volume statistics manifest
pub const VOLSTATS_MANIFEST: &str = "volstats.csv";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("malformed CSV in {manifest}: {source}")]
    Csv {
        manifest: String,
        #[source]
        source: csv::Error,
    },

    #[error("{manifest} has no header row")]
    MissingHeader { manifest: String },

    #[error("{manifest} lacks required column(s): {}", .missing.join(", "))]
    MissingColumns {
        manifest: String,
        missing: Vec<String>,
    },
}

/// A parsed manifest: header names plus raw rows
#[derive(Debug, Clone)]
pub struct ManifestTable {
    name: String,
    headers: Vec<String>,
    rows: Vec<csv::StringRecord>,
}

impl ManifestTable {
    /// Display name of the manifest (its location inside the archive)
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn headers(&self) -> &[String] {
        &self.headers
    }

    pub fn rows(&self) -> &[csv::StringRecord] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Index of a header, matched case-insensitively after trimming
    pub fn column_index(&self, column: &str) -> Option<usize> {
        let wanted = column.trim();
        self.headers
            .iter()
            .position(|h| h.trim().eq_ignore_ascii_case(wanted))
    }

    /// Rows as `(column, value)` pairs; missing trailing fields read as empty
    pub fn row_pairs(&self, index: usize) -> Option<Vec<(&str, &str)>> {
        let row = self.rows.get(index)?;
        Some(
            self.headers
                .iter()
                .enumerate()
                .map(|(i, h)| (h.as_str(), row.get(i).unwrap_or("")))
                .collect(),
        )
    }
}

/// Decode manifest bytes, honouring a UTF-8 or UTF-16 byte-order mark
pub fn decode_text(bytes: &[u8]) -> String {
    let (encoding, bom_len): (&'static Encoding, usize) =
        Encoding::for_bom(bytes).unwrap_or((UTF_8, 0));
    let (text, had_errors) = encoding.decode_without_bom_handling(&bytes[bom_len..]);
    if had_errors {
        tracing::debug!(
            "Manifest contains bytes invalid for {}, replaced",
            encoding.name()
        );
    }
    text.into_owned()
}

/// Parse raw manifest bytes into a table
pub fn parse(name: impl Into<String>, bytes: &[u8]) -> Result<ManifestTable, ManifestError> {
    let name = name.into();
    let text = decode_text(bytes);

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader
        .headers()
        .map_err(|source| ManifestError::Csv {
            manifest: name.clone(),
            source,
        })?
        .iter()
        .map(|h| h.trim().to_string())
        .collect();

    if headers.iter().all(|h| h.is_empty()) {
        return Err(ManifestError::MissingHeader { manifest: name });
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|source| ManifestError::Csv {
            manifest: name.clone(),
            source,
        })?;
        // Skip blank trailing lines
        if record.iter().all(|field| field.trim().is_empty()) {
            continue;
        }
        rows.push(record);
    }

    Ok(ManifestTable {
        name,
        headers,
        rows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strips_utf8_bom() {
        let bytes = b"\xEF\xBB\xBFSampleName,FullName\r\na.dat,\\x\\a.txt\r\n";
        let table = parse("GetThis.csv", bytes).unwrap();
        assert_eq!(table.headers(), &["SampleName", "FullName"]);
        assert_eq!(table.column_index("samplename"), Some(0));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_parse_utf16le() {
        let text = "VolumeID,MountPoint\n{V1},C:\\\n";
        let mut bytes = vec![0xFF, 0xFE];
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        let table = parse("volstats.csv", &bytes).unwrap();
        assert_eq!(table.headers(), &["VolumeID", "MountPoint"]);
        assert_eq!(table.rows()[0].get(1), Some("C:\\"));
    }

    #[test]
    fn test_short_rows_tolerated() {
        let table = parse("m.csv", b"A,B,C\n1,2\n\n").unwrap();
        assert_eq!(table.len(), 1);
        let pairs = table.row_pairs(0).unwrap();
        assert_eq!(pairs, vec![("A", "1"), ("B", "2"), ("C", "")]);
    }

    #[test]
    fn test_empty_manifest_has_no_header() {
        let err = parse("m.csv", b"").unwrap_err();
        assert!(matches!(err, ManifestError::MissingHeader { .. }));
    }
}
