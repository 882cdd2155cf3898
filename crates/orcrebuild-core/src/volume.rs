/// Volume identifier to destination root mapping
///
/// The collector records a volume identifier for every file because drive
/// letters are not always known at collection time. `volstats.csv` ties the
/// identifiers back to mount points; this module turns those rows into stable,
/// filesystem-safe root directory names.
use std::collections::BTreeMap;

use serde::Serialize;

use crate::archive::{ArchiveReader, ContainerWalker, NestingPolicy, WalkStep};
use crate::manifest::{self, VolstatsRow, VOLSTATS_MANIFEST};
use crate::reconstruct::sanitize_segment;

/// A volume root as it appears in the destination tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeRecord {
    pub identifier: String,
    /// Drive letter, sanitised mount point, or the identifier itself
    pub label: String,
    /// Shadow copy the data came from; `None` for the live volume
    pub snapshot: Option<String>,
}

impl VolumeRecord {
    /// Directory name for this root: `C` or `C (vsc {snapshot})`
    pub fn directory_name(&self) -> String {
        match &self.snapshot {
            Some(snapshot) => format!("{} (vsc {})", self.label, snapshot),
            None => self.label.clone(),
        }
    }
}

/// Resolved identifier to label mapping, immutable once built
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VolumeMap {
    labels: BTreeMap<String, String>,
}

impl VolumeMap {
    /// Mapping that uses every identifier verbatim
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build the mapping from `volstats.csv` rows.
    ///
    /// The first non-empty label seen for an identifier wins. A label already
    /// claimed by a different identifier is qualified with the identifier so
    /// two volumes never share a root.
    pub fn resolve(rows: impl IntoIterator<Item = VolstatsRow>) -> Self {
        let mut labels: BTreeMap<String, String> = BTreeMap::new();

        for row in rows {
            let label = label_from_mount_point(&row.mount_point, &row.volume_id);

            if let Some(existing) = labels.get(&row.volume_id) {
                if *existing != label && *existing == fallback_label(&row.volume_id) {
                    // An earlier row had no mount point; a real one is better
                    tracing::debug!("Upgrading label for {} to {}", row.volume_id, label);
                } else {
                    if *existing != label && label != fallback_label(&row.volume_id) {
                        tracing::warn!(
                            "Volume {} already mapped to {}, ignoring conflicting mount point {}",
                            row.volume_id,
                            existing,
                            row.mount_point
                        );
                    }
                    continue;
                }
            }

            let taken = labels
                .iter()
                .any(|(id, other)| *id != row.volume_id && *other == label);
            let label = if taken {
                let qualified = sanitize_segment(&format!("{} ({})", label, row.volume_id))
                    .unwrap_or_else(|| fallback_label(&row.volume_id));
                tracing::warn!(
                    "Label {} already used by another volume, {} becomes {}",
                    label,
                    row.volume_id,
                    qualified
                );
                qualified
            } else {
                label
            };

            labels.insert(row.volume_id, label);
        }

        Self { labels }
    }

    /// Label for an identifier; unknown identifiers map to themselves
    pub fn label_for(&self, volume_id: &str) -> String {
        self.labels
            .get(volume_id)
            .cloned()
            .unwrap_or_else(|| fallback_label(volume_id))
    }

    /// Root record for an entry's volume and snapshot
    pub fn root_for(&self, volume_id: &str, snapshot: Option<&str>) -> VolumeRecord {
        VolumeRecord {
            identifier: volume_id.to_string(),
            label: self.label_for(volume_id),
            snapshot: snapshot.map(str::to_string),
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Mapped identifiers with their labels, sorted by identifier
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

fn fallback_label(volume_id: &str) -> String {
    sanitize_segment(volume_id).unwrap_or_else(|| "_".to_string())
}

/// Derive a root label from a `MountPoint` value
fn label_from_mount_point(mount_point: &str, volume_id: &str) -> String {
    let mount = mount_point.trim();
    let bytes = mount.as_bytes();

    let is_drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    if !is_drive {
        // Empty, or a volume GUID path such as \\?\Volume{...}\
        return fallback_label(volume_id);
    }

    let rest = mount[2..].trim_matches(|c| c == '\\' || c == '/');
    let letter = mount[..1].to_ascii_uppercase();
    if rest.is_empty() {
        return letter;
    }

    // Folder mount, e.g. C:\mnt\data\ -> C_mnt_data
    let flattened = format!("{}_{}", letter, rest.replace(['\\', '/'], "_"));
    sanitize_segment(&flattened).unwrap_or_else(|| fallback_label(volume_id))
}

/// Collect every `volstats.csv` in the archive tree and resolve them.
///
/// A missing or unreadable `volstats.csv` is not an error: the map simply
/// stays empty for the identifiers it would have covered.
pub fn discover(reader: &mut dyn ArchiveReader, policy: &NestingPolicy) -> VolumeMap {
    let mut rows = Vec::new();
    let mut walker = ContainerWalker::new(policy.clone());
    let mut found = 0usize;

    while let Some(step) = walker.next_step(reader) {
        let container = match step {
            WalkStep::Opened(container) => container,
            WalkStep::Failed(_) => continue,
        };

        let paths: Vec<String> = container
            .files()
            .filter(|e| e.file_name().eq_ignore_ascii_case(VOLSTATS_MANIFEST))
            .map(|e| e.path.clone())
            .collect();

        for path in paths {
            found += 1;
            let volstats_name = container.location.display_entry(&path);
            let parsed = reader
                .read_all(&container.location, &path)
                .map_err(|e| e.to_string())
                .and_then(|bytes| manifest::parse(volstats_name.clone(), &bytes).map_err(|e| e.to_string()))
                .and_then(|table| VolstatsRow::from_table(&table).map_err(|e| e.to_string()));

            match parsed {
                Ok(mut table_rows) => {
                    tracing::debug!("{}: {} volume row(s)", volstats_name, table_rows.len());
                    rows.append(&mut table_rows);
                }
                Err(e) => tracing::warn!("Ignoring unreadable {}: {}", volstats_name, e),
            }
        }
    }

    if found == 0 {
        tracing::warn!("No {} found, volume identifiers are used as root names", VOLSTATS_MANIFEST);
    }

    let map = VolumeMap::resolve(rows);
    tracing::info!("Resolved {} volume(s)", map.len());
    map
}
