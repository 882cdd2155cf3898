/// Manifest catalog
///
/// Walks every container of the collection archive, finds the manifests of
/// interest in any directory and turns their rows into [`ManifestEntry`]
/// values. Containers are loaded one at a time, so the catalog never holds
/// more than one container's worth of entries.
use std::collections::VecDeque;

use serde::Serialize;

use crate::archive::{
    ArchiveError, ArchiveLocation, ArchiveReader, ContainerFailure, ContainerWalker, ListedEntry,
    OpenedContainer, WalkStep,
};
use crate::audit::{AuditRecord, ReasonCode};
use crate::config::{RebuildConfig, ReportsConfig};
use crate::manifest::{self, ColumnMapping, ManifestEntry, ManifestError, ManifestSchema};

/// One unit of work produced by the catalog
#[derive(Debug, Clone)]
pub enum CatalogItem {
    /// A manifest row, possibly already marked as a collector failure
    Entry(ManifestEntry),
    /// A file to copy verbatim into the reports directory
    Report {
        location: ArchiveLocation,
        entry_path: String,
        size: u64,
    },
    /// A container or manifest that could not be read
    Failure(AuditRecord),
}

impl CatalogItem {
    fn report(location: &ArchiveLocation, entry: &ListedEntry) -> Self {
        CatalogItem::Report {
            location: location.clone(),
            entry_path: entry.path.clone(),
            size: entry.size,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CatalogStatistics {
    pub containers_opened: usize,
    pub containers_failed: usize,
    pub manifests_parsed: usize,
    pub manifests_failed: usize,
    pub entries: usize,
    pub collector_failures: usize,
    pub reports: usize,
}

#[derive(Debug)]
enum ManifestLoadError {
    Read(ArchiveError),
    Parse(ManifestError),
}

impl ManifestLoadError {
    fn reason(&self) -> ReasonCode {
        match self {
            ManifestLoadError::Read(_) => ReasonCode::ArchiveReadError,
            ManifestLoadError::Parse(_) => ReasonCode::ManifestError,
        }
    }
}

impl std::fmt::Display for ManifestLoadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ManifestLoadError::Read(e) => write!(f, "{}", e),
            ManifestLoadError::Parse(e) => write!(f, "{}", e),
        }
    }
}

/// Pull-based scan over all manifests in the archive tree
pub struct Catalog {
    walker: ContainerWalker,
    schemas: Vec<ManifestSchema>,
    reports: ReportsConfig,
    pending: VecDeque<CatalogItem>,
    stats: CatalogStatistics,
}

impl Catalog {
    pub fn new(config: &RebuildConfig) -> Self {
        Self {
            walker: ContainerWalker::new(config.nesting_policy()),
            schemas: config.manifest_schemas(),
            reports: config.reports.clone(),
            pending: VecDeque::new(),
            stats: CatalogStatistics::default(),
        }
    }

    pub fn statistics(&self) -> &CatalogStatistics {
        &self.stats
    }

    /// Next item in manifest-encounter order, or `None` once every container
    /// has been scanned
    pub fn next_item(&mut self, reader: &mut dyn ArchiveReader) -> Option<CatalogItem> {
        loop {
            if let Some(item) = self.pending.pop_front() {
                return Some(item);
            }
            match self.walker.next_step(reader)? {
                WalkStep::Opened(container) => self.load_container(container, reader),
                WalkStep::Failed(failure) => self.container_failed(failure),
            }
        }
    }

    /// Drain the catalog into a vector
    pub fn collect_all(&mut self, reader: &mut dyn ArchiveReader) -> Vec<CatalogItem> {
        let mut items = Vec::new();
        while let Some(item) = self.next_item(reader) {
            items.push(item);
        }
        items
    }

    fn container_failed(&mut self, failure: ContainerFailure) {
        self.stats.containers_failed += 1;
        let detail = if failure.error.is_password_error() {
            format!("cannot open sub-archive: {} (check [protected] passwords)", failure.error)
        } else {
            format!("cannot open sub-archive: {}", failure.error)
        };
        self.pending.push_back(CatalogItem::Failure(AuditRecord::new(
            failure.location.to_string(),
            "",
            ReasonCode::ArchiveReadError,
            detail,
        )));
    }

    fn load_container(&mut self, container: OpenedContainer, reader: &mut dyn ArchiveReader) {
        self.stats.containers_opened += 1;
        let location = &container.location;

        for entry in container.files() {
            if self.reports.matches(location.container_name(), &entry.path) {
                tracing::debug!("Report file {}", location.display_entry(&entry.path));
                self.stats.reports += 1;
                self.pending.push_back(CatalogItem::report(location, entry));
            }

            let schema = match self.schemas.iter().find(|s| s.matches(entry.file_name())) {
                Some(schema) => schema.clone(),
                None => continue,
            };

            let manifest_name = location.display_entry(&entry.path);
            match load_manifest(reader, location, entry, &schema) {
                Ok(entries) => {
                    self.stats.manifests_parsed += 1;
                    tracing::info!("📄 {}: {} row(s)", manifest_name, entries.len());
                    for manifest_entry in entries {
                        self.stats.entries += 1;
                        if manifest_entry.is_collector_failure() {
                            self.stats.collector_failures += 1;
                        }
                        self.pending.push_back(CatalogItem::Entry(manifest_entry));
                    }
                }
                Err(e) => {
                    self.stats.manifests_failed += 1;
                    self.pending.push_back(CatalogItem::Failure(AuditRecord::new(
                        manifest_name,
                        "",
                        e.reason(),
                        format!("unusable manifest: {}", e),
                    )));
                }
            }
        }
    }
}

fn load_manifest(
    reader: &mut dyn ArchiveReader,
    location: &ArchiveLocation,
    entry: &ListedEntry,
    schema: &ManifestSchema,
) -> Result<Vec<ManifestEntry>, ManifestLoadError> {
    let bytes = reader
        .read_all(location, &entry.path)
        .map_err(ManifestLoadError::Read)?;
    let table = manifest::parse(location.display_entry(&entry.path), &bytes)
        .map_err(ManifestLoadError::Parse)?;
    let mapping = ColumnMapping::new(&table, schema).map_err(ManifestLoadError::Parse)?;
    Ok(mapping.entries(&table, location, entry.parent_dir()))
}
