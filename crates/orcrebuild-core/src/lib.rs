use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

pub mod archive;
pub mod audit;
pub mod catalog;
pub mod config;
pub mod extract;
pub mod manifest;
pub mod reconstruct;
pub mod volume;

pub use archive::{
    ArchiveError, ArchiveLocation, ArchiveReader, EntryKind, ListedEntry, MemoryArchive,
    MemoryContainer, NestingPolicy, SevenZipReader,
};
pub use audit::{AuditRecord, AuditReport, AuditStatistics, ReasonCode, NON_EXTRACTED_REPORT};
pub use catalog::{Catalog, CatalogItem, CatalogStatistics};
pub use config::{ConfigError, RebuildConfig};
pub use extract::{ExtractionDriver, ExtractionStatistics, PlannedItem, RunContext};
pub use manifest::{ManifestEntry, ManifestSchema};
pub use reconstruct::{DestinationPath, PathLimits, PathReconstructor};
pub use volume::{VolumeMap, VolumeRecord};

/// Failures that stop a run before or after extraction. Everything
/// entry-scoped ends up in the audit report instead.
#[derive(Debug, Error)]
pub enum RebuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot prepare output root {path}: {source}")]
    OutputRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read collection archive: {0}")]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    Audit(#[from] audit::AuditError),

    #[error("no readable manifest in the collection archive, see {audit_file}")]
    NoManifest { audit_file: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebuildStage {
    ResolvingVolumes,
    Extracting,
    WritingAudit,
    Complete,
}

#[derive(Debug, Clone)]
pub struct RebuildProgress {
    pub stage: RebuildStage,
    pub items_processed: usize,
    pub files_written: usize,
    pub failures: usize,
    pub current_operation: String,
}

/// Summary of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct RebuildReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub output_root: PathBuf,
    pub audit_file: PathBuf,
    pub volumes: Vec<VolumeRecord>,
    pub catalog: CatalogStatistics,
    pub extraction: ExtractionStatistics,
    pub audit: AuditStatistics,
}

impl RebuildReport {
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn duration_ms(&self) -> i64 {
        (self.finished_at - self.started_at).num_milliseconds()
    }
}

/// Rebuilds the original file-system layout from one collection archive
pub struct Rebuilder<R: ArchiveReader> {
    reader: R,
    config: RebuildConfig,
    progress_callback: Option<Box<dyn Fn(RebuildProgress) + Send + Sync>>,
}

impl<R: ArchiveReader> Rebuilder<R> {
    pub fn new(reader: R, config: RebuildConfig) -> Self {
        Self {
            reader,
            config,
            progress_callback: None,
        }
    }

    pub fn config(&self) -> &RebuildConfig {
        &self.config
    }

    pub fn into_reader(self) -> R {
        self.reader
    }

    pub fn set_progress_callback<F>(&mut self, callback: F)
    where
        F: Fn(RebuildProgress) + Send + Sync + 'static,
    {
        self.progress_callback = Some(Box::new(callback));
    }

    /// Volume identifier to root label mapping for this archive
    pub fn resolve_volumes(&mut self) -> Result<VolumeMap, RebuildError> {
        self.check_archive()?;
        Ok(self.volume_map())
    }

    /// Extract everything into `output_root` and write the audit report
    pub fn run(&mut self, output_root: impl AsRef<Path>) -> Result<RebuildReport, RebuildError> {
        let output_root = output_root.as_ref().to_path_buf();
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        tracing::info!("🚀 Rebuild {} into {}", run_id, output_root.display());

        self.config.validate()?;
        self.check_archive()?;
        prepare_output_root(&output_root)?;

        self.emit(RebuildStage::ResolvingVolumes, None, "Resolving volumes...");
        let volumes = self.volume_map();

        let driver = ExtractionDriver::new(
            PathReconstructor::new(&output_root, self.config.limits),
            self.config.reports.target_directory.clone(),
        );
        let mut ctx = RunContext::new(volumes);
        let mut catalog = Catalog::new(&self.config);

        self.emit(RebuildStage::Extracting, Some(&ctx.stats), "Extracting...");
        {
            let callback = &self.progress_callback;
            let reader = &mut self.reader;
            driver.run(&mut catalog, reader, &mut ctx, |stats| {
                if let Some(callback) = callback {
                    callback(progress(RebuildStage::Extracting, Some(stats), "Extracting..."));
                }
            });
        }

        self.emit(
            RebuildStage::WritingAudit,
            Some(&ctx.stats),
            "Writing audit report...",
        );
        let audit_file = ctx.audit.write_csv(&output_root)?;

        if catalog.statistics().manifests_parsed == 0 {
            tracing::error!("No readable manifest found in the archive");
            return Err(RebuildError::NoManifest { audit_file });
        }

        let report = RebuildReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            output_root,
            audit_file,
            volumes: ctx
                .volumes
                .iter()
                .map(|(id, _)| ctx.volumes.root_for(id, None))
                .collect(),
            catalog: catalog.statistics().clone(),
            extraction: ctx.stats.clone(),
            audit: ctx.audit.statistics(),
        };

        self.emit(RebuildStage::Complete, Some(&ctx.stats), "Rebuild complete");
        tracing::info!(
            "🎯 {} file(s) written, {} not extracted ({} ms)",
            report.extraction.files_written,
            report.audit.total_records,
            report.duration_ms()
        );
        Ok(report)
    }

    /// Dry run: catalogue and place every entry without reading sample data
    /// or writing anything under `output_root`
    pub fn plan(&mut self, output_root: impl AsRef<Path>) -> Result<Vec<PlannedItem>, RebuildError> {
        self.config.validate()?;
        self.check_archive()?;

        let volumes = self.volume_map();
        let driver = ExtractionDriver::new(
            PathReconstructor::new(output_root.as_ref(), self.config.limits),
            self.config.reports.target_directory.clone(),
        );
        let mut ctx = RunContext::new(volumes);
        let mut catalog = Catalog::new(&self.config);

        let mut planned = Vec::new();
        while let Some(item) = catalog.next_item(&mut self.reader) {
            planned.push(driver.plan(item, &mut ctx));
        }

        if catalog.statistics().manifests_parsed == 0 {
            tracing::warn!("No readable manifest found in the archive");
        }
        Ok(planned)
    }

    fn check_archive(&mut self) -> Result<(), RebuildError> {
        let root = self.config.nesting_policy().root_location();
        self.reader.list(&root)?;
        Ok(())
    }

    fn volume_map(&mut self) -> VolumeMap {
        if !self.config.rename_volumes {
            tracing::info!("Volume renaming disabled, identifiers are used as root names");
            return VolumeMap::empty();
        }
        volume::discover(&mut self.reader, &self.config.nesting_policy())
    }

    fn emit(&self, stage: RebuildStage, stats: Option<&ExtractionStatistics>, operation: &str) {
        if let Some(callback) = &self.progress_callback {
            callback(progress(stage, stats, operation));
        }
    }
}

fn progress(
    stage: RebuildStage,
    stats: Option<&ExtractionStatistics>,
    operation: &str,
) -> RebuildProgress {
    RebuildProgress {
        stage,
        items_processed: stats.map_or(0, |s| s.items_processed),
        files_written: stats.map_or(0, |s| s.files_written),
        failures: stats.map_or(0, |s| s.failures),
        current_operation: operation.to_string(),
    }
}

fn prepare_output_root(path: &Path) -> Result<(), RebuildError> {
    let wrap = |source: std::io::Error| RebuildError::OutputRoot {
        path: path.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(path).map_err(wrap)?;
    let mut listing = std::fs::read_dir(path).map_err(wrap)?;
    if listing.next().is_some() {
        tracing::warn!(
            "Output root {} is not empty, existing files are never overwritten",
            path.display()
        );
    }
    Ok(())
}

/// Rebuild a 7z collection archive on disk into `output_root`
pub fn rebuild_archive(
    archive: impl AsRef<Path>,
    output_root: impl AsRef<Path>,
    config: RebuildConfig,
) -> Result<RebuildReport, RebuildError> {
    let reader = SevenZipReader::open(archive)?;
    Rebuilder::new(reader, config).run(output_root)
}
