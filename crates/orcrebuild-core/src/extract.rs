/// Extraction driver
///
/// Takes catalog items in order, computes their destination through the
/// [`PathReconstructor`], streams the archived bytes into a newly created file
/// and turns every per-entry failure into an audit record. One entry failing
/// never stops the ones after it.
use std::collections::{HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::archive::{normalize_entry_path, ArchiveError, ArchiveLocation, ArchiveReader};
use crate::audit::{AuditRecord, AuditReport, ReasonCode};
use crate::catalog::{Catalog, CatalogItem};
use crate::manifest::ManifestEntry;
use crate::reconstruct::{DestinationPath, PathReconstructor, ReconstructError};
use crate::volume::VolumeMap;

const COPY_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ExtractionStatistics {
    pub items_processed: usize,
    pub files_written: usize,
    pub bytes_written: u64,
    pub reports_copied: usize,
    /// Files that needed a collision tag
    pub disambiguated: usize,
    pub failures: usize,
}

/// State shared by every entry of one run
#[derive(Debug)]
pub struct RunContext {
    pub volumes: VolumeMap,
    pub audit: AuditReport,
    pub stats: ExtractionStatistics,
    claimed: HashSet<PathBuf>,
}

impl RunContext {
    pub fn new(volumes: VolumeMap) -> Self {
        Self {
            volumes,
            audit: AuditReport::new(),
            stats: ExtractionStatistics::default(),
            claimed: HashSet::new(),
        }
    }

    /// Destinations handed out so far
    pub fn claimed(&self) -> &HashSet<PathBuf> {
        &self.claimed
    }

    fn fail(&mut self, record: AuditRecord) {
        self.stats.failures += 1;
        self.audit.record(record);
    }
}

/// What a dry run decided for one item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedItem {
    pub source: String,
    pub original_path: String,
    pub destination: Option<PathBuf>,
    pub reason: Option<ReasonCode>,
    pub detail: String,
}

#[derive(Debug)]
enum CopyError {
    Read(ArchiveError),
    Write(io::Error),
    Exists,
}

impl std::fmt::Display for CopyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CopyError::Read(e) => write!(f, "read failed: {}", e),
            CopyError::Write(e) => write!(f, "write failed: {}", e),
            CopyError::Exists => write!(f, "destination appeared while writing"),
        }
    }
}

impl CopyError {
    fn reason(&self) -> ReasonCode {
        match self {
            CopyError::Read(_) => ReasonCode::ArchiveReadError,
            CopyError::Write(_) => ReasonCode::WriteError,
            CopyError::Exists => ReasonCode::CollisionUnresolvable,
        }
    }
}

pub struct ExtractionDriver {
    reconstructor: PathReconstructor,
    reports_dir: String,
}

impl ExtractionDriver {
    pub fn new(reconstructor: PathReconstructor, reports_dir: impl Into<String>) -> Self {
        Self {
            reconstructor,
            reports_dir: reports_dir.into(),
        }
    }

    pub fn output_root(&self) -> &Path {
        self.reconstructor.output_root()
    }

    /// Drain `catalog`, calling `on_item` after each processed item.
    ///
    /// Consecutive samples from the same container are extracted together so
    /// that each container is decoded once. Report files are held back until
    /// a manifest has been read, so a collection without any usable manifest
    /// leaves the output root untouched apart from the audit file.
    pub fn run<F>(
        &self,
        catalog: &mut Catalog,
        reader: &mut dyn ArchiveReader,
        ctx: &mut RunContext,
        mut on_item: F,
    ) where
        F: FnMut(&ExtractionStatistics),
    {
        let mut batch: Vec<ManifestEntry> = Vec::new();
        let mut held_reports: Vec<CatalogItem> = Vec::new();
        while let Some(item) = catalog.next_item(reader) {
            ctx.stats.items_processed += 1;
            let manifest_seen = catalog.statistics().manifests_parsed > 0;
            if manifest_seen {
                for report in held_reports.drain(..) {
                    self.dispatch(report, reader, ctx);
                }
            }
            match item {
                CatalogItem::Report { .. } if !manifest_seen => held_reports.push(item),
                CatalogItem::Entry(entry) if sample_path(&entry).is_some() => {
                    if batch.last().is_some_and(|last| last.origin != entry.origin) {
                        self.extract_batch(&batch, reader, ctx);
                        batch.clear();
                    }
                    batch.push(entry);
                }
                item => {
                    self.extract_batch(&batch, reader, ctx);
                    batch.clear();
                    self.dispatch(item, reader, ctx);
                }
            }
            on_item(&ctx.stats);
        }
        if !batch.is_empty() {
            self.extract_batch(&batch, reader, ctx);
            on_item(&ctx.stats);
        }
        if held_reports.is_empty() {
            return;
        }
        if catalog.statistics().manifests_parsed > 0 {
            for report in held_reports {
                self.dispatch(report, reader, ctx);
            }
            on_item(&ctx.stats);
        } else {
            tracing::warn!(
                "No manifest read, {} report file(s) not copied",
                held_reports.len()
            );
        }
    }

    /// Handle one catalog item
    pub fn process(&self, item: CatalogItem, reader: &mut dyn ArchiveReader, ctx: &mut RunContext) {
        ctx.stats.items_processed += 1;
        self.dispatch(item, reader, ctx);
    }

    fn dispatch(&self, item: CatalogItem, reader: &mut dyn ArchiveReader, ctx: &mut RunContext) {
        match item {
            CatalogItem::Entry(entry) => self.extract_entry(&entry, reader, ctx),
            CatalogItem::Report {
                location,
                entry_path,
                ..
            } => self.copy_report(&location, &entry_path, reader, ctx),
            CatalogItem::Failure(record) => ctx.fail(record),
        }
    }

    pub fn extract_entry(
        &self,
        entry: &ManifestEntry,
        reader: &mut dyn ArchiveReader,
        ctx: &mut RunContext,
    ) {
        self.extract_batch(std::slice::from_ref(entry), reader, ctx);
    }

    /// Extract entries whose samples all live in `entries[0].origin`.
    ///
    /// Destinations are reserved in entry order before any byte is read, and
    /// audit records are appended in entry order afterwards.
    fn extract_batch(
        &self,
        entries: &[ManifestEntry],
        reader: &mut dyn ArchiveReader,
        ctx: &mut RunContext,
    ) {
        let origin = match entries.first() {
            Some(first) => first.origin.clone(),
            None => return,
        };

        let mut slots: Vec<Slot> = Vec::with_capacity(entries.len());
        let mut samples: Vec<Sample> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();

        for entry in entries {
            let Some(archive_path) = sample_path(entry) else {
                slots.push(Slot::Failed(collector_failure(entry)));
                continue;
            };
            match self
                .reconstructor
                .reconstruct(entry, &ctx.volumes, &ctx.claimed)
            {
                Ok(destination) => {
                    ctx.claimed.insert(destination.as_path().to_path_buf());
                    let key = normalize_entry_path(archive_path).to_ascii_lowercase();
                    let sample = *by_key.entry(key).or_insert_with(|| {
                        samples.push(Sample {
                            path: archive_path.to_string(),
                            waiting: Vec::new(),
                        });
                        samples.len() - 1
                    });
                    samples[sample].waiting.push(slots.len());
                    slots.push(Slot::Placed {
                        destination,
                        outcome: None,
                    });
                }
                Err(e) => {
                    slots.push(Slot::Failed(entry_failure(entry, e.reason(), e.to_string())));
                }
            }
        }

        stream_samples(reader, &origin, &mut samples, &mut slots);

        for (entry, slot) in entries.iter().zip(slots) {
            match slot {
                Slot::Failed(record) => ctx.fail(record),
                Slot::Placed {
                    destination,
                    outcome: Some(Ok(bytes)),
                } => {
                    if let Some(declared) = entry.size {
                        if declared != bytes {
                            tracing::debug!(
                                "{}: manifest declares {} bytes, archive held {}",
                                entry.original_path,
                                declared,
                                bytes
                            );
                        }
                    }
                    tracing::debug!(
                        "{} -> {}",
                        entry.source_display(),
                        destination.as_path().display()
                    );
                    self.claim(destination, bytes, ctx);
                }
                Slot::Placed {
                    destination,
                    outcome,
                } => {
                    ctx.claimed.remove(destination.as_path());
                    let error = outcome.and_then(Result::err).unwrap_or_else(|| {
                        CopyError::Read(ArchiveError::NotFound(entry.source_display()))
                    });
                    let detail = format!("{}: {}", entry.source_display(), error);
                    ctx.fail(entry_failure(entry, error.reason(), detail));
                }
            }
        }
    }

    pub fn copy_report(
        &self,
        location: &ArchiveLocation,
        entry_path: &str,
        reader: &mut dyn ArchiveReader,
        ctx: &mut RunContext,
    ) {
        let source = location.display_entry(entry_path);
        let report_failure = |reason: ReasonCode, detail: String| {
            AuditRecord::new(source.clone(), "", reason, detail)
        };

        let destination = match self.report_destination(location, entry_path, ctx) {
            Ok(destination) => destination,
            Err(e) => {
                ctx.fail(report_failure(e.reason(), e.to_string()));
                return;
            }
        };

        match copy_entry(reader, location, entry_path, destination.as_path()) {
            Ok(bytes) => {
                tracing::info!("📋 Report {} copied", source);
                ctx.stats.reports_copied += 1;
                self.claim(destination, bytes, ctx);
            }
            Err(e) => ctx.fail(report_failure(e.reason(), e.to_string())),
        }
    }

    /// Work out what a run would do with `item` without touching the archive
    /// data or the output root
    pub fn plan(&self, item: CatalogItem, ctx: &mut RunContext) -> PlannedItem {
        ctx.stats.items_processed += 1;
        let planned = match item {
            CatalogItem::Entry(entry) => {
                let source = entry.source_display();
                if entry.archive_path.is_none() || entry.is_collector_failure() {
                    let record = collector_failure(&entry);
                    PlannedItem::skipped(source, record)
                } else {
                    match self.reconstructor.reconstruct(&entry, &ctx.volumes, &ctx.claimed) {
                        Ok(destination) => {
                            PlannedItem::placed(source, entry.original_path.clone(), &destination)
                        }
                        Err(e) => PlannedItem::skipped(
                            source,
                            entry_failure(&entry, e.reason(), e.to_string()),
                        ),
                    }
                }
            }
            CatalogItem::Report {
                location,
                entry_path,
                ..
            } => {
                let source = location.display_entry(&entry_path);
                match self.report_destination(&location, &entry_path, ctx) {
                    Ok(destination) => PlannedItem::placed(source.clone(), source, &destination),
                    Err(e) => PlannedItem::skipped(
                        source.clone(),
                        AuditRecord::new(source, "", e.reason(), e.to_string()),
                    ),
                }
            }
            CatalogItem::Failure(record) => {
                PlannedItem::skipped(record.original_path.clone(), record)
            }
        };

        if let Some(destination) = &planned.destination {
            ctx.claimed.insert(destination.clone());
        } else {
            ctx.stats.failures += 1;
        }
        planned
    }

    fn report_destination(
        &self,
        location: &ArchiveLocation,
        entry_path: &str,
        ctx: &RunContext,
    ) -> Result<DestinationPath, ReconstructError> {
        let file_name = entry_path.rsplit('/').next().unwrap_or(entry_path);
        self.reconstructor.report_destination(
            &self.reports_dir,
            file_name,
            &location.display_entry(entry_path),
            &ctx.claimed,
        )
    }

    fn claim(&self, destination: DestinationPath, bytes: u64, ctx: &mut RunContext) {
        ctx.stats.files_written += 1;
        ctx.stats.bytes_written += bytes;
        if destination.is_disambiguated() {
            ctx.stats.disambiguated += 1;
        }
        ctx.claimed.insert(destination.into_path_buf());
    }
}

impl PlannedItem {
    fn placed(source: String, original_path: String, destination: &DestinationPath) -> Self {
        Self {
            source,
            original_path,
            destination: Some(destination.as_path().to_path_buf()),
            reason: None,
            detail: String::new(),
        }
    }

    fn skipped(source: String, record: AuditRecord) -> Self {
        Self {
            source,
            original_path: record.original_path,
            destination: None,
            reason: Some(record.reason),
            detail: record.detail,
        }
    }
}

fn collector_failure(entry: &ManifestEntry) -> AuditRecord {
    entry_failure(
        entry,
        ReasonCode::NotExtractedByCollector,
        format!("no sample recorded in {}", entry.manifest),
    )
}

fn entry_failure(entry: &ManifestEntry, reason: ReasonCode, detail: String) -> AuditRecord {
    AuditRecord::new(
        entry.original_path.clone(),
        entry.volume_id.clone(),
        reason,
        detail,
    )
}

/// Destination decided for one entry of a batch
enum Slot {
    Failed(AuditRecord),
    Placed {
        destination: DestinationPath,
        outcome: Option<Result<u64, CopyError>>,
    },
}

/// One archived sample and the slots still waiting for its bytes
struct Sample {
    path: String,
    waiting: Vec<usize>,
}

fn sample_path(entry: &ManifestEntry) -> Option<&str> {
    match (&entry.archive_path, entry.is_collector_failure()) {
        (Some(path), false) => Some(path),
        _ => None,
    }
}

/// Stream every sample of `origin` into the destinations of its waiting
/// slots.
///
/// The first waiting slot receives the archived bytes and the others are
/// copied from it. When the first one cannot be written the sample is
/// requested again in a further pass for the remaining slots.
fn stream_samples(
    reader: &mut dyn ArchiveReader,
    origin: &ArchiveLocation,
    samples: &mut [Sample],
    slots: &mut [Slot],
) {
    let mut pending: Vec<usize> = (0..samples.len()).collect();
    while !pending.is_empty() {
        let wanted: Vec<String> = pending.iter().map(|&i| samples[i].path.clone()).collect();
        let mut again = Vec::new();

        let mut deliver = |index: usize, source: &mut dyn Read| -> io::Result<()> {
            let sample = &mut samples[pending[index]];
            let Some((&first, rest)) = sample.waiting.split_first() else {
                io::copy(source, &mut io::sink())?;
                return Ok(());
            };
            let written = write_new(source, destination_of(slots, first))?;
            match written {
                Ok(bytes) => {
                    set_outcome(slots, first, Ok(bytes));
                    let from = destination_of(slots, first).to_path_buf();
                    for &slot in rest {
                        let copied = copy_file(&from, destination_of(slots, slot));
                        set_outcome(slots, slot, copied);
                    }
                    sample.waiting.clear();
                }
                Err(e) => {
                    set_outcome(slots, first, Err(e));
                    sample.waiting.remove(0);
                    if !sample.waiting.is_empty() {
                        again.push(pending[index]);
                    }
                }
            }
            Ok(())
        };

        let streamed = reader.stream_entries(origin, &wanted, &mut deliver);
        match streamed {
            Ok(failures) => {
                for (index, error) in failures {
                    let sample = &mut samples[pending[index]];
                    for slot in sample.waiting.drain(..) {
                        set_outcome(slots, slot, Err(CopyError::Read(error.replicate())));
                    }
                }
            }
            Err(error) => {
                for &i in &pending {
                    for slot in samples[i].waiting.drain(..) {
                        set_outcome(slots, slot, Err(CopyError::Read(error.replicate())));
                    }
                }
            }
        }

        again.retain(|&i| !samples[i].waiting.is_empty());
        pending = again;
    }
}

fn destination_of(slots: &[Slot], index: usize) -> &Path {
    match &slots[index] {
        Slot::Placed { destination, .. } => destination.as_path(),
        Slot::Failed(_) => Path::new(""),
    }
}

fn set_outcome(slots: &mut [Slot], index: usize, result: Result<u64, CopyError>) {
    if let Slot::Placed { outcome, .. } = &mut slots[index] {
        *outcome = Some(result);
    }
}

/// Copy one archive entry into a new file at `destination`
fn copy_entry(
    reader: &mut dyn ArchiveReader,
    location: &ArchiveLocation,
    entry_path: &str,
    destination: &Path,
) -> Result<u64, CopyError> {
    let mut outcome = None;
    let mut deliver = |_: usize, source: &mut dyn Read| -> io::Result<()> {
        outcome = Some(write_new(source, destination)?);
        Ok(())
    };
    let mut failures = reader
        .stream_entries(location, &[entry_path.to_string()], &mut deliver)
        .map_err(CopyError::Read)?;

    match (outcome, failures.pop()) {
        (Some(result), _) => result,
        (None, Some((_, e))) => Err(CopyError::Read(e)),
        (None, None) => Err(CopyError::Read(ArchiveError::NotFound(
            location.display_entry(entry_path),
        ))),
    }
}

/// Copy an already extracted file to a second destination
fn copy_file(from: &Path, destination: &Path) -> Result<u64, CopyError> {
    let mut source = fs::File::open(from).map_err(CopyError::Write)?;
    match write_new(&mut source, destination) {
        Ok(result) => result,
        Err(e) => Err(CopyError::Write(e)),
    }
}

/// Stream `source` into a new file at `destination`.
///
/// The outer error is a failure reading `source`. A write failure is returned
/// inside `Ok` with `source` drained. Either way a partially written file is
/// removed, so a failed entry leaves nothing behind.
fn write_new(source: &mut dyn Read, destination: &Path) -> io::Result<Result<u64, CopyError>> {
    let mut file = match create_new(destination) {
        Ok(file) => file,
        Err(e) => {
            io::copy(source, &mut io::sink())?;
            return Ok(Err(e));
        }
    };

    let result = stream(source, &mut file);
    drop(file);

    if !matches!(result, Ok(Ok(_))) {
        if let Err(e) = fs::remove_file(destination) {
            tracing::warn!(
                "Could not remove partial file {}: {}",
                destination.display(),
                e
            );
        }
    }
    result
}

fn create_new(destination: &Path) -> Result<fs::File, CopyError> {
    if let Some(parent) = destination.parent() {
        fs::create_dir_all(parent).map_err(CopyError::Write)?;
    }
    OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(destination)
        .map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                CopyError::Exists
            } else {
                CopyError::Write(e)
            }
        })
}

fn stream(source: &mut dyn Read, file: &mut fs::File) -> io::Result<Result<u64, CopyError>> {
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if let Err(e) = file.write_all(&buf[..n]) {
            io::copy(source, &mut io::sink())?;
            return Ok(Err(CopyError::Write(e)));
        }
        total += n as u64;
    }
    Ok(file.flush().map(|_| total).map_err(CopyError::Write))
}
