/// 7z archive reader
///
/// Collection archives and their sub-archives are 7z files, usually solid. A
/// solid block can only be decoded front to back, so entries are always
/// streamed out of a container in one pass over the wanted set instead of one
/// decode per entry. The top-level archive is read straight from disk. Nested
/// containers are inflated from their parent once: small ones into a
/// size-bounded memory cache, larger ones into anonymous temporary files.
/// Decoder handles are created per call and dropped before the call returns.
use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use sevenz_rust2::{ArchiveReader as SevenZReader, Password};

use super::{
    is_container_name, normalize_entry_path, ArchiveError, ArchiveLocation, ArchiveReader,
    EntryKind, ListedEntry,
};

/// Reader over a 7z collection archive on disk
pub struct SevenZipReader {
    path: PathBuf,
    cache: ContainerCache,
}

impl SevenZipReader {
    /// Upper bound on decompressed sub-archive bytes held in memory
    pub const DEFAULT_CACHE_BUDGET: usize = 512 * 1024 * 1024;

    /// Prepare a reader for the archive at `path`. The file must exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let path = path.as_ref().to_path_buf();
        std::fs::metadata(&path)?;
        Ok(Self {
            path,
            cache: ContainerCache::new(Self::DEFAULT_CACHE_BUDGET),
        })
    }

    pub fn with_cache_budget(mut self, bytes: usize) -> Self {
        self.cache = ContainerCache::new(bytes);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Backing data of the container at `location`
    fn container(&mut self, location: &ArchiveLocation) -> Result<Blob, ArchiveError> {
        if location.is_root() {
            return Ok(Blob::Disk(Rc::new(File::open(&self.path)?)));
        }
        if let Some(blob) = self.cache.get(location) {
            return Ok(blob);
        }

        let (parent, hop) = match (location.parent(), location.hops().last()) {
            (Some(parent), Some(hop)) => (parent, hop.entry_path.clone()),
            _ => return Err(ArchiveError::NotAContainer(location.to_string())),
        };

        tracing::debug!("Inflating nested archive {}", location);
        let budget = self.cache.budget;
        let mut inflated = None;
        let mut keep = |_: usize, data: &mut dyn Read| -> io::Result<()> {
            inflated = Some(inflate(data, budget)?);
            Ok(())
        };
        let mut failures = self.stream_entries(&parent, &[hop], &mut keep)?;

        let blob = match (inflated, failures.pop()) {
            (Some(blob), _) => blob,
            (None, Some((_, e))) => return Err(e),
            (None, None) => return Err(ArchiveError::NotFound(location.to_string())),
        };
        if let Blob::Disk(_) = blob {
            tracing::debug!("{} exceeds the memory budget, spilled to disk", location);
        }
        self.cache.insert(location.clone(), blob.clone());
        Ok(blob)
    }
}

impl ArchiveReader for SevenZipReader {
    fn list(&mut self, location: &ArchiveLocation) -> Result<Vec<ListedEntry>, ArchiveError> {
        let name = location.to_string();
        let password = password_for(location);
        match self.container(location)? {
            Blob::Disk(file) => Ok(describe(&open_7z(&*file, password, &name)?)),
            Blob::Memory(bytes) => Ok(describe(&open_7z(
                Cursor::new(bytes.as_slice()),
                password,
                &name,
            )?)),
        }
    }

    fn open<'a>(
        &'a mut self,
        location: &ArchiveLocation,
        entry_path: &str,
    ) -> Result<Box<dyn Read + 'a>, ArchiveError> {
        let data = self.read_all(location, entry_path)?;
        Ok(Box::new(Cursor::new(data)))
    }

    fn read_all(
        &mut self,
        location: &ArchiveLocation,
        entry_path: &str,
    ) -> Result<Vec<u8>, ArchiveError> {
        let mut data = None;
        let mut collect = |_: usize, source: &mut dyn Read| -> io::Result<()> {
            let mut buf = Vec::new();
            source.read_to_end(&mut buf)?;
            data = Some(buf);
            Ok(())
        };
        let mut failures = self.stream_entries(location, &[entry_path.to_string()], &mut collect)?;
        match (data, failures.pop()) {
            (Some(data), _) => Ok(data),
            (None, Some((_, e))) => Err(e),
            (None, None) => Err(ArchiveError::NotFound(location.display_entry(entry_path))),
        }
    }

    fn stream_entries(
        &mut self,
        location: &ArchiveLocation,
        wanted: &[String],
        each: &mut dyn FnMut(usize, &mut dyn Read) -> io::Result<()>,
    ) -> Result<Vec<(usize, ArchiveError)>, ArchiveError> {
        let name = location.to_string();
        let password = password_for(location);
        match self.container(location)? {
            Blob::Disk(file) => {
                let mut reader = open_7z(&*file, password, &name)?;
                Ok(stream_wanted(&mut reader, wanted, each, &name))
            }
            Blob::Memory(bytes) => {
                let mut reader = open_7z(Cursor::new(bytes.as_slice()), password, &name)?;
                Ok(stream_wanted(&mut reader, wanted, each, &name))
            }
        }
    }
}

fn password_for(location: &ArchiveLocation) -> Option<&str> {
    match location.hops().last() {
        Some(hop) => hop.password.as_deref(),
        None => location.root_password(),
    }
}

fn open_7z<R: Read + Seek>(
    source: R,
    password: Option<&str>,
    name: &str,
) -> Result<SevenZReader<R>, ArchiveError> {
    let password = match password {
        Some(secret) => Password::from(secret),
        None => Password::empty(),
    };
    SevenZReader::new(source, password).map_err(|e| map_error(e, name))
}

fn describe<R: Read + Seek>(reader: &SevenZReader<R>) -> Vec<ListedEntry> {
    reader
        .archive()
        .files
        .iter()
        .map(|entry| {
            let path = normalize_entry_path(entry.name());
            let kind = if entry.is_directory() {
                EntryKind::Directory
            } else if is_container_name(&path) {
                EntryKind::Container
            } else {
                EntryKind::File
            };
            ListedEntry {
                path,
                size: entry.size(),
                kind,
            }
        })
        .collect()
}

/// Map raw archive names to indices into `wanted`
fn resolve_wanted<R: Read + Seek>(
    reader: &SevenZReader<R>,
    wanted: &[String],
) -> HashMap<String, usize> {
    let names: Vec<&str> = reader
        .archive()
        .files
        .iter()
        .filter(|entry| !entry.is_directory())
        .map(|entry| entry.name())
        .collect();

    let mut targets = HashMap::new();
    for (index, path) in wanted.iter().enumerate() {
        let path = normalize_entry_path(path);
        // Collector manifests are written on Windows, so fall back to a
        // case-insensitive match before giving up.
        let raw = names
            .iter()
            .find(|name| normalize_entry_path(name) == path)
            .or_else(|| {
                names
                    .iter()
                    .find(|name| normalize_entry_path(name).eq_ignore_ascii_case(&path))
            });
        if let Some(raw) = raw {
            targets.entry(raw.to_string()).or_insert(index);
        }
    }
    targets
}

/// Decode the container once, handing every wanted entry to `each` and
/// draining the rest
fn stream_wanted<R: Read + Seek>(
    reader: &mut SevenZReader<R>,
    wanted: &[String],
    each: &mut dyn FnMut(usize, &mut dyn Read) -> io::Result<()>,
    name: &str,
) -> Vec<(usize, ArchiveError)> {
    let targets = resolve_wanted(reader, wanted);
    let mut delivered = vec![false; wanted.len()];
    let mut remaining = targets.len();
    let mut entry_failure: Option<(usize, io::Error)> = None;

    let outcome = if remaining == 0 {
        Ok(())
    } else {
        reader.for_each_entries(|entry, data| {
            if remaining == 0 {
                return Ok(false);
            }
            let Some(&index) = targets.get(entry.name()) else {
                // Unread bytes would shift every later entry of the block
                io::copy(data, &mut io::sink())?;
                return Ok(true);
            };
            delivered[index] = true;
            remaining -= 1;
            if let Err(e) = each(index, data) {
                let kind = e.kind();
                entry_failure = Some((index, e));
                return Err(io::Error::new(kind, "entry stream failed").into());
            }
            Ok(remaining > 0)
        })
    };

    let mut failures = Vec::new();
    let aborted = match (outcome, entry_failure) {
        (_, Some((index, e))) => {
            let error = ArchiveError::Corrupt(format!("{}: {}", name, e));
            failures.push((index, ArchiveError::Io(e)));
            Some(error)
        }
        (Err(e), None) => Some(map_error(e, name)),
        (Ok(()), None) => None,
    };

    for (index, path) in wanted.iter().enumerate() {
        if delivered[index] {
            continue;
        }
        let error = match &aborted {
            Some(error) => error.replicate(),
            None => ArchiveError::NotFound(format!("{}/{}", name, normalize_entry_path(path))),
        };
        failures.push((index, error));
    }
    failures
}

/// Read a nested archive into memory, or into a temporary file once it grows
/// past `budget`
fn inflate(data: &mut dyn Read, budget: usize) -> io::Result<Blob> {
    let mut head = Vec::new();
    (&mut *data).take(budget as u64 + 1).read_to_end(&mut head)?;
    if head.len() <= budget {
        return Ok(Blob::Memory(Rc::new(head)));
    }

    let mut file = tempfile::tempfile()?;
    file.write_all(&head)?;
    io::copy(data, &mut file)?;
    file.flush()?;
    file.seek(SeekFrom::Start(0))?;
    Ok(Blob::Disk(Rc::new(file)))
}

fn map_error(err: sevenz_rust2::Error, name: &str) -> ArchiveError {
    match err {
        sevenz_rust2::Error::PasswordRequired => ArchiveError::PasswordRequired(name.to_string()),
        sevenz_rust2::Error::MaybeBadPassword(..) => ArchiveError::WrongPassword(name.to_string()),
        other => ArchiveError::Corrupt(format!("{}: {}", name, other)),
    }
}

/// Where the bytes of a container live
#[derive(Clone)]
enum Blob {
    Memory(Rc<Vec<u8>>),
    Disk(Rc<File>),
}

/// Insertion-ordered cache of inflated sub-archives. In-memory blobs are
/// bounded by total bytes, spilled ones by count.
struct ContainerCache {
    budget: usize,
    used: usize,
    order: VecDeque<ArchiveLocation>,
    blobs: HashMap<ArchiveLocation, Rc<Vec<u8>>>,
    spilled: VecDeque<(ArchiveLocation, Rc<File>)>,
}

impl ContainerCache {
    const SPILLED_SLOTS: usize = 4;

    fn new(budget: usize) -> Self {
        Self {
            budget,
            used: 0,
            order: VecDeque::new(),
            blobs: HashMap::new(),
            spilled: VecDeque::new(),
        }
    }

    fn get(&self, location: &ArchiveLocation) -> Option<Blob> {
        if let Some(bytes) = self.blobs.get(location) {
            return Some(Blob::Memory(Rc::clone(bytes)));
        }
        self.spilled
            .iter()
            .find(|(spilled, _)| spilled == location)
            .map(|(_, file)| Blob::Disk(Rc::clone(file)))
    }

    fn insert(&mut self, location: ArchiveLocation, blob: Blob) {
        let bytes = match blob {
            Blob::Memory(bytes) => bytes,
            Blob::Disk(file) => {
                if self.spilled.len() == Self::SPILLED_SLOTS {
                    self.spilled.pop_front();
                }
                self.spilled.push_back((location, file));
                return;
            }
        };

        let size = bytes.len();
        if size > self.budget {
            return;
        }
        while self.used + size > self.budget {
            match self.order.pop_front() {
                Some(oldest) => {
                    if let Some(evicted) = self.blobs.remove(&oldest) {
                        self.used -= evicted.len();
                    }
                }
                None => break,
            }
        }
        self.used += size;
        self.order.push_back(location.clone());
        self.blobs.insert(location, bytes);
    }
}
