/// Archive access for collection archives
///
/// The rebuild pipeline never touches a concrete archive format directly. It
/// talks to an [`ArchiveReader`], addressing containers through an
/// [`ArchiveLocation`]: the chain of nested sub-archives (with the password
/// used to open each) leading from the top-level archive to the container
/// being read.
use std::fmt;
use std::io::{self, Read};

use thiserror::Error;

pub mod memory;
pub mod sevenzip;
pub mod walk;

pub use memory::{MemoryArchive, MemoryContainer};
pub use sevenzip::SevenZipReader;
pub use walk::{ContainerFailure, ContainerWalker, NestingPolicy, OpenedContainer, WalkStep};

/// Kind of an entry returned by an archive listing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Regular file, readable with [`ArchiveReader::open`]
    File,
    /// Directory marker
    Directory,
    /// Nested archive that can itself be listed and read
    Container,
}

/// One entry of an archive listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListedEntry {
    /// Path inside the archive, `/`-separated
    pub path: String,
    /// Uncompressed size in bytes
    pub size: u64,
    pub kind: EntryKind,
}

impl ListedEntry {
    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Last path segment
    pub fn file_name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Directory part of the path, empty for entries at the archive root
    pub fn parent_dir(&self) -> &str {
        match self.path.rfind('/') {
            Some(idx) => &self.path[..idx],
            None => "",
        }
    }
}

/// One step from a container into a nested sub-archive
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct NestedHop {
    /// Path of the sub-archive inside its parent
    pub entry_path: String,
    pub password: Option<String>,
}

impl fmt::Debug for NestedHop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NestedHop")
            .field("entry_path", &self.entry_path)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Address of a container inside the collection archive
#[derive(Clone, Default, PartialEq, Eq, Hash)]
pub struct ArchiveLocation {
    root_password: Option<String>,
    hops: Vec<NestedHop>,
}

impl ArchiveLocation {
    /// The top-level archive itself
    pub fn root(password: Option<String>) -> Self {
        Self {
            root_password: password,
            hops: Vec::new(),
        }
    }

    /// Location of a sub-archive found inside this container
    pub fn nested(&self, entry_path: impl Into<String>, password: Option<String>) -> Self {
        let mut hops = self.hops.clone();
        hops.push(NestedHop {
            entry_path: entry_path.into(),
            password,
        });
        Self {
            root_password: self.root_password.clone(),
            hops,
        }
    }

    pub fn root_password(&self) -> Option<&str> {
        self.root_password.as_deref()
    }

    pub fn hops(&self) -> &[NestedHop] {
        &self.hops
    }

    /// Number of sub-archive hops below the top-level archive
    pub fn depth(&self) -> usize {
        self.hops.len()
    }

    pub fn is_root(&self) -> bool {
        self.hops.is_empty()
    }

    /// Location of the enclosing container, `None` for the root
    pub fn parent(&self) -> Option<Self> {
        if self.hops.is_empty() {
            return None;
        }
        Some(Self {
            root_password: self.root_password.clone(),
            hops: self.hops[..self.hops.len() - 1].to_vec(),
        })
    }

    /// Short name used to match report patterns: `.` for the root, otherwise
    /// the file name of the innermost sub-archive
    pub fn container_name(&self) -> &str {
        match self.hops.last() {
            Some(hop) => hop.entry_path.rsplit('/').next().unwrap_or(&hop.entry_path),
            None => ".",
        }
    }

    /// Human readable address of an entry inside this container
    pub fn display_entry(&self, entry_path: &str) -> String {
        format!("{}/{}", self, entry_path)
    }
}

impl fmt::Display for ArchiveLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ".")?;
        for hop in &self.hops {
            write!(f, "/{}", hop.entry_path)?;
        }
        Ok(())
    }
}

impl fmt::Debug for ArchiveLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ArchiveLocation")
            .field(&self.to_string())
            .finish()
    }
}

/// Failures reported by an archive reader
#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("entry `{0}` not found in archive")]
    NotFound(String),

    #[error("`{0}` is password protected and no password was configured")]
    PasswordRequired(String),

    #[error("wrong password for `{0}`")]
    WrongPassword(String),

    #[error("`{0}` is not a container")]
    NotAContainer(String),

    #[error("corrupt or unsupported archive data: {0}")]
    Corrupt(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    /// Same failure, for reporting against several entries at once
    pub fn replicate(&self) -> Self {
        match self {
            ArchiveError::NotFound(s) => ArchiveError::NotFound(s.clone()),
            ArchiveError::PasswordRequired(s) => ArchiveError::PasswordRequired(s.clone()),
            ArchiveError::WrongPassword(s) => ArchiveError::WrongPassword(s.clone()),
            ArchiveError::NotAContainer(s) => ArchiveError::NotAContainer(s.clone()),
            ArchiveError::Corrupt(s) => ArchiveError::Corrupt(s.clone()),
            ArchiveError::Io(e) => ArchiveError::Io(io::Error::new(e.kind(), e.to_string())),
        }
    }

    /// Password problems are the one failure a re-run with corrected
    /// configuration can fix
    pub fn is_password_error(&self) -> bool {
        matches!(
            self,
            ArchiveError::PasswordRequired(_) | ArchiveError::WrongPassword(_)
        )
    }
}

/// Read access to a collection archive and the sub-archives nested in it.
///
/// Implementations acquire whatever handle they need per call and release it
/// before returning, so no decryption context outlives a single operation.
pub trait ArchiveReader {
    /// List every entry of the container at `location`
    fn list(&mut self, location: &ArchiveLocation) -> Result<Vec<ListedEntry>, ArchiveError>;

    /// Open one entry of the container at `location` for reading
    fn open<'a>(
        &'a mut self,
        location: &ArchiveLocation,
        entry_path: &str,
    ) -> Result<Box<dyn Read + 'a>, ArchiveError>;

    /// Read a whole entry into memory
    fn read_all(
        &mut self,
        location: &ArchiveLocation,
        entry_path: &str,
    ) -> Result<Vec<u8>, ArchiveError> {
        let mut reader = self.open(location, entry_path)?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf)?;
        Ok(buf)
    }

    /// Stream several entries of the container at `location` in one pass.
    ///
    /// `each` receives the index into `wanted` and a reader over that entry,
    /// in whatever order the container stores them. It must consume the
    /// reader or return an error; an `Err` means the entry's bytes could not
    /// be read. Entries that could not be delivered come back as
    /// `(index, error)` pairs. `Err` is returned only when the container
    /// itself cannot be opened. `wanted` paths are distinct ignoring ASCII
    /// case.
    fn stream_entries(
        &mut self,
        location: &ArchiveLocation,
        wanted: &[String],
        each: &mut dyn FnMut(usize, &mut dyn Read) -> io::Result<()>,
    ) -> Result<Vec<(usize, ArchiveError)>, ArchiveError> {
        let mut failures = Vec::new();
        for (index, entry_path) in wanted.iter().enumerate() {
            let outcome = match self.open(location, entry_path) {
                Ok(mut reader) => each(index, &mut reader).map_err(ArchiveError::Io),
                Err(e) => Err(e),
            };
            if let Err(e) = outcome {
                failures.push((index, e));
            }
        }
        Ok(failures)
    }
}

/// Normalise an in-archive path to `/` separators without leading `./` or `/`
pub fn normalize_entry_path(path: &str) -> String {
    let unified = path.replace('\\', "/");
    unified
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Join a manifest-relative path onto the directory holding the manifest
pub fn join_entry_path(dir: &str, relative: &str) -> String {
    let relative = normalize_entry_path(relative);
    if dir.is_empty() {
        relative
    } else {
        format!("{}/{}", normalize_entry_path(dir), relative)
    }
}

/// Whether a file name designates a nested archive
pub fn is_container_name(name: &str) -> bool {
    name.to_ascii_lowercase().ends_with(".7z")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_display_and_depth() {
        let root = ArchiveLocation::root(None);
        assert_eq!(root.to_string(), ".");
        assert_eq!(root.container_name(), ".");

        let inner = root
            .nested("General.7z", None)
            .nested("dir/Detail.7z", Some("secret".to_string()));
        assert_eq!(inner.depth(), 2);
        assert_eq!(inner.to_string(), "./General.7z/dir/Detail.7z");
        assert_eq!(inner.container_name(), "Detail.7z");
        assert_eq!(inner.parent().unwrap().to_string(), "./General.7z");
    }

    #[test]
    fn test_debug_redacts_passwords() {
        let loc = ArchiveLocation::root(None).nested("a.7z", Some("hunter2".to_string()));
        let hop = format!("{:?}", loc.hops()[0]);
        assert!(!hop.contains("hunter2"));
        assert!(!format!("{:?}", loc).contains("hunter2"));
    }

    #[test]
    fn test_entry_path_helpers() {
        assert_eq!(normalize_entry_path(".\\Sample\\a.dat"), "Sample/a.dat");
        assert_eq!(join_entry_path("", "x\\y"), "x/y");
        assert_eq!(join_entry_path("sub", "x/y"), "sub/x/y");
        assert!(is_container_name("Detail.7Z"));
        assert!(!is_container_name("GetThis.csv"));

        let entry = ListedEntry {
            path: "sub/GetThis.csv".to_string(),
            size: 0,
            kind: EntryKind::File,
        };
        assert_eq!(entry.file_name(), "GetThis.csv");
        assert_eq!(entry.parent_dir(), "sub");
    }
}
