/// In-memory archive tree
///
/// Mirrors the layout of a collection archive without touching disk. Nested
/// containers may carry a password; opening one without the matching password
/// fails the same way a protected 7z sub-archive does.
use std::io::{Cursor, Read};

use super::{
    normalize_entry_path, ArchiveError, ArchiveLocation, ArchiveReader, EntryKind, ListedEntry,
};

#[derive(Debug, Clone)]
enum MemoryNode {
    File(Vec<u8>),
    Container(MemoryContainer),
}

/// One container level: files and nested containers in insertion order
#[derive(Debug, Clone, Default)]
pub struct MemoryContainer {
    entries: Vec<(String, MemoryNode)>,
    password: Option<String>,
}

impl MemoryContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `password` to open this container
    pub fn protected(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_file(mut self, path: impl AsRef<str>, data: impl Into<Vec<u8>>) -> Self {
        self.entries.push((
            normalize_entry_path(path.as_ref()),
            MemoryNode::File(data.into()),
        ));
        self
    }

    pub fn with_container(mut self, path: impl AsRef<str>, container: MemoryContainer) -> Self {
        self.entries.push((
            normalize_entry_path(path.as_ref()),
            MemoryNode::Container(container),
        ));
        self
    }

    fn find(&self, path: &str) -> Option<&MemoryNode> {
        let wanted = normalize_entry_path(path);
        self.entries
            .iter()
            .find(|(name, _)| *name == wanted)
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case(&wanted))
            })
            .map(|(_, node)| node)
    }

    fn unlock(&self, name: &str, supplied: Option<&str>) -> Result<(), ArchiveError> {
        match (&self.password, supplied) {
            (None, _) => Ok(()),
            (Some(_), None) => Err(ArchiveError::PasswordRequired(name.to_string())),
            (Some(expected), Some(given)) if expected == given => Ok(()),
            (Some(_), Some(_)) => Err(ArchiveError::WrongPassword(name.to_string())),
        }
    }
}

/// [`ArchiveReader`] over a [`MemoryContainer`] tree
#[derive(Debug, Clone)]
pub struct MemoryArchive {
    root: MemoryContainer,
}

impl MemoryArchive {
    pub fn new(root: MemoryContainer) -> Self {
        Self { root }
    }

    fn resolve(&self, location: &ArchiveLocation) -> Result<&MemoryContainer, ArchiveError> {
        self.root.unlock(".", location.root_password())?;

        let mut current = &self.root;
        for hop in location.hops() {
            current = match current.find(&hop.entry_path) {
                Some(MemoryNode::Container(inner)) => inner,
                Some(MemoryNode::File(_)) => {
                    return Err(ArchiveError::NotAContainer(hop.entry_path.clone()))
                }
                None => return Err(ArchiveError::NotFound(hop.entry_path.clone())),
            };
            current.unlock(&hop.entry_path, hop.password.as_deref())?;
        }
        Ok(current)
    }
}

impl ArchiveReader for MemoryArchive {
    fn list(&mut self, location: &ArchiveLocation) -> Result<Vec<ListedEntry>, ArchiveError> {
        let container = self.resolve(location)?;
        Ok(container
            .entries
            .iter()
            .map(|(path, node)| match node {
                MemoryNode::File(data) => ListedEntry {
                    path: path.clone(),
                    size: data.len() as u64,
                    kind: EntryKind::File,
                },
                MemoryNode::Container(_) => ListedEntry {
                    path: path.clone(),
                    size: 0,
                    kind: EntryKind::Container,
                },
            })
            .collect())
    }

    fn open<'a>(
        &'a mut self,
        location: &ArchiveLocation,
        entry_path: &str,
    ) -> Result<Box<dyn Read + 'a>, ArchiveError> {
        let container = self.resolve(location)?;
        match container.find(entry_path) {
            Some(MemoryNode::File(data)) => Ok(Box::new(Cursor::new(data.as_slice()))),
            Some(MemoryNode::Container(_)) => Err(ArchiveError::Corrupt(format!(
                "`{}` is a container, not a file",
                entry_path
            ))),
            None => Err(ArchiveError::NotFound(entry_path.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MemoryArchive {
        MemoryArchive::new(
            MemoryContainer::new()
                .with_file("GetThis.csv", "header\n")
                .with_container(
                    "Detail.7z",
                    MemoryContainer::new()
                        .protected("infected")
                        .with_file("Sample\\a.dat", b"payload".to_vec()),
                ),
        )
    }

    #[test]
    fn test_list_root() {
        let mut archive = sample();
        let entries = archive.list(&ArchiveLocation::root(None)).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].kind, EntryKind::Container);
    }

    #[test]
    fn test_protected_container_requires_password() {
        let mut archive = sample();
        let root = ArchiveLocation::root(None);

        let err = archive.list(&root.nested("Detail.7z", None)).unwrap_err();
        assert!(matches!(err, ArchiveError::PasswordRequired(_)));

        let err = archive
            .list(&root.nested("Detail.7z", Some("nope".to_string())))
            .unwrap_err();
        assert!(matches!(err, ArchiveError::WrongPassword(_)));

        let inner = root.nested("Detail.7z", Some("infected".to_string()));
        let data = archive.read_all(&inner, "sample/A.DAT").unwrap();
        assert_eq!(data, b"payload");
    }

    #[test]
    fn test_missing_entry() {
        let mut archive = sample();
        let err = archive
            .read_all(&ArchiveLocation::root(None), "nothing.bin")
            .unwrap_err();
        assert!(matches!(err, ArchiveError::NotFound(_)));
    }
}
