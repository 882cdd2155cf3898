/// Depth-bounded traversal of nested containers
use std::collections::{BTreeMap, HashSet, VecDeque};

use super::{ArchiveError, ArchiveLocation, ArchiveReader, EntryKind, ListedEntry};

/// How nested sub-archives are opened during a walk
#[derive(Debug, Clone)]
pub struct NestingPolicy {
    /// Descend into sub-archives at all
    pub enabled: bool,
    /// Deepest hop count that is still opened
    pub max_depth: usize,
    /// Password per sub-archive, keyed by entry path or file name. The key
    /// `"."` applies to the top-level archive.
    pub passwords: BTreeMap<String, String>,
    /// Tried for any container without a specific entry
    pub default_password: Option<String>,
}

impl Default for NestingPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: 8,
            passwords: BTreeMap::new(),
            default_password: None,
        }
    }
}

impl NestingPolicy {
    /// Password to use for the container stored at `entry_path`
    pub fn password_for(&self, entry_path: &str) -> Option<String> {
        let file_name = entry_path.rsplit('/').next().unwrap_or(entry_path);
        self.passwords
            .get(entry_path)
            .or_else(|| self.passwords.get(file_name))
            .or(self.default_password.as_ref())
            .cloned()
    }

    pub fn root_location(&self) -> ArchiveLocation {
        ArchiveLocation::root(self.passwords.get(".").cloned())
    }
}

/// A container that was opened and listed
#[derive(Debug, Clone)]
pub struct OpenedContainer {
    pub location: ArchiveLocation,
    pub entries: Vec<ListedEntry>,
}

impl OpenedContainer {
    /// File entries only, in listing order
    pub fn files(&self) -> impl Iterator<Item = &ListedEntry> {
        self.entries.iter().filter(|e| e.kind == EntryKind::File)
    }
}

/// A container that could not be opened
#[derive(Debug)]
pub struct ContainerFailure {
    pub location: ArchiveLocation,
    pub error: ArchiveError,
}

#[derive(Debug)]
pub enum WalkStep {
    Opened(OpenedContainer),
    Failed(ContainerFailure),
}

/// Pull-based walk over every container of a collection archive.
///
/// Containers are visited depth-first in listing order. The walker holds no
/// archive handle between steps; each step borrows the reader only while the
/// container is being listed.
pub struct ContainerWalker {
    policy: NestingPolicy,
    stack: Vec<ArchiveLocation>,
    deferred: VecDeque<ContainerFailure>,
    seen: HashSet<ArchiveLocation>,
}

impl ContainerWalker {
    pub fn new(policy: NestingPolicy) -> Self {
        let root = policy.root_location();
        Self {
            policy,
            stack: vec![root],
            deferred: VecDeque::new(),
            seen: HashSet::new(),
        }
    }

    pub fn policy(&self) -> &NestingPolicy {
        &self.policy
    }

    /// Open the next container, or `None` once the walk is complete
    pub fn next_step(&mut self, reader: &mut dyn ArchiveReader) -> Option<WalkStep> {
        if let Some(failure) = self.deferred.pop_front() {
            return Some(WalkStep::Failed(failure));
        }

        let location = loop {
            let candidate = self.stack.pop()?;
            if self.seen.insert(candidate.clone()) {
                break candidate;
            }
        };

        let entries = match reader.list(&location) {
            Ok(entries) => entries,
            Err(error) => {
                tracing::warn!("Cannot open container {}: {}", location, error);
                return Some(WalkStep::Failed(ContainerFailure { location, error }));
            }
        };

        self.schedule_children(&location, &entries);

        tracing::debug!("Opened container {} ({} entries)", location, entries.len());
        Some(WalkStep::Opened(OpenedContainer { location, entries }))
    }

    fn schedule_children(&mut self, location: &ArchiveLocation, entries: &[ListedEntry]) {
        let containers: Vec<&ListedEntry> = entries
            .iter()
            .filter(|e| e.kind == EntryKind::Container)
            .collect();

        if containers.is_empty() {
            return;
        }
        if !self.policy.enabled {
            tracing::debug!(
                "Nested traversal disabled, skipping {} sub-archive(s) in {}",
                containers.len(),
                location
            );
            return;
        }

        // Reverse so the stack pops children in listing order
        for entry in containers.into_iter().rev() {
            let password = self.policy.password_for(&entry.path);
            let child = location.nested(entry.path.clone(), password);
            if child.depth() > self.policy.max_depth {
                tracing::warn!(
                    "Nesting depth limit ({}) reached, not opening {}",
                    self.policy.max_depth,
                    child
                );
                self.deferred.push_front(ContainerFailure {
                    error: ArchiveError::Corrupt(format!(
                        "nesting depth limit of {} exceeded",
                        self.policy.max_depth
                    )),
                    location: child,
                });
                continue;
            }
            self.stack.push(child);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{MemoryArchive, MemoryContainer};

    fn nested_chain(levels: usize) -> MemoryContainer {
        let mut inner = MemoryContainer::new().with_file("leaf.txt", "leaf");
        for level in (0..levels).rev() {
            inner = MemoryContainer::new()
                .with_file(format!("level{}.txt", level), "x")
                .with_container("next.7z", inner);
        }
        inner
    }

    fn collect(walker: &mut ContainerWalker, reader: &mut dyn ArchiveReader) -> Vec<WalkStep> {
        let mut steps = Vec::new();
        while let Some(step) = walker.next_step(reader) {
            steps.push(step);
        }
        steps
    }

    #[test]
    fn test_walk_visits_in_listing_order() {
        let mut archive = MemoryArchive::new(
            MemoryContainer::new()
                .with_container("a.7z", MemoryContainer::new().with_file("1", "1"))
                .with_container("b.7z", MemoryContainer::new().with_file("2", "2")),
        );
        let mut walker = ContainerWalker::new(NestingPolicy::default());
        let order: Vec<String> = collect(&mut walker, &mut archive)
            .into_iter()
            .map(|step| match step {
                WalkStep::Opened(c) => c.location.to_string(),
                WalkStep::Failed(f) => panic!("unexpected failure {}", f.error),
            })
            .collect();
        assert_eq!(order, vec![".", "./a.7z", "./b.7z"]);
    }

    #[test]
    fn test_depth_guard_stops_runaway_nesting() {
        let mut archive = MemoryArchive::new(nested_chain(10));
        let policy = NestingPolicy {
            max_depth: 3,
            ..Default::default()
        };
        let mut walker = ContainerWalker::new(policy);
        let steps = collect(&mut walker, &mut archive);

        let opened = steps
            .iter()
            .filter(|s| matches!(s, WalkStep::Opened(_)))
            .count();
        let failed: Vec<&ContainerFailure> = steps
            .iter()
            .filter_map(|s| match s {
                WalkStep::Failed(f) => Some(f),
                _ => None,
            })
            .collect();

        assert_eq!(opened, 4); // root + 3 levels
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].location.depth(), 4);
    }

    #[test]
    fn test_disabled_nesting_only_opens_root() {
        let mut archive = MemoryArchive::new(nested_chain(2));
        let policy = NestingPolicy {
            enabled: false,
            ..Default::default()
        };
        let mut walker = ContainerWalker::new(policy);
        assert_eq!(collect(&mut walker, &mut archive).len(), 1);
    }

    #[test]
    fn test_password_lookup() {
        let mut policy = NestingPolicy::default();
        policy
            .passwords
            .insert("Detail.7z".to_string(), "by-name".to_string());
        policy
            .passwords
            .insert("dir/Other.7z".to_string(), "by-path".to_string());

        assert_eq!(policy.password_for("x/Detail.7z").as_deref(), Some("by-name"));
        assert_eq!(policy.password_for("dir/Other.7z").as_deref(), Some("by-path"));
        assert_eq!(policy.password_for("Unknown.7z"), None);

        policy.default_password = Some("fallback".to_string());
        assert_eq!(policy.password_for("Unknown.7z").as_deref(), Some("fallback"));
    }
}
