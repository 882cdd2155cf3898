/// Destination path reconstruction
///
/// Maps a manifest entry's original absolute path onto the output tree:
/// volume prefix replaced by the resolved root, every segment sanitised,
/// traversal collapsed, limits enforced, and collisions disambiguated with a
/// tag derived from the entry's source. Nothing here writes to disk.
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::audit::ReasonCode;
use crate::manifest::ManifestEntry;
use crate::volume::VolumeMap;

/// Characters Windows refuses in file names
const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '|', '?', '*', '/', '\\'];

/// Device names Windows reserves regardless of extension
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Destination filesystem limits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PathLimits {
    /// Longest full destination path, in bytes
    pub max_path_length: usize,
    /// Longest single path segment, in bytes
    pub max_segment_length: usize,
}

impl Default for PathLimits {
    fn default() -> Self {
        Self {
            max_path_length: if cfg!(windows) { 260 } else { 4096 },
            max_segment_length: 255,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconstructError {
    #[error("original path `{path}` is unusable: {problem}")]
    IllegalPath { path: String, problem: String },

    #[error("path segment `{segment}` is {length} bytes, limit is {limit}")]
    SegmentTooLong {
        segment: String,
        length: usize,
        limit: usize,
    },

    #[error("destination {path} is {length} bytes, limit is {limit}")]
    PathTooLong {
        path: PathBuf,
        length: usize,
        limit: usize,
    },

    #[error("{path} is taken and so are its disambiguated alternatives")]
    CollisionUnresolvable { path: PathBuf },
}

impl ReconstructError {
    pub fn reason(&self) -> ReasonCode {
        match self {
            ReconstructError::IllegalPath { .. } => ReasonCode::IllegalPath,
            ReconstructError::SegmentTooLong { .. } | ReconstructError::PathTooLong { .. } => {
                ReasonCode::PathTooLong
            }
            ReconstructError::CollisionUnresolvable { .. } => ReasonCode::CollisionUnresolvable,
        }
    }
}

/// A reconstructed location strictly inside the output root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestinationPath {
    segments: Vec<String>,
    path: PathBuf,
    disambiguated: bool,
}

impl DestinationPath {
    /// Segments below the output root; the first is the volume root
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn root_segment(&self) -> &str {
        &self.segments[0]
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.path
    }

    /// Whether a collision tag was added to the file name
    pub fn is_disambiguated(&self) -> bool {
        self.disambiguated
    }
}

/// Replace or strip characters the destination cannot hold.
///
/// Returns `None` when nothing usable remains.
pub fn sanitize_segment(segment: &str) -> Option<String> {
    let replaced: String = segment
        .chars()
        .map(|c| {
            if c.is_control() || INVALID_CHARS.contains(&c) {
                '_'
            } else {
                c
            }
        })
        .collect();

    let trimmed = replaced.trim_end_matches(['.', ' ']);
    if trimmed.is_empty() {
        return None;
    }

    let stem = trimmed.split('.').next().unwrap_or(trimmed).trim_end();
    if RESERVED_NAMES.iter().any(|r| r.eq_ignore_ascii_case(stem)) {
        Some(format!("_{}", trimmed))
    } else {
        Some(trimmed.to_string())
    }
}

/// Split an original absolute path into its segments, discarding the
/// drive, device or UNC prefix
pub fn split_original_path(original: &str) -> Vec<String> {
    let unified = original.trim().replace('\\', "/");
    let parts: Vec<&str> = unified.split('/').collect();

    let skip = if unified.starts_with("//?/") || unified.starts_with("//./") {
        // "", "", "?", <token>, ...
        match parts.get(3) {
            Some(token) if token.eq_ignore_ascii_case("GLOBALROOT") => 6, // GLOBALROOT/Device/<dev>
            Some(token) if token.eq_ignore_ascii_case("UNC") => 6,        // UNC/<server>/<share>
            _ => 4,
        }
    } else if unified.starts_with("//") {
        4 // "", "", <server>, <share>
    } else {
        0
    };

    let mut segments: Vec<String> = parts
        .iter()
        .skip(skip)
        .map(|s| s.to_string())
        .collect();

    if skip == 0 {
        if let Some(first) = segments.first_mut() {
            let bytes = first.as_bytes();
            if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
                *first = first[2..].to_string();
            }
        }
    }

    segments.retain(|s| !s.is_empty());
    segments
}

/// Tag appended to colliding file names, stable across runs
pub fn collision_tag(source_key: &str, len: usize) -> String {
    let digest = Sha256::digest(source_key.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    hex[..len.min(hex.len())].to_string()
}

/// `name.ext` -> `name (tag).ext`, keeping the extension parsers rely on
fn tagged_name(name: &str, tag: &str) -> String {
    match name.rfind('.') {
        Some(idx) if idx > 0 => format!("{} ({}){}", &name[..idx], tag, &name[idx..]),
        _ => format!("{} ({})", name, tag),
    }
}

fn is_taken(path: &Path, claimed: &HashSet<PathBuf>) -> bool {
    claimed.contains(path) || path.symlink_metadata().is_ok()
}

/// Computes destination paths below a fixed output root
#[derive(Debug, Clone)]
pub struct PathReconstructor {
    output_root: PathBuf,
    limits: PathLimits,
}

impl PathReconstructor {
    pub fn new(output_root: impl Into<PathBuf>, limits: PathLimits) -> Self {
        Self {
            output_root: output_root.into(),
            limits,
        }
    }

    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// Destination for a collected file.
    ///
    /// `claimed` holds paths already handed out in this run; paths present
    /// on disk count as taken too.
    pub fn reconstruct(
        &self,
        entry: &ManifestEntry,
        volumes: &VolumeMap,
        claimed: &HashSet<PathBuf>,
    ) -> Result<DestinationPath, ReconstructError> {
        let illegal = |problem: &str| ReconstructError::IllegalPath {
            path: entry.original_path.clone(),
            problem: problem.to_string(),
        };

        if entry.original_path.trim().is_empty() {
            return Err(illegal("empty original path"));
        }

        let root = volumes.root_for(&entry.volume_id, entry.snapshot_id.as_deref());
        let root_segment = sanitize_segment(&root.directory_name())
            .ok_or_else(|| illegal("volume root name reduces to nothing"))?;

        let mut segments = vec![root_segment];
        for raw in split_original_path(&entry.original_path) {
            match raw.as_str() {
                "." => {}
                ".." => {
                    // Never climb above the volume root
                    if segments.len() > 1 {
                        segments.pop();
                    }
                }
                _ => {
                    let clean = sanitize_segment(&raw).ok_or_else(|| {
                        illegal(&format!("segment `{}` reduces to nothing", raw))
                    })?;
                    segments.push(clean);
                }
            }
        }

        if segments.len() < 2 {
            return Err(illegal("no file name"));
        }

        let source_key = entry.source_display();
        self.place(segments, &source_key, claimed)
            .map_err(|e| match e {
                ReconstructError::IllegalPath { problem, .. } => ReconstructError::IllegalPath {
                    path: entry.original_path.clone(),
                    problem,
                },
                other => other,
            })
    }

    /// Destination for a report file copied into `reports_dir`
    pub fn report_destination(
        &self,
        reports_dir: &str,
        file_name: &str,
        source_key: &str,
        claimed: &HashSet<PathBuf>,
    ) -> Result<DestinationPath, ReconstructError> {
        let illegal = |problem: &str| ReconstructError::IllegalPath {
            path: source_key.to_string(),
            problem: problem.to_string(),
        };
        let dir = sanitize_segment(reports_dir).ok_or_else(|| illegal("reports directory name"))?;
        let name = sanitize_segment(file_name).ok_or_else(|| illegal("report file name"))?;
        self.place(vec![dir, name], source_key, claimed)
    }

    fn place(
        &self,
        segments: Vec<String>,
        source_key: &str,
        claimed: &HashSet<PathBuf>,
    ) -> Result<DestinationPath, ReconstructError> {
        let first = self.candidate(segments.clone(), false)?;
        if !is_taken(&first.path, claimed) {
            return Ok(first);
        }

        // One tagged attempt, one longer-tagged retry
        let file_name = segments.last().cloned().unwrap_or_default();
        for tag_len in [8, 16] {
            let mut tagged = segments.clone();
            if let Some(last) = tagged.last_mut() {
                *last = tagged_name(&file_name, &collision_tag(source_key, tag_len));
            }
            let candidate = self.candidate(tagged, true)?;
            if !is_taken(&candidate.path, claimed) {
                tracing::debug!(
                    "{} taken, using {}",
                    first.path.display(),
                    candidate.path.display()
                );
                return Ok(candidate);
            }
        }

        Err(ReconstructError::CollisionUnresolvable { path: first.path })
    }

    fn candidate(
        &self,
        segments: Vec<String>,
        disambiguated: bool,
    ) -> Result<DestinationPath, ReconstructError> {
        // Collision tags lengthen the file name, so tagged candidates are
        // checked again here.
        for segment in &segments {
            if segment.len() > self.limits.max_segment_length {
                return Err(ReconstructError::SegmentTooLong {
                    segment: segment.clone(),
                    length: segment.len(),
                    limit: self.limits.max_segment_length,
                });
            }
        }

        let relative: PathBuf = segments.iter().collect();

        // Sanitised segments are always plain names; anything else would let
        // the path leave the output root.
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
            || relative.components().count() != segments.len()
        {
            return Err(ReconstructError::IllegalPath {
                path: relative.display().to_string(),
                problem: "segment is not a plain name".to_string(),
            });
        }

        let path = self.output_root.join(&relative);
        let length = path.as_os_str().len();
        if length > self.limits.max_path_length {
            return Err(ReconstructError::PathTooLong {
                path,
                length,
                limit: self.limits.max_path_length,
            });
        }

        Ok(DestinationPath {
            segments,
            path,
            disambiguated,
        })
    }
}
