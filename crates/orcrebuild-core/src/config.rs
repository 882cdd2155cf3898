/// Run configuration
///
/// Loaded from a TOML file whose layout is a superset of the collector
/// rebuild configuration: `[protected]` passwords, `[reports]` files copied
/// verbatim, plus nesting limits, path limits and extra manifest schemas.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::archive::NestingPolicy;
use crate::manifest::ManifestSchema;
use crate::reconstruct::PathLimits;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Passwords for protected sub-archives
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProtectedConfig {
    /// Sub-archive entry path or file name -> password. `"."` is the
    /// top-level archive.
    pub sub_archive: BTreeMap<String, String>,
    pub default_password: Option<String>,
}

/// Files copied verbatim into the reports directory
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReportsConfig {
    /// `<container name>/<entry path>` or bare entry path
    pub filenames: Vec<String>,
    pub target_directory: String,
}

impl Default for ReportsConfig {
    fn default() -> Self {
        Self {
            filenames: Vec::new(),
            target_directory: "reports".to_string(),
        }
    }
}

impl ReportsConfig {
    /// Whether the entry at `entry_path` inside `container_name` is a report
    pub fn matches(&self, container_name: &str, entry_path: &str) -> bool {
        let qualified = format!("{}/{}", container_name, entry_path);
        self.filenames.iter().any(|pattern| {
            let pattern = pattern.replace('\\', "/");
            let pattern = pattern.trim_start_matches("./");
            pattern.eq_ignore_ascii_case(&qualified)
                || pattern.eq_ignore_ascii_case(qualified.trim_start_matches("./"))
                || pattern.eq_ignore_ascii_case(entry_path)
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NestedConfig {
    pub enabled: bool,
    pub max_depth: usize,
}

impl Default for NestedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_depth: 8,
        }
    }
}

/// Everything the rebuild engine needs beyond the archive and output root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RebuildConfig {
    /// Replace volume identifiers with drive letters from `volstats.csv`
    pub rename_volumes: bool,
    pub protected: ProtectedConfig,
    pub reports: ReportsConfig,
    pub nested: NestedConfig,
    pub limits: PathLimits,
    /// Extraction sources in addition to `GetThis.csv`
    pub manifests: Vec<ManifestSchema>,
}

impl Default for RebuildConfig {
    fn default() -> Self {
        Self {
            rename_volumes: true,
            protected: ProtectedConfig::default(),
            reports: ReportsConfig::default(),
            nested: NestedConfig::default(),
            limits: PathLimits::default(),
            manifests: Vec::new(),
        }
    }
}

impl RebuildConfig {
    /// Load from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML text
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.reports.target_directory.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "reports.target_directory must not be empty".to_string(),
            ));
        }
        if self.limits.max_segment_length == 0 || self.limits.max_path_length == 0 {
            return Err(ConfigError::Invalid("path limits must be positive".to_string()));
        }
        for schema in &self.manifests {
            if schema.file_name.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "every [[manifests]] entry needs a file_name".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Set a password for a sub-archive (or `"."` for the top-level archive)
    pub fn with_password(mut self, archive: impl Into<String>, password: impl Into<String>) -> Self {
        self.protected
            .sub_archive
            .insert(archive.into(), password.into());
        self
    }

    /// The primary manifest followed by configured extra schemas
    pub fn manifest_schemas(&self) -> Vec<ManifestSchema> {
        let mut schemas = vec![ManifestSchema::getthis()];
        for schema in &self.manifests {
            if schemas.iter().any(|s| s.matches(&schema.file_name)) {
                // A configured schema for an already known name replaces it
                schemas.retain(|s| !s.matches(&schema.file_name));
            }
            schemas.push(schema.clone());
        }
        schemas
    }

    pub fn nesting_policy(&self) -> NestingPolicy {
        NestingPolicy {
            enabled: self.nested.enabled,
            max_depth: self.nested.max_depth,
            passwords: self.protected.sub_archive.clone(),
            default_password: self.protected.default_password.clone(),
        }
    }
}
