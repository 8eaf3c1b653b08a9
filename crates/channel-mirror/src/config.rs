//! Mirror configuration (mirror.toml)
//!
//! ```toml
//! [channel]
//! source = "/srv/upstream"
//! target = "/srv/mirror"
//!
//! [requirements]
//! roots = ["python >=3.9,<3.10"]
//! exclusions = ["setuptools <=60.0"]
//! subdirs = ["linux-64", "noarch"]
//!
//! [resolver]
//! latest = "version"
//! workers = 4
//!
//! [patch]
//! parent = "/srv/patches"
//! ```

use crate::matchspec::{MatchSpec, SpecError};
use crate::requirements::RequirementSet;
use crate::resolver::ResolverOptions;
use crate::subdir;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors that can occur while loading a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read configuration file
    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse configuration: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Validation error
    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    /// A requirement is not a valid match specification
    #[error("Invalid requirement: {0}")]
    Spec(#[from] SpecError),
}

/// Mirror configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MirrorConfig {
    pub channel: ChannelConfig,

    pub requirements: RequirementsConfig,

    #[serde(default)]
    pub resolver: ResolverOptions,

    #[serde(default)]
    pub patch: PatchConfig,
}

/// Source and target channel locations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Upstream channel directory
    pub source: PathBuf,

    /// Local channel to update; patches only when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequirementsConfig {
    pub roots: Vec<String>,

    #[serde(default)]
    pub exclusions: Vec<String>,

    #[serde(default)]
    pub disposables: Vec<String>,

    /// Platform subdir and noarch when empty
    #[serde(default)]
    pub subdirs: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatchConfig {
    /// Patch name (defaults to a timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Directory patches are written to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<PathBuf>,
}

impl MirrorConfig {
    /// Load a configuration from a file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Parse a configuration from a string
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: MirrorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.requirements.roots.is_empty() {
            return Err(ConfigError::ValidationError(
                "At least one root requirement is needed".to_string(),
            ));
        }

        let requirements = &self.requirements;
        for spec in requirements
            .roots
            .iter()
            .chain(&requirements.exclusions)
            .chain(&requirements.disposables)
        {
            MatchSpec::parse(spec)?;
        }

        if let Some(unknown) = requirements.subdirs.iter().find(|s| !subdir::is_known(s)) {
            return Err(ConfigError::ValidationError(format!(
                "Unknown subdir: {}",
                unknown
            )));
        }

        if self.resolver.workers == Some(0) {
            return Err(ConfigError::ValidationError(
                "resolver.workers must be at least 1".to_string(),
            ));
        }

        if let Some(name) = &self.patch.name {
            if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid patch name: {}",
                    name
                )));
            }
        }

        Ok(())
    }

    /// Save the configuration to a file
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Build the requirement set
    pub fn requirements(&self) -> Result<RequirementSet, ConfigError> {
        let requirements = RequirementSet::new(&self.requirements.roots)?
            .with_exclusions(&self.requirements.exclusions)?
            .with_disposables(&self.requirements.disposables)?
            .with_subdirs(self.requirements.subdirs.iter().cloned());
        Ok(requirements)
    }

    pub fn resolver_options(&self) -> &ResolverOptions {
        &self.resolver
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Latest;

    const CONFIG: &str = r#"
        [channel]
        source = "/srv/upstream"
        target = "/srv/mirror"

        [requirements]
        roots = ["python >=3.9,<3.10", "pip"]
        exclusions = ["setuptools <=60.0"]
        disposables = ["tzdata"]
        subdirs = ["linux-64", "noarch"]

        [resolver]
        latest = "build"
        strict = true

        [patch]
        name = "weekly"
    "#;

    #[test]
    fn test_parse_config() {
        let config = MirrorConfig::from_str(CONFIG).unwrap();
        assert_eq!(config.channel.source, PathBuf::from("/srv/upstream"));
        assert_eq!(config.channel.target, Some(PathBuf::from("/srv/mirror")));
        assert_eq!(config.resolver.latest, Some(Latest::Build));
        assert!(config.resolver.strict);
        assert_eq!(config.patch.name.as_deref(), Some("weekly"));

        let reqs = config.requirements().unwrap();
        assert_eq!(reqs.roots().len(), 2);
        assert_eq!(reqs.exclusions().len(), 1);
        assert_eq!(reqs.disposables().len(), 1);
        assert_eq!(reqs.subdirs().len(), 2);
    }

    #[test]
    fn test_minimal_config() {
        let config = MirrorConfig::from_str(
            r#"
            [channel]
            source = "upstream"

            [requirements]
            roots = ["pip"]
            "#,
        )
        .unwrap();

        assert_eq!(config.channel.target, None);
        assert_eq!(config.resolver, ResolverOptions::default());
        assert_eq!(config.patch, PatchConfig::default());
        assert!(!config.requirements().unwrap().subdirs().is_empty());
    }

    #[test]
    fn test_invalid_configs() {
        let base = |requirements: &str, extra: &str| {
            format!(
                "[channel]\nsource = \"s\"\n[requirements]\n{}\n{}",
                requirements, extra
            )
        };

        assert!(matches!(
            MirrorConfig::from_str(&base("roots = []", "")),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(matches!(
            MirrorConfig::from_str(&base("roots = [\"pip >=\"]", "")),
            Err(ConfigError::Spec(_))
        ));
        assert!(matches!(
            MirrorConfig::from_str(&base("roots = [\"pip\"]\nsubdirs = [\"amiga-68k\"]", "")),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(matches!(
            MirrorConfig::from_str(&base("roots = [\"pip\"]", "[resolver]\nworkers = 0")),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(matches!(
            MirrorConfig::from_str(&base("roots = [\"pip\"]", "[patch]\nname = \"a/b\"")),
            Err(ConfigError::ValidationError(_))
        ));
        assert!(matches!(
            MirrorConfig::from_str("[channel]\nsource = 1"),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_round_trip_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("mirror.toml");
        let config = MirrorConfig::from_str(CONFIG).unwrap();
        config.to_file(&path).unwrap();
        assert_eq!(MirrorConfig::from_file(&path).unwrap(), config);
    }
}
