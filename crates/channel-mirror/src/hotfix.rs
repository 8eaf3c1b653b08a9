//! Hotfix instructions
//!
//! Hotfixes amend a channel's published metadata without touching package
//! files. Each subdir carries a `patch_instructions.json` mapping a file name
//! to the latest directive for it. Directives merge last-writer-wins by
//! timestamp.

use crate::error::ChannelAccessError;
use crate::fsutil;
use crate::record::PackageRecord;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// File name of the per-subdir instructions
pub const INSTRUCTIONS_FILE: &str = "patch_instructions.json";

/// Tarball bundling the instructions of every subdir
pub const GENERATOR_FILE: &str = "patch_generator.tar.gz";

pub const INSTRUCTIONS_VERSION: u32 = 1;

/// Record fields an override may not change
const IDENTITY_FIELDS: [&str; 5] = ["name", "version", "build", "subdir", "fn"];

/// What a directive does to its package
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HotfixAction {
    /// Hide the package from the index; the file stays
    Revoke {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sha256: Option<String>,
    },

    /// Hide the package and delete its file on the next index
    Remove,

    /// Attach a track feature
    TrackFeature { feature: String },

    /// Replace metadata fields
    Override { fields: Map<String, Value> },
}

/// A timestamped action for one file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Directive {
    pub action: HotfixAction,

    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl Directive {
    pub fn new(action: HotfixAction, timestamp: u64) -> Self {
        Self { action, timestamp }
    }

    pub fn revoke(sha256: Option<String>, timestamp: u64) -> Self {
        Self::new(HotfixAction::Revoke { sha256 }, timestamp)
    }

    /// Check if the directive hides its package from the index
    pub fn withdraws(&self) -> bool {
        matches!(
            self.action,
            HotfixAction::Revoke { .. } | HotfixAction::Remove
        )
    }
}

/// Hotfix directives of one subdir
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HotfixInstructions {
    #[serde(rename = "patch_instructions_version", default = "default_version")]
    pub version: u32,

    #[serde(default)]
    pub directives: BTreeMap<String, Directive>,
}

fn default_version() -> u32 {
    INSTRUCTIONS_VERSION
}

impl Default for HotfixInstructions {
    fn default() -> Self {
        Self::new()
    }
}

impl HotfixInstructions {
    pub fn new() -> Self {
        Self {
            version: INSTRUCTIONS_VERSION,
            directives: BTreeMap::new(),
        }
    }

    /// Load instructions from a file; a missing file means no directives
    pub fn load(path: &Path) -> Result<Self, ChannelAccessError> {
        match fs::read(path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Self::new()),
            Err(e) => Err(e.into()),
        }
    }

    /// Save instructions atomically
    pub fn save(&self, path: &Path) -> Result<(), ChannelAccessError> {
        fsutil::write_json_atomic(path, self)?;
        Ok(())
    }

    pub fn get(&self, filename: &str) -> Option<&Directive> {
        self.directives.get(filename)
    }

    pub fn len(&self) -> usize {
        self.directives.len()
    }

    pub fn is_empty(&self) -> bool {
        self.directives.is_empty()
    }

    /// Merge one directive, last writer wins
    ///
    /// A directive replaces the current one when its timestamp is not older.
    /// Returns whether anything changed.
    pub fn merge_directive(&mut self, filename: &str, incoming: Directive) -> bool {
        match self.directives.get(filename) {
            Some(current) if current.timestamp > incoming.timestamp || *current == incoming => false,
            _ => {
                self.directives.insert(filename.to_string(), incoming);
                true
            }
        }
    }

    /// Merge all directives of `other`; returns the number of changes
    pub fn merge(&mut self, other: &HotfixInstructions) -> usize {
        other
            .directives
            .iter()
            .filter(|(filename, directive)| self.merge_directive(filename, (*directive).clone()))
            .count()
    }

    /// Drop the directive for a file
    pub fn clear(&mut self, filename: &str) -> Option<Directive> {
        self.directives.remove(filename)
    }

    /// Check if a file is revoked or removed
    pub fn is_withdrawn(&self, filename: &str) -> bool {
        self.get(filename).is_some_and(Directive::withdraws)
    }

    /// Checksum named by the withdrawing directive of a file
    pub fn withdrawn_sha256(&self, filename: &str) -> Option<&str> {
        match self.get(filename).map(|d| &d.action) {
            Some(HotfixAction::Revoke { sha256 }) => sha256.as_deref(),
            _ => None,
        }
    }

    /// Files whose directive is `remove`
    pub fn removed(&self) -> impl Iterator<Item = &str> {
        self.directives
            .iter()
            .filter(|(_, d)| matches!(d.action, HotfixAction::Remove))
            .map(|(filename, _)| filename.as_str())
    }

    /// Record as published after hotfixes, or `None` when withdrawn
    pub fn apply(&self, record: &PackageRecord) -> Result<Option<PackageRecord>, serde_json::Error> {
        let Some(directive) = self.get(&record.filename) else {
            return Ok(Some(record.clone()));
        };

        match &directive.action {
            HotfixAction::Revoke { .. } | HotfixAction::Remove => Ok(None),
            HotfixAction::TrackFeature { feature } => {
                let mut patched = record.clone();
                if !patched.track_features.contains(feature) {
                    patched.track_features.push(feature.clone());
                }
                Ok(Some(patched))
            }
            HotfixAction::Override { fields } => {
                let mut value = serde_json::to_value(record)?;
                if let Value::Object(object) = &mut value {
                    for (key, field) in fields {
                        if !IDENTITY_FIELDS.contains(&key.as_str()) {
                            object.insert(key.clone(), field.clone());
                        }
                    }
                }
                serde_json::from_value(value).map(Some)
            }
        }
    }
}

/// Bundle the instructions of the given subdirs under `root`
///
/// Subdirs without an instructions file are skipped.
pub fn write_generator<'a, I>(root: &Path, subdirs: I) -> io::Result<PathBuf>
where
    I: IntoIterator<Item = &'a str>,
{
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);

    for subdir in subdirs {
        let path = root.join(subdir).join(INSTRUCTIONS_FILE);
        if path.is_file() {
            builder.append_path_with_name(&path, Path::new(subdir).join(INSTRUCTIONS_FILE))?;
        }
    }

    let bytes = builder.into_inner()?.finish()?;
    let target = root.join(GENERATOR_FILE);
    fsutil::write_atomic(&target, &bytes)?;
    Ok(target)
}
