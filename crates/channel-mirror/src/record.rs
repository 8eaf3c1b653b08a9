//! Package records
//!
//! A record describes one package file in one platform subdir of a channel.

use crate::matchspec::MatchSpec;
use crate::version::Version;
use serde::{Deserialize, Deserializer, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Identity of a package record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub name: String,
    pub version: String,
    pub build: String,
    pub subdir: String,
    pub filename: String,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subdir, self.filename)
    }
}

/// Package metadata as published in a channel
///
/// Records are equal when their identities are equal; the remaining fields
/// are attributes of that identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageRecord {
    /// Package name
    pub name: String,

    /// Package version
    pub version: Version,

    /// Build string
    #[serde(default)]
    pub build: String,

    #[serde(default)]
    pub build_number: u64,

    /// Platform subdir (e.g. `linux-64`, `noarch`)
    pub subdir: String,

    /// File name within the subdir
    #[serde(rename = "fn")]
    pub filename: String,

    /// Declared dependencies, in declaration order
    #[serde(default)]
    pub depends: Vec<MatchSpec>,

    /// File size in bytes
    #[serde(default)]
    pub size: u64,

    /// SHA-256 of the file (hex-encoded)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,

    #[serde(
        default,
        skip_serializing_if = "Vec::is_empty",
        deserialize_with = "deserialize_features"
    )]
    pub track_features: Vec<String>,

    /// Build timestamp (milliseconds since the Unix epoch)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,

    /// Channel the record was published in
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
}

impl PackageRecord {
    /// Create a record with no dependencies or checksums
    pub fn new(name: &str, version: Version, build: &str, subdir: &str) -> Self {
        let filename = if build.is_empty() {
            format!("{}-{}.tar.bz2", name, version)
        } else {
            format!("{}-{}-{}.tar.bz2", name, version, build)
        };

        Self {
            name: name.to_lowercase(),
            version,
            build: build.to_string(),
            build_number: 0,
            subdir: subdir.to_string(),
            filename,
            depends: Vec::new(),
            size: 0,
            sha256: None,
            track_features: Vec::new(),
            timestamp: None,
            license: None,
            channel: None,
        }
    }

    /// Add a dependency
    pub fn with_dependency(mut self, spec: MatchSpec) -> Self {
        self.depends.push(spec);
        self
    }

    /// Set size and checksum from file contents
    pub fn with_contents(mut self, contents: &[u8]) -> Self {
        use sha2::{Digest, Sha256};
        self.size = contents.len() as u64;
        self.sha256 = Some(hex::encode(Sha256::digest(contents)));
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Identity of this record
    pub fn key(&self) -> RecordKey {
        RecordKey {
            name: self.name.clone(),
            version: self.version.to_string(),
            build: self.build.clone(),
            subdir: self.subdir.clone(),
            filename: self.filename.clone(),
        }
    }

    /// Check if the content hash of two records agrees
    ///
    /// A missing hash on either side is treated as agreement.
    pub fn same_contents(&self, other: &PackageRecord) -> bool {
        match (&self.sha256, &other.sha256) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            _ => true,
        }
    }
}

impl PartialEq for PackageRecord {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.version == other.version
            && self.build == other.build
            && self.subdir == other.subdir
            && self.filename == other.filename
    }
}

impl Eq for PackageRecord {}

impl Hash for PackageRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.version.hash(state);
        self.build.hash(state);
        self.subdir.hash(state);
        self.filename.hash(state);
    }
}

impl PartialOrd for PackageRecord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PackageRecord {
    /// Name, then version ordering, then build, subdir and file name
    fn cmp(&self, other: &Self) -> Ordering {
        self.name
            .cmp(&other.name)
            .then_with(|| self.version.cmp(&other.version))
            .then_with(|| self.build.cmp(&other.build))
            .then_with(|| self.subdir.cmp(&other.subdir))
            .then_with(|| self.filename.cmp(&other.filename))
    }
}

impl fmt::Display for PackageRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subdir, self.filename)
    }
}

/// Accept both the list form and the space separated string form
fn deserialize_features<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Features {
        List(Vec<String>),
        Text(String),
    }

    Ok(match Option::<Features>::deserialize(deserializer)? {
        Some(Features::List(list)) => list,
        Some(Features::Text(text)) => text
            .split([' ', ','])
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    })
}
