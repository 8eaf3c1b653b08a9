//! Package version parsing and ordering
//!
//! Channel versions are not semver. A version string is split into an
//! optional epoch (`1!`), the version proper, and an optional local part
//! (`+local`). Each dotted component is further split into numeric and
//! alphabetic runs which compare as follows:
//!
//! - alphabetic runs sort before numbers (`1.0a < 1.0`)
//! - `dev` sorts before every other alphabetic run
//! - `post` sorts after every number
//! - missing components compare as `0` (`1.0 == 1.0.0`)

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during version parsing
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum VersionError {
    /// Empty version string
    #[error("Empty version string")]
    Empty,

    /// Invalid version format
    #[error("Invalid version format '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },
}

impl VersionError {
    fn invalid(version: &str, reason: impl Into<String>) -> Self {
        VersionError::InvalidVersion {
            version: version.to_string(),
            reason: reason.into(),
        }
    }
}

/// A run inside a version component
#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Text(String),
    Number(u64),
    Post,
}

impl PartialOrd for Part {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Part {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Part::Text(a), Part::Text(b)) => a.cmp(b),
            (Part::Text(_), _) => Ordering::Less,
            (_, Part::Text(_)) => Ordering::Greater,
            (Part::Number(a), Part::Number(b)) => a.cmp(b),
            (Part::Number(_), Part::Post) => Ordering::Less,
            (Part::Post, Part::Number(_)) => Ordering::Greater,
            (Part::Post, Part::Post) => Ordering::Equal,
        }
    }
}

type Component = Vec<Part>;

/// A parsed package version
///
/// Equality and hashing use the original string, so `1.0` and `1.0.0` are
/// distinct identities. Use [`Version::order_cmp`] to compare positions in
/// the version ordering, where those two are equal.
#[derive(Debug, Clone)]
pub struct Version {
    source: String,
    version: Vec<Component>,
    local: Vec<Component>,
}

impl Version {
    /// Parse a version string
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let source = s.trim();
        if source.is_empty() {
            return Err(VersionError::Empty);
        }

        let lowered = source.to_lowercase();
        if let Some(c) = lowered
            .chars()
            .find(|&c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '+' | '!' | '_' | '-')))
        {
            return Err(VersionError::invalid(
                source,
                format!("invalid character '{}'", c),
            ));
        }

        // Split off the epoch
        let (epoch, rest) = match lowered.split_once('!') {
            Some((epoch, rest)) => {
                if rest.contains('!') {
                    return Err(VersionError::invalid(source, "duplicate epoch separator '!'"));
                }
                if epoch.is_empty() || !epoch.chars().all(|c| c.is_ascii_digit()) {
                    return Err(VersionError::invalid(source, "epoch must be an integer"));
                }
                (epoch.to_string(), rest.to_string())
            }
            None => ("0".to_string(), lowered),
        };

        // Split off the local version
        let (main, local) = match rest.split_once('+') {
            Some((main, local)) => {
                if local.contains('+') {
                    return Err(VersionError::invalid(
                        source,
                        "duplicate local version separator '+'",
                    ));
                }
                (main.to_string(), Some(local.to_string()))
            }
            None => (rest, None),
        };

        let mut version = vec![parse_component(source, &epoch)?];
        version.extend(parse_section(source, &main)?);

        let local = match local {
            Some(local) => parse_section(source, &local)?,
            None => Vec::new(),
        };

        Ok(Version {
            source: source.to_string(),
            version,
            local,
        })
    }

    /// The version string as it was parsed
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Compare positions in the version ordering, ignoring spelling
    pub fn order_cmp(&self, other: &Version) -> Ordering {
        match cmp_sections(&self.version, &other.version) {
            Ordering::Equal => cmp_sections(&self.local, &other.local),
            ord => ord,
        }
    }

    /// Check if two versions share a position in the version ordering
    pub fn order_eq(&self, other: &Version) -> bool {
        self.order_cmp(other) == Ordering::Equal
    }

    /// Check if this version lies under `prefix` (`3.9.1` starts with `3.9`)
    ///
    /// All components of the prefix but the last must be equal. The last one
    /// must match exactly, except that a trailing alphabetic run only needs to
    /// be a string prefix.
    pub fn starts_with(&self, prefix: &Version) -> bool {
        let (ours, theirs) = if prefix.local.is_empty() {
            (&self.version, &prefix.version)
        } else {
            if cmp_sections(&self.version, &prefix.version) != Ordering::Equal {
                return false;
            }
            (&self.local, &prefix.local)
        };

        let Some((last, init)) = theirs.split_last() else {
            return true;
        };

        for (i, component) in init.iter().enumerate() {
            let own = ours.get(i).map(Vec::as_slice).unwrap_or(&[]);
            if cmp_component(own, component) != Ordering::Equal {
                return false;
            }
        }

        let own = ours.get(init.len()).map(Vec::as_slice).unwrap_or(&[]);
        let Some((last_part, init_parts)) = last.split_last() else {
            return true;
        };

        let fill = Part::Number(0);
        for (j, part) in init_parts.iter().enumerate() {
            if own.get(j).unwrap_or(&fill) != part {
                return false;
            }
        }

        match (own.get(init_parts.len()), last_part) {
            (Some(Part::Text(a)), Part::Text(b)) => a.starts_with(b.as_str()),
            (Some(part), _) => part == last_part,
            (None, _) => &fill == last_part,
        }
    }
}

fn parse_section(source: &str, section: &str) -> Result<Vec<Component>, VersionError> {
    section
        .split(['.', '_', '-'])
        .map(|component| parse_component(source, component))
        .collect()
}

fn parse_component(source: &str, component: &str) -> Result<Component, VersionError> {
    if component.is_empty() {
        return Err(VersionError::invalid(source, "empty version component"));
    }

    let mut parts = Vec::new();
    let mut chars = component.char_indices().peekable();
    while let Some((start, c)) = chars.next() {
        let numeric = c.is_ascii_digit();
        let mut end = start + c.len_utf8();
        while let Some(&(i, next)) = chars.peek() {
            if next.is_ascii_digit() != numeric {
                break;
            }
            end = i + next.len_utf8();
            chars.next();
        }

        let run = &component[start..end];
        let part = if numeric {
            run.parse()
                .map(Part::Number)
                .map_err(|_| VersionError::invalid(source, format!("number too large: {}", run)))?
        } else {
            match run {
                "post" => Part::Post,
                // Upper case sorts before every other (lower case) run
                "dev" => Part::Text("DEV".to_string()),
                other => Part::Text(other.to_string()),
            }
        };
        parts.push(part);
    }

    // Keep numbers and strings in phase
    if !matches!(parts.first(), Some(Part::Number(_))) {
        parts.insert(0, Part::Number(0));
    }

    Ok(parts)
}

fn cmp_component(a: &[Part], b: &[Part]) -> Ordering {
    let fill = Part::Number(0);
    for j in 0..a.len().max(b.len()) {
        let left = a.get(j).unwrap_or(&fill);
        let right = b.get(j).unwrap_or(&fill);
        match left.cmp(right) {
            Ordering::Equal => continue,
            ord => return ord,
        }
    }
    Ordering::Equal
}

fn cmp_sections(a: &[Component], b: &[Component]) -> Ordering {
    for i in 0..a.len().max(b.len()) {
        let left = a.get(i).map(Vec::as_slice).unwrap_or(&[]);
        let right = b.get(i).map(Vec::as_slice).unwrap_or(&[]);
        match cmp_component(left, right) {
            Ordering::Equal => continue,
            ord => return ord,
        }
    }
    Ordering::Equal
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for Version {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Version::parse(s)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source
    }
}

impl Eq for Version {}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.source.hash(state);
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        // Fall back to the spelling so that Ord agrees with Eq
        self.order_cmp(other)
            .then_with(|| self.source.cmp(&other.source))
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.source)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Version::parse(&s).map_err(serde::de::Error::custom)
    }
}
