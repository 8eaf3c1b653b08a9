//! Match specifications
//!
//! A match specification selects package records by name, version, build
//! string and, optionally, channel and subdir:
//!
//! ```text
//! [channel[/subdir]::]name[ ][version-constraint][ build]
//! name=version=build
//! ```
//!
//! Version constraints are `|`-separated alternatives of `,`-separated
//! comparators (`,` binds tighter). Supported comparators are `>=`, `<=`,
//! `>`, `<`, `==`, `!=`, `~=`, `=X` (everything under `X`), `X*`/`X.*`
//! (likewise), other `*` globs, a bare version (exact) and `*` (any).
//!
//! A specification without a version constraint matches every version of
//! its name.

use crate::record::PackageRecord;
use crate::subdir;
use crate::version::{Version, VersionError};
use glob::Pattern;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use thiserror::Error;

/// Errors that can occur during match specification parsing
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SpecError {
    /// Empty specification string
    #[error("Empty match specification")]
    Empty,

    /// Specification does not follow the grammar
    #[error("Malformed match specification '{spec}': {reason}")]
    Malformed { spec: String, reason: String },

    /// Version inside the specification could not be parsed
    #[error("Invalid version in match specification '{spec}': {source}")]
    InvalidVersion {
        spec: String,
        #[source]
        source: VersionError,
    },
}

fn malformed(spec: &str, reason: impl Into<String>) -> SpecError {
    SpecError::Malformed {
        spec: spec.to_string(),
        reason: reason.into(),
    }
}

fn parse_version(spec: &str, text: &str) -> Result<Version, SpecError> {
    Version::parse(text).map_err(|source| SpecError::InvalidVersion {
        spec: spec.to_string(),
        source,
    })
}

const OPERATORS: [&str; 8] = [">=", "<=", "==", "!=", "~=", ">", "<", "="];

/// A single version comparator
#[derive(Debug, Clone)]
enum Comparator {
    Any,
    Exact(Version),
    NotEqual(Version),
    Greater(Version),
    GreaterOrEqual(Version),
    Less(Version),
    LessOrEqual(Version),
    /// `~=1.4.5` := `>=1.4.5` and under `1.4`
    Compatible { base: Version, prefix: Version },
    StartsWith(Version),
    NotStartsWith(Version),
    Glob(Pattern),
}

impl Comparator {
    fn parse(spec: &str, item: &str) -> Result<Self, SpecError> {
        if item.is_empty() {
            return Err(malformed(spec, "empty version constraint"));
        }
        if item == "*" {
            return Ok(Comparator::Any);
        }

        for op in OPERATORS {
            let Some(rest) = item.strip_prefix(op) else {
                continue;
            };

            let (base, wildcard) = strip_wildcard(rest.trim());
            if base.is_empty() {
                return Err(malformed(spec, format!("missing version after '{}'", op)));
            }
            if base.contains('*') {
                return Err(malformed(
                    spec,
                    format!("cannot use wildcard '*' with operator '{}'", op),
                ));
            }

            let version = parse_version(spec, base)?;
            return Ok(match op {
                ">=" => Comparator::GreaterOrEqual(version),
                "<=" => Comparator::LessOrEqual(version),
                ">" => Comparator::Greater(version),
                "<" => Comparator::Less(version),
                "==" if wildcard => Comparator::StartsWith(version),
                "==" => Comparator::Exact(version),
                "!=" if wildcard => Comparator::NotStartsWith(version),
                "!=" => Comparator::NotEqual(version),
                "~=" => {
                    let (head, _) = base.rsplit_once('.').ok_or_else(|| {
                        malformed(spec, "compatible release needs at least two components")
                    })?;
                    Comparator::Compatible {
                        prefix: parse_version(spec, head)?,
                        base: version,
                    }
                }
                _ => Comparator::StartsWith(version),
            });
        }

        if item.contains('*') {
            let (base, wildcard) = strip_wildcard(item);
            if wildcard && !base.is_empty() && !base.contains('*') {
                return Ok(Comparator::StartsWith(parse_version(spec, base)?));
            }
            if !item
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '*' | '+' | '!' | '_' | '-'))
            {
                return Err(malformed(spec, format!("invalid version pattern '{}'", item)));
            }
            let pattern = Pattern::new(&item.to_lowercase())
                .map_err(|e| malformed(spec, format!("invalid version pattern: {}", e)))?;
            return Ok(Comparator::Glob(pattern));
        }

        Ok(Comparator::Exact(parse_version(spec, item)?))
    }

    fn matches(&self, version: &Version) -> bool {
        match self {
            Comparator::Any => true,
            Comparator::Exact(v) => version.order_eq(v),
            Comparator::NotEqual(v) => !version.order_eq(v),
            Comparator::Greater(v) => version.order_cmp(v) == Ordering::Greater,
            Comparator::GreaterOrEqual(v) => version.order_cmp(v) != Ordering::Less,
            Comparator::Less(v) => version.order_cmp(v) == Ordering::Less,
            Comparator::LessOrEqual(v) => version.order_cmp(v) != Ordering::Greater,
            Comparator::Compatible { base, prefix } => {
                version.order_cmp(base) != Ordering::Less && version.starts_with(prefix)
            }
            Comparator::StartsWith(v) => version.starts_with(v),
            Comparator::NotStartsWith(v) => !version.starts_with(v),
            Comparator::Glob(pattern) => pattern.matches(&version.as_str().to_lowercase()),
        }
    }
}

fn strip_wildcard(s: &str) -> (&str, bool) {
    if let Some(base) = s.strip_suffix(".*") {
        (base, true)
    } else if let Some(base) = s.strip_suffix('*') {
        (base, true)
    } else {
        (s, false)
    }
}

/// Alternatives of comparator conjunctions
#[derive(Debug, Clone)]
struct VersionConstraint {
    groups: Vec<Vec<Comparator>>,
}

impl VersionConstraint {
    fn parse(spec: &str, text: &str) -> Result<Self, SpecError> {
        let mut groups = Vec::new();
        for group in text.split('|') {
            let comparators = group
                .split(',')
                .map(|item| Comparator::parse(spec, item.trim()))
                .collect::<Result<Vec<_>, _>>()?;
            groups.push(comparators);
        }
        Ok(Self { groups })
    }

    fn matches(&self, version: &Version) -> bool {
        self.groups
            .iter()
            .any(|group| group.iter().all(|c| c.matches(version)))
    }
}

#[derive(Debug, Clone)]
enum TextMatcher {
    Exact(String),
    Glob(Pattern),
}

impl TextMatcher {
    fn parse(spec: &str, text: &str, what: &str) -> Result<Self, SpecError> {
        if text.contains('*') {
            Pattern::new(text)
                .map(TextMatcher::Glob)
                .map_err(|e| malformed(spec, format!("invalid {} pattern: {}", what, e)))
        } else {
            Ok(TextMatcher::Exact(text.to_string()))
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self {
            TextMatcher::Exact(s) => s == value,
            TextMatcher::Glob(pattern) => pattern.matches(value),
        }
    }
}

/// A parsed match specification
///
/// Equality, hashing and ordering use the normalized string form.
#[derive(Debug, Clone)]
pub struct MatchSpec {
    name: TextMatcher,
    version: Option<VersionConstraint>,
    build: Option<TextMatcher>,
    channel: Option<String>,
    subdir: Option<String>,
    normalized: String,
    name_text: String,
}

impl MatchSpec {
    /// Parse a match specification string
    pub fn parse(s: &str) -> Result<Self, SpecError> {
        let spec = s.trim();
        if spec.is_empty() {
            return Err(SpecError::Empty);
        }
        if spec.contains('[') {
            return Err(malformed(spec, "bracket syntax is not supported"));
        }

        let (channel, subdir, body) = match spec.split_once("::") {
            Some((prefix, body)) => {
                let (channel, subdir) = split_channel(prefix.trim());
                (channel, subdir, body.trim())
            }
            None => (None, None, spec),
        };

        let name_end = body
            .find(|c: char| c.is_whitespace() || "<>=!~".contains(c))
            .unwrap_or(body.len());
        let name_text = body[..name_end].to_lowercase();
        if name_text.is_empty() {
            return Err(malformed(spec, "missing package name"));
        }
        if !name_text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '*'))
        {
            return Err(malformed(spec, format!("invalid package name '{}'", name_text)));
        }

        let (version_text, build_text) = split_version_build(spec, body[name_end..].trim())?;

        if let Some(build) = build_text {
            if !build
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '*' | '+' | '!' | '-'))
            {
                return Err(malformed(spec, format!("invalid build string '{}'", build)));
            }
        }

        let version = match version_text {
            Some(text) if text != "*" => Some(VersionConstraint::parse(spec, text)?),
            _ => None,
        };
        let build = build_text
            .map(|b| TextMatcher::parse(spec, b, "build"))
            .transpose()?;

        let mut normalized = String::new();
        if channel.is_some() || subdir.is_some() {
            normalized.push_str(channel.as_deref().unwrap_or("*"));
            if let Some(subdir) = &subdir {
                normalized.push('/');
                normalized.push_str(subdir);
            }
            normalized.push_str("::");
        }
        normalized.push_str(&name_text);
        match (version_text, build_text) {
            (Some(v), Some(b)) => {
                normalized.push(' ');
                normalized.push_str(v);
                normalized.push(' ');
                normalized.push_str(b);
            }
            (None, Some(b)) => {
                normalized.push_str(" * ");
                normalized.push_str(b);
            }
            (Some(v), None) if v != "*" => {
                normalized.push(' ');
                normalized.push_str(v);
            }
            _ => {}
        }

        Ok(Self {
            name: TextMatcher::parse(spec, &name_text, "name")?,
            version,
            build,
            channel,
            subdir,
            normalized,
            name_text,
        })
    }

    /// Package name (or name pattern) of this specification
    pub fn name(&self) -> &str {
        &self.name_text
    }

    /// Package name if it is not a wildcard
    pub fn exact_name(&self) -> Option<&str> {
        match &self.name {
            TextMatcher::Exact(name) => Some(name),
            TextMatcher::Glob(_) => None,
        }
    }

    /// Check if the specification constrains versions at all
    pub fn has_version_constraint(&self) -> bool {
        self.version.is_some()
    }

    /// Subdir constraint, if any
    pub fn subdir(&self) -> Option<&str> {
        self.subdir.as_deref()
    }

    /// Check if a record satisfies this specification
    pub fn matches(&self, record: &PackageRecord) -> bool {
        self.name.matches(&record.name.to_lowercase())
            && self.subdir.as_ref().map_or(true, |s| *s == record.subdir)
            && self
                .channel
                .as_ref()
                .map_or(true, |c| channel_matches(c, record.channel.as_deref()))
            && self
                .version
                .as_ref()
                .map_or(true, |v| v.matches(&record.version))
            && self.build.as_ref().map_or(true, |b| b.matches(&record.build))
    }
}

fn split_channel(prefix: &str) -> (Option<String>, Option<String>) {
    let (channel, subdir) = match prefix.rsplit_once('/') {
        Some((channel, candidate)) if subdir::is_known(candidate) => {
            (channel, Some(candidate.to_string()))
        }
        _ => (prefix, None),
    };
    let channel = match channel {
        "" | "*" => None,
        other => Some(other.trim_end_matches('/').to_string()),
    };
    (channel, subdir)
}

fn channel_matches(wanted: &str, actual: Option<&str>) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    let actual = actual.trim_end_matches('/');
    actual == wanted || actual.ends_with(&format!("/{}", wanted))
}

/// Split the part after the name into version and build text
fn split_version_build<'a>(
    spec: &str,
    rest: &'a str,
) -> Result<(Option<&'a str>, Option<&'a str>), SpecError> {
    if rest.is_empty() {
        return Ok((None, None));
    }

    // name=version=build
    if rest.starts_with('=') && !rest.starts_with("==") && !rest.contains(char::is_whitespace) {
        if let Some((version, build)) = rest[1..].split_once('=') {
            if version.is_empty() || build.is_empty() || build.contains('=') {
                return Err(malformed(spec, "expected name=version=build"));
            }
            if version.contains(|c: char| "<>!~,|".contains(c)) {
                return Err(malformed(spec, "operators are not allowed in name=version=build"));
            }
            return Ok((Some(version), Some(build)));
        }
    }

    let fields: Vec<&str> = rest.split_whitespace().collect();
    match fields.as_slice() {
        [version] => Ok((Some(version), None)),
        [version, build] => Ok((Some(version), Some(build))),
        _ => Err(malformed(spec, "expected at most a version and a build string")),
    }
}

impl fmt::Display for MatchSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.normalized)
    }
}

impl FromStr for MatchSpec {
    type Err = SpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MatchSpec::parse(s)
    }
}

impl PartialEq for MatchSpec {
    fn eq(&self, other: &Self) -> bool {
        self.normalized == other.normalized
    }
}

impl Eq for MatchSpec {}

impl Hash for MatchSpec {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.normalized.hash(state);
    }
}

impl PartialOrd for MatchSpec {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for MatchSpec {
    fn cmp(&self, other: &Self) -> Ordering {
        self.normalized.cmp(&other.normalized)
    }
}

impl Serialize for MatchSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.normalized)
    }
}

impl<'de> Deserialize<'de> for MatchSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        MatchSpec::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(s: &str) -> MatchSpec {
        MatchSpec::parse(s).unwrap()
    }

    fn record(name: &str, version: &str, build: &str) -> PackageRecord {
        PackageRecord::new(name, Version::parse(version).unwrap(), build, "linux-64")
    }

    #[test]
    fn test_unconstrained_matches_every_version() {
        let pip = spec("pip");
        assert!(!pip.has_version_constraint());
        assert!(pip.matches(&record("pip", "0.1", "")));
        assert!(pip.matches(&record("pip", "23.3.1", "py_0")));
        assert!(!pip.matches(&record("pipx", "1.0", "")));
    }

    #[test]
    fn test_attached_and_spaced_constraints() {
        let attached = spec("python>=3.9,<3.10");
        let spaced = spec("python >=3.9,<3.10");
        assert_eq!(attached, spaced);
        assert_eq!(attached.to_string(), "python >=3.9,<3.10");

        assert!(attached.matches(&record("python", "3.9.0", "")));
        assert!(attached.matches(&record("python", "3.9.18", "")));
        assert!(!attached.matches(&record("python", "3.10.0", "")));
        assert!(!attached.matches(&record("python", "3.8.19", "")));
    }

    #[test]
    fn test_or_groups() {
        let s = spec("libgcc-ng 11.1|11.2");
        assert!(s.matches(&record("libgcc-ng", "11.1", "")));
        assert!(s.matches(&record("libgcc-ng", "11.2", "")));
        assert!(s.matches(&record("libgcc-ng", "11.2.0", "")));
        assert!(!s.matches(&record("libgcc-ng", "12.1", "")));
    }

    #[test]
    fn test_exact_and_fuzzy() {
        let exact = spec("a 3.0");
        assert!(exact.matches(&record("a", "3.0", "")));
        assert!(exact.matches(&record("a", "3.0.0", "")));
        assert!(!exact.matches(&record("a", "3.0.1", "")));

        let fuzzy = spec("a =3.0");
        assert!(fuzzy.matches(&record("a", "3.0.1", "")));
        assert!(!fuzzy.matches(&record("a", "3.1", "")));

        let star = spec("a 1.8*");
        assert!(star.matches(&record("a", "1.8.4", "")));
        assert!(!star.matches(&record("a", "1.9", "")));

        let glob = spec("a 1.*.3");
        assert!(glob.matches(&record("a", "1.2.3", "")));
        assert!(!glob.matches(&record("a", "1.2.4", "")));
    }

    #[test]
    fn test_relational_operators() {
        assert!(spec("setuptools<=60.0").matches(&record("setuptools", "60.0", "")));
        assert!(!spec("setuptools<=60.0").matches(&record("setuptools", "60.0.1", "")));
        assert!(spec("a >1.0").matches(&record("a", "1.0.1", "")));
        assert!(!spec("a >1.0").matches(&record("a", "1.0.0", "")));
        assert!(spec("a !=1.0").matches(&record("a", "1.1", "")));
        assert!(!spec("a !=1.0").matches(&record("a", "1.0", "")));
        assert!(spec("a ==1.2.*").matches(&record("a", "1.2.7", "")));
        assert!(!spec("a !=1.2.*").matches(&record("a", "1.2.7", "")));
    }

    #[test]
    fn test_compatible_release() {
        let s = spec("a ~=1.4.5");
        assert!(s.matches(&record("a", "1.4.5", "")));
        assert!(s.matches(&record("a", "1.4.9", "")));
        assert!(!s.matches(&record("a", "1.5.0", "")));
        assert!(!s.matches(&record("a", "1.4.4", "")));
        assert!(MatchSpec::parse("a ~=1").is_err());
    }

    #[test]
    fn test_build_constraints() {
        let s = spec("a 3.0 b001_0");
        assert!(s.matches(&record("a", "3.0", "b001_0")));
        assert!(!s.matches(&record("a", "3.0", "")));

        let glob = spec("python >=3.8 *_cpython");
        assert!(glob.matches(&record("python", "3.11.4", "h2755cc3_0_cpython")));
        assert!(!glob.matches(&record("python", "3.11.4", "h2755cc3_0_pypy")));

        let any = spec("python * *_cpython");
        assert_eq!(any.to_string(), "python * *_cpython");
        assert!(!any.has_version_constraint());
    }

    #[test]
    fn test_equals_separated_form() {
        let s = spec("numpy=1.11=py36_0");
        assert_eq!(s.to_string(), "numpy 1.11 py36_0");
        assert!(s.matches(&record("numpy", "1.11", "py36_0")));
        assert!(!s.matches(&record("numpy", "1.11.1", "py36_0")));
    }

    #[test]
    fn test_name_handling() {
        assert!(spec("PyYAML").matches(&record("pyyaml", "6.0", "")));
        assert!(!spec("typing-extensions").matches(&record("typing_extensions", "4.0", "")));
        let wildcard = spec("py*");
        assert_eq!(wildcard.exact_name(), None);
        assert!(wildcard.matches(&record("python", "3.9", "")));
        assert!(!wildcard.matches(&record("pip", "1.0", "")));
    }

    #[test]
    fn test_channel_and_subdir() {
        let s = spec("conda-forge/noarch::pip");
        assert_eq!(s.subdir(), Some("noarch"));
        assert_eq!(s.to_string(), "conda-forge/noarch::pip");

        let mut r = PackageRecord::new("pip", Version::parse("23.1").unwrap(), "", "noarch");
        assert!(!s.matches(&r));
        r.channel = Some("https://conda.anaconda.org/conda-forge".to_string());
        assert!(s.matches(&r));

        r.subdir = "linux-64".to_string();
        assert!(!s.matches(&r));

        let any_channel = spec("*/linux-64::pip");
        assert!(any_channel.matches(&r));
    }

    #[test]
    fn test_malformed_specs() {
        assert_eq!(MatchSpec::parse("  "), Err(SpecError::Empty));
        assert!(matches!(MatchSpec::parse(">=1.0"), Err(SpecError::Malformed { .. })));
        assert!(matches!(MatchSpec::parse("a >=1.*.2"), Err(SpecError::Malformed { .. })));
        assert!(matches!(MatchSpec::parse("a 1.0 b c"), Err(SpecError::Malformed { .. })));
        assert!(matches!(MatchSpec::parse("a[version=1]"), Err(SpecError::Malformed { .. })));
        assert!(matches!(MatchSpec::parse("a >="), Err(SpecError::Malformed { .. })));
        assert!(matches!(MatchSpec::parse("a 1.0,"), Err(SpecError::Malformed { .. })));
        assert!(matches!(
            MatchSpec::parse("a >=1..0"),
            Err(SpecError::InvalidVersion { .. })
        ));
    }

    #[test]
    fn test_equality_by_normalized_form() {
        assert_eq!(spec("  pip  "), spec("pip"));
        assert_eq!(spec("Pip >=1"), spec("pip>=1"));
        assert_ne!(spec("pip >=1"), spec("pip >=1.0"));
    }
}
