//! Reference indexer writing `repodata.json`

use super::{Indexer, LocalChannel, RECORDS_FILE};
use crate::error::{ChannelAccessError, IndexError};
use crate::fsutil;
use crate::record::PackageRecord;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::Path;
use tracing::{debug, info};

/// File name of the per-subdir index
pub const REPODATA_FILE: &str = "repodata.json";

const REPODATA_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepodataInfo {
    pub subdir: String,
}

/// Installable index of one subdir
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Repodata {
    pub info: RepodataInfo,

    #[serde(default)]
    pub packages: BTreeMap<String, PackageRecord>,

    /// File names withdrawn by hotfixes
    #[serde(default)]
    pub removed: Vec<String>,

    #[serde(default)]
    pub repodata_version: u32,
}

impl Repodata {
    pub fn load(path: &Path) -> Result<Self, ChannelAccessError> {
        Ok(serde_json::from_slice(&fs::read(path)?)?)
    }
}

/// Writes `repodata.json` for every subdir of a [`LocalChannel`]
///
/// Published records have hotfixes applied. Files with a `remove` directive
/// are deleted together with their manifest entry unless purging is off.
#[derive(Debug, Clone)]
pub struct RepodataIndexer {
    purge: bool,
}

impl Default for RepodataIndexer {
    fn default() -> Self {
        Self::new()
    }
}

impl RepodataIndexer {
    pub fn new() -> Self {
        Self { purge: true }
    }

    /// Keep files of removed packages on disk
    pub fn without_purge(mut self) -> Self {
        self.purge = false;
        self
    }

    fn index_subdir(&self, channel: &LocalChannel, subdir: &str) -> Result<usize, IndexError> {
        let hotfixes = channel.hotfixes(subdir)?;
        let mut manifest = (*channel.manifest(subdir)?).clone();
        let dir = channel.subdir_path(subdir);

        if self.purge {
            let mut purged = 0;
            for filename in hotfixes.removed() {
                if manifest.remove(filename).is_none() {
                    continue;
                }
                match fs::remove_file(dir.join(filename)) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
                    _ => {}
                }
                purged += 1;
            }

            if purged > 0 {
                manifest.save(&dir.join(RECORDS_FILE))?;
                channel.invalidate();
                info!(subdir, purged, "Purged removed packages");
            }
        }

        let mut packages = BTreeMap::new();
        for (filename, record) in &manifest.packages {
            if let Some(published) = hotfixes.apply(record)? {
                packages.insert(filename.clone(), published);
            }
        }

        let removed = hotfixes
            .directives
            .iter()
            .filter(|(_, directive)| directive.withdraws())
            .map(|(filename, _)| filename.clone())
            .collect();

        let repodata = Repodata {
            info: RepodataInfo {
                subdir: subdir.to_string(),
            },
            packages,
            removed,
            repodata_version: REPODATA_VERSION,
        };
        fsutil::write_json_atomic(&dir.join(REPODATA_FILE), &repodata)?;

        debug!(subdir, packages = repodata.packages.len(), "Wrote repodata");
        Ok(repodata.packages.len())
    }
}

impl Indexer for RepodataIndexer {
    fn reindex(&self, channel_root: &Path) -> Result<(), IndexError> {
        let channel = LocalChannel::open(channel_root)?;
        let mut total = 0;
        for subdir in channel.subdirs()? {
            total += self.index_subdir(&channel, &subdir)?;
        }

        info!(channel = %channel_root.display(), packages = total, "Indexed channel");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hotfix::{Directive, HotfixAction};
    use crate::version::Version;
    use tempfile::TempDir;

    fn record(name: &str, version: &str) -> PackageRecord {
        PackageRecord::new(name, Version::parse(version).unwrap(), "0", "noarch")
    }

    #[test]
    fn test_index_applies_hotfixes() {
        let dir = TempDir::new().unwrap();
        let channel = LocalChannel::create(dir.path()).unwrap();
        let a = channel.publish(record("a", "1.0"), b"a").unwrap();
        let b = channel.publish(record("b", "1.0"), b"b").unwrap();
        let c = channel.publish(record("c", "1.0"), b"c").unwrap();
        channel
            .add_directive("noarch", &a.filename, Directive::revoke(None, 1))
            .unwrap();
        channel
            .add_directive("noarch", &b.filename, Directive::new(HotfixAction::Remove, 1))
            .unwrap();

        RepodataIndexer::new().reindex(dir.path()).unwrap();

        let repodata = Repodata::load(&dir.path().join("noarch").join(REPODATA_FILE)).unwrap();
        assert_eq!(repodata.info.subdir, "noarch");
        assert_eq!(repodata.packages.len(), 1);
        assert!(repodata.packages.contains_key(&c.filename));
        assert_eq!(repodata.removed, vec![a.filename.clone(), b.filename.clone()]);

        // Revoked files stay, removed files are purged
        assert!(channel.package_path(&a).is_file());
        assert!(!channel.package_path(&b).exists());
        let reopened = LocalChannel::open(dir.path()).unwrap();
        assert_eq!(reopened.manifest("noarch").unwrap().len(), 2);
    }

    #[test]
    fn test_index_without_purge() {
        let dir = TempDir::new().unwrap();
        let channel = LocalChannel::create(dir.path()).unwrap();
        let b = channel.publish(record("b", "1.0"), b"b").unwrap();
        channel
            .add_directive("noarch", &b.filename, Directive::new(HotfixAction::Remove, 1))
            .unwrap();

        RepodataIndexer::new()
            .without_purge()
            .reindex(dir.path())
            .unwrap();
        assert!(channel.package_path(&b).is_file());
    }

    #[test]
    fn test_index_missing_channel() {
        let dir = TempDir::new().unwrap();
        let result = RepodataIndexer::new().reindex(&dir.path().join("missing"));
        assert!(matches!(result, Err(IndexError::Channel(_))));
    }
}
