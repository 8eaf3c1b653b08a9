//! Diff summaries

use crate::diff::Diff;
use crate::record::PackageRecord;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Count and total size of the records of one package name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NameTotals {
    pub count: usize,
    pub size: u64,
}

/// One side of a diff grouped by package name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Section {
    pub packages: BTreeMap<String, NameTotals>,

    /// `subdir/filename` of every record
    pub files: Vec<String>,
}

impl Section {
    fn from_records(records: &[Arc<PackageRecord>]) -> Self {
        let mut section = Section::default();
        for record in records {
            let totals = section.packages.entry(record.name.clone()).or_default();
            totals.count += 1;
            totals.size += record.size;
            section.files.push(record.to_string());
        }
        section
    }

    pub fn count(&self) -> usize {
        self.files.len()
    }

    pub fn size(&self) -> u64 {
        self.packages.values().map(|t| t.size).sum()
    }
}

/// Additions and removals of a diff grouped by package name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Summary {
    pub additions: Section,
    pub removals: Section,
}

impl Summary {
    pub fn from_diff(diff: &Diff) -> Self {
        Self {
            additions: Section::from_records(&diff.additions),
            removals: Section::from_records(&diff.removals),
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (label, section) in [("Additions", &self.additions), ("Removals", &self.removals)] {
            writeln!(
                f,
                "{}: {} packages, {} bytes",
                label,
                section.count(),
                section.size()
            )?;
            for (name, totals) in &section.packages {
                writeln!(f, "  {:<30} {:>5} {:>14}", name, totals.count, totals.size)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::Version;

    fn record(name: &str, version: &str, contents: &[u8]) -> Arc<PackageRecord> {
        Arc::new(
            PackageRecord::new(name, Version::parse(version).unwrap(), "0", "noarch")
                .with_contents(contents),
        )
    }

    #[test]
    fn test_grouped_by_name() {
        let diff = Diff {
            additions: vec![
                record("pip", "21.0", b"12"),
                record("pip", "23.1", b"123"),
                record("python", "3.9.1", b"1"),
            ],
            removals: vec![record("pip", "20.0", b"1")],
        };

        let summary = Summary::from_diff(&diff);
        assert_eq!(summary.additions.count(), 3);
        assert_eq!(summary.additions.size(), 6);
        assert_eq!(
            summary.additions.packages["pip"],
            NameTotals { count: 2, size: 5 }
        );
        assert_eq!(summary.removals.files, vec!["noarch/pip-20.0-0.tar.bz2"]);

        let text = summary.to_string();
        assert!(text.starts_with("Additions: 3 packages, 6 bytes\n"));
        assert!(text.contains("Removals: 1 packages, 1 bytes\n"));
    }
}
