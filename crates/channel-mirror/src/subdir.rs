//! Platform subdirs

use std::collections::BTreeSet;

/// Subdir holding platform independent packages
pub const NOARCH: &str = "noarch";

/// Subdirs a channel may carry
pub const KNOWN_SUBDIRS: &[&str] = &[
    "noarch",
    "emscripten-wasm32",
    "freebsd-64",
    "linux-32",
    "linux-64",
    "linux-aarch64",
    "linux-armv6l",
    "linux-armv7l",
    "linux-ppc64",
    "linux-ppc64le",
    "linux-riscv64",
    "linux-s390x",
    "osx-64",
    "osx-arm64",
    "wasi-wasm32",
    "win-32",
    "win-64",
    "win-arm64",
    "zos-z",
];

/// Check if a subdir name is known
pub fn is_known(subdir: &str) -> bool {
    KNOWN_SUBDIRS.contains(&subdir)
}

/// Subdir of the running platform, if it has one
pub fn platform_subdir() -> Option<&'static str> {
    match (std::env::consts::OS, std::env::consts::ARCH) {
        ("linux", "x86_64") => Some("linux-64"),
        ("linux", "x86") => Some("linux-32"),
        ("linux", "aarch64") => Some("linux-aarch64"),
        ("linux", "powerpc64") => Some("linux-ppc64le"),
        ("linux", "s390x") => Some("linux-s390x"),
        ("linux", "riscv64") => Some("linux-riscv64"),
        ("macos", "x86_64") => Some("osx-64"),
        ("macos", "aarch64") => Some("osx-arm64"),
        ("windows", "x86_64") => Some("win-64"),
        ("windows", "x86") => Some("win-32"),
        ("windows", "aarch64") => Some("win-arm64"),
        ("freebsd", "x86_64") => Some("freebsd-64"),
        _ => None,
    }
}

/// The platform subdir plus `noarch`
pub fn default_subdirs() -> BTreeSet<String> {
    let mut subdirs = BTreeSet::new();
    subdirs.insert(NOARCH.to_string());
    if let Some(platform) = platform_subdir() {
        subdirs.insert(platform.to_string());
    }
    subdirs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_subdirs_include_noarch() {
        let subdirs = default_subdirs();
        assert!(subdirs.contains(NOARCH));
        assert!(subdirs.iter().all(|s| is_known(s)));
    }

    #[test]
    fn test_unknown_subdir() {
        assert!(is_known("linux-64"));
        assert!(!is_known("conda-forge"));
    }
}
