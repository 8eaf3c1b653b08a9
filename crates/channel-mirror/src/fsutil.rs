//! File system helpers

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read, Write};
use std::path::Path;

/// Write a file through a temporary sibling and rename it into place
///
/// Replacing by rename also detaches a hard-linked destination instead of
/// writing through the link.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = parent.join(format!(".{}.tmp", file_name));

    let mut tmp_file = fs::File::create(&tmp_path)?;
    tmp_file.write_all(contents)?;
    tmp_file.sync_all()?;

    fs::rename(&tmp_path, path)
}

/// Serialize a value as pretty JSON and write it atomically
pub(crate) fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> io::Result<()> {
    let mut json = serde_json::to_vec_pretty(value)?;
    json.push(b'\n');
    write_atomic(path, &json)
}

/// Hard link a file, copying when linking is not possible
pub(crate) fn link_or_copy(src: &Path, dst: &Path) -> io::Result<()> {
    if fs::hard_link(src, dst).is_err() {
        fs::copy(src, dst)?;
    }
    Ok(())
}

/// Recreate the files of a directory tree under `dst` with hard links
pub(crate) fn clone_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let mut pending = vec![(src.to_path_buf(), dst.to_path_buf())];
    while let Some((from, to)) = pending.pop() {
        fs::create_dir_all(&to)?;
        for entry in fs::read_dir(&from)? {
            let entry = entry?;
            let target = to.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                pending.push((entry.path(), target));
            } else {
                link_or_copy(&entry.path(), &target)?;
            }
        }
    }
    Ok(())
}

/// Size and hex SHA-256 of a file
pub(crate) fn file_digest(path: &Path) -> io::Result<(u64, String)> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
        size += read as u64;
    }

    Ok((size, hex::encode(hasher.finalize())))
}

/// Remove a directory tree if it exists
pub(crate) fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_dir_all(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces_link_target_only() {
        let dir = TempDir::new().unwrap();
        let original = dir.path().join("a.json");
        let linked = dir.path().join("b.json");
        fs::write(&original, b"one").unwrap();
        link_or_copy(&original, &linked).unwrap();

        write_atomic(&linked, b"two").unwrap();
        assert_eq!(fs::read(&original).unwrap(), b"one");
        assert_eq!(fs::read(&linked).unwrap(), b"two");
    }

    #[test]
    fn test_clone_tree() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("nested")).unwrap();
        fs::write(src.join("top.txt"), b"top").unwrap();
        fs::write(src.join("nested/inner.txt"), b"inner").unwrap();

        let dst = dir.path().join("dst");
        clone_tree(&src, &dst).unwrap();
        assert_eq!(fs::read(dst.join("nested/inner.txt")).unwrap(), b"inner");
        assert_eq!(fs::read(dst.join("top.txt")).unwrap(), b"top");
    }

    #[test]
    fn test_file_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("payload");
        fs::write(&path, b"hello").unwrap();

        let (size, sha) = file_digest(&path).unwrap();
        assert_eq!(size, 5);
        assert_eq!(
            sha,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_remove_missing_dir() {
        let dir = TempDir::new().unwrap();
        assert!(remove_dir_if_exists(&dir.path().join("missing")).is_ok());
    }
}
