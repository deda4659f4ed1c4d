// SPDX-License-Identifier: Apache-2.0

//! Filesystem helpers shared by the dump and restore paths.

use std::fs;
use std::io;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};

use crate::error::DumpError;

/// Recursively copy `src` (a file or a directory) to `dst`, preserving file
/// modes. Directories that are walked keep their source mode; parent
/// directories synthesized ahead of the walk are created with mode 0755.
pub fn copy_tree(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::metadata(src)?;
    if meta.is_dir() {
        ensure_parent(dst)?;
        match fs::create_dir(dst) {
            Ok(()) => fs::set_permissions(dst, meta.permissions())?,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(e),
        }
        for entry in fs::read_dir(src)? {
            let entry = entry?;
            copy_tree(&entry.path(), &dst.join(entry.file_name()))?;
        }
    } else {
        ensure_parent(dst)?;
        // fs::copy carries the permission bits over.
        fs::copy(src, dst)?;
    }
    Ok(())
}

fn ensure_parent(dst: &Path) -> io::Result<()> {
    if let Some(parent) = dst.parent() {
        if !parent.as_os_str().is_empty() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o755)
                .create(parent)?;
        }
    }
    Ok(())
}

/// Remove `path` and everything under it. A path that does not exist is not
/// an error.
pub fn remove_all(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Read the link targets of file descriptors 0, 1 and 2 of `pid` from
/// `/proc/<pid>/fd`. Any unreadable link is fatal: without all three targets
/// the restore side cannot rebuild the descriptor table.
pub fn stdio_link_targets(pid: i32) -> Result<[String; 3], DumpError> {
    let fd_dir = PathBuf::from("/proc").join(pid.to_string()).join("fd");
    let mut trio: [String; 3] = Default::default();
    for (i, slot) in trio.iter_mut().enumerate() {
        let fd_path = fd_dir.join(i.to_string());
        let target = fs::read_link(&fd_path).map_err(|source| DumpError::StdioProbe {
            path: fd_path.clone(),
            source,
        })?;
        *slot = target.to_string_lossy().into_owned();
    }
    Ok(trio)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn set_mode(path: &Path, mode: u32) {
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(mode);
        fs::set_permissions(path, perms).unwrap();
    }

    fn mode_of(path: &Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn test_copy_tree_preserves_content_and_modes() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();

        let sub = src.path().join("nested");
        fs::create_dir(&sub).unwrap();
        set_mode(&sub, 0o700);
        fs::write(sub.join("secret.key"), b"key material").unwrap();
        set_mode(&sub.join("secret.key"), 0o600);
        fs::write(src.path().join("notes.txt"), b"hello").unwrap();
        set_mode(&src.path().join("notes.txt"), 0o644);

        let target = dst.path().join("copy");
        copy_tree(src.path(), &target).unwrap();

        assert_eq!(
            fs::read(target.join("nested/secret.key")).unwrap(),
            b"key material"
        );
        assert_eq!(fs::read(target.join("notes.txt")).unwrap(), b"hello");
        assert_eq!(mode_of(&target.join("nested")), 0o700);
        assert_eq!(mode_of(&target.join("nested/secret.key")), 0o600);
        assert_eq!(mode_of(&target.join("notes.txt")), 0o644);
    }

    #[test]
    fn test_copy_single_file_synthesizes_parents() {
        let src = TempDir::new().unwrap();
        let dst = TempDir::new().unwrap();
        let file = src.path().join("app.log");
        fs::write(&file, b"line").unwrap();

        let target = dst.path().join("var/log/app.log");
        copy_tree(&file, &target).unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"line");
        assert!(dst.path().join("var/log").is_dir());
    }

    #[test]
    fn test_remove_all_tolerates_missing() {
        let dir = TempDir::new().unwrap();
        remove_all(&dir.path().join("never-existed")).unwrap();

        let doomed = dir.path().join("doomed");
        fs::create_dir(&doomed).unwrap();
        fs::write(doomed.join("child"), b"x").unwrap();
        remove_all(&doomed).unwrap();
        assert!(!doomed.exists());
    }

    #[test]
    fn test_stdio_link_targets_of_self() {
        let trio = stdio_link_targets(std::process::id() as i32).unwrap();
        assert_eq!(trio.len(), 3);
        for target in &trio {
            assert!(!target.is_empty());
        }
    }

    #[test]
    fn test_stdio_link_targets_of_missing_pid() {
        // PIDs are capped well below this value.
        let result = stdio_link_targets(i32::MAX);
        assert!(matches!(result, Err(DumpError::StdioProbe { .. })));
    }
}
