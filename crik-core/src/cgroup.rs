// SPDX-License-Identifier: Apache-2.0

//! Cgroup path remapping for restore.
//!
//! With cgroup v2 the kubepods control-file paths embed pod and container
//! IDs, which are different in the pod the process is restored into. The
//! resolver re-opens each captured control file under the current
//! container's own cgroup directory and hands the engine the open handles,
//! paired with inherit-fd entries naming the captured paths.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::error::RestoreError;
use crate::image;

const CGROUP_FS_ROOT: &str = "/sys/fs/cgroup";
const PROC_SELF_CGROUP: &str = "/proc/self/cgroup";

/// The handles and inherit-fd targets produced by the remap.
///
/// The lists are index-paired: `inherit_paths[i]` is the captured path (with
/// its leading `/` stripped, the way the engine expects inherit-fd targets)
/// that must be satisfied by `files[i]`, which the caller passes to the
/// engine as file descriptor `3 + i`.
#[derive(Debug, Default)]
pub struct CgroupRemap {
    pub inherit_paths: Vec<String>,
    pub files: Vec<File>,
}

/// Build the remap for the checkpoint in `image_dir`. Zero captured kubepods
/// files (cgroup v1 hosts) yields an empty remap.
pub fn remap_for_restore(image_dir: &Path) -> Result<CgroupRemap, RestoreError> {
    let kubepods = image::kubepods_file_paths(image_dir)?;
    if kubepods.is_empty() {
        return Ok(CgroupRemap::default());
    }

    // All processes in the container share one cgroup, so self is enough.
    let contents =
        fs::read_to_string(PROC_SELF_CGROUP).map_err(|source| RestoreError::CgroupSelf { source })?;
    let base = current_cgroup_dir(&contents)?;

    let mut remap = CgroupRemap::default();
    for (basename, captured) in kubepods {
        let path = base.join(&basename);
        let file = File::open(&path).map_err(|source| RestoreError::OpenCgroupFile {
            path: path.clone(),
            source,
        })?;
        remap
            .inherit_paths
            .push(captured.trim_start_matches('/').to_string());
        remap.files.push(file);
    }
    Ok(remap)
}

/// Resolve the current container's cgroup directory from the contents of
/// `/proc/self/cgroup`: the third `:`-separated field of the first line,
/// joined under /sys/fs/cgroup.
fn current_cgroup_dir(contents: &str) -> Result<PathBuf, RestoreError> {
    let line = contents.lines().next().unwrap_or("");
    let mut fields = line.splitn(3, ':');
    let relative = match (fields.next(), fields.next(), fields.next()) {
        (Some(_), Some(_), Some(relative)) => relative,
        _ => {
            return Err(RestoreError::CgroupFormat {
                line: line.to_string(),
            });
        }
    };
    Ok(Path::new(CGROUP_FS_ROOT).join(relative.trim_start_matches('/')))
}
