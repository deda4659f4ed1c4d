//! Checkpoint driver.
//!
//! Builds the dump option set, runs the pre-dump housekeeping from the
//! engine's notification hook, and reports how long the whole dump took.
//! The engine terminates the target process as part of a successful dump.

use std::fs::{self, File};
use std::os::fd::AsRawFd;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;
use std::time::{Duration, Instant};

use nix::fcntl::{fcntl, FcntlArg, FdFlag};

use crate::config::{Configuration, PersistedConfiguration};
use crate::error::DumpError;
use crate::fsutil;
use crate::image::EXTRA_FILES_DIR;
use crate::mounts;

use super::rpc::{Criu, CriuCgMode, CriuOpts, NotifyHandler};

/// Cap on ghost-file copies: 500 MiB.
const GHOST_FILE_LIMIT: u32 = 500 * 1048576;

/// Dump log file name, relative to the image directory.
const DUMP_LOG_FILE: &str = "dump.log";

/// Take a checkpoint of `pid` into `image_dir`.
///
/// Returns the elapsed wall-clock duration of the whole operation. The open
/// image-directory descriptor is owned by this call and closed on return.
pub fn take_checkpoint(
    criu: &Criu,
    pid: i32,
    configuration: &Configuration,
    image_dir: &Path,
) -> Result<Duration, DumpError> {
    let start = Instant::now();

    let engine_version = criu.version()?;
    tracing::debug!(engine_version, "checkpoint engine ready");

    let dir = File::open(image_dir).map_err(|source| DumpError::OpenImageDir {
        path: image_dir.to_path_buf(),
        source,
    })?;
    // The descriptor is handed to the engine by number over the RPC, so it
    // must survive the exec of the swrk worker.
    fcntl(dir.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty())).map_err(|errno| {
        DumpError::OpenImageDir {
            path: image_dir.to_path_buf(),
            source: std::io::Error::from_raw_os_error(errno as i32),
        }
    })?;

    tracing::info!(pid, image_dir = %image_dir.display(), "taking checkpoint");
    let mut actions = PreDumpActions {
        pid,
        configuration,
        image_dir,
    };
    criu.dump(dump_opts(pid, dir.as_raw_fd()), &mut actions)?;
    Ok(start.elapsed())
}

/// The option set for the dump request. TCP state is captured and the
/// remaining sockets closed; the engine terminates the target rather than
/// leaving it running or stopped.
fn dump_opts(pid: i32, images_dir_fd: i32) -> CriuOpts {
    CriuOpts {
        images_dir_fd: Some(images_dir_fd),
        pid: Some(pid),
        leave_running: Some(false),
        leave_stopped: Some(false),
        tcp_established: Some(true),
        tcp_close: Some(true),
        shell_job: Some(false),
        file_locks: Some(false),
        auto_dedup: Some(false),
        lazy_pages: Some(false),
        orphan_pts_master: Some(true),
        notify_scripts: Some(true),
        ghost_limit: Some(GHOST_FILE_LIMIT),
        root: Some("/".to_string()),
        manage_cgroups_mode: Some(CriuCgMode::Ignore as i32),
        log_level: Some(4),
        log_file: Some(DUMP_LOG_FILE.to_string()),
        external: mounts::external_for_checkpoint(),
    }
}

/// Housekeeping run when the engine announces it is about to dump: clear the
/// paths the engine cannot handle, record the stdio link trio, persist the
/// configuration, and copy the additional paths into the bundle.
struct PreDumpActions<'a> {
    pid: i32,
    configuration: &'a Configuration,
    image_dir: &'a Path,
}

impl NotifyHandler for PreDumpActions<'_> {
    fn pre_dump(&mut self) -> Result<(), DumpError> {
        for path in &self.configuration.inotify_incompatible_paths {
            fsutil::remove_all(path).map_err(|source| DumpError::RemovePath {
                path: path.clone(),
                source,
            })?;
        }

        let trio = fsutil::stdio_link_targets(self.pid)?;
        let persisted = PersistedConfiguration {
            configuration: self.configuration.clone(),
            unix_file_descriptor_trio: trio,
        };
        persisted.persist(self.image_dir)?;

        let extra_root = self.image_dir.join(EXTRA_FILES_DIR);
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(&extra_root)
            .map_err(|source| DumpError::ExtraFilesDir {
                path: extra_root.clone(),
                source,
            })?;
        for path in &self.configuration.additional_paths {
            if !path.exists() {
                // Sources that never materialized are not worth failing a
                // checkpoint over.
                continue;
            }
            let dst = extra_root.join(strip_root(path));
            fsutil::copy_tree(path, &dst).map_err(|source| DumpError::CopyPath {
                path: path.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

fn strip_root(path: &Path) -> &Path {
    path.strip_prefix("/").unwrap_or(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;

    use crate::config::CONFIGURATION_FILE_NAME;

    #[test]
    fn test_dump_opts_match_engine_contract() {
        let opts = dump_opts(9001, 7);
        assert_eq!(opts.pid, Some(9001));
        assert_eq!(opts.images_dir_fd, Some(7));
        assert_eq!(opts.tcp_established, Some(true));
        assert_eq!(opts.tcp_close, Some(true));
        assert_eq!(opts.shell_job, Some(false));
        assert_eq!(opts.leave_running, Some(false));
        assert_eq!(opts.leave_stopped, Some(false));
        assert_eq!(opts.notify_scripts, Some(true));
        assert_eq!(opts.orphan_pts_master, Some(true));
        assert_eq!(opts.ghost_limit, Some(500 * 1048576));
        assert_eq!(opts.log_level, Some(4));
        assert_eq!(opts.log_file.as_deref(), Some("dump.log"));
        assert_eq!(opts.root.as_deref(), Some("/"));
        assert_eq!(opts.manage_cgroups_mode, Some(CriuCgMode::Ignore as i32));
        assert!(opts
            .external
            .contains(&"mnt[/usr/share/zoneinfo]:zoneinfo".to_string()));
        assert_eq!(opts.external.len(), mounts::DIRECTORY_MOUNTS.len());
    }

    #[test]
    fn test_pre_dump_actions_populate_image_bundle() {
        let image = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();

        let extra_file = scratch.path().join("state.db");
        fs::write(&extra_file, b"rows").unwrap();
        let mut perms = fs::metadata(&extra_file).unwrap().permissions();
        perms.set_mode(0o640);
        fs::set_permissions(&extra_file, perms).unwrap();

        let doomed = scratch.path().join("watched");
        fs::create_dir(&doomed).unwrap();
        fs::write(doomed.join("inode"), b"x").unwrap();

        let configuration = Configuration {
            image_dir: Some(image.path().to_path_buf()),
            additional_paths: vec![
                extra_file.clone(),
                PathBuf::from("/definitely/not/there"),
            ],
            inotify_incompatible_paths: vec![doomed.clone()],
            ..Default::default()
        };

        let mut actions = PreDumpActions {
            pid: std::process::id() as i32,
            configuration: &configuration,
            image_dir: image.path(),
        };
        actions.pre_dump().unwrap();

        // The incompatible path is gone.
        assert!(!doomed.exists());

        // The persisted configuration carries the live stdio trio.
        let persisted = PersistedConfiguration::load(image.path()).unwrap();
        assert_eq!(persisted.configuration, configuration);
        for (i, target) in persisted.unix_file_descriptor_trio.iter().enumerate() {
            let live = fs::read_link(format!("/proc/self/fd/{i}")).unwrap();
            assert_eq!(target, &live.to_string_lossy());
        }
        let mode = fs::metadata(image.path().join(CONFIGURATION_FILE_NAME))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        // The existing additional path is mirrored under extraFiles with its
        // mode; the missing one is skipped silently.
        let mirror = image
            .path()
            .join(EXTRA_FILES_DIR)
            .join(extra_file.strip_prefix("/").unwrap());
        assert_eq!(fs::read(&mirror).unwrap(), b"rows");
        assert_eq!(
            fs::metadata(&mirror).unwrap().permissions().mode() & 0o777,
            0o640
        );
        assert!(!image
            .path()
            .join(EXTRA_FILES_DIR)
            .join("definitely")
            .exists());
    }
}
