// SPDX-License-Identifier: Apache-2.0

//! Supervisor configuration.
//!
//! The configuration file tells crik about the quirks of the process tree it
//! wraps: where checkpoint images live, which paths must travel with the
//! checkpoint, and which node-state server to consult before dumping. A
//! missing file is a valid (empty) configuration; a malformed one is fatal.

use std::fs;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, DumpError, RestoreError};

/// Name of the persisted configuration inside the image directory.
pub const CONFIGURATION_FILE_NAME: &str = "configuration.yaml";

/// User-provided configuration, loaded from a YAML file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Configuration {
    /// Directory where the checkpoint is stored. When non-empty it is both
    /// the destination of checkpoints and the source of restores. It is
    /// expected to be available in the new container as well.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_dir: Option<PathBuf>,

    /// URL of the node state server. If given, crik first checks whether the
    /// node is shutting down and only then takes a checkpoint. If not given,
    /// crik always takes a checkpoint when it receives SIGTERM.
    #[serde(rename = "nodeStateServerURL", skip_serializing_if = "Option::is_none")]
    pub node_state_server_url: Option<String>,

    /// Paths that are not part of the container's image but were opened by
    /// one of the processes in the tree. They are copied into the image
    /// bundle at checkpoint time and replayed onto the filesystem on
    /// restore. Entries can be files or directories.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub additional_paths: Vec<PathBuf>,

    /// Paths known to break the engine's inotify handling. Deleted right
    /// before the dump.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inotify_incompatible_paths: Vec<PathBuf>,
}

impl Configuration {
    /// Load the configuration from `path`.
    ///
    /// A file that does not exist (or is empty) yields the default
    /// configuration; any other read or parse failure is fatal.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The image directory, if one is configured. An empty string in the
    /// file counts as "not configured".
    pub fn image_dir(&self) -> Option<&Path> {
        self.image_dir
            .as_deref()
            .filter(|p| !p.as_os_str().is_empty())
    }

    /// The node state server URL, if one is configured.
    pub fn node_state_server_url(&self) -> Option<&str> {
        self.node_state_server_url
            .as_deref()
            .filter(|u| !u.is_empty())
    }
}

/// Configuration persisted inside the image directory at checkpoint time.
///
/// Embeds the user configuration verbatim and adds the stdio link trio so
/// the restore side can rebuild the original file descriptor table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedConfiguration {
    #[serde(flatten)]
    pub configuration: Configuration,

    /// `readlink` targets of file descriptors 0, 1 and 2 at checkpoint time.
    /// In containers these point at /dev/null or pipes; on restore they are
    /// satisfied by the restoring process's own stdio. Always three entries.
    #[serde(rename = "unixFileDescriptorTrio")]
    pub unix_file_descriptor_trio: [String; 3],
}

impl PersistedConfiguration {
    /// Write the persisted configuration into `image_dir` with mode 0600.
    pub fn persist(&self, image_dir: &Path) -> Result<(), DumpError> {
        let yaml = serde_yaml::to_string(self).map_err(|source| DumpError::EncodeConfig { source })?;
        let path = image_dir.join(CONFIGURATION_FILE_NAME);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)
            .map_err(|source| DumpError::WriteConfig {
                path: path.clone(),
                source,
            })?;
        file.write_all(yaml.as_bytes())
            .map_err(|source| DumpError::WriteConfig { path, source })
    }

    /// Load the persisted configuration from `image_dir`.
    pub fn load(image_dir: &Path) -> Result<Self, RestoreError> {
        let path = image_dir.join(CONFIGURATION_FILE_NAME);
        let contents =
            fs::read_to_string(&path).map_err(|source| RestoreError::ReadPersistedConfig {
                path: path.clone(),
                source,
            })?;
        serde_yaml::from_str(&contents)
            .map_err(|source| RestoreError::ParsePersistedConfig { path, source })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    const FULL_CONFIG: &str = r#"
imageDir: /var/lib/crik/images
nodeStateServerURL: http://node-state-server.crik-system.svc.cluster.local
additionalPaths:
  - /home/user/.config
  - /var/log/app.log
inotifyIncompatiblePaths:
  - /tmp/watched
"#;

    #[test]
    fn test_parse_full_config() {
        let config: Configuration = serde_yaml::from_str(FULL_CONFIG).unwrap();
        assert_eq!(
            config.image_dir(),
            Some(Path::new("/var/lib/crik/images"))
        );
        assert_eq!(
            config.node_state_server_url(),
            Some("http://node-state-server.crik-system.svc.cluster.local")
        );
        assert_eq!(config.additional_paths.len(), 2);
        assert_eq!(
            config.inotify_incompatible_paths,
            vec![PathBuf::from("/tmp/watched")]
        );
    }

    #[test]
    fn test_missing_file_is_empty_config() {
        let config = Configuration::load("/nonexistent/crik/config.yaml").unwrap();
        assert_eq!(config, Configuration::default());
        assert!(config.image_dir().is_none());
    }

    #[test]
    fn test_empty_file_is_empty_config() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "\n").unwrap();
        let config = Configuration::load(&path).unwrap();
        assert_eq!(config, Configuration::default());
    }

    #[test]
    fn test_malformed_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        fs::write(&path, "imageDir: [not: a: path").unwrap();
        let result = Configuration::load(&path);
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_empty_image_dir_not_configured() {
        let config: Configuration = serde_yaml::from_str("imageDir: \"\"\n").unwrap();
        assert!(config.image_dir().is_none());
    }

    #[test]
    fn test_persist_roundtrip_with_trio() {
        let dir = TempDir::new().unwrap();
        let persisted = PersistedConfiguration {
            configuration: Configuration {
                image_dir: Some(dir.path().to_path_buf()),
                additional_paths: vec![PathBuf::from("/home/user/.config")],
                ..Default::default()
            },
            unix_file_descriptor_trio: [
                "/dev/null".to_string(),
                "pipe:[1234]".to_string(),
                "pipe:[1235]".to_string(),
            ],
        };
        persisted.persist(dir.path()).unwrap();

        let written = fs::read_to_string(dir.path().join(CONFIGURATION_FILE_NAME)).unwrap();
        assert!(written.contains("unixFileDescriptorTrio"));
        assert!(written.contains("imageDir"));

        let mode = fs::metadata(dir.path().join(CONFIGURATION_FILE_NAME))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o600);

        let loaded = PersistedConfiguration::load(dir.path()).unwrap();
        assert_eq!(loaded, persisted);
    }
}
