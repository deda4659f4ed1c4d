//! Error types for crik.
//!
//! Each failure domain gets its own explicit enum - no `Box<dyn Error>`,
//! no catch-all variants. Every error here is fatal for the invocation:
//! the binary prints it to stderr and exits with code 1.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error for one supervisor invocation.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("image directory error: {0}")]
    ImageDir(#[from] ImageDirError),

    #[error("namespace preparation error: {0}")]
    NamespacePrep(#[from] NamespacePrepError),

    #[error("dump error: {0}")]
    Dump(#[from] DumpError),

    #[error("restore error: {0}")]
    Restore(#[from] RestoreError),

    #[error("node state error: {0}")]
    Oracle(#[from] OracleError),
}

/// Configuration file unreadable, malformed, or incoherent.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("command is required when there is no checkpoint to restore, i.e. imageDir is not given or empty")]
    CommandRequired,
}

/// Image directory cannot be inspected. A directory that does not exist is
/// not an error - it means there is nothing to restore.
#[derive(Debug, Error)]
pub enum ImageDirError {
    #[error("failed to read image directory {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// The process tree could not be prepared for a later restore.
#[derive(Debug, Error)]
pub enum NamespacePrepError {
    #[error("failed to write {path}: {source}")]
    WriteNsLastPid {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start command: {source}")]
    SpawnChild {
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install SIGTERM handler: {source}")]
    InstallSignalHandler {
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for the command: {source}")]
    WaitChild {
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send SIGTERM to the command: {source}")]
    ForwardSignal {
        #[source]
        source: nix::Error,
    },
}

/// Checkpoint failure: engine RPC failure or a pre-dump step failure.
#[derive(Debug, Error)]
pub enum DumpError {
    #[error("failed to open image directory {path}: {source}")]
    OpenImageDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create RPC socket pair: {source}")]
    Socketpair {
        #[source]
        source: nix::Error,
    },

    #[error("failed to spawn checkpoint engine: {source}")]
    SpawnEngine {
        #[source]
        source: std::io::Error,
    },

    #[error("failed to send RPC request to engine: {source}")]
    RpcSend {
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read RPC response from engine: {source}")]
    RpcRecv {
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode RPC response from engine: {source}")]
    RpcDecode {
        #[source]
        source: prost::DecodeError,
    },

    #[error("engine RPC response does not fit the receive buffer")]
    RpcResponseTooLarge,

    #[error("engine closed the RPC socket before responding")]
    RpcClosed,

    #[error("engine refused {request} request: errno {errno}{message}")]
    EngineFailed {
        request: &'static str,
        errno: i32,
        message: String,
    },

    #[error("engine sent an unexpected {got} response to a {expected} request")]
    UnexpectedResponse {
        expected: &'static str,
        got: String,
    },

    #[error("failed to remove {path}: {source}")]
    RemovePath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read link of {path}: {source}")]
    StdioProbe {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode configuration for the image directory: {source}")]
    EncodeConfig {
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to write {path}: {source}")]
    WriteConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to create extra files directory {path}: {source}")]
    ExtraFilesDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to copy {path} into the image directory: {source}")]
    CopyPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Restore failure: engine invocation, extra-files replay, or cgroup remap.
#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("failed to create {path}: {source}")]
    X11Dir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to copy extra files onto the filesystem root: {source}")]
    ExtraFilesCopy {
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read persisted configuration {path}: {source}")]
    ReadPersistedConfig {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse persisted configuration {path}: {source}")]
    ParsePersistedConfig {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("failed to read image file {path}: {source}")]
    FilesImage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode image file {path}: {source}")]
    FilesImageDecode {
        path: PathBuf,
        #[source]
        source: prost::DecodeError,
    },

    #[error("image file {path} has an unrecognized magic header")]
    FilesImageMagic { path: PathBuf },

    #[error("failed to read /proc/self/cgroup: {source}")]
    CgroupSelf {
        #[source]
        source: std::io::Error,
    },

    #[error("unexpected /proc/self/cgroup line: {line:?}")]
    CgroupFormat { line: String },

    #[error("failed to open {path}: {source}")]
    OpenCgroupFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to run restore engine: {source}")]
    SpawnEngine {
        #[source]
        source: std::io::Error,
    },
}

/// Network, status, or decode failure contacting the node-state oracle.
/// The supervisor refuses to guess: any of these aborts without checkpoint.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("KUBERNETES_NODE_NAME is not set but nodeStateServerURL is configured")]
    NodeNameMissing,

    #[error("failed to get node state from {url}: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("node state server returned {status} for {url}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },

    #[error("failed to decode node state from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Result type alias using the top-level Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_required_display() {
        let err = Error::from(ConfigError::CommandRequired);
        assert!(err.to_string().contains("command is required"));
    }

    #[test]
    fn test_error_chain() {
        let dump_err = DumpError::EngineFailed {
            request: "dump",
            errno: 16,
            message: String::new(),
        };
        let err: Error = dump_err.into();
        assert!(matches!(err, Error::Dump(_)));
        assert!(err.to_string().contains("errno 16"));
    }
}
