// SPDX-License-Identifier: Apache-2.0

//! End-to-end integration tests for crik.
//!
//! Everything here runs without a checkpoint engine on the host: the tests
//! exercise the mode decision, the image-bundle plumbing, and the node-state
//! oracle over a real socket.

use std::fs;

use prost::Message;
use tempfile::TempDir;

use crik_core::image::{FdType, FileEntry, RegFileEntry, FILES_IMAGE_NAME, IMG_COMMON_MAGIC};
use crik_core::node::server::{router, NodeStateStore};
use crik_core::node::{client, NodeState};
use crik_core::supervisor::{decide_mode, Mode};
use crik_core::{ConfigError, Configuration, Error};

fn write_files_image(dir: &std::path::Path, entries: &[FileEntry]) {
    let mut bytes = Vec::new();
    bytes.extend_from_slice(&IMG_COMMON_MAGIC.to_le_bytes());
    bytes.extend_from_slice(&0u32.to_le_bytes());
    for entry in entries {
        let payload = entry.encode_to_vec();
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(&payload);
    }
    fs::write(dir.join(FILES_IMAGE_NAME), bytes).unwrap();
}

/// A directory with any *.img entry flips the supervisor into restore mode,
/// command or no command.
#[test]
fn test_mode_decision_follows_image_probe() {
    let dir = TempDir::new().unwrap();
    let configuration = Configuration {
        image_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    };
    let command = vec!["/bin/sleep".to_string(), "100".to_string()];

    // Empty directory: run mode.
    assert_eq!(decide_mode(&configuration, &command).unwrap(), Mode::Run);

    // Non-image residue does not trigger a restore.
    fs::write(dir.path().join("dump.log"), b"").unwrap();
    assert_eq!(decide_mode(&configuration, &command).unwrap(), Mode::Run);

    // One image file does, with and without a command.
    fs::write(dir.path().join("pstree.img"), b"").unwrap();
    assert!(matches!(
        decide_mode(&configuration, &command).unwrap(),
        Mode::Restore { .. }
    ));
    assert!(matches!(
        decide_mode(&configuration, &[]).unwrap(),
        Mode::Restore { .. }
    ));
}

/// Run mode with nothing to run is a configuration error, not a crash later.
#[test]
fn test_missing_command_is_config_error() {
    let result = decide_mode(&Configuration::default(), &[]);
    match result {
        Err(Error::Config(ConfigError::CommandRequired)) => {}
        other => panic!("expected CommandRequired, got {other:?}"),
    }
}

/// The captured fd table drives the cgroup remap: kubepods files come back
/// keyed by basename, everything else is ignored.
#[test]
fn test_kubepods_enumeration_from_files_image() {
    let dir = TempDir::new().unwrap();
    write_files_image(
        dir.path(),
        &[
            FileEntry {
                ty: FdType::Reg as i32,
                id: 1,
                reg: Some(RegFileEntry {
                    id: 1,
                    flags: 0,
                    pos: 0,
                    name: "/sys/fs/cgroup/kubepods.slice/kubepods-pod42.slice/memory.max"
                        .to_string(),
                    mode: Some(0o444),
                }),
            },
            FileEntry {
                ty: FdType::Reg as i32,
                id: 2,
                reg: Some(RegFileEntry {
                    id: 2,
                    flags: 0,
                    pos: 0,
                    name: "/home/user/data.bin".to_string(),
                    mode: Some(0o644),
                }),
            },
        ],
    );

    let paths = crik_core::image::kubepods_file_paths(dir.path()).unwrap();
    assert_eq!(paths.len(), 1);
    assert_eq!(
        paths["memory.max"],
        "/sys/fs/cgroup/kubepods.slice/kubepods-pod42.slice/memory.max"
    );
}

/// Full oracle round trip over a real TCP socket: the client sees exactly
/// what the store holds, and unknown nodes answer unknown.
#[tokio::test]
async fn test_node_state_round_trip() {
    let store = NodeStateStore::new();
    store.set("node-going-away", NodeState::ShuttingDown);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(store);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let base_url = format!("http://{addr}");

    let node = client::fetch_node_state_named(&base_url, "node-going-away")
        .await
        .unwrap();
    assert_eq!(node.name, "node-going-away");
    assert_eq!(node.state, NodeState::ShuttingDown);

    let node = client::fetch_node_state_named(&base_url, "node-staying")
        .await
        .unwrap();
    assert_eq!(node.state, NodeState::Unknown);
}

/// An unreachable oracle is a hard failure, never a silent "do not
/// checkpoint".
#[tokio::test]
async fn test_unreachable_oracle_is_fatal() {
    // Nothing listens on this port.
    let result = client::fetch_node_state_named("http://127.0.0.1:1", "node-a").await;
    assert!(matches!(
        result,
        Err(crik_core::OracleError::Request { .. })
    ));
}
