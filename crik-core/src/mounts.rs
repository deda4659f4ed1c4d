// SPDX-License-Identifier: Apache-2.0

//! External-mount table.
//!
//! These paths are mounted into the container by the runtime, so the engine
//! must treat them as opaque external references rather than capture them in
//! the image. Dump registers each host path under a stable name; restore
//! re-binds the name to a host path, which lets the restoring host substitute
//! a different backing file (for example an updated /usr/share/zoneinfo).

/// One runtime-provided mount that must survive checkpoint and restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryMount {
    pub name: &'static str,
    pub path_in_checkpoint: &'static str,
    pub path_in_restore: &'static str,
}

/// The fixed mount table. Dump and restore must see the same names in the
/// same order for the engine to pair them up.
pub const DIRECTORY_MOUNTS: &[DirectoryMount] = &[
    DirectoryMount {
        name: "zoneinfo",
        path_in_checkpoint: "/usr/share/zoneinfo",
        path_in_restore: "/usr/share/zoneinfo",
    },
    DirectoryMount {
        name: "null",
        path_in_checkpoint: "/dev/null",
        path_in_restore: "/dev/null",
    },
    DirectoryMount {
        name: "random",
        path_in_checkpoint: "/dev/random",
        path_in_restore: "/dev/random",
    },
    DirectoryMount {
        name: "urandom",
        path_in_checkpoint: "/dev/urandom",
        path_in_restore: "/dev/urandom",
    },
    DirectoryMount {
        name: "tty",
        path_in_checkpoint: "/dev/tty",
        path_in_restore: "/dev/tty",
    },
    DirectoryMount {
        name: "zero",
        path_in_checkpoint: "/dev/zero",
        path_in_restore: "/dev/zero",
    },
    DirectoryMount {
        name: "full",
        path_in_checkpoint: "/dev/full",
        path_in_restore: "/dev/full",
    },
];

/// Render the table for the dump call: `mnt[<pathInCheckpoint>]:<name>`.
pub fn external_for_checkpoint() -> Vec<String> {
    DIRECTORY_MOUNTS
        .iter()
        .map(|d| format!("mnt[{}]:{}", d.path_in_checkpoint, d.name))
        .collect()
}

/// Render the table for the restore call: `mnt[<name>]:<pathInRestore>`.
/// The direction is deliberately the mirror of the dump rendering.
pub fn external_for_restore() -> Vec<String> {
    DIRECTORY_MOUNTS
        .iter()
        .map(|d| format!("mnt[{}]:{}", d.name, d.path_in_restore))
        .collect()
}
