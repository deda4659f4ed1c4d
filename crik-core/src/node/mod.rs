// SPDX-License-Identifier: Apache-2.0

//! Node-state oracle: wire model, HTTP client, and the server interface.
//!
//! The oracle answers one question: is node N shutting down? The supervisor
//! asks it before spending time on a checkpoint. The reconciliation loop
//! that feeds the server's map from cluster events lives outside this crate.

pub mod client;
pub mod server;

use serde::{Deserialize, Serialize};

/// State of a node as reported by the oracle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
    #[serde(rename = "shutting-down")]
    ShuttingDown,
}

/// Wire model of one node's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub state: NodeState,
}
