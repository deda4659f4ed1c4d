// SPDX-License-Identifier: Apache-2.0

//! HTTP interface of the node-state oracle.
//!
//! Lookups of names nobody has written yet answer `unknown` rather than 404:
//! a node the controller has not seen is simply a node that is not known to
//! be shutting down.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{any, get};
use axum::{Json, Router};
use tower_http::trace::TraceLayer;

use super::{Node, NodeState};

/// Shared name-to-state map. Readers run concurrently, writers serialize.
#[derive(Debug, Clone, Default)]
pub struct NodeStateStore {
    nodes: Arc<RwLock<HashMap<String, NodeState>>>,
}

impl NodeStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the state of a node.
    pub fn set(&self, name: impl Into<String>, state: NodeState) {
        self.nodes.write().unwrap().insert(name.into(), state);
    }

    /// Get the state of a node. Unknown names report `Unknown`.
    pub fn get(&self, name: &str) -> NodeState {
        self.nodes
            .read()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or_default()
    }

    /// Forget a node, typically because its resource was deleted.
    pub fn delete(&self, name: &str) {
        self.nodes.write().unwrap().remove(name);
    }
}

/// Build the oracle router. `GET /v1/nodes/{name}` answers with the wire
/// model; a missing name is 400 whatever the method, and non-GET methods on
/// a named node are 405.
pub fn router(store: NodeStateStore) -> Router {
    Router::new()
        .route("/v1/nodes/{name}", get(get_node))
        .route("/v1/nodes", any(missing_name))
        .route("/v1/nodes/", any(missing_name))
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

async fn get_node(
    State(store): State<NodeStateStore>,
    Path(name): Path<String>,
) -> Json<Node> {
    Json(Node {
        state: store.get(&name),
        name,
    })
}

async fn missing_name() -> (StatusCode, &'static str) {
    (StatusCode::BAD_REQUEST, "node name is missing")
}
