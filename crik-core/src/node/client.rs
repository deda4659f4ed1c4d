// SPDX-License-Identifier: Apache-2.0

//! HTTP client for the node-state oracle.

use std::sync::OnceLock;

use reqwest::Client;

use crate::error::OracleError;

use super::Node;

/// Environment variable naming the node this process runs on.
pub const NODE_NAME_ENV: &str = "KUBERNETES_NODE_NAME";

/// One shared connection pool for every oracle query in this process.
fn http_client() -> &'static Client {
    static CLIENT: OnceLock<Client> = OnceLock::new();
    CLIENT.get_or_init(Client::new)
}

/// Fetch the state of the node named by `KUBERNETES_NODE_NAME`.
///
/// Any failure here is surfaced to the caller as fatal: the supervisor
/// refuses to guess whether the node is going away.
pub async fn fetch_node_state(base_url: &str) -> Result<Node, OracleError> {
    let name = std::env::var(NODE_NAME_ENV)
        .ok()
        .filter(|name| !name.is_empty())
        .ok_or(OracleError::NodeNameMissing)?;
    fetch_node_state_named(base_url, &name).await
}

/// Fetch the state of a specific node.
pub async fn fetch_node_state_named(base_url: &str, name: &str) -> Result<Node, OracleError> {
    let url = node_state_url(base_url, name);
    let response = http_client()
        .get(&url)
        .send()
        .await
        .map_err(|source| OracleError::Request {
            url: url.clone(),
            source,
        })?;
    let status = response.status();
    if !status.is_success() {
        return Err(OracleError::Status { url, status });
    }
    response
        .json::<Node>()
        .await
        .map_err(|source| OracleError::Decode { url, source })
}

fn node_state_url(base_url: &str, name: &str) -> String {
    format!("{}/v1/nodes/{}", base_url.trim_end_matches('/'), name)
}
