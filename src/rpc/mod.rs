//! RPC interface for the connection manager
//!
//! JSON-RPC method routing for peer, ban and firewall control. Transport is
//! left to the embedding node: it hands request strings to
//! [`RpcManager::process_request`] and writes back the returned value.

pub mod errors;
pub mod firewall;
pub mod network;

use crate::network::ConnectionManager;
use errors::{RpcError, RpcResult};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::debug;

/// Routes method names to the network and firewall handlers
#[derive(Clone)]
pub struct RpcManager {
    network_rpc: network::NetworkRpc,
    firewall_rpc: firewall::FirewallRpc,
}

impl RpcManager {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self {
            network_rpc: network::NetworkRpc::new(Arc::clone(&manager)),
            firewall_rpc: firewall::FirewallRpc::new(manager),
        }
    }

    pub fn network(&self) -> &network::NetworkRpc {
        &self.network_rpc
    }

    pub fn firewall(&self) -> &firewall::FirewallRpc {
        &self.firewall_rpc
    }

    /// Process a JSON-RPC request
    pub async fn process_request(&self, request: &str) -> Value {
        let request: Value = match serde_json::from_str(request) {
            Ok(req) => req,
            Err(e) => {
                let err = RpcError::parse_error(format!("Invalid JSON: {}", e));
                return err.to_json(None);
            }
        };

        let id = request.get("id").cloned();
        let Some(method) = request.get("method").and_then(|m| m.as_str()) else {
            return RpcError::invalid_request("Missing method").to_json(id);
        };
        let params = request.get("params").cloned().unwrap_or(json!([]));
        debug!("RPC request: {}", method);

        match self.call_method(method, &params).await {
            Ok(response) => json!({
                "jsonrpc": "2.0",
                "result": response,
                "id": id
            }),
            Err(e) => e.to_json(id),
        }
    }

    /// Call a specific RPC method
    pub async fn call_method(&self, method: &str, params: &Value) -> RpcResult<Value> {
        match method {
            // Network methods
            "getpeerinfo" => self.network_rpc.get_peer_info(params).await,
            "getconnectioncount" => self.network_rpc.get_connection_count(params).await,
            "disconnectnode" => self.network_rpc.disconnect_node(params).await,
            "setban" => self.network_rpc.set_ban(params).await,
            "listbanned" => self.network_rpc.list_banned(params).await,
            "clearbanned" => self.network_rpc.clear_banned(params).await,
            // Firewall methods
            "firewallstatus" => self.firewall_rpc.firewall_status(params).await,
            "firewallgetconfig" => self.firewall_rpc.firewall_get_config(params).await,
            "firewallset" => self.firewall_rpc.firewall_set(params).await,
            "firewalllistadd" => self.firewall_rpc.firewall_list_add(params).await,
            "firewalllistremove" => self.firewall_rpc.firewall_list_remove(params).await,
            "firewallbaseline" => self.firewall_rpc.firewall_baseline(params).await,
            "firewallclearblacklist" => self.firewall_rpc.firewall_clear_blacklist(params).await,
            "listblacklist" => self.firewall_rpc.list_blacklist(params).await,
            _ => Err(RpcError::method_not_found(method)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::network::handshake::HandshakeHandler;

    fn manager() -> (RpcManager, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::default();
        config.storage.data_dir = dir.path().to_string_lossy().into_owned();
        let connman = ConnectionManager::new(config, Box::new(HandshakeHandler::default()));
        (RpcManager::new(Arc::new(connman)), dir)
    }

    #[tokio::test]
    async fn test_process_request_routes() {
        let (rpc, _dir) = manager();
        let response = rpc
            .process_request(r#"{"jsonrpc":"2.0","method":"getconnectioncount","params":[],"id":7}"#)
            .await;
        assert_eq!(response["result"], 0);
        assert_eq!(response["id"], 7);
    }

    #[tokio::test]
    async fn test_unknown_method_and_bad_json() {
        let (rpc, _dir) = manager();
        let response = rpc.process_request(r#"{"method":"getblock","id":1}"#).await;
        assert_eq!(response["error"]["code"], -32601);
        let response = rpc.process_request("{not json").await;
        assert_eq!(response["error"]["code"], -32700);
        let response = rpc.process_request(r#"{"params":[],"id":2}"#).await;
        assert_eq!(response["error"]["code"], -32600);
        assert_eq!(response["id"], 2);
    }
}
