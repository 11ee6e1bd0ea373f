//! Network RPC methods
//!
//! Peer and ban management: `getpeerinfo`, `getconnectioncount`,
//! `disconnectnode`, `setban`, `listbanned`, `clearbanned`.

use crate::network::ban_list::{BanReason, SubNet};
use crate::network::ConnectionManager;
use crate::rpc::errors::{RpcError, RpcResult};
use crate::utils::time::current_timestamp;
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::debug;

/// Network RPC methods
#[derive(Clone)]
pub struct NetworkRpc {
    manager: Arc<ConnectionManager>,
}

impl NetworkRpc {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Get peer information
    pub async fn get_peer_info(&self, _params: &Value) -> RpcResult<Value> {
        debug!("RPC: getpeerinfo");
        Ok(serde_json::to_value(self.manager.peer_info())?)
    }

    pub async fn get_connection_count(&self, _params: &Value) -> RpcResult<Value> {
        debug!("RPC: getconnectioncount");
        Ok(json!(self.manager.peer_count()))
    }

    /// Disconnect a peer
    ///
    /// Params: ["address"] as `ip:port`, or a bare ip for every port;
    /// or [null, nodeid]
    pub async fn disconnect_node(&self, params: &Value) -> RpcResult<Value> {
        debug!("RPC: disconnectnode");

        let found = match (params.get(0).and_then(Value::as_str), params.get(1)) {
            (Some(address), _) => {
                let addr = parse_peer_address(address)
                    .ok_or_else(|| RpcError::invalid_params(format!("Invalid address: {address}")))?;
                self.manager.disconnect_peer(addr)
            }
            (None, Some(id)) => {
                let id = id
                    .as_u64()
                    .ok_or_else(|| RpcError::invalid_params("Invalid node id"))?;
                self.manager.disconnect_by_id(id)
            }
            (None, None) => return Err(RpcError::invalid_params("Missing address parameter")),
        };

        if found {
            Ok(Value::Null)
        } else {
            Err(RpcError::node_not_connected())
        }
    }

    /// Add or remove an IP/subnet from the ban table
    ///
    /// Params: ["subnet", "add"|"remove", bantime (optional, 0 = default), absolute (optional)]
    pub async fn set_ban(&self, params: &Value) -> RpcResult<Value> {
        debug!("RPC: setban");

        let subnet_str = params
            .get(0)
            .and_then(|p| p.as_str())
            .ok_or_else(|| RpcError::invalid_params("Missing subnet parameter"))?;
        let command = params
            .get(1)
            .and_then(|p| p.as_str())
            .ok_or_else(|| RpcError::invalid_params("Missing command parameter"))?;
        let subnet: SubNet = subnet_str
            .parse()
            .map_err(|_| RpcError::invalid_subnet(subnet_str))?;

        match command {
            "add" => {
                let now = current_timestamp();
                let already = self
                    .manager
                    .directory()
                    .with_bans(|bans| bans.is_subnet_banned(&subnet, now));
                if already {
                    return Err(RpcError::already_banned());
                }
                let bantime = params.get(2).and_then(|p| p.as_u64()).unwrap_or(0);
                let absolute = params.get(3).and_then(|p| p.as_bool()).unwrap_or(false);
                self.manager
                    .ban(subnet, BanReason::ManuallyAdded, bantime, absolute);
                debug!("Banned {} via RPC", subnet);
                Ok(Value::Null)
            }
            "remove" => {
                if !self.manager.unban(&subnet) {
                    return Err(RpcError::not_banned());
                }
                debug!("Unbanned {} via RPC", subnet);
                Ok(Value::Null)
            }
            _ => Err(RpcError::invalid_params(format!(
                "Invalid command: {}. Must be 'add' or 'remove'",
                command
            ))),
        }
    }

    /// List banned subnets
    ///
    /// Params: []
    pub async fn list_banned(&self, _params: &Value) -> RpcResult<Value> {
        debug!("RPC: listbanned");

        let result: Vec<Value> = self
            .manager
            .list_banned()
            .iter()
            .map(|(subnet, entry)| {
                json!({
                    "address": subnet.to_string(),
                    "ban_created": entry.create_time,
                    "banned_until": entry.ban_until,
                    "ban_reason": entry.reason.as_str(),
                })
            })
            .collect();
        Ok(json!(result))
    }

    /// Clear all banned IPs
    ///
    /// Params: []
    pub async fn clear_banned(&self, _params: &Value) -> RpcResult<Value> {
        debug!("RPC: clearbanned");
        self.manager.clear_banned();
        Ok(Value::Null)
    }
}

/// `ip:port`, or a bare ip mapped to port 0 (every connection from that ip)
fn parse_peer_address(address: &str) -> Option<SocketAddr> {
    address
        .parse::<SocketAddr>()
        .ok()
        .or_else(|| address.parse::<IpAddr>().ok().map(|ip| SocketAddr::new(ip, 0)))
}
