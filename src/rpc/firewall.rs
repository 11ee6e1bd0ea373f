//! Firewall RPC methods
//!
//! Runtime access to the firewall tunables, the operator lists, the
//! baseline and the session blacklist. Setting changes apply to the next
//! examination; nothing here is persisted back to the config file.

use crate::config::FirewallConfig;
use crate::firewall::SlotList;
use crate::network::ConnectionManager;
use crate::rpc::errors::{RpcError, RpcResult};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// List names accepted by `firewalllistadd` / `firewalllistremove`
pub const LIST_NAMES: [&str; 5] = [
    "whitelist",
    "blacklist",
    "node_heights",
    "attack_patterns",
    "ignore_patterns",
];

fn list_mut<'a>(config: &'a mut FirewallConfig, name: &str) -> Option<&'a mut SlotList> {
    match name {
        "whitelist" => Some(&mut config.whitelist),
        "blacklist" => Some(&mut config.blacklist),
        "node_heights" => Some(&mut config.forked_wallet.node_heights),
        "attack_patterns" => Some(&mut config.flooding_wallet.attack_patterns),
        "ignore_patterns" => Some(&mut config.flooding_wallet.ignore_patterns),
        _ => None,
    }
}

fn unknown_list(name: &str) -> RpcError {
    RpcError::invalid_parameter(format!(
        "Unknown list: {}. Expected one of {}",
        name,
        LIST_NAMES.join(", ")
    ))
}

fn str_param<'a>(params: &'a Value, index: usize, name: &str) -> RpcResult<&'a str> {
    params
        .get(index)
        .and_then(Value::as_str)
        .ok_or_else(|| RpcError::invalid_params(format!("Missing {} parameter", name)))
}

/// Write `value` at the dotted `path` of `settings`. Leaves `settings`
/// untouched on any error. Returns the value stored.
fn apply_setting(settings: &mut FirewallConfig, path: &str, value: &Value) -> RpcResult<Value> {
    let pointer = format!("/{}", path.replace('.', "/"));
    let mut tree = serde_json::to_value(&*settings)?;
    let target = tree
        .pointer_mut(&pointer)
        .ok_or_else(|| RpcError::invalid_parameter(format!("Unknown setting: {}", path)))?;

    let new_value = match value {
        Value::String(s) if !target.is_string() => serde_json::from_str(s)
            .map_err(|_| RpcError::invalid_params(format!("Invalid value for {}: {}", path, s)))?,
        other => other.clone(),
    };
    *target = new_value.clone();

    *settings = serde_json::from_value(tree)
        .map_err(|e| RpcError::invalid_params(format!("Invalid value for {}: {}", path, e)))?;
    Ok(new_value)
}

#[derive(Clone)]
pub struct FirewallRpc {
    manager: Arc<ConnectionManager>,
}

impl FirewallRpc {
    pub fn new(manager: Arc<ConnectionManager>) -> Self {
        Self { manager }
    }

    /// Master switch, detector switches and list sizes
    pub async fn firewall_status(&self, _params: &Value) -> RpcResult<Value> {
        debug!("RPC: firewallstatus");
        let firewall = self.manager.firewall();
        let detectors: serde_json::Map<String, Value> = firewall
            .detector_status()
            .into_iter()
            .map(|(name, on)| (name.to_string(), json!(on)))
            .collect();
        let settings = firewall.settings();
        Ok(json!({
            "enabled": settings.enabled,
            "first_detection_wins": settings.first_detection_wins,
            "detectors": detectors,
            "whitelisted": settings.whitelist.active().count(),
            "blacklisted": self.manager.directory().blacklist().len(),
            "banned": self.manager.list_banned().len(),
            "peers": self.manager.peer_count(),
        }))
    }

    pub async fn firewall_get_config(&self, _params: &Value) -> RpcResult<Value> {
        debug!("RPC: firewallgetconfig");
        let settings = self.manager.firewall().settings().clone();
        Ok(serde_json::to_value(settings)?)
    }

    /// Set one tunable by dotted path
    ///
    /// Params: ["flooding_wallet.min_check", 45]. A string value is parsed
    /// as JSON when the target is not itself a string.
    pub async fn firewall_set(&self, params: &Value) -> RpcResult<Value> {
        let path = str_param(params, 0, "path")?;
        let value = params
            .get(1)
            .ok_or_else(|| RpcError::invalid_params("Missing value parameter"))?;
        debug!("RPC: firewallset {}", path);

        let new_value = self
            .manager
            .firewall()
            .update_settings(|settings| apply_setting(settings, path, value))?;
        info!(target: "firewall", "Setting {} changed to {}", path, new_value);
        let mut changed = serde_json::Map::new();
        changed.insert(path.to_string(), new_value);
        Ok(Value::Object(changed))
    }

    /// Append an entry to an operator list
    ///
    /// Params: ["whitelist"|"blacklist"|"node_heights"|"attack_patterns"|"ignore_patterns", "entry"]
    pub async fn firewall_list_add(&self, params: &Value) -> RpcResult<Value> {
        let name = str_param(params, 0, "list")?;
        let entry = str_param(params, 1, "entry")?;
        debug!("RPC: firewalllistadd {} {}", name, entry);

        let slot = self.manager.firewall().update_settings(|settings| {
            list_mut(settings, name)
                .map(|list| list.push(entry))
                .ok_or_else(|| unknown_list(name))
        })?;
        match slot {
            Some(index) => Ok(json!({ "list": name, "slot": index })),
            None => Err(RpcError::invalid_params("Entry must not be empty")),
        }
    }

    /// Blank every slot holding exactly `entry`
    pub async fn firewall_list_remove(&self, params: &Value) -> RpcResult<Value> {
        let name = str_param(params, 0, "list")?;
        let entry = str_param(params, 1, "entry")?;
        debug!("RPC: firewalllistremove {} {}", name, entry);

        let removed = self.manager.firewall().update_settings(|settings| {
            list_mut(settings, name)
                .map(|list| list.remove(entry))
                .ok_or_else(|| unknown_list(name))
        })?;
        Ok(json!(removed))
    }

    pub async fn firewall_baseline(&self, _params: &Value) -> RpcResult<Value> {
        debug!("RPC: firewallbaseline");
        Ok(serde_json::to_value(self.manager.firewall().baseline())?)
    }

    pub async fn firewall_clear_blacklist(&self, _params: &Value) -> RpcResult<Value> {
        debug!("RPC: firewallclearblacklist");
        let cleared = self.manager.clear_blacklist();
        info!(target: "firewall", "Cleared {} blacklisted addresses", cleared);
        Ok(json!(cleared))
    }

    /// Session blacklist plus the configured seed entries
    pub async fn list_blacklist(&self, _params: &Value) -> RpcResult<Value> {
        debug!("RPC: listblacklist");
        let configured: Vec<String> = self
            .manager
            .firewall()
            .settings()
            .blacklist
            .active()
            .map(str::to_string)
            .collect();
        Ok(json!({
            "session": self.manager.directory().blacklist(),
            "configured": configured,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::network::handshake::HandshakeHandler;

    fn rpc() -> (FirewallRpc, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let mut config = NodeConfig::default();
        config.storage.data_dir = dir.path().to_string_lossy().into_owned();
        let manager = ConnectionManager::new(config, Box::new(HandshakeHandler::default()));
        (FirewallRpc::new(Arc::new(manager)), dir)
    }

    #[tokio::test]
    async fn test_set_by_path() {
        let (rpc, _dir) = rpc();
        rpc.firewall_set(&json!(["flooding_wallet.min_check", 45])).await.unwrap();
        rpc.firewall_set(&json!(["bandwidth_abuse.detect", "false"])).await.unwrap();
        let settings = rpc.manager.firewall().settings().clone();
        assert_eq!(settings.flooding_wallet.min_check, 45);
        assert!(!settings.bandwidth_abuse.detect);

        let status = rpc.firewall_status(&json!([])).await.unwrap();
        assert_eq!(status["detectors"]["bandwidth_abuse"], false);
        assert_eq!(status["detectors"]["flooding_wallet"], true);
    }

    #[tokio::test]
    async fn test_set_rejects_unknown_path_and_bad_type() {
        let (rpc, _dir) = rpc();
        let err = rpc.firewall_set(&json!(["no_such.setting", 1])).await.unwrap_err();
        assert_eq!(err.code.code(), -8);
        let err = rpc.firewall_set(&json!(["average_range", "wide"])).await.unwrap_err();
        assert_eq!(err.code.code(), -32602);
        assert_eq!(rpc.manager.firewall().settings().average_range, 100);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_set_keeps_list_additions() {
        let (rpc, _dir) = rpc();
        let setter = {
            let rpc = rpc.clone();
            tokio::spawn(async move {
                for i in 0..200u64 {
                    rpc.firewall_set(&json!(["flooding_wallet.min_check", i])).await.unwrap();
                }
            })
        };
        let adder = {
            let rpc = rpc.clone();
            tokio::spawn(async move {
                for i in 0..200 {
                    let entry = format!("10.0.{}.{}", i / 256, i % 256);
                    rpc.firewall_list_add(&json!(["whitelist", entry])).await.unwrap();
                }
            })
        };
        setter.await.unwrap();
        adder.await.unwrap();

        let settings = rpc.manager.firewall().settings().clone();
        assert_eq!(settings.whitelist.active().count(), 200);
        assert_eq!(settings.flooding_wallet.min_check, 199);
    }

    #[test]
    fn test_apply_setting_leaves_config_on_error() {
        let mut settings = FirewallConfig::default();
        let before = serde_json::to_value(&settings).unwrap();
        assert!(apply_setting(&mut settings, "average_range", &json!("wide")).is_err());
        assert!(apply_setting(&mut settings, "no_such", &json!(1)).is_err());
        assert_eq!(serde_json::to_value(&settings).unwrap(), before);

        let stored = apply_setting(&mut settings, "invalid_wallet.max_check", &json!("75")).unwrap();
        assert_eq!(stored, json!(75));
        assert_eq!(settings.invalid_wallet.max_check, 75);
    }

    #[tokio::test]
    async fn test_list_add_remove() {
        let (rpc, _dir) = rpc();
        let added = rpc.firewall_list_add(&json!(["node_heights", "55555"])).await.unwrap();
        assert_eq!(added["slot"], 3);
        assert_eq!(rpc.firewall_list_remove(&json!(["node_heights", "39486"])).await.unwrap(), json!(true));
        let heights = rpc.manager.firewall().settings().forked_wallet.node_heights.clone();
        assert_eq!(heights.slots(), ["10000", "", "48405", "55555"]);

        let err = rpc.firewall_list_add(&json!(["greylist", "x"])).await.unwrap_err();
        assert_eq!(err.code.code(), -8);
    }

    #[tokio::test]
    async fn test_blacklist_views() {
        let (rpc, _dir) = rpc();
        rpc.manager.directory().blacklist_insert("1.2.3.4");
        rpc.firewall_list_add(&json!(["blacklist", "5.6.7.8"])).await.unwrap();
        let listed = rpc.list_blacklist(&json!([])).await.unwrap();
        assert_eq!(listed["session"], json!(["1.2.3.4"]));
        assert_eq!(listed["configured"], json!(["5.6.7.8"]));
        assert_eq!(rpc.firewall_clear_blacklist(&json!([])).await.unwrap(), json!(1));
        let baseline = rpc.firewall_baseline(&json!([])).await.unwrap();
        assert_eq!(baseline["average_height"], 0);
    }
}
