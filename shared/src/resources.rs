//! Cluster resource definitions for the `wga.kraudcloud.com/v1beta` group.
//!
//! All three kinds are cluster-scoped. Status objects are optional and owned
//! by the reconcilers; specs are owned by users (with the exception of
//! secret-reference defaulting on cluster clients).

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// A named set of destination CIDRs that peers can be granted access to.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "wga.kraudcloud.com",
    version = "v1beta",
    kind = "WireguardAccessRule",
    plural = "wireguardaccessrules"
)]
#[serde(rename_all = "camelCase")]
pub struct WireguardAccessRuleSpec {
    pub destinations: Vec<String>,
}

/// A single WireGuard client, identified by its public key, together with
/// the rule names it is authorized to invoke.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "wga.kraudcloud.com",
    version = "v1beta",
    kind = "WireguardAccessPeer",
    plural = "wireguardaccesspeers",
    status = "WireguardAccessPeerStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct WireguardAccessPeerSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_shared_key: Option<String>,
    pub public_key: String,
    pub access_rules: Vec<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WireguardAccessPeerStatus {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_updated: String,
    pub address: String,
    #[serde(default)]
    pub dns: Vec<String>,
    #[serde(default)]
    pub peers: Vec<WireguardAccessPeerStatusPeer>,
}

/// How a peer reaches the gateway. Status always carries exactly one entry.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WireguardAccessPeerStatusPeer {
    pub public_key: String,
    pub endpoint: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_shared_key: Option<String>,
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

/// A set of nodes that each bring up an outbound WireGuard tunnel to a
/// configured server endpoint.
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "wga.kraudcloud.com",
    version = "v1beta",
    kind = "WireguardClusterClient",
    plural = "wireguardclusterclients",
    status = "WireguardClusterClientStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct WireguardClusterClientSpec {
    /// Interface address on each node, as a bare IP or CIDR.
    pub address: String,
    pub nodes: Vec<WireguardClusterClientNode>,
    pub server: WireguardClusterClientServer,
    pub routes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_keepalive: Option<u16>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WireguardClusterClientNode {
    pub node_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_shared_key: Option<String>,
    #[serde(default)]
    pub private_key: WireguardClusterClientPrivateKey,
}

/// One of `value` (inline, moved into a secret on first reconcile) or
/// `secret_ref`.
#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WireguardClusterClientPrivateKey {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretRef>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WireguardClusterClientServer {
    /// host:port of the server's WireGuard endpoint.
    pub endpoint: String,
    pub public_key: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WireguardClusterClientStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default)]
    pub nodes: Vec<WireguardClusterClientStatusNode>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WireguardClusterClientStatusNode {
    pub node_name: String,
    pub public_key: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_spec_field_names() {
        let spec = WireguardAccessPeerSpec {
            pre_shared_key: Some("psk".into()),
            public_key: "pub".into(),
            access_rules: vec!["office".into()],
        };
        let json = serde_json::to_value(&spec).unwrap();
        assert_eq!(json["preSharedKey"], "psk");
        assert_eq!(json["publicKey"], "pub");
        assert_eq!(json["accessRules"][0], "office");
    }

    #[test]
    fn test_peer_status_optional_fields_absent() {
        let status = WireguardAccessPeerStatus {
            address: "fd00::1".into(),
            ..Default::default()
        };
        let json = serde_json::to_value(&status).unwrap();
        assert!(json.get("lastUpdated").is_none());
        assert_eq!(json["address"], "fd00::1");
    }

    #[test]
    fn test_cluster_client_round_trip() {
        let raw = serde_json::json!({
            "address": "10.66.0.2/24",
            "nodes": [{
                "nodeName": "node-a",
                "privateKey": { "secretRef": { "name": "wgc-web-node-a" } },
            }],
            "server": { "endpoint": "gw.example.com:51820", "publicKey": "pub" },
            "routes": ["10.0.0.0/16"],
            "persistentKeepalive": 25,
        });
        let spec: WireguardClusterClientSpec = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(spec.nodes[0].node_name, "node-a");
        assert_eq!(
            spec.nodes[0].private_key.secret_ref.as_ref().unwrap().name.as_deref(),
            Some("wgc-web-node-a")
        );
        let back = serde_json::to_value(&spec).unwrap();
        assert_eq!(back, raw);
    }
}
