//! The wga reconcilers: gateway-side (access peers, access rules, intranet
//! load balancers) and node-side (outbound cluster-client links).

use kube::Client;
use std::time::Duration;

pub mod config;
mod error;
pub mod ipam;
mod lbc;
pub mod nft;
mod peers;
pub mod wg;
mod wgc;

pub use config::EpConfig;
pub use error::{Error, Result};
pub use peers::{full_sync, run_gateway, Desired};
pub use wgc::run_cluster_clients;

/// Name of the gateway WireGuard device; also names its ingress chain.
pub const DEVICE_NAME: &str = "wga";

/// UDP port the gateway listens on.
pub const LISTEN_PORT: u16 = 51820;

/// Where the gateway's private key is mounted.
pub const PRIVATE_KEY_PATH: &str = "/etc/wga/endpoint/privateKey";

/// Keepalive interval pushed to access peers.
pub const PERSISTENT_KEEPALIVE_SECS: u16 = 60;

/// Upper bound on a single reconcile pass, external calls included.
pub const RECONCILE_DEADLINE: Duration = Duration::from_secs(15);

/// Peers carrying this label with value "true" get their address re-drawn on
/// the next reconcile; the label is removed in the process.
pub const FORCE_REFRESH_LABEL: &str = "wga.kraudcloud.com/force-refresh";

/// Load balancer class handled by the service reconciler.
pub const LOAD_BALANCER_CLASS: &str = "wga.kraudcloud.com/intranet";

/// Annotation listing user-requested load balancer IPs, comma separated.
pub const LOAD_BALANCER_IPS_ANNOTATION: &str = "wga.kraudcloud.com/loadBalancerIPs";

/// Prefix of the per-client outbound links managed by the node reconciler.
pub const WGC_LINK_PREFIX: &str = "wgc-";

pub const WGC_READY: &str = "Ready";
pub const WGC_FAILED: &str = "Failed";

/// Node label tracking the outcome of the last sync for one cluster client.
pub fn wgc_node_label(client: &str) -> String {
    format!("wga.kraudcloud.com/wgc-{client}")
}

/// Default name of the secret holding a node's private key.
pub fn wgc_secret_name(client: &str, node: &str) -> String {
    format!("wgc-{client}-{node}")
}

/// Shared state of the gateway reconcilers.
pub struct Ctx {
    pub client: Client,
    pub config: EpConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wgc_names() {
        assert_eq!(wgc_node_label("web"), "wga.kraudcloud.com/wgc-web");
        assert_eq!(wgc_secret_name("web", "node-a"), "wgc-web-node-a");
    }
}
