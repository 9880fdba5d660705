//! Gateway WireGuard device lifecycle and peer-set sync.
//!
//! The interface-wide settings (key, listen port) are written exactly once
//! behind a one-shot cell; after that only the peer list is touched, always
//! through a single diffed device-configure call so established sessions
//! survive a sync.

use crate::{
    config::EpConfig,
    error::Result,
    DEVICE_NAME, LISTEN_PORT, PERSISTENT_KEEPALIVE_SECS, PRIVATE_KEY_PATH,
};
use once_cell::sync::OnceCell;
use shared::{host_net, netlink, read_key_file, resources::WireguardAccessPeer};
use std::{collections::HashMap, net::IpAddr};
use wireguard_control::{
    AllowedIp, Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfig, PeerConfigBuilder,
    PeerInfo,
};

/// Interface-wide settings. Written once at init, read-only after.
pub struct Gateway {
    pub private_key: Key,
    pub public_key: Key,
    pub listen_port: u16,
}

static GATEWAY: OnceCell<Gateway> = OnceCell::new();

pub fn device_name() -> InterfaceName {
    DEVICE_NAME.parse().expect("static device name is valid")
}

/// One-time gateway bring-up: a clean link carrying our key and listen port,
/// up, with a route for the client pool. Any failure here is fatal.
pub fn init(config: &EpConfig) -> Result<&'static Gateway> {
    if let Some(gateway) = GATEWAY.get() {
        return Ok(gateway);
    }

    log::info!("creating wireguard device {}", DEVICE_NAME);
    let iface = device_name();

    let private_key = read_key_file(PRIVATE_KEY_PATH)?;

    netlink::ensure_clean_link(&iface)?;

    DeviceUpdate::new()
        .set_private_key(private_key.clone())
        .set_listen_port(LISTEN_PORT)
        .apply(&iface, Backend::Kernel)?;

    netlink::set_up(&iface)?;
    netlink::add_route(&iface, config.client_cidr)?;

    Ok(GATEWAY.get_or_init(|| Gateway {
        public_key: private_key.get_public(),
        private_key,
        listen_port: LISTEN_PORT,
    }))
}

/// Interface settings, available once [`init`] has succeeded.
pub fn gateway() -> &'static Gateway {
    GATEWAY
        .get()
        .expect("gateway device is initialized before the reconcilers start")
}

/// What one access peer should look like on the device.
#[derive(Clone, Debug)]
pub struct DesiredPeer {
    pub public_key: Key,
    pub preshared_key: Option<Key>,
    pub allowed_ips: Vec<AllowedIp>,
}

/// Index the desired device peers by public key.
///
/// Peers without an assigned address are skipped (they reconcile again once
/// status lands). Unparseable keys or addresses are logged and skipped
/// rather than aborting the whole sync.
pub fn desired_peers(peers: &[WireguardAccessPeer]) -> HashMap<String, DesiredPeer> {
    let mut should = HashMap::new();

    for peer in peers {
        let name = peer.metadata.name.as_deref().unwrap_or("<unnamed>");
        let status = match &peer.status {
            Some(status) if !status.address.is_empty() => status,
            _ => continue,
        };

        log::info!("syncing peer {} (address {})", name, status.address);

        let address: IpAddr = match status.address.parse() {
            Ok(address) => address,
            Err(_) => {
                log::error!("peer {} has unparseable address {:?}", name, status.address);
                continue;
            },
        };

        let public_key = match Key::from_base64(&peer.spec.public_key) {
            Ok(key) => key,
            Err(_) => {
                log::error!(
                    "peer {} has an invalid public key {:?}",
                    name,
                    peer.spec.public_key
                );
                continue;
            },
        };

        let preshared_key = match peer.spec.pre_shared_key.as_deref() {
            Some(psk) if !psk.is_empty() => match Key::from_base64(psk) {
                Ok(key) => Some(key),
                Err(_) => {
                    log::error!("peer {} has an invalid preshared key", name);
                    continue;
                },
            },
            _ => None,
        };

        let snet = host_net(address);
        should.insert(
            public_key.to_base64(),
            DesiredPeer {
                public_key,
                preshared_key,
                allowed_ips: vec![AllowedIp {
                    address: snet.addr(),
                    cidr: snet.prefix_len(),
                }],
            },
        );
    }

    should
}

fn peer_changed(desired: &DesiredPeer, existing: &PeerConfig) -> bool {
    let new_psk = desired.preshared_key.clone().unwrap_or_else(Key::zero);
    let old_psk = existing.preshared_key.clone().unwrap_or_else(Key::zero);
    if new_psk != old_psk {
        log::info!("# psk changed {}", existing.public_key.to_base64());
        return true;
    }

    if desired.allowed_ips.len() != existing.allowed_ips.len() {
        log::info!(
            "# allowedips changed {} from {} to {}",
            existing.public_key.to_base64(),
            existing.allowed_ips.len(),
            desired.allowed_ips.len()
        );
        return true;
    }

    // order-sensitive on purpose: both sides produce insertion order
    desired
        .allowed_ips
        .iter()
        .zip(&existing.allowed_ips)
        .any(|(new, old)| new.address != old.address || new.cidr != old.cidr)
}

fn peer_op(desired: &DesiredPeer) -> PeerConfigBuilder {
    let mut builder = PeerConfigBuilder::new(&desired.public_key)
        .replace_allowed_ips()
        .add_allowed_ips(&desired.allowed_ips)
        .set_persistent_keepalive_interval(PERSISTENT_KEEPALIVE_SECS);
    if let Some(psk) = &desired.preshared_key {
        builder = builder.set_preshared_key(psk.clone());
    }
    builder
}

/// Compute the minimal set of device operations moving `have` to `should`.
///
/// A peer present on both sides compares by preshared key and the ordered
/// allowed-IP list; a match emits nothing at all.
pub fn diff_peers(
    mut should: HashMap<String, DesiredPeer>,
    have: &[PeerInfo],
) -> Vec<PeerConfigBuilder> {
    let mut ops = vec![];

    for existing in have {
        let key = existing.config.public_key.to_base64();
        match should.remove(&key) {
            Some(desired) => {
                if peer_changed(&desired, &existing.config) {
                    log::info!("# update {}", key);
                    ops.push(peer_op(&desired));
                }
            },
            None => {
                log::info!("# remove {}", key);
                ops.push(PeerConfigBuilder::new(&existing.config.public_key).remove());
            },
        }
    }

    for (key, desired) in &should {
        log::info!("# add {}", key);
        ops.push(peer_op(desired));
    }

    ops
}

/// Reconcile the device's peer set against the given access peers.
pub fn sync_device(peers: &[WireguardAccessPeer]) -> Result<()> {
    let iface = device_name();
    let device = Device::get(&iface, Backend::Kernel)?;
    let ops = diff_peers(desired_peers(peers), &device.peers);
    if ops.is_empty() {
        return Ok(());
    }

    DeviceUpdate::new()
        .add_peers(&ops)
        .apply(&iface, Backend::Kernel)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::resources::{
        WireguardAccessPeerSpec, WireguardAccessPeerStatus, WireguardAccessPeerStatusPeer,
    };

    const PUBKEY: &str = "4CNZorWVtohO64n6AAaH/JyFjIIgBFrfJK2SGtKjzEE=";

    fn access_peer(name: &str, public_key: &str, address: &str) -> WireguardAccessPeer {
        let mut peer = WireguardAccessPeer::new(
            name,
            WireguardAccessPeerSpec {
                pre_shared_key: None,
                public_key: public_key.to_string(),
                access_rules: vec!["office".into()],
            },
        );
        peer.status = Some(WireguardAccessPeerStatus {
            last_updated: String::new(),
            address: address.to_string(),
            dns: vec![],
            peers: vec![WireguardAccessPeerStatusPeer::default()],
        });
        peer
    }

    fn kernel_peer(public_key: &str, address: &str) -> PeerInfo {
        let snet = host_net(address.parse().unwrap());
        let config = PeerConfigBuilder::new(&Key::from_base64(public_key).unwrap())
            .add_allowed_ip(snet.addr(), snet.prefix_len())
            .into_peer_config();
        PeerInfo {
            config,
            stats: Default::default(),
        }
    }

    #[test]
    fn test_unchanged_peer_emits_nothing() {
        let should = desired_peers(&[access_peer("alice", PUBKEY, "fd00::5")]);
        let have = vec![kernel_peer(PUBKEY, "fd00::5")];
        assert!(diff_peers(should, &have).is_empty());
    }

    #[test]
    fn test_changed_address_emits_update() {
        let should = desired_peers(&[access_peer("alice", PUBKEY, "fd00::6")]);
        let have = vec![kernel_peer(PUBKEY, "fd00::5")];
        let ops = diff_peers(should, &have);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].public_key().to_base64(), PUBKEY);
    }

    #[test]
    fn test_changed_psk_emits_update() {
        let mut peer = access_peer("alice", PUBKEY, "fd00::5");
        peer.spec.pre_shared_key = Some(Key::generate_preshared().to_base64());
        let should = desired_peers(&[peer]);
        let have = vec![kernel_peer(PUBKEY, "fd00::5")];
        assert_eq!(diff_peers(should, &have).len(), 1);
    }

    #[test]
    fn test_unknown_kernel_peer_removed() {
        let ops = diff_peers(HashMap::new(), &[kernel_peer(PUBKEY, "fd00::5")]);
        assert_eq!(ops.len(), 1);
    }

    #[test]
    fn test_new_peer_added() {
        let should = desired_peers(&[access_peer("alice", PUBKEY, "fd00::5")]);
        let ops = diff_peers(should, &[]);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].public_key().to_base64(), PUBKEY);
    }

    #[test]
    fn test_invalid_public_key_skipped() {
        let bad = access_peer("mallory", "not-a-key", "fd00::7");
        let good = access_peer("alice", PUBKEY, "fd00::5");
        let should = desired_peers(&[bad, good]);
        assert_eq!(should.len(), 1);
        assert!(should.contains_key(PUBKEY));
    }

    #[test]
    fn test_peer_without_status_skipped() {
        let mut peer = access_peer("pending", PUBKEY, "fd00::5");
        peer.status = None;
        assert!(desired_peers(&[peer]).is_empty());
    }

    #[test]
    fn test_ipv4_peer_gets_32_prefix() {
        let should = desired_peers(&[access_peer("alice", PUBKEY, "10.66.0.5")]);
        let desired = &should[PUBKEY];
        assert_eq!(desired.allowed_ips.len(), 1);
        assert_eq!(desired.allowed_ips[0].cidr, 32);
    }

    #[test]
    fn test_diff_is_idempotent() {
        // a second pass over the state the first pass produces is a no-op
        let should = desired_peers(&[access_peer("alice", PUBKEY, "fd00::5")]);
        let ops = diff_peers(should.clone(), &[]);
        let have: Vec<PeerInfo> = ops
            .into_iter()
            .map(|op| PeerInfo {
                config: op.into_peer_config(),
                stats: Default::default(),
            })
            .collect();
        assert!(diff_peers(should, &have).is_empty());
    }
}
