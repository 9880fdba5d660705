//! `wga peer` subcommands: mint keys, create the resource, wait for the
//! gateway to assign an address, and print the resulting client config.

use anyhow::{anyhow, bail, Context, Error};
use futures::TryStreamExt;
use kube::{
    api::{Api, PostParams, ResourceExt},
    runtime::{watcher, WatchStreamExt},
    Client,
};
use shared::{
    parse_address,
    resources::{
        WireguardAccessPeer, WireguardAccessPeerSpec, WireguardAccessPeerStatus,
        WireguardAccessPeerStatusPeer, WireguardClusterClientNode,
        WireguardClusterClientPrivateKey, WireguardClusterClientServer,
        WireguardClusterClientSpec,
    },
    wg_config::{WgConfig, WgInterface, WgPeer},
    API_VERSION,
};
use std::pin::pin;
use wireguard_control::{Key, KeyPair};

/// Fallback resolvers printed into configs when the gateway publishes none.
const DEFAULT_DNS: [&str; 2] = ["1.1.1.1", "2606:4700:4700::1111"];

pub async fn add(name: &str, rules: Vec<String>) -> Result<(), Error> {
    let client = Client::try_default().await?;

    let keypair = KeyPair::generate();
    let psk = Key::generate_preshared();

    create_peer(&client, name, &keypair.public, Some(&psk), rules).await?;
    let peer = wait_for_status(&client, name).await?;

    let config = peer_config(&peer, &keypair, &psk)?;
    println!("{config}");
    Ok(())
}

pub async fn wgc(name: &str, nodes: &[String]) -> Result<(), Error> {
    let client = Client::try_default().await?;

    let mut spec_nodes = vec![];
    let mut first_status: Option<WireguardAccessPeerStatus> = None;

    for node in nodes {
        let keypair = KeyPair::generate();
        let peer_name = format!("{name}-{node}");

        create_peer(&client, &peer_name, &keypair.public, None, vec![]).await?;
        let populated = wait_for_status(&client, &peer_name).await?;

        spec_nodes.push(WireguardClusterClientNode {
            node_name: node.clone(),
            pre_shared_key: None,
            private_key: WireguardClusterClientPrivateKey {
                value: Some(keypair.private.to_base64()),
                secret_ref: None,
            },
        });
        if first_status.is_none() {
            first_status = populated.status;
        }
    }

    let status = first_status.ok_or_else(|| anyhow!("no nodes given"))?;
    let upstream = status
        .peers
        .first()
        .ok_or_else(|| anyhow!("assigned status carries no gateway entry"))?;

    let manifest = wgc_manifest(name, status.address.clone(), upstream, spec_nodes);
    print!("{}", serde_yaml::to_string(&manifest)?);
    Ok(())
}

async fn create_peer(
    client: &Client,
    name: &str,
    public_key: &Key,
    psk: Option<&Key>,
    access_rules: Vec<String>,
) -> Result<WireguardAccessPeer, Error> {
    let api: Api<WireguardAccessPeer> = Api::all(client.clone());
    let peer = WireguardAccessPeer::new(
        name,
        WireguardAccessPeerSpec {
            pre_shared_key: psk.map(Key::to_base64),
            public_key: public_key.to_base64(),
            access_rules,
        },
    );
    api.create(&PostParams::default(), &peer)
        .await
        .with_context(|| format!("cannot create peer {name}"))
}

/// Block until the gateway has populated the peer's status.
async fn wait_for_status(client: &Client, name: &str) -> Result<WireguardAccessPeer, Error> {
    let api: Api<WireguardAccessPeer> = Api::all(client.clone());
    let config = watcher::Config::default().fields(&format!("metadata.name={name}"));

    let mut stream = pin!(watcher(api, config).applied_objects());
    while let Some(peer) = stream.try_next().await? {
        match &peer.status {
            Some(status) if !status.address.is_empty() => return Ok(peer),
            _ => {},
        }
    }

    bail!("watch for peer {name} ended before a status was assigned; is the gateway running?")
}

fn peer_config(
    peer: &WireguardAccessPeer,
    keypair: &KeyPair,
    psk: &Key,
) -> Result<WgConfig, Error> {
    let status = peer
        .status
        .as_ref()
        .ok_or_else(|| anyhow!("peer has no status"))?;

    let address = parse_address(&status.address)
        .map_err(|e| anyhow!("cannot parse assigned address {:?}: {}", status.address, e))?;

    let dns = if status.dns.is_empty() {
        DEFAULT_DNS.iter().map(|d| d.parse().unwrap()).collect()
    } else {
        status
            .dns
            .iter()
            .map(|d| d.parse().with_context(|| format!("cannot parse dns server {d:?}")))
            .collect::<Result<_, _>>()?
    };

    let mut peers = vec![];
    for upstream in &status.peers {
        peers.push(upstream_peer(upstream, psk)?);
    }

    Ok(WgConfig {
        interface: WgInterface {
            private_key: keypair.private.to_base64(),
            address: Some(address),
            dns,
            listen_port: None,
        },
        peers,
    })
}

fn upstream_peer(upstream: &WireguardAccessPeerStatusPeer, psk: &Key) -> Result<WgPeer, Error> {
    let mut allowed_ips = vec![];
    for ip in &upstream.allowed_ips {
        allowed_ips.push(
            ip.parse()
                .with_context(|| format!("cannot parse allowed ip {ip:?}"))?,
        );
    }

    Ok(WgPeer {
        endpoint: upstream
            .endpoint
            .parse()
            .map_err(|e| anyhow!("cannot parse endpoint {:?}: {}", upstream.endpoint, e))?,
        public_key: upstream.public_key.clone(),
        preshared_key: upstream
            .pre_shared_key
            .clone()
            .or_else(|| Some(psk.to_base64())),
        allowed_ips,
        persistent_keepalive: Some(60),
    })
}

/// Typed resources serialize without their apiVersion/kind, so the manifest
/// attaches them explicitly.
fn wgc_manifest(
    name: &str,
    address: String,
    upstream: &WireguardAccessPeerStatusPeer,
    nodes: Vec<WireguardClusterClientNode>,
) -> serde_json::Value {
    let spec = WireguardClusterClientSpec {
        address,
        nodes,
        server: WireguardClusterClientServer {
            endpoint: upstream.endpoint.clone(),
            public_key: upstream.public_key.clone(),
        },
        routes: upstream.allowed_ips.clone(),
        persistent_keepalive: None,
    };

    serde_json::json!({
        "apiVersion": API_VERSION,
        "kind": "WireguardClusterClient",
        "metadata": { "name": name },
        "spec": spec,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn populated_peer() -> WireguardAccessPeer {
        let mut peer = WireguardAccessPeer::new(
            "alice",
            WireguardAccessPeerSpec {
                pre_shared_key: None,
                public_key: "4CNZorWVtohO64n6AAaH/JyFjIIgBFrfJK2SGtKjzEE=".into(),
                access_rules: vec!["office".into()],
            },
        );
        peer.status = Some(WireguardAccessPeerStatus {
            last_updated: "2026-08-01T00:00:00Z".into(),
            address: "fd00::5".into(),
            dns: vec!["1.1.1.1".into()],
            peers: vec![WireguardAccessPeerStatusPeer {
                public_key: "2kYJdyRGVZOwOgJfNlFxjgqNpiI1KJx/Q50H2EIwRS0=".into(),
                endpoint: "gw.example.com:51820".into(),
                pre_shared_key: None,
                allowed_ips: vec!["2001:db8::/64".into()],
            }],
        });
        peer
    }

    #[test]
    fn test_peer_config_round_trips() {
        let keypair = KeyPair::generate();
        let psk = Key::generate_preshared();
        let config = peer_config(&populated_peer(), &keypair, &psk).unwrap();

        assert_eq!(config.interface.address.unwrap().to_string(), "fd00::5/128");
        assert_eq!(config.peers[0].preshared_key.as_deref(), Some(psk.to_base64().as_str()));

        let text = config.to_string();
        let parsed: WgConfig = text.parse().unwrap();
        assert_eq!(parsed.to_string(), text);
    }

    #[test]
    fn test_peer_config_requires_status() {
        let mut peer = populated_peer();
        peer.status = None;
        let keypair = KeyPair::generate();
        let psk = Key::generate_preshared();
        assert!(peer_config(&peer, &keypair, &psk).is_err());
    }

    #[test]
    fn test_wgc_manifest_round_trips() {
        let peer = populated_peer();
        let status = peer.status.as_ref().unwrap();
        let nodes = vec![WireguardClusterClientNode {
            node_name: "node-a".into(),
            pre_shared_key: None,
            private_key: WireguardClusterClientPrivateKey {
                value: Some(KeyPair::generate().private.to_base64()),
                secret_ref: None,
            },
        }];

        let manifest = wgc_manifest("web", status.address.clone(), &status.peers[0], nodes);
        assert_eq!(manifest["apiVersion"], API_VERSION);
        assert_eq!(manifest["kind"], "WireguardClusterClient");

        let yaml = serde_yaml::to_string(&manifest).unwrap();
        let back: serde_json::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, manifest);

        let spec: WireguardClusterClientSpec =
            serde_json::from_value(manifest["spec"].clone()).unwrap();
        assert_eq!(spec.server.endpoint, "gw.example.com:51820");
        assert_eq!(spec.routes, vec!["2001:db8::/64".to_string()]);
    }
}
