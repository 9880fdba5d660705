//! Outbound cluster-client links: one `wgc-<name>` WireGuard interface per
//! cluster client that references this node, dialing back into a configured
//! server.
//!
//! Key material is materialized exactly once per node. Inline keys are moved
//! into the secret store and scrubbed from spec; missing secrets are created
//! with a freshly generated key. The derived public key is published through
//! status so the server side can admit the node.

use crate::{
    error::{Error, Result},
    wgc_node_label, wgc_secret_name, RECONCILE_DEADLINE, WGC_FAILED, WGC_LINK_PREFIX, WGC_READY,
};
use futures::StreamExt;
use ipnet::IpNet;
use k8s_openapi::api::core::v1::{Node, Secret};
use kube::{
    api::{Api, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    runtime::{
        controller::{Action, Controller},
        watcher,
    },
    Client,
};
use serde_json::json;
use shared::{
    parse_address, pod_namespace,
    resources::{
        SecretRef, WireguardClusterClient, WireguardClusterClientNode,
        WireguardClusterClientStatusNode,
    },
    Endpoint, SECRET_PRIVATE_KEY,
};
use std::{collections::HashMap, env, sync::Arc};
use tokio::time::timeout;
use wireguard_control::{Backend, Device, DeviceUpdate, InterfaceName, Key, PeerConfigBuilder};

#[cfg(target_os = "linux")]
use shared::netlink;

struct WgcCtx {
    client: Client,
    node_name: String,
}

/// Fully resolved desired state of one outbound link on this node.
struct DesiredLink {
    name: String,
    address: IpNet,
    private_key: Key,
    server_public_key: Key,
    server_endpoint: Endpoint,
    preshared_key: Option<Key>,
    routes: Vec<IpNet>,
    persistent_keepalive: Option<u16>,
}

/// Run the cluster-client reconciler until shutdown.
pub async fn run_cluster_clients(client: Client) -> Result<()> {
    let node_name = env::var("NODE_NAME")
        .ok()
        .filter(|name| !name.is_empty())
        .ok_or(Error::MissingEnv("NODE_NAME"))?;

    let ctx = Arc::new(WgcCtx {
        client: client.clone(),
        node_name,
    });

    Controller::new(
        Api::<WireguardClusterClient>::all(client),
        watcher::Config::default(),
    )
    .shutdown_on_signal()
    .run(reconcile, error_policy, ctx)
    .for_each(|result| async move {
        match result {
            Ok((obj, _)) => log::debug!("reconciled cluster client {}", obj.name),
            Err(e) => log::warn!("cluster client controller error: {}", e),
        }
    })
    .await;

    Ok(())
}

async fn reconcile(wgc: Arc<WireguardClusterClient>, ctx: Arc<WgcCtx>) -> Result<Action> {
    let name = wgc.name_any();
    log::info!("reconciling cluster client {}", name);

    let result = match timeout(RECONCILE_DEADLINE, sync_node(&ctx)).await {
        Ok(result) => result,
        Err(_) => Err(Error::DeadlineExceeded),
    };

    // advisory label for schedulers; a patch failure must not mask the sync
    // outcome
    let value = if result.is_ok() { WGC_READY } else { WGC_FAILED };
    let nodes: Api<Node> = Api::all(ctx.client.clone());
    let patch = json!({
        "metadata": { "labels": { (wgc_node_label(&name)): value } }
    });
    if let Err(e) = nodes
        .patch(&ctx.node_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        log::warn!("cannot update node label for {}: {}", name, e);
    }

    result.map(|_| Action::await_change())
}

fn error_policy(wgc: Arc<WireguardClusterClient>, error: &Error, _ctx: Arc<WgcCtx>) -> Action {
    log::warn!("reconcile of cluster client {} failed: {}", wgc.name_any(), error);
    Action::requeue(std::time::Duration::from_secs(5))
}

/// Walk every cluster client, materialize keys for entries naming this node
/// and drive the kernel links to match. Clients that never mention this node
/// are skipped.
async fn sync_node(ctx: &WgcCtx) -> Result<()> {
    let api: Api<WireguardClusterClient> = Api::all(ctx.client.clone());
    let mut desired = vec![];

    for wgc in api.list(&Default::default()).await?.items {
        let name = wgc.name_any();
        let node = match wgc.spec.nodes.iter().find(|n| n.node_name == ctx.node_name) {
            Some(node) => node.clone(),
            None => {
                log::debug!("cluster client {} does not reference node {}", name, ctx.node_name);
                continue;
            },
        };

        desired.push(resolve_link(ctx, &api, &wgc, node).await?);
    }

    sync_links(&desired)
}

async fn resolve_link(
    ctx: &WgcCtx,
    api: &Api<WireguardClusterClient>,
    wgc: &WireguardClusterClient,
    node: WireguardClusterClientNode,
) -> Result<DesiredLink> {
    let name = wgc.name_any();
    let private_key = materialize_key(ctx, api, wgc, &node).await?;

    publish_public_key(api, wgc, &ctx.node_name, &private_key).await?;

    let address = parse_address(&wgc.spec.address)
        .map_err(|_| Error::parse("cluster client address", &wgc.spec.address))?;

    let server_public_key = Key::from_base64(&wgc.spec.server.public_key)
        .map_err(|_| Error::InvalidKey(format!("{name} server public key")))?;

    let server_endpoint: Endpoint = wgc
        .spec
        .server
        .endpoint
        .parse()
        .map_err(|_| Error::parse("server endpoint", &wgc.spec.server.endpoint))?;

    let preshared_key = match node.pre_shared_key.as_deref() {
        Some(psk) if !psk.is_empty() => Some(
            Key::from_base64(psk)
                .map_err(|_| Error::InvalidKey(format!("{name} preshared key")))?,
        ),
        _ => None,
    };

    let mut routes = vec![];
    for route in &wgc.spec.routes {
        let net: IpNet = route
            .parse()
            .map_err(|_| Error::parse("route", route))?;
        routes.push(net.trunc());
    }

    Ok(DesiredLink {
        name,
        address,
        private_key,
        server_public_key,
        server_endpoint,
        preshared_key,
        routes,
        persistent_keepalive: wgc.spec.persistent_keepalive,
    })
}

/// Resolve this node's private key, creating or backfilling the secret as
/// needed. Spec mutations (scrubbed inline value, defaulted secret ref) are
/// written back before the key is used.
async fn materialize_key(
    ctx: &WgcCtx,
    api: &Api<WireguardClusterClient>,
    wgc: &WireguardClusterClient,
    node: &WireguardClusterClientNode,
) -> Result<Key> {
    let name = wgc.name_any();

    let reference = node.private_key.secret_ref.clone().unwrap_or_default();
    let namespace = reference
        .namespace
        .clone()
        .filter(|ns| !ns.is_empty())
        .unwrap_or_else(pod_namespace);
    let secret_name = reference
        .name
        .clone()
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| wgc_secret_name(&name, &ctx.node_name));
    let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);

    let resolved_ref = SecretRef {
        name: Some(secret_name.clone()),
        namespace: Some(namespace.clone()),
    };

    if let Some(value) = node.private_key.value.clone() {
        // inline key: persist it, then scrub it from spec
        let key = Key::from_base64(value.trim())
            .map_err(|_| Error::InvalidKey(format!("{name} node private key")))?;
        if secrets.get_opt(&secret_name).await?.is_none() {
            create_key_secret(&secrets, &namespace, &secret_name, value.trim()).await?;
        }
        update_node_key_ref(api, wgc, &ctx.node_name, resolved_ref).await?;
        return Ok(key);
    }

    let key = match secrets.get_opt(&secret_name).await? {
        Some(secret) => secret_key(&secret, &name)?,
        None => {
            let key = Key::generate_private();
            create_key_secret(&secrets, &namespace, &secret_name, &key.to_base64()).await?;
            key
        },
    };

    if node.private_key.secret_ref.as_ref() != Some(&resolved_ref) {
        update_node_key_ref(api, wgc, &ctx.node_name, resolved_ref).await?;
    }

    Ok(key)
}

fn secret_key(secret: &Secret, client_name: &str) -> Result<Key> {
    let data = secret
        .data
        .as_ref()
        .and_then(|data| data.get(SECRET_PRIVATE_KEY))
        .ok_or_else(|| Error::InvalidKey(format!("{client_name} secret is missing a key")))?;
    let text = std::str::from_utf8(&data.0)
        .map_err(|_| Error::InvalidKey(format!("{client_name} secret key")))?;
    Key::from_base64(text.trim()).map_err(|_| Error::InvalidKey(format!("{client_name} secret key")))
}

async fn create_key_secret(
    secrets: &Api<Secret>,
    namespace: &str,
    name: &str,
    key: &str,
) -> Result<()> {
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        string_data: Some([(SECRET_PRIVATE_KEY.to_string(), key.to_string())].into()),
        ..Default::default()
    };
    secrets.create(&PostParams::default(), &secret).await?;
    log::info!("created secret {}/{}", namespace, name);
    Ok(())
}

/// Point the node's spec entry at its secret and drop any inline key.
async fn update_node_key_ref(
    api: &Api<WireguardClusterClient>,
    wgc: &WireguardClusterClient,
    node_name: &str,
    reference: SecretRef,
) -> Result<()> {
    let mut updated = wgc.clone();
    let entry = updated
        .spec
        .nodes
        .iter_mut()
        .find(|n| n.node_name == node_name)
        .expect("caller located this node entry");
    entry.private_key.value = None;
    entry.private_key.secret_ref = Some(reference);
    updated.metadata.managed_fields = None;

    log::info!("updating cluster client {}", wgc.name_any());
    api.replace(&wgc.name_any(), &PostParams::default(), &updated)
        .await?;
    Ok(())
}

async fn publish_public_key(
    api: &Api<WireguardClusterClient>,
    wgc: &WireguardClusterClient,
    node_name: &str,
    private_key: &Key,
) -> Result<()> {
    let public_key = private_key.get_public().to_base64();
    let mut nodes = wgc.status.clone().unwrap_or_default().nodes;

    match nodes.iter_mut().find(|n| n.node_name == node_name) {
        Some(entry) if entry.public_key == public_key => return Ok(()),
        Some(entry) => entry.public_key = public_key,
        None => nodes.push(WireguardClusterClientStatusNode {
            node_name: node_name.to_string(),
            public_key,
        }),
    }

    api.patch_status(
        &wgc.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({ "status": { "nodes": nodes } })),
    )
    .await?;
    Ok(())
}

/// Drive the kernel's `wgc-*` links to exactly the desired set: create and
/// configure what's missing, converge addresses and routes, delete leftovers.
#[cfg(target_os = "linux")]
fn sync_links(desired: &[DesiredLink]) -> Result<()> {
    let mut leftovers: HashMap<String, InterfaceName> = Device::list(Backend::Kernel)?
        .into_iter()
        .filter(|iface| iface.as_str_lossy().starts_with(WGC_LINK_PREFIX))
        .map(|iface| (iface.as_str_lossy().into_owned(), iface))
        .collect();

    for link in desired {
        let ifname = format!("{}{}", WGC_LINK_PREFIX, link.name);
        let iface: InterfaceName = ifname
            .parse()
            .map_err(|_| Error::parse("interface name", &ifname))?;

        if leftovers.remove(&ifname).is_none() {
            netlink::create_wireguard_link(&iface)?;
        }

        let mut peer = PeerConfigBuilder::new(&link.server_public_key)
            .replace_allowed_ips()
            .set_endpoint(link.server_endpoint.resolve()?);
        for route in &link.routes {
            peer = peer.add_allowed_ip(route.network(), route.prefix_len());
        }
        if let Some(psk) = &link.preshared_key {
            peer = peer.set_preshared_key(psk.clone());
        }
        if let Some(keepalive) = link.persistent_keepalive {
            peer = peer.set_persistent_keepalive_interval(keepalive);
        }

        DeviceUpdate::new()
            .set_private_key(link.private_key.clone())
            .add_peer(peer)
            .apply(&iface, Backend::Kernel)?;

        netlink::set_up(&iface)?;

        log::info!("syncing cluster client {} (address {})", link.name, link.address);
        netlink::replace_address(&iface, link.address)?;
        for (message, net) in netlink::list_addresses(&iface)? {
            if net != link.address {
                log::info!("deleting old address {} on {}", net, ifname);
                netlink::delete_address(message)?;
            }
        }

        for route in &link.routes {
            netlink::replace_route(&iface, *route)?;
        }
        for (message, net) in netlink::list_routes(&iface)? {
            if !link.routes.contains(&net) {
                log::info!("deleting old route {} on {}", net, ifname);
                netlink::delete_route(message)?;
            }
        }
    }

    for (name, iface) in leftovers {
        log::info!("deleting old link {}", name);
        if let Err(e) = Device::get(&iface, Backend::Kernel).and_then(Device::delete) {
            log::error!("error deleting old link {}: {}", name, e);
            return Err(e.into());
        }
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn sync_links(_desired: &[DesiredLink]) -> Result<()> {
    Err(Error::Io(std::io::Error::other(
        "cluster client links require a linux kernel",
    )))
}
