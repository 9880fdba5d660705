//! The gateway reconcilers: peer status assignment, rule-triggered resyncs,
//! and the single full-sync path every event funnels into.

use crate::{
    config::EpConfig,
    error::{Error, Result},
    ipam, lbc, nft, wg, Ctx, DEVICE_NAME, FORCE_REFRESH_LABEL, RECONCILE_DEADLINE,
};
use futures::StreamExt;
use k8s_openapi::chrono::{SecondsFormat, Utc};
use kube::{
    api::{Api, Patch, PatchParams, ResourceExt},
    runtime::{
        controller::{Action, Controller},
        watcher,
    },
    Client,
};
use serde_json::json;
use shared::{
    join_host_port,
    resources::{
        WireguardAccessPeer, WireguardAccessPeerStatus, WireguardAccessPeerStatusPeer,
        WireguardAccessRule,
    },
};
use std::{sync::Arc, time::SystemTime};
use tokio::time::timeout;

/// Everything the data plane is reconciled against.
pub struct Desired {
    pub peers: Vec<WireguardAccessPeer>,
    pub rules: Vec<WireguardAccessRule>,
}

impl Desired {
    pub async fn fetch(client: &Client) -> Result<Self> {
        let peers: Api<WireguardAccessPeer> = Api::all(client.clone());
        let rules: Api<WireguardAccessRule> = Api::all(client.clone());
        Ok(Self {
            peers: peers.list(&Default::default()).await?.items,
            rules: rules.list(&Default::default()).await?.items,
        })
    }
}

/// The authoritative convergence path. Per-event handlers only seed status;
/// this lists the full desired state, diffs the device peer set, rebuilds
/// the ingress chain and re-asserts forwarding. Running it twice against the
/// same state is a no-op.
pub async fn full_sync(ctx: &Ctx) -> Result<()> {
    let desired = Desired::fetch(&ctx.client).await?;

    log::debug!("syncing wg");
    wg::sync_device(&desired.peers)?;

    log::debug!("syncing nft");
    nft::sync_rules(&desired.peers, &desired.rules, DEVICE_NAME);

    log::debug!("syncing sysctl");
    nft::ensure_forwarding();

    Ok(())
}

async fn reconcile_peer(peer: Arc<WireguardAccessPeer>, ctx: Arc<Ctx>) -> Result<Action> {
    let name = peer.name_any();
    timeout(RECONCILE_DEADLINE, reconcile_peer_inner(&name, &ctx))
        .await
        .map_err(|_| Error::DeadlineExceeded)?
}

async fn reconcile_peer_inner(name: &str, ctx: &Ctx) -> Result<Action> {
    let api: Api<WireguardAccessPeer> = Api::all(ctx.client.clone());

    let peer = match api.get_opt(name).await? {
        Some(peer) => peer,
        None => {
            // deletion: the peer disappears from the device and the chain
            // simply by being absent from the desired set
            full_sync(ctx).await?;
            return Ok(Action::await_change());
        },
    };

    let force = peer
        .labels()
        .get(FORCE_REFRESH_LABEL)
        .map(|v| v == "true")
        .unwrap_or(false);
    let unassigned = peer
        .status
        .as_ref()
        .map(|status| status.address.is_empty())
        .unwrap_or(true);

    if unassigned || force {
        assign_status(&api, &peer, ctx, force).await?;
    }

    full_sync(ctx).await?;
    Ok(Action::await_change())
}

/// Draw an address and publish the peer's status. The address is one-shot:
/// once set it is never reassigned unless the force-refresh label asks for
/// it.
async fn assign_status(
    api: &Api<WireguardAccessPeer>,
    peer: &WireguardAccessPeer,
    ctx: &Ctx,
    force: bool,
) -> Result<()> {
    let name = peer.name_any();
    log::info!("setting peer status for {}", name);

    let gateway = wg::gateway();
    let mask_bits = ipam::host_bits(&ctx.config.client_cidr);
    let index = ipam::generate_index(SystemTime::now(), mask_bits);
    let address = ipam::host_from_index(&ctx.config.client_cidr, index).to_string();

    // a clash fails the reconcile so the requeued pass draws a new index
    for other in api.list(&Default::default()).await?.items {
        if other.name_any() == name {
            continue;
        }
        if let Some(status) = &other.status {
            if status.address == address {
                return Err(Error::AddressCollision(address));
            }
        }
    }

    if force {
        api.patch(
            &name,
            &PatchParams::default(),
            &Patch::Merge(json!({
                "metadata": { "labels": { (FORCE_REFRESH_LABEL): null } }
            })),
        )
        .await?;
    }

    let status = WireguardAccessPeerStatus {
        last_updated: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        address,
        dns: ctx.config.dns_servers.iter().map(|d| d.to_string()).collect(),
        peers: vec![WireguardAccessPeerStatusPeer {
            public_key: gateway.public_key.to_base64(),
            endpoint: join_host_port(&ctx.config.server_address, gateway.listen_port),
            pre_shared_key: None,
            allowed_ips: ctx.config.service_cidrs.iter().map(|n| n.to_string()).collect(),
        }],
    };

    api.patch_status(
        &name,
        &PatchParams::default(),
        &Patch::Merge(json!({ "status": status })),
    )
    .await?;

    Ok(())
}

async fn reconcile_rule(rule: Arc<WireguardAccessRule>, ctx: Arc<Ctx>) -> Result<Action> {
    log::info!("reconciling rule {}", rule.name_any());
    timeout(RECONCILE_DEADLINE, full_sync(&ctx))
        .await
        .map_err(|_| Error::DeadlineExceeded)??;
    Ok(Action::await_change())
}

fn error_policy<K: ResourceExt>(obj: Arc<K>, error: &Error, _ctx: Arc<Ctx>) -> Action {
    log::warn!("reconcile of {} failed: {}", obj.name_any(), error);
    Action::requeue(std::time::Duration::from_secs(5))
}

/// Run the gateway reconciler set (peers, rules, load balancers) until
/// shutdown. The device is brought up before any watcher starts so status
/// assignment always has a key and listen port to publish.
pub async fn run_gateway(client: Client, config: EpConfig) -> Result<()> {
    wg::init(&config)?;

    let ctx = Arc::new(Ctx {
        client: client.clone(),
        config,
    });

    let peers = Controller::new(
        Api::<WireguardAccessPeer>::all(client.clone()),
        watcher::Config::default(),
    )
    .shutdown_on_signal()
    .run(reconcile_peer, error_policy, ctx.clone())
    .for_each(|result| async move {
        match result {
            Ok((obj, _)) => log::debug!("reconciled peer {}", obj.name),
            Err(e) => log::warn!("peer controller error: {}", e),
        }
    });

    let rules = Controller::new(
        Api::<WireguardAccessRule>::all(client.clone()),
        watcher::Config::default(),
    )
    .shutdown_on_signal()
    .run(reconcile_rule, error_policy, ctx.clone())
    .for_each(|result| async move {
        match result {
            Ok((obj, _)) => log::debug!("reconciled rule {}", obj.name),
            Err(e) => log::warn!("rule controller error: {}", e),
        }
    });

    let services = lbc::run(client, ctx.clone());

    tokio::join!(peers, rules, services);
    Ok(())
}
