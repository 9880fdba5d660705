//! Ingress IP assignment for intranet LoadBalancer services.
//!
//! Services opting into the `wga.kraudcloud.com/intranet` class get an IP
//! from the service pool without dragging in a full cilium/kube-vip/metallb
//! setup. IPs either come from the loadBalancerIPs annotation or are drawn
//! from the first configured service CIDR.

use crate::{
    error::{Error, Result},
    ipam, Ctx, LOAD_BALANCER_CLASS, LOAD_BALANCER_IPS_ANNOTATION, RECONCILE_DEADLINE,
};
use futures::StreamExt;
use k8s_openapi::{
    api::core::v1::{LoadBalancerIngress, PortStatus, Service},
    apimachinery::pkg::apis::meta::v1::{Condition, Time},
    chrono::Utc,
};
use kube::{
    api::{Api, Patch, PatchParams, ResourceExt},
    runtime::{
        controller::{Action, Controller},
        watcher,
    },
    Client,
};
use serde_json::json;
use std::{net::IpAddr, sync::Arc, time::SystemTime};
use tokio::time::timeout;

const CONDITION_ACTIVE: &str = "Active";
const CONDITION_FAILED: &str = "Failed";
const REASON_READY: &str = "LoadBalancerReady";
const REASON_INVALID_IP: &str = "InvalidLoadBalancerIP";

fn wants_ingress(svc: &Service) -> bool {
    let spec = match &svc.spec {
        Some(spec) => spec,
        None => return false,
    };
    spec.type_.as_deref() == Some("LoadBalancer")
        && spec.load_balancer_class.as_deref() == Some(LOAD_BALANCER_CLASS)
        && !has_ingress(svc)
}

fn has_ingress(svc: &Service) -> bool {
    claimed_ips(svc).next().is_some()
}

fn claimed_ips(svc: &Service) -> impl Iterator<Item = &str> {
    svc.status
        .iter()
        .filter_map(|status| status.load_balancer.as_ref())
        .filter_map(|lb| lb.ingress.as_ref())
        .flatten()
        .filter_map(|ingress| ingress.ip.as_deref())
        .filter(|ip| !ip.is_empty())
}

/// Replace-or-append a condition by type. An already-identical condition is
/// left exactly as it is, timestamp included, and `None` is returned: the
/// caller skips the patch, the server sees no change, and no new watch event
/// re-drives the reconciler. Re-stamping here would turn a terminal failure
/// into a hot loop.
fn upsert_condition(
    svc: &Service,
    type_: &str,
    reason: &str,
    message: &str,
) -> Option<Vec<Condition>> {
    let mut conditions = svc
        .status
        .as_ref()
        .and_then(|status| status.conditions.clone())
        .unwrap_or_default();

    if conditions.iter().any(|condition| {
        condition.type_ == type_
            && condition.status == "True"
            && condition.reason == reason
            && condition.message == message
    }) {
        return None;
    }

    conditions.retain(|condition| condition.type_ != type_);
    conditions.push(Condition {
        last_transition_time: Time(Utc::now()),
        message: message.to_string(),
        observed_generation: svc.metadata.generation,
        reason: reason.to_string(),
        status: "True".to_string(),
        type_: type_.to_string(),
    });
    Some(conditions)
}

/// Record a terminal failure on the service. Idempotent: once the condition
/// is in place, repeat calls write nothing.
async fn set_failed_condition(
    api: &Api<Service>,
    svc: &Service,
    message: &str,
) -> Result<()> {
    let conditions = match upsert_condition(svc, CONDITION_FAILED, REASON_INVALID_IP, message) {
        Some(conditions) => conditions,
        None => return Ok(()),
    };
    api.patch_status(
        &svc.name_any(),
        &PatchParams::default(),
        &Patch::Merge(json!({ "status": { "conditions": conditions } })),
    )
    .await?;
    Ok(())
}

async fn reconcile(svc: Arc<Service>, ctx: Arc<Ctx>) -> Result<Action> {
    if !wants_ingress(&svc) {
        return Ok(Action::await_change());
    }
    timeout(RECONCILE_DEADLINE, assign(&svc, &ctx))
        .await
        .map_err(|_| Error::DeadlineExceeded)??;
    Ok(Action::await_change())
}

async fn assign(svc: &Service, ctx: &Ctx) -> Result<()> {
    let name = svc.name_any();
    let namespace = svc.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);

    log::info!("assigning ip to service {}/{}", namespace, name);

    let requested = svc.annotations().get(LOAD_BALANCER_IPS_ANNOTATION);
    let (ips, user_specified) = match requested {
        Some(raw) => {
            let mut ips: Vec<IpAddr> = vec![];
            for entry in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                match entry.parse() {
                    Ok(ip) => ips.push(ip),
                    Err(_) => {
                        // user error; nothing to retry until the spec changes
                        log::warn!(
                            "service {}/{} requests unparseable ip {:?}",
                            namespace, name, entry
                        );
                        set_failed_condition(
                            &api,
                            svc,
                            &format!("cannot parse requested load balancer ip {entry:?}"),
                        )
                        .await?;
                        return Ok(());
                    },
                }
            }
            (ips, true)
        },
        None => {
            let pool = &ctx.config.service_cidrs[0];
            let index = ipam::generate_index(SystemTime::now(), ipam::host_bits(pool));
            (vec![ipam::host_from_index(pool, index)], false)
        },
    };

    // scan every service in the cluster for a competing claim
    let all: Api<Service> = Api::all(ctx.client.clone());
    for other in all.list(&Default::default()).await?.items {
        if other.uid() == svc.uid() {
            continue;
        }
        let clash = ips
            .iter()
            .find(|ip| claimed_ips(&other).any(|claimed| claimed == ip.to_string()));
        if let Some(ip) = clash {
            if user_specified {
                set_failed_condition(
                    &api,
                    svc,
                    &format!("requested load balancer ip {ip} is already in use"),
                )
                .await?;
                return Ok(());
            }
            // generated: fail the pass, the retry draws a new index
            return Err(Error::AddressCollision(ip.to_string()));
        }
    }

    let ports: Vec<PortStatus> = svc
        .spec
        .as_ref()
        .and_then(|spec| spec.ports.as_ref())
        .map(|ports| {
            ports
                .iter()
                .map(|port| PortStatus {
                    port: port.port,
                    protocol: port.protocol.clone().unwrap_or_else(|| "TCP".to_string()),
                    error: None,
                })
                .collect()
        })
        .unwrap_or_default();

    let ingress: Vec<LoadBalancerIngress> = ips
        .iter()
        .map(|ip| LoadBalancerIngress {
            ip: Some(ip.to_string()),
            ports: Some(ports.clone()),
            ..Default::default()
        })
        .collect();

    // the ingress write below changes status regardless, so a pre-existing
    // Active condition is simply carried over
    let conditions = upsert_condition(svc, CONDITION_ACTIVE, REASON_READY, "ingress ip assigned")
        .unwrap_or_else(|| {
            svc.status
                .as_ref()
                .and_then(|status| status.conditions.clone())
                .unwrap_or_default()
        });
    api.patch_status(
        &name,
        &PatchParams::default(),
        &Patch::Merge(json!({
            "status": {
                "loadBalancer": { "ingress": ingress },
                "conditions": conditions,
            }
        })),
    )
    .await?;

    Ok(())
}

fn error_policy(svc: Arc<Service>, error: &Error, _ctx: Arc<Ctx>) -> Action {
    log::warn!("reconcile of service {} failed: {}", svc.name_any(), error);
    Action::requeue(std::time::Duration::from_secs(5))
}

pub async fn run(client: Client, ctx: Arc<Ctx>) {
    Controller::new(Api::<Service>::all(client), watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _)) => log::debug!("reconciled service {}", obj.name),
                Err(e) => log::debug!("service controller error: {}", e),
            }
        })
        .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{LoadBalancerStatus, ServiceSpec, ServiceStatus};

    fn lb_service(class: Option<&str>, ingress_ip: Option<&str>) -> Service {
        Service {
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".to_string()),
                load_balancer_class: class.map(str::to_string),
                ..Default::default()
            }),
            status: ingress_ip.map(|ip| ServiceStatus {
                load_balancer: Some(LoadBalancerStatus {
                    ingress: Some(vec![LoadBalancerIngress {
                        ip: Some(ip.to_string()),
                        ..Default::default()
                    }]),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_wants_ingress() {
        assert!(wants_ingress(&lb_service(Some(LOAD_BALANCER_CLASS), None)));
        assert!(!wants_ingress(&lb_service(Some(LOAD_BALANCER_CLASS), Some("10.0.0.5"))));
        assert!(!wants_ingress(&lb_service(Some("other/class"), None)));
        assert!(!wants_ingress(&lb_service(None, None)));
    }

    #[test]
    fn test_claimed_ips() {
        let svc = lb_service(Some(LOAD_BALANCER_CLASS), Some("10.0.0.5"));
        assert_eq!(claimed_ips(&svc).collect::<Vec<_>>(), vec!["10.0.0.5"]);
        assert_eq!(claimed_ips(&lb_service(None, None)).count(), 0);
    }

    #[test]
    fn test_upsert_condition_replaces_by_type() {
        let mut svc = lb_service(Some(LOAD_BALANCER_CLASS), Some("10.0.0.5"));
        let first = upsert_condition(&svc, CONDITION_ACTIVE, REASON_READY, "one").unwrap();
        svc.status.as_mut().unwrap().conditions = Some(first);
        let second = upsert_condition(&svc, CONDITION_ACTIVE, REASON_READY, "two").unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message, "two");
    }

    #[test]
    fn test_upsert_condition_identical_is_a_noop() {
        let mut svc = lb_service(Some(LOAD_BALANCER_CLASS), Some("10.0.0.5"));
        let first = upsert_condition(&svc, CONDITION_FAILED, REASON_INVALID_IP, "bad ip").unwrap();
        svc.status.as_mut().unwrap().conditions = Some(first);
        // same type, reason and message: nothing to write, nothing re-stamped
        assert!(upsert_condition(&svc, CONDITION_FAILED, REASON_INVALID_IP, "bad ip").is_none());
        // a different message still replaces it
        assert!(upsert_condition(&svc, CONDITION_FAILED, REASON_INVALID_IP, "other ip").is_some());
    }
}
