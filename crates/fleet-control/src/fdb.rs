//! VXLAN forwarding-database propagation.
//!
//! When a NIC lands on host `H` of router `R`, two things must happen: `H`
//! learns every peer endpoint of `R` living elsewhere (the local rules), and
//! every host already carrying a peer of `R` learns the new NIC (the spread
//! rules). Both are computed from a single router query and go out as at
//! most two dispatches: one host-scoped, one group-scoped.

use std::collections::BTreeSet;

use fleet_core::{Address, FdbRule, HostId, NO_GATEWAY, Subnet, SubnetKind};
use fleet_exec::Target;
use fleet_store::{Endpoint, Nic};
use tracing::{debug, info};

use crate::context::HandlerCtx;
use crate::error::{Deferred, HandlerError, HandlerResult};

const ADD_SCRIPT: &str = "add_fwrule.sh";
const DEL_SCRIPT: &str = "del_fwrule.sh";

/// What a propagation or withdrawal computed and sent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FdbOutcome {
    pub local_rules: usize,
    pub spread_rules: usize,
    pub peer_hosts: Vec<HostId>,
    pub dispatches: usize,
}

fn rule(name: &str, mac: &str, address: &Address, subnet: &Subnet, outer_ip: &str) -> FdbRule {
    let gateway = if subnet.kind == SubnetKind::Vrrp {
        NO_GATEWAY.to_string()
    } else {
        subnet.gateway.clone()
    };
    FdbRule {
        instance: name.to_string(),
        vni: subnet.vlan,
        inner_ip: address.address.clone(),
        inner_mac: mac.to_string(),
        outer_ip: outer_ip.to_string(),
        gateway,
        router: subnet.router_id,
    }
}

/// Rules describing the changed NICs as seen from `outer_ip`. Public
/// subnets are routed, not tunnelled, and never appear.
fn own_rules(nics: &[Nic], outer_ip: &str) -> Vec<FdbRule> {
    nics.iter()
        .filter_map(|nic| {
            let (address, subnet) = nic.addressing()?;
            (!subnet.is_public()).then(|| {
                rule(
                    &nic.interface.name,
                    &nic.interface.mac_addr,
                    address,
                    subnet,
                    outer_ip,
                )
            })
        })
        .collect()
}

/// Peer endpoints of the router hosted elsewhere, and the set of hosts
/// carrying them. Hosts that are down or unknown are skipped.
fn peer_rules(endpoints: &[Endpoint], host: HostId) -> (Vec<FdbRule>, BTreeSet<HostId>) {
    let mut rules = Vec::new();
    let mut hosts = BTreeSet::new();
    for endpoint in endpoints {
        if endpoint.subnet.is_public() || endpoint.interface.hyper < 0 {
            continue;
        }
        let Some(peer) = endpoint.host.as_ref() else {
            continue;
        };
        if peer.hostid == host || !peer.is_up() {
            continue;
        }
        hosts.insert(peer.hostid);
        rules.push(rule(
            &endpoint.interface.name,
            &endpoint.interface.mac_addr,
            &endpoint.address,
            &endpoint.subnet,
            &peer.host_ip,
        ));
    }
    (rules, hosts)
}

fn group_label(ctx: &HandlerCtx<'_>, host: HostId) -> String {
    format!("{}-{host}", ctx.settings().fdb_group_prefix)
}

/// Install forwarding rules for `nics`, now hosted on `host`.
///
/// Classic (router 0) networking never propagates. Dispatch failures are
/// returned after both dispatches were attempted.
pub async fn propagate(
    ctx: &mut HandlerCtx<'_>,
    router_id: i64,
    host: HostId,
    nics: &[Nic],
) -> HandlerResult<FdbOutcome> {
    if router_id <= 0 {
        debug!(host, "Classic networking, no forwarding rules to send");
        return Ok(FdbOutcome::default());
    }
    if host < 0 {
        return Ok(FdbOutcome::default());
    }
    let hyper = ctx
        .tx
        .hyper(host)
        .await?
        .filter(|h| h.is_up())
        .ok_or_else(|| HandlerError::HostUnavailable(format!("hyper {host} is not up")))?;

    let spread = own_rules(nics, &hyper.host_ip);
    let endpoints = ctx.tx.router_endpoints(router_id, host).await?;
    let (local, peers) = peer_rules(&endpoints, host);

    let mut outcome = FdbOutcome {
        local_rules: local.len(),
        spread_rules: spread.len(),
        peer_hosts: peers.iter().copied().collect(),
        dispatches: 0,
    };
    let mut deferred = Deferred::new();

    if !spread.is_empty() && !peers.is_empty() {
        let target = Target::group(group_label(ctx, host), peers)?;
        let command = ctx.script(ADD_SCRIPT).payload(&spread)?;
        outcome.dispatches += 1;
        deferred.absorb(ctx.dispatch(&target, &command).await)?;
    }
    if !local.is_empty() {
        let target = Target::host(host)?;
        let command = ctx.script(ADD_SCRIPT).payload(&local)?;
        outcome.dispatches += 1;
        deferred.absorb(ctx.dispatch(&target, &command).await)?;
    }

    info!(
        router = router_id,
        host,
        local = outcome.local_rules,
        spread = outcome.spread_rules,
        peers = outcome.peer_hosts.len(),
        "Propagated forwarding rules"
    );
    deferred.finish(outcome)
}

/// Remove the forwarding rules of `nics`, leaving `host`, from every peer
/// host of the router. One group dispatch at most.
pub async fn withdraw(
    ctx: &mut HandlerCtx<'_>,
    router_id: i64,
    host: HostId,
    nics: &[Nic],
) -> HandlerResult<FdbOutcome> {
    if router_id <= 0 || host < 0 {
        return Ok(FdbOutcome::default());
    }
    let hyper = ctx
        .tx
        .hyper(host)
        .await?
        .ok_or_else(|| HandlerError::HostUnavailable(format!("hyper {host} is unknown")))?;

    let rules = own_rules(nics, &hyper.host_ip);
    let endpoints = ctx.tx.router_endpoints(router_id, host).await?;
    let (_, peers) = peer_rules(&endpoints, host);

    let mut outcome = FdbOutcome {
        local_rules: 0,
        spread_rules: rules.len(),
        peer_hosts: peers.iter().copied().collect(),
        dispatches: 0,
    };
    if rules.is_empty() || peers.is_empty() {
        return Ok(outcome);
    }
    let target = Target::group(group_label(ctx, host), peers)?;
    let command = ctx.script(DEL_SCRIPT).payload(&rules)?;
    outcome.dispatches = 1;
    ctx.dispatch(&target, &command).await?;
    info!(
        router = router_id,
        host,
        rules = outcome.spread_rules,
        peers = outcome.peer_hosts.len(),
        "Withdrew forwarding rules"
    );
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ControlSettings;
    use fleet_exec::RecordingGateway;
    use fleet_store::{MemoryStore, StateStore, fixture};

    /// Router 3 spans hosts 7, 9 and 11; host 13 is down.
    fn fleet() -> MemoryStore {
        fixture::fleet()
            .hyper(7, "10.1.0.7")
            .hyper(9, "10.1.0.9")
            .hyper(11, "10.1.0.11")
            .down_hyper(13, "10.1.0.13")
            .subnet(1, 5001, 3)
            .subnet(2, 5002, 3)
            .vrrp_subnet(4, 5004, 3)
            .public_subnet(5, 100)
            .subnet(6, 6001, 8)
            .instance(42, 3, 7)
            .nic(100, 42, 1, "172.16.1.10/24", true)
            .nic(101, 42, 5, "203.0.113.10/24", false)
            .instance(43, 3, 9)
            .nic(110, 43, 1, "172.16.1.11/24", true)
            .nic(111, 43, 2, "172.16.2.11/24", false)
            .instance(44, 3, 11)
            .nic(120, 44, 2, "172.16.2.12/24", true)
            .instance(45, 3, 13)
            .nic(130, 45, 1, "172.16.1.13/24", true)
            .instance(46, 8, 9)
            .nic(140, 46, 6, "172.16.6.14/24", true)
            .gateway_nic(150, 9, 1, "172.16.1.254/24")
            .build()
    }

    async fn propagate_for(
        store: &MemoryStore,
        gateway: &RecordingGateway,
        router: i64,
        host: HostId,
        instance: i64,
    ) -> HandlerResult<FdbOutcome> {
        let settings = ControlSettings::default();
        let tx = store.begin().await.unwrap();
        let mut ctx = HandlerCtx::new(tx, gateway, &settings, None);
        let nics = ctx.tx.instance_nics(instance).await.unwrap();
        propagate(&mut ctx, router, host, &nics).await
    }

    #[tokio::test]
    async fn test_propagate_two_dispatches() {
        let store = fleet();
        let gateway = RecordingGateway::new();
        let outcome = propagate_for(&store, &gateway, 3, 7, 42).await.unwrap();

        assert_eq!(outcome.peer_hosts, vec![9, 11]);
        assert_eq!(outcome.local_rules, 3);
        assert_eq!(outcome.spread_rules, 1);
        assert_eq!(outcome.dispatches, 2);

        let sent = gateway.dispatches();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].target, "toall=group-fdb-7:9,11");
        assert_eq!(sent[0].script(), "add_fwrule.sh");
        let spread = sent[0].payload().unwrap();
        assert_eq!(spread.as_array().unwrap().len(), 1);
        assert_eq!(spread[0]["inner_ip"], "172.16.1.10/24");
        assert_eq!(spread[0]["outer_ip"], "10.1.0.7");
        assert_eq!(spread[0]["gateway"], "172.16.1.1/24");

        assert_eq!(sent[1].target, "inter=7");
        let local = sent[1].payload().unwrap();
        let outer: Vec<&str> = local
            .as_array()
            .unwrap()
            .iter()
            .map(|r| r["outer_ip"].as_str().unwrap())
            .collect();
        assert_eq!(outer, vec!["10.1.0.9", "10.1.0.9", "10.1.0.11"]);
    }

    #[tokio::test]
    async fn test_classic_router_never_dispatches() {
        let store = fleet();
        let gateway = RecordingGateway::new();
        let outcome = propagate_for(&store, &gateway, 0, 7, 42).await.unwrap();
        assert_eq!(outcome, FdbOutcome::default());
        assert!(gateway.dispatches().is_empty());
    }

    #[tokio::test]
    async fn test_lonely_router_sends_nothing_to_peers() {
        let store = fleet();
        let gateway = RecordingGateway::new();
        let outcome = propagate_for(&store, &gateway, 8, 9, 46).await.unwrap();
        assert!(outcome.peer_hosts.is_empty());
        assert_eq!(outcome.dispatches, 0);
        assert!(gateway.dispatches().is_empty());
    }

    #[tokio::test]
    async fn test_down_host_is_unavailable() {
        let store = fleet();
        let gateway = RecordingGateway::new();
        let err = propagate_for(&store, &gateway, 3, 13, 45).await.unwrap_err();
        assert!(matches!(err, HandlerError::HostUnavailable(_)));
        assert!(!err.rolls_back());
    }

    #[tokio::test]
    async fn test_failed_group_dispatch_still_sends_local() {
        let store = fleet();
        let gateway = RecordingGateway::new();
        gateway.fail_script("add_fwrule.sh");
        let err = propagate_for(&store, &gateway, 3, 7, 42).await.unwrap_err();
        assert!(matches!(err, HandlerError::Dispatch(_)));
        let sent = gateway.dispatches();
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|d| !d.delivered));
    }

    #[tokio::test]
    async fn test_vrrp_rules_have_no_gateway() {
        let store = fixture::fleet()
            .hyper(7, "10.1.0.7")
            .hyper(9, "10.1.0.9")
            .subnet(1, 5001, 3)
            .vrrp_subnet(4, 5004, 3)
            .instance(43, 3, 9)
            .nic(110, 43, 1, "172.16.1.11/24", true)
            .vrrp(1, 3, 0, 4)
            .vrrp_nic(200, 1, "MASTER", 4, "172.16.4.2/24")
            .build();
        let gateway = RecordingGateway::new();
        let settings = ControlSettings::default();
        let tx = store.begin().await.unwrap();
        let mut ctx = HandlerCtx::new(tx, &gateway, &settings, None);
        let nic = ctx.tx.nic(200).await.unwrap().unwrap();
        propagate(&mut ctx, 3, 7, &[nic]).await.unwrap();

        let group = &gateway.of_script("add_fwrule.sh")[0];
        assert_eq!(group.target, "toall=group-fdb-7:9");
        assert_eq!(group.payload().unwrap()[0]["gateway"], "nogateway");
    }

    #[tokio::test]
    async fn test_withdraw_single_group_dispatch() {
        let store = fleet();
        let gateway = RecordingGateway::new();
        let settings = ControlSettings::default();
        let tx = store.begin().await.unwrap();
        let mut ctx = HandlerCtx::new(tx, &gateway, &settings, None);
        let nics = ctx.tx.instance_nics(42).await.unwrap();
        let outcome = withdraw(&mut ctx, 3, 7, &nics).await.unwrap();

        assert_eq!(outcome.dispatches, 1);
        assert_eq!(outcome.spread_rules, 1);
        let sent = gateway.dispatches();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].target, "toall=group-fdb-7:9,11");
        assert_eq!(sent[0].script(), "del_fwrule.sh");
    }
}
