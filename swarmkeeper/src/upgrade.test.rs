use super::*;
use crate::test_utils::{APP_SECRET, Harness, Health, TEMPLATE_URL};
use assert_matches::assert_matches;
use std::sync::atomic::Ordering;

struct Cluster {
    h: Harness,
    self_id: String,
}

/// Three ready managers (mgr-1 leads, mgr-0 runs the coordinator) and two workers.
fn cluster(h: Harness) -> Cluster {
    let m0 = h.add_node(Role::Manager, "mgr-0", "10.0.0.4", Health::Ready);
    let m1 = h.add_node(Role::Manager, "mgr-1", "10.0.0.5", Health::Ready);
    h.add_node(Role::Manager, "mgr-2", "10.0.0.6", Health::Ready);
    h.add_node(Role::Worker, "wrk-0", "10.0.1.4", Health::Ready);
    h.add_node(Role::Worker, "wrk-1", "10.0.1.5", Health::Ready);
    h.set_leader(&m1);
    h.set_local(&m0);
    Cluster { h, self_id: m0 }
}

fn coordinator(h: &Harness) -> Coordinator {
    Coordinator::new(h.services(), h.config())
}

fn hostnames(report: &UpgradeReport) -> Vec<&str> {
    report.nodes.iter().map(|n| n.hostname.as_str()).collect()
}

#[test_log::test(tokio::test)]
async fn test_rolling_upgrade_hands_off_self_node() {
    let Cluster { h, self_id } = cluster(Harness::new());

    let report = coordinator(&h).run(TEMPLATE_URL).await.unwrap();

    assert_eq!(hostnames(&report), vec!["mgr-1", "mgr-2", "wrk-0", "wrk-1"]);
    assert!(report.nodes.iter().all(|n| n.state == NodeState::RejoinedReady));
    assert_eq!(report.handed_off.as_deref(), Some(self_id.as_str()));
    assert!(!report.lock_released);

    // The lock stays held and names the coordinator's own node.
    assert!(h.queue.exists("upgradequeue"));
    let signal = h.mutex().peek_rejoin().await.unwrap().unwrap();
    assert_eq!(signal.node_id, self_id);

    // The own node is never touched directly.
    let journal = h.journal();
    assert!(!journal.iter().any(|e| e.ends_with(":mgr-0")));
}

#[test_log::test(tokio::test)]
async fn test_leader_record_refreshed_once() {
    let Cluster { h, .. } = cluster(Harness::new());

    coordinator(&h).run(TEMPLATE_URL).await.unwrap();

    let leader = h.state().get_leader().await.unwrap().unwrap();
    assert_eq!(leader.leader_ip.to_string(), "10.0.0.4");
    assert_eq!(h.table.writes_to("swarminfo", "leader", "current"), 1);
}

#[test_log::test(tokio::test)]
async fn test_managers_before_workers_and_step_order() {
    let Cluster { h, .. } = cluster(Harness::new());

    coordinator(&h).run(TEMPLATE_URL).await.unwrap();

    let pos = |e: String| h.position(&e).unwrap_or_else(|| panic!("{} not in journal", e));
    assert_eq!(pos(format!("update-deployment:{}", TEMPLATE_URL)), 0);
    for host in ["mgr-1", "mgr-2"] {
        assert!(pos(format!("demote:{}", host)) < pos(format!("remove:{}", host)));
        assert!(pos(format!("remove:{}", host)) < pos(format!("update-model:{}", host)));
        assert!(pos(format!("update-model:{}", host)) < pos(format!("reimage:{}", host)));
        assert!(pos(format!("reimage:{}", host)) < pos("remove:wrk-0".into()));
    }
    assert!(pos("reimage:mgr-1".into()) < pos("demote:mgr-2".into()));
    assert!(pos("reimage:wrk-0".into()) < pos("remove:wrk-1".into()));
    // Workers are never demoted.
    assert_eq!(h.position("demote:wrk-0"), None);
}

#[test_log::test(tokio::test)]
async fn test_deployment_parameters_carried_forward() {
    let Cluster { h, .. } = cluster(Harness::new());

    coordinator(&h).run(TEMPLATE_URL).await.unwrap();

    let world = h.world();
    assert_eq!(
        world.deployment.template_link.as_ref().map(Url::as_str),
        Some(TEMPLATE_URL)
    );
    let parameters = world.deployed_parameters.as_ref().unwrap();
    assert_eq!(parameters["managerCount"], json!({ "value": 3 }));
    assert_eq!(
        parameters["adServicePrincipalAppSecret"],
        json!({ "value": APP_SECRET })
    );
}

#[test_log::test(tokio::test)]
async fn test_unknown_secure_parameter_aborts_and_releases() {
    let Cluster { h, .. } = cluster(Harness::new());
    h.world().deployment.parameters.insert(
        "otherSecret".into(),
        crate::scaleset::Parameter {
            value: None,
            secure: true,
        },
    );

    let result = coordinator(&h).run(TEMPLATE_URL).await;
    assert_matches!(result, Err(UpgradeError::MissingParameter(ref p)) if p == "otherSecret");
    assert!(!h.queue.exists("upgradequeue"));
    assert!(h.journal().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_already_locked_touches_nothing() {
    let Cluster { h, .. } = cluster(Harness::new());
    h.mutex().acquire().await.unwrap();

    let result = coordinator(&h).run(TEMPLATE_URL).await;
    assert_matches!(result, Err(UpgradeError::AlreadyInProgress));
    assert!(h.journal().is_empty());
    // Someone else's lock is never released.
    assert!(h.queue.exists("upgradequeue"));
    assert_eq!(h.queue.events(), vec!["create:upgradequeue"]);
}

#[test_log::test(tokio::test)]
async fn test_invalid_template_never_locks() {
    let Cluster { h, .. } = cluster(Harness::new());
    let no_resources = "https://templates.example.com/swarm/v2/empty.json";
    h.templates.serve(no_resources, Ok(json!({ "parameters": {} })));
    let missing = "https://templates.example.com/swarm/v2/missing.json";
    h.templates
        .serve(missing, Err(ApiError::NotFound("missing.json".into())));

    for url in [
        "not a url",
        "http://templates.example.com/swarm/v2/azure.json",
        "https://templates.example.com/swarm/v2/azure.yaml",
        no_resources,
        missing,
    ] {
        let result = coordinator(&h).run(url).await;
        assert_matches!(result, Err(UpgradeError::InvalidTemplate { .. }), "{}", url);
    }
    assert!(h.queue.events().is_empty());
    assert!(h.journal().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_insecure_template_allowed_when_configured() {
    let h = Harness::new();
    let url = "http://templates.internal/azure.json";
    assert_matches!(
        validate_template_url(h.templates.as_ref(), url, false).await,
        Err(UpgradeError::InvalidTemplate { .. })
    );
    let parsed = validate_template_url(h.templates.as_ref(), url, true)
        .await
        .unwrap();
    assert_eq!(parsed.as_str(), url);
}

#[test_log::test(tokio::test)]
async fn test_failure_releases_lock_and_keeps_upgraded_nodes() {
    let Cluster { h, .. } = cluster(Harness::new());
    h.fail("reimage:wrk-0", ApiError::Fatal("quota exceeded".into()));

    let result = coordinator(&h).run(TEMPLATE_URL).await;
    assert_matches!(
        result,
        Err(UpgradeError::Aborted { ref node, state: NodeState::TemplateOSRefPending, .. }) if node == "wrk-0"
    );
    assert!(!h.queue.exists("upgradequeue"));
    assert_eq!(
        h.queue.events(),
        vec!["create:upgradequeue", "delete:upgradequeue"]
    );
    // No rollback of what was already done.
    assert!(h.position("reimage:mgr-2").is_some());
    assert_eq!(h.position("remove:wrk-1"), None);
}

#[test_log::test(tokio::test)]
async fn test_quorum_guard_refuses_demotion() {
    let h = Harness::new();
    let m0 = h.add_node(Role::Manager, "mgr-0", "10.0.0.4", Health::Ready);
    h.add_node(Role::Manager, "mgr-1", "10.0.0.5", Health::Ready);
    h.add_node(Role::Manager, "mgr-2", "10.0.0.6", Health::Down);
    h.set_leader(&m0);
    h.set_local(&m0);

    let result = coordinator(&h).run(TEMPLATE_URL).await;
    assert_matches!(
        result,
        Err(UpgradeError::Aborted { ref source, .. })
            if matches!(**source, UpgradeError::QuorumRisk { ref unready, .. } if unready == &["mgr-2"])
    );
    assert_eq!(h.position("demote:mgr-1"), None);
    assert!(!h.queue.exists("upgradequeue"));
}

#[test_log::test(tokio::test)]
async fn test_single_manager_is_refused() {
    let h = Harness::new();
    let m0 = h.add_node(Role::Manager, "mgr-0", "10.0.0.4", Health::Ready);
    h.add_node(Role::Worker, "wrk-0", "10.0.1.4", Health::Ready);
    h.set_leader(&m0);
    h.set_local(&m0);

    let result = coordinator(&h).run(TEMPLATE_URL).await;
    assert_matches!(result, Err(UpgradeError::SingleManager));
    assert!(h.journal().is_empty());
    assert!(!h.queue.exists("upgradequeue"));
}

#[test_log::test(tokio::test)]
async fn test_single_manager_reset_upgrades_workers() {
    let mut h = Harness::new();
    h.config.cluster.reset_single_manager = true;
    let m0 = h.add_node(Role::Manager, "mgr-0", "10.0.0.4", Health::Ready);
    h.add_node(Role::Worker, "wrk-0", "10.0.1.4", Health::Ready);
    h.set_leader(&m0);
    h.set_local(&m0);

    let report = coordinator(&h).run(TEMPLATE_URL).await.unwrap();
    assert_eq!(hostnames(&report), vec!["wrk-0"]);
    assert_eq!(report.handed_off.as_deref(), Some(m0.as_str()));
}

#[test_log::test(tokio::test)]
async fn test_single_manager_reset_requires_own_node() {
    let mut h = Harness::new();
    h.config.cluster.reset_single_manager = true;
    let m0 = h.add_node(Role::Manager, "mgr-0", "10.0.0.4", Health::Ready);
    h.add_node(Role::Worker, "wrk-0", "10.0.1.4", Health::Ready);
    h.set_leader(&m0);
    h.state().set_leader("10.0.0.4".parse().unwrap()).await.unwrap();

    let result = coordinator(&h).run(TEMPLATE_URL).await;
    assert_matches!(result, Err(UpgradeError::SingleManager));
    assert!(h.journal().is_empty());
    assert_eq!(
        h.queue.events(),
        vec!["create:upgradequeue", "delete:upgradequeue"]
    );
    assert_eq!(h.hostnames(Role::Manager), vec!["mgr-0".to_string()]);
    assert!(h.state().get_leader().await.unwrap().is_some());
}

#[test_log::test(tokio::test)]
async fn test_unmapped_member_aborts_and_releases() {
    let Cluster { h, .. } = cluster(Harness::new());
    h.add_member(Role::Manager, "mgr-gone", "10.0.0.99", Health::Down);

    let result = coordinator(&h).run(TEMPLATE_URL).await;
    assert_matches!(
        result,
        Err(UpgradeError::Resolution(ResolutionError::UnknownAddress { ref hostname, .. }))
            if hostname == "mgr-gone"
    );
    assert_eq!(
        h.queue.events(),
        vec!["create:upgradequeue", "delete:upgradequeue"]
    );
    assert_eq!(
        h.journal(),
        vec![format!("update-deployment:{}", TEMPLATE_URL)]
    );
}

#[test_log::test(tokio::test)]
async fn test_without_self_node_lock_is_released() {
    let h = Harness::new();
    let m0 = h.add_node(Role::Manager, "mgr-0", "10.0.0.4", Health::Ready);
    h.add_node(Role::Manager, "mgr-1", "10.0.0.5", Health::Ready);
    h.add_node(Role::Manager, "mgr-2", "10.0.0.6", Health::Ready);
    h.set_leader(&m0);

    let report = coordinator(&h).run(TEMPLATE_URL).await.unwrap();
    assert_eq!(hostnames(&report), vec!["mgr-0", "mgr-1", "mgr-2"]);
    assert!(report.lock_released);
    assert_eq!(report.handed_off, None);
    assert!(!h.queue.exists("upgradequeue"));

    // Leadership moved with every demotion of the current leader.
    let leader = h.state().get_leader().await.unwrap().unwrap();
    let world = h.world();
    let current = world.nodes.iter().find(|n| n.is_leader).unwrap();
    assert_eq!(leader.leader_ip, current.addr);
}

#[test_log::test(tokio::test)]
async fn test_overprovisioned_nodes_removed_during_reimage() {
    let Cluster { h, .. } = cluster(Harness::new());
    h.world().ghost_on_reimage = true;

    let report = coordinator(&h).run(TEMPLATE_URL).await.unwrap();
    assert_eq!(report.nodes.len(), 4);

    let journal = h.journal();
    let ghosts_removed = journal.iter().filter(|e| e.starts_with("remove:ghost-")).count();
    let ghosts_demoted = journal.iter().filter(|e| e.starts_with("demote:ghost-")).count();
    assert_eq!(ghosts_removed, 4);
    assert_eq!(ghosts_demoted, 2);
    assert!(!h.world().nodes.iter().any(|n| n.hostname.starts_with("ghost-")));
}

#[test_log::test(tokio::test)]
async fn test_node_that_never_rejoins_times_out() {
    let Cluster { h, .. } = cluster(Harness::new());
    h.world().rejoin_after_reimage = false;

    let result = coordinator(&h).run(TEMPLATE_URL).await;
    assert_matches!(
        result,
        Err(UpgradeError::Aborted { ref node, state: NodeState::Booting, ref source })
            if node == "mgr-1" && matches!(**source, UpgradeError::Timeout(_))
    );
    assert!(!h.queue.exists("upgradequeue"));
}

#[test_log::test(tokio::test)]
async fn test_addon_replicas_drained() {
    let Cluster { h, self_id } = cluster(Harness::new().with_addon());
    let state = h.state();
    for (id, host) in [
        ("aaaaaaaaaaa0", "mgr-0"),
        ("aaaaaaaaaaa1", "mgr-1"),
        ("aaaaaaaaaaa2", "mgr-2"),
    ] {
        state
            .put_replica(&ReplicaRecord {
                replica_id: id.into(),
                node_name: host.into(),
                description: ReplicaDescription::Stable,
            })
            .await
            .unwrap();
    }
    let addon = h.addon.clone().unwrap();
    addon.flaky_removes.store(1, Ordering::SeqCst);

    let report = coordinator(&h).run(TEMPLATE_URL).await.unwrap();
    assert_eq!(report.handed_off, Some(self_id));
    assert_eq!(
        *addon.removed.lock(),
        vec!["aaaaaaaaaaa1", "aaaaaaaaaaa2", "aaaaaaaaaaa0"]
    );
    assert!(state.list_replicas().await.unwrap().is_empty());
}
