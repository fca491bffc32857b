use super::*;
use crate::test_utils::{Harness, Health, MANAGER_SET, WORKER_SET};
use assert_matches::assert_matches;
use chrono::{Duration as TimeDelta, Utc};

fn by_id<'a>(ss: &'a ScaleSet, node_id: &str) -> &'a Node {
    ss.nodes.iter().find(|n| n.has_node_id(node_id)).unwrap()
}

#[test_log::test(tokio::test)]
async fn test_instance_table_uses_primary_ip() {
    let h = Harness::new();
    h.add_node(Role::Manager, "mgr-0", "10.0.0.4", Health::Ready);
    h.add_node(Role::Manager, "mgr-1", "10.0.0.5", Health::Ready);

    let table = h.services().resolver().instance_table(MANAGER_SET).await.unwrap();
    let ips: Vec<String> = table.iter().map(|r| r.private_ip.to_string()).collect();
    assert_eq!(ips, vec!["10.0.0.4", "10.0.0.5"]);
    assert_eq!(table[0].computer_name, "mgr-0");
}

#[test_log::test(tokio::test)]
async fn test_resolve_joins_members_and_instances() {
    let h = Harness::new();
    let m0 = h.add_node(Role::Manager, "mgr-0", "10.0.0.4", Health::Ready);
    let m1 = h.add_node(Role::Manager, "mgr-1", "10.0.0.5", Health::Down);
    h.add_instance(Role::Manager, "mgr-2", "10.0.0.6", TimeDelta::minutes(1));

    let ss = h
        .services()
        .resolver()
        .resolve(MANAGER_SET, Role::Manager)
        .await
        .unwrap();
    assert_eq!(ss.nodes.len(), 3);
    assert_eq!(ss.nodes.iter().filter(|n| n.is_member()).count(), 2);

    let n0 = by_id(&ss, &m0);
    assert_eq!(n0.hostname, "mgr-0");
    assert!(n0.cluster_status.is_ready());
    let age = Utc::now() - n0.provisioned_at.unwrap();
    assert!(age >= TimeDelta::minutes(59));

    let n1 = by_id(&ss, &m1);
    assert_eq!(n1.cluster_status, ClusterStatus::Down);

    let fresh = ss.nodes.iter().find(|n| n.hostname == "mgr-2").unwrap();
    assert!(Utc::now() - fresh.provisioned_at.unwrap() < TimeDelta::minutes(2));
    assert_eq!(fresh.cluster_node_id, None);
    assert_eq!(fresh.cluster_status, ClusterStatus::Unknown);
    assert_eq!(fresh.role, Role::Manager);
}

#[test_log::test(tokio::test)]
async fn test_resolve_fails_on_member_without_instance() {
    let h = Harness::new();
    h.add_node(Role::Worker, "wrk-0", "10.0.1.4", Health::Ready);
    h.add_member(Role::Worker, "wrk-stale", "10.0.1.99", Health::Down);

    let result = h.services().resolver().resolve(WORKER_SET, Role::Worker).await;
    assert_matches!(
        result,
        Err(ResolutionError::UnknownAddress { ref hostname, .. }) if hostname == "wrk-stale"
    );
}

#[test_log::test(tokio::test)]
async fn test_resolve_prefers_ready_member_on_duplicate_ip() {
    let h = Harness::new();
    let old = h.add_member(Role::Worker, "wrk-0", "10.0.1.4", Health::Down);
    let new = h.add_node(Role::Worker, "wrk-0", "10.0.1.4", Health::Ready);

    let ss = h
        .services()
        .resolver()
        .resolve(WORKER_SET, Role::Worker)
        .await
        .unwrap();
    assert_eq!(ss.nodes.len(), 1);
    assert_eq!(ss.nodes[0].cluster_node_id.as_deref(), Some(new.as_str()));
    assert_ne!(ss.nodes[0].cluster_node_id.as_deref(), Some(old.as_str()));
}

#[test_log::test(tokio::test)]
async fn test_resolve_ignores_other_roles() {
    let h = Harness::new();
    h.add_node(Role::Manager, "mgr-0", "10.0.0.4", Health::Ready);
    h.add_node(Role::Worker, "wrk-0", "10.0.1.4", Health::Ready);

    let ss = h
        .services()
        .resolver()
        .resolve(WORKER_SET, Role::Worker)
        .await
        .unwrap();
    assert_eq!(ss.nodes.len(), 1);
    assert_eq!(ss.nodes[0].hostname, "wrk-0");
}
