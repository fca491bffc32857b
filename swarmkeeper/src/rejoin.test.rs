use super::*;
use crate::test_utils::{Harness, Health};
use assert_matches::assert_matches;

fn agent(h: &Harness) -> RejoinAgent {
    RejoinAgent::new(h.services(), h.config())
}

/// Three ready managers, mgr-0 is local and leads. One worker.
fn managers(h: &Harness) -> (String, String) {
    let m0 = h.add_node(Role::Manager, "mgr-0", "10.0.0.4", Health::Ready);
    let m1 = h.add_node(Role::Manager, "mgr-1", "10.0.0.5", Health::Ready);
    h.add_node(Role::Manager, "mgr-2", "10.0.0.6", Health::Ready);
    h.add_node(Role::Worker, "wrk-0", "10.0.1.4", Health::Ready);
    h.set_leader(&m0);
    h.set_local(&m0);
    (m0, m1)
}

#[test_log::test(tokio::test)]
async fn test_idle_without_signal() {
    let h = Harness::new();
    managers(&h);
    assert_eq!(agent(&h).complete_handoff().await.unwrap(), HandoffOutcome::Idle);

    h.mutex().acquire().await.unwrap();
    assert_eq!(agent(&h).complete_handoff().await.unwrap(), HandoffOutcome::Idle);
    assert!(h.journal().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_signal_for_another_node_is_left_alone() {
    let h = Harness::new();
    let (_m0, m1) = managers(&h);
    let mutex = h.mutex();
    mutex.acquire().await.unwrap();
    mutex.enqueue_rejoin(&m1).await.unwrap();

    let outcome = agent(&h).complete_handoff().await.unwrap();
    assert_eq!(
        outcome,
        HandoffOutcome::NotForUs {
            target: m1,
            pending: 1
        }
    );
    assert_eq!(h.queue.messages("upgradequeue").len(), 1);
    assert!(h.journal().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_manager_completes_own_upgrade() {
    let h = Harness::new();
    let (m0, _m1) = managers(&h);
    let mutex = h.mutex();
    mutex.acquire().await.unwrap();
    mutex.enqueue_rejoin(&m0).await.unwrap();
    h.state().set_leader("10.0.0.4".parse().unwrap()).await.unwrap();

    let outcome = agent(&h).complete_handoff().await.unwrap();
    assert_eq!(outcome, HandoffOutcome::Completed { node_id: m0 });

    let pos = |e: &'static str| h.position(e).unwrap_or_else(|| panic!("{} not in journal", e));
    assert!(pos("demote:mgr-0") < pos("leave:mgr-0"));
    assert!(pos("leave:mgr-0") < pos("remove:mgr-0"));
    assert!(pos("remove:mgr-0") < pos("update-model:mgr-0"));
    assert!(pos("update-model:mgr-0") < pos("reimage:mgr-0"));

    // The lock is released and leadership moved to the next manager.
    assert!(!h.queue.exists("upgradequeue"));
    let leader = h.state().get_leader().await.unwrap().unwrap();
    assert_eq!(leader.leader_ip.to_string(), "10.0.0.5");
    assert!(!h.hostnames(Role::Manager).contains(&"mgr-0".to_string()));
}

#[test_log::test(tokio::test)]
async fn test_worker_is_removed_through_recorded_leader() {
    let h = Harness::new();
    managers(&h);
    let w0 = h.world().nodes.iter().find(|n| n.hostname == "wrk-0").unwrap().id.clone();
    h.set_local(&w0);
    h.state().set_leader("10.0.0.4".parse().unwrap()).await.unwrap();
    let mutex = h.mutex();
    mutex.acquire().await.unwrap();
    mutex.enqueue_rejoin(&w0).await.unwrap();

    let outcome = agent(&h).complete_handoff().await.unwrap();
    assert_eq!(outcome, HandoffOutcome::Completed { node_id: w0 });
    assert_eq!(
        h.journal(),
        vec![
            "at:10.0.0.4",
            "leave:wrk-0",
            "remove:wrk-0",
            "update-model:wrk-0",
            "reimage:wrk-0"
        ]
    );
    assert!(!h.queue.exists("upgradequeue"));
}

#[test_log::test(tokio::test)]
async fn test_single_manager_handoff() {
    let h = Harness::new();
    let m0 = h.add_node(Role::Manager, "mgr-0", "10.0.0.4", Health::Ready);
    h.set_leader(&m0);
    h.set_local(&m0);
    h.state().set_leader("10.0.0.4".parse().unwrap()).await.unwrap();
    let mutex = h.mutex();
    mutex.acquire().await.unwrap();
    mutex.enqueue_rejoin(&m0).await.unwrap();

    let result = agent(&h).complete_handoff().await;
    assert_matches!(result, Err(RejoinError::Upgrade(UpgradeError::SingleManager)));
    assert_eq!(h.position("leave:mgr-0"), None);

    let mut h = h;
    h.config.cluster.reset_single_manager = true;
    h.mutex().enqueue_rejoin(&m0).await.unwrap();
    let outcome = agent(&h).complete_handoff().await.unwrap();
    assert_eq!(outcome, HandoffOutcome::Completed { node_id: m0 });
    assert_eq!(h.state().get_leader().await.unwrap(), None);
    assert_eq!(h.position("demote:mgr-0"), None);
    assert!(h.position("reimage:mgr-0").is_some());
}

#[test_log::test(tokio::test)]
async fn test_join_through_leader_registers_replica() {
    let h = Harness::new().with_addon();
    managers(&h);
    {
        let mut world = h.world();
        world.local_node_id = None;
        world.local_hostname = "mgr-3".into();
        world.local_ip = Some("10.0.0.7".parse().unwrap());
    }
    h.state().set_leader("10.0.0.4".parse().unwrap()).await.unwrap();

    let outcome = agent(&h).join_cluster(Role::Manager).await.unwrap();
    let JoinOutcome::Joined {
        node_id,
        leader_ip,
        replica_id,
    } = outcome
    else {
        panic!("expected a join");
    };
    assert_eq!(leader_ip.to_string(), "10.0.0.4");
    assert_eq!(replica_id.as_deref(), Some("replica-mgr-3"));
    assert_eq!(h.world().local_node_id.as_deref(), Some(node_id.as_str()));
    assert!(
        h.journal()
            .contains(&"join:10.0.0.4:SWMTKN-manager".to_string())
    );

    let replica = h.state().replica_for_node("mgr-3").await.unwrap().unwrap();
    assert_eq!(replica.description, ReplicaDescription::Stable);
}

#[test_log::test(tokio::test)]
async fn test_join_worker_uses_worker_token() {
    let h = Harness::new().with_addon();
    managers(&h);
    h.world().local_node_id = None;
    h.state().set_leader("10.0.0.4".parse().unwrap()).await.unwrap();

    let outcome = agent(&h).join_cluster(Role::Worker).await.unwrap();
    assert_matches!(outcome, JoinOutcome::Joined { replica_id: None, .. });
    assert!(h.journal().contains(&"join:10.0.0.4:SWMTKN-worker".to_string()));
    assert!(h.addon.as_ref().unwrap().joined.lock().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_join_requires_leader_record() {
    let h = Harness::new();
    assert_matches!(
        agent(&h).join_cluster(Role::Worker).await,
        Err(RejoinError::NoLeader)
    );
}

#[test_log::test(tokio::test)]
async fn test_join_skipped_when_already_member() {
    let h = Harness::new();
    let (m0, _) = managers(&h);
    let outcome = agent(&h).join_cluster(Role::Manager).await.unwrap();
    assert_eq!(outcome, JoinOutcome::AlreadyMember { node_id: m0 });
    assert!(h.journal().is_empty());
}
