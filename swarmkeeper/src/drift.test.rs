use super::*;
use crate::test_utils::{Harness, Health, MANAGER_SET, WORKER_SET};

fn reconciled(outcome: DriftOutcome) -> DriftReport {
    match outcome {
        DriftOutcome::Reconciled(report) => report,
        DriftOutcome::StoodDown => panic!("reconciler stood down"),
    }
}

#[test_log::test(tokio::test)]
async fn test_stale_manager_is_demoted_then_removed() {
    let h = Harness::new();
    let m0 = h.add_node(Role::Manager, "mgr-0", "10.0.0.4", Health::Ready);
    h.set_leader(&m0);
    h.add_node(Role::Manager, "mgr-1", "10.0.0.5", Health::Down);
    h.add_member(Role::Manager, "mgr-gone", "10.0.0.99", Health::Down);

    let report = reconciled(
        DriftReconciler::new(h.services())
            .reconcile(MANAGER_SET, Role::Manager)
            .await
            .unwrap(),
    );
    assert_eq!(report.removed, vec!["mgr-gone"]);
    assert_eq!(h.journal(), vec!["demote:mgr-gone", "remove:mgr-gone"]);
    // mgr-1 is unhealthy but still backed by an instance.
    assert_eq!(h.hostnames(Role::Manager), vec!["mgr-0", "mgr-1"]);
}

#[test_log::test(tokio::test)]
async fn test_ready_orphan_is_left_alone() {
    let h = Harness::new();
    h.add_node(Role::Worker, "wrk-0", "10.0.1.4", Health::Ready);
    h.add_member(Role::Worker, "wrk-orphan", "10.0.1.98", Health::Ready);

    let report = reconciled(
        DriftReconciler::new(h.services())
            .reconcile(WORKER_SET, Role::Worker)
            .await
            .unwrap(),
    );
    assert!(report.removed.is_empty());
    assert_eq!(report.orphaned_ready, vec!["wrk-orphan"]);
    assert!(h.journal().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_stale_worker_is_not_demoted() {
    let h = Harness::new();
    h.add_member(Role::Worker, "wrk-gone", "10.0.1.99", Health::Down);

    DriftReconciler::new(h.services())
        .reconcile(WORKER_SET, Role::Worker)
        .await
        .unwrap();
    assert_eq!(h.journal(), vec!["remove:wrk-gone"]);
}

#[test_log::test(tokio::test)]
async fn test_stands_down_while_upgrade_lock_held() {
    let h = Harness::new();
    h.add_member(Role::Worker, "wrk-gone", "10.0.1.99", Health::Down);
    h.mutex().acquire().await.unwrap();

    let outcome = DriftReconciler::new(h.services())
        .reconcile(WORKER_SET, Role::Worker)
        .await
        .unwrap();
    assert_eq!(outcome, DriftOutcome::StoodDown);
    assert!(h.journal().is_empty());
}
