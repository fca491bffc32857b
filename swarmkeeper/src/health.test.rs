use super::*;
use crate::test_utils::{Harness, Health, MANAGER_SET, WORKER_SET};
use assert_matches::assert_matches;
use chrono::Duration as TimeDelta;

fn monitor(h: &Harness) -> HealthMonitor {
    HealthMonitor::new(h.services(), h.config())
}

fn checked(outcome: HealthOutcome) -> HealthReport {
    match outcome {
        HealthOutcome::Checked(report) => report,
        HealthOutcome::StoodDown => panic!("health check stood down"),
    }
}

#[test_log::test(tokio::test)]
async fn test_dead_worker_is_replaced() {
    let h = Harness::new();
    h.add_node(Role::Worker, "wrk-0", "10.0.1.4", Health::Ready);
    h.add_instance(Role::Worker, "wrk-1", "10.0.1.5", TimeDelta::seconds(700));
    h.add_member(Role::Worker, "wrk-1", "10.0.1.5", Health::Down);
    h.probe.kill("10.0.1.5".parse().unwrap());

    let report = checked(monitor(&h).check(WORKER_SET, Role::Worker).await.unwrap());
    assert_eq!(report.dead, vec!["wrk-1"]);
    assert_eq!(report.checked, vec!["wrk-0", "wrk-1"]);
    assert_eq!(report.new_capacity, Some(2));

    assert_eq!(
        h.journal(),
        vec!["remove:wrk-1", "delete:wrk-1", "capacity:wrk-vmss=2"]
    );
    // The whole probe budget was spent before declaring the node dead.
    assert_eq!(h.probe.calls("10.0.1.5".parse().unwrap()), 3);
    assert_eq!(h.hostnames(Role::Worker), vec!["wrk-0"]);
}

#[test_log::test(tokio::test)]
async fn test_node_inside_grace_period_is_not_checked() {
    let h = Harness::new();
    h.add_instance(Role::Worker, "wrk-0", "10.0.1.4", TimeDelta::seconds(100));
    h.add_member(Role::Worker, "wrk-0", "10.0.1.4", Health::Down);
    h.probe.kill("10.0.1.4".parse().unwrap());

    let report = checked(monitor(&h).check(WORKER_SET, Role::Worker).await.unwrap());
    assert_eq!(report.skipped, vec!["wrk-0"]);
    assert!(report.dead.is_empty());
    assert_eq!(report.new_capacity, None);
    assert!(h.journal().is_empty());
    assert_eq!(h.probe.total_calls(), 0);
}

#[test_log::test(tokio::test)]
async fn test_unknown_provisioning_time_is_not_checked() {
    let h = Harness::new();
    h.add_instance(Role::Worker, "wrk-0", "10.0.1.4", TimeDelta::hours(1));
    h.world().scale_sets.get_mut(WORKER_SET).unwrap().instances[0]
        .view
        .provisioned_at = None;
    h.probe.kill("10.0.1.4".parse().unwrap());

    let report = checked(monitor(&h).check(WORKER_SET, Role::Worker).await.unwrap());
    assert_eq!(report.skipped, vec!["wrk-0"]);
    assert!(h.journal().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_stopped_instance_is_not_checked() {
    let h = Harness::new();
    h.add_instance(Role::Worker, "wrk-0", "10.0.1.4", TimeDelta::hours(1));
    h.world().scale_sets.get_mut(WORKER_SET).unwrap().instances[0]
        .view
        .power_state = PowerState::Deallocated;

    let report = checked(monitor(&h).check(WORKER_SET, Role::Worker).await.unwrap());
    assert_eq!(report.skipped, vec!["wrk-0"]);
    assert_eq!(h.probe.total_calls(), 0);
}

#[test_log::test(tokio::test)]
async fn test_single_failing_signal_is_not_enough() {
    let h = Harness::new();
    // Probe fails but the cluster says ready.
    h.add_node(Role::Worker, "wrk-0", "10.0.1.4", Health::Ready);
    h.probe.kill("10.0.1.4".parse().unwrap());
    // Cluster says down but the probe answers.
    h.add_node(Role::Worker, "wrk-1", "10.0.1.5", Health::Down);

    let report = checked(monitor(&h).check(WORKER_SET, Role::Worker).await.unwrap());
    assert!(report.dead.is_empty());
    assert_eq!(report.checked.len(), 2);
    assert!(h.journal().is_empty());
    assert_eq!(h.probe.calls("10.0.1.5".parse().unwrap()), 1);
}

#[test_log::test(tokio::test)]
async fn test_dead_manager_is_demoted_before_removal() {
    let h = Harness::new();
    let m0 = h.add_node(Role::Manager, "mgr-0", "10.0.0.4", Health::Ready);
    h.set_leader(&m0);
    h.add_node(Role::Manager, "mgr-1", "10.0.0.5", Health::Down);
    h.probe.kill("10.0.0.5".parse().unwrap());

    let report = checked(monitor(&h).check(MANAGER_SET, Role::Manager).await.unwrap());
    assert_eq!(report.dead, vec!["mgr-1"]);
    assert_eq!(
        h.journal(),
        vec![
            "demote:mgr-1",
            "remove:mgr-1",
            "delete:mgr-1",
            "capacity:mgr-vmss=2"
        ]
    );
}

#[test_log::test(tokio::test)]
async fn test_instance_that_never_joined_is_replaced() {
    let h = Harness::new();
    h.add_instance(Role::Worker, "wrk-0", "10.0.1.4", TimeDelta::hours(1));
    h.probe.kill("10.0.1.4".parse().unwrap());

    let report = checked(monitor(&h).check(WORKER_SET, Role::Worker).await.unwrap());
    assert_eq!(report.dead, vec!["wrk-0"]);
    assert_eq!(h.journal(), vec!["delete:wrk-0", "capacity:wrk-vmss=1"]);
}

#[test_log::test(tokio::test)]
async fn test_stands_down_while_upgrade_lock_held() {
    let h = Harness::new();
    h.add_node(Role::Worker, "wrk-0", "10.0.1.4", Health::Down);
    h.probe.kill("10.0.1.4".parse().unwrap());
    h.mutex().acquire().await.unwrap();

    let outcome = monitor(&h).check(WORKER_SET, Role::Worker).await.unwrap();
    assert_eq!(outcome, HealthOutcome::StoodDown);
    assert!(h.journal().is_empty());
    assert_eq!(h.probe.total_calls(), 0);
}

#[test_log::test(tokio::test)]
async fn test_delete_failure_is_reported() {
    let h = Harness::new();
    h.add_node(Role::Worker, "wrk-0", "10.0.1.4", Health::Down);
    h.probe.kill("10.0.1.4".parse().unwrap());
    h.fail("delete:wrk-0", ApiError::Fatal("forbidden".into()));

    let result = monitor(&h).check(WORKER_SET, Role::Worker).await;
    assert_matches!(result, Err(HealthError::Api(ApiError::Fatal(_))));
    assert!(!h.journal().iter().any(|e| e.starts_with("capacity:")));
}

#[test_log::test(tokio::test)]
async fn test_instance_deleted_after_listing_is_skipped() {
    let h = Harness::new();
    h.add_node(Role::Worker, "wrk-0", "10.0.1.4", Health::Down);
    h.add_node(Role::Worker, "wrk-1", "10.0.1.5", Health::Down);
    h.probe.kill("10.0.1.5".parse().unwrap());
    h.fail("view:wrk-0", ApiError::NotFound("instance wrk-vmss/0".into()));

    let report = checked(monitor(&h).check(WORKER_SET, Role::Worker).await.unwrap());
    assert_eq!(report.skipped, vec!["wrk-0"]);
    assert_eq!(report.dead, vec!["wrk-1"]);
    assert!(h.journal().contains(&"delete:wrk-1".to_string()));
    assert!(!h.journal().contains(&"delete:wrk-0".to_string()));
}

#[test_log::test(tokio::test)]
async fn test_instance_view_failure_still_aborts() {
    let h = Harness::new();
    h.add_node(Role::Worker, "wrk-0", "10.0.1.4", Health::Down);
    h.fail("view:wrk-0", ApiError::Fatal("forbidden".into()));

    let result = monitor(&h).check(WORKER_SET, Role::Worker).await;
    assert_matches!(result, Err(HealthError::Api(ApiError::Fatal(_))));
    assert!(h.journal().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_heal_runs_both_roles() {
    let h = Harness::new();
    h.add_node(Role::Manager, "mgr-0", "10.0.0.4", Health::Ready);
    h.add_node(Role::Worker, "wrk-0", "10.0.1.4", Health::Ready);
    h.add_member(Role::Worker, "wrk-gone", "10.0.1.99", Health::Down);

    let passes = heal(&h.services(), h.config()).await.unwrap();
    assert_eq!(passes.len(), 2);
    assert_eq!(passes[0].role, Role::Manager);
    assert_matches!(&passes[1].drift, DriftOutcome::Reconciled(r) if r.removed == vec!["wrk-gone"]);
}

#[test_log::test(tokio::test)]
async fn test_heal_skips_while_upgrade_lock_held() {
    let h = Harness::new();
    h.add_member(Role::Worker, "wrk-gone", "10.0.1.99", Health::Down);
    h.mutex().acquire().await.unwrap();

    let passes = heal(&h.services(), h.config()).await.unwrap();
    assert!(passes.is_empty());
    assert!(h.journal().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_heal_runs_workers_after_manager_failure() {
    let h = Harness::new();
    h.add_node(Role::Manager, "mgr-0", "10.0.0.4", Health::Ready);
    h.add_node(Role::Manager, "mgr-1", "10.0.0.5", Health::Down);
    h.probe.kill("10.0.0.5".parse().unwrap());
    h.fail("delete:mgr-1", ApiError::Fatal("forbidden".into()));
    h.add_node(Role::Worker, "wrk-0", "10.0.1.4", Health::Down);
    h.probe.kill("10.0.1.4".parse().unwrap());

    let result = heal(&h.services(), h.config()).await;
    assert_matches!(result, Err(HealthError::Api(ApiError::Fatal(_))));

    let journal = h.journal();
    assert!(journal.contains(&"failed:delete:mgr-1".to_string()));
    assert!(journal.contains(&"delete:wrk-0".to_string()));
    assert!(journal.iter().any(|e| e.starts_with("capacity:wrk-vmss=")));
    assert!(!journal.iter().any(|e| e.starts_with("capacity:mgr-vmss=")));
}
