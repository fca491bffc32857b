use super::*;

#[test]
fn test_cluster_status_from_docker_states() {
    assert_eq!(ClusterStatus::from("ready"), ClusterStatus::Ready);
    assert_eq!(ClusterStatus::from("Ready"), ClusterStatus::Ready);
    assert_eq!(ClusterStatus::from("down"), ClusterStatus::Down);
    assert_eq!(ClusterStatus::from("disconnected"), ClusterStatus::Down);
    assert_eq!(ClusterStatus::from("unknown"), ClusterStatus::Unknown);
    assert!(!ClusterStatus::Unknown.is_ready());
}

#[test]
fn test_role_parse() {
    assert_eq!("manager".parse::<Role>().unwrap(), Role::Manager);
    assert_eq!("WORKER".parse::<Role>().unwrap(), Role::Worker);
    assert!("leader".parse::<Role>().is_err());
}

#[test]
fn test_replica_description_round_trips_through_table_text() {
    let text = ReplicaDescription::UpgradeInProgress.as_str();
    assert_eq!(text, "upgrade in progress");
    assert_eq!(
        ReplicaDescription::from(text),
        ReplicaDescription::UpgradeInProgress
    );
    assert_eq!(ReplicaDescription::from("anything else"), ReplicaDescription::Stable);
}

#[test]
fn test_node_membership() {
    let node = |id: Option<&str>| Node {
        instance_id: "0".into(),
        private_ip: "10.0.0.4".parse().unwrap(),
        cluster_node_id: id.map(String::from),
        role: Role::Worker,
        hostname: "worker-000000".into(),
        cluster_status: ClusterStatus::Ready,
        provisioned_at: None,
    };

    let member = node(Some("abc"));
    assert!(member.is_member());
    assert!(member.has_node_id("abc"));
    assert!(!member.has_node_id("zzz"));

    let fresh = node(None);
    assert!(!fresh.is_member());
    assert!(!fresh.has_node_id("abc"));
}
