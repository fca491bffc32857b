use super::*;
use crate::test_utils::MemoryTable;
use assert_matches::assert_matches;

fn store() -> (Arc<MemoryTable>, StateStore) {
    let table = Arc::new(MemoryTable::default());
    let store = StateStore::new(table.clone(), "swarminfo", "dtrtable");
    (table, store)
}

#[test_log::test(tokio::test)]
async fn test_leader_round_trip() {
    let (_table, store) = store();
    assert_eq!(store.get_leader().await.unwrap(), None);

    let written = store.set_leader("10.0.0.5".parse().unwrap()).await.unwrap();
    let read = store.get_leader().await.unwrap().unwrap();
    assert_eq!(read.leader_ip, written.leader_ip);
    assert_eq!(read.updated_at.timestamp(), written.updated_at.timestamp());

    store.set_leader("10.0.0.6".parse().unwrap()).await.unwrap();
    let read = store.get_leader().await.unwrap().unwrap();
    assert_eq!(read.leader_ip.to_string(), "10.0.0.6");
}

#[test_log::test(tokio::test)]
async fn test_clear_leader_is_idempotent() {
    let (table, store) = store();
    store.set_leader("10.0.0.5".parse().unwrap()).await.unwrap();
    store.clear_leader().await.unwrap();
    store.clear_leader().await.unwrap();
    assert_eq!(store.get_leader().await.unwrap(), None);
    assert_eq!(table.len("swarminfo"), 0);
}

#[test_log::test(tokio::test)]
async fn test_malformed_leader_record() {
    let (table, store) = store();
    table
        .upsert(
            "swarminfo",
            Entity::new(LEADER_PARTITION, LEADER_ROW).with("leader_ip", "not-an-ip"),
        )
        .await
        .unwrap();
    assert_matches!(
        store.get_leader().await,
        Err(StateError::Malformed { what: "leader", .. })
    );
}

#[test_log::test(tokio::test)]
async fn test_replica_lifecycle() {
    let (_table, store) = store();
    let replica = ReplicaRecord {
        replica_id: "0a1b2c3d4e5f".into(),
        node_name: "swarm-manager000001".into(),
        description: ReplicaDescription::Stable,
    };
    store.put_replica(&replica).await.unwrap();

    let found = store
        .replica_for_node("SWARM-MANAGER000001")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found, replica);

    let marked = store
        .mark_replica(&found, ReplicaDescription::UpgradeInProgress)
        .await
        .unwrap();
    assert_eq!(marked.description, ReplicaDescription::UpgradeInProgress);
    let listed = store.list_replicas().await.unwrap();
    assert_eq!(listed, vec![marked]);

    store.delete_replica("0a1b2c3d4e5f").await.unwrap();
    store.delete_replica("0a1b2c3d4e5f").await.unwrap();
    assert!(store.list_replicas().await.unwrap().is_empty());
    assert_eq!(store.replica_for_node("swarm-manager000001").await.unwrap(), None);
}

#[test_log::test(tokio::test)]
async fn test_replica_without_node_name_is_malformed() {
    let (table, store) = store();
    table
        .upsert("dtrtable", Entity::new(REPLICA_PARTITION, "abc"))
        .await
        .unwrap();
    assert_matches!(
        store.list_replicas().await,
        Err(StateError::Malformed { what: "replica", .. })
    );
}
