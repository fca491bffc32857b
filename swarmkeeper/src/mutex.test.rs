use super::*;
use crate::storage::QueueMessage;
use crate::test_utils::MemoryQueue;
use assert_matches::assert_matches;

fn mutex() -> (Arc<MemoryQueue>, UpgradeMutex) {
    let queue = Arc::new(MemoryQueue::default());
    let mutex = UpgradeMutex::new(queue.clone(), "upgradequeue");
    (queue, mutex)
}

#[test_log::test(tokio::test)]
async fn test_acquire_and_release() {
    let (queue, mutex) = mutex();
    assert!(!mutex.lock_exists().await.unwrap());

    assert_eq!(mutex.acquire().await.unwrap(), LockAcquire::Acquired);
    assert!(mutex.lock_exists().await.unwrap());
    assert_eq!(mutex.acquire().await.unwrap(), LockAcquire::AlreadyLocked);

    mutex.release().await.unwrap();
    assert!(!queue.exists("upgradequeue"));
    // Releasing a lock that is already gone is not an error.
    mutex.release().await.unwrap();
    assert_eq!(queue.events(), vec!["create:upgradequeue", "delete:upgradequeue"]);
}

#[test_log::test(tokio::test)]
async fn test_lost_race_reports_already_locked() {
    struct RacingQueue(MemoryQueue);

    #[async_trait::async_trait]
    impl QueueService for RacingQueue {
        async fn create_queue(&self, queue: &str) -> Result<bool, ApiError> {
            // Someone else created it between our existence check and our create.
            self.0.create_queue(queue).await?;
            Ok(false)
        }
        async fn delete_queue(&self, queue: &str) -> Result<(), ApiError> {
            self.0.delete_queue(queue).await
        }
        async fn queue_exists(&self, queue: &str) -> Result<bool, ApiError> {
            self.0.queue_exists(queue).await
        }
        async fn put_message(&self, queue: &str, text: &str) -> Result<(), ApiError> {
            self.0.put_message(queue, text).await
        }
        async fn peek_message(&self, queue: &str) -> Result<Option<QueueMessage>, ApiError> {
            self.0.peek_message(queue).await
        }
        async fn get_message(&self, queue: &str) -> Result<Option<QueueMessage>, ApiError> {
            self.0.get_message(queue).await
        }
        async fn delete_message(&self, queue: &str, m: &QueueMessage) -> Result<(), ApiError> {
            self.0.delete_message(queue, m).await
        }
        async fn approximate_message_count(&self, queue: &str) -> Result<usize, ApiError> {
            self.0.approximate_message_count(queue).await
        }
    }

    let mutex = UpgradeMutex::new(Arc::new(RacingQueue(MemoryQueue::default())), "upgradequeue");
    assert_eq!(mutex.acquire().await.unwrap(), LockAcquire::AlreadyLocked);
}

#[test_log::test(tokio::test)]
async fn test_rejoin_signal_only_consumed_by_named_node() {
    let (queue, mutex) = mutex();
    mutex.acquire().await.unwrap();
    mutex.enqueue_rejoin("node-a").await.unwrap();
    assert_eq!(mutex.pending_signals().await.unwrap(), 1);

    let peeked = mutex.peek_rejoin().await.unwrap().unwrap();
    assert_eq!(peeked.node_id, "node-a");

    assert_eq!(mutex.consume_rejoin_if_self("node-b").await.unwrap(), None);
    assert_eq!(queue.messages("upgradequeue").len(), 1);

    let consumed = mutex.consume_rejoin_if_self("node-a").await.unwrap().unwrap();
    assert_eq!(consumed.node_id, "node-a");
    assert_eq!(mutex.pending_signals().await.unwrap(), 0);
    // Consuming the signal does not release the lock.
    assert!(mutex.lock_exists().await.unwrap());
}

#[test_log::test(tokio::test)]
async fn test_peek_without_lock() {
    let (_queue, mutex) = mutex();
    assert_eq!(mutex.peek_rejoin().await.unwrap(), None);
    assert_eq!(mutex.consume_rejoin_if_self("node-a").await.unwrap(), None);
}

#[test_log::test(tokio::test)]
async fn test_malformed_signal() {
    let (queue, mutex) = mutex();
    mutex.acquire().await.unwrap();
    queue.put_message("upgradequeue", "node-a").await.unwrap();
    assert_matches!(
        mutex.peek_rejoin().await,
        Err(MutexError::MalformedSignal { .. })
    );
}
