//! Key-value table and queue APIs.

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::ApiError;

pub type Properties = Map<String, Value>;

/// A table row addressed by partition and row key.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub partition_key: String,
    pub row_key: String,
    pub properties: Properties,
}

impl Entity {
    pub fn new(partition_key: impl Into<String>, row_key: impl Into<String>) -> Self {
        Entity {
            partition_key: partition_key.into(),
            row_key: row_key.into(),
            properties: Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.properties.get(key).and_then(Value::as_str)
    }
}

#[async_trait]
pub trait KeyValueTable: Send + Sync {
    async fn get(&self, table: &str, partition: &str, row: &str)
    -> Result<Option<Entity>, ApiError>;

    /// Insert a new entity. Fails with [`ApiError::Conflict`] if it already exists.
    async fn insert(&self, table: &str, entity: Entity) -> Result<(), ApiError>;

    async fn upsert(&self, table: &str, entity: Entity) -> Result<(), ApiError>;

    /// Fails with [`ApiError::NotFound`] if there is nothing to delete.
    async fn delete(&self, table: &str, partition: &str, row: &str) -> Result<(), ApiError>;

    /// All entities of one partition, ordered by row key.
    async fn query(&self, table: &str, partition: &str) -> Result<Vec<Entity>, ApiError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub id: String,
    pub text: String,
}

#[async_trait]
pub trait QueueService: Send + Sync {
    /// Create the queue. Returns `false` when it already existed.
    async fn create_queue(&self, queue: &str) -> Result<bool, ApiError>;

    async fn delete_queue(&self, queue: &str) -> Result<(), ApiError>;

    async fn queue_exists(&self, queue: &str) -> Result<bool, ApiError>;

    async fn put_message(&self, queue: &str, text: &str) -> Result<(), ApiError>;

    /// Look at the head message without taking it.
    async fn peek_message(&self, queue: &str) -> Result<Option<QueueMessage>, ApiError>;

    /// Take the head message. It stays in the queue until deleted.
    async fn get_message(&self, queue: &str) -> Result<Option<QueueMessage>, ApiError>;

    async fn delete_message(&self, queue: &str, message: &QueueMessage) -> Result<(), ApiError>;

    async fn approximate_message_count(&self, queue: &str) -> Result<usize, ApiError>;
}
