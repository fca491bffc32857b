//! Azure Table storage.
//!
//! Besides the plain key-value table, the upgrade queue lives here too: a queue is a table of
//! its own, so creating the table is an atomic test-and-set, and each message is an entity in
//! one partition whose row keys sort in enqueue order.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use url::Url;
use uuid::Uuid;

use super::auth::{STORAGE_RESOURCE, TokenSource};
use crate::error::ApiError;
use crate::storage::{Entity, KeyValueTable, QueueMessage, QueueService};

const STORAGE_API_VERSION: &str = "2019-02-02";
const MESSAGE_PARTITION: &str = "messages";
const MESSAGE_TEXT: &str = "text";

#[derive(Deserialize)]
struct QueryPage {
    #[serde(default)]
    value: Vec<Map<String, Value>>,
}

/// Continuation tokens of a paged query.
#[derive(Debug, Clone, PartialEq)]
struct Continuation {
    partition: String,
    row: Option<String>,
}

impl Continuation {
    fn from_response(response: &Response) -> Option<Self> {
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        Some(Continuation {
            partition: header("x-ms-continuation-NextPartitionKey")?,
            row: header("x-ms-continuation-NextRowKey"),
        })
    }
}

pub struct TableClient {
    client: Client,
    auth: Arc<TokenSource>,
    base: Url,
}

impl TableClient {
    pub fn new(client: Client, auth: Arc<TokenSource>, account: &str) -> Result<Self, ApiError> {
        let base = Url::parse(&format!("https://{}.table.core.windows.net/", account))
            .map_err(|e| ApiError::Fatal(format!("bad storage account '{}': {}", account, e)))?;
        Ok(TableClient { client, auth, base })
    }

    fn url(&self, path: &str) -> Url {
        let mut url = self.base.clone();
        url.set_path(path);
        url
    }

    fn entity_url(&self, table: &str, partition: &str, row: &str) -> Url {
        self.url(&format!(
            "{}(PartitionKey='{}',RowKey='{}')",
            table,
            escape_key(partition),
            escape_key(row)
        ))
    }

    async fn request(&self, method: Method, url: Url) -> Result<RequestBuilder, ApiError> {
        let token = self.auth.token(STORAGE_RESOURCE).await?;
        let date = Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string();
        Ok(self
            .client
            .request(method, url)
            .header("Authorization", format!("Bearer {}", token))
            .header("x-ms-version", STORAGE_API_VERSION)
            .header("x-ms-date", date)
            .header("Accept", "application/json;odata=nometadata")
            .header("DataServiceVersion", "3.0;NetFx"))
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response, ApiError> {
        super::check(request.send().await?, what).await
    }

    async fn create_table(&self, table: &str) -> Result<bool, ApiError> {
        let request = self
            .request(Method::POST, self.url("Tables"))
            .await?
            .header("Prefer", "return-no-content")
            .json(&json!({ "TableName": table }));
        match self.send(request, &format!("create table {}", table)).await {
            Ok(_) => {
                tracing::debug!(table=%table, "Table created");
                Ok(true)
            }
            Err(ApiError::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn delete_table(&self, table: &str) -> Result<(), ApiError> {
        let url = self.url(&format!("Tables('{}')", escape_key(table)));
        let request = self.request(Method::DELETE, url).await?;
        self.send(request, &format!("delete table {}", table)).await?;
        Ok(())
    }

    async fn table_exists(&self, table: &str) -> Result<bool, ApiError> {
        let url = self.url(&format!("Tables('{}')", escape_key(table)));
        let request = self.request(Method::GET, url).await?;
        match self.send(request, &format!("get table {}", table)).await {
            Ok(_) => Ok(true),
            Err(ApiError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn try_insert(&self, table: &str, body: &Value) -> Result<(), ApiError> {
        let request = self
            .request(Method::POST, self.url(table))
            .await?
            .header("Prefer", "return-no-content")
            .json(body);
        self.send(request, &format!("insert into {}", table)).await?;
        Ok(())
    }

    async fn try_upsert(&self, table: &str, entity: &Entity) -> Result<(), ApiError> {
        let url = self.entity_url(table, &entity.partition_key, &entity.row_key);
        let request = self
            .request(Method::PUT, url)
            .await?
            .json(&entity_to_json(entity));
        self.send(request, &format!("upsert into {}", table)).await?;
        Ok(())
    }

    /// Every entity of `partition`, following continuation tokens. At most `limit` when given.
    async fn query_partition(
        &self,
        table: &str,
        partition: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Entity>, ApiError> {
        let filter = format!("PartitionKey eq '{}'", escape_key(partition));
        let mut entities = Vec::new();
        let mut continuation: Option<Continuation> = None;
        loop {
            let mut query = vec![("$filter", filter.clone())];
            if let Some(limit) = limit {
                query.push(("$top", limit.to_string()));
            }
            if let Some(next) = continuation.take() {
                query.push(("NextPartitionKey", next.partition));
                if let Some(row) = next.row {
                    query.push(("NextRowKey", row));
                }
            }
            let request = self
                .request(Method::GET, self.url(&format!("{}()", table)))
                .await?
                .query(&query);
            let response = match self.send(request, &format!("query {}", table)).await {
                Ok(response) => response,
                Err(ApiError::NotFound(_)) => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };
            continuation = Continuation::from_response(&response);
            let page: QueryPage = response.json().await?;
            entities.extend(page.value.into_iter().filter_map(entity_from_json));

            let full = limit.is_some_and(|l| entities.len() >= l);
            if continuation.is_none() || full {
                break;
            }
        }
        entities.sort_by(|a, b| a.row_key.cmp(&b.row_key));
        if let Some(limit) = limit {
            entities.truncate(limit);
        }
        Ok(entities)
    }
}

/// Single quotes are doubled inside key literals.
fn escape_key(key: &str) -> String {
    key.replace('\'', "''")
}

fn entity_to_json(entity: &Entity) -> Value {
    let mut body = entity.properties.clone();
    body.insert("PartitionKey".to_string(), json!(entity.partition_key));
    body.insert("RowKey".to_string(), json!(entity.row_key));
    Value::Object(body)
}

/// `None` for rows without keys. Service metadata is dropped.
fn entity_from_json(mut body: Map<String, Value>) -> Option<Entity> {
    let partition_key = body.remove("PartitionKey")?.as_str()?.to_string();
    let row_key = body.remove("RowKey")?.as_str()?.to_string();
    body.remove("Timestamp");
    body.retain(|key, _| !key.starts_with("odata."));
    Some(Entity {
        partition_key,
        row_key,
        properties: body,
    })
}

/// Row keys that sort in enqueue order, unique across writers.
fn message_row_key() -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default().max(0);
    format!("{:020}-{}", nanos, Uuid::new_v4().simple())
}

#[async_trait]
impl KeyValueTable for TableClient {
    async fn get(
        &self,
        table: &str,
        partition: &str,
        row: &str,
    ) -> Result<Option<Entity>, ApiError> {
        let request = self
            .request(Method::GET, self.entity_url(table, partition, row))
            .await?;
        let response = match self.send(request, &format!("get from {}", table)).await {
            Ok(response) => response,
            Err(ApiError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let body: Map<String, Value> = response.json().await?;
        Ok(entity_from_json(body))
    }

    async fn insert(&self, table: &str, entity: Entity) -> Result<(), ApiError> {
        let body = entity_to_json(&entity);
        match self.try_insert(table, &body).await {
            Err(ApiError::NotFound(_)) => {
                self.create_table(table).await?;
                self.try_insert(table, &body).await
            }
            other => other,
        }
    }

    async fn upsert(&self, table: &str, entity: Entity) -> Result<(), ApiError> {
        match self.try_upsert(table, &entity).await {
            Err(ApiError::NotFound(_)) => {
                self.create_table(table).await?;
                self.try_upsert(table, &entity).await
            }
            other => other,
        }
    }

    async fn delete(&self, table: &str, partition: &str, row: &str) -> Result<(), ApiError> {
        let request = self
            .request(Method::DELETE, self.entity_url(table, partition, row))
            .await?
            .header("If-Match", "*");
        self.send(request, &format!("delete from {}", table)).await?;
        Ok(())
    }

    async fn query(&self, table: &str, partition: &str) -> Result<Vec<Entity>, ApiError> {
        self.query_partition(table, partition, None).await
    }
}

#[async_trait]
impl QueueService for TableClient {
    async fn create_queue(&self, queue: &str) -> Result<bool, ApiError> {
        self.create_table(queue).await
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), ApiError> {
        self.delete_table(queue).await
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool, ApiError> {
        self.table_exists(queue).await
    }

    async fn put_message(&self, queue: &str, text: &str) -> Result<(), ApiError> {
        let entity = Entity::new(MESSAGE_PARTITION, message_row_key()).with(MESSAGE_TEXT, text);
        // No auto-create: a message must never bring a released lock back.
        self.try_insert(queue, &entity_to_json(&entity)).await
    }

    async fn peek_message(&self, queue: &str) -> Result<Option<QueueMessage>, ApiError> {
        if !self.table_exists(queue).await? {
            return Err(ApiError::NotFound(format!("queue {}", queue)));
        }
        let head = self
            .query_partition(queue, MESSAGE_PARTITION, Some(1))
            .await?
            .into_iter()
            .next();
        Ok(head.map(|entity| QueueMessage {
            text: entity.get_str(MESSAGE_TEXT).unwrap_or_default().to_string(),
            id: entity.row_key,
        }))
    }

    async fn get_message(&self, queue: &str) -> Result<Option<QueueMessage>, ApiError> {
        self.peek_message(queue).await
    }

    async fn delete_message(&self, queue: &str, message: &QueueMessage) -> Result<(), ApiError> {
        KeyValueTable::delete(self, queue, MESSAGE_PARTITION, &message.id).await
    }

    async fn approximate_message_count(&self, queue: &str) -> Result<usize, ApiError> {
        Ok(self
            .query_partition(queue, MESSAGE_PARTITION, None)
            .await?
            .len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Secret;

    fn client() -> TableClient {
        let auth = Arc::new(TokenSource::new(Client::new(), "t", "a", Secret::new("s")).unwrap());
        TableClient::new(Client::new(), auth, "swarmsa").unwrap()
    }

    #[test]
    fn test_entity_urls_escape_keys() {
        let url = client().entity_url("dtrtable", "replicas", "o'brien");
        assert_eq!(
            url.as_str(),
            "https://swarmsa.table.core.windows.net/dtrtable(PartitionKey='replicas',RowKey='o''brien')"
        );
    }

    #[test]
    fn test_entity_json_conversion() {
        let entity = Entity::new("leader", "current").with("leader_ip", "10.0.0.4");
        let body = entity_to_json(&entity);
        assert_eq!(body["PartitionKey"], "leader");
        assert_eq!(body["RowKey"], "current");
        assert_eq!(body["leader_ip"], "10.0.0.4");

        let Value::Object(mut returned) = body else {
            panic!("entity body is not an object");
        };
        returned.insert("Timestamp".into(), json!("2018-03-01T10:00:00Z"));
        returned.insert("odata.etag".into(), json!("W/\"datetime'2018'\""));
        assert_eq!(entity_from_json(returned), Some(entity));

        let mut keyless = Map::new();
        keyless.insert("RowKey".into(), json!("r"));
        assert_eq!(entity_from_json(keyless), None);
    }

    #[test]
    fn test_message_row_keys_sort_in_order() {
        let first = message_row_key();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = message_row_key();
        assert!(first < second);
        assert_ne!(first, message_row_key());
    }
}
