// ABOUTME: Cosmos DB connection layer: databases, containers and lease items over REST
// ABOUTME: Also opens change feed iterators for the poll capture engine

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};

use super::client::{error_message, is_not_found, CosmosClient, CosmosRequest};
use super::config::parse_connection_string;
use super::feed::{list_partition_key_ranges, CosmosFeed, FeedContinuation, FeedCursor};
use crate::capture::poll::{ChangeFeedSource, FeedStart};
use crate::checkpoint::CheckpointRecord;
use crate::connection::{ConnectionConfig, ConnectionLayer};
use crate::error::{CdcError, ResourceKind, Result};

const BACKEND: &str = "Cosmos DB";

#[derive(Debug, Clone)]
pub struct CosmosDatabase {
    pub client: CosmosClient,
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct CosmosContainer {
    pub client: CosmosClient,
    pub database: String,
    pub name: String,
}

impl CosmosContainer {
    /// `dbs/{db}/colls/{name}/{child}` as URL segments.
    pub fn segments_with(&self, child: &str) -> Vec<String> {
        vec![
            "dbs".to_string(),
            self.database.clone(),
            "colls".to_string(),
            self.name.clone(),
            child.to_string(),
        ]
    }

    fn item_segments(&self, id: &str) -> Vec<String> {
        let mut segments = self.segments_with("docs");
        segments.push(id.to_string());
        segments
    }
}

/// Partition key header value for lease items, which are partitioned on `/id`.
fn partition_key(id: &str) -> String {
    json!([id]).to_string()
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CosmosLayer;

impl CosmosLayer {
    async fn read_container(
        &self,
        database: &CosmosDatabase,
        name: &str,
    ) -> Result<Option<CosmosContainer>> {
        let request = CosmosRequest::new(
            Method::GET,
            vec![
                "dbs".into(),
                database.name.clone(),
                "colls".into(),
                name.to_string(),
            ],
            "colls",
        );
        let response = database.client.send(request).await?;
        if is_not_found(response.status()) {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CdcError::backend(
                format!("Read container '{}'", name),
                error_message(response).await,
            ));
        }
        Ok(Some(CosmosContainer {
            client: database.client.clone(),
            database: database.name.clone(),
            name: name.to_string(),
        }))
    }
}

#[async_trait]
impl ConnectionLayer for CosmosLayer {
    type Client = CosmosClient;
    type Database = CosmosDatabase;
    type Resource = CosmosContainer;

    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<CosmosClient> {
        let info = parse_connection_string(&config.connection_string)
            .map_err(|e| CdcError::connect(BACKEND, format!("{:#}", e)))?;
        let client = CosmosClient::new(info)?;

        // Read the account so bad keys and unreachable endpoints fail here
        let response = client
            .send(CosmosRequest::new(Method::GET, Vec::new(), ""))
            .await
            .map_err(|e| CdcError::connect(BACKEND, e))?;
        if !response.status().is_success() {
            return Err(CdcError::connect(BACKEND, error_message(response).await));
        }
        Ok(client)
    }

    async fn resolve_database(&self, client: &CosmosClient, name: &str) -> Result<CosmosDatabase> {
        let request = CosmosRequest::new(Method::GET, vec!["dbs".into(), name.to_string()], "dbs");
        let response = client.send(request).await?;
        if is_not_found(response.status()) {
            return Err(CdcError::not_found(ResourceKind::Database, name));
        }
        if !response.status().is_success() {
            return Err(CdcError::backend(
                format!("Read database '{}'", name),
                error_message(response).await,
            ));
        }
        Ok(CosmosDatabase {
            client: client.clone(),
            name: name.to_string(),
        })
    }

    async fn resolve_resource(
        &self,
        database: &CosmosDatabase,
        name: &str,
    ) -> Result<CosmosContainer> {
        self.read_container(database, name)
            .await?
            .ok_or_else(|| CdcError::not_found(ResourceKind::Resource, name))
    }

    async fn create_resource_if_absent(
        &self,
        database: &CosmosDatabase,
        name: &str,
    ) -> Result<CosmosContainer> {
        if let Some(container) = self.read_container(database, name).await? {
            return Ok(container);
        }

        let request = CosmosRequest::new(
            Method::POST,
            vec!["dbs".into(), database.name.clone(), "colls".into()],
            "colls",
        )
        .json(json!({
            "id": name,
            "partitionKey": { "paths": ["/id"], "kind": "Hash" },
        }));
        let response = database.client.send(request).await?;
        match response.status() {
            // Conflict means another consumer created it first
            StatusCode::CREATED | StatusCode::CONFLICT => {
                tracing::info!("Container '{}' ready in '{}'", name, database.name);
                Ok(CosmosContainer {
                    client: database.client.clone(),
                    database: database.name.clone(),
                    name: name.to_string(),
                })
            }
            _ => Err(CdcError::backend(
                format!("Create container '{}'", name),
                error_message(response).await,
            )),
        }
    }

    async fn read_checkpoint(
        &self,
        resource: &CosmosContainer,
        id: &str,
    ) -> Result<Option<CheckpointRecord>> {
        let request = CosmosRequest::new(Method::GET, resource.item_segments(id), "docs")
            .header("x-ms-documentdb-partitionkey", partition_key(id));
        let response = resource.client.send(request).await?;
        if is_not_found(response.status()) {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(CdcError::backend(
                format!("Read checkpoint '{}'", id),
                error_message(response).await,
            ));
        }
        let body: Value = response
            .json()
            .await
            .map_err(|e| CdcError::decode(id, e))?;
        let token = body
            .get("lease")
            .and_then(Value::as_str)
            .ok_or_else(|| CdcError::decode(id, "missing string field 'lease'"))?;
        Ok(Some(CheckpointRecord::new(id, token)))
    }

    async fn write_checkpoint(
        &self,
        resource: &CosmosContainer,
        record: &CheckpointRecord,
    ) -> Result<()> {
        let body = serde_json::to_value(record).map_err(|e| CdcError::persist(&record.id, e))?;
        let request = CosmosRequest::new(Method::POST, resource.segments_with("docs"), "docs")
            .header("x-ms-documentdb-is-upsert", "True")
            .header("x-ms-documentdb-partitionkey", partition_key(&record.id))
            .json(body);
        let response = resource
            .client
            .send(request)
            .await
            .map_err(|e| CdcError::persist(&record.id, e))?;
        if !response.status().is_success() {
            return Err(CdcError::persist(&record.id, error_message(response).await));
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeedSource for CosmosLayer {
    type Feed = CosmosFeed;

    async fn open_change_feed(
        &self,
        source: &CosmosContainer,
        start: FeedStart,
        page_size: u32,
    ) -> Result<CosmosFeed> {
        let continuation = match start {
            FeedStart::Beginning => None,
            FeedStart::Continuation(token) => {
                Some(FeedContinuation::parse(&token).map_err(|e| {
                    CdcError::decode(
                        &source.name,
                        format!("invalid continuation token for '{}': {}", source.name, e),
                    )
                })?)
            }
        };
        let ranges = list_partition_key_ranges(&source.client, source).await?;
        tracing::debug!(
            "Change feed of '{}' spans {} partition key range(s)",
            source.name,
            ranges.len()
        );
        let cursor = FeedCursor::new(ranges, continuation);
        Ok(CosmosFeed::new(source.client.clone(), source.clone(), cursor, page_size))
    }
}
