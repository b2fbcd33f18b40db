// ABOUTME: In-memory backend implementing the connection layer and both capture primitives
// ABOUTME: Lets embedders and tests exercise capture without a live database

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::capture::poll::{ChangeFeed, ChangeFeedSource, FeedPage, FeedStart};
use crate::capture::subscription::{ChangeEvent, ChangeSubscriber, ChangeSubscription};
use crate::checkpoint::CheckpointRecord;
use crate::connection::{ConnectionConfig, ConnectionLayer};
use crate::error::{CdcError, ResourceKind, Result};

const SCHEME: &str = "memory://";

/// Shared in-memory store of databases, collections, changes and checkpoint records.
///
/// Positions are indexes into a collection's change log, so tokens are plain
/// integers rendered as strings.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<Mutex<MemoryState>>,
}

#[derive(Default)]
struct MemoryState {
    databases: BTreeMap<String, BTreeMap<String, MemoryCollection>>,
    fail_checkpoint_writes: bool,
}

#[derive(Default)]
struct MemoryCollection {
    changes: Vec<Value>,
    records: BTreeMap<String, Value>,
    checkpoint_writes: u64,
    subscribers: Vec<mpsc::UnboundedSender<ChangeEvent>>,
}

#[derive(Debug, Clone)]
pub struct MemoryClient {
    pub connection_string: String,
}

#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct MemoryResource {
    pub database: String,
    pub name: String,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connection string accepted by [`ConnectionLayer::connect`].
    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new(format!("{}local", SCHEME))
    }

    pub fn create_database(&self, name: &str) {
        self.lock().databases.entry(name.to_string()).or_default();
    }

    pub fn create_collection(&self, database: &str, name: &str) {
        self.lock()
            .databases
            .entry(database.to_string())
            .or_default()
            .entry(name.to_string())
            .or_default();
    }

    pub fn has_collection(&self, database: &str, name: &str) -> bool {
        self.lock()
            .databases
            .get(database)
            .is_some_and(|colls| colls.contains_key(name))
    }

    /// Append a change and push it to live subscribers.
    pub fn push_change(&self, database: &str, collection: &str, document: Value) {
        let mut state = self.lock();
        let coll = state
            .databases
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default();
        coll.changes.push(document.clone());
        let event = ChangeEvent {
            document,
            resume_token: coll.changes.len().to_string(),
        };
        coll.subscribers
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// End every open subscription on a collection.
    pub fn close_subscriptions(&self, database: &str, collection: &str) {
        if let Some(coll) = self.collection_mut(&mut self.lock(), database, collection) {
            coll.subscribers.clear();
        }
    }

    pub fn checkpoint(&self, database: &str, collection: &str, id: &str) -> Option<String> {
        let state = self.lock();
        let record = state.databases.get(database)?.get(collection)?.records.get(id)?;
        record.get("lease")?.as_str().map(str::to_string)
    }

    pub fn checkpoint_writes(&self, database: &str, collection: &str) -> u64 {
        let state = self.lock();
        state
            .databases
            .get(database)
            .and_then(|colls| colls.get(collection))
            .map_or(0, |coll| coll.checkpoint_writes)
    }

    /// Store an arbitrary record body, e.g. one missing its lease.
    pub fn put_raw_checkpoint(&self, database: &str, collection: &str, id: &str, body: Value) {
        let mut state = self.lock();
        state
            .databases
            .entry(database.to_string())
            .or_default()
            .entry(collection.to_string())
            .or_default()
            .records
            .insert(id.to_string(), body);
    }

    pub fn fail_checkpoint_writes(&self, fail: bool) {
        self.lock().fail_checkpoint_writes = fail;
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        // A poisoned lock only means a test thread panicked; the data is still usable
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn collection_mut<'s>(
        &self,
        state: &'s mut MemoryState,
        database: &str,
        collection: &str,
    ) -> Option<&'s mut MemoryCollection> {
        state.databases.get_mut(database)?.get_mut(collection)
    }
}

fn parse_position(token: &str) -> Option<usize> {
    token.parse().ok()
}

#[async_trait]
impl ConnectionLayer for MemoryBackend {
    type Client = MemoryClient;
    type Database = MemoryDatabase;
    type Resource = MemoryResource;

    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<MemoryClient> {
        if !config.connection_string.starts_with(SCHEME) {
            return Err(CdcError::connect(
                "memory",
                format!("connection string must start with {}", SCHEME),
            ));
        }
        Ok(MemoryClient {
            connection_string: config.connection_string.clone(),
        })
    }

    async fn resolve_database(&self, _client: &MemoryClient, name: &str) -> Result<MemoryDatabase> {
        if !self.lock().databases.contains_key(name) {
            return Err(CdcError::not_found(ResourceKind::Database, name));
        }
        Ok(MemoryDatabase {
            name: name.to_string(),
        })
    }

    async fn resolve_resource(
        &self,
        database: &MemoryDatabase,
        name: &str,
    ) -> Result<MemoryResource> {
        if !self.has_collection(&database.name, name) {
            return Err(CdcError::not_found(ResourceKind::Resource, name));
        }
        Ok(MemoryResource {
            database: database.name.clone(),
            name: name.to_string(),
        })
    }

    async fn create_resource_if_absent(
        &self,
        database: &MemoryDatabase,
        name: &str,
    ) -> Result<MemoryResource> {
        self.create_collection(&database.name, name);
        Ok(MemoryResource {
            database: database.name.clone(),
            name: name.to_string(),
        })
    }

    async fn read_checkpoint(
        &self,
        resource: &MemoryResource,
        id: &str,
    ) -> Result<Option<CheckpointRecord>> {
        let state = self.lock();
        let body = state
            .databases
            .get(&resource.database)
            .and_then(|colls| colls.get(&resource.name))
            .and_then(|coll| coll.records.get(id));
        match body {
            None => Ok(None),
            Some(body) => {
                let token = body
                    .get("lease")
                    .and_then(Value::as_str)
                    .ok_or_else(|| CdcError::decode(id, "missing string field 'lease'"))?;
                Ok(Some(CheckpointRecord::new(id, token)))
            }
        }
    }

    async fn write_checkpoint(
        &self,
        resource: &MemoryResource,
        record: &CheckpointRecord,
    ) -> Result<()> {
        let mut state = self.lock();
        if state.fail_checkpoint_writes {
            return Err(CdcError::persist(&record.id, "checkpoint writes are disabled"));
        }
        let coll = self
            .collection_mut(&mut state, &resource.database, &resource.name)
            .ok_or_else(|| CdcError::persist(&record.id, "checkpoint resource is gone"))?;
        let body = serde_json::to_value(record)
            .map_err(|e| CdcError::persist(&record.id, e))?;
        coll.records.insert(record.id.clone(), body);
        coll.checkpoint_writes += 1;
        Ok(())
    }
}

/// Paged reader over a collection's change log.
pub struct MemoryFeed {
    backend: MemoryBackend,
    resource: MemoryResource,
    position: usize,
    page_size: usize,
    drained: bool,
}

#[async_trait]
impl ChangeFeed for MemoryFeed {
    async fn next_page(&mut self) -> Result<Option<FeedPage>> {
        if self.drained {
            return Ok(None);
        }
        let state = self.backend.lock();
        let changes = state
            .databases
            .get(&self.resource.database)
            .and_then(|colls| colls.get(&self.resource.name))
            .map(|coll| coll.changes.as_slice())
            .unwrap_or_default();

        if self.position >= changes.len() {
            self.drained = true;
            return Ok(Some(FeedPage::NotModified));
        }

        let end = (self.position + self.page_size).min(changes.len());
        let documents = changes[self.position..end].to_vec();
        self.position = end;
        Ok(Some(FeedPage::Changes {
            documents,
            continuation: end.to_string(),
        }))
    }
}

#[async_trait]
impl ChangeFeedSource for MemoryBackend {
    type Feed = MemoryFeed;

    async fn open_change_feed(
        &self,
        source: &MemoryResource,
        start: FeedStart,
        page_size: u32,
    ) -> Result<MemoryFeed> {
        let position = match start {
            FeedStart::Beginning => 0,
            FeedStart::Continuation(token) => parse_position(&token).ok_or_else(|| {
                CdcError::decode(
                    &source.name,
                    format!("invalid continuation token for '{}': {}", source.name, token),
                )
            })?,
        };
        Ok(MemoryFeed {
            backend: self.clone(),
            resource: source.clone(),
            position,
            page_size: page_size.max(1) as usize,
            drained: false,
        })
    }
}

#[async_trait]
impl ChangeSubscriber for MemoryBackend {
    async fn subscribe(
        &self,
        source: &MemoryResource,
        resume_token: Option<&str>,
    ) -> Result<ChangeSubscription> {
        let mut state = self.lock();
        let coll = self
            .collection_mut(&mut state, &source.database, &source.name)
            .ok_or_else(|| CdcError::not_found(ResourceKind::Source, &source.name))?;

        let current = coll.changes.len();
        let start = match resume_token {
            None => current,
            Some(token) => match parse_position(token) {
                Some(position) => position.min(current),
                None => {
                    tracing::warn!("Ignoring undecodable resume token, subscribing from now");
                    current
                }
            },
        };

        let backlog: Vec<Result<ChangeEvent>> = coll.changes[start..]
            .iter()
            .enumerate()
            .map(|(offset, document)| {
                Ok(ChangeEvent {
                    document: document.clone(),
                    resume_token: (start + offset + 1).to_string(),
                })
            })
            .collect();

        let (tx, rx) = mpsc::unbounded_channel();
        coll.subscribers.push(tx);
        let live = UnboundedReceiverStream::new(rx).map(Ok);
        Ok(stream::iter(backlog).chain(live).boxed())
    }
}
