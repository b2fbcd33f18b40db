// ABOUTME: Connection layer contract shared by every backend
// ABOUTME: Opens clients, resolves databases and resources, reads and upserts checkpoints

use async_trait::async_trait;

use crate::checkpoint::CheckpointRecord;
use crate::error::Result;

/// Backend connection settings. The string is parsed by the backend only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionConfig {
    pub connection_string: String,
}

impl ConnectionConfig {
    pub fn new(connection_string: impl Into<String>) -> Self {
        Self {
            connection_string: connection_string.into(),
        }
    }
}

/// Handle acquisition and checkpoint persistence for one backend.
///
/// The source collection and the checkpoint collection are both `Self::Resource`;
/// only the name given at resolution time tells them apart.
#[async_trait]
pub trait ConnectionLayer: Send + Sync {
    type Client: Send + Sync;
    type Database: Send + Sync;
    type Resource: Send + Sync;

    /// Short backend name used in logs and errors.
    fn backend_name(&self) -> &'static str;

    /// Open a client. Does not check that any database exists.
    async fn connect(&self, config: &ConnectionConfig) -> Result<Self::Client>;

    async fn resolve_database(&self, client: &Self::Client, name: &str) -> Result<Self::Database>;

    async fn resolve_resource(
        &self,
        database: &Self::Database,
        name: &str,
    ) -> Result<Self::Resource>;

    /// Idempotent; only used for checkpoint resources.
    async fn create_resource_if_absent(
        &self,
        database: &Self::Database,
        name: &str,
    ) -> Result<Self::Resource>;

    /// `Ok(None)` when no record with `id` exists.
    async fn read_checkpoint(
        &self,
        resource: &Self::Resource,
        id: &str,
    ) -> Result<Option<CheckpointRecord>>;

    /// Upsert keyed by `record.id`.
    async fn write_checkpoint(
        &self,
        resource: &Self::Resource,
        record: &CheckpointRecord,
    ) -> Result<()>;
}
