// ABOUTME: MongoDB connection layer and change stream subscription
// ABOUTME: Resolves databases and collections, keeps lease documents keyed by _id

use async_trait::async_trait;
use bson::{doc, Document};
use futures::StreamExt;
use mongodb::error::ErrorKind;
use mongodb::options::{ChangeStreamOptions, FullDocumentType};
use mongodb::{Client, Collection, Database};

use super::stream::{resume_position, to_change_event, watch_pipeline};
use crate::capture::subscription::{ChangeSubscriber, ChangeSubscription};
use crate::checkpoint::CheckpointRecord;
use crate::connection::{ConnectionConfig, ConnectionLayer};
use crate::error::{CdcError, ResourceKind, Result};

const BACKEND: &str = "MongoDB";

/// Server error code for "collection already exists".
const NAMESPACE_EXISTS: i32 = 48;

fn is_namespace_exists(error: &mongodb::error::Error) -> bool {
    matches!(error.kind.as_ref(), ErrorKind::Command(command) if command.code == NAMESPACE_EXISTS)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MongoLayer;

impl MongoLayer {
    async fn collection_exists(&self, database: &Database, name: &str) -> Result<bool> {
        let names = database
            .list_collection_names()
            .filter(doc! { "name": name })
            .await
            .map_err(|e| {
                CdcError::backend(format!("List collections of '{}'", database.name()), e)
            })?;
        Ok(names.iter().any(|n| n == name))
    }
}

#[async_trait]
impl ConnectionLayer for MongoLayer {
    type Client = Client;
    type Database = Database;
    type Resource = Collection<Document>;

    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn connect(&self, config: &ConnectionConfig) -> Result<Client> {
        let client = Client::with_uri_str(&config.connection_string)
            .await
            .map_err(|e| CdcError::connect(BACKEND, e))?;
        // The driver connects lazily; ping so unreachable servers fail here
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| CdcError::connect(BACKEND, e))?;
        Ok(client)
    }

    async fn resolve_database(&self, client: &Client, name: &str) -> Result<Database> {
        let names = client
            .list_database_names()
            .filter(doc! { "name": name })
            .await
            .map_err(|e| CdcError::backend("List databases", e))?;
        if !names.iter().any(|n| n == name) {
            return Err(CdcError::not_found(ResourceKind::Database, name));
        }
        Ok(client.database(name))
    }

    async fn resolve_resource(
        &self,
        database: &Database,
        name: &str,
    ) -> Result<Collection<Document>> {
        if !self.collection_exists(database, name).await? {
            return Err(CdcError::not_found(ResourceKind::Resource, name));
        }
        Ok(database.collection(name))
    }

    async fn create_resource_if_absent(
        &self,
        database: &Database,
        name: &str,
    ) -> Result<Collection<Document>> {
        if !self.collection_exists(database, name).await? {
            match database.create_collection(name).await {
                Ok(()) => tracing::info!("Created collection '{}' in '{}'", name, database.name()),
                Err(e) if is_namespace_exists(&e) => {}
                Err(e) => {
                    return Err(CdcError::backend(format!("Create collection '{}'", name), e));
                }
            }
        }
        Ok(database.collection(name))
    }

    async fn read_checkpoint(
        &self,
        resource: &Collection<Document>,
        id: &str,
    ) -> Result<Option<CheckpointRecord>> {
        let found = resource
            .find_one(doc! { "_id": id })
            .await
            .map_err(|e| CdcError::backend(format!("Read checkpoint '{}'", id), e))?;
        let Some(document) = found else {
            return Ok(None);
        };
        let token = document
            .get_str("lease")
            .map_err(|e| CdcError::decode(id, e))?;
        Ok(Some(CheckpointRecord::new(id, token)))
    }

    async fn write_checkpoint(
        &self,
        resource: &Collection<Document>,
        record: &CheckpointRecord,
    ) -> Result<()> {
        resource
            .replace_one(
                doc! { "_id": record.id.as_str() },
                doc! { "_id": record.id.as_str(), "lease": record.token.as_str() },
            )
            .upsert(true)
            .await
            .map_err(|e| CdcError::persist(&record.id, e))?;
        Ok(())
    }
}

#[async_trait]
impl ChangeSubscriber for MongoLayer {
    async fn subscribe(
        &self,
        source: &Collection<Document>,
        resume_token: Option<&str>,
    ) -> Result<ChangeSubscription> {
        let options = ChangeStreamOptions::builder()
            .full_document(Some(FullDocumentType::UpdateLookup))
            .resume_after(resume_position(source.name(), resume_token))
            .build();

        let stream = source
            .watch()
            .pipeline(watch_pipeline())
            .with_options(options)
            .await
            .map_err(|e| CdcError::backend(format!("Watch '{}'", source.name()), e))?
            .with_type::<Document>();

        Ok(stream
            .map(|item| {
                item.map_err(|e| CdcError::backend("Read change stream", e))
                    .and_then(to_change_event)
            })
            .boxed())
    }
}
