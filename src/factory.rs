// ABOUTME: Backend factory mapping a backend kind to a configured CDC service
// ABOUTME: Pairs each connection layer with its capture engine and checkpoint naming

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::capture::{CaptureMode, CaptureSummary, PollEngine, SubscriptionEngine};
use crate::checkpoint::CheckpointNaming;
use crate::connection::{ConnectionConfig, ConnectionLayer};
use crate::cosmos::{CosmosClient, CosmosLayer};
use crate::error::{CdcError, Result};
use crate::mongo::MongoLayer;
use crate::orchestrator::{CdcOrchestrator, FeedRequest};
use crate::sink::Sink;

/// Backend identifiers accepted in configuration and on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum BackendKind {
    CosmosDb,
    MongoDb,
    PostgreSql,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::CosmosDb => "CosmosDB",
            BackendKind::MongoDb => "MongoDB",
            BackendKind::PostgreSql => "PostgreSQL",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = CdcError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cosmosdb" => Ok(BackendKind::CosmosDb),
            "mongodb" => Ok(BackendKind::MongoDb),
            "postgresql" => Ok(BackendKind::PostgreSql),
            other => Err(CdcError::Config(format!(
                "Unknown backend '{}'. Expected CosmosDB, MongoDB or PostgreSQL",
                other
            ))),
        }
    }
}

impl TryFrom<String> for BackendKind {
    type Error = CdcError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<BackendKind> for String {
    fn from(kind: BackendKind) -> Self {
        kind.as_str().to_string()
    }
}

/// A connected client of whichever backend the service was built for.
#[derive(Debug, Clone)]
pub enum BackendClient {
    Cosmos(CosmosClient),
    Mongo(mongodb::Client),
}

impl BackendClient {
    pub fn backend_name(&self) -> &'static str {
        match self {
            BackendClient::Cosmos(_) => "Cosmos DB",
            BackendClient::Mongo(_) => "MongoDB",
        }
    }
}

/// One backend's orchestrator, ready to connect and capture.
pub enum CdcService {
    Cosmos(CdcOrchestrator<CosmosLayer, PollEngine>),
    Mongo(CdcOrchestrator<MongoLayer, SubscriptionEngine>),
}

/// Build the service for `kind`. Each service pairs a connection layer with the capture
/// engine that matches the backend's change primitive.
pub fn create_service(kind: BackendKind) -> Result<CdcService> {
    let naming = CheckpointNaming::default();
    match kind {
        BackendKind::CosmosDb => Ok(CdcService::Cosmos(CdcOrchestrator::with_naming(
            CosmosLayer,
            PollEngine,
            naming,
        ))),
        BackendKind::MongoDb => Ok(CdcService::Mongo(CdcOrchestrator::with_naming(
            MongoLayer,
            SubscriptionEngine,
            naming,
        ))),
        BackendKind::PostgreSql => Err(CdcError::Unsupported(kind.to_string())),
    }
}

impl CdcService {
    pub fn backend_name(&self) -> &'static str {
        match self {
            CdcService::Cosmos(o) => o.layer().backend_name(),
            CdcService::Mongo(o) => o.layer().backend_name(),
        }
    }

    pub fn capture_mode(&self) -> CaptureMode {
        match self {
            CdcService::Cosmos(o) => o.capture_mode(),
            CdcService::Mongo(o) => o.capture_mode(),
        }
    }

    pub async fn connect(&self, config: &ConnectionConfig) -> Result<BackendClient> {
        match self {
            CdcService::Cosmos(o) => o.connect(config).await.map(BackendClient::Cosmos),
            CdcService::Mongo(o) => o.connect(config).await.map(BackendClient::Mongo),
        }
    }

    pub async fn process_change_feed(
        &self,
        client: &BackendClient,
        request: &FeedRequest,
        sink: &dyn Sink,
        cancel: CancellationToken,
    ) -> Result<CaptureSummary> {
        match (self, client) {
            (CdcService::Cosmos(o), BackendClient::Cosmos(c)) => {
                o.process_change_feed(c, request, sink, cancel).await
            }
            (CdcService::Mongo(o), BackendClient::Mongo(c)) => {
                o.process_change_feed(c, request, sink, cancel).await
            }
            (service, client) => Err(CdcError::ClientMismatch {
                client: client.backend_name(),
                service: service.backend_name(),
            }),
        }
    }
}
