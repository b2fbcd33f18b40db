// ABOUTME: Error taxonomy for change feed capture
// ABOUTME: Classifies failures by the stage of the capture pipeline that produced them

use std::fmt;
use thiserror::Error;

/// Result type alias used across the capture pipeline
pub type Result<T> = std::result::Result<T, CdcError>;

/// The kind of named object a lookup failed to find.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Database,
    /// Container or collection whose kind the connection layer cannot tell apart
    Resource,
    Source,
    CheckpointResource,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Database => write!(f, "database"),
            ResourceKind::Resource => write!(f, "resource"),
            ResourceKind::Source => write!(f, "source resource"),
            ResourceKind::CheckpointResource => write!(f, "checkpoint resource"),
        }
    }
}

/// Pipeline step at which an invocation stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Setup,
    Connect,
    ResolveDatabase,
    ResolveSource,
    ResolveCheckpointResource,
    ReadCheckpoint,
    Capture,
    Deliver,
    PersistCheckpoint,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Setup => "setup",
            Stage::Connect => "connect",
            Stage::ResolveDatabase => "resolve database",
            Stage::ResolveSource => "resolve source resource",
            Stage::ResolveCheckpointResource => "resolve checkpoint resource",
            Stage::ReadCheckpoint => "read checkpoint",
            Stage::Capture => "capture",
            Stage::Deliver => "deliver batch",
            Stage::PersistCheckpoint => "persist checkpoint",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum CdcError {
    /// Malformed connection string or unreachable backend
    #[error("Failed to connect to {backend}: {message}")]
    Connect {
        backend: &'static str,
        message: String,
    },

    #[error("{kind} '{name}' does not exist")]
    NotFound { kind: ResourceKind, name: String },

    /// A stored checkpoint failed structural validation
    #[error("Failed to decode checkpoint '{id}': {message}")]
    Decode { id: String, message: String },

    /// The sink rejected a batch; the checkpoint was not advanced
    #[error("Sink rejected a batch of {records} record(s)")]
    Delivery {
        records: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to persist checkpoint '{id}': {message}")]
    Persist { id: String, message: String },

    /// Any other backend request failure
    #[error("{operation} failed: {message}")]
    Backend { operation: String, message: String },

    #[error("{0} backend is not supported yet")]
    Unsupported(String),

    #[error("Client for {client} cannot be used with the {service} service")]
    ClientMismatch {
        client: &'static str,
        service: &'static str,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl CdcError {
    pub fn connect(backend: &'static str, message: impl fmt::Display) -> Self {
        CdcError::Connect {
            backend,
            message: message.to_string(),
        }
    }

    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        CdcError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn decode(id: impl Into<String>, message: impl fmt::Display) -> Self {
        CdcError::Decode {
            id: id.into(),
            message: message.to_string(),
        }
    }

    pub fn persist(id: impl Into<String>, message: impl fmt::Display) -> Self {
        CdcError::Persist {
            id: id.into(),
            message: message.to_string(),
        }
    }

    pub fn backend(operation: impl Into<String>, message: impl fmt::Display) -> Self {
        CdcError::Backend {
            operation: operation.into(),
            message: message.to_string(),
        }
    }

    /// Narrow a generic "resource not found" into the role the caller resolved it for.
    /// Attribute a decode failure to the checkpoint record that held the token.
    pub fn for_checkpoint(self, id: &str) -> Self {
        match self {
            CdcError::Decode { message, .. } => CdcError::decode(id, message),
            other => other,
        }
    }

    pub fn for_resource(self, kind: ResourceKind) -> Self {
        match self {
            CdcError::NotFound {
                kind: ResourceKind::Resource,
                name,
            } => CdcError::NotFound { kind, name },
            other => other,
        }
    }

    /// The pipeline step this error belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            CdcError::Connect { .. } => Stage::Connect,
            CdcError::NotFound { kind, .. } => match kind {
                ResourceKind::Database => Stage::ResolveDatabase,
                ResourceKind::Source | ResourceKind::Resource => Stage::ResolveSource,
                ResourceKind::CheckpointResource => Stage::ResolveCheckpointResource,
            },
            CdcError::Decode { .. } => Stage::ReadCheckpoint,
            CdcError::Delivery { .. } => Stage::Deliver,
            CdcError::Persist { .. } => Stage::PersistCheckpoint,
            CdcError::Backend { .. } => Stage::Capture,
            CdcError::Unsupported(_) | CdcError::ClientMismatch { .. } | CdcError::Config(_) => {
                Stage::Setup
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_message_names_resource() {
        let err = CdcError::not_found(ResourceKind::Source, "orders");
        assert_eq!(err.to_string(), "source resource 'orders' does not exist");
        assert_eq!(err.stage(), Stage::ResolveSource);
    }

    #[test]
    fn test_for_checkpoint_names_the_record() {
        let err = CdcError::decode("orders", "invalid continuation token for 'orders': abc")
            .for_checkpoint("billing-orders");
        assert_eq!(
            err.to_string(),
            "Failed to decode checkpoint 'billing-orders': \
             invalid continuation token for 'orders': abc"
        );

        let err = CdcError::backend("Read change feed", "boom").for_checkpoint("billing-orders");
        assert_eq!(err.stage(), Stage::Capture);
    }

    #[test]
    fn test_for_resource_only_narrows_generic_lookups() {
        let err = CdcError::not_found(ResourceKind::Resource, "leases")
            .for_resource(ResourceKind::CheckpointResource);
        assert!(matches!(
            err,
            CdcError::NotFound {
                kind: ResourceKind::CheckpointResource,
                ..
            }
        ));

        let err = CdcError::not_found(ResourceKind::Database, "shop")
            .for_resource(ResourceKind::CheckpointResource);
        assert_eq!(err.stage(), Stage::ResolveDatabase);
    }

    #[test]
    fn test_delivery_error_keeps_sink_cause() {
        let err = CdcError::Delivery {
            records: 3,
            source: anyhow::anyhow!("queue unavailable"),
        };
        assert_eq!(err.stage(), Stage::Deliver);
        let cause = std::error::Error::source(&err).map(|e| e.to_string());
        assert_eq!(cause.as_deref(), Some("queue unavailable"));
    }

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::PersistCheckpoint.to_string(), "persist checkpoint");
        assert_eq!(
            CdcError::Unsupported("PostgreSQL".into()).stage(),
            Stage::Setup
        );
    }
}
