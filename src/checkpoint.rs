// ABOUTME: Checkpoint records and the per-source checkpoint store
// ABOUTME: Derives deterministic record ids and upserts resume tokens after delivery

use serde::{Deserialize, Serialize};

use crate::connection::ConnectionLayer;
use crate::error::Result;

/// Name of the checkpoint resource created when the caller does not name one.
pub const DEFAULT_CHECKPOINT_RESOURCE: &str = "cdc-data-lease";

/// Persisted marker of the last successfully delivered position for one
/// `(source, prefix)` pair. The token is opaque outside the backend that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: String,
    #[serde(rename = "lease")]
    pub token: String,
}

impl CheckpointRecord {
    pub fn new(id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            token: token.into(),
        }
    }
}

/// Replace embedded spaces so the value is usable as a document id.
pub fn normalize(value: &str) -> String {
    value.replace(' ', "-")
}

/// Record id for a source, optionally namespaced by a consumer prefix.
///
/// ```
/// # use docdb_cdc::checkpoint::checkpoint_id;
/// assert_eq!(checkpoint_id("order items", None), "order-items");
/// assert_eq!(checkpoint_id("orders", Some("billing ")), "billing-orders");
/// ```
pub fn checkpoint_id(source: &str, prefix: Option<&str>) -> String {
    let prefix = prefix.map(normalize).unwrap_or_default();
    format!("{}{}", prefix, normalize(source))
}

/// Naming policy a backend pairs with its connection layer and capture engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckpointNaming {
    pub default_resource: &'static str,
}

impl Default for CheckpointNaming {
    fn default() -> Self {
        Self {
            default_resource: DEFAULT_CHECKPOINT_RESOURCE,
        }
    }
}

impl CheckpointNaming {
    pub fn record_id(&self, source: &str, prefix: Option<&str>) -> String {
        checkpoint_id(source, prefix)
    }
}

/// Checkpoint record of one source inside a resolved checkpoint resource.
pub struct CheckpointStore<'a, L: ConnectionLayer> {
    layer: &'a L,
    resource: &'a L::Resource,
    id: String,
}

impl<'a, L: ConnectionLayer> CheckpointStore<'a, L> {
    pub fn new(layer: &'a L, resource: &'a L::Resource, id: String) -> Self {
        Self {
            layer,
            resource,
            id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Read the stored token. A missing record means "start from the beginning".
    pub async fn load(&self) -> Result<Option<String>> {
        let record = self.layer.read_checkpoint(self.resource, &self.id).await?;
        Ok(record.map(|r| r.token))
    }

    /// Upsert the token of the batch that was just delivered.
    pub async fn advance(&self, token: &str) -> Result<()> {
        let record = CheckpointRecord::new(self.id.clone(), token);
        self.layer.write_checkpoint(self.resource, &record).await?;
        tracing::debug!(checkpoint = %self.id, "checkpoint advanced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_id_without_prefix() {
        assert_eq!(checkpoint_id("orders", None), "orders");
    }

    #[test]
    fn test_checkpoint_id_normalizes_every_space() {
        assert_eq!(
            checkpoint_id("open order items", Some("team a ")),
            "team-a-open-order-items"
        );
    }

    #[test]
    fn test_empty_prefix_matches_no_prefix() {
        assert_eq!(checkpoint_id("orders", Some("")), checkpoint_id("orders", None));
    }

    #[test]
    fn test_default_naming_policy() {
        let naming = CheckpointNaming::default();
        assert_eq!(naming.default_resource, "cdc-data-lease");
        assert_eq!(naming.record_id("a b", Some("p-")), "p-a-b");
    }

    #[test]
    fn test_record_serializes_token_as_lease() {
        let record = CheckpointRecord::new("orders", "42");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json, serde_json::json!({"id": "orders", "lease": "42"}));
    }
}
