// ABOUTME: TOML configuration for a change feed: source, checkpoint lease and capture limits
// ABOUTME: Command-line overrides are merged on top of the file before validation

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::capture::CaptureOptions;
use crate::connection::ConnectionConfig;
use crate::error::{CdcError, Result};
use crate::factory::BackendKind;
use crate::orchestrator::FeedRequest;

const DEFAULT_LISTEN_INTERVAL_MS: u64 = 5_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CdcConfig {
    pub source: SourceConfig,
    #[serde(default)]
    pub change_feed: ChangeFeedConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
}

/// Where changes come from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    #[serde(rename = "type")]
    pub kind: BackendKind,
    /// Connection string, interpreted by the backend.
    pub uri: String,
    pub db_name: String,
    /// Container or collection to capture.
    pub resource_name: String,
}

/// Where checkpoints ("leases") live.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChangeFeedConfig {
    pub lease_container_name: Option<String>,
    pub lease_container_prefix: Option<String>,
    #[serde(default)]
    pub create_lease_container_if_not_exists: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CaptureConfig {
    pub timeout_ms: Option<u64>,
    pub page_size: Option<u32>,
    pub listen_interval_ms: Option<u64>,
}

impl CdcConfig {
    /// Read and validate a TOML file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config = Self::from_toml(&content)
            .with_context(|| format!("Invalid config file {:?}", path))?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        require_non_empty("source.uri", &self.source.uri)?;
        require_non_empty("source.db_name", &self.source.db_name)?;
        require_non_empty("source.resource_name", &self.source.resource_name)?;
        if let Some(name) = &self.change_feed.lease_container_name {
            require_non_empty("change_feed.lease_container_name", name)?;
        }
        if let Some(prefix) = &self.change_feed.lease_container_prefix {
            require_non_empty("change_feed.lease_container_prefix", prefix)?;
        }
        if self.capture.listen_interval_ms == Some(0) {
            return Err(CdcError::Config(
                "capture.listen_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig::new(self.source.uri.clone())
    }

    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            prefix: self.change_feed.lease_container_prefix.clone(),
            time_budget: self.capture.timeout_ms.map(Duration::from_millis),
            page_size: self.capture.page_size,
            create_checkpoint_resource: self.change_feed.create_lease_container_if_not_exists,
        }
    }

    pub fn feed_request(&self) -> FeedRequest {
        let request = FeedRequest::new(&self.source.db_name, &self.source.resource_name)
            .with_options(self.capture_options());
        match &self.change_feed.lease_container_name {
            Some(name) => request.with_checkpoint_resource(name),
            None => request,
        }
    }

    pub fn listen_interval(&self) -> Duration {
        Duration::from_millis(
            self.capture
                .listen_interval_ms
                .unwrap_or(DEFAULT_LISTEN_INTERVAL_MS),
        )
    }
}

fn require_non_empty(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CdcError::Config(format!("{} cannot be empty", field)));
    }
    Ok(())
}

/// Values given on the command line. Each one replaces the file's value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub backend: Option<BackendKind>,
    pub connection: Option<String>,
    pub database: Option<String>,
    pub source: Option<String>,
    pub checkpoint_resource: Option<String>,
    pub prefix: Option<String>,
    pub create_checkpoint_resource: bool,
    pub timeout_ms: Option<u64>,
    pub page_size: Option<u32>,
    pub listen_interval_ms: Option<u64>,
}

impl ConfigOverrides {
    /// Merge onto `base`, or build a config from the overrides alone.
    pub fn apply(self, base: Option<CdcConfig>) -> anyhow::Result<CdcConfig> {
        let mut config = match base {
            Some(config) => config,
            None => CdcConfig {
                source: SourceConfig {
                    kind: match self.backend {
                        Some(kind) => kind,
                        None => bail!("--backend is required without --config"),
                    },
                    uri: String::new(),
                    db_name: String::new(),
                    resource_name: String::new(),
                },
                change_feed: ChangeFeedConfig::default(),
                capture: CaptureConfig::default(),
            },
        };

        if let Some(kind) = self.backend {
            config.source.kind = kind;
        }
        if let Some(uri) = self.connection {
            config.source.uri = uri;
        }
        if let Some(database) = self.database {
            config.source.db_name = database;
        }
        if let Some(source) = self.source {
            config.source.resource_name = source;
        }
        if self.checkpoint_resource.is_some() {
            config.change_feed.lease_container_name = self.checkpoint_resource;
        }
        if self.prefix.is_some() {
            config.change_feed.lease_container_prefix = self.prefix;
        }
        if self.create_checkpoint_resource {
            config.change_feed.create_lease_container_if_not_exists = true;
        }
        if self.timeout_ms.is_some() {
            config.capture.timeout_ms = self.timeout_ms;
        }
        if self.page_size.is_some() {
            config.capture.page_size = self.page_size;
        }
        if self.listen_interval_ms.is_some() {
            config.capture.listen_interval_ms = self.listen_interval_ms;
        }

        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const FULL: &str = r#"
[source]
type = "MongoDB"
uri = "mongodb://localhost:27017"
db_name = "shop"
resource_name = "orders"

[change_feed]
lease_container_name = "leases"
lease_container_prefix = "billing-"
create_lease_container_if_not_exists = true

[capture]
timeout_ms = 60000
page_size = 100
"#;

    #[test]
    fn test_parse_full_config() {
        let config = CdcConfig::from_toml(FULL).unwrap();
        assert_eq!(config.source.kind, BackendKind::MongoDb);
        assert_eq!(config.listen_interval(), Duration::from_millis(5_000));

        let request = config.feed_request();
        assert_eq!(request.database, "shop");
        assert_eq!(request.source, "orders");
        assert_eq!(request.checkpoint_resource.as_deref(), Some("leases"));
        assert_eq!(request.options.prefix.as_deref(), Some("billing-"));
        assert_eq!(request.options.time_budget, Some(Duration::from_secs(60)));
        assert_eq!(request.options.page_size, Some(100));
        assert!(request.options.create_checkpoint_resource);
    }

    #[test]
    fn test_minimal_config_uses_default_lease() {
        let config = CdcConfig::from_toml(
            r#"
[source]
type = "cosmosdb"
uri = "AccountEndpoint=https://localhost:8081/;AccountKey=a2V5"
db_name = "shop"
resource_name = "orders"
"#,
        )
        .unwrap();
        assert_eq!(config.source.kind, BackendKind::CosmosDb);
        let request = config.feed_request();
        assert_eq!(request.checkpoint_resource, None);
        assert_eq!(request.options, CaptureOptions::default());
    }

    #[test]
    fn test_rejects_empty_fields_and_unknown_backend() {
        let empty_db = FULL.replace("db_name = \"shop\"", "db_name = \"\"");
        let err = CdcConfig::from_toml(&empty_db).unwrap_err();
        assert!(format!("{:#}", err).contains("source.db_name cannot be empty"));

        let unknown = FULL.replace("MongoDB", "Cassandra");
        assert!(CdcConfig::from_toml(&unknown).is_err());

        let empty_prefix = FULL.replace("\"billing-\"", "\"\"");
        assert!(CdcConfig::from_toml(&empty_prefix).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(FULL.as_bytes()).unwrap();
        let config = CdcConfig::load(file.path()).unwrap();
        assert_eq!(config.source.resource_name, "orders");

        assert!(CdcConfig::load(Path::new("/nonexistent/cdc.toml")).is_err());
    }

    #[test]
    fn test_overrides_replace_file_values() {
        let base = CdcConfig::from_toml(FULL).unwrap();
        let config = ConfigOverrides {
            source: Some("invoices".into()),
            prefix: Some("audit-".into()),
            page_size: Some(5),
            ..Default::default()
        }
        .apply(Some(base))
        .unwrap();
        assert_eq!(config.source.resource_name, "invoices");
        assert_eq!(config.source.db_name, "shop");
        assert_eq!(config.change_feed.lease_container_prefix.as_deref(), Some("audit-"));
        assert_eq!(config.capture.page_size, Some(5));
    }

    #[test]
    fn test_overrides_without_file_need_every_source_field() {
        let missing_backend = ConfigOverrides::default().apply(None).unwrap_err();
        assert!(missing_backend.to_string().contains("--backend"));

        let missing_source = ConfigOverrides {
            backend: Some(BackendKind::MongoDb),
            connection: Some("mongodb://localhost".into()),
            database: Some("shop".into()),
            ..Default::default()
        }
        .apply(None)
        .unwrap_err();
        assert!(missing_source.to_string().contains("source.resource_name"));
    }

    #[test]
    fn test_zero_listen_interval_is_rejected() {
        let in_file = format!("{}listen_interval_ms = 0\n", FULL);
        let err = CdcConfig::from_toml(&in_file).unwrap_err();
        assert!(format!("{:#}", err).contains("capture.listen_interval_ms must be at least 1"));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(in_file.as_bytes()).unwrap();
        assert!(CdcConfig::load(file.path()).is_err());

        let from_flags = ConfigOverrides {
            backend: Some(BackendKind::CosmosDb),
            connection: Some("AccountEndpoint=https://localhost:8081/;AccountKey=a2V5".into()),
            database: Some("shop".into()),
            source: Some("orders".into()),
            listen_interval_ms: Some(0),
            ..Default::default()
        }
        .apply(None)
        .unwrap_err();
        assert!(from_flags.to_string().contains("listen_interval_ms"));

        let base = CdcConfig::from_toml(FULL).unwrap();
        let override_only = ConfigOverrides {
            listen_interval_ms: Some(0),
            ..Default::default()
        }
        .apply(Some(base));
        assert!(override_only.is_err());
    }

    #[test]
    fn test_zero_page_size_falls_back_to_one() {
        let zero = FULL.replace("page_size = 100", "page_size = 0");
        let config = CdcConfig::from_toml(&zero).unwrap();
        let request = config.feed_request();
        assert_eq!(request.options.page_size, Some(0));
        assert_eq!(request.options.effective_page_size(), 1);
    }
}
