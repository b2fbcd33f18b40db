// ABOUTME: Cosmos DB connection string parsing
// ABOUTME: Extracts the account endpoint and master key from AccountEndpoint/AccountKey pairs

use anyhow::{anyhow, bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use url::Url;

/// Endpoint and decoded master key of a Cosmos DB account.
#[derive(Clone, PartialEq, Eq)]
pub struct CosmosConnectionInfo {
    pub endpoint: Url,
    pub key: Vec<u8>,
}

impl std::fmt::Debug for CosmosConnectionInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CosmosConnectionInfo")
            .field("endpoint", &self.endpoint.as_str())
            .field("key", &"***")
            .finish()
    }
}

/// Parse `AccountEndpoint=https://...;AccountKey=...;`.
///
/// Keys are case-insensitive, the trailing separator is optional and values may
/// contain `=` (base64 padding).
pub fn parse_connection_string(connection_string: &str) -> Result<CosmosConnectionInfo> {
    let trimmed = connection_string.trim();
    if trimmed.is_empty() {
        bail!("Connection string cannot be empty");
    }

    let mut endpoint = None;
    let mut key = None;
    for pair in trimmed.split(';').filter(|p| !p.trim().is_empty()) {
        let (name, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow!("Malformed connection string segment '{}'", pair))?;
        match name.trim().to_ascii_lowercase().as_str() {
            "accountendpoint" => endpoint = Some(value.trim()),
            "accountkey" => key = Some(value.trim()),
            _ => {}
        }
    }

    let endpoint = endpoint.ok_or_else(|| anyhow!("Connection string is missing AccountEndpoint"))?;
    let key = key.ok_or_else(|| anyhow!("Connection string is missing AccountKey"))?;

    let endpoint = Url::parse(endpoint)
        .with_context(|| format!("AccountEndpoint '{}' is not a valid URL", endpoint))?;
    if endpoint.scheme() != "https" && endpoint.scheme() != "http" {
        bail!("AccountEndpoint must use http or https");
    }
    let key = STANDARD
        .decode(key)
        .context("AccountKey is not valid base64")?;

    Ok(CosmosConnectionInfo { endpoint, key })
}
