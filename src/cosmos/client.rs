// ABOUTME: Minimal Cosmos DB REST client signing requests with the account master key
// ABOUTME: Builds resource links, date and authorization headers for each call

use std::sync::Arc;

use anyhow::Context;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, Response, StatusCode};
use serde_json::Value;
use sha2::Sha256;
use url::Url;

use super::config::CosmosConnectionInfo;
use crate::error::{CdcError, Result};

const API_VERSION: &str = "2018-12-31";

type HmacSha256 = Hmac<Sha256>;

/// Build the master-key authorization header value for one request.
///
/// The signed payload is `verb\nresourceType\nresourceLink\ndate\n\n` with verb,
/// resource type and date lowercased; the link keeps its original casing.
pub fn authorization_token(
    key: &[u8],
    verb: &Method,
    resource_type: &str,
    resource_link: &str,
    date: &str,
) -> anyhow::Result<String> {
    let payload = format!(
        "{}\n{}\n{}\n{}\n\n",
        verb.as_str().to_lowercase(),
        resource_type.to_lowercase(),
        resource_link,
        date.to_lowercase()
    );
    let mut mac = HmacSha256::new_from_slice(key).context("Invalid account key length")?;
    mac.update(payload.as_bytes());
    let signature = STANDARD.encode(mac.finalize().into_bytes());
    let token = format!("type=master&ver=1.0&sig={}", signature);
    Ok(url::form_urlencoded::byte_serialize(token.as_bytes()).collect())
}

/// RFC 1123 timestamp as required by the `x-ms-date` header.
pub fn request_date(now: chrono::DateTime<chrono::Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// One REST call against a resource path such as `["dbs", "shop", "colls", "orders"]`.
#[derive(Debug, Clone)]
pub struct CosmosRequest {
    pub method: Method,
    /// Unencoded path segments of the request URL.
    pub segments: Vec<String>,
    /// Type of the resource addressed, e.g. `dbs`, `colls`, `docs`, `pkranges`.
    pub resource_type: &'static str,
    /// Unencoded id-based link of the resource the signature covers.
    pub resource_link: String,
    pub headers: Vec<(&'static str, String)>,
    pub body: Option<Value>,
}

impl CosmosRequest {
    pub fn new(method: Method, segments: Vec<String>, resource_type: &'static str) -> Self {
        // Feeds and creates sign the parent link, point reads sign their own link
        let link_len = if segments.len() % 2 == 0 {
            segments.len()
        } else {
            segments.len() - 1
        };
        let resource_link = segments[..link_len].join("/");
        Self {
            method,
            segments,
            resource_type,
            resource_link,
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn header(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.headers.push((name, value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Shared handle to a Cosmos DB account. Cheap to clone.
#[derive(Clone)]
pub struct CosmosClient {
    http: reqwest::Client,
    endpoint: Url,
    key: Arc<Vec<u8>>,
}

impl std::fmt::Debug for CosmosClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CosmosClient")
            .field("endpoint", &self.endpoint.as_str())
            .finish()
    }
}

impl CosmosClient {
    pub fn new(info: CosmosConnectionInfo) -> Result<Self> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| CdcError::connect("Cosmos DB", e))?;
        Ok(Self {
            http,
            endpoint: info.endpoint,
            key: Arc::new(info.key),
        })
    }

    fn url_for(&self, segments: &[String]) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| CdcError::connect("Cosmos DB", "endpoint cannot be a base URL"))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn headers_for(&self, request: &CosmosRequest) -> Result<HeaderMap> {
        let date = request_date(chrono::Utc::now());
        let auth = authorization_token(
            &self.key,
            &request.method,
            request.resource_type,
            &request.resource_link,
            &date,
        )
        .map_err(|e| CdcError::connect("Cosmos DB", e))?;

        let mut headers = HeaderMap::new();
        let fixed = [
            ("authorization", auth),
            ("x-ms-date", date),
            ("x-ms-version", API_VERSION.to_string()),
        ];
        for (name, value) in fixed.into_iter().chain(request.headers.iter().cloned()) {
            let value = HeaderValue::from_str(&value)
                .map_err(|e| CdcError::backend(format!("Header {}", name), e))?;
            headers.insert(HeaderName::from_static(name), value);
        }
        Ok(headers)
    }

    /// Sign and send a request. Transport failures surface as `Backend` errors;
    /// callers interpret status codes.
    pub async fn send(&self, request: CosmosRequest) -> Result<Response> {
        let url = self.url_for(&request.segments)?;
        let headers = self.headers_for(&request)?;
        let mut builder = self
            .http
            .request(request.method.clone(), url)
            .headers(headers);
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }
        builder.send().await.map_err(|e| {
            CdcError::backend(
                format!("{} /{}", request.method, request.segments.join("/")),
                e,
            )
        })
    }
}

/// Turn a non-success response into a readable message including the body.
pub async fn error_message(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    if body.is_empty() {
        status.to_string()
    } else {
        format!("{}: {}", status, body)
    }
}

pub fn is_not_found(status: StatusCode) -> bool {
    status == StatusCode::NOT_FOUND
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn key() -> Vec<u8> {
        STANDARD.decode("bXlBY2NvdW50S2V5MTIz").unwrap()
    }

    #[test]
    fn test_request_date_is_rfc1123() {
        let now = chrono::Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(request_date(now), "Mon, 01 Jan 2024 00:00:00 GMT");
    }

    #[test]
    fn test_authorization_token_signature() {
        let token = authorization_token(
            &key(),
            &Method::GET,
            "dbs",
            "dbs/shop",
            "Mon, 01 Jan 2024 00:00:00 GMT",
        )
        .unwrap();
        assert_eq!(
            token,
            "type%3Dmaster%26ver%3D1.0%26sig%3DXcnF2vN3HDnn65RYlt9BZhLEKHCq2e1TwtLPb7iD%2Bok%3D"
        );
    }

    #[test]
    fn test_resource_link_for_feeds_and_point_reads() {
        let feed = CosmosRequest::new(
            Method::GET,
            vec!["dbs".into(), "shop".into(), "colls".into(), "orders".into(), "docs".into()],
            "docs",
        );
        assert_eq!(feed.resource_link, "dbs/shop/colls/orders");

        let read = CosmosRequest::new(
            Method::GET,
            vec![
                "dbs".into(),
                "shop".into(),
                "colls".into(),
                "leases".into(),
                "docs".into(),
                "orders".into(),
            ],
            "docs",
        );
        assert_eq!(read.resource_link, "dbs/shop/colls/leases/docs/orders");
    }

    #[test]
    fn test_url_encodes_segments() {
        let client = CosmosClient::new(CosmosConnectionInfo {
            endpoint: Url::parse("https://localhost:8081/").unwrap(),
            key: key(),
        })
        .unwrap();
        let url = client
            .url_for(&["dbs".into(), "my db".into()])
            .unwrap();
        assert_eq!(url.as_str(), "https://localhost:8081/dbs/my%20db");
    }
}
