// ABOUTME: Cosmos DB incremental change feed over partition key ranges
// ABOUTME: Tracks one etag per range and folds them into a single continuation token

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::client::{error_message, CosmosClient, CosmosRequest};
use super::connection::CosmosContainer;
use crate::capture::poll::{ChangeFeed, FeedPage};
use crate::error::{CdcError, Result};

/// Continuation token of a whole container: partition key range id to etag.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedContinuation {
    pub ranges: BTreeMap<String, String>,
}

impl FeedContinuation {
    pub fn parse(token: &str) -> serde_json::Result<Self> {
        serde_json::from_str(token)
    }

    pub fn to_token(&self) -> String {
        // A map of strings always serializes
        serde_json::to_string(self).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PartitionKeyRange {
    pub id: String,
    #[serde(default)]
    pub parents: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct PartitionKeyRangeList {
    #[serde(rename = "PartitionKeyRanges")]
    ranges: Vec<PartitionKeyRange>,
}

#[derive(Debug, Deserialize)]
struct DocumentList {
    #[serde(rename = "Documents", default)]
    documents: Vec<Value>,
}

/// What one change feed request for a single partition key range answered.
#[derive(Debug, Clone, PartialEq)]
pub enum RangeResponse {
    /// 304: nothing past the etag that was sent.
    NotModified { etag: Option<String> },
    /// 410: the range was split or merged away.
    Gone,
    /// Any 2xx answer with its body.
    Documents {
        etag: Option<String>,
        documents: Vec<Value>,
    },
}

impl RangeResponse {
    /// Answers decided by the status alone; `None` when the body has to be read.
    pub fn from_status(status: StatusCode, etag: Option<String>) -> Option<Self> {
        match status {
            StatusCode::NOT_MODIFIED => Some(RangeResponse::NotModified { etag }),
            StatusCode::GONE => Some(RangeResponse::Gone),
            _ => None,
        }
    }
}

/// Round-robin position over partition key ranges.
///
/// The feed is drained once every range answered "not modified" in a row.
#[derive(Debug, Clone)]
pub struct FeedCursor {
    ranges: Vec<String>,
    etags: BTreeMap<String, String>,
    index: usize,
    unchanged_streak: usize,
}

impl FeedCursor {
    /// Ranges missing from `start` resume from their nearest known parent, or from
    /// the beginning when no ancestor is known.
    pub fn new(ranges: Vec<PartitionKeyRange>, start: Option<FeedContinuation>) -> Self {
        let known = start.map(|c| c.ranges).unwrap_or_default();
        let mut etags = BTreeMap::new();
        for range in &ranges {
            let inherited = known.get(&range.id).or_else(|| {
                range
                    .parents
                    .iter()
                    .rev()
                    .find_map(|parent| known.get(parent))
            });
            if let Some(etag) = inherited {
                etags.insert(range.id.clone(), etag.clone());
            }
        }
        Self {
            ranges: ranges.into_iter().map(|r| r.id).collect(),
            etags,
            index: 0,
            unchanged_streak: 0,
        }
    }

    pub fn is_drained(&self) -> bool {
        self.unchanged_streak >= self.ranges.len()
    }

    /// Range to read next and its etag, if any.
    pub fn current(&self) -> Option<(&str, Option<&str>)> {
        let range = self.ranges.get(self.index)?;
        Some((range.as_str(), self.etags.get(range).map(String::as_str)))
    }

    /// The current range produced documents up to `etag`; returns the new token.
    pub fn record_changes(&mut self, etag: String) -> String {
        self.set_current_etag(etag);
        self.unchanged_streak = 0;
        self.advance();
        self.continuation().to_token()
    }

    /// The current range had nothing new.
    pub fn record_unchanged(&mut self, etag: Option<String>) {
        if let Some(etag) = etag {
            self.set_current_etag(etag);
        }
        self.unchanged_streak += 1;
        self.advance();
    }

    /// Fold the current range's answer into the cursor.
    ///
    /// A 2xx answer without documents counts as unchanged. `Gone` is only passed here
    /// once the layout was already reloaded, so it is an error.
    pub fn apply(&mut self, response: RangeResponse, container: &str) -> Result<FeedPage> {
        let failed = |message: &str| {
            CdcError::backend(format!("Read change feed of '{}'", container), message)
        };
        match response {
            RangeResponse::NotModified { etag } => {
                self.record_unchanged(etag);
                Ok(FeedPage::NotModified)
            }
            RangeResponse::Documents {
                etag: Some(etag),
                documents,
            } if !documents.is_empty() => {
                let continuation = self.record_changes(etag);
                Ok(FeedPage::Changes {
                    documents,
                    continuation,
                })
            }
            RangeResponse::Documents { etag: Some(etag), .. } => {
                self.record_unchanged(Some(etag));
                Ok(FeedPage::NotModified)
            }
            RangeResponse::Documents { etag: None, .. } => Err(failed("response carried no etag")),
            RangeResponse::Gone => Err(failed("partition key range is gone after reloading")),
        }
    }

    pub fn continuation(&self) -> FeedContinuation {
        FeedContinuation {
            ranges: self.etags.clone(),
        }
    }

    fn set_current_etag(&mut self, etag: String) {
        if let Some(range) = self.ranges.get(self.index) {
            self.etags.insert(range.clone(), etag);
        }
    }

    fn advance(&mut self) {
        if !self.ranges.is_empty() {
            self.index = (self.index + 1) % self.ranges.len();
        }
    }
}

/// List the partition key ranges of a container, following continuations.
pub async fn list_partition_key_ranges(
    client: &CosmosClient,
    container: &CosmosContainer,
) -> Result<Vec<PartitionKeyRange>> {
    let mut ranges = Vec::new();
    let mut continuation: Option<String> = None;
    loop {
        let mut request =
            CosmosRequest::new(Method::GET, container.segments_with("pkranges"), "pkranges");
        if let Some(token) = &continuation {
            request = request.header("x-ms-continuation", token.clone());
        }
        let response = client.send(request).await?;
        if !response.status().is_success() {
            return Err(CdcError::backend(
                format!("List partition key ranges of '{}'", container.name),
                error_message(response).await,
            ));
        }
        continuation = header_string(&response, "x-ms-continuation");
        let page: PartitionKeyRangeList = response.json().await.map_err(|e| {
            CdcError::backend(format!("Decode partition key ranges of '{}'", container.name), e)
        })?;
        ranges.extend(page.ranges);
        if continuation.is_none() {
            break;
        }
    }
    Ok(ranges)
}

fn header_string(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Change feed iterator over a container.
pub struct CosmosFeed {
    client: CosmosClient,
    container: CosmosContainer,
    cursor: FeedCursor,
    page_size: u32,
}

impl CosmosFeed {
    pub fn new(
        client: CosmosClient,
        container: CosmosContainer,
        cursor: FeedCursor,
        page_size: u32,
    ) -> Self {
        Self {
            client,
            container,
            cursor,
            page_size,
        }
    }

    fn feed_request(&self, range: &str, etag: Option<&str>) -> CosmosRequest {
        let segments = self.container.segments_with("docs");
        let mut request = CosmosRequest::new(Method::GET, segments, "docs")
            .header("a-im", "Incremental feed")
            .header("x-ms-max-item-count", self.page_size.to_string())
            .header("x-ms-documentdb-partitionkeyrangeid", range);
        if let Some(etag) = etag {
            request = request.header("if-none-match", etag);
        }
        request
    }

    async fn reload_ranges(&mut self) -> Result<()> {
        let ranges = list_partition_key_ranges(&self.client, &self.container).await?;
        tracing::info!(
            "Partition layout of '{}' changed, now {} range(s)",
            self.container.name,
            ranges.len()
        );
        self.cursor = FeedCursor::new(ranges, Some(self.cursor.continuation()));
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for CosmosFeed {
    async fn next_page(&mut self) -> Result<Option<FeedPage>> {
        let mut reloaded = false;
        loop {
            if self.cursor.is_drained() {
                return Ok(None);
            }
            let request = match self.cursor.current() {
                Some((range, etag)) => self.feed_request(range, etag),
                None => return Ok(None),
            };

            let response = self.client.send(request).await?;
            let status = response.status();
            let etag = header_string(&response, "etag");
            let answer = match RangeResponse::from_status(status, etag.clone()) {
                Some(answer) => answer,
                None if !status.is_success() => {
                    return Err(CdcError::backend(
                        format!("Read change feed of '{}'", self.container.name),
                        error_message(response).await,
                    ));
                }
                None => {
                    let page: DocumentList = response.json().await.map_err(|e| {
                        let operation = format!("Decode change feed of '{}'", self.container.name);
                        CdcError::backend(operation, e)
                    })?;
                    RangeResponse::Documents {
                        etag,
                        documents: page.documents,
                    }
                }
            };

            // A split retires the range; reload once and retry with the children
            if answer == RangeResponse::Gone && !reloaded {
                reloaded = true;
                self.reload_ranges().await?;
                continue;
            }

            return self.cursor.apply(answer, &self.container.name).map(Some);
        }
    }
}
