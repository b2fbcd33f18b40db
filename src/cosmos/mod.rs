// ABOUTME: Cosmos DB backend for the poll capture engine
// ABOUTME: Signed REST client, connection layer and partition-aware change feed

pub mod client;
pub mod config;
pub mod connection;
pub mod feed;

pub use client::CosmosClient;
pub use config::{parse_connection_string, CosmosConnectionInfo};
pub use connection::{CosmosContainer, CosmosDatabase, CosmosLayer};
pub use feed::{CosmosFeed, FeedContinuation};
