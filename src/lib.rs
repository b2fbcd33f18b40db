// ABOUTME: Library root for docdb-cdc, change data capture from document databases
// ABOUTME: Exposes backends, capture engines, the orchestrator and the runner

pub mod capture;
pub mod checkpoint;
pub mod commands;
pub mod config;
pub mod connection;
pub mod cosmos;
pub mod error;
pub mod factory;
pub mod memory;
pub mod mongo;
pub mod orchestrator;
pub mod runner;
pub mod sink;

pub use capture::{CaptureEngine, CaptureMode, CaptureOptions, CaptureSummary, StopReason};
pub use checkpoint::{checkpoint_id, CheckpointRecord, DEFAULT_CHECKPOINT_RESOURCE};
pub use connection::{ConnectionConfig, ConnectionLayer};
pub use error::{CdcError, Result};
pub use factory::{create_service, BackendClient, BackendKind, CdcService};
pub use orchestrator::{CdcOrchestrator, FeedRequest};
pub use sink::Sink;
