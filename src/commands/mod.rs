// ABOUTME: Command implementations for the CLI subcommands
// ABOUTME: Exports the bounded capture and the long-lived listen commands

pub mod feed;

pub use feed::{capture, listen, FeedArgs};
