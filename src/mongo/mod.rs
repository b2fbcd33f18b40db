// ABOUTME: MongoDB backend for the subscription capture engine
// ABOUTME: Change streams with resume tokens persisted as lease documents

pub mod connection;
pub mod stream;

pub use connection::MongoLayer;
