//! MongoDB access layer
//!
//! Typed collection wrapper plus the document schemas the broker persists.

pub mod mongo;
pub mod schemas;

pub use mongo::{IntoIndexes, MongoClient, MongoCollection, MutMetadata};
