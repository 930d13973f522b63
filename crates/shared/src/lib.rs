//! Classbook Shared Types and Utilities
//!
//! This crate contains the document store, document types and errors shared
//! across the Classbook services.

pub mod db;
pub mod error;
pub mod memory;
pub mod postgres;
pub mod store;
pub mod types;

pub use db::*;
pub use error::*;
pub use memory::MemoryDocumentStore;
pub use postgres::PgDocumentStore;
pub use store::{merge_top_level, to_body, Document, DocumentStore, Filter, WriteOp};
pub use types::*;
