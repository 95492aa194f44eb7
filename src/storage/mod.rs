//! Durable storage for pending events, outgoing requests and small counters.

pub mod dao;
pub mod database;
pub mod error;
pub mod persistable;

pub use dao::Dao;
pub use database::Database;
pub use error::StorageError;
pub use persistable::{Migration, Persistable, add_column};
