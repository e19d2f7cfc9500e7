//! Durable storage for parley: the session registry, the message
//! (transaction) log, and the identity-boundary user table, all over SQLite.

pub mod database;
pub mod error;
pub mod messages;
pub mod row_helpers;
pub mod schema;
pub mod sessions;
pub mod users;

pub use database::Database;
pub use error::StoreError;
