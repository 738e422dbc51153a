//! Database module for PostgreSQL connectivity
//!
//! Schema introspection and read-only execution against a PostgreSQL pool.

pub mod connection;
pub mod postgres;

pub use connection::{init_pool, DbPool};
pub use postgres::PgDatabase;
