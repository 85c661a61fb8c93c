//! SQLite registry of gateways and their devices.

pub mod directory;

/// SQLite implementation of the gateway directory.
pub use directory::{GatewayRecord, SqliteDirectory};
