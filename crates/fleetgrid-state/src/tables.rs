//! redb table definitions for the fleetgrid state store.
//!
//! `&str` keys and `&[u8]` values holding JSON-serialized documents.

use redb::TableDefinition;

/// Config documents keyed by config name.
pub const CONFIGS: TableDefinition<&str, &[u8]> = TableDefinition::new("configs");
