//! redb table definitions for the relaygrid state store.
//!
//! Keys are `&str`, values are JSON-serialized domain types.

use redb::TableDefinition;

/// Jobs keyed by job name.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Cursors keyed by `{job}:{channel}`.
pub const CURSORS: TableDefinition<&str, &[u8]> = TableDefinition::new("cursors");
