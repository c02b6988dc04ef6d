//! redb table definitions for the pipegrid state store.

use redb::TableDefinition;

/// Versioned entries keyed by their dot-separated store key.
/// Values are JSON-serialized `KvEntry` records (live values and tombstones).
pub const ENTRIES: TableDefinition<&str, &[u8]> = TableDefinition::new("entries");

/// Raw blob payloads keyed by blob key.
pub const BLOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("blobs");

/// Store-wide counters.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Key in `META` holding the last issued revision.
pub const REVISION_KEY: &str = "revision";
