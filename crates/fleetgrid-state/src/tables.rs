//! redb table definitions for the FleetGrid state store.

use redb::TableDefinition;

/// Game server mirror rows keyed by `{namespace}/{name}`, JSON values.
pub const ENTITIES: TableDefinition<&str, &[u8]> = TableDefinition::new("gameservers");

/// Port registry keyed by port number. The value is the reservation time
/// in Unix seconds; only the key's presence matters.
pub const PORTS: TableDefinition<u16, u64> = TableDefinition::new("ports");
