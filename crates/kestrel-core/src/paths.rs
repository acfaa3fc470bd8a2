//! Well-known control paths published by the cluster about itself.

/// Glob matching every node's advertised address entry. The `*` stands for
/// the node id.
pub const NODE_ADDR_GLOB: &str = "/ctl/node/*/addr";

/// Glob matching the current leader slots. Each entry's body is the id of
/// the node holding that slot, or empty when the slot is vacant.
pub const LEADER_GLOB: &str = "/ctl/cal/*";
