//! Store key namespaces for coordination records.
//!
//! Every record the coordination layer persists lives under one of three
//! prefixes, so a single backend can host leaders, locks, and the node
//! registry side by side, and watchers can subscribe per concern.
//!
//! | Record            | Key                         |
//! |-------------------|-----------------------------|
//! | Leader per group  | `cluster:leader/<group_id>` |
//! | Named lock        | `cluster:locks/<name>`      |
//! | Node registry     | `cluster:nodes/<node_id>`   |

/// Prefix for leader records.
pub const LEADER_PREFIX: &str = "cluster:leader/";

/// Prefix for lock records.
pub const LOCK_PREFIX: &str = "cluster:locks/";

/// Prefix for node registry records.
pub const NODES_PREFIX: &str = "cluster:nodes/";

/// Store key for a group's leader record.
pub fn leader_key(group_id: &str) -> String {
    format!("{LEADER_PREFIX}{group_id}")
}

/// Store key for a named lock record.
pub fn lock_key(name: &str) -> String {
    format!("{LOCK_PREFIX}{name}")
}

/// Store key for a node registry record.
pub fn node_key(node_id: &str) -> String {
    format!("{NODES_PREFIX}{node_id}")
}

/// Recover the lock name from a full lock key, if it is one.
pub fn lock_name(key: &str) -> Option<&str> {
    key.strip_prefix(LOCK_PREFIX)
}

/// Recover the node id from a full node registry key, if it is one.
pub fn node_id(key: &str) -> Option<&str> {
    key.strip_prefix(NODES_PREFIX)
}
