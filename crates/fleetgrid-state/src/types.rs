//! Row types for the FleetGrid state store.
//!
//! Mirror rows are sparse: every property except the identity is optional,
//! and values are kept as the strings that were reported so that equality
//! queries (`Status eq 'Running'`, `ActiveSessions eq '0'`) compare exactly
//! what was written.

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// Status value for an instance that has been created but is not serving yet.
pub const STATUS_CREATING: &str = "Creating";

/// Status value for a serving instance.
pub const STATUS_RUNNING: &str = "Running";

/// Status value for an instance unlinked from its collection and waiting
/// for its sessions to drain.
pub const STATUS_MARKED_FOR_DELETION: &str = "MarkedForDeletion";

/// Build the table key for a mirror row.
pub fn entity_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

// ── Game server entity ─────────────────────────────────────────────

/// Mirror row for a single game server instance.
///
/// Used both as the stored row and as a patch: when passed to
/// [`StateStore::upsert_entity`](crate::StateStore::upsert_entity), only the
/// properties that are present and non-empty are written.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GameServerEntity {
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_sessions: Option<String>,
}

impl GameServerEntity {
    /// Identity-only row (an empty patch).
    pub fn new(namespace: &str, name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port.to_string());
        self
    }

    pub fn with_status(mut self, status: &str) -> Self {
        self.status = Some(status.to_string());
        self
    }

    pub fn with_active_sessions(mut self, sessions: u32) -> Self {
        self.active_sessions = Some(sessions.to_string());
        self
    }

    pub fn with_public_ip(mut self, ip: &str) -> Self {
        self.public_ip = Some(ip.to_string());
        self
    }

    pub fn with_node_name(mut self, node: &str) -> Self {
        self.node_name = Some(node.to_string());
        self
    }

    pub fn table_key(&self) -> String {
        entity_key(&self.namespace, &self.name)
    }

    /// The recorded port as a number.
    ///
    /// `Ok(None)` when no port is recorded; `InvalidPort` when the stored
    /// value is not a port number.
    pub fn parsed_port(&self) -> StateResult<Option<u16>> {
        self.port
            .as_deref()
            .map(|value| {
                value.parse::<u16>().map_err(|_| StateError::InvalidPort {
                    key: self.table_key(),
                    value: value.to_string(),
                })
            })
            .transpose()
    }

    /// Whether both identity properties are set.
    pub fn has_identity(&self) -> bool {
        !self.namespace.is_empty() && !self.name.is_empty()
    }

    /// Value of a queryable property, if present.
    pub fn field(&self, field: EntityField) -> Option<&str> {
        let value = match field {
            EntityField::PublicIp => &self.public_ip,
            EntityField::NodeName => &self.node_name,
            EntityField::Status => &self.status,
            EntityField::Port => &self.port,
            EntityField::ActiveSessions => &self.active_sessions,
        };
        value.as_deref()
    }

    /// Merge the non-empty properties of `patch` into this row.
    ///
    /// Properties absent from the patch are left untouched.
    pub fn merge(&mut self, patch: &GameServerEntity) {
        merge_prop(&mut self.public_ip, &patch.public_ip);
        merge_prop(&mut self.node_name, &patch.node_name);
        merge_prop(&mut self.status, &patch.status);
        merge_prop(&mut self.port, &patch.port);
        merge_prop(&mut self.active_sessions, &patch.active_sessions);
    }
}

fn merge_prop(target: &mut Option<String>, patch: &Option<String>) {
    if let Some(value) = patch.as_ref().filter(|v| !v.is_empty()) {
        *target = Some(value.clone());
    }
}

/// Entries removed by [`StateStore::retain_live`](crate::StateStore::retain_live).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub rows: usize,
    pub ports: usize,
}

// ── Queries ────────────────────────────────────────────────────────

/// Queryable properties of a mirror row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityField {
    PublicIp,
    NodeName,
    Status,
    Port,
    ActiveSessions,
}

/// Conjunction of exact-match equality predicates.
///
/// A row with the property absent never matches a predicate on it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityFilter {
    predicates: Vec<(EntityField, String)>,
}

impl EntityFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a `field eq value` predicate.
    pub fn eq(mut self, field: EntityField, value: impl Into<String>) -> Self {
        self.predicates.push((field, value.into()));
        self
    }

    pub fn matches(&self, entity: &GameServerEntity) -> bool {
        self.predicates
            .iter()
            .all(|(field, value)| entity.field(*field) == Some(value.as_str()))
    }
}
