//! Core graph types shared by the mapper, the compiler, and every transport.
//!
//! Records are the transport-neutral shape of what a database returns:
//! nodes carry labels and properties, relationships carry their type and
//! the native ids of both endpoints.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Database-assigned identifier of a node or relationship.
pub type NativeId = i64;

/// Property values keyed by property name. Ordered so that hashing and
/// statement parameters are deterministic.
pub type PropertyMap = BTreeMap<String, serde_json::Value>;

// ── Session ───────────────────────────────────────────────────────

/// Identifies one session; stamped on every persistence event it emits.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Relationship Shape ────────────────────────────────────────────

/// Direction of a relationship attribute, seen from the owning entity.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Outgoing,
    Incoming,
    Undirected,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Outgoing => "OUTGOING",
            Self::Incoming => "INCOMING",
            Self::Undirected => "UNDIRECTED",
        }
    }

    /// The same relationship seen from the other endpoint.
    pub fn reverse(&self) -> Self {
        match self {
            Self::Outgoing => Self::Incoming,
            Self::Incoming => Self::Outgoing,
            Self::Undirected => Self::Undirected,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How many targets a relationship attribute holds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Multiplicity {
    Single,
    Many,
}

/// Whether a native id names a node or a relationship.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Node,
    Relationship,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Node => f.write_str("node"),
            Self::Relationship => f.write_str("relationship"),
        }
    }
}

// ── Records ───────────────────────────────────────────────────────

/// A node as returned by a transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub id: NativeId,
    pub labels: Vec<String>,
    #[serde(default)]
    pub properties: PropertyMap,
}

impl NodeRecord {
    pub fn new(id: NativeId, labels: &[&str]) -> Self {
        Self {
            id,
            labels: labels.iter().map(|l| (*l).to_string()).collect(),
            properties: PropertyMap::new(),
        }
    }

    /// Builder-style property setter, handy for assembling responses.
    pub fn with_property(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }
}

/// A relationship as returned by a transport.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelationshipRecord {
    pub id: NativeId,
    pub rel_type: String,
    pub start: NativeId,
    pub end: NativeId,
    #[serde(default)]
    pub properties: PropertyMap,
}

impl RelationshipRecord {
    pub fn new(id: NativeId, rel_type: &str, start: NativeId, end: NativeId) -> Self {
        Self {
            id,
            rel_type: rel_type.to_string(),
            start,
            end,
            properties: PropertyMap::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }
}

/// The graph returned by a load: the requested roots plus everything
/// reachable from them within the requested depth.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphResponse {
    pub roots: Vec<NativeId>,
    pub nodes: Vec<NodeRecord>,
    pub relationships: Vec<RelationshipRecord>,
}

impl GraphResponse {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.relationships.is_empty()
    }

    /// Drop repeated node and relationship records, keeping the first
    /// occurrence of each id. Path-based queries return the same record
    /// once per path that crosses it.
    pub fn dedup(&mut self) {
        let mut seen = HashSet::new();
        self.nodes.retain(|n| seen.insert(n.id));
        let mut seen = HashSet::new();
        self.relationships.retain(|r| seen.insert(r.id));
        let mut seen = HashSet::new();
        self.roots.retain(|id| seen.insert(*id));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_reverse() {
        assert_eq!(Direction::Outgoing.reverse(), Direction::Incoming);
        assert_eq!(Direction::Incoming.reverse(), Direction::Outgoing);
        assert_eq!(Direction::Undirected.reverse(), Direction::Undirected);
    }

    #[test]
    fn test_direction_serde() {
        let json = serde_json::to_string(&Direction::Incoming).unwrap();
        assert_eq!(json, "\"INCOMING\"");
        let back: Direction = serde_json::from_str("\"UNDIRECTED\"").unwrap();
        assert_eq!(back, Direction::Undirected);
    }

    #[test]
    fn test_response_dedup() {
        let mut response = GraphResponse {
            roots: vec![1, 1],
            nodes: vec![
                NodeRecord::new(1, &["Movie"]).with_property("title", "Heat"),
                NodeRecord::new(2, &["Actor"]),
                NodeRecord::new(1, &["Movie"]),
            ],
            relationships: vec![
                RelationshipRecord::new(10, "ACTS_IN", 2, 1),
                RelationshipRecord::new(10, "ACTS_IN", 2, 1),
            ],
        };
        response.dedup();
        assert_eq!(response.roots, vec![1]);
        assert_eq!(response.nodes.len(), 2);
        assert_eq!(response.nodes[0].properties["title"], "Heat");
        assert_eq!(response.relationships.len(), 1);
    }

    #[test]
    fn test_record_missing_properties_deserializes() {
        let record: NodeRecord =
            serde_json::from_str(r#"{"id": 7, "labels": ["Actor"]}"#).unwrap();
        assert_eq!(record.id, 7);
        assert!(record.properties.is_empty());
    }
}
