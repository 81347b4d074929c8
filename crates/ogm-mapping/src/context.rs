//! Session-scoped identity and relationship tracking.
//!
//! The context remembers every node and relationship entity a session has
//! seen, keyed by native id, together with the set of edges it believes
//! exist in the database. The compiler diffs against it and the mapper
//! feeds it.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use ogm_core::{EntityKind, MappingError, NativeId};
use ogm_metadata::{EntityRef, SchemaDescriptor};
use serde_json::Value;

use crate::memo::EntityMemo;

/// A node known to the session.
#[derive(Debug, Clone)]
pub struct NodeEntry {
    pub id: NativeId,
    pub descriptor: Arc<SchemaDescriptor>,
    pub instance: EntityRef,
}

/// A relationship entity known to the session.
#[derive(Debug, Clone)]
pub struct RelationshipEntry {
    pub id: NativeId,
    pub rel_type: String,
    pub descriptor: Arc<SchemaDescriptor>,
    pub instance: EntityRef,
    pub start: NativeId,
    pub end: NativeId,
}

/// An edge believed to exist in the database.
///
/// Plain relationships are tracked by their endpoint triple only;
/// relationship entities also carry their own id, so two entities of the
/// same type between the same nodes stay distinct.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappedRelationship {
    pub start: NativeId,
    pub rel_type: String,
    pub end: NativeId,
    pub relationship_id: Option<NativeId>,
}

impl MappedRelationship {
    pub fn new(start: NativeId, rel_type: &str, end: NativeId) -> Self {
        Self {
            start,
            rel_type: rel_type.to_string(),
            end,
            relationship_id: None,
        }
    }

    pub fn with_id(mut self, relationship_id: NativeId) -> Self {
        self.relationship_id = Some(relationship_id);
        self
    }

    pub fn touches(&self, id: NativeId) -> bool {
        self.start == id || self.end == id
    }

    /// The endpoint opposite `id`.
    pub fn other(&self, id: NativeId) -> NativeId {
        if self.start == id {
            self.end
        } else {
            self.start
        }
    }
}

/// Identity registry for one session.
#[derive(Debug, Default)]
pub struct MappingContext {
    nodes: HashMap<NativeId, NodeEntry>,
    relationship_entities: HashMap<NativeId, RelationshipEntry>,
    edges: HashSet<MappedRelationship>,
    primary_index: HashMap<(String, String), NativeId>,
    by_type: HashMap<String, BTreeSet<NativeId>>,
    memo: EntityMemo,
}

impl MappingContext {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Nodes ────────────────────────────────────────────────────

    pub fn get(&self, id: NativeId) -> Option<&EntityRef> {
        self.nodes.get(&id).map(|entry| &entry.instance)
    }

    pub fn node(&self, id: NativeId) -> Option<&NodeEntry> {
        self.nodes.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeEntry> {
        self.nodes.values()
    }

    /// Register `instance` under `id` and return the canonical instance.
    ///
    /// If the id is already known, the existing instance wins and
    /// `instance` is discarded, so earlier references stay valid.
    pub fn register(
        &mut self,
        instance: EntityRef,
        descriptor: &Arc<SchemaDescriptor>,
        id: NativeId,
    ) -> Result<EntityRef, MappingError> {
        if let Some(existing) = self.nodes.get(&id) {
            return Ok(existing.instance.clone());
        }
        let properties = descriptor.read_properties(&instance)?;
        if let Some(key) = primary_key(descriptor, &properties) {
            self.primary_index.insert(key, id);
        }
        self.memo.remember(EntityKind::Node, id, &properties);
        self.by_type
            .entry(descriptor.name().to_string())
            .or_default()
            .insert(id);
        self.nodes.insert(
            id,
            NodeEntry {
                id,
                descriptor: Arc::clone(descriptor),
                instance: instance.clone(),
            },
        );
        Ok(instance)
    }

    /// Refresh the persisted snapshot of a registered node or relationship
    /// entity after its properties were written or loaded.
    pub fn remember(&mut self, kind: EntityKind, id: NativeId) -> Result<(), MappingError> {
        match kind {
            EntityKind::Node => {
                let Some(entry) = self.nodes.get(&id) else {
                    return Ok(());
                };
                let properties = entry.descriptor.read_properties(&entry.instance)?;
                let descriptor = Arc::clone(&entry.descriptor);
                self.primary_index.retain(|_, known| *known != id);
                if let Some(key) = primary_key(&descriptor, &properties) {
                    self.primary_index.insert(key, id);
                }
                self.memo.remember(kind, id, &properties);
            }
            EntityKind::Relationship => {
                let Some(entry) = self.relationship_entities.get(&id) else {
                    return Ok(());
                };
                let properties = entry.descriptor.read_properties(&entry.instance)?;
                self.memo.remember(kind, id, &properties);
            }
        }
        Ok(())
    }

    /// Whether `instance` differs from what the session last persisted or
    /// loaded. Instances without a native id are always dirty.
    pub fn is_dirty(
        &self,
        instance: &EntityRef,
        descriptor: &SchemaDescriptor,
    ) -> Result<bool, MappingError> {
        let Some(id) = descriptor.identity().read(instance)? else {
            return Ok(true);
        };
        let kind = if descriptor.is_relationship_entity() {
            EntityKind::Relationship
        } else {
            EntityKind::Node
        };
        let properties = descriptor.read_properties(instance)?;
        Ok(self.memo.is_dirty(kind, id, &properties))
    }

    /// Node of descriptor `name` whose primary-index property equals `value`.
    pub fn find_by_primary_index(&self, name: &str, value: &Value) -> Option<&EntityRef> {
        let id = self
            .primary_index
            .get(&(name.to_string(), value.to_string()))?;
        self.get(*id)
    }

    /// Every registered instance of descriptor `name`, in native id order.
    pub fn entities_of(&self, name: &str) -> Vec<EntityRef> {
        self.by_type
            .get(name)
            .map(|ids| ids.iter().filter_map(|id| self.get(*id).cloned()).collect())
            .unwrap_or_default()
    }

    /// Drop a node together with every edge touching it and every
    /// relationship entity hanging off it.
    pub fn forget(&mut self, id: NativeId) -> Option<NodeEntry> {
        let entry = self.nodes.remove(&id)?;
        self.memo.forget(EntityKind::Node, id);
        self.primary_index.retain(|_, known| *known != id);
        if let Some(ids) = self.by_type.get_mut(entry.descriptor.name()) {
            ids.remove(&id);
        }
        self.edges.retain(|edge| !edge.touches(id));

        let dependents: Vec<NativeId> = self
            .relationship_entities
            .values()
            .filter(|re| re.start == id || re.end == id)
            .map(|re| re.id)
            .collect();
        for relationship_id in dependents {
            self.forget_relationship_entity(relationship_id);
        }
        tracing::debug!(id, "Forgot node");
        Some(entry)
    }

    /// Forget an entity and clear its identity, so that the next save
    /// treats it as new.
    pub fn reset(
        &mut self,
        instance: &EntityRef,
        descriptor: &SchemaDescriptor,
    ) -> Result<(), MappingError> {
        if let Some(id) = descriptor.identity().read(instance)? {
            if descriptor.is_relationship_entity() {
                self.forget_relationship_entity(id);
            } else {
                self.forget(id);
            }
        }
        descriptor.identity().write(instance, None)
    }

    /// Nodes joined to node `id` by any known edge, in id order.
    pub fn neighbours(&self, id: NativeId) -> Vec<&NodeEntry> {
        let others: BTreeSet<NativeId> = self
            .edges
            .iter()
            .filter(|edge| edge.touches(id))
            .map(|edge| edge.other(id))
            .filter(|other| *other != id)
            .collect();
        others.iter().filter_map(|other| self.nodes.get(other)).collect()
    }

    /// The endpoint nodes of relationship entity `id`.
    pub fn endpoints(&self, id: NativeId) -> Vec<&NodeEntry> {
        let Some(entry) = self.relationship_entities.get(&id) else {
            return Vec::new();
        };
        let ends: BTreeSet<NativeId> = [entry.start, entry.end].into();
        ends.iter().filter_map(|end| self.nodes.get(end)).collect()
    }

    // ── Relationship Entities ────────────────────────────────────

    pub fn relationship_entity(&self, id: NativeId) -> Option<&RelationshipEntry> {
        self.relationship_entities.get(&id)
    }

    pub fn relationship_entities(&self) -> impl Iterator<Item = &RelationshipEntry> {
        self.relationship_entities.values()
    }

    pub fn register_relationship_entity(
        &mut self,
        instance: EntityRef,
        descriptor: &Arc<SchemaDescriptor>,
        id: NativeId,
        start: NativeId,
        end: NativeId,
    ) -> Result<EntityRef, MappingError> {
        if let Some(existing) = self.relationship_entities.get(&id) {
            return Ok(existing.instance.clone());
        }
        let rel_type = descriptor.rel_type().unwrap_or_default().to_string();
        let properties = descriptor.read_properties(&instance)?;
        self.memo
            .remember(EntityKind::Relationship, id, &properties);
        self.edges
            .insert(MappedRelationship::new(start, &rel_type, end).with_id(id));
        self.relationship_entities.insert(
            id,
            RelationshipEntry {
                id,
                rel_type,
                descriptor: Arc::clone(descriptor),
                instance: instance.clone(),
                start,
                end,
            },
        );
        Ok(instance)
    }

    pub fn forget_relationship_entity(&mut self, id: NativeId) -> Option<RelationshipEntry> {
        let entry = self.relationship_entities.remove(&id)?;
        self.memo.forget(EntityKind::Relationship, id);
        self.edges
            .retain(|edge| edge.relationship_id != Some(id));
        Some(entry)
    }

    // ── Edges ────────────────────────────────────────────────────

    pub fn register_edge(&mut self, edge: MappedRelationship) -> bool {
        self.edges.insert(edge)
    }

    pub fn remove_edge(&mut self, edge: &MappedRelationship) -> bool {
        self.edges.remove(edge)
    }

    /// Whether a plain relationship `start -[rel_type]-> end` is known.
    pub fn contains_edge(&self, start: NativeId, rel_type: &str, end: NativeId) -> bool {
        self.edges
            .contains(&MappedRelationship::new(start, rel_type, end))
    }

    /// Every known edge touching `id`.
    pub fn known_edges(&self, id: NativeId) -> Vec<&MappedRelationship> {
        self.edges.iter().filter(|edge| edge.touches(id)).collect()
    }

    pub fn edges(&self) -> impl Iterator<Item = &MappedRelationship> {
        self.edges.iter()
    }

    // ── Housekeeping ─────────────────────────────────────────────

    /// Reset to empty. Previously returned instances are left as they are.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.relationship_entities.clear();
        self.edges.clear();
        self.primary_index.clear();
        self.by_type.clear();
        self.memo.clear();
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn relationship_entity_count(&self) -> usize {
        self.relationship_entities.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }
}

fn primary_key(
    descriptor: &SchemaDescriptor,
    properties: &ogm_core::PropertyMap,
) -> Option<(String, String)> {
    let property = descriptor.primary_index()?;
    match properties.get(property) {
        None | Some(Value::Null) => None,
        Some(value) => Some((descriptor.name().to_string(), value.to_string())),
    }
}
