//! Save path: walk an object graph and compile it into write statements.
//!
//! The walk is depth-first from each root. Every reachable object is
//! visited once per batch (keyed by address), so cycles terminate. Each
//! visited node yields a pending create, merge, or update; each populated
//! relationship attribute yields candidate edges. Candidates are diffed
//! against the edges the [`MappingContext`] already knows about:
//!
//! - known and candidate: nothing to do
//! - candidate only: create
//! - known only, inside the scope of a populated attribute of a walked,
//!   persisted owner: delete
//!
//! Unfetched attributes and owners beyond the depth horizon never delete.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use ogm_core::{Direction, EntityKind, EventSubject, MappingError, NativeId, PropertyMap};
use ogm_metadata::{EntityRef, Fetched, MetaData, SchemaDescriptor};
use serde_json::Value;

use crate::context::{MappedRelationship, MappingContext};
use crate::statement::{
    DeleteRow, EdgeRow, IdMap, NodeRef, NodeRow, NodeUpdateRow, RelationshipRow,
    RelationshipUpdateRow, Statement,
};

/// Counts of what a saved batch did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaveSummary {
    pub statements: usize,
    pub nodes_created: usize,
    pub nodes_updated: usize,
    pub relationships_created: usize,
    pub relationships_updated: usize,
    pub relationships_deleted: usize,
    /// Every entity written, with its id after the write.
    pub written: Vec<EventSubject>,
}

// ── Pending Writes ────────────────────────────────────────────────

struct PendingNode {
    reference: NodeRef,
    instance: EntityRef,
    descriptor: Arc<SchemaDescriptor>,
    properties: PropertyMap,
    expected_version: Option<i64>,
    next_version: Option<i64>,
}

struct PendingRelationshipEntity {
    reference: i64,
    instance: EntityRef,
    descriptor: Arc<SchemaDescriptor>,
    start: NodeRef,
    end: NodeRef,
    properties: PropertyMap,
    next_version: Option<i64>,
}

struct PendingRelationshipUpdate {
    id: NativeId,
    instance: EntityRef,
    descriptor: Arc<SchemaDescriptor>,
    properties: PropertyMap,
    expected_version: Option<i64>,
    next_version: Option<i64>,
}

#[derive(Debug, Clone)]
struct CandidateEdge {
    start: NodeRef,
    rel_type: String,
    end: NodeRef,
    undirected: bool,
}

/// Identity of a candidate edge. Undirected edges are keyed with their
/// endpoints in ascending order so that both directions collapse.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct EdgeKey {
    first: i64,
    rel_type: String,
    second: i64,
}

impl EdgeKey {
    fn directed(start: i64, rel_type: &str, end: i64) -> Self {
        Self {
            first: start,
            rel_type: rel_type.to_string(),
            second: end,
        }
    }

    fn undirected(a: i64, rel_type: &str, b: i64) -> Self {
        Self::directed(a.min(b), rel_type, a.max(b))
    }
}

struct Visit {
    reference: NodeRef,
    instance: EntityRef,
    descriptor: Arc<SchemaDescriptor>,
    horizon: i32,
}

/// Relationship attribute of a walked, persisted owner whose known edges
/// may be deleted.
struct Scope {
    owner: NativeId,
    descriptor: Arc<SchemaDescriptor>,
    attribute: usize,
}

// ── Compiler ──────────────────────────────────────────────────────

/// Compiles object graphs against one session's metadata and context.
pub struct Compiler<'a> {
    metadata: &'a MetaData,
    context: &'a MappingContext,
    next_reference: i64,
    visited: HashMap<usize, Visit>,
    visited_relationship_entities: HashMap<usize, i32>,
    nodes: Vec<PendingNode>,
    relationship_entities: Vec<PendingRelationshipEntity>,
    relationship_updates: Vec<PendingRelationshipUpdate>,
    kept_relationship_entities: HashSet<NativeId>,
    deleted_relationship_entities: Vec<NativeId>,
    candidates: Vec<CandidateEdge>,
    candidate_keys: HashSet<EdgeKey>,
    scopes: Vec<Scope>,
    scope_keys: HashSet<(NativeId, String, usize)>,
}

impl<'a> Compiler<'a> {
    pub fn new(metadata: &'a MetaData, context: &'a MappingContext) -> Self {
        Self {
            metadata,
            context,
            next_reference: 0,
            visited: HashMap::new(),
            visited_relationship_entities: HashMap::new(),
            nodes: Vec::new(),
            relationship_entities: Vec::new(),
            relationship_updates: Vec::new(),
            kept_relationship_entities: HashSet::new(),
            deleted_relationship_entities: Vec::new(),
            candidates: Vec::new(),
            candidate_keys: HashSet::new(),
            scopes: Vec::new(),
            scope_keys: HashSet::new(),
        }
    }

    /// Walk `roots` up to `depth` relationship hops (`-1` for the whole
    /// graph) and produce the ordered statements that persist it.
    pub fn compile(mut self, roots: &[EntityRef], depth: i32) -> Result<CompiledBatch, MappingError> {
        for root in roots {
            let descriptor = self.descriptor_for(root)?;
            if descriptor.is_relationship_entity() {
                self.map_relationship_entity(root, depth)?;
            } else {
                self.map_entity(root, depth)?;
            }
        }
        self.finish()
    }

    fn descriptor_for(&self, instance: &EntityRef) -> Result<Arc<SchemaDescriptor>, MappingError> {
        self.metadata
            .descriptor_for(instance)
            .cloned()
            .ok_or_else(|| MappingError::UnknownType {
                type_name: instance.type_name().to_string(),
            })
    }

    fn mint(&mut self) -> i64 {
        self.next_reference -= 1;
        self.next_reference
    }

    fn map_entity(&mut self, instance: &EntityRef, horizon: i32) -> Result<NodeRef, MappingError> {
        let address = instance.address();
        if let Some(visit) = self.visited.get_mut(&address) {
            if !wider(horizon, visit.horizon) {
                tracing::trace!(address, "already visited");
                return Ok(visit.reference);
            }
            // Reached again with more depth left: expand further.
            visit.horizon = horizon;
            let reference = visit.reference;
            let descriptor = Arc::clone(&visit.descriptor);
            let instance = visit.instance.clone();
            self.map_relationships(&instance, reference, &descriptor, horizon)?;
            return Ok(reference);
        }

        let descriptor = self.descriptor_for(instance)?;
        if descriptor.is_relationship_entity() {
            return Err(MappingError::TypeMismatch {
                type_name: descriptor.name().to_string(),
            });
        }

        let mut properties = descriptor.read_properties(instance)?;
        let reference = match descriptor.identity().read(instance)? {
            Some(id) => {
                if self.context.is_dirty(instance, &descriptor)? {
                    let (expected_version, next_version) =
                        bump_version(&descriptor, instance, &mut properties)?;
                    self.nodes.push(PendingNode {
                        reference: NodeRef::Existing(id),
                        instance: instance.clone(),
                        descriptor: Arc::clone(&descriptor),
                        properties,
                        expected_version,
                        next_version,
                    });
                } else {
                    tracing::trace!(id, "clean, no update");
                }
                NodeRef::Existing(id)
            }
            None => {
                let reference = self.mint();
                let next_version = initial_version(&descriptor, &mut properties);
                self.nodes.push(PendingNode {
                    reference: NodeRef::New(reference),
                    instance: instance.clone(),
                    descriptor: Arc::clone(&descriptor),
                    properties,
                    expected_version: None,
                    next_version,
                });
                NodeRef::New(reference)
            }
        };

        self.visited.insert(
            address,
            Visit {
                reference,
                instance: instance.clone(),
                descriptor: Arc::clone(&descriptor),
                horizon,
            },
        );
        self.map_relationships(instance, reference, &descriptor, horizon)?;
        Ok(reference)
    }

    fn map_relationships(
        &mut self,
        instance: &EntityRef,
        owner: NodeRef,
        descriptor: &Arc<SchemaDescriptor>,
        horizon: i32,
    ) -> Result<(), MappingError> {
        if horizon == 0 {
            return Ok(());
        }
        let next = deeper(horizon);

        for (index, attribute) in descriptor.relationships().iter().enumerate() {
            let related = match attribute.read(instance)? {
                Fetched::Unfetched => {
                    tracing::trace!(attribute = attribute.name(), "not fetched, skipping");
                    continue;
                }
                Fetched::Value(related) => related,
            };

            if let NodeRef::Existing(owner_id) = owner {
                let key = (owner_id, descriptor.name().to_string(), index);
                if self.scope_keys.insert(key) {
                    self.scopes.push(Scope {
                        owner: owner_id,
                        descriptor: Arc::clone(descriptor),
                        attribute: index,
                    });
                }
            }

            for target in related.targets() {
                if attribute.is_relationship_entity() {
                    self.map_relationship_entity(target, next)?;
                    continue;
                }
                let target_ref = self.map_entity(target, next)?;
                let (start, end) = match attribute.direction() {
                    Direction::Incoming => (target_ref, owner),
                    Direction::Outgoing | Direction::Undirected => (owner, target_ref),
                };
                self.add_candidate(start, attribute.rel_type(), end, attribute.is_undirected());
            }
        }
        Ok(())
    }

    fn map_relationship_entity(
        &mut self,
        instance: &EntityRef,
        horizon: i32,
    ) -> Result<(), MappingError> {
        let address = instance.address();
        if let Some(seen) = self.visited_relationship_entities.get_mut(&address) {
            if !wider(horizon, *seen) {
                tracing::trace!(address, "already visited");
                return Ok(());
            }
            // Reached again with more depth left: expand both ends further.
            *seen = horizon;
            let descriptor = self.descriptor_for(instance)?;
            for endpoint in [descriptor.start(), descriptor.end()].into_iter().flatten() {
                if let Some(node) = endpoint.read(instance)? {
                    self.map_entity(&node, horizon)?;
                }
            }
            return Ok(());
        }
        self.visited_relationship_entities.insert(address, horizon);
        let descriptor = self.descriptor_for(instance)?;
        let (Some(start_attribute), Some(end_attribute)) = (descriptor.start(), descriptor.end())
        else {
            return Err(MappingError::NotRelationshipEntity {
                type_name: descriptor.name().to_string(),
            });
        };
        let start = start_attribute
            .read(instance)?
            .ok_or_else(|| MappingError::MissingEndpoint {
                type_name: descriptor.name().to_string(),
                endpoint: "start",
            })?;
        let end = end_attribute
            .read(instance)?
            .ok_or_else(|| MappingError::MissingEndpoint {
                type_name: descriptor.name().to_string(),
                endpoint: "end",
            })?;

        let start_ref = self.map_entity(&start, horizon)?;
        let end_ref = self.map_entity(&end, horizon)?;
        let mut properties = descriptor.read_properties(instance)?;

        if let Some(id) = descriptor.identity().read(instance)? {
            let moved = self.context.relationship_entity(id).is_some_and(|known| {
                NodeRef::Existing(known.start) != start_ref || NodeRef::Existing(known.end) != end_ref
            });
            if !moved {
                self.kept_relationship_entities.insert(id);
                if self.context.is_dirty(instance, &descriptor)? {
                    let (expected_version, next_version) =
                        bump_version(&descriptor, instance, &mut properties)?;
                    self.relationship_updates.push(PendingRelationshipUpdate {
                        id,
                        instance: instance.clone(),
                        descriptor,
                        properties,
                        expected_version,
                        next_version,
                    });
                }
                return Ok(());
            }
            tracing::debug!(id, "relationship entity endpoints changed, re-creating");
            self.deleted_relationship_entities.push(id);
        }

        let reference = self.mint();
        let next_version = initial_version(&descriptor, &mut properties);
        self.relationship_entities.push(PendingRelationshipEntity {
            reference,
            instance: instance.clone(),
            descriptor,
            start: start_ref,
            end: end_ref,
            properties,
            next_version,
        });
        Ok(())
    }

    fn add_candidate(&mut self, start: NodeRef, rel_type: &str, end: NodeRef, undirected: bool) {
        let key = if undirected {
            EdgeKey::undirected(start.key(), rel_type, end.key())
        } else {
            EdgeKey::directed(start.key(), rel_type, end.key())
        };
        if self.candidate_keys.insert(key) {
            self.candidates.push(CandidateEdge {
                start,
                rel_type: rel_type.to_string(),
                end,
                undirected,
            });
        }
    }

    fn is_candidate(&self, edge: &MappedRelationship, undirected: bool) -> bool {
        let key = if undirected {
            EdgeKey::undirected(edge.start, &edge.rel_type, edge.end)
        } else {
            EdgeKey::directed(edge.start, &edge.rel_type, edge.end)
        };
        self.candidate_keys.contains(&key)
    }

    fn is_known(&self, candidate: &CandidateEdge) -> bool {
        match (candidate.start, candidate.end) {
            (NodeRef::Existing(start), NodeRef::Existing(end)) => {
                self.context.contains_edge(start, &candidate.rel_type, end)
                    || candidate.undirected
                        && self.context.contains_edge(end, &candidate.rel_type, start)
            }
            _ => false,
        }
    }

    /// Known edges that fall inside a walked scope and were not produced
    /// again by the walk.
    fn obsolete_edges(&self) -> (Vec<MappedRelationship>, Vec<NativeId>) {
        let mut edges = Vec::new();
        let mut seen_edges = HashSet::new();
        let mut entities = Vec::new();
        let mut seen_entities: HashSet<NativeId> =
            self.deleted_relationship_entities.iter().copied().collect();

        for scope in &self.scopes {
            let attribute = &scope.descriptor.relationships()[scope.attribute];
            let mut known = self.context.known_edges(scope.owner);
            known.sort_by_key(|e| (e.start, e.end, e.relationship_id));

            for edge in known {
                if edge.rel_type != attribute.rel_type() {
                    continue;
                }
                let owner_side = attribute.is_undirected()
                    || match attribute.direction() {
                        Direction::Incoming => edge.end == scope.owner,
                        Direction::Outgoing | Direction::Undirected => edge.start == scope.owner,
                    };
                if !owner_side {
                    continue;
                }

                if attribute.is_relationship_entity() {
                    let Some(id) = edge.relationship_id else {
                        continue;
                    };
                    let same_type = self
                        .context
                        .relationship_entity(id)
                        .is_some_and(|entry| entry.descriptor.name() == attribute.target());
                    if same_type
                        && !self.kept_relationship_entities.contains(&id)
                        && seen_entities.insert(id)
                    {
                        tracing::debug!(id, "context-del relationship entity");
                        entities.push(id);
                    }
                    continue;
                }

                if edge.relationship_id.is_some() {
                    continue;
                }
                let other = edge.other(scope.owner);
                let target_matches = self
                    .context
                    .node(other)
                    .is_some_and(|entry| entry.descriptor.name() == attribute.target());
                if !target_matches || self.is_candidate(edge, attribute.is_undirected()) {
                    continue;
                }
                if seen_edges.insert(edge.clone()) {
                    tracing::debug!(
                        start = edge.start,
                        rel_type = %edge.rel_type,
                        end = edge.end,
                        "context-del"
                    );
                    edges.push(edge.clone());
                }
            }
        }
        (edges, entities)
    }

    /// Relationship entities that share type and endpoints with the plain
    /// edge `edge` and outlive this batch.
    fn shared_endpoints(&self, edge: &MappedRelationship, deleted: &[NativeId]) -> Vec<i64> {
        let known = self
            .context
            .relationship_entities()
            .filter(|re| {
                re.rel_type == edge.rel_type && re.start == edge.start && re.end == edge.end
            })
            .map(|re| re.id)
            .filter(|id| !deleted.contains(id));
        let created = self
            .relationship_entities
            .iter()
            .filter(|pending| {
                pending.descriptor.rel_type() == Some(edge.rel_type.as_str())
                    && pending.start == NodeRef::Existing(edge.start)
                    && pending.end == NodeRef::Existing(edge.end)
            })
            .map(|pending| pending.reference);
        let mut keep: Vec<i64> = known.chain(created).collect();
        keep.sort_unstable();
        keep
    }

    fn finish(self) -> Result<CompiledBatch, MappingError> {
        let (deleted_edges, obsolete_entities) = self.obsolete_edges();
        let mut deleted_relationship_entities = self.deleted_relationship_entities.clone();
        deleted_relationship_entities.extend(obsolete_entities);

        let new_edges: Vec<CandidateEdge> = self
            .candidates
            .iter()
            .filter(|c| !self.is_known(c))
            .cloned()
            .collect();
        let keeps: Vec<Vec<i64>> = deleted_edges
            .iter()
            .map(|edge| self.shared_endpoints(edge, &deleted_relationship_entities))
            .collect();

        let mut statements = Vec::new();
        let mut new_nodes = Vec::new();
        let mut updated_nodes = Vec::new();

        // Node writes, grouped by label signature in walk order.
        let mut creates: Vec<(Vec<String>, Vec<NodeRow>)> = Vec::new();
        let mut merges: Vec<((Vec<String>, String), Vec<NodeRow>)> = Vec::new();
        let mut updates: Vec<((Vec<String>, Option<String>), Vec<NodeUpdateRow>)> = Vec::new();

        for node in self.nodes {
            let labels = node.descriptor.labels().to_vec();
            match node.reference {
                NodeRef::New(reference) => {
                    let row = NodeRow {
                        reference,
                        properties: node.properties,
                    };
                    match node.descriptor.primary_index() {
                        Some(key) => group(&mut merges, (labels, key.to_string()), row),
                        None => group(&mut creates, labels, row),
                    }
                    new_nodes.push((reference, node.instance, node.descriptor, node.next_version));
                }
                NodeRef::Existing(id) => {
                    let version = node
                        .expected_version
                        .and(node.descriptor.version().map(|v| v.name().to_string()));
                    let row = NodeUpdateRow {
                        id,
                        properties: node.properties,
                        expected_version: node.expected_version,
                    };
                    group(&mut updates, (labels, version), row);
                    updated_nodes.push((id, node.instance, node.descriptor, node.next_version));
                }
            }
        }

        for (labels, rows) in creates {
            statements.push(Statement::CreateNodes { labels, rows });
        }
        for ((labels, key), rows) in merges {
            statements.push(Statement::MergeNodes { labels, key, rows });
        }

        // Plain relationships get references past everything minted so far.
        let mut next_reference = self.next_reference;
        let mut relationship_groups: Vec<((String, bool), Vec<RelationshipRow>)> = Vec::new();
        for edge in &new_edges {
            next_reference -= 1;
            let row = RelationshipRow {
                reference: next_reference,
                start: edge.start,
                end: edge.end,
                properties: PropertyMap::new(),
            };
            group(
                &mut relationship_groups,
                (edge.rel_type.clone(), edge.undirected),
                row,
            );
        }
        for ((rel_type, undirected), rows) in relationship_groups {
            statements.push(Statement::CreateRelationships {
                rel_type,
                undirected,
                rows,
            });
        }

        for pending in &self.relationship_entities {
            statements.push(Statement::CreateRelationshipEntity {
                rel_type: pending.descriptor.rel_type().unwrap_or_default().to_string(),
                row: RelationshipRow {
                    reference: pending.reference,
                    start: pending.start,
                    end: pending.end,
                    properties: pending.properties.clone(),
                },
            });
        }

        for ((labels, version), rows) in updates {
            statements.push(Statement::UpdateNodes {
                labels,
                version,
                rows,
            });
        }

        let mut relationship_updates: Vec<(Option<String>, Vec<RelationshipUpdateRow>)> =
            Vec::new();
        for pending in &self.relationship_updates {
            let version = pending
                .expected_version
                .and(pending.descriptor.version().map(|v| v.name().to_string()));
            let row = RelationshipUpdateRow {
                id: pending.id,
                properties: pending.properties.clone(),
                expected_version: pending.expected_version,
            };
            group(&mut relationship_updates, version, row);
        }
        for (version, rows) in relationship_updates {
            statements.push(Statement::UpdateRelationshipEntities { version, rows });
        }

        let mut deletions: Vec<(String, Vec<EdgeRow>)> = Vec::new();
        for (edge, keep) in deleted_edges.iter().zip(keeps) {
            let row = EdgeRow {
                start: edge.start,
                end: edge.end,
                keep,
            };
            group(&mut deletions, edge.rel_type.clone(), row);
        }
        for (rel_type, rows) in deletions {
            statements.push(Statement::DeleteRelationships { rel_type, rows });
        }

        if !deleted_relationship_entities.is_empty() {
            statements.push(Statement::DeleteRelationshipEntities {
                version: None,
                rows: deleted_relationship_entities
                    .iter()
                    .map(|&id| DeleteRow {
                        id,
                        expected_version: None,
                    })
                    .collect(),
            });
        }

        tracing::debug!(
            statements = statements.len(),
            new_nodes = new_nodes.len(),
            updated_nodes = updated_nodes.len(),
            new_edges = new_edges.len(),
            deleted_edges = deleted_edges.len(),
            "Compiled batch"
        );

        Ok(CompiledBatch {
            statements,
            new_nodes,
            updated_nodes,
            new_edges,
            deleted_edges,
            new_relationship_entities: self.relationship_entities,
            updated_relationship_entities: self.relationship_updates,
            deleted_relationship_entities,
        })
    }
}

/// Append `row` to the group keyed by `key`, opening the group if needed.
fn group<K: PartialEq, R>(groups: &mut Vec<(K, Vec<R>)>, key: K, row: R) {
    match groups.iter_mut().find(|(k, _)| *k == key) {
        Some((_, rows)) => rows.push(row),
        None => groups.push((key, vec![row])),
    }
}

/// Whether `horizon` reaches further than `seen`. Negative is unbounded.
fn wider(horizon: i32, seen: i32) -> bool {
    seen >= 0 && (horizon < 0 || horizon > seen)
}

fn deeper(horizon: i32) -> i32 {
    if horizon < 0 {
        horizon
    } else {
        horizon - 1
    }
}

/// Version 0 for entities about to be created.
fn initial_version(descriptor: &SchemaDescriptor, properties: &mut PropertyMap) -> Option<i64> {
    let version = descriptor.version()?;
    properties.insert(version.name().to_string(), Value::from(0));
    Some(0)
}

/// Expected and next version for an update of a persisted entity.
fn bump_version(
    descriptor: &SchemaDescriptor,
    instance: &EntityRef,
    properties: &mut PropertyMap,
) -> Result<(Option<i64>, Option<i64>), MappingError> {
    let Some(version) = descriptor.version() else {
        return Ok((None, None));
    };
    let current = version.read(instance)?;
    let next = current.map_or(0, |v| v + 1);
    properties.insert(version.name().to_string(), Value::from(next));
    Ok((current, Some(next)))
}

// ── Compiled Batch ────────────────────────────────────────────────

type NodeWriteBack = (i64, EntityRef, Arc<SchemaDescriptor>, Option<i64>);

/// Ordered statements plus what to write back once they have committed.
pub struct CompiledBatch {
    statements: Vec<Statement>,
    new_nodes: Vec<NodeWriteBack>,
    updated_nodes: Vec<NodeWriteBack>,
    new_edges: Vec<CandidateEdge>,
    deleted_edges: Vec<MappedRelationship>,
    new_relationship_entities: Vec<PendingRelationshipEntity>,
    updated_relationship_entities: Vec<PendingRelationshipUpdate>,
    deleted_relationship_entities: Vec<NativeId>,
}

impl CompiledBatch {
    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Entities about to be written, for pre-save notification.
    pub fn pending(&self) -> Vec<EventSubject> {
        let nodes = self
            .new_nodes
            .iter()
            .map(|(_, _, d, _)| subject(d, None))
            .chain(self.updated_nodes.iter().map(|(id, _, d, _)| subject(d, Some(*id))));
        let relationships = self
            .new_relationship_entities
            .iter()
            .map(|p| subject(&p.descriptor, None))
            .chain(
                self.updated_relationship_entities
                    .iter()
                    .map(|p| subject(&p.descriptor, Some(p.id))),
            );
        nodes.chain(relationships).collect()
    }

    /// Check that `ids` resolves every temporary reference in the batch.
    pub fn validate(&self, ids: &IdMap) -> Result<(), MappingError> {
        let resolve = |reference: i64| -> Result<(), MappingError> {
            if ids.contains_key(&reference) {
                Ok(())
            } else {
                Err(MappingError::UnresolvedReference(reference))
            }
        };
        for (reference, ..) in &self.new_nodes {
            resolve(*reference)?;
        }
        for edge in &self.new_edges {
            edge.start.resolve(ids)?;
            edge.end.resolve(ids)?;
        }
        for pending in &self.new_relationship_entities {
            resolve(pending.reference)?;
            pending.start.resolve(ids)?;
            pending.end.resolve(ids)?;
        }
        Ok(())
    }

    /// Write resolved ids and versions back into the instances and bring
    /// the context in line with the committed database state.
    ///
    /// Every reference is resolved before anything is touched, so a
    /// missing id leaves both the instances and the context unchanged.
    pub fn apply(
        self,
        context: &mut MappingContext,
        ids: &IdMap,
    ) -> Result<SaveSummary, MappingError> {
        let resolve = |reference: i64| {
            ids.get(&reference)
                .copied()
                .ok_or(MappingError::UnresolvedReference(reference))
        };
        let node_ids = self
            .new_nodes
            .iter()
            .map(|(reference, ..)| resolve(*reference))
            .collect::<Result<Vec<_>, _>>()?;
        let edge_ends = self
            .new_edges
            .iter()
            .map(|e| -> Result<(NativeId, NativeId), MappingError> {
                Ok((e.start.resolve(ids)?, e.end.resolve(ids)?))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let relationship_ids = self
            .new_relationship_entities
            .iter()
            .map(|p| -> Result<(NativeId, NativeId, NativeId), MappingError> {
                Ok((resolve(p.reference)?, p.start.resolve(ids)?, p.end.resolve(ids)?))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let mut summary = SaveSummary {
            statements: self.statements.len(),
            ..SaveSummary::default()
        };

        for id in &self.deleted_relationship_entities {
            context.forget_relationship_entity(*id);
        }
        for edge in &self.deleted_edges {
            context.remove_edge(edge);
        }
        summary.relationships_deleted =
            self.deleted_relationship_entities.len() + self.deleted_edges.len();

        for ((_, instance, descriptor, version), id) in self.new_nodes.iter().zip(&node_ids) {
            if let (Some(attribute), Some(v)) = (descriptor.version(), version) {
                attribute.write(instance, Some(*v))?;
            }
            descriptor.identity().write(instance, Some(*id))?;
            let canonical = context.register(instance.clone(), descriptor, *id)?;
            if !canonical.ptr_eq(instance) {
                // The stored node now holds the merged values.
                tracing::debug!(id, "merged onto an instance already in the session");
                if descriptor.matches(&canonical) {
                    let merged = descriptor.read_properties(instance)?;
                    descriptor.write_properties(&canonical, &merged)?;
                }
                context.remember(EntityKind::Node, *id)?;
            }
            summary.written.push(subject(descriptor, Some(*id)));
        }
        summary.nodes_created = node_ids.len();

        for (id, instance, descriptor, version) in &self.updated_nodes {
            if let (Some(attribute), Some(v)) = (descriptor.version(), version) {
                attribute.write(instance, Some(*v))?;
            }
            if context.node(*id).is_some() {
                context.remember(EntityKind::Node, *id)?;
            } else {
                context.register(instance.clone(), descriptor, *id)?;
            }
            summary.written.push(subject(descriptor, Some(*id)));
        }
        summary.nodes_updated = self.updated_nodes.len();

        for (edge, (start, end)) in self.new_edges.iter().zip(&edge_ends) {
            context.register_edge(MappedRelationship::new(*start, &edge.rel_type, *end));
        }

        for (pending, (id, start, end)) in self
            .new_relationship_entities
            .iter()
            .zip(&relationship_ids)
        {
            if let (Some(attribute), Some(v)) = (pending.descriptor.version(), pending.next_version) {
                attribute.write(&pending.instance, Some(v))?;
            }
            pending.descriptor.identity().write(&pending.instance, Some(*id))?;
            context.register_relationship_entity(
                pending.instance.clone(),
                &pending.descriptor,
                *id,
                *start,
                *end,
            )?;
            summary.written.push(subject(&pending.descriptor, Some(*id)));
        }
        summary.relationships_created = edge_ends.len() + relationship_ids.len();

        for pending in &self.updated_relationship_entities {
            if let (Some(attribute), Some(v)) = (pending.descriptor.version(), pending.next_version) {
                attribute.write(&pending.instance, Some(v))?;
            }
            context.remember(EntityKind::Relationship, pending.id)?;
            summary.written.push(subject(&pending.descriptor, Some(pending.id)));
        }
        summary.relationships_updated = self.updated_relationship_entities.len();

        Ok(summary)
    }
}

fn subject(descriptor: &SchemaDescriptor, native_id: Option<NativeId>) -> EventSubject {
    EventSubject {
        type_name: descriptor.name().to_string(),
        native_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_horizon_arithmetic() {
        assert!(wider(-1, 2));
        assert!(wider(3, 2));
        assert!(!wider(2, 2));
        assert!(!wider(5, -1));
        assert_eq!(deeper(-1), -1);
        assert_eq!(deeper(2), 1);
    }

    #[test]
    fn test_undirected_keys_collapse() {
        assert_eq!(
            EdgeKey::undirected(4, "KNOWS", 1),
            EdgeKey::undirected(1, "KNOWS", 4)
        );
        assert_ne!(
            EdgeKey::directed(4, "KNOWS", 1),
            EdgeKey::directed(1, "KNOWS", 4)
        );
    }
}
