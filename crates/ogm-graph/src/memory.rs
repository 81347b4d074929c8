//! In-process property graph that executes compiled statements.
//!
//! The store understands the structured [`Statement`]s directly rather than
//! parsing Cypher, reading the same rendered `$rows` a Bolt transport would
//! receive. Each transaction works on a snapshot of the store and swaps it
//! back in on commit; concurrent transactions are last-writer-wins.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::sync::Arc;

use ogm_core::{
    GraphResponse, NativeId, NodeRecord, PropertyMap, RelationshipRecord, TransportError,
};
use ogm_mapping::{CountRequest, Driver, LoadRequest, ReturnedId, Statement, Transaction};
use parking_lot::Mutex;
use serde_json::Value;

#[derive(Debug, Clone, Default)]
struct StoredNode {
    labels: BTreeSet<String>,
    properties: PropertyMap,
}

#[derive(Debug, Clone)]
struct StoredRelationship {
    rel_type: String,
    start: NativeId,
    end: NativeId,
    properties: PropertyMap,
}

/// Nodes and relationships keyed by id. Node and relationship ids are
/// allocated independently, as in Neo4j.
#[derive(Debug, Clone, Default)]
struct GraphStore {
    next_node_id: NativeId,
    next_relationship_id: NativeId,
    nodes: BTreeMap<NativeId, StoredNode>,
    relationships: BTreeMap<NativeId, StoredRelationship>,
}

/// Embedded driver backed by a [`GraphStore`] shared between clones.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    store: Arc<Mutex<GraphStore>>,
    executed: Arc<Mutex<Vec<Statement>>>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_count(&self) -> usize {
        self.store.lock().nodes.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.store.lock().relationships.len()
    }

    pub fn node(&self, id: NativeId) -> Option<NodeRecord> {
        self.store.lock().nodes.get(&id).map(|node| node_record(id, node))
    }

    pub fn relationships(&self) -> Vec<RelationshipRecord> {
        self.store
            .lock()
            .relationships
            .iter()
            .map(|(id, rel)| relationship_record(*id, rel))
            .collect()
    }

    /// Overwrite one property of a stored node outside any transaction,
    /// as another client would.
    pub fn set_node_property(&self, id: NativeId, key: &str, value: Value) -> bool {
        match self.store.lock().nodes.get_mut(&id) {
            Some(node) => {
                node.properties.insert(key.to_string(), value);
                true
            }
            None => false,
        }
    }

    /// Statements from committed transactions since the last call.
    pub fn take_executed(&self) -> Vec<Statement> {
        std::mem::take(&mut *self.executed.lock())
    }
}

/// Snapshot of the store being modified by one transaction.
pub struct MemoryTransaction {
    store: Arc<Mutex<GraphStore>>,
    executed: Arc<Mutex<Vec<Statement>>>,
    working: GraphStore,
    statements: Vec<Statement>,
}

impl Driver for MemoryDriver {
    type Transaction = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction, TransportError> {
        Ok(MemoryTransaction {
            store: Arc::clone(&self.store),
            executed: Arc::clone(&self.executed),
            working: self.store.lock().clone(),
            statements: Vec::new(),
        })
    }

    async fn fetch(&self, request: &LoadRequest) -> Result<GraphResponse, TransportError> {
        Ok(self.store.lock().load(request))
    }

    async fn count(&self, request: &CountRequest) -> Result<u64, TransportError> {
        Ok(self.store.lock().count(request))
    }
}

impl Transaction for MemoryTransaction {
    async fn run(
        &mut self,
        statement: &Statement,
        rows: Vec<Value>,
    ) -> Result<Vec<ReturnedId>, TransportError> {
        let returned = self.working.apply(statement, &rows)?;
        self.statements.push(statement.clone());
        Ok(returned)
    }

    async fn commit(self) -> Result<(), TransportError> {
        *self.store.lock() = self.working;
        self.executed.lock().extend(self.statements);
        Ok(())
    }

    async fn rollback(self) -> Result<(), TransportError> {
        tracing::debug!(statements = self.statements.len(), "Rolled back in-memory transaction");
        Ok(())
    }
}

// ── Statement Execution ───────────────────────────────────────────

impl GraphStore {
    fn apply(
        &mut self,
        statement: &Statement,
        rows: &[Value],
    ) -> Result<Vec<ReturnedId>, TransportError> {
        let mut returned = Vec::new();
        match statement {
            Statement::CreateNodes { labels, .. } => {
                for row in rows {
                    let id = self.create_node(labels, properties(row)?);
                    returned.push(ReturnedId {
                        reference: integer(row, "nodeRef")?,
                        id,
                    });
                }
            }
            Statement::MergeNodes { labels, key, .. } => {
                for row in rows {
                    let props = properties(row)?;
                    let wanted = props.get(key).cloned().unwrap_or(Value::Null);
                    let existing = self
                        .nodes
                        .iter()
                        .find(|(_, node)| {
                            labels.iter().all(|l| node.labels.contains(l))
                                && node.properties.get(key) == Some(&wanted)
                        })
                        .map(|(id, _)| *id);
                    let id = match existing {
                        Some(id) => {
                            if let Some(node) = self.nodes.get_mut(&id) {
                                node.properties = props;
                            }
                            id
                        }
                        None => self.create_node(labels, props),
                    };
                    returned.push(ReturnedId {
                        reference: integer(row, "nodeRef")?,
                        id,
                    });
                }
            }
            Statement::UpdateNodes {
                labels, version, ..
            } => {
                for row in rows {
                    let id = integer(row, "nodeId")?;
                    let Some(node) = self.nodes.get_mut(&id) else {
                        continue;
                    };
                    if !version_matches(&node.properties, version, row) {
                        continue;
                    }
                    node.labels.extend(labels.iter().cloned());
                    merge_properties(&mut node.properties, raw_properties(row)?);
                    returned.push(ReturnedId { reference: id, id });
                }
            }
            Statement::CreateRelationships {
                rel_type,
                undirected,
                ..
            } => {
                for row in rows {
                    let (start, end) = self.endpoints(row)?;
                    let existing = self
                        .relationships
                        .iter()
                        .find(|(_, rel)| {
                            rel.rel_type == *rel_type
                                && ((rel.start == start && rel.end == end)
                                    || (*undirected && rel.start == end && rel.end == start))
                        })
                        .map(|(id, _)| *id);
                    let id = match existing {
                        Some(id) => id,
                        None => self.create_relationship(rel_type, start, end, PropertyMap::new()),
                    };
                    returned.push(ReturnedId {
                        reference: integer(row, "relRef")?,
                        id,
                    });
                }
            }
            Statement::CreateRelationshipEntity { rel_type, .. } => {
                for row in rows {
                    let (start, end) = self.endpoints(row)?;
                    let id = self.create_relationship(rel_type, start, end, properties(row)?);
                    returned.push(ReturnedId {
                        reference: integer(row, "relRef")?,
                        id,
                    });
                }
            }
            Statement::UpdateRelationshipEntities { version, .. } => {
                for row in rows {
                    let id = integer(row, "relId")?;
                    let Some(rel) = self.relationships.get_mut(&id) else {
                        continue;
                    };
                    if !version_matches(&rel.properties, version, row) {
                        continue;
                    }
                    merge_properties(&mut rel.properties, raw_properties(row)?);
                    returned.push(ReturnedId { reference: id, id });
                }
            }
            Statement::DeleteRelationships { rel_type, .. } => {
                for row in rows {
                    let start = integer(row, "startNodeId")?;
                    let end = integer(row, "endNodeId")?;
                    let keep = integers(row, "keep")?;
                    self.relationships.retain(|id, rel| {
                        keep.contains(id)
                            || !(rel.rel_type == *rel_type && rel.start == start && rel.end == end)
                    });
                }
            }
            Statement::DeleteRelationshipEntities { version, .. } => {
                for row in rows {
                    let id = integer(row, "relId")?;
                    let matches = self
                        .relationships
                        .get(&id)
                        .is_some_and(|rel| version_matches(&rel.properties, version, row));
                    if matches {
                        self.relationships.remove(&id);
                        returned.push(ReturnedId { reference: id, id });
                    }
                }
            }
            Statement::DeleteNodes { version, .. } => {
                for row in rows {
                    let id = integer(row, "nodeId")?;
                    let matches = self
                        .nodes
                        .get(&id)
                        .is_some_and(|node| version_matches(&node.properties, version, row));
                    if matches {
                        self.detach_delete(id);
                        returned.push(ReturnedId { reference: id, id });
                    }
                }
            }
            Statement::DeleteNodesByLabel { label } => {
                let ids: Vec<NativeId> = self
                    .nodes
                    .iter()
                    .filter(|(_, node)| node.labels.contains(label))
                    .map(|(id, _)| *id)
                    .collect();
                for id in ids {
                    self.detach_delete(id);
                }
            }
            Statement::DeleteRelationshipsByType { rel_type } => {
                self.relationships.retain(|_, rel| rel.rel_type != *rel_type);
            }
            Statement::Purge => {
                self.nodes.clear();
                self.relationships.clear();
            }
        }
        Ok(returned)
    }

    fn create_node(&mut self, labels: &[String], properties: PropertyMap) -> NativeId {
        let id = self.next_node_id;
        self.next_node_id += 1;
        self.nodes.insert(
            id,
            StoredNode {
                labels: labels.iter().cloned().collect(),
                properties,
            },
        );
        id
    }

    fn create_relationship(
        &mut self,
        rel_type: &str,
        start: NativeId,
        end: NativeId,
        properties: PropertyMap,
    ) -> NativeId {
        let id = self.next_relationship_id;
        self.next_relationship_id += 1;
        self.relationships.insert(
            id,
            StoredRelationship {
                rel_type: rel_type.to_string(),
                start,
                end,
                properties,
            },
        );
        id
    }

    /// Both endpoints of a relationship row, which must exist.
    fn endpoints(&self, row: &Value) -> Result<(NativeId, NativeId), TransportError> {
        let start = integer(row, "startNodeId")?;
        let end = integer(row, "endNodeId")?;
        for id in [start, end] {
            if !self.nodes.contains_key(&id) {
                return Err(TransportError::Query(format!("no node with id {id}")));
            }
        }
        Ok((start, end))
    }

    fn detach_delete(&mut self, id: NativeId) {
        self.nodes.remove(&id);
        self.relationships
            .retain(|_, rel| rel.start != id && rel.end != id);
    }

    // ── Loads ────────────────────────────────────────────────────

    fn count(&self, request: &CountRequest) -> u64 {
        let count = match request {
            CountRequest::Nodes { labels } => self
                .nodes
                .values()
                .filter(|node| labels.iter().all(|l| node.labels.contains(l)))
                .count(),
            CountRequest::Relationships { rel_type } => self
                .relationships
                .values()
                .filter(|rel| rel.rel_type == *rel_type)
                .count(),
        };
        count as u64
    }

    fn load(&self, request: &LoadRequest) -> GraphResponse {
        let has_labels = |id: &NativeId| {
            self.nodes
                .get(id)
                .is_some_and(|node| request.labels().iter().all(|l| node.labels.contains(l)))
        };
        let mut rel_ids: BTreeSet<NativeId> = BTreeSet::new();
        let (roots, start): (Vec<NativeId>, Vec<NativeId>) = match request {
            LoadRequest::ByIds { ids, .. } => {
                let roots: Vec<NativeId> = ids.iter().copied().filter(has_labels).collect();
                (roots.clone(), roots)
            }
            LoadRequest::ByLabels { .. } => {
                let roots: Vec<NativeId> = self.nodes.keys().copied().filter(has_labels).collect();
                (roots.clone(), roots)
            }
            LoadRequest::RelationshipsByIds { rel_type, ids, .. } => {
                let mut roots = Vec::new();
                let mut endpoints = Vec::new();
                for id in ids {
                    let Some(rel) = self.relationships.get(id) else {
                        continue;
                    };
                    if rel.rel_type != *rel_type {
                        continue;
                    }
                    roots.push(*id);
                    rel_ids.insert(*id);
                    endpoints.extend([rel.start, rel.end]);
                }
                (roots, endpoints)
            }
        };

        // Breadth-first over relationships in either direction.
        let mut seen: HashSet<NativeId> = HashSet::new();
        let mut node_ids: Vec<NativeId> = Vec::new();
        let mut queue: VecDeque<(NativeId, i32)> = VecDeque::new();
        for id in start {
            if seen.insert(id) {
                node_ids.push(id);
                queue.push_back((id, 0));
            }
        }
        let depth = request.depth();

        while let Some((id, distance)) = queue.pop_front() {
            if depth >= 0 && distance >= depth {
                continue;
            }
            for (rel_id, rel) in &self.relationships {
                if rel.start != id && rel.end != id {
                    continue;
                }
                rel_ids.insert(*rel_id);
                let other = if rel.start == id { rel.end } else { rel.start };
                if seen.insert(other) {
                    node_ids.push(other);
                    queue.push_back((other, distance + 1));
                }
            }
        }

        GraphResponse {
            roots,
            nodes: node_ids
                .iter()
                .filter_map(|id| self.nodes.get(id).map(|node| node_record(*id, node)))
                .collect(),
            relationships: rel_ids
                .iter()
                .filter_map(|id| {
                    self.relationships
                        .get(id)
                        .map(|rel| relationship_record(*id, rel))
                })
                .collect(),
        }
    }
}

fn node_record(id: NativeId, node: &StoredNode) -> NodeRecord {
    NodeRecord {
        id,
        labels: node.labels.iter().cloned().collect(),
        properties: node.properties.clone(),
    }
}

fn relationship_record(id: NativeId, rel: &StoredRelationship) -> RelationshipRecord {
    RelationshipRecord {
        id,
        rel_type: rel.rel_type.clone(),
        start: rel.start,
        end: rel.end,
        properties: rel.properties.clone(),
    }
}

fn integer(row: &Value, key: &str) -> Result<i64, TransportError> {
    row.get(key)
        .and_then(Value::as_i64)
        .ok_or_else(|| TransportError::Query(format!("row is missing integer {key}")))
}

/// An optional list of integers; absent reads as empty.
fn integers(row: &Value, key: &str) -> Result<Vec<i64>, TransportError> {
    match row.get(key) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_i64()
                    .ok_or_else(|| TransportError::Query(format!("{key} must hold integers")))
            })
            .collect(),
        Some(other) => Err(TransportError::Query(format!(
            "{key} must be a list, got {other}"
        ))),
    }
}

/// `row.props` as sent, nulls included.
fn raw_properties(row: &Value) -> Result<PropertyMap, TransportError> {
    match row.get("props") {
        Some(Value::Object(map)) => Ok(map.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        None | Some(Value::Null) => Ok(PropertyMap::new()),
        Some(other) => Err(TransportError::Query(format!(
            "row props must be a map, got {other}"
        ))),
    }
}

/// `row.props` for `SET n = props`. Cypher never stores nulls.
fn properties(row: &Value) -> Result<PropertyMap, TransportError> {
    let mut props = raw_properties(row)?;
    props.retain(|_, v| !v.is_null());
    Ok(props)
}

/// `SET n += props`: null values remove the key.
fn merge_properties(target: &mut PropertyMap, props: PropertyMap) {
    for (key, value) in props {
        if value.is_null() {
            target.remove(&key);
        } else {
            target.insert(key, value);
        }
    }
}

fn version_matches(stored: &PropertyMap, version: &Option<String>, row: &Value) -> bool {
    let Some(name) = version else {
        return true;
    };
    stored.get(name) == row.get("expectedVersion")
}
