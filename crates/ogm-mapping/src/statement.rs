//! Structured write statements and their Cypher rendering.
//!
//! Statements stay structured until the moment they are executed: the
//! compiler emits them with temporary references, and rows are rendered
//! against the ids resolved so far in the enclosing transaction.

use std::collections::HashMap;

use ogm_core::{EntityKind, MappingError, NativeId, PropertyMap, VersionConflict};
use serde_json::{json, Map, Value};

/// Temporary reference (negative) or native id (non-negative) to the id
/// the database assigned to it.
pub type IdMap = HashMap<i64, NativeId>;

/// A node as seen from a statement: already persisted, or created earlier
/// in the same batch under a temporary reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRef {
    Existing(NativeId),
    New(i64),
}

impl NodeRef {
    /// Native id, or the negative temporary reference.
    pub fn key(&self) -> i64 {
        match self {
            Self::Existing(id) => *id,
            Self::New(reference) => *reference,
        }
    }

    pub fn resolve(&self, ids: &IdMap) -> Result<NativeId, MappingError> {
        match self {
            Self::Existing(id) => Ok(*id),
            Self::New(reference) => ids
                .get(reference)
                .copied()
                .ok_or(MappingError::UnresolvedReference(*reference)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeRow {
    pub reference: i64,
    pub properties: PropertyMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeUpdateRow {
    pub id: NativeId,
    pub properties: PropertyMap,
    pub expected_version: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipRow {
    pub reference: i64,
    pub start: NodeRef,
    pub end: NodeRef,
    pub properties: PropertyMap,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationshipUpdateRow {
    pub id: NativeId,
    pub properties: PropertyMap,
    pub expected_version: Option<i64>,
}

/// A plain relationship to delete. `keep` lists relationship entities of
/// the same type between the same nodes that must survive: native ids, or
/// temporary references created earlier in the batch.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeRow {
    pub start: NativeId,
    pub end: NativeId,
    pub keep: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteRow {
    pub id: NativeId,
    pub expected_version: Option<i64>,
}

/// One parameterized write.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    CreateNodes {
        labels: Vec<String>,
        rows: Vec<NodeRow>,
    },
    /// Create-or-match on the primary-index property.
    MergeNodes {
        labels: Vec<String>,
        key: String,
        rows: Vec<NodeRow>,
    },
    UpdateNodes {
        labels: Vec<String>,
        version: Option<String>,
        rows: Vec<NodeUpdateRow>,
    },
    /// Plain relationships, merged so that re-saving never duplicates.
    CreateRelationships {
        rel_type: String,
        undirected: bool,
        rows: Vec<RelationshipRow>,
    },
    /// A single relationship entity; always a fresh relationship.
    CreateRelationshipEntity {
        rel_type: String,
        row: RelationshipRow,
    },
    UpdateRelationshipEntities {
        version: Option<String>,
        rows: Vec<RelationshipUpdateRow>,
    },
    DeleteRelationships {
        rel_type: String,
        rows: Vec<EdgeRow>,
    },
    DeleteRelationshipEntities {
        version: Option<String>,
        rows: Vec<DeleteRow>,
    },
    DeleteNodes {
        version: Option<String>,
        rows: Vec<DeleteRow>,
    },
    DeleteNodesByLabel {
        label: String,
    },
    DeleteRelationshipsByType {
        rel_type: String,
    },
    Purge,
}

const MATCH_ENDPOINTS: &str = "UNWIND $rows as row \
    MATCH (startNode) WHERE ID(startNode) = row.startNodeId WITH row,startNode \
    MATCH (endNode) WHERE ID(endNode) = row.endNodeId";

impl Statement {
    pub fn cypher(&self) -> String {
        match self {
            Self::CreateNodes { labels, .. } => format!(
                "UNWIND $rows as row CREATE (n{}) SET n=row.props \
                 RETURN row.nodeRef as ref, ID(n) as id, $type as type",
                label_clause(labels)
            ),
            Self::MergeNodes { labels, key, .. } => {
                let key = quote(key);
                format!(
                    "UNWIND $rows as row MERGE (n{} {{{key}: row.props.{key}}}) SET n=row.props \
                     RETURN row.nodeRef as ref, ID(n) as id, $type as type",
                    label_clause(labels)
                )
            }
            Self::UpdateNodes {
                labels, version, ..
            } => format!(
                "UNWIND $rows as row MATCH (n) WHERE ID(n)=row.nodeId{} SET n{} SET n += row.props \
                 RETURN row.nodeId as ref, ID(n) as id, $type as type",
                version_clause("n", version),
                label_clause(labels)
            ),
            Self::CreateRelationships {
                rel_type,
                undirected,
                ..
            } => format!(
                "{MATCH_ENDPOINTS} MERGE (startNode)-[rel:{}]-{}(endNode) \
                 RETURN row.relRef as ref, ID(rel) as id, $type as type",
                quote(rel_type),
                if *undirected { "" } else { ">" }
            ),
            Self::CreateRelationshipEntity { rel_type, .. } => format!(
                "{MATCH_ENDPOINTS} CREATE (startNode)-[rel:{}]->(endNode) SET rel += row.props \
                 RETURN row.relRef as ref, ID(rel) as id, $type as type",
                quote(rel_type)
            ),
            Self::UpdateRelationshipEntities { version, .. } => format!(
                "UNWIND $rows as row MATCH ()-[rel]->() WHERE ID(rel) = row.relId{} \
                 SET rel += row.props RETURN row.relId as ref, ID(rel) as id, $type as type",
                version_clause("rel", version)
            ),
            Self::DeleteRelationships { rel_type, .. } => format!(
                "{MATCH_ENDPOINTS} MATCH (startNode)-[rel:{}]->(endNode) \
                 WHERE NOT ID(rel) IN row.keep DELETE rel",
                quote(rel_type)
            ),
            Self::DeleteRelationshipEntities { version, .. } => format!(
                "UNWIND $rows as row MATCH ()-[rel]->() WHERE ID(rel) = row.relId{} \
                 DELETE rel RETURN row.relId as ref, row.relId as id, $type as type",
                version_clause("rel", version)
            ),
            Self::DeleteNodes { version, .. } => format!(
                "UNWIND $rows as row MATCH (n) WHERE ID(n) = row.nodeId{} \
                 DETACH DELETE n RETURN row.nodeId as ref, row.nodeId as id, $type as type",
                version_clause("n", version)
            ),
            Self::DeleteNodesByLabel { label } => {
                format!("MATCH (n:{}) DETACH DELETE n", quote(label))
            }
            Self::DeleteRelationshipsByType { rel_type } => {
                format!("MATCH ()-[rel:{}]->() DELETE rel", quote(rel_type))
            }
            Self::Purge => "MATCH (n) DETACH DELETE n".to_string(),
        }
    }

    /// Value bound to `$type` in the RETURN clause.
    pub fn result_type(&self) -> &'static str {
        match self {
            Self::CreateNodes { .. }
            | Self::MergeNodes { .. }
            | Self::UpdateNodes { .. }
            | Self::DeleteNodes { .. }
            | Self::DeleteNodesByLabel { .. }
            | Self::Purge => "node",
            _ => "rel",
        }
    }

    /// Render `$rows`, resolving temporary references through `ids`.
    pub fn rows(&self, ids: &IdMap) -> Result<Vec<Value>, MappingError> {
        let rows: Vec<Value> = match self {
            Self::CreateNodes { rows, .. } | Self::MergeNodes { rows, .. } => rows
                .iter()
                .map(|row| json!({ "nodeRef": row.reference, "props": props(&row.properties) }))
                .collect(),
            Self::UpdateNodes { rows, .. } => rows
                .iter()
                .map(|row| {
                    versioned(
                        json!({ "nodeId": row.id, "props": props(&row.properties) }),
                        row.expected_version,
                    )
                })
                .collect(),
            Self::CreateRelationships { rows, .. } => rows
                .iter()
                .map(|row| relationship_row(row, ids))
                .collect::<Result<_, _>>()?,
            Self::CreateRelationshipEntity { row, .. } => vec![relationship_row(row, ids)?],
            Self::UpdateRelationshipEntities { rows, .. } => rows
                .iter()
                .map(|row| {
                    versioned(
                        json!({ "relId": row.id, "props": props(&row.properties) }),
                        row.expected_version,
                    )
                })
                .collect(),
            Self::DeleteRelationships { rows, .. } => rows
                .iter()
                .map(|row| -> Result<Value, MappingError> {
                    let keep = row
                        .keep
                        .iter()
                        .map(|key| resolve_key(*key, ids))
                        .collect::<Result<Vec<_>, _>>()?;
                    Ok(json!({ "startNodeId": row.start, "endNodeId": row.end, "keep": keep }))
                })
                .collect::<Result<_, _>>()?,
            Self::DeleteRelationshipEntities { rows, .. } => rows
                .iter()
                .map(|row| versioned(json!({ "relId": row.id }), row.expected_version))
                .collect(),
            Self::DeleteNodes { rows, .. } => rows
                .iter()
                .map(|row| versioned(json!({ "nodeId": row.id }), row.expected_version))
                .collect(),
            Self::DeleteNodesByLabel { .. }
            | Self::DeleteRelationshipsByType { .. }
            | Self::Purge => Vec::new(),
        };
        Ok(rows)
    }

    pub fn row_count(&self) -> usize {
        match self {
            Self::CreateNodes { rows, .. } | Self::MergeNodes { rows, .. } => rows.len(),
            Self::UpdateNodes { rows, .. } => rows.len(),
            Self::CreateRelationships { rows, .. } => rows.len(),
            Self::CreateRelationshipEntity { .. } => 1,
            Self::UpdateRelationshipEntities { rows, .. } => rows.len(),
            Self::DeleteRelationships { rows, .. } => rows.len(),
            Self::DeleteRelationshipEntities { rows, .. } | Self::DeleteNodes { rows, .. } => {
                rows.len()
            }
            Self::DeleteNodesByLabel { .. }
            | Self::DeleteRelationshipsByType { .. }
            | Self::Purge => 0,
        }
    }

    /// Rows whose write only succeeds when the stored version still equals
    /// the expectation. Each must come back in the results, keyed by id.
    pub fn version_checks(&self) -> Vec<VersionConflict> {
        let checks = |kind: EntityKind, rows: Vec<(NativeId, Option<i64>)>| -> Vec<VersionConflict> {
            rows.into_iter()
                .filter_map(|(id, expected)| {
                    expected.map(|expected_version| VersionConflict {
                        kind,
                        id,
                        expected_version,
                    })
                })
                .collect()
        };
        match self {
            Self::UpdateNodes {
                version: Some(_),
                rows,
                ..
            } => checks(
                EntityKind::Node,
                rows.iter().map(|r| (r.id, r.expected_version)).collect(),
            ),
            Self::DeleteNodes {
                version: Some(_),
                rows,
            } => checks(
                EntityKind::Node,
                rows.iter().map(|r| (r.id, r.expected_version)).collect(),
            ),
            Self::UpdateRelationshipEntities {
                version: Some(_),
                rows,
            } => checks(
                EntityKind::Relationship,
                rows.iter().map(|r| (r.id, r.expected_version)).collect(),
            ),
            Self::DeleteRelationshipEntities {
                version: Some(_),
                rows,
            } => checks(
                EntityKind::Relationship,
                rows.iter().map(|r| (r.id, r.expected_version)).collect(),
            ),
            _ => Vec::new(),
        }
    }
}

fn relationship_row(row: &RelationshipRow, ids: &IdMap) -> Result<Value, MappingError> {
    Ok(json!({
        "relRef": row.reference,
        "startNodeId": row.start.resolve(ids)?,
        "endNodeId": row.end.resolve(ids)?,
        "props": props(&row.properties),
    }))
}

fn resolve_key(key: i64, ids: &IdMap) -> Result<NativeId, MappingError> {
    if key >= 0 {
        return Ok(key);
    }
    ids.get(&key)
        .copied()
        .ok_or(MappingError::UnresolvedReference(key))
}

fn props(properties: &PropertyMap) -> Value {
    Value::Object(
        properties
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Map<String, Value>>(),
    )
}

fn versioned(mut row: Value, expected_version: Option<i64>) -> Value {
    if let (Some(expected), Value::Object(map)) = (expected_version, &mut row) {
        map.insert("expectedVersion".to_string(), Value::from(expected));
    }
    row
}

fn version_clause(alias: &str, version: &Option<String>) -> String {
    match version {
        Some(name) => format!(" AND {alias}.{} = row.expectedVersion", quote(name)),
        None => String::new(),
    }
}

fn label_clause(labels: &[String]) -> String {
    labels.iter().map(|l| format!(":{}", quote(l))).collect()
}

/// Backtick-quote an identifier.
pub fn quote(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn title(value: &str) -> PropertyMap {
        let mut map = PropertyMap::new();
        map.insert("title".into(), json!(value));
        map
    }

    #[test]
    fn test_create_nodes_cypher() {
        let statement = Statement::CreateNodes {
            labels: vec!["Movie".into()],
            rows: vec![NodeRow {
                reference: -1,
                properties: title("Heat"),
            }],
        };
        assert_eq!(
            statement.cypher(),
            "UNWIND $rows as row CREATE (n:`Movie`) SET n=row.props \
             RETURN row.nodeRef as ref, ID(n) as id, $type as type"
        );
        assert_eq!(
            statement.rows(&IdMap::new()).unwrap(),
            vec![json!({"nodeRef": -1, "props": {"title": "Heat"}})]
        );
        assert_eq!(statement.result_type(), "node");
    }

    #[test]
    fn test_update_nodes_cypher() {
        let statement = Statement::UpdateNodes {
            labels: vec!["Person".into(), "Director".into()],
            version: None,
            rows: vec![],
        };
        assert_eq!(
            statement.cypher(),
            "UNWIND $rows as row MATCH (n) WHERE ID(n)=row.nodeId SET n:`Person`:`Director` \
             SET n += row.props RETURN row.nodeId as ref, ID(n) as id, $type as type"
        );
    }

    #[test]
    fn test_versioned_update() {
        let statement = Statement::UpdateNodes {
            labels: vec!["Movie".into()],
            version: Some("version".into()),
            rows: vec![NodeUpdateRow {
                id: 7,
                properties: title("Heat"),
                expected_version: Some(2),
            }],
        };
        assert!(statement
            .cypher()
            .contains("WHERE ID(n)=row.nodeId AND n.`version` = row.expectedVersion"));
        assert_eq!(
            statement.rows(&IdMap::new()).unwrap()[0]["expectedVersion"],
            json!(2)
        );
        assert_eq!(
            statement.version_checks(),
            vec![VersionConflict {
                kind: EntityKind::Node,
                id: 7,
                expected_version: 2
            }]
        );
    }

    #[test]
    fn test_merge_on_primary_index() {
        let statement = Statement::MergeNodes {
            labels: vec!["User".into()],
            key: "email".into(),
            rows: vec![],
        };
        assert_eq!(
            statement.cypher(),
            "UNWIND $rows as row MERGE (n:`User` {`email`: row.props.`email`}) SET n=row.props \
             RETURN row.nodeRef as ref, ID(n) as id, $type as type"
        );
    }

    #[test]
    fn test_relationship_cypher() {
        let plain = Statement::CreateRelationships {
            rel_type: "DIRECTED".into(),
            undirected: false,
            rows: vec![],
        };
        assert_eq!(
            plain.cypher(),
            "UNWIND $rows as row MATCH (startNode) WHERE ID(startNode) = row.startNodeId \
             WITH row,startNode MATCH (endNode) WHERE ID(endNode) = row.endNodeId \
             MERGE (startNode)-[rel:`DIRECTED`]->(endNode) \
             RETURN row.relRef as ref, ID(rel) as id, $type as type"
        );

        let undirected = Statement::CreateRelationships {
            rel_type: "FRIEND_OF".into(),
            undirected: true,
            rows: vec![],
        };
        assert!(undirected
            .cypher()
            .contains("MERGE (startNode)-[rel:`FRIEND_OF`]-(endNode)"));

        let deletion = Statement::DeleteRelationships {
            rel_type: "DIRECTED".into(),
            rows: vec![EdgeRow {
                start: 1,
                end: 2,
                keep: Vec::new(),
            }],
        };
        assert!(deletion.cypher().ends_with(
            "MATCH (startNode)-[rel:`DIRECTED`]->(endNode) WHERE NOT ID(rel) IN row.keep DELETE rel"
        ));
        assert_eq!(deletion.result_type(), "rel");
    }

    #[test]
    fn test_deletion_keep_list_resolves_references() {
        let deletion = Statement::DeleteRelationships {
            rel_type: "ACTS_IN".into(),
            rows: vec![EdgeRow {
                start: 1,
                end: 2,
                keep: vec![30, -4],
            }],
        };
        assert_eq!(
            deletion.rows(&IdMap::new()).unwrap_err(),
            MappingError::UnresolvedReference(-4)
        );
        let ids = IdMap::from([(-4, 31)]);
        assert_eq!(
            deletion.rows(&ids).unwrap(),
            vec![json!({"startNodeId": 1, "endNodeId": 2, "keep": [30, 31]})]
        );
    }

    #[test]
    fn test_relationship_entity_rows_resolve_references() {
        let statement = Statement::CreateRelationshipEntity {
            rel_type: "ACTS_IN".into(),
            row: RelationshipRow {
                reference: -3,
                start: NodeRef::New(-2),
                end: NodeRef::Existing(10),
                properties: {
                    let mut map = PropertyMap::new();
                    map.insert("character".into(), json!("Neo"));
                    map
                },
            },
        };
        assert!(statement
            .cypher()
            .contains("CREATE (startNode)-[rel:`ACTS_IN`]->(endNode) SET rel += row.props"));

        assert_eq!(
            statement.rows(&IdMap::new()).unwrap_err(),
            MappingError::UnresolvedReference(-2)
        );

        let ids = IdMap::from([(-2, 11)]);
        assert_eq!(
            statement.rows(&ids).unwrap(),
            vec![json!({
                "relRef": -3,
                "startNodeId": 11,
                "endNodeId": 10,
                "props": {"character": "Neo"}
            })]
        );
    }

    #[test]
    fn test_quote_escapes_backticks() {
        assert_eq!(quote("we`ird"), "`we``ird`");
        assert_eq!(
            Statement::DeleteNodesByLabel {
                label: "Movie".into()
            }
            .cypher(),
            "MATCH (n:`Movie`) DETACH DELETE n"
        );
        assert_eq!(
            Statement::DeleteRelationshipsByType {
                rel_type: "ACTS_IN".into()
            }
            .cypher(),
            "MATCH ()-[rel:`ACTS_IN`]->() DELETE rel"
        );
    }
}
