//! Read operations: variable-depth subgraph loads and counts.

use neo4rs::query;
use ogm_core::{GraphResponse, NodeRecord, PropertyMap, RelationshipRecord};
use ogm_mapping::{quote, CountRequest, LoadRequest};

use crate::client::{GraphError, Neo4jDriver};

impl Neo4jDriver {
    /// Load the roots named by `request` together with every node and
    /// relationship on paths of up to `depth` hops from them.
    pub async fn load(&self, request: &LoadRequest) -> Result<GraphResponse, GraphError> {
        let cypher = load_cypher(request);
        let q = match request {
            LoadRequest::ByIds { ids, .. } | LoadRequest::RelationshipsByIds { ids, .. } => {
                query(&cypher).param("ids", ids.clone())
            }
            LoadRequest::ByLabels { .. } => query(&cypher),
        };

        let rows = self.query_rows(q).await?;
        let mut response = GraphResponse::default();
        for row in rows {
            let roots: Vec<i64> = row.get("roots").unwrap_or_default();
            let nodes: Vec<neo4rs::Node> = row.get("nodes").map_err(|e| {
                GraphError::Serialization(format!("Failed to deserialize nodes: {e}"))
            })?;
            let relationships: Vec<neo4rs::Relation> = row.get("rels").map_err(|e| {
                GraphError::Serialization(format!("Failed to deserialize relationships: {e}"))
            })?;

            response.roots.extend(roots);
            for node in &nodes {
                response.nodes.push(neo4j_node_to_record(node)?);
            }
            for relationship in &relationships {
                response
                    .relationships
                    .push(neo4j_relation_to_record(relationship)?);
            }
        }
        response.dedup();

        tracing::debug!(
            roots = response.roots.len(),
            nodes = response.nodes.len(),
            relationships = response.relationships.len(),
            "Loaded subgraph"
        );
        Ok(response)
    }

    /// Count the nodes or relationships named by `request`.
    pub async fn count_matching(&self, request: &CountRequest) -> Result<u64, GraphError> {
        let rows = self.query_rows(query(&count_cypher(request))).await?;
        let count: i64 = match rows.first() {
            Some(row) => row.get("count").map_err(|e| {
                GraphError::Serialization(format!("Failed to read count: {e}"))
            })?,
            None => 0,
        };
        Ok(u64::try_from(count).unwrap_or_default())
    }
}

pub fn count_cypher(request: &CountRequest) -> String {
    match request {
        CountRequest::Nodes { labels } => {
            let labels: String = labels.iter().map(|l| format!(":{}", quote(l))).collect();
            format!("MATCH (n{labels}) RETURN count(n) AS count")
        }
        CountRequest::Relationships { rel_type } => {
            format!("MATCH ()-[r:{}]->() RETURN count(r) AS count", quote(rel_type))
        }
    }
}

/// Render the load query for `request`. A negative depth is unbounded.
pub fn load_cypher(request: &LoadRequest) -> String {
    let hops = match request.depth() {
        d if d < 0 => "*0..".to_string(),
        d => format!("*0..{d}"),
    };
    if let LoadRequest::RelationshipsByIds { rel_type, .. } = request {
        return format!(
            "MATCH ()-[r0:{}]->() WHERE ID(r0) IN $ids \
             UNWIND [startNode(r0), endNode(r0)] AS n MATCH p=(n)-[{hops}]-(m) \
             WITH collect(DISTINCT ID(r0)) AS roots, collect(DISTINCT r0) AS base, \
             collect(p) AS paths \
             RETURN roots, \
             reduce(acc = [], p IN paths | acc + nodes(p)) AS nodes, \
             base + reduce(acc = [], p IN paths | acc + relationships(p)) AS rels",
            quote(rel_type)
        );
    }
    let labels: String = request
        .labels()
        .iter()
        .map(|l| format!(":{}", quote(l)))
        .collect();
    let filter = match request {
        LoadRequest::ByIds { .. } => " WHERE ID(n) IN $ids",
        LoadRequest::ByLabels { .. } | LoadRequest::RelationshipsByIds { .. } => "",
    };
    format!(
        "MATCH (n{labels}){filter} WITH n MATCH p=(n)-[{hops}]-(m) \
         WITH collect(DISTINCT ID(n)) AS roots, collect(p) AS paths \
         RETURN roots, \
         reduce(acc = [], p IN paths | acc + nodes(p)) AS nodes, \
         reduce(acc = [], p IN paths | acc + relationships(p)) AS rels"
    )
}

/// Convert a neo4rs::Node to our NodeRecord, keeping every property.
fn neo4j_node_to_record(node: &neo4rs::Node) -> Result<NodeRecord, GraphError> {
    let mut properties = PropertyMap::new();
    for key in node.keys() {
        let value: serde_json::Value = node.get(key).map_err(|e| {
            GraphError::Serialization(format!("Failed to read node property {key}: {e}"))
        })?;
        properties.insert(key.to_string(), value);
    }
    Ok(NodeRecord {
        id: node.id(),
        labels: node.labels().into_iter().map(str::to_string).collect(),
        properties,
    })
}

fn neo4j_relation_to_record(rel: &neo4rs::Relation) -> Result<RelationshipRecord, GraphError> {
    let mut properties = PropertyMap::new();
    for key in rel.keys() {
        let value: serde_json::Value = rel.get(key).map_err(|e| {
            GraphError::Serialization(format!("Failed to read relationship property {key}: {e}"))
        })?;
        properties.insert(key.to_string(), value);
    }
    Ok(RelationshipRecord {
        id: rel.id(),
        rel_type: rel.typ().to_string(),
        start: rel.start_node_id(),
        end: rel.end_node_id(),
        properties,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_by_ids_cypher() {
        let request = LoadRequest::ByIds {
            labels: vec!["Movie".into()],
            ids: vec![1, 2],
            depth: 1,
        };
        assert_eq!(
            load_cypher(&request),
            "MATCH (n:`Movie`) WHERE ID(n) IN $ids WITH n MATCH p=(n)-[*0..1]-(m) \
             WITH collect(DISTINCT ID(n)) AS roots, collect(p) AS paths \
             RETURN roots, \
             reduce(acc = [], p IN paths | acc + nodes(p)) AS nodes, \
             reduce(acc = [], p IN paths | acc + relationships(p)) AS rels"
        );
    }

    #[test]
    fn test_unbounded_load_by_labels() {
        let request = LoadRequest::ByLabels {
            labels: vec!["Person".into(), "Director".into()],
            depth: -1,
        };
        let cypher = load_cypher(&request);
        assert!(cypher.starts_with("MATCH (n:`Person`:`Director`) WITH n MATCH p=(n)-[*0..]-(m)"));
        assert!(!cypher.contains("$ids"));
    }

    #[test]
    fn test_load_relationships_by_ids_cypher() {
        let request = LoadRequest::RelationshipsByIds {
            rel_type: "ACTS_IN".into(),
            ids: vec![4],
            depth: 1,
        };
        let cypher = load_cypher(&request);
        assert!(cypher.starts_with("MATCH ()-[r0:`ACTS_IN`]->() WHERE ID(r0) IN $ids"));
        assert!(cypher
            .contains("UNWIND [startNode(r0), endNode(r0)] AS n MATCH p=(n)-[*0..1]-(m)"));
        assert!(cypher.contains("collect(DISTINCT ID(r0)) AS roots"));
    }

    #[test]
    fn test_count_cypher() {
        let nodes = CountRequest::Nodes {
            labels: vec!["Person".into(), "Director".into()],
        };
        assert_eq!(
            count_cypher(&nodes),
            "MATCH (n:`Person`:`Director`) RETURN count(n) AS count"
        );
        let rels = CountRequest::Relationships {
            rel_type: "ACTS_IN".into(),
        };
        assert_eq!(
            count_cypher(&rels),
            "MATCH ()-[r:`ACTS_IN`]->() RETURN count(r) AS count"
        );
    }
}
