//! Load path: turn a graph response into entity instances.
//!
//! Mapping runs in two phases. The first resolves descriptors, builds new
//! instances off to the side and checks that every relationship has
//! somewhere to go. Only when the whole response is known to map does the
//! second phase touch registered instances and the context.

use std::collections::HashMap;
use std::sync::Arc;

use ogm_core::{
    Direction, EntityKind, GraphResponse, MappingError, NativeId, NodeRecord, RelationshipRecord,
};
use ogm_metadata::{EntityRef, MetaData, RelationshipAttribute, SchemaDescriptor};

use crate::context::{MappedRelationship, MappingContext};

struct PlannedNode {
    instance: EntityRef,
    descriptor: Arc<SchemaDescriptor>,
    registered: bool,
}

/// An owner-side attribute that receives the other end of a relationship.
struct Writer {
    owner: NativeId,
    other: NativeId,
    descriptor: Arc<SchemaDescriptor>,
    attribute: usize,
}

impl Writer {
    fn attribute(&self) -> &RelationshipAttribute {
        &self.descriptor.relationships()[self.attribute]
    }
}

struct PlannedRelationship<'r> {
    record: &'r RelationshipRecord,
    entity: Option<Arc<SchemaDescriptor>>,
    writers: Vec<Writer>,
}

/// Maps one response into a session's context.
pub struct GraphEntityMapper<'a> {
    metadata: &'a MetaData,
    context: &'a mut MappingContext,
}

impl<'a> GraphEntityMapper<'a> {
    pub fn new(metadata: &'a MetaData, context: &'a mut MappingContext) -> Self {
        Self { metadata, context }
    }

    /// Map every record and return the instances for the response roots,
    /// in root order.
    ///
    /// A relationship that no attribute on either endpoint can hold fails
    /// the call before any registered instance or the context changes.
    pub fn map(&mut self, response: &GraphResponse) -> Result<Vec<EntityRef>, MappingError> {
        let roots = self.map_graph(response)?;
        Ok(roots
            .iter()
            .filter_map(|id| self.context.get(*id).cloned())
            .collect())
    }

    /// Like [`map`](Self::map), for responses whose roots are relationship
    /// ids. Returns the relationship entities for those roots.
    pub fn map_relationship_entities(
        &mut self,
        response: &GraphResponse,
    ) -> Result<Vec<EntityRef>, MappingError> {
        let roots = self.map_graph(response)?;
        Ok(roots
            .iter()
            .filter_map(|id| self.context.relationship_entity(*id))
            .map(|entry| entry.instance.clone())
            .collect())
    }

    fn map_graph(&mut self, response: &GraphResponse) -> Result<Vec<NativeId>, MappingError> {
        let mut response = response.clone();
        response.dedup();

        let nodes = self.plan_nodes(&response.nodes)?;
        let relationships = self.plan_relationships(&response.relationships, &nodes)?;

        for record in &response.nodes {
            let Some(planned) = nodes.get(&record.id) else {
                continue;
            };
            if planned.registered {
                planned
                    .descriptor
                    .write_properties(&planned.instance, &record.properties)?;
                self.context.remember(EntityKind::Node, record.id)?;
            } else {
                self.context
                    .register(planned.instance.clone(), &planned.descriptor, record.id)?;
            }
        }

        for planned in &relationships {
            self.apply_relationship(planned)?;
        }

        tracing::debug!(
            nodes = nodes.len(),
            relationships = relationships.len(),
            roots = response.roots.len(),
            "Mapped graph response"
        );
        Ok(response.roots)
    }

    fn plan_nodes(
        &self,
        records: &[NodeRecord],
    ) -> Result<HashMap<NativeId, PlannedNode>, MappingError> {
        let mut planned = HashMap::with_capacity(records.len());
        for record in records {
            if let Some(entry) = self.context.node(record.id) {
                // Property writes are rehearsed on a scratch instance so a
                // bad value fails here rather than half way through.
                let scratch = entry.descriptor.instantiate();
                entry
                    .descriptor
                    .write_properties(&scratch, &record.properties)?;
                planned.insert(
                    record.id,
                    PlannedNode {
                        instance: entry.instance.clone(),
                        descriptor: Arc::clone(&entry.descriptor),
                        registered: true,
                    },
                );
                continue;
            }

            let Some(descriptor) = self.metadata.resolve(&record.labels) else {
                tracing::warn!(id = record.id, labels = ?record.labels, "No descriptor for node, skipping");
                continue;
            };
            let instance = descriptor.instantiate();
            descriptor.identity().write(&instance, Some(record.id))?;
            descriptor.write_properties(&instance, &record.properties)?;
            planned.insert(
                record.id,
                PlannedNode {
                    instance,
                    descriptor: Arc::clone(descriptor),
                    registered: false,
                },
            );
        }
        Ok(planned)
    }

    fn plan_relationships<'r>(
        &self,
        records: &'r [RelationshipRecord],
        nodes: &HashMap<NativeId, PlannedNode>,
    ) -> Result<Vec<PlannedRelationship<'r>>, MappingError> {
        let mut planned = Vec::with_capacity(records.len());
        for record in records {
            let (Some(start), Some(end)) = (nodes.get(&record.start), nodes.get(&record.end))
            else {
                tracing::debug!(id = record.id, "relationship endpoint not mapped, skipping");
                continue;
            };

            let entity = self
                .metadata
                .relationship_entity(
                    &record.rel_type,
                    start.descriptor.name(),
                    end.descriptor.name(),
                )
                .cloned();
            let entity_name = entity.as_ref().map(|d| d.name());

            let mut writers = Vec::new();
            collect_writers(
                &mut writers,
                record,
                (record.start, &start.descriptor),
                (record.end, end.descriptor.name()),
                Direction::Outgoing,
                entity_name,
            );
            collect_writers(
                &mut writers,
                record,
                (record.end, &end.descriptor),
                (record.start, start.descriptor.name()),
                Direction::Incoming,
                entity_name,
            );

            if writers.is_empty() && entity.is_none() {
                return Err(MappingError::UnmappedRelationship {
                    rel_id: record.id,
                    rel_type: record.rel_type.clone(),
                    start: record.start,
                    end: record.end,
                });
            }
            if let Some(descriptor) = &entity {
                let scratch = descriptor.instantiate();
                descriptor.write_properties(&scratch, &record.properties)?;
            }
            planned.push(PlannedRelationship {
                record,
                entity,
                writers,
            });
        }
        Ok(planned)
    }

    fn apply_relationship(&mut self, planned: &PlannedRelationship<'_>) -> Result<(), MappingError> {
        let record = planned.record;
        let relationship_entity = match &planned.entity {
            Some(descriptor) => Some(self.map_relationship_entity(record, descriptor)?),
            None => None,
        };

        let mut plain = false;
        for writer in &planned.writers {
            let attribute = writer.attribute();
            let Some(owner) = self.context.get(writer.owner).cloned() else {
                continue;
            };
            let related = if attribute.is_relationship_entity() {
                relationship_entity.clone()
            } else {
                plain = true;
                self.context.get(writer.other).cloned()
            };
            if let Some(related) = related {
                attribute.attach(&owner, &related)?;
            }
        }

        if plain {
            self.context.register_edge(MappedRelationship::new(
                record.start,
                &record.rel_type,
                record.end,
            ));
        }
        Ok(())
    }

    fn map_relationship_entity(
        &mut self,
        record: &RelationshipRecord,
        descriptor: &Arc<SchemaDescriptor>,
    ) -> Result<EntityRef, MappingError> {
        if let Some(entry) = self.context.relationship_entity(record.id) {
            let instance = entry.instance.clone();
            descriptor.write_properties(&instance, &record.properties)?;
            self.context.remember(EntityKind::Relationship, record.id)?;
            return Ok(instance);
        }

        let (Some(start), Some(end)) = (
            self.context.get(record.start).cloned(),
            self.context.get(record.end).cloned(),
        ) else {
            return Err(MappingError::UnresolvedReference(record.id));
        };
        let (Some(start_attribute), Some(end_attribute)) = (descriptor.start(), descriptor.end())
        else {
            return Err(MappingError::NotRelationshipEntity {
                type_name: descriptor.name().to_string(),
            });
        };

        let instance = descriptor.instantiate();
        descriptor.identity().write(&instance, Some(record.id))?;
        descriptor.write_properties(&instance, &record.properties)?;
        start_attribute.write(&instance, start)?;
        end_attribute.write(&instance, end)?;
        self.context.register_relationship_entity(
            instance,
            descriptor,
            record.id,
            record.start,
            record.end,
        )
    }
}

/// Attributes on `owner` that hold a relationship of the record's type
/// pointing `side` (`Outgoing` when the owner is the start node). Undirected
/// and bidirectional attributes accept either side.
fn collect_writers(
    writers: &mut Vec<Writer>,
    record: &RelationshipRecord,
    owner: (NativeId, &Arc<SchemaDescriptor>),
    other: (NativeId, &str),
    side: Direction,
    relationship_entity: Option<&str>,
) {
    let (owner_id, descriptor) = owner;
    let (other_id, other_name) = other;
    for (index, attribute) in descriptor.relationships().iter().enumerate() {
        if attribute.rel_type() != record.rel_type {
            continue;
        }
        if !attribute.is_undirected() && attribute.direction() != side {
            continue;
        }
        let expected = if attribute.is_relationship_entity() {
            relationship_entity
        } else {
            Some(other_name)
        };
        if expected != Some(attribute.target()) {
            continue;
        }
        writers.push(Writer {
            owner: owner_id,
            other: other_id,
            descriptor: Arc::clone(descriptor),
            attribute: index,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ogm_metadata::{entity, Entity, Fetched, Relation};

    #[derive(Default)]
    struct Person {
        id: Option<i64>,
        name: String,
        friends: Vec<Entity<Person>>,
        employer: Option<Entity<Company>>,
    }

    #[derive(Default)]
    struct Company {
        id: Option<i64>,
        name: String,
    }

    fn metadata() -> MetaData {
        MetaData::builder()
            .register(
                SchemaDescriptor::node::<Person>("Person")
                    .identity(|p| p.id, |p, id| p.id = id)
                    .property("name", |p| p.name.clone(), |p, v| p.name = v)
                    .to_many(
                        "friends",
                        Relation::outgoing("FRIEND_OF", "Person"),
                        |p| Fetched::Value(p.friends.clone()),
                        |p| &mut p.friends,
                    )
                    .to_one(
                        "employer",
                        Relation::outgoing("WORKS_AT", "Company"),
                        |p| Fetched::Value(p.employer.clone()),
                        |p, c| p.employer = c,
                    )
                    .build()
                    .unwrap(),
            )
            .register(
                SchemaDescriptor::node::<Company>("Company")
                    .identity(|c| c.id, |c, id| c.id = id)
                    .property("name", |c| c.name.clone(), |c, v| c.name = v)
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap()
    }

    fn response() -> GraphResponse {
        GraphResponse {
            roots: vec![1],
            nodes: vec![
                NodeRecord::new(1, &["Person"]).with_property("name", "Ada"),
                NodeRecord::new(2, &["Person"]).with_property("name", "Grace"),
                NodeRecord::new(3, &["Company"]).with_property("name", "Acme"),
            ],
            relationships: vec![
                RelationshipRecord::new(10, "FRIEND_OF", 1, 2),
                RelationshipRecord::new(11, "WORKS_AT", 1, 3),
            ],
        }
    }

    #[test]
    fn test_map_builds_object_graph() {
        let metadata = metadata();
        let mut context = MappingContext::new();
        let roots = GraphEntityMapper::new(&metadata, &mut context)
            .map(&response())
            .unwrap();

        assert_eq!(roots.len(), 1);
        let ada = roots[0].downcast::<Person>().unwrap();
        let ada = ada.read();
        assert_eq!(ada.id, Some(1));
        assert_eq!(ada.name, "Ada");
        assert_eq!(ada.friends.len(), 1);
        assert_eq!(ada.friends[0].read().name, "Grace");
        assert_eq!(ada.employer.as_ref().unwrap().read().name, "Acme");

        assert_eq!(context.node_count(), 3);
        assert!(context.contains_edge(1, "FRIEND_OF", 2));
        assert!(context.contains_edge(1, "WORKS_AT", 3));
    }

    #[test]
    fn test_remap_reuses_instances_without_duplicating() {
        let metadata = metadata();
        let mut context = MappingContext::new();
        let first = GraphEntityMapper::new(&metadata, &mut context)
            .map(&response())
            .unwrap();

        let mut renamed = response();
        renamed.nodes[0] = NodeRecord::new(1, &["Person"]).with_property("name", "Ada L.");
        let second = GraphEntityMapper::new(&metadata, &mut context)
            .map(&renamed)
            .unwrap();

        assert!(first[0].ptr_eq(&second[0]));
        let ada = second[0].downcast::<Person>().unwrap();
        assert_eq!(ada.read().name, "Ada L.");
        assert_eq!(ada.read().friends.len(), 1);
        assert_eq!(context.node_count(), 3);
    }

    #[test]
    fn test_unmapped_relationship_leaves_context_untouched() {
        let metadata = metadata();
        let mut context = MappingContext::new();
        let mut bad = response();
        bad.relationships
            .push(RelationshipRecord::new(12, "OWNS", 3, 1));

        let err = GraphEntityMapper::new(&metadata, &mut context)
            .map(&bad)
            .unwrap_err();
        assert_eq!(
            err,
            MappingError::UnmappedRelationship {
                rel_id: 12,
                rel_type: "OWNS".into(),
                start: 3,
                end: 1,
            }
        );
        assert_eq!(context.node_count(), 0);
        assert_eq!(context.edge_count(), 0);
    }

    #[test]
    fn test_unknown_labels_are_skipped() {
        let metadata = metadata();
        let mut context = MappingContext::new();
        let response = GraphResponse {
            roots: vec![1, 7],
            nodes: vec![
                NodeRecord::new(1, &["Person"]),
                NodeRecord::new(7, &["Planet"]),
            ],
            relationships: vec![RelationshipRecord::new(20, "ORBITS", 7, 1)],
        };
        let roots = GraphEntityMapper::new(&metadata, &mut context)
            .map(&response)
            .unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(context.node_count(), 1);
    }

    #[derive(Default)]
    struct Tenure {
        id: Option<i64>,
        title: String,
        person: Option<Entity<Person>>,
        company: Option<Entity<Company>>,
    }

    #[test]
    fn test_relationship_roots_map_to_entities() {
        let metadata = MetaData::builder()
            .register(
                SchemaDescriptor::node::<Person>("Person")
                    .identity(|p| p.id, |p, id| p.id = id)
                    .property("name", |p| p.name.clone(), |p, v| p.name = v)
                    .build()
                    .unwrap(),
            )
            .register(
                SchemaDescriptor::node::<Company>("Company")
                    .identity(|c| c.id, |c, id| c.id = id)
                    .property("name", |c| c.name.clone(), |c, v| c.name = v)
                    .build()
                    .unwrap(),
            )
            .register(
                SchemaDescriptor::relationship_entity::<Tenure>("Tenure", "WORKS_AT")
                    .identity(|t| t.id, |t, id| t.id = id)
                    .property("title", |t| t.title.clone(), |t, v| t.title = v)
                    .start("Person", |t| t.person.clone(), |t, p| t.person = Some(p))
                    .end("Company", |t| t.company.clone(), |t, c| t.company = Some(c))
                    .build()
                    .unwrap(),
            )
            .build()
            .unwrap();
        let response = GraphResponse {
            roots: vec![11],
            nodes: vec![
                NodeRecord::new(1, &["Person"]).with_property("name", "Ada"),
                NodeRecord::new(3, &["Company"]).with_property("name", "Acme"),
            ],
            relationships: vec![RelationshipRecord::new(11, "WORKS_AT", 1, 3)
                .with_property("title", "Analyst")],
        };

        let mut context = MappingContext::new();
        let roots = GraphEntityMapper::new(&metadata, &mut context)
            .map_relationship_entities(&response)
            .unwrap();

        assert_eq!(roots.len(), 1);
        let tenure = roots[0].downcast::<Tenure>().unwrap();
        let tenure = tenure.read();
        assert_eq!(tenure.id, Some(11));
        assert_eq!(tenure.title, "Analyst");
        assert_eq!(tenure.person.as_ref().unwrap().read().name, "Ada");
        assert_eq!(tenure.company.as_ref().unwrap().read().name, "Acme");
        assert_eq!(context.relationship_entity_count(), 1);
    }

    #[test]
    fn test_existing_instance_keeps_identity() {
        let metadata = metadata();
        let descriptor = metadata.descriptor("Person").unwrap();
        let mut context = MappingContext::new();
        let held = entity(Person {
            id: Some(1),
            name: "stale".into(),
            ..Default::default()
        });
        context
            .register(EntityRef::new(&held), descriptor, 1)
            .unwrap();

        let roots = GraphEntityMapper::new(&metadata, &mut context)
            .map(&response())
            .unwrap();
        assert!(roots[0].ptr_eq(&EntityRef::new(&held)));
        assert_eq!(held.read().name, "Ada");
        assert_eq!(held.read().friends.len(), 1);
    }
}
