//! The immutable descriptor registry handed to sessions.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::Arc;

use ogm_core::SchemaError;
use parking_lot::RwLock;

use crate::descriptor::SchemaDescriptor;
use crate::entity::EntityRef;

/// All descriptors known to a session factory, validated as a whole.
#[derive(Debug, Default)]
pub struct MetaData {
    descriptors: Vec<Arc<SchemaDescriptor>>,
    by_name: HashMap<String, usize>,
    by_type: HashMap<TypeId, usize>,
}

/// Collects descriptors before cross-checking them.
#[derive(Debug, Default)]
pub struct MetaDataBuilder {
    descriptors: Vec<SchemaDescriptor>,
}

impl MetaDataBuilder {
    pub fn register(mut self, descriptor: SchemaDescriptor) -> Self {
        self.descriptors.push(descriptor);
        self
    }

    /// Check that names and Rust types are unique and that every
    /// relationship target resolves to a registered descriptor bound to
    /// the expected type.
    pub fn build(mut self) -> Result<MetaData, SchemaError> {
        let mut by_name = HashMap::new();
        let mut by_type = HashMap::new();
        for (index, descriptor) in self.descriptors.iter().enumerate() {
            if by_name.insert(descriptor.name().to_string(), index).is_some()
                || by_type.insert(descriptor.type_id(), index).is_some()
            {
                return Err(SchemaError::DuplicateType(descriptor.name().to_string()));
            }
        }

        // Shape of every descriptor, so relationship attributes can be
        // resolved while the descriptors themselves are mutated.
        let shapes: Vec<(TypeId, Option<String>)> = self
            .descriptors
            .iter()
            .map(|d| (d.type_id(), d.rel_type().map(str::to_string)))
            .collect();

        for descriptor in &mut self.descriptors {
            let type_name = descriptor.name().to_string();

            if let (Some(start), Some(end)) = (descriptor.start(), descriptor.end()) {
                for endpoint in [start, end] {
                    let index = by_name.get(endpoint.target()).copied().ok_or_else(|| {
                        SchemaError::UnknownTarget {
                            type_name: type_name.clone(),
                            attribute: "endpoint".to_string(),
                            target: endpoint.target().to_string(),
                        }
                    })?;
                    let (target_type, target_rel_type) = &shapes[index];
                    if *target_type != endpoint.target_type || target_rel_type.is_some() {
                        return Err(SchemaError::TargetTypeMismatch {
                            type_name: type_name.clone(),
                            attribute: "endpoint".to_string(),
                            target: endpoint.target().to_string(),
                        });
                    }
                }
            }

            for attribute in &mut descriptor.relationships {
                let index = by_name.get(attribute.target()).copied().ok_or_else(|| {
                    SchemaError::UnknownTarget {
                        type_name: type_name.clone(),
                        attribute: attribute.name().to_string(),
                        target: attribute.target().to_string(),
                    }
                })?;
                let (target_type, target_rel_type) = &shapes[index];
                if *target_type != attribute.target_type {
                    return Err(SchemaError::TargetTypeMismatch {
                        type_name,
                        attribute: attribute.name().to_string(),
                        target: attribute.target().to_string(),
                    });
                }
                if let Some(expected) = target_rel_type {
                    if expected != attribute.rel_type() {
                        return Err(SchemaError::RelationshipTypeMismatch {
                            type_name,
                            attribute: attribute.name().to_string(),
                            target: attribute.target().to_string(),
                            declared: attribute.rel_type().to_string(),
                            expected: expected.clone(),
                        });
                    }
                    attribute.relationship_entity = true;
                }
            }
        }

        tracing::debug!(count = self.descriptors.len(), "Registered mapping metadata");
        Ok(MetaData {
            descriptors: self.descriptors.into_iter().map(Arc::new).collect(),
            by_name,
            by_type,
        })
    }
}

impl MetaData {
    pub fn builder() -> MetaDataBuilder {
        MetaDataBuilder::default()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &Arc<SchemaDescriptor>> {
        self.descriptors.iter()
    }

    pub fn descriptor(&self, name: &str) -> Option<&Arc<SchemaDescriptor>> {
        self.by_name.get(name).map(|&i| &self.descriptors[i])
    }

    /// Descriptor bound to the runtime type of `instance`.
    pub fn descriptor_for(&self, instance: &EntityRef) -> Option<&Arc<SchemaDescriptor>> {
        self.by_type
            .get(&instance.lock_type_id())
            .map(|&i| &self.descriptors[i])
    }

    pub fn descriptor_of<T: Send + Sync + 'static>(&self) -> Option<&Arc<SchemaDescriptor>> {
        self.by_type
            .get(&TypeId::of::<RwLock<T>>())
            .map(|&i| &self.descriptors[i])
    }

    /// Node descriptor for a record's labels: the one whose labels are all
    /// present and that matches the most of them. Ties go to the first
    /// registered descriptor.
    pub fn resolve(&self, labels: &[String]) -> Option<&Arc<SchemaDescriptor>> {
        let mut best: Option<&Arc<SchemaDescriptor>> = None;
        for descriptor in &self.descriptors {
            let own = descriptor.labels();
            if own.is_empty() || !own.iter().all(|l| labels.contains(l)) {
                continue;
            }
            if best.map_or(true, |b| own.len() > b.labels().len()) {
                best = Some(descriptor);
            }
        }
        best
    }

    /// Relationship-entity descriptor for a relationship of `rel_type`
    /// between nodes of the given descriptors.
    pub fn relationship_entity(
        &self,
        rel_type: &str,
        start: &str,
        end: &str,
    ) -> Option<&Arc<SchemaDescriptor>> {
        self.descriptors.iter().find(|d| {
            d.rel_type() == Some(rel_type)
                && d.start().map(|s| s.target()) == Some(start)
                && d.end().map(|e| e.target()) == Some(end)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Fetched;
    use crate::descriptor::Relation;
    use crate::entity::{entity, Entity};

    #[derive(Default)]
    struct Movie {
        id: Option<i64>,
        roles: Vec<Entity<Role>>,
    }

    #[derive(Default)]
    struct Actor {
        id: Option<i64>,
    }

    #[derive(Default)]
    struct Stuntman {
        id: Option<i64>,
    }

    #[derive(Default)]
    struct Role {
        id: Option<i64>,
        actor: Option<Entity<Actor>>,
        movie: Option<Entity<Movie>>,
    }

    fn movie(rel_type: &str) -> SchemaDescriptor {
        SchemaDescriptor::node::<Movie>("Movie")
            .identity(|m| m.id, |m, id| m.id = id)
            .to_many(
                "roles",
                Relation::incoming(rel_type, "Role"),
                |m| Fetched::Value(m.roles.clone()),
                |m| &mut m.roles,
            )
            .build()
            .unwrap()
    }

    fn actor() -> SchemaDescriptor {
        SchemaDescriptor::node::<Actor>("Actor")
            .identity(|a| a.id, |a, id| a.id = id)
            .build()
            .unwrap()
    }

    fn role() -> SchemaDescriptor {
        SchemaDescriptor::relationship_entity::<Role>("Role", "ACTS_IN")
            .identity(|r| r.id, |r, id| r.id = id)
            .start("Actor", |r| r.actor.clone(), |r, a| r.actor = Some(a))
            .end("Movie", |r| r.movie.clone(), |r, m| r.movie = Some(m))
            .build()
            .unwrap()
    }

    #[test]
    fn test_resolves_relationship_entity_targets() {
        let metadata = MetaData::builder()
            .register(movie("ACTS_IN"))
            .register(actor())
            .register(role())
            .build()
            .unwrap();

        let movie = metadata.descriptor("Movie").unwrap();
        assert!(movie.relationship("roles").unwrap().is_relationship_entity());
        assert_eq!(
            metadata
                .relationship_entity("ACTS_IN", "Actor", "Movie")
                .map(|d| d.name()),
            Some("Role")
        );
        assert!(metadata.relationship_entity("ACTS_IN", "Movie", "Actor").is_none());

        let instance = EntityRef::new(&entity(Actor::default()));
        assert_eq!(metadata.descriptor_for(&instance).unwrap().name(), "Actor");
        assert_eq!(metadata.descriptor_of::<Role>().unwrap().name(), "Role");
    }

    #[test]
    fn test_rejects_relationship_type_mismatch() {
        let err = MetaData::builder()
            .register(movie("PLAYS_IN"))
            .register(actor())
            .register(role())
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::RelationshipTypeMismatch { .. }));
    }

    #[test]
    fn test_rejects_unknown_target() {
        let err = MetaData::builder()
            .register(movie("ACTS_IN"))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::UnknownTarget { .. }));
    }

    #[test]
    fn test_rejects_duplicate_registration() {
        let err = MetaData::builder()
            .register(actor())
            .register(actor())
            .build()
            .unwrap_err();
        assert_eq!(err, SchemaError::DuplicateType("Actor".into()));
    }

    #[test]
    fn test_resolve_prefers_most_specific_labels() {
        let stuntman = SchemaDescriptor::node::<Stuntman>("Stuntman")
            .label("Actor")
            .identity(|s| s.id, |s, id| s.id = id)
            .build()
            .unwrap();
        let metadata = MetaData::builder()
            .register(actor())
            .register(stuntman)
            .build()
            .unwrap();

        let both = vec!["Actor".to_string(), "Stuntman".to_string()];
        assert_eq!(metadata.resolve(&both).unwrap().name(), "Stuntman");
        assert_eq!(
            metadata.resolve(&["Actor".to_string()]).unwrap().name(),
            "Actor"
        );
        assert!(metadata.resolve(&["Movie".to_string()]).is_none());
    }
}
