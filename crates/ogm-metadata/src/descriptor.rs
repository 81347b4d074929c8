//! Per-type mapping metadata and its builder.

use std::any::TypeId;
use std::collections::HashSet;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use ogm_core::{Direction, MappingError, PropertyMap, SchemaError};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::attribute::{
    EndpointAttribute, Fetched, IdentityAttribute, PropertyAttribute, RelationshipAttribute,
    VersionAttribute,
};
use crate::entity::{entity, Entity, EntityRef};

type Factory = Arc<dyn Fn() -> EntityRef + Send + Sync>;

/// Type, direction, and target of a relationship attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relation {
    rel_type: String,
    direction: Direction,
    target: String,
    bidirectional: bool,
}

impl Relation {
    pub fn new(rel_type: &str, direction: Direction, target: &str) -> Self {
        Self {
            rel_type: rel_type.to_string(),
            direction,
            target: target.to_string(),
            bidirectional: false,
        }
    }

    pub fn outgoing(rel_type: &str, target: &str) -> Self {
        Self::new(rel_type, Direction::Outgoing, target)
    }

    pub fn incoming(rel_type: &str, target: &str) -> Self {
        Self::new(rel_type, Direction::Incoming, target)
    }

    pub fn undirected(rel_type: &str, target: &str) -> Self {
        Self::new(rel_type, Direction::Undirected, target)
    }

    /// The target type maps the same relationship back; edges are then
    /// created without regard to direction so the pair never duplicates.
    pub fn bidirectional(mut self) -> Self {
        self.bidirectional = true;
        self
    }
}

/// What a descriptor maps to in the graph.
#[derive(Clone)]
pub enum DescriptorKind {
    Node {
        labels: Vec<String>,
    },
    RelationshipEntity {
        rel_type: String,
        start: EndpointAttribute,
        end: EndpointAttribute,
    },
}

/// Immutable mapping metadata for one user type.
#[derive(Clone)]
pub struct SchemaDescriptor {
    name: String,
    type_id: TypeId,
    type_name: &'static str,
    kind: DescriptorKind,
    identity: IdentityAttribute,
    properties: Vec<PropertyAttribute>,
    pub(crate) relationships: Vec<RelationshipAttribute>,
    primary_index: Option<String>,
    version: Option<VersionAttribute>,
    factory: Factory,
}

impl SchemaDescriptor {
    /// Start describing a node type. `label` is the primary label and
    /// doubles as the descriptor name.
    pub fn node<T: Default + Send + Sync + 'static>(label: &str) -> DescriptorBuilder<T> {
        DescriptorBuilder::new(
            label,
            PendingKind::Node {
                labels: vec![label.to_string()],
            },
        )
    }

    /// Start describing a relationship entity: a relationship that carries
    /// its own properties and is mapped to a user type.
    pub fn relationship_entity<T: Default + Send + Sync + 'static>(
        name: &str,
        rel_type: &str,
    ) -> DescriptorBuilder<T> {
        DescriptorBuilder::new(
            name,
            PendingKind::RelationshipEntity {
                rel_type: rel_type.to_string(),
            },
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn kind(&self) -> &DescriptorKind {
        &self.kind
    }

    /// Node labels; empty for relationship entities.
    pub fn labels(&self) -> &[String] {
        match &self.kind {
            DescriptorKind::Node { labels } => labels,
            DescriptorKind::RelationshipEntity { .. } => &[],
        }
    }

    /// Relationship type; `None` for node types.
    pub fn rel_type(&self) -> Option<&str> {
        match &self.kind {
            DescriptorKind::Node { .. } => None,
            DescriptorKind::RelationshipEntity { rel_type, .. } => Some(rel_type),
        }
    }

    pub fn is_relationship_entity(&self) -> bool {
        matches!(self.kind, DescriptorKind::RelationshipEntity { .. })
    }

    pub fn start(&self) -> Option<&EndpointAttribute> {
        match &self.kind {
            DescriptorKind::RelationshipEntity { start, .. } => Some(start),
            DescriptorKind::Node { .. } => None,
        }
    }

    pub fn end(&self) -> Option<&EndpointAttribute> {
        match &self.kind {
            DescriptorKind::RelationshipEntity { end, .. } => Some(end),
            DescriptorKind::Node { .. } => None,
        }
    }

    pub fn identity(&self) -> &IdentityAttribute {
        &self.identity
    }

    pub fn properties(&self) -> &[PropertyAttribute] {
        &self.properties
    }

    pub fn relationships(&self) -> &[RelationshipAttribute] {
        &self.relationships
    }

    pub fn relationship(&self, name: &str) -> Option<&RelationshipAttribute> {
        self.relationships.iter().find(|r| r.name() == name)
    }

    /// Name of the property nodes are merged on, if any.
    pub fn primary_index(&self) -> Option<&str> {
        self.primary_index.as_deref()
    }

    pub fn version(&self) -> Option<&VersionAttribute> {
        self.version.as_ref()
    }

    /// A fresh default instance of the described type.
    pub fn instantiate(&self) -> EntityRef {
        (self.factory)()
    }

    pub fn matches(&self, instance: &EntityRef) -> bool {
        instance.lock_type_id() == self.type_id
    }

    /// Snapshot of every property, including the version counter.
    pub fn read_properties(&self, instance: &EntityRef) -> Result<PropertyMap, MappingError> {
        let mut map = PropertyMap::new();
        for property in &self.properties {
            map.insert(property.name().to_string(), property.read(instance)?);
        }
        if let Some(version) = &self.version {
            let current = version.read(instance)?;
            map.insert(version.name().to_string(), serde_json::Value::from(current));
        }
        Ok(map)
    }

    /// Overwrite the properties present in `values`. Absent keys leave the
    /// instance untouched.
    pub fn write_properties(
        &self,
        instance: &EntityRef,
        values: &PropertyMap,
    ) -> Result<(), MappingError> {
        for property in &self.properties {
            if let Some(value) = values.get(property.name()) {
                property.write(instance, value.clone())?;
            }
        }
        if let Some(version) = &self.version {
            if let Some(value) = values.get(version.name()) {
                version.write(instance, value.as_i64())?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for SchemaDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaDescriptor")
            .field("name", &self.name)
            .field("labels", &self.labels())
            .field("rel_type", &self.rel_type())
            .field("properties", &self.properties)
            .field("relationships", &self.relationships)
            .field("primary_index", &self.primary_index)
            .finish()
    }
}

// ── Builder ───────────────────────────────────────────────────────

enum PendingKind {
    Node { labels: Vec<String> },
    RelationshipEntity { rel_type: String },
}

/// Collects the typed accessors of `T`; validated by [`build`](Self::build).
pub struct DescriptorBuilder<T> {
    name: String,
    kind: PendingKind,
    identities: Vec<IdentityAttribute>,
    properties: Vec<PropertyAttribute>,
    relationships: Vec<RelationshipAttribute>,
    primary_indexes: Vec<String>,
    version: Option<VersionAttribute>,
    start: Option<EndpointAttribute>,
    end: Option<EndpointAttribute>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Default + Send + Sync + 'static> DescriptorBuilder<T> {
    fn new(name: &str, kind: PendingKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            identities: Vec::new(),
            properties: Vec::new(),
            relationships: Vec::new(),
            primary_indexes: Vec::new(),
            version: None,
            start: None,
            end: None,
            _marker: PhantomData,
        }
    }

    /// Add a secondary label. Ignored for relationship entities.
    pub fn label(mut self, label: &str) -> Self {
        if let PendingKind::Node { labels } = &mut self.kind {
            labels.push(label.to_string());
        }
        self
    }

    pub fn identity(
        mut self,
        get: impl Fn(&T) -> Option<i64> + Send + Sync + 'static,
        set: impl Fn(&mut T, Option<i64>) + Send + Sync + 'static,
    ) -> Self {
        self.identities
            .push(IdentityAttribute::new(&self.name, get, set));
        self
    }

    pub fn property<V: Serialize + DeserializeOwned + 'static>(
        mut self,
        name: &str,
        get: impl Fn(&T) -> V + Send + Sync + 'static,
        set: impl Fn(&mut T, V) + Send + Sync + 'static,
    ) -> Self {
        self.properties
            .push(PropertyAttribute::new(&self.name, name, get, set));
        self
    }

    /// Declare the optimistic-lock counter, stored under `name`.
    pub fn version(
        mut self,
        name: &str,
        get: impl Fn(&T) -> Option<i64> + Send + Sync + 'static,
        set: impl Fn(&mut T, Option<i64>) + Send + Sync + 'static,
    ) -> Self {
        self.version = Some(VersionAttribute::new(&self.name, name, get, set));
        self
    }

    /// New instances are merged on this property instead of created.
    pub fn primary_index(mut self, property: &str) -> Self {
        self.primary_indexes.push(property.to_string());
        self
    }

    pub fn to_one<U: Send + Sync + 'static>(
        mut self,
        name: &str,
        relation: Relation,
        get: impl Fn(&T) -> Fetched<Option<Entity<U>>> + Send + Sync + 'static,
        set: impl Fn(&mut T, Option<Entity<U>>) + Send + Sync + 'static,
    ) -> Self {
        self.relationships.push(RelationshipAttribute::single(
            &self.name,
            name,
            &relation.rel_type,
            relation.direction,
            &relation.target,
            relation.bidirectional,
            get,
            set,
        ));
        self
    }

    pub fn to_many<U: Send + Sync + 'static>(
        mut self,
        name: &str,
        relation: Relation,
        get: impl Fn(&T) -> Fetched<Vec<Entity<U>>> + Send + Sync + 'static,
        get_mut: impl Fn(&mut T) -> &mut Vec<Entity<U>> + Send + Sync + 'static,
    ) -> Self {
        self.relationships.push(RelationshipAttribute::many(
            &self.name,
            name,
            &relation.rel_type,
            relation.direction,
            &relation.target,
            relation.bidirectional,
            get,
            get_mut,
        ));
        self
    }

    /// Start node of a relationship entity, of descriptor `target`.
    pub fn start<U: Send + Sync + 'static>(
        mut self,
        target: &str,
        get: impl Fn(&T) -> Option<Entity<U>> + Send + Sync + 'static,
        set: impl Fn(&mut T, Entity<U>) + Send + Sync + 'static,
    ) -> Self {
        self.start = Some(EndpointAttribute::new(&self.name, target, get, set));
        self
    }

    /// End node of a relationship entity, of descriptor `target`.
    pub fn end<U: Send + Sync + 'static>(
        mut self,
        target: &str,
        get: impl Fn(&T) -> Option<Entity<U>> + Send + Sync + 'static,
        set: impl Fn(&mut T, Entity<U>) + Send + Sync + 'static,
    ) -> Self {
        self.end = Some(EndpointAttribute::new(&self.name, target, get, set));
        self
    }

    pub fn build(self) -> Result<SchemaDescriptor, SchemaError> {
        let type_name = self.name.clone();

        let mut identities = self.identities.into_iter();
        let identity = identities.next().ok_or_else(|| SchemaError::MissingIdentity {
            type_name: type_name.clone(),
        })?;
        if identities.next().is_some() {
            return Err(SchemaError::DuplicateIdentity { type_name });
        }

        let mut seen = HashSet::new();
        let names = self
            .properties
            .iter()
            .map(|p| p.name())
            .chain(self.version.iter().map(|v| v.name()))
            .chain(self.relationships.iter().map(|r| r.name()));
        for name in names {
            if !seen.insert(name) {
                return Err(SchemaError::DuplicateAttribute {
                    type_name,
                    attribute: name.to_string(),
                });
            }
        }

        if self.primary_indexes.len() > 1 {
            return Err(SchemaError::DuplicatePrimaryIndex { type_name });
        }
        let primary_index = self.primary_indexes.into_iter().next();
        if let Some(property) = &primary_index {
            if !self.properties.iter().any(|p| p.name() == property) {
                return Err(SchemaError::UnknownPrimaryIndex {
                    type_name,
                    property: property.clone(),
                });
            }
        }

        let kind = match self.kind {
            PendingKind::Node { labels } => {
                if labels.iter().any(|l| l.is_empty()) {
                    return Err(SchemaError::EmptyName { type_name });
                }
                DescriptorKind::Node { labels }
            }
            PendingKind::RelationshipEntity { rel_type } => {
                if rel_type.is_empty() || type_name.is_empty() {
                    return Err(SchemaError::EmptyName { type_name });
                }
                if !self.relationships.is_empty() {
                    return Err(SchemaError::RelationshipOnRelationshipEntity { type_name });
                }
                let start = self.start.ok_or_else(|| SchemaError::MissingEndpoint {
                    type_name: type_name.clone(),
                    endpoint: "start",
                })?;
                let end = self.end.ok_or_else(|| SchemaError::MissingEndpoint {
                    type_name: type_name.clone(),
                    endpoint: "end",
                })?;
                DescriptorKind::RelationshipEntity {
                    rel_type,
                    start,
                    end,
                }
            }
        };

        Ok(SchemaDescriptor {
            name: self.name,
            type_id: TypeId::of::<RwLock<T>>(),
            type_name: std::any::type_name::<T>(),
            kind,
            identity,
            properties: self.properties,
            relationships: self.relationships,
            primary_index,
            version: self.version,
            factory: Arc::new(|| EntityRef::new(&entity(T::default()))),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Debug, Default)]
    struct Person {
        id: Option<i64>,
        name: String,
        email: Option<String>,
        version: Option<i64>,
        friends: Vec<Entity<Person>>,
    }

    #[derive(Debug, Default)]
    struct Knows {
        id: Option<i64>,
        since: i64,
        from: Option<Entity<Person>>,
        to: Option<Entity<Person>>,
    }

    fn person() -> DescriptorBuilder<Person> {
        SchemaDescriptor::node::<Person>("Person")
            .identity(|p| p.id, |p, id| p.id = id)
            .property("name", |p| p.name.clone(), |p, v| p.name = v)
            .property("email", |p| p.email.clone(), |p, v| p.email = v)
    }

    #[test]
    fn test_build_node_descriptor() {
        let descriptor = person()
            .label("Human")
            .primary_index("email")
            .version("version", |p| p.version, |p, v| p.version = v)
            .to_many(
                "friends",
                Relation::undirected("FRIEND_OF", "Person"),
                |p| Fetched::Value(p.friends.clone()),
                |p| &mut p.friends,
            )
            .build()
            .unwrap();

        assert_eq!(descriptor.name(), "Person");
        assert_eq!(descriptor.labels(), ["Person", "Human"]);
        assert_eq!(descriptor.primary_index(), Some("email"));
        assert!(!descriptor.is_relationship_entity());
        let friends = descriptor.relationship("friends").unwrap();
        assert!(friends.is_undirected());
        assert_eq!(friends.rel_type(), "FRIEND_OF");
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let err = person()
            .identity(|p| p.id, |p, id| p.id = id)
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::DuplicateIdentity {
                type_name: "Person".into()
            }
        );
    }

    #[test]
    fn test_missing_identity_rejected() {
        let err = SchemaDescriptor::node::<Person>("Person")
            .property("name", |p| p.name.clone(), |p, v| p.name = v)
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::MissingIdentity { .. }));
    }

    #[test]
    fn test_conflicting_primary_index_rejected() {
        let err = person()
            .primary_index("email")
            .primary_index("name")
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicatePrimaryIndex { .. }));

        let err = person().primary_index("ssn").build().unwrap_err();
        assert!(matches!(err, SchemaError::UnknownPrimaryIndex { .. }));
    }

    #[test]
    fn test_duplicate_attribute_rejected() {
        let err = person()
            .property("name", |p| p.name.clone(), |p, v| p.name = v)
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateAttribute { .. }));
    }

    #[test]
    fn test_relationship_entity_requires_endpoints() {
        let err = SchemaDescriptor::relationship_entity::<Knows>("Knows", "KNOWS")
            .identity(|k| k.id, |k, id| k.id = id)
            .start("Person", |k| k.from.clone(), |k, p| k.from = Some(p))
            .build()
            .unwrap_err();
        assert_eq!(
            err,
            SchemaError::MissingEndpoint {
                type_name: "Knows".into(),
                endpoint: "end"
            }
        );

        let knows = SchemaDescriptor::relationship_entity::<Knows>("Knows", "KNOWS")
            .identity(|k| k.id, |k, id| k.id = id)
            .property("since", |k| k.since, |k, v| k.since = v)
            .start("Person", |k| k.from.clone(), |k, p| k.from = Some(p))
            .end("Person", |k| k.to.clone(), |k, p| k.to = Some(p))
            .build()
            .unwrap();
        assert!(knows.is_relationship_entity());
        assert_eq!(knows.rel_type(), Some("KNOWS"));
        assert!(knows.labels().is_empty());
    }

    #[test]
    fn test_property_snapshot_includes_version() {
        let descriptor = person()
            .version("version", |p| p.version, |p, v| p.version = v)
            .build()
            .unwrap();
        let instance = descriptor.instantiate();
        let mut values = PropertyMap::new();
        values.insert("name".into(), json!("Ada"));
        values.insert("version".into(), json!(4));
        values.insert("unmapped".into(), json!(true));
        descriptor.write_properties(&instance, &values).unwrap();

        let snapshot = descriptor.read_properties(&instance).unwrap();
        assert_eq!(snapshot["name"], json!("Ada"));
        assert_eq!(snapshot["email"], json!(null));
        assert_eq!(snapshot["version"], json!(4));
        assert!(!snapshot.contains_key("unmapped"));
        assert!(descriptor.matches(&instance));
    }
}
