//! Erased attribute accessors.
//!
//! Every accessor is built once from typed closures when a descriptor is
//! declared. The compiler and the mapper only ever see these erased forms,
//! so traversal never branches on the concrete user type.

use std::any::TypeId;
use std::fmt;
use std::sync::Arc;

use ogm_core::{Direction, MappingError, Multiplicity, NativeId};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::entity::{Entity, EntityRef};

type ReadFn<V> = Arc<dyn Fn(&EntityRef) -> Result<V, MappingError> + Send + Sync>;
type WriteFn<V> = Arc<dyn Fn(&EntityRef, V) -> Result<(), MappingError> + Send + Sync>;
type AttachFn = Arc<dyn Fn(&EntityRef, &EntityRef) -> Result<bool, MappingError> + Send + Sync>;

fn mismatch(type_name: &str) -> MappingError {
    MappingError::TypeMismatch {
        type_name: type_name.to_string(),
    }
}

// ── Fetch State ───────────────────────────────────────────────────

/// The value of a relationship attribute as far as the session knows.
///
/// `Unfetched` means "never populated": the compiler leaves every known
/// edge behind such an attribute untouched. Only `Value` of an empty
/// collection or of `None` tells the compiler to delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetched<V> {
    Unfetched,
    Value(V),
}

impl<V> Fetched<V> {
    /// `None` is read as "not fetched".
    pub fn from_option(value: Option<V>) -> Self {
        match value {
            Some(v) => Self::Value(v),
            None => Self::Unfetched,
        }
    }

    pub fn is_fetched(&self) -> bool {
        matches!(self, Self::Value(_))
    }

    pub fn map<W>(self, f: impl FnOnce(V) -> W) -> Fetched<W> {
        match self {
            Self::Unfetched => Fetched::Unfetched,
            Self::Value(v) => Fetched::Value(f(v)),
        }
    }
}

impl<V> From<V> for Fetched<V> {
    fn from(value: V) -> Self {
        Self::Value(value)
    }
}

/// Current targets of a relationship attribute, type-erased.
#[derive(Debug, Clone)]
pub enum Related {
    Single(Option<EntityRef>),
    Many(Vec<EntityRef>),
}

impl Related {
    pub fn targets(&self) -> &[EntityRef] {
        match self {
            Self::Single(Some(target)) => std::slice::from_ref(target),
            Self::Single(None) => &[],
            Self::Many(targets) => targets,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.targets().is_empty()
    }
}

// ── Identity ──────────────────────────────────────────────────────

/// Reads and writes the native id held by an instance.
#[derive(Clone)]
pub struct IdentityAttribute {
    read: ReadFn<Option<NativeId>>,
    write: WriteFn<Option<NativeId>>,
}

impl IdentityAttribute {
    pub(crate) fn new<T, G, S>(owner: &str, get: G, set: S) -> Self
    where
        T: Send + Sync + 'static,
        G: Fn(&T) -> Option<NativeId> + Send + Sync + 'static,
        S: Fn(&mut T, Option<NativeId>) + Send + Sync + 'static,
    {
        let read_owner = owner.to_string();
        let write_owner = owner.to_string();
        Self {
            read: Arc::new(move |instance: &EntityRef| {
                instance
                    .read_with(|t: &T| get(t))
                    .ok_or_else(|| mismatch(&read_owner))
            }),
            write: Arc::new(move |instance: &EntityRef, id: Option<NativeId>| {
                instance
                    .write_with(|t: &mut T| set(t, id))
                    .ok_or_else(|| mismatch(&write_owner))
            }),
        }
    }

    pub fn read(&self, instance: &EntityRef) -> Result<Option<NativeId>, MappingError> {
        (self.read)(instance)
    }

    pub fn write(&self, instance: &EntityRef, id: Option<NativeId>) -> Result<(), MappingError> {
        (self.write)(instance, id)
    }
}

// ── Properties ────────────────────────────────────────────────────

/// A scalar or collection property, exchanged as JSON.
#[derive(Clone)]
pub struct PropertyAttribute {
    name: String,
    read: ReadFn<Value>,
    write: WriteFn<Value>,
}

impl PropertyAttribute {
    pub(crate) fn new<T, V, G, S>(owner: &str, name: &str, get: G, set: S) -> Self
    where
        T: Send + Sync + 'static,
        V: Serialize + DeserializeOwned + 'static,
        G: Fn(&T) -> V + Send + Sync + 'static,
        S: Fn(&mut T, V) + Send + Sync + 'static,
    {
        let read_owner = owner.to_string();
        let read_name = name.to_string();
        let write_owner = owner.to_string();
        let write_name = name.to_string();
        Self {
            name: name.to_string(),
            read: Arc::new(move |instance: &EntityRef| -> Result<Value, MappingError> {
                instance
                    .read_with(|t: &T| serde_json::to_value(get(t)))
                    .ok_or_else(|| mismatch(&read_owner))?
                    .map_err(|e| MappingError::Property {
                        type_name: read_owner.clone(),
                        property: read_name.clone(),
                        reason: e.to_string(),
                    })
            }),
            write: Arc::new(move |instance: &EntityRef, value: Value| -> Result<(), MappingError> {
                let typed: V =
                    serde_json::from_value(value).map_err(|e| MappingError::Property {
                        type_name: write_owner.clone(),
                        property: write_name.clone(),
                        reason: e.to_string(),
                    })?;
                instance
                    .write_with(|t: &mut T| set(t, typed))
                    .ok_or_else(|| mismatch(&write_owner))
            }),
        }
    }

    /// Property key in the graph.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read(&self, instance: &EntityRef) -> Result<Value, MappingError> {
        (self.read)(instance)
    }

    pub fn write(&self, instance: &EntityRef, value: Value) -> Result<(), MappingError> {
        (self.write)(instance, value)
    }
}

impl fmt::Debug for PropertyAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PropertyAttribute")
            .field("name", &self.name)
            .finish()
    }
}

/// Optimistic-lock counter. Stored in the graph under its own property key.
#[derive(Clone)]
pub struct VersionAttribute {
    name: String,
    read: ReadFn<Option<i64>>,
    write: WriteFn<Option<i64>>,
}

impl VersionAttribute {
    pub(crate) fn new<T, G, S>(owner: &str, name: &str, get: G, set: S) -> Self
    where
        T: Send + Sync + 'static,
        G: Fn(&T) -> Option<i64> + Send + Sync + 'static,
        S: Fn(&mut T, Option<i64>) + Send + Sync + 'static,
    {
        let read_owner = owner.to_string();
        let write_owner = owner.to_string();
        Self {
            name: name.to_string(),
            read: Arc::new(move |instance: &EntityRef| {
                instance
                    .read_with(|t: &T| get(t))
                    .ok_or_else(|| mismatch(&read_owner))
            }),
            write: Arc::new(move |instance: &EntityRef, version: Option<i64>| {
                instance
                    .write_with(|t: &mut T| set(t, version))
                    .ok_or_else(|| mismatch(&write_owner))
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn read(&self, instance: &EntityRef) -> Result<Option<i64>, MappingError> {
        (self.read)(instance)
    }

    pub fn write(&self, instance: &EntityRef, version: Option<i64>) -> Result<(), MappingError> {
        (self.write)(instance, version)
    }
}

// ── Relationships ─────────────────────────────────────────────────

/// A relationship-valued attribute of a node type.
#[derive(Clone)]
pub struct RelationshipAttribute {
    pub(crate) name: String,
    pub(crate) rel_type: String,
    pub(crate) direction: Direction,
    pub(crate) multiplicity: Multiplicity,
    pub(crate) target: String,
    pub(crate) target_type: TypeId,
    pub(crate) bidirectional: bool,
    pub(crate) relationship_entity: bool,
    read: ReadFn<Fetched<Related>>,
    attach: AttachFn,
}

impl RelationshipAttribute {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn single<T, U, G, S>(
        owner: &str,
        name: &str,
        rel_type: &str,
        direction: Direction,
        target: &str,
        bidirectional: bool,
        get: G,
        set: S,
    ) -> Self
    where
        T: Send + Sync + 'static,
        U: Send + Sync + 'static,
        G: Fn(&T) -> Fetched<Option<Entity<U>>> + Send + Sync + 'static,
        S: Fn(&mut T, Option<Entity<U>>) + Send + Sync + 'static,
    {
        let get = Arc::new(get);
        let read_get = Arc::clone(&get);
        let read_owner = owner.to_string();
        let attach_owner = owner.to_string();
        let attach_target = target.to_string();

        let read: ReadFn<Fetched<Related>> = Arc::new(move |instance: &EntityRef| -> Result<Fetched<Related>, MappingError> {
            let current = instance
                .read_with(|t: &T| read_get(t))
                .ok_or_else(|| mismatch(&read_owner))?;
            Ok(current.map(|slot| Related::Single(slot.as_ref().map(EntityRef::new))))
        });

        let attach: AttachFn = Arc::new(move |instance: &EntityRef, related: &EntityRef| -> Result<bool, MappingError> {
            let typed = related
                .downcast::<U>()
                .ok_or_else(|| mismatch(&attach_target))?;
            instance
                .write_with(|t: &mut T| {
                    let unchanged = matches!(
                        get(&*t),
                        Fetched::Value(Some(ref current)) if Arc::ptr_eq(current, &typed)
                    );
                    if !unchanged {
                        set(t, Some(typed));
                    }
                    !unchanged
                })
                .ok_or_else(|| mismatch(&attach_owner))
        });

        Self {
            name: name.to_string(),
            rel_type: rel_type.to_string(),
            direction,
            multiplicity: Multiplicity::Single,
            target: target.to_string(),
            target_type: TypeId::of::<RwLock<U>>(),
            bidirectional,
            relationship_entity: false,
            read,
            attach,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn many<T, U, G, M>(
        owner: &str,
        name: &str,
        rel_type: &str,
        direction: Direction,
        target: &str,
        bidirectional: bool,
        get: G,
        get_mut: M,
    ) -> Self
    where
        T: Send + Sync + 'static,
        U: Send + Sync + 'static,
        G: Fn(&T) -> Fetched<Vec<Entity<U>>> + Send + Sync + 'static,
        M: Fn(&mut T) -> &mut Vec<Entity<U>> + Send + Sync + 'static,
    {
        let read_owner = owner.to_string();
        let attach_owner = owner.to_string();
        let attach_target = target.to_string();

        let read: ReadFn<Fetched<Related>> = Arc::new(move |instance: &EntityRef| -> Result<Fetched<Related>, MappingError> {
            let current = instance
                .read_with(|t: &T| get(t))
                .ok_or_else(|| mismatch(&read_owner))?;
            Ok(current.map(|items| Related::Many(items.iter().map(EntityRef::new).collect())))
        });

        let attach: AttachFn = Arc::new(move |instance: &EntityRef, related: &EntityRef| -> Result<bool, MappingError> {
            let typed = related
                .downcast::<U>()
                .ok_or_else(|| mismatch(&attach_target))?;
            instance
                .write_with(|t: &mut T| {
                    let items = get_mut(t);
                    if items.iter().any(|existing| Arc::ptr_eq(existing, &typed)) {
                        false
                    } else {
                        items.push(typed);
                        true
                    }
                })
                .ok_or_else(|| mismatch(&attach_owner))
        });

        Self {
            name: name.to_string(),
            rel_type: rel_type.to_string(),
            direction,
            multiplicity: Multiplicity::Many,
            target: target.to_string(),
            target_type: TypeId::of::<RwLock<U>>(),
            bidirectional,
            relationship_entity: false,
            read,
            attach,
        }
    }

    /// Field name, for diagnostics.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn rel_type(&self) -> &str {
        &self.rel_type
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn multiplicity(&self) -> Multiplicity {
        self.multiplicity
    }

    /// Name of the target descriptor: a node label, or a relationship
    /// entity when [`is_relationship_entity`](Self::is_relationship_entity).
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn target_type(&self) -> TypeId {
        self.target_type
    }

    pub fn is_bidirectional(&self) -> bool {
        self.bidirectional
    }

    /// Resolved when the registry is built.
    pub fn is_relationship_entity(&self) -> bool {
        self.relationship_entity
    }

    /// Edges created for this attribute must not depend on direction.
    pub fn is_undirected(&self) -> bool {
        self.direction == Direction::Undirected || self.bidirectional
    }

    pub fn read(&self, instance: &EntityRef) -> Result<Fetched<Related>, MappingError> {
        (self.read)(instance)
    }

    /// Link `related` into the attribute. Collections gain it if absent;
    /// single slots are overwritten unless they already hold it. Returns
    /// whether the instance changed.
    pub fn attach(&self, instance: &EntityRef, related: &EntityRef) -> Result<bool, MappingError> {
        (self.attach)(instance, related)
    }
}

impl fmt::Debug for RelationshipAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationshipAttribute")
            .field("name", &self.name)
            .field("rel_type", &self.rel_type)
            .field("direction", &self.direction)
            .field("multiplicity", &self.multiplicity)
            .field("target", &self.target)
            .field("bidirectional", &self.bidirectional)
            .finish()
    }
}

/// Start or end node accessor of a relationship entity.
#[derive(Clone)]
pub struct EndpointAttribute {
    pub(crate) target: String,
    pub(crate) target_type: TypeId,
    read: ReadFn<Option<EntityRef>>,
    write: WriteFn<EntityRef>,
}

impl EndpointAttribute {
    pub(crate) fn new<T, U, G, S>(owner: &str, target: &str, get: G, set: S) -> Self
    where
        T: Send + Sync + 'static,
        U: Send + Sync + 'static,
        G: Fn(&T) -> Option<Entity<U>> + Send + Sync + 'static,
        S: Fn(&mut T, Entity<U>) + Send + Sync + 'static,
    {
        let read_owner = owner.to_string();
        let write_owner = owner.to_string();
        let write_target = target.to_string();
        Self {
            target: target.to_string(),
            target_type: TypeId::of::<RwLock<U>>(),
            read: Arc::new(move |instance: &EntityRef| {
                instance
                    .read_with(|t: &T| get(t).as_ref().map(EntityRef::new))
                    .ok_or_else(|| mismatch(&read_owner))
            }),
            write: Arc::new(move |instance: &EntityRef, node: EntityRef| -> Result<(), MappingError> {
                let typed = node
                    .downcast::<U>()
                    .ok_or_else(|| mismatch(&write_target))?;
                instance
                    .write_with(|t: &mut T| set(t, typed))
                    .ok_or_else(|| mismatch(&write_owner))
            }),
        }
    }

    /// Descriptor name of the node type at this end.
    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn read(&self, instance: &EntityRef) -> Result<Option<EntityRef>, MappingError> {
        (self.read)(instance)
    }

    pub fn write(&self, instance: &EntityRef, node: EntityRef) -> Result<(), MappingError> {
        (self.write)(instance, node)
    }
}

impl fmt::Debug for EndpointAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EndpointAttribute")
            .field("target", &self.target)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::entity;

    #[derive(Default)]
    struct Actor {
        id: Option<NativeId>,
        name: String,
        movies: Vec<Entity<Movie>>,
        agent: Option<Entity<Actor>>,
    }

    #[derive(Default)]
    struct Movie {
        title: String,
    }

    fn name_attr() -> PropertyAttribute {
        PropertyAttribute::new(
            "Actor",
            "name",
            |a: &Actor| a.name.clone(),
            |a: &mut Actor, v: String| a.name = v,
        )
    }

    #[test]
    fn test_identity_roundtrip() {
        let attr = IdentityAttribute::new("Actor", |a: &Actor| a.id, |a: &mut Actor, id| a.id = id);
        let actor = entity(Actor::default());
        let r = EntityRef::new(&actor);
        assert_eq!(attr.read(&r).unwrap(), None);
        attr.write(&r, Some(5)).unwrap();
        assert_eq!(actor.read().id, Some(5));
    }

    #[test]
    fn test_property_read_write() {
        let attr = name_attr();
        let actor = entity(Actor {
            name: "Keanu".to_string(),
            ..Default::default()
        });
        let r = EntityRef::new(&actor);
        assert_eq!(attr.read(&r).unwrap(), Value::from("Keanu"));
        attr.write(&r, Value::from("Carrie")).unwrap();
        assert_eq!(actor.read().name, "Carrie");
    }

    #[test]
    fn test_property_wrong_kind_is_mapping_error() {
        let attr = name_attr();
        let r = EntityRef::new(&entity(Actor::default()));
        let err = attr.write(&r, serde_json::json!([1, 2])).unwrap_err();
        assert!(matches!(err, MappingError::Property { .. }));
    }

    #[test]
    fn test_property_on_wrong_type() {
        let attr = name_attr();
        let r = EntityRef::new(&entity(Movie::default()));
        assert!(matches!(
            attr.read(&r).unwrap_err(),
            MappingError::TypeMismatch { .. }
        ));
    }

    #[test]
    fn test_many_attach_dedupes_by_address() {
        let attr = RelationshipAttribute::many(
            "Actor",
            "movies",
            "ACTS_IN",
            Direction::Outgoing,
            "Movie",
            false,
            |a: &Actor| Fetched::Value(a.movies.clone()),
            |a: &mut Actor| &mut a.movies,
        );
        let actor = entity(Actor::default());
        let owner = EntityRef::new(&actor);
        let first = entity(Movie::default());
        let twin = entity(Movie::default());

        assert!(attr.attach(&owner, &EntityRef::new(&first)).unwrap());
        assert!(!attr.attach(&owner, &EntityRef::new(&first)).unwrap());
        assert!(attr.attach(&owner, &EntityRef::new(&twin)).unwrap());
        assert_eq!(actor.read().movies.len(), 2);

        match attr.read(&owner).unwrap() {
            Fetched::Value(Related::Many(targets)) => assert_eq!(targets.len(), 2),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_single_attach_replaces_other() {
        let attr = RelationshipAttribute::single(
            "Actor",
            "agent",
            "REPRESENTED_BY",
            Direction::Outgoing,
            "Actor",
            false,
            |a: &Actor| Fetched::Value(a.agent.clone()),
            |a: &mut Actor, v| a.agent = v,
        );
        let actor = entity(Actor::default());
        let owner = EntityRef::new(&actor);
        let first = entity(Actor::default());
        let second = entity(Actor::default());

        assert!(attr.attach(&owner, &EntityRef::new(&first)).unwrap());
        assert!(!attr.attach(&owner, &EntityRef::new(&first)).unwrap());
        assert!(attr.attach(&owner, &EntityRef::new(&second)).unwrap());
        let agent = actor.read().agent.clone().unwrap();
        assert!(Arc::ptr_eq(&agent, &second));
    }

    #[test]
    fn test_attach_wrong_target_type() {
        let attr = RelationshipAttribute::many(
            "Actor",
            "movies",
            "ACTS_IN",
            Direction::Outgoing,
            "Movie",
            false,
            |a: &Actor| Fetched::Value(a.movies.clone()),
            |a: &mut Actor| &mut a.movies,
        );
        let owner = EntityRef::new(&entity(Actor::default()));
        let not_a_movie = EntityRef::new(&entity(Actor::default()));
        assert!(attr.attach(&owner, &not_a_movie).is_err());
    }

    #[test]
    fn test_fetched_from_option() {
        assert_eq!(Fetched::<u8>::from_option(None), Fetched::Unfetched);
        assert_eq!(Fetched::from_option(Some(3)), Fetched::Value(3));
        assert!(!Fetched::<u8>::Unfetched.is_fetched());
    }
}
