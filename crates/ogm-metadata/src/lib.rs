//! ogm-metadata: explicit mapping metadata for user types.
//!
//! Nothing here relies on reflection. Each mapped type is described once
//! by a [`DescriptorBuilder`] whose typed closures are erased into
//! [`PropertyAttribute`] and [`RelationshipAttribute`] accessors, and all
//! descriptors are collected into an immutable [`MetaData`] registry.
//!
//! Instances are shared as [`Entity<T>`] (`Arc<RwLock<T>>`); the mapper
//! works with the type-erased [`EntityRef`], whose identity is the address
//! of the shared allocation and never the user type's `Eq`/`Hash`.

pub mod attribute;
pub mod descriptor;
pub mod entity;
pub mod registry;

pub use attribute::{
    EndpointAttribute, Fetched, IdentityAttribute, PropertyAttribute, Related,
    RelationshipAttribute, VersionAttribute,
};
pub use descriptor::{DescriptorBuilder, DescriptorKind, Relation, SchemaDescriptor};
pub use entity::{entity, Entity, EntityRef};
pub use registry::{MetaData, MetaDataBuilder};
