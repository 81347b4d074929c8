//! ogm-core: Shared types, configuration, and error handling for the object-graph mapper.
//!
//! This crate provides the foundational types used across all OGM crates:
//! - Graph records (nodes, relationships, responses) exchanged with transports
//! - Relationship direction and multiplicity
//! - Persistence events delivered to session listeners
//! - Configuration management
//! - Common error types

pub mod config;
pub mod error;
pub mod events;
pub mod types;

pub use config::{Neo4jConfig, OgmConfig, SessionConfig};
pub use error::{
    ConcurrencyError, MappingError, OgmError, Result, SchemaError, TransportError, VersionConflict,
};
pub use events::{EventKind, EventListener, EventSubject, PersistenceEvent};
pub use types::{
    Direction, EntityKind, GraphResponse, Multiplicity, NativeId, NodeRecord, PropertyMap,
    RelationshipRecord, SessionId,
};
