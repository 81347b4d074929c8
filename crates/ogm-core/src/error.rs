use thiserror::Error;

use crate::types::{EntityKind, NativeId};

/// Top-level error type for the object-graph mapper.
#[derive(Error, Debug)]
pub enum OgmError {
    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Mapping error: {0}")]
    Mapping(#[from] MappingError),

    #[error("Concurrency error: {0}")]
    Concurrency(#[from] ConcurrencyError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, OgmError>;

/// Invalid mapping metadata, raised while descriptors are built and
/// registered. Always surfaces before any statement reaches the database.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("{type_name} declares more than one identity attribute")]
    DuplicateIdentity { type_name: String },

    #[error("{type_name} declares no identity attribute")]
    MissingIdentity { type_name: String },

    #[error("{type_name} declares attribute {attribute} twice")]
    DuplicateAttribute { type_name: String, attribute: String },

    #[error("{type_name} declares more than one primary index")]
    DuplicatePrimaryIndex { type_name: String },

    #[error("{type_name} declares primary index on unknown property {property}")]
    UnknownPrimaryIndex { type_name: String, property: String },

    #[error("{type_name} is a relationship entity without a {endpoint} node")]
    MissingEndpoint {
        type_name: String,
        endpoint: &'static str,
    },

    #[error("{type_name} is a relationship entity and cannot own relationship attributes")]
    RelationshipOnRelationshipEntity { type_name: String },

    #[error("{type_name} has an empty label or relationship type")]
    EmptyName { type_name: String },

    #[error("Type {0} is registered twice")]
    DuplicateType(String),

    #[error("{type_name}.{attribute} targets unregistered type {target}")]
    UnknownTarget {
        type_name: String,
        attribute: String,
        target: String,
    },

    #[error("{type_name}.{attribute} targets {target}, which is bound to a different Rust type")]
    TargetTypeMismatch {
        type_name: String,
        attribute: String,
        target: String,
    },

    #[error("{type_name}.{attribute} uses type {declared} but relationship entity {target} uses {expected}")]
    RelationshipTypeMismatch {
        type_name: String,
        attribute: String,
        target: String,
        declared: String,
        expected: String,
    },
}

/// A fatal problem while mapping between objects and graph records.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MappingError {
    #[error("No descriptor registered for type {type_name}")]
    UnknownType { type_name: String },

    #[error("{type_name} is not a relationship entity")]
    NotRelationshipEntity { type_name: String },

    #[error("Relationship {rel_id} ({rel_type}) from {start} to {end} matches no relationship attribute on either endpoint")]
    UnmappedRelationship {
        rel_id: NativeId,
        rel_type: String,
        start: NativeId,
        end: NativeId,
    },

    #[error("Relationship entity {type_name} has no {endpoint} node")]
    MissingEndpoint {
        type_name: String,
        endpoint: &'static str,
    },

    #[error("Cannot write property {property} of {type_name}: {reason}")]
    Property {
        type_name: String,
        property: String,
        reason: String,
    },

    #[error("Instance passed for {type_name} has a different Rust type")]
    TypeMismatch { type_name: String },

    #[error("Statement results never resolved temporary reference {0}")]
    UnresolvedReference(i64),

    #[error("{type_name} has not been persisted")]
    NotPersisted { type_name: String },
}

/// One entity whose stored version no longer matched the expected one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConflict {
    pub kind: EntityKind,
    pub id: NativeId,
    pub expected_version: i64,
}

/// Optimistic-lock failure. Never retried; the transaction is rolled back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("optimistic lock failed for {}", describe(.conflicts))]
pub struct ConcurrencyError {
    pub conflicts: Vec<VersionConflict>,
}

fn describe(conflicts: &[VersionConflict]) -> String {
    conflicts
        .iter()
        .map(|c| format!("{} {} (expected version {})", c.kind, c.id, c.expected_version))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Opaque failure from the database transport.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Transaction already finished")]
    TransactionClosed,

    #[error("{driver} driver error: {source}")]
    Driver {
        driver: &'static str,
        #[source]
        source: anyhow::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_concurrency_error_message() {
        let err = ConcurrencyError {
            conflicts: vec![VersionConflict {
                kind: EntityKind::Node,
                id: 42,
                expected_version: 3,
            }],
        };
        assert_eq!(
            err.to_string(),
            "optimistic lock failed for node 42 (expected version 3)"
        );
    }

    #[test]
    fn test_from_conversions() {
        let err: OgmError = SchemaError::MissingIdentity {
            type_name: "Movie".into(),
        }
        .into();
        assert!(matches!(err, OgmError::Schema(_)));
        assert_eq!(
            err.to_string(),
            "Schema error: Movie declares no identity attribute"
        );

        let err: OgmError = TransportError::Driver {
            driver: "neo4j",
            source: anyhow::anyhow!("socket closed"),
        }
        .into();
        assert_eq!(
            err.to_string(),
            "Transport error: neo4j driver error: socket closed"
        );
    }
}
