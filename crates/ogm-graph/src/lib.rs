//! ogm-graph: transports for the object-graph mapper.
//!
//! [`Neo4jDriver`] speaks Bolt through `neo4rs`; every save runs as one
//! explicit transaction. [`MemoryDriver`] is an embedded property graph
//! that executes the same compiled statements in process.

pub mod client;
pub mod memory;
pub mod mutations;
pub mod queries;

pub use client::{GraphError, Neo4jDriver};
pub use memory::{MemoryDriver, MemoryTransaction};
pub use mutations::{to_bolt, Neo4jTransaction};
pub use queries::load_cypher;
