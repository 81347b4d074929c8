//! ogm-mapping: the save and load paths of the object-graph mapper.
//!
//! The [`Compiler`] walks an object graph and diffs it against the
//! [`MappingContext`] to produce ordered [`Statement`]s. The
//! [`GraphEntityMapper`] turns database responses back into instances.
//! Transports plug in through the [`Driver`] and [`Transaction`] traits.

pub mod compiler;
pub mod context;
pub mod driver;
pub mod mapper;
pub mod memo;
pub mod statement;

pub use compiler::{CompiledBatch, Compiler, SaveSummary};
pub use context::{MappedRelationship, MappingContext, NodeEntry, RelationshipEntry};
pub use driver::{execute, CountRequest, Driver, LoadRequest, ReturnedId, Transaction};
pub use mapper::GraphEntityMapper;
pub use statement::{quote, IdMap, NodeRef, Statement};
