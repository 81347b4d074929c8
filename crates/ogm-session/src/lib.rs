//! ogm-session: the unit of work between user code and the database.
//!
//! A [`Session`] owns one [`MappingContext`](ogm_mapping::MappingContext)
//! and drives the compiler on save and the entity mapper on load. Sessions
//! are cheap; open one per unit of work from a shared [`SessionFactory`].

pub mod session;

pub use session::{Session, SessionFactory};
