//! Transport seam: what the session needs from a database.
//!
//! A driver opens transactions and answers load requests. Compiled
//! statements are executed in order inside one transaction, so temporary
//! references created by earlier statements resolve for later ones.

use std::future::Future;

use ogm_core::{
    ConcurrencyError, GraphResponse, NativeId, OgmError, TransportError, VersionConflict,
};
use serde_json::Value;

use crate::statement::{IdMap, Statement};

/// One `(ref, id)` pair returned by a write statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReturnedId {
    pub reference: i64,
    pub id: NativeId,
}

/// What to read: roots plus everything within `depth` hops of them.
/// A negative depth is unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadRequest {
    /// Nodes with the given ids that carry every label in `labels`.
    ByIds {
        labels: Vec<String>,
        ids: Vec<NativeId>,
        depth: i32,
    },
    /// Every node carrying all of `labels`.
    ByLabels { labels: Vec<String>, depth: i32 },
    /// Relationships of type `rel_type` with the given ids. Depth counts
    /// from their endpoints, and the roots of the response are the
    /// relationship ids.
    RelationshipsByIds {
        rel_type: String,
        ids: Vec<NativeId>,
        depth: i32,
    },
}

impl LoadRequest {
    pub fn depth(&self) -> i32 {
        match self {
            Self::ByIds { depth, .. }
            | Self::ByLabels { depth, .. }
            | Self::RelationshipsByIds { depth, .. } => *depth,
        }
    }

    /// Node labels the roots must carry; empty for relationship loads.
    pub fn labels(&self) -> &[String] {
        match self {
            Self::ByIds { labels, .. } | Self::ByLabels { labels, .. } => labels,
            Self::RelationshipsByIds { .. } => &[],
        }
    }

    pub fn is_relationship_load(&self) -> bool {
        matches!(self, Self::RelationshipsByIds { .. })
    }
}

/// What to count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountRequest {
    /// Nodes carrying every label in `labels`.
    Nodes { labels: Vec<String> },
    Relationships { rel_type: String },
}

/// An open database transaction.
pub trait Transaction: Send + Sized {
    /// Run one statement with its rendered `$rows` and collect the
    /// `(ref, id)` pairs it returns.
    fn run(
        &mut self,
        statement: &Statement,
        rows: Vec<Value>,
    ) -> impl Future<Output = Result<Vec<ReturnedId>, TransportError>> + Send;

    fn commit(self) -> impl Future<Output = Result<(), TransportError>> + Send;

    fn rollback(self) -> impl Future<Output = Result<(), TransportError>> + Send;
}

/// A database connection shared by sessions.
pub trait Driver: Send + Sync {
    type Transaction: Transaction;

    fn begin(&self) -> impl Future<Output = Result<Self::Transaction, TransportError>> + Send;

    fn fetch(
        &self,
        request: &LoadRequest,
    ) -> impl Future<Output = Result<GraphResponse, TransportError>> + Send;

    fn count(
        &self,
        request: &CountRequest,
    ) -> impl Future<Output = Result<u64, TransportError>> + Send;
}

/// Run `statements` in order inside `txn`.
///
/// Returns every temporary reference mapped to its native id. Rows whose
/// optimistic-lock check did not match fail the whole batch with a
/// [`ConcurrencyError`]. The caller owns commit and rollback.
pub async fn execute<T: Transaction>(
    txn: &mut T,
    statements: &[Statement],
) -> Result<IdMap, OgmError> {
    let mut ids = IdMap::new();
    let mut conflicts: Vec<VersionConflict> = Vec::new();

    for statement in statements {
        let rows = statement.rows(&ids)?;
        let returned = txn.run(statement, rows).await?;
        tracing::debug!(
            cypher = %statement.cypher(),
            rows = statement.row_count(),
            returned = returned.len(),
            "Executed statement"
        );

        for check in statement.version_checks() {
            if !returned.iter().any(|r| r.reference == check.id) {
                conflicts.push(check);
            }
        }
        for row in returned {
            if row.reference < 0 {
                ids.insert(row.reference, row.id);
            }
        }
    }

    if !conflicts.is_empty() {
        tracing::warn!(count = conflicts.len(), "Optimistic lock conflicts");
        return Err(ConcurrencyError { conflicts }.into());
    }
    Ok(ids)
}
