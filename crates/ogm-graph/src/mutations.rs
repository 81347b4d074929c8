//! Write path over Bolt.
//!
//! Every compiled statement runs inside one explicit transaction with its
//! rows bound to `$rows`. Rows are JSON on our side and are converted to
//! Bolt values once, here.

use neo4rs::{
    query, BoltBoolean, BoltFloat, BoltInteger, BoltList, BoltMap, BoltNull, BoltString, BoltType,
    Txn,
};
use ogm_core::TransportError;
use ogm_mapping::{ReturnedId, Statement, Transaction};
use serde_json::Value;

use crate::client::GraphError;

/// An open Neo4j transaction.
pub struct Neo4jTransaction {
    txn: Txn,
}

impl Neo4jTransaction {
    pub(crate) fn new(txn: Txn) -> Self {
        Self { txn }
    }
}

impl Transaction for Neo4jTransaction {
    async fn run(
        &mut self,
        statement: &Statement,
        rows: Vec<Value>,
    ) -> Result<Vec<ReturnedId>, TransportError> {
        let cypher = statement.cypher();
        let q = query(&cypher)
            .param("rows", to_bolt(&Value::Array(rows)))
            .param("type", statement.result_type());

        let mut stream = self.txn.execute(q).await.map_err(GraphError::from)?;
        let mut returned = Vec::new();
        while let Some(row) = stream
            .next(self.txn.handle())
            .await
            .map_err(GraphError::from)?
        {
            let (Ok(reference), Ok(id)) = (row.get::<i64>("ref"), row.get::<i64>("id")) else {
                continue;
            };
            returned.push(ReturnedId { reference, id });
        }
        tracing::trace!(returned = returned.len(), "Statement returned ids");
        Ok(returned)
    }

    async fn commit(self) -> Result<(), TransportError> {
        self.txn.commit().await.map_err(GraphError::from)?;
        Ok(())
    }

    async fn rollback(self) -> Result<(), TransportError> {
        self.txn.rollback().await.map_err(GraphError::from)?;
        Ok(())
    }
}

/// Convert a JSON value into the equivalent Bolt value.
///
/// Integers that fit `i64` stay integers; every other number becomes a
/// float.
pub fn to_bolt(value: &Value) -> BoltType {
    match value {
        Value::Null => BoltType::Null(BoltNull),
        Value::Bool(b) => BoltType::Boolean(BoltBoolean::new(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => BoltType::Integer(BoltInteger::new(i)),
            None => BoltType::Float(BoltFloat::new(n.as_f64().unwrap_or_default())),
        },
        Value::String(s) => BoltType::String(BoltString::new(s)),
        Value::Array(items) => {
            let mut list = BoltList::with_capacity(items.len());
            for item in items {
                list.push(to_bolt(item));
            }
            BoltType::List(list)
        }
        Value::Object(map) => {
            let mut bolt = BoltMap::with_capacity(map.len());
            for (key, item) in map {
                bolt.put(BoltString::new(key), to_bolt(item));
            }
            BoltType::Map(bolt)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scalars_convert() {
        assert!(matches!(to_bolt(&json!(null)), BoltType::Null(_)));
        assert!(matches!(to_bolt(&json!(true)), BoltType::Boolean(_)));
        assert!(matches!(to_bolt(&json!(42)), BoltType::Integer(_)));
        assert!(matches!(to_bolt(&json!(1.5)), BoltType::Float(_)));
        assert!(matches!(to_bolt(&json!("Heat")), BoltType::String(_)));
    }

    #[test]
    fn test_rows_convert_to_list_of_maps() {
        let rows = json!([{"nodeRef": -1, "props": {"title": "Heat", "year": 1995}}]);
        match to_bolt(&rows) {
            BoltType::List(list) => {
                assert_eq!(list.len(), 1);
                assert!(matches!(list.get(0), Some(BoltType::Map(_))));
            }
            other => panic!("expected a list, got {other:?}"),
        }
    }
}
