//! Neo4j connection management and the Bolt-backed driver.

use neo4rs::{ConfigBuilder, Graph, Query};
use ogm_core::{GraphResponse, Neo4jConfig, TransportError};
use ogm_mapping::{CountRequest, Driver, LoadRequest};

use crate::mutations::Neo4jTransaction;

/// Errors from graph operations.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("Neo4j connection error: {0}")]
    Connection(String),

    #[error("Neo4j query error: {0}")]
    Query(#[from] neo4rs::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<GraphError> for TransportError {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Connection(message) => TransportError::Connection(message),
            other => TransportError::Driver {
                driver: "neo4j",
                source: anyhow::Error::new(other),
            },
        }
    }
}

/// Thread-safe Neo4j driver with connection pooling.
///
/// Clone is cheap (inner Arc).
#[derive(Clone)]
pub struct Neo4jDriver {
    graph: Graph,
}

impl Neo4jDriver {
    /// Connect to Neo4j with the given configuration.
    pub async fn connect(config: &Neo4jConfig) -> Result<Self, GraphError> {
        let neo_config = ConfigBuilder::default()
            .uri(&config.uri)
            .user(&config.user)
            .password(&config.password)
            .max_connections(config.max_connections as usize)
            .fetch_size(config.fetch_size)
            .build()
            .map_err(|e| GraphError::Connection(e.to_string()))?;

        let graph = Graph::connect(neo_config)
            .await
            .map_err(|e| GraphError::Connection(e.to_string()))?;

        tracing::info!(uri = %config.uri, "Connected to Neo4j");
        Ok(Self { graph })
    }

    /// Get a reference to the underlying neo4rs Graph for direct operations.
    pub fn inner(&self) -> &Graph {
        &self.graph
    }

    /// Execute a write-only query outside any mapping transaction.
    pub async fn run(&self, query: Query) -> Result<(), GraphError> {
        self.graph.run(query).await?;
        Ok(())
    }

    /// Execute a read query and collect all rows.
    pub async fn query_rows(&self, query: Query) -> Result<Vec<neo4rs::Row>, GraphError> {
        let mut stream = self.graph.execute(query).await?;
        let mut rows = Vec::new();
        while let Some(row) = stream.next().await? {
            rows.push(row);
        }
        Ok(rows)
    }
}

impl Driver for Neo4jDriver {
    type Transaction = Neo4jTransaction;

    async fn begin(&self) -> Result<Neo4jTransaction, TransportError> {
        let txn = self.graph.start_txn().await.map_err(GraphError::from)?;
        Ok(Neo4jTransaction::new(txn))
    }

    async fn fetch(&self, request: &LoadRequest) -> Result<GraphResponse, TransportError> {
        Ok(self.load(request).await?)
    }

    async fn count(&self, request: &CountRequest) -> Result<u64, TransportError> {
        Ok(self.count_matching(request).await?)
    }
}
