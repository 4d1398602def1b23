//! # tributary
//!
//! Ingestion layer for column-store databases: many producer threads hand
//! over single records, and the data leaves as a few large bulk inserts.
//!
//! ## Features
//!
//! - **Failover Connection Pool**: bounded pool over an ordered list of
//!   equivalent endpoints; sticks to the last endpoint that worked and scans
//!   the others in order when it fails
//! - **Aggregating Queue Processor**: groups items into packages by count or
//!   by timer, hands them to a fixed pool of worker threads, drains
//!   gracefully on stop
//! - **Repository**: `INSERT INTO t(cols) VALUES @bulk` helpers and row,
//!   scalar and entity-mapping reads that rent, execute and return a
//!   connection per call
//! - **ClickHouse connector**: HTTP interface client that checks every
//!   response, so rejected statements surface as errors
//! - **Configuration**: YAML/JSON configs validated at startup
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tributary::prelude::*;
//! use tributary::connector::clickhouse::ClickHouseConnector;
//!
//! let config = IngestConfig::from_file("ingest.yaml")?;
//! let connector = ClickHouseConnector::new(config.clickhouse)?;
//! let pool = Arc::new(FailoverPool::new(config.pool, connector)?);
//! let repository = Repository::new(Arc::clone(&pool));
//!
//! let processor = AggregatingQueueProcessor::new(
//!     config.processor,
//!     Arc::new(repository),
//!     |repo: &Repository<ClickHouseConnector>, package: &Package<Row>, _span: &Span| {
//!         repo.bulk_insert("events", ["id", "name"], package)?;
//!         Ok(())
//!     },
//! )?;
//!
//! processor.start()?;
//! processor.add(vec![Value::from(1), Value::from("first")])?;
//! processor.stop()?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod pool;
pub mod processor;
pub mod repository;
pub mod types;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{BoxError, Error, ErrorCategory, Result};

    // Values
    pub use crate::types::{EntityMapper, IntoRow, Row, Value};

    // Configuration
    pub use crate::config::{ClickHouseConfig, IngestConfig, PoolConfig, ProcessorConfig};

    // Connections and pool
    pub use crate::connection::{Connection, Connector, BULK_PLACEHOLDER};
    pub use crate::pool::{FailoverPool, PoolStats, PooledConnection};

    // Processor
    pub use crate::processor::{
        AggregatingQueueProcessor, Package, PackageFailure, PackageHandler, ProcessorStats, State,
    };

    // Repository
    pub use crate::repository::{insert_statement, Repository};

    pub use std::sync::Arc;
    pub use tracing::Span;
}

// Re-export commonly used items at crate root
pub use error::{BoxError, Error, Result};
pub use types::Value;
