//! Error types for tributary
//!
//! Errors are classified so callers can decide what to do with them:
//! - Retriable errors (connection loss, exhausted pool, timeouts)
//! - Caller errors (wrong lifecycle state, oversized packages, bad configuration)
//! - Handler errors raised while a worker processed a package

use std::fmt;
use thiserror::Error;

use crate::processor::State;

/// Result type for tributary operations
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed error used for opaque causes coming from drivers and handlers
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Connection-related errors (retriable)
    Connection,
    /// Statement execution errors
    Query,
    /// Timeout errors (retriable)
    Timeout,
    /// Configuration error
    Configuration,
    /// Pool exhausted (retriable with backoff)
    PoolExhausted,
    /// Operation not allowed in the current lifecycle state
    State,
    /// Package larger than the configured maximum
    Capacity,
    /// Package handler failed
    Handler,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Connection loss, timeouts and an exhausted pool may succeed on a later attempt
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout | Self::PoolExhausted)
    }

    /// Stable snake_case name, used as a metrics label
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Query => "query",
            Self::Timeout => "timeout",
            Self::Configuration => "configuration",
            Self::PoolExhausted => "pool_exhausted",
            Self::State => "state",
            Self::Capacity => "capacity",
            Self::Handler => "handler",
            Self::Other => "other",
        }
    }
}

/// Main error type for tributary
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// Operation invoked in the wrong lifecycle state
    #[error("invalid state: cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: State,
    },

    /// Package exceeds the configured maximum package size
    #[error("package too large: {size} items, max package size is {max}")]
    PackageTooLarge { size: usize, max: usize },

    /// Every configured endpoint failed during a full failover scan
    #[error("no endpoint reachable after trying {attempted}, last endpoint {endpoint}")]
    ConnectionUnavailable {
        endpoint: String,
        attempted: usize,
        #[source]
        source: Box<Error>,
    },

    /// Opening or using a single physical connection failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Statement execution failed
    #[error("query error: {message}")]
    Query {
        message: String,
        sql: Option<String>,
        #[source]
        source: Option<BoxError>,
    },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Connection pool exhausted or shut down
    #[error("pool exhausted: {message}")]
    PoolExhausted { message: String },

    /// A package handler returned an error
    #[error("package handler failed: {message}")]
    Handler {
        message: String,
        #[source]
        source: Option<BoxError>,
    },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidState { .. } => ErrorCategory::State,
            Self::PackageTooLarge { .. } => ErrorCategory::Capacity,
            Self::ConnectionUnavailable { .. } | Self::Connection { .. } => {
                ErrorCategory::Connection
            }
            Self::Query { .. } => ErrorCategory::Query,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::PoolExhausted { .. } => ErrorCategory::PoolExhausted,
            Self::Handler { .. } => ErrorCategory::Handler,
            Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Create an invalid state error
    pub fn invalid_state(operation: &'static str, state: State) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a query error, e.g. from an [`EntityMapper`](crate::types::EntityMapper)
    /// that cannot read a row
    pub fn query(message: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: None,
            source: None,
        }
    }

    /// Create a query error with SQL
    pub fn query_with_sql(message: impl Into<String>, sql: impl Into<String>) -> Self {
        Self::Query {
            message: message.into(),
            sql: Some(sql.into()),
            source: None,
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a pool exhausted error
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            message: message.into(),
        }
    }

    /// Create a handler error from whatever the handler returned
    pub fn handler(source: BoxError) -> Self {
        Self::Handler {
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::config(errors.to_string())
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
