//! Connection traits for tributary
//!
//! The pool never talks to a backend directly. It is handed a [`Connector`]
//! that knows how to open a physical link to one endpoint, check it, and
//! close it; the resulting [`Connection`] executes statements.

use std::time::Duration;

use crate::error::Result;
use crate::types::{Row, Value};

/// Placeholder a bulk statement uses for the row payload.
pub const BULK_PLACEHOLDER: &str = "@bulk";

/// A live physical link to one backend endpoint
pub trait Connection: Send + 'static {
    /// Execute a statement, returns affected row count when the backend reports one
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Run a query and collect every result row
    fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// Execute a bulk statement. `sql` carries [`BULK_PLACEHOLDER`] where the
    /// rows belong; returns the number of rows written.
    fn execute_bulk(&mut self, sql: &str, rows: &[Row]) -> Result<u64>;

    /// Whether the link is still in an open state
    fn is_open(&self) -> bool;

    /// Close the link
    fn close(&mut self) -> Result<()>;

    /// Endpoint this connection was opened against
    fn endpoint(&self) -> &str;
}

/// Opens, validates and closes connections on behalf of the pool.
///
/// Implementations own only the mechanics of a single connection; sizing,
/// failover and concurrency stay in the pool.
pub trait Connector: Send + Sync + 'static {
    /// Connection type produced by this connector
    type Connection: Connection;

    /// Open a new connection against `endpoint`
    fn connect(&self, endpoint: &str) -> Result<Self::Connection>;

    /// Open a new connection, giving up once `timeout` has passed.
    ///
    /// The pool always calls this with what is left of the caller's rent
    /// deadline. The default cannot bound the attempt and calls
    /// [`Self::connect`].
    fn connect_timeout(&self, endpoint: &str, timeout: Duration) -> Result<Self::Connection> {
        let _ = timeout;
        self.connect(endpoint)
    }

    /// Check whether a connection may be handed out again
    fn is_valid(&self, conn: &Self::Connection) -> bool {
        conn.is_open()
    }

    /// Close a connection the pool no longer wants
    fn close(&self, mut conn: Self::Connection) -> Result<()> {
        if conn.is_open() {
            conn.close()?;
        }
        Ok(())
    }
}
