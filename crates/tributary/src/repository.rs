//! Bulk-insert and query façade over the failover pool
//!
//! Every call rents one connection, runs one statement and returns the
//! connection before returning. Connections that fail with a connection
//! or timeout error are destroyed instead of going back to the pool.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::connection::{Connection, Connector, BULK_PLACEHOLDER};
use crate::error::{Error, ErrorCategory, Result};
use crate::pool::{FailoverPool, PooledConnection};
use crate::types::{EntityMapper, IntoRow, Row, Value};

/// Build `INSERT INTO table(c1,c2,...) VALUES @bulk`, keeping column order
pub fn insert_statement<I, S>(table: &str, columns: I) -> Result<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let table = table.trim();
    if table.is_empty() {
        return Err(Error::config("table name is empty"));
    }

    let columns: Vec<String> = columns
        .into_iter()
        .map(|c| c.as_ref().trim().to_string())
        .collect();
    if columns.is_empty() {
        return Err(Error::config(format!("no columns given for {}", table)));
    }
    if let Some(pos) = columns.iter().position(|c| c.is_empty()) {
        return Err(Error::config(format!(
            "column #{} for {} is blank",
            pos, table
        )));
    }

    Ok(format!(
        "INSERT INTO {}({}) VALUES {}",
        table,
        columns.join(","),
        BULK_PLACEHOLDER
    ))
}

/// Convenience wrapper for common write paths
pub struct Repository<C: Connector> {
    pool: Arc<FailoverPool<C>>,
    rent_timeout: Option<Duration>,
}

impl<C: Connector> Clone for Repository<C> {
    fn clone(&self) -> Self {
        Self {
            pool: Arc::clone(&self.pool),
            rent_timeout: self.rent_timeout,
        }
    }
}

impl<C: Connector> Repository<C> {
    /// Create a repository renting with the pool's acquire timeout
    pub fn new(pool: Arc<FailoverPool<C>>) -> Self {
        Self {
            pool,
            rent_timeout: None,
        }
    }

    /// Override how long a call waits for a free connection
    pub fn with_rent_timeout(mut self, timeout: Duration) -> Self {
        self.rent_timeout = Some(timeout);
        self
    }

    /// Underlying pool
    pub fn pool(&self) -> &Arc<FailoverPool<C>> {
        &self.pool
    }

    /// Insert rows into `table`; column order must match row value order
    pub fn bulk_insert<I, S>(&self, table: &str, columns: I, rows: &[Row]) -> Result<u64>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let sql = insert_statement(table, columns)?;
        self.bulk_insert_query(&sql, rows)
    }

    /// Insert entities converted with [`IntoRow`]
    pub fn bulk_insert_entities<I, S, E>(
        &self,
        table: &str,
        columns: I,
        entities: impl IntoIterator<Item = E>,
    ) -> Result<u64>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
        E: IntoRow,
    {
        let sql = insert_statement(table, columns)?;
        let rows: Vec<Row> = entities.into_iter().map(IntoRow::into_row).collect();
        self.bulk_insert_query(&sql, &rows)
    }

    /// Run a caller-written bulk statement containing `@bulk`.
    ///
    /// An empty `rows` slice does not touch the pool and returns 0.
    pub fn bulk_insert_query(&self, sql: &str, rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        if !sql.contains(BULK_PLACEHOLDER) {
            return Err(Error::query_with_sql(
                format!("bulk statement has no {} placeholder", BULK_PLACEHOLDER),
                sql,
            ));
        }

        let start = Instant::now();
        let mut conn = self.rent()?;
        let written = Self::checked(&mut conn, |c| c.execute_bulk(sql, rows))?;
        debug!(
            endpoint = %conn.endpoint(),
            rows = rows.len(),
            written,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Bulk insert complete"
        );
        Ok(written)
    }

    /// Execute a statement without reading a result
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        let mut conn = self.rent()?;
        Self::checked(&mut conn, |c| c.execute(sql, params))
    }

    /// Run a query and collect every row
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let mut conn = self.rent()?;
        Self::checked(&mut conn, |c| c.query(sql, params))
    }

    /// First column of the first row, `None` when the query returns nothing
    pub fn query_scalar(&self, sql: &str, params: &[Value]) -> Result<Option<Value>> {
        let rows = self.query(sql, params)?;
        Ok(rows.into_iter().next().and_then(|row| row.into_iter().next()))
    }

    /// Run a query and hand the full result to `reader`.
    ///
    /// The connection is back in the pool before `reader` runs.
    pub fn query_with<T, F>(&self, sql: &str, params: &[Value], reader: F) -> Result<T>
    where
        F: FnOnce(Vec<Row>) -> Result<T>,
    {
        let rows = self.query(sql, params)?;
        reader(rows)
    }

    /// Run a query and map each row into an entity; the first mapping error
    /// fails the whole call
    pub fn query_map<T, M>(&self, sql: &str, params: &[Value], mapper: &M) -> Result<Vec<T>>
    where
        M: EntityMapper<T> + ?Sized,
    {
        self.query(sql, params)?
            .iter()
            .map(|row| mapper.map_entity(row))
            .collect()
    }

    fn rent(&self) -> Result<PooledConnection<'_, C>> {
        match self.rent_timeout {
            Some(timeout) => self.pool.rent_timeout(timeout),
            None => self.pool.rent(),
        }
    }

    fn checked<T>(
        conn: &mut PooledConnection<'_, C>,
        op: impl FnOnce(&mut C::Connection) -> Result<T>,
    ) -> Result<T> {
        let result = op(&mut **conn);
        if let Err(e) = &result {
            if matches!(e.category(), ErrorCategory::Connection | ErrorCategory::Timeout) {
                warn!(endpoint = %conn.endpoint(), error = %e, "Dropping broken connection");
                conn.mark_broken();
            }
        }
        result
    }
}
