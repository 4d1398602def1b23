//! Failover connection pool
//!
//! A bounded pool of connections against one of several interchangeable
//! endpoints:
//! - Fast path: connect to the last endpoint known to work, without locking
//! - Slow path: a single thread at a time scans every endpoint in order
//! - Scoped rentals that return (or destroy) the connection on drop
//! - Metrics and statistics
//!
//! # Example
//!
//! ```rust,ignore
//! use tributary::prelude::*;
//! use tributary::connector::clickhouse::ClickHouseConnector;
//!
//! let pool = FailoverPool::new(
//!     PoolConfig::new(["ch-1:8123", "ch-2:8123"]).with_max_size(8),
//!     ClickHouseConnector::new(ClickHouseConfig::default())?,
//! )?;
//!
//! let mut conn = pool.rent()?;
//! conn.execute("SELECT 1", &[])?;
//! // Connection is returned to the pool when dropped
//! ```

use metrics::{counter, gauge, histogram};
use parking_lot::{Condvar, Mutex};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::PoolConfig;
use crate::connection::{Connection, Connector};
use crate::error::{Error, Result};

/// Marker stored in the current-endpoint slot while no endpoint is known good
const NO_ENDPOINT: usize = usize::MAX;

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of connections created
    pub connections_created: u64,
    /// Total number of connections closed
    pub connections_closed: u64,
    /// Total number of successful rentals
    pub acquisitions: u64,
    /// Number of rentals that timed out waiting for capacity
    pub exhausted_count: u64,
    /// Total wait time for rentals (in milliseconds)
    pub total_wait_time_ms: u64,
    /// Idle or returned connections discarded as invalid
    pub validation_failures: u64,
    /// Failed attempts to open a connection against a single endpoint
    pub connect_failures: u64,
    /// Number of full scans that settled on a different endpoint
    pub failovers: u64,
}

impl PoolStats {
    /// Average time a successful rental waited, in milliseconds
    pub fn avg_wait_time_ms(&self) -> f64 {
        if self.acquisitions == 0 {
            0.0
        } else {
            self.total_wait_time_ms as f64 / self.acquisitions as f64
        }
    }
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub acquisitions: AtomicU64,
    pub exhausted_count: AtomicU64,
    pub total_wait_time_ms: AtomicU64,
    pub validation_failures: AtomicU64,
    pub connect_failures: AtomicU64,
    pub failovers: AtomicU64,
}

impl AtomicPoolStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection creation
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection close
    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acquisition
    pub fn record_acquisition(&self, wait_time_ms: u64) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
        self.total_wait_time_ms
            .fetch_add(wait_time_ms, Ordering::Relaxed);
    }

    /// Record pool exhaustion
    pub fn record_exhausted(&self) {
        self.exhausted_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection discarded by validation
    pub fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failed open against one endpoint
    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a switch to another endpoint
    pub fn record_failover(&self) {
        self.failovers.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            exhausted_count: self.exhausted_count.load(Ordering::Relaxed),
            total_wait_time_ms: self.total_wait_time_ms.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            failovers: self.failovers.load(Ordering::Relaxed),
        }
    }
}

/// Idle connections plus the count of every live connection (idle or rented)
struct Slots<T> {
    /// Idle connections (LIFO)
    idle: Vec<T>,
    /// Live connections, including slots reserved for connections being opened
    live: usize,
}

/// A connection pool that fails over between equivalent endpoints.
///
/// The pool keeps the index of the last endpoint that accepted a connection.
/// New connections go there first; when that fails the slot is cleared with a
/// compare-and-swap and a locked full scan of all endpoints picks the next
/// one. Threads that queue up behind the scan re-check the freshly resolved
/// endpoint before scanning again.
pub struct FailoverPool<C: Connector> {
    /// Pool configuration
    config: PoolConfig,
    /// Connection factory and validator
    connector: C,
    /// Index into `config.endpoints` of the current endpoint, or `NO_ENDPOINT`
    current: AtomicUsize,
    /// Serializes full endpoint scans
    scan_lock: Mutex<()>,
    /// Idle connections and live count
    slots: Mutex<Slots<C::Connection>>,
    /// Signalled whenever a slot frees up
    slot_available: Condvar,
    /// Statistics
    stats: AtomicPoolStats,
    /// Shutdown flag
    shutdown: AtomicBool,
}

impl<C: Connector> FailoverPool<C> {
    /// Create a new pool. No connection is opened until the first rental.
    pub fn new(config: PoolConfig, connector: C) -> Result<Self> {
        config.validate_config()?;

        info!(
            pool = %config.name,
            endpoints = ?config.endpoints,
            max_size = config.max_size,
            "Connection pool created"
        );

        Ok(Self {
            slots: Mutex::new(Slots {
                idle: Vec::with_capacity(config.max_size),
                live: 0,
            }),
            config,
            connector,
            current: AtomicUsize::new(NO_ENDPOINT),
            scan_lock: Mutex::new(()),
            slot_available: Condvar::new(),
            stats: AtomicPoolStats::new(),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Rent a connection, waiting at most the configured acquire timeout.
    pub fn rent(&self) -> Result<PooledConnection<'_, C>> {
        self.rent_timeout(self.config.acquire_timeout())
    }

    /// Rent a connection within `timeout`.
    ///
    /// The deadline covers both the wait for pool capacity and opening a new
    /// connection: each endpoint attempt gets what is left of it through
    /// [`Connector::connect_timeout`], and no further endpoint is tried once
    /// it has passed. An attempt already running when the deadline passes is
    /// bounded only by the connector.
    ///
    /// Fails with [`Error::PoolExhausted`] when no slot frees up in time,
    /// with [`Error::Timeout`] when the deadline passes while opening a
    /// connection and with [`Error::ConnectionUnavailable`] when every
    /// endpoint refused one.
    pub fn rent_timeout(&self, timeout: Duration) -> Result<PooledConnection<'_, C>> {
        let start = Instant::now();
        let deadline = start + timeout;
        let mut discarded = Vec::new();

        let idle_conn = {
            let mut slots = self.slots.lock();
            loop {
                if self.shutdown.load(Ordering::Acquire) {
                    drop(slots);
                    self.destroy_all(discarded);
                    return Err(Error::pool_exhausted("pool is shut down"));
                }

                if let Some(conn) = slots.idle.pop() {
                    if self.is_valid_element(&conn) {
                        break Some(conn);
                    }
                    slots.live -= 1;
                    self.stats.record_validation_failure();
                    discarded.push(conn);
                    continue;
                }

                if slots.live < self.config.max_size {
                    // Reserve the slot now, open the connection outside the lock
                    slots.live += 1;
                    break None;
                }

                if self
                    .slot_available
                    .wait_until(&mut slots, deadline)
                    .timed_out()
                {
                    drop(slots);
                    self.destroy_all(discarded);
                    self.stats.record_exhausted();
                    counter!("tributary.pool.exhausted", "pool" => self.config.name.clone())
                        .increment(1);
                    return Err(Error::pool_exhausted(format!(
                        "timeout waiting for connection ({}ms)",
                        timeout.as_millis()
                    )));
                }
            }
        };

        self.destroy_all(discarded);

        let conn = match idle_conn {
            Some(conn) => conn,
            None => match self.create_element(deadline) {
                Ok(conn) => conn,
                Err(e) => {
                    self.release_slot();
                    return Err(e);
                }
            },
        };

        let wait = start.elapsed();
        self.stats.record_acquisition(wait.as_millis() as u64);
        histogram!("tributary.pool.acquire_wait_ms", "pool" => self.config.name.clone())
            .record(wait.as_secs_f64() * 1000.0);

        Ok(PooledConnection {
            pool: self,
            conn: Some(conn),
            broken: false,
        })
    }

    /// Open a new connection, trying the current endpoint before scanning.
    fn create_element(&self, deadline: Instant) -> Result<C::Connection> {
        let mut index = self.current.load(Ordering::Acquire);

        while index != NO_ENDPOINT {
            let timeout = self.remaining(deadline, index)?;
            if let Ok(conn) = self.open(index, timeout) {
                return Ok(conn);
            }

            // Only the caller that still sees the failed endpoint clears it
            let _ = self.current.compare_exchange(
                index,
                NO_ENDPOINT,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            index = self.current.load(Ordering::Acquire);
        }

        self.scan_endpoints(deadline)
    }

    /// Try every endpoint in order under the scan lock.
    ///
    /// Only the error of the last endpoint is returned; earlier failures are
    /// logged by [`Self::open`].
    fn scan_endpoints(&self, deadline: Instant) -> Result<C::Connection> {
        let Some(_scan) = self.scan_lock.try_lock_until(deadline) else {
            return Err(self.deadline_elapsed("waiting for the endpoint scan"));
        };

        // Another thread may have resolved a new endpoint while we waited
        let index = self.current.load(Ordering::Acquire);
        if index != NO_ENDPOINT {
            let timeout = self.remaining(deadline, index)?;
            if let Ok(conn) = self.open(index, timeout) {
                return Ok(conn);
            }
        }

        self.current.store(NO_ENDPOINT, Ordering::Release);

        let endpoints = &self.config.endpoints;
        let mut last_error = None;
        for (i, endpoint) in endpoints.iter().enumerate() {
            let timeout = self.remaining(deadline, i)?;
            info!(pool = %self.config.name, endpoint = %endpoint, "Trying endpoint");

            match self.open(i, timeout) {
                Ok(conn) => {
                    self.current.store(i, Ordering::Release);
                    if index != i {
                        self.stats.record_failover();
                        counter!("tributary.pool.failovers", "pool" => self.config.name.clone())
                            .increment(1);
                    }
                    info!(pool = %self.config.name, endpoint = %endpoint, "Current endpoint changed");
                    return Ok(conn);
                }
                Err(e) => last_error = Some((endpoint, e)),
            }
        }

        match last_error {
            Some((endpoint, source)) => Err(Error::ConnectionUnavailable {
                endpoint: endpoint.clone(),
                attempted: endpoints.len(),
                source: Box::new(source),
            }),
            None => Err(Error::internal("pool has no endpoints")),
        }
    }

    /// Open one connection against the endpoint at `index`
    fn open(&self, index: usize, timeout: Duration) -> Result<C::Connection> {
        let endpoint = &self.config.endpoints[index];
        match self.connector.connect_timeout(endpoint, timeout) {
            Ok(conn) => {
                self.stats.record_created();
                counter!("tributary.pool.connections.created", "pool" => self.config.name.clone())
                    .increment(1);
                debug!(pool = %self.config.name, endpoint = %endpoint, "Connected");
                Ok(conn)
            }
            Err(e) => {
                self.stats.record_connect_failure();
                counter!("tributary.pool.connect_failures",
                    "pool" => self.config.name.clone(),
                    "category" => e.category().as_str())
                .increment(1);
                warn!(
                    pool = %self.config.name,
                    endpoint = %endpoint,
                    error = %e,
                    "Endpoint unavailable"
                );
                Err(e)
            }
        }
    }

    /// Time left before `deadline` for an attempt on the endpoint at `index`.
    ///
    /// Checked before the attempt, so an elapsed deadline never counts as a
    /// failure of the endpoint.
    fn remaining(&self, deadline: Instant, index: usize) -> Result<Duration> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            let endpoint = &self.config.endpoints[index];
            return Err(self.deadline_elapsed(&format!("before trying {}", endpoint)));
        }
        Ok(remaining)
    }

    fn deadline_elapsed(&self, context: &str) -> Error {
        counter!("tributary.pool.rent_timeouts", "pool" => self.config.name.clone()).increment(1);
        warn!(pool = %self.config.name, context, "Rent deadline elapsed");
        Error::timeout(format!("rent deadline elapsed {}", context))
    }

    /// A connection is reusable only while some endpoint is known good and
    /// the connection itself is open.
    fn is_valid_element(&self, conn: &C::Connection) -> bool {
        self.current.load(Ordering::Acquire) != NO_ENDPOINT && self.connector.is_valid(conn)
    }

    /// Close a connection, logging and swallowing any error
    fn destroy_element(&self, conn: C::Connection) {
        let endpoint = conn.endpoint().to_string();
        if let Err(e) = self.connector.close(conn) {
            warn!(
                pool = %self.config.name,
                endpoint = %endpoint,
                error = %e,
                "Error while closing connection"
            );
        }
        self.stats.record_closed();
        counter!("tributary.pool.connections.closed", "pool" => self.config.name.clone())
            .increment(1);
    }

    fn destroy_all(&self, conns: Vec<C::Connection>) {
        for conn in conns {
            self.destroy_element(conn);
        }
    }

    /// Give back a slot whose connection was never created or was destroyed
    fn release_slot(&self) {
        let mut slots = self.slots.lock();
        slots.live -= 1;
        gauge!("tributary.pool.live", "pool" => self.config.name.clone()).set(slots.live as f64);
        drop(slots);
        self.slot_available.notify_one();
    }

    /// Return a rented connection to the idle set, or destroy it
    fn give_back(&self, conn: C::Connection, broken: bool) {
        let reusable = !broken
            && !self.shutdown.load(Ordering::Acquire)
            && self.is_valid_element(&conn);

        if !reusable {
            if !broken && !self.shutdown.load(Ordering::Acquire) {
                self.stats.record_validation_failure();
            }
            self.destroy_element(conn);
            self.release_slot();
            return;
        }

        self.slots.lock().idle.push(conn);
        self.slot_available.notify_one();
    }

    /// Endpoint new connections currently go to, if one is known good
    pub fn current_endpoint(&self) -> Option<&str> {
        match self.current.load(Ordering::Acquire) {
            NO_ENDPOINT => None,
            index => self.config.endpoints.get(index).map(String::as_str),
        }
    }

    /// All configured endpoints, in failover order
    pub fn endpoints(&self) -> &[String] {
        &self.config.endpoints
    }

    /// Pool name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Get pool configuration
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The connector used to open connections
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Number of live connections (idle and rented)
    pub fn size(&self) -> usize {
        self.slots.lock().live
    }

    /// Number of idle connections
    pub fn idle(&self) -> usize {
        self.slots.lock().idle.len()
    }

    /// Number of rented connections
    pub fn in_use(&self) -> usize {
        let slots = self.slots.lock();
        slots.live.saturating_sub(slots.idle.len())
    }

    /// Get pool statistics
    pub fn stats(&self) -> PoolStats {
        self.stats.snapshot()
    }

    /// Close idle connections and refuse further rentals.
    ///
    /// Connections still rented are destroyed when they come back.
    pub fn close(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }

        let idle = {
            let mut slots = self.slots.lock();
            let idle: Vec<_> = slots.idle.drain(..).collect();
            slots.live -= idle.len();
            idle
        };
        let closed = idle.len();
        self.destroy_all(idle);
        self.slot_available.notify_all();

        let stats = self.stats.snapshot();
        info!(
            pool = %self.config.name,
            closed,
            acquisitions = stats.acquisitions,
            failovers = stats.failovers,
            avg_wait_ms = stats.avg_wait_time_ms(),
            "Connection pool closed"
        );
    }

    /// Whether [`Self::close`] has been called
    pub fn is_closed(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

impl<C: Connector> Drop for FailoverPool<C> {
    fn drop(&mut self) {
        self.close();
    }
}

/// A connection rented from a [`FailoverPool`].
///
/// Dereferences to the underlying connection. Dropping the handle returns
/// the connection to the pool, or destroys it when it is no longer valid or
/// has been marked broken.
pub struct PooledConnection<'a, C: Connector> {
    pool: &'a FailoverPool<C>,
    conn: Option<C::Connection>,
    broken: bool,
}

impl<'a, C: Connector> PooledConnection<'a, C> {
    /// Destroy this connection on release instead of returning it to the pool
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    /// Whether the connection will be destroyed on release
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// The pool this connection belongs to
    pub fn pool(&self) -> &'a FailoverPool<C> {
        self.pool
    }
}

impl<C: Connector> Deref for PooledConnection<'_, C> {
    type Target = C::Connection;

    fn deref(&self) -> &Self::Target {
        // Only taken in Drop
        match self.conn.as_ref() {
            Some(conn) => conn,
            None => unreachable!("connection already returned"),
        }
    }
}

impl<C: Connector> DerefMut for PooledConnection<'_, C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match self.conn.as_mut() {
            Some(conn) => conn,
            None => unreachable!("connection already returned"),
        }
    }
}

impl<C: Connector> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.give_back(conn, self.broken);
        }
    }
}
