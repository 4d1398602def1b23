//! Shared fixtures for integration tests

#![allow(dead_code)]

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tributary::prelude::*;

/// Install a test-friendly subscriber once; later calls are no-ops
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("tributary=debug")
        .with_test_writer()
        .try_init();
}

/// A statement observed by [`MockConnector`]
#[derive(Debug, Clone, PartialEq)]
pub struct Executed {
    pub endpoint: String,
    pub sql: String,
    pub rows: usize,
}

#[derive(Default)]
struct MockState {
    reachable: Mutex<HashSet<String>>,
    attempts: Mutex<Vec<String>>,
    executed: Mutex<Vec<Executed>>,
    results: Mutex<Vec<Row>>,
    connect_delay: Mutex<Duration>,
    break_next: AtomicBool,
    time_out_next: AtomicBool,
}

/// In-memory connector with switchable endpoint reachability
#[derive(Clone, Default)]
pub struct MockConnector {
    state: Arc<MockState>,
}

impl MockConnector {
    pub fn with_reachable(endpoints: &[&str]) -> Self {
        let connector = Self::default();
        for endpoint in endpoints {
            connector.set_reachable(endpoint, true);
        }
        connector
    }

    pub fn set_reachable(&self, endpoint: &str, reachable: bool) {
        let mut set = self.state.reachable.lock();
        if reachable {
            set.insert(endpoint.to_string());
        } else {
            set.remove(endpoint);
        }
    }

    /// Endpoints passed to `connect`, in call order
    pub fn attempts(&self) -> Vec<String> {
        self.state.attempts.lock().clone()
    }

    pub fn clear_attempts(&self) {
        self.state.attempts.lock().clear();
    }

    pub fn executed(&self) -> Vec<Executed> {
        self.state.executed.lock().clone()
    }

    pub fn rows_written(&self) -> usize {
        self.state.executed.lock().iter().map(|e| e.rows).sum()
    }

    /// Rows every `query` call returns
    pub fn set_results(&self, rows: Vec<Row>) {
        *self.state.results.lock() = rows;
    }

    /// Delay each `connect` call, ignoring any timeout it is given
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.state.connect_delay.lock() = delay;
    }

    /// Make the next statement time out, leaving the connection open
    pub fn time_out_next(&self) {
        self.state.time_out_next.store(true, Ordering::SeqCst);
    }

    /// Make the next statement fail with a connection error
    pub fn break_next(&self) {
        self.state.break_next.store(true, Ordering::SeqCst);
    }
}

impl Connector for MockConnector {
    type Connection = MockConnection;

    fn connect(&self, endpoint: &str) -> Result<MockConnection> {
        self.state.attempts.lock().push(endpoint.to_string());
        let delay = *self.state.connect_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if !self.state.reachable.lock().contains(endpoint) {
            return Err(Error::connection(format!("{} refused connection", endpoint)));
        }
        Ok(MockConnection {
            endpoint: endpoint.to_string(),
            open: true,
            state: Arc::clone(&self.state),
        })
    }
}

pub struct MockConnection {
    endpoint: String,
    open: bool,
    state: Arc<MockState>,
}

impl MockConnection {
    fn record(&mut self, sql: &str, rows: usize) -> Result<()> {
        if self.state.break_next.swap(false, Ordering::SeqCst) {
            self.open = false;
            return Err(Error::connection(format!("{} reset", self.endpoint)));
        }
        if self.state.time_out_next.swap(false, Ordering::SeqCst) {
            return Err(Error::timeout(format!("{} did not answer", self.endpoint)));
        }
        self.state.executed.lock().push(Executed {
            endpoint: self.endpoint.clone(),
            sql: sql.to_string(),
            rows,
        });
        Ok(())
    }
}

impl Connection for MockConnection {
    fn execute(&mut self, sql: &str, _params: &[Value]) -> Result<u64> {
        self.record(sql, 0)?;
        Ok(0)
    }

    fn query(&mut self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        self.record(sql, 0)?;
        Ok(self.state.results.lock().clone())
    }

    fn execute_bulk(&mut self, sql: &str, rows: &[Row]) -> Result<u64> {
        self.record(sql, rows.len())?;
        Ok(rows.len() as u64)
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }

    fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Pool over `endpoints` with a short acquire timeout
pub fn mock_pool(endpoints: &[&str], connector: &MockConnector) -> FailoverPool<MockConnector> {
    let config = PoolConfig::new(endpoints.iter().copied())
        .with_name("test-pool")
        .with_max_size(4)
        .with_acquire_timeout(Duration::from_millis(200));
    FailoverPool::new(config, connector.clone()).unwrap()
}

/// Packages seen by [`recording_handler`], in completion order
pub type Recorded = Mutex<Vec<(u64, Vec<u64>)>>;

/// Handler recording each package as `(id, items)`
pub fn recording_handler(
    recorded: &Recorded,
    package: &Package<u64>,
    _span: &Span,
) -> std::result::Result<(), BoxError> {
    recorded.lock().push((package.id(), package.items().to_vec()));
    Ok(())
}

/// Processor config whose timer never fires during a test
pub fn config_without_timer(max_package_size: usize) -> ProcessorConfig {
    ProcessorConfig::new()
        .with_name("test-processor")
        .with_max_package_size(max_package_size)
        .with_processing_thread_count(2)
        .with_processing_queue_max_size(16)
        .with_timer_period(Duration::from_secs(3600))
}

/// Poll `condition` until it holds or `timeout` elapses
pub fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// Packages sorted by id
pub fn by_id(recorded: &Recorded) -> Vec<(u64, Vec<u64>)> {
    let mut packages = recorded.lock().clone();
    packages.sort_by_key(|(id, _)| *id);
    packages
}
