//! Aggregating queue processor
//!
//! Producers add single items to an unbounded intake queue. Items are cut
//! into packages of at most `max_package_size` when the intake crosses that
//! size, when the flush timer ticks, on a manual flush, and on stop. Packages
//! go to a bounded processing queue that a fixed pool of worker threads
//! drains by calling a [`PackageHandler`].
//!
//! ```text
//! add ──► intake (unbounded) ──► packaging ──► processing (bounded) ──► workers ──► handler
//!                                   ▲    ▲
//!                      threshold ───┘    └─── timer / flush / stop
//! ```
//!
//! Package ids are assigned in formation order and packages reach the
//! processing queue in that order. Workers run in parallel, so completion
//! order is not guaranteed.

mod handler;
mod state;
mod stats;
mod timer;
mod worker;

pub use handler::{Package, PackageFailure, PackageHandler};
pub use state::State;
pub use stats::{AtomicProcessorStats, ProcessorStats};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use metrics::{counter, gauge, histogram};
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, warn};

use crate::config::ProcessorConfig;
use crate::error::{Error, Result};
use state::Lifecycle;
use timer::FlushTimer;
use worker::WorkerPool;

/// Capacity of the failure report channel; reports beyond it are dropped
const FAILURE_CHANNEL_CAPACITY: usize = 1024;

/// What caused a packaging pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    /// Intake reached `max_package_size`; cut full packages only
    Threshold,
    /// Timer tick; cut everything queued when the tick fired
    Timer,
    /// `force_flush`; same as a timer tick
    Manual,
    /// Stop; cut until the intake is empty
    Drain,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Trigger::Threshold => "threshold",
            Trigger::Timer => "timer",
            Trigger::Manual => "manual",
            Trigger::Drain => "drain",
        }
    }
}

/// State shared with the worker and timer threads
struct Core<T, S, H> {
    config: ProcessorConfig,
    lifecycle: Lifecycle,
    intake_tx: Sender<T>,
    intake_rx: Receiver<T>,
    processing_tx: Sender<Package<T>>,
    processing_rx: Receiver<Package<T>>,
    /// Held while items are taken off the intake; guards the next package id
    packaging: Mutex<u64>,
    /// Held while a formed package is pushed; taken before `packaging` is released
    push_order: Mutex<()>,
    stats: AtomicProcessorStats,
    failures_tx: Sender<PackageFailure>,
    failures_rx: Receiver<PackageFailure>,
    source: Arc<S>,
    handler: H,
}

impl<T, S, H> Core<T, S, H>
where
    T: Send + 'static,
    S: Send + Sync + 'static,
    H: PackageHandler<T, S>,
{
    /// Number of items the current pass may take, or `None` to stop
    fn next_take(&self, trigger: Trigger, budget: &mut Option<usize>) -> Option<usize> {
        let max = self.config.max_package_size;
        let queued = self.intake_rx.len();

        match trigger {
            Trigger::Threshold => (queued >= max).then_some(max),
            Trigger::Drain => (queued > 0).then(|| queued.min(max)),
            Trigger::Timer | Trigger::Manual => {
                let remaining = budget.get_or_insert_with(|| queued.div_ceil(max));
                if *remaining == 0 || queued == 0 {
                    return None;
                }
                *remaining -= 1;
                Some(queued.min(max))
            }
        }
    }

    /// Cut packages off the intake and push them, returning how many were pushed
    fn form_and_push(&self, trigger: Trigger) -> usize {
        let mut budget = None;
        let mut pushed = 0;

        loop {
            let mut next_id = self.packaging.lock();
            let Some(take) = self.next_take(trigger, &mut budget) else {
                break;
            };

            let items: Vec<T> = self.intake_rx.try_iter().take(take).collect();
            if items.is_empty() {
                break;
            }

            let package = Package::new(*next_id, items);
            *next_id += 1;

            let order = self.push_order.lock();
            drop(next_id);

            if self.push(package, trigger).is_err() {
                break;
            }
            drop(order);
            pushed += 1;
        }

        if pushed > 0 {
            debug!(
                processor = %self.config.name,
                trigger = trigger.as_str(),
                packages = pushed,
                "Packages formed"
            );
        }
        pushed
    }

    /// Push onto the processing queue, blocking while it is full
    fn push(&self, package: Package<T>, trigger: Trigger) -> Result<()> {
        let items = package.len() as u64;
        let id = package.id();

        self.processing_tx.send(package).map_err(|_| {
            error!(processor = %self.config.name, package_id = id, "Processing queue disconnected");
            Error::internal("processing queue disconnected")
        })?;

        self.stats.record_pushed(items);
        counter!("tributary.processor.packages_pushed",
            "processor" => self.config.name.clone(),
            "trigger" => trigger.as_str())
        .increment(1);
        counter!("tributary.processor.items_pushed", "processor" => self.config.name.clone())
            .increment(items);
        gauge!("tributary.processor.queue_depth", "processor" => self.config.name.clone())
            .set(self.processing_rx.len() as f64);
        Ok(())
    }

    fn on_tick(&self) {
        let Ok(_state) = self.lifecycle.enter("flush", State::Started) else {
            return;
        };
        self.form_and_push(Trigger::Timer);
    }

    /// Run the handler for one package on the calling worker thread
    fn process(&self, package: Package<T>) {
        let span = info_span!(
            "package",
            processor = %self.config.name,
            package_id = package.id(),
            items = package.len()
        );
        let _enter = span.enter();
        let started = Instant::now();

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            self.handler.handle(&self.source, &package, &span)
        }));

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!("tributary.processor.package_duration_ms", "processor" => self.config.name.clone())
            .record(elapsed_ms);

        let error = match outcome {
            Ok(Ok(())) => {
                self.stats.record_processed(package.len() as u64);
                counter!("tributary.processor.items_processed", "processor" => self.config.name.clone())
                    .increment(package.len() as u64);
                debug!(elapsed_ms, "Package processed");
                return;
            }
            Ok(Err(e)) => Error::handler(e),
            Err(payload) => Error::Handler {
                message: format!("handler panicked: {}", panic_message(payload.as_ref())),
                source: None,
            },
        };

        self.stats.record_failed(package.len() as u64);
        counter!("tributary.processor.packages_failed", "processor" => self.config.name.clone())
            .increment(1);
        error!(error = %error, elapsed_ms, "Package handler failed; package is not retried");

        let failure = PackageFailure {
            package_id: package.id(),
            items: package.len(),
            error,
        };
        if let Err(TrySendError::Full(failure)) = self.failures_tx.try_send(failure) {
            warn!(
                package_id = failure.package_id,
                "Failure report channel full, report dropped"
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Threads owned by a started processor
#[derive(Default)]
struct Control {
    timer: Option<FlushTimer>,
    workers: Option<WorkerPool>,
}

/// Batches single items into packages and processes them on worker threads.
///
/// # Example
///
/// ```rust,ignore
/// let processor = AggregatingQueueProcessor::new(
///     ProcessorConfig::new().with_max_package_size(5000),
///     Arc::clone(&pool),
///     |pool: &FailoverPool<ClickHouseConnector>, package: &Package<Row>, _span: &Span| {
///         let mut conn = pool.rent()?;
///         conn.execute_bulk("INSERT INTO events(id, name) VALUES @bulk", package)?;
///         Ok(())
///     },
/// )?;
///
/// processor.start()?;
/// processor.add(row)?;
/// processor.stop()?;
/// ```
pub struct AggregatingQueueProcessor<T, S, H>
where
    T: Send + 'static,
    S: Send + Sync + 'static,
    H: PackageHandler<T, S>,
{
    core: Arc<Core<T, S, H>>,
    control: Mutex<Control>,
}

impl<T, S, H> AggregatingQueueProcessor<T, S, H>
where
    T: Send + 'static,
    S: Send + Sync + 'static,
    H: PackageHandler<T, S>,
{
    /// Create a processor in the `Created` state.
    ///
    /// Fails with a configuration error if any size or the timer period is zero.
    pub fn new(config: ProcessorConfig, source: Arc<S>, handler: H) -> Result<Self> {
        config.validate_config()?;

        let (intake_tx, intake_rx) = unbounded();
        let (processing_tx, processing_rx) = bounded(config.processing_queue_max_size);
        let (failures_tx, failures_rx) = bounded(FAILURE_CHANNEL_CAPACITY);

        info!(
            processor = %config.name,
            max_package_size = config.max_package_size,
            threads = config.processing_thread_count,
            queue_max_size = config.processing_queue_max_size,
            timer_period_ms = config.timer_period_ms,
            "Created aggregating queue processor"
        );

        Ok(Self {
            core: Arc::new(Core {
                config,
                lifecycle: Lifecycle::new(),
                intake_tx,
                intake_rx,
                processing_tx,
                processing_rx,
                packaging: Mutex::new(0),
                push_order: Mutex::new(()),
                stats: AtomicProcessorStats::default(),
                failures_tx,
                failures_rx,
                source,
                handler,
            }),
            control: Mutex::new(Control::default()),
        })
    }

    /// Enqueue one item.
    ///
    /// Never blocks on the intake queue. When the intake reaches
    /// `max_package_size` the caller forms the package itself and may block
    /// while the processing queue is full.
    pub fn add(&self, item: T) -> Result<()> {
        let _state = self.core.lifecycle.enter("add", State::Started)?;

        self.enqueue(item)?;
        self.core.stats.record_added(1);
        self.form_if_full();
        Ok(())
    }

    /// Enqueue many items, keeping their order
    pub fn add_collection<I>(&self, items: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
    {
        let _state = self.core.lifecycle.enter("add", State::Started)?;

        let mut added = 0u64;
        for item in items {
            self.enqueue(item)?;
            added += 1;
        }
        self.core.stats.record_added(added);
        self.form_if_full();
        Ok(())
    }

    /// Push a caller-assembled package straight onto the processing queue.
    ///
    /// The package may be processed ahead of items still waiting in the
    /// intake queue. Empty packages are ignored.
    pub fn add_package(&self, items: Vec<T>) -> Result<()> {
        let _state = self.core.lifecycle.enter("add_package", State::Started)?;

        let max = self.core.config.max_package_size;
        if items.len() > max {
            return Err(Error::PackageTooLarge {
                size: items.len(),
                max,
            });
        }
        if items.is_empty() {
            return Ok(());
        }

        let mut next_id = self.core.packaging.lock();
        let package = Package::new(*next_id, items);
        *next_id += 1;
        let _order = self.core.push_order.lock();
        drop(next_id);

        self.core.stats.record_added(package.len() as u64);
        self.core.push(package, Trigger::Manual)
    }

    /// Package and push everything currently queued.
    ///
    /// Returns the number of packages formed, zero when the intake is empty.
    pub fn force_flush(&self) -> Result<usize> {
        let _state = self.core.lifecycle.enter("flush", State::Started)?;
        Ok(self.core.form_and_push(Trigger::Manual))
    }

    /// Launch the workers and arm the timer.
    ///
    /// Resets the pushed and processed counters. Valid only in `Created`.
    pub fn start(&self) -> Result<()> {
        let mut control = self.control.lock();
        let state = self.core.lifecycle.current();
        if state != State::Created {
            return Err(Error::invalid_state("start", state));
        }

        let config = &self.core.config;
        self.core.stats.reset_processing();

        let core = Arc::clone(&self.core);
        let mut workers = WorkerPool::spawn(
            &config.name,
            config.processing_thread_count,
            self.core.processing_rx.clone(),
            move |package| core.process(package),
        )?;

        let core = Arc::clone(&self.core);
        let timer = match FlushTimer::spawn(&config.name, config.timer_period(), move || {
            core.on_tick()
        }) {
            Ok(timer) => timer,
            Err(e) => {
                workers.shutdown();
                return Err(e);
            }
        };

        control.workers = Some(workers);
        control.timer = Some(timer);
        if let Err(e) = self.core.lifecycle.transition("start", State::Started) {
            Self::release(&mut control);
            return Err(e);
        }

        info!(processor = %config.name, "Processor started");
        Ok(())
    }

    /// Disarm the timer, drain the intake, and wait for the workers to finish.
    ///
    /// Blocks until every queued package has been handled. Valid only in
    /// `Started`.
    pub fn stop(&self) -> Result<()> {
        let mut control = self.control.lock();
        self.stop_locked(&mut control)
    }

    fn stop_locked(&self, control: &mut Control) -> Result<()> {
        self.core.lifecycle.transition("stop", State::Stopping)?;
        let started = Instant::now();
        info!(
            processor = %self.core.config.name,
            pending_items = self.core.intake_rx.len(),
            "Stopping processor"
        );

        if let Some(mut timer) = control.timer.take() {
            timer.stop();
        }

        let drained = self.core.form_and_push(Trigger::Drain);

        if let Some(mut workers) = control.workers.take() {
            workers.shutdown();
        }

        self.core.lifecycle.transition("stop", State::Stopped)?;

        let stats = self.stats();
        info!(
            processor = %self.core.config.name,
            drained_packages = drained,
            added = stats.total_added_items,
            pushed = stats.total_pushed_items,
            processed = stats.total_processed_items,
            failed = stats.total_failed_items,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Processor stopped"
        );
        Ok(())
    }

    /// Stop if started, then move to `Disposed`. Safe to call repeatedly.
    pub fn dispose(&self) {
        let mut control = self.control.lock();

        match self.core.lifecycle.current() {
            State::Disposed => return,
            State::Started => {
                if let Err(e) = self.stop_locked(&mut control) {
                    warn!(processor = %self.core.config.name, error = %e, "Stop during dispose failed");
                }
            }
            _ => {}
        }

        Self::release(&mut control);
        if let Err(e) = self.core.lifecycle.transition("dispose", State::Disposed) {
            warn!(processor = %self.core.config.name, error = %e, "Dispose from unexpected state");
            return;
        }
        debug!(processor = %self.core.config.name, "Processor disposed");
    }

    fn release(control: &mut Control) {
        if let Some(mut timer) = control.timer.take() {
            timer.stop();
        }
        if let Some(mut workers) = control.workers.take() {
            workers.shutdown();
        }
    }

    fn enqueue(&self, item: T) -> Result<()> {
        self.core
            .intake_tx
            .send(item)
            .map_err(|_| Error::internal("intake queue disconnected"))
    }

    fn form_if_full(&self) {
        if self.core.intake_rx.len() >= self.core.config.max_package_size {
            self.core.form_and_push(Trigger::Threshold);
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> State {
        self.core.lifecycle.current()
    }

    /// Snapshot of counters and queue depths
    pub fn stats(&self) -> ProcessorStats {
        self.core.stats.snapshot(
            self.state(),
            self.current_queue_size(),
            self.pending_items(),
        )
    }

    /// Packages waiting in the processing queue
    pub fn current_queue_size(&self) -> usize {
        self.core.processing_rx.len()
    }

    /// Items waiting in the intake queue
    pub fn pending_items(&self) -> usize {
        self.core.intake_rx.len()
    }

    /// Items accepted since construction
    pub fn total_added_items(&self) -> u64 {
        self.stats().total_added_items
    }

    /// Items pushed to the processing queue since the last start
    pub fn total_pushed_items(&self) -> u64 {
        self.stats().total_pushed_items
    }

    /// Items handled successfully since the last start
    pub fn total_processed_items(&self) -> u64 {
        self.stats().total_processed_items
    }

    /// Maximum items per package
    pub fn max_package_size(&self) -> usize {
        self.core.config.max_package_size
    }

    /// Flush timer period
    pub fn timer_period(&self) -> Duration {
        self.core.config.timer_period()
    }

    /// Processor name
    pub fn name(&self) -> &str {
        &self.core.config.name
    }

    /// Processor configuration
    pub fn config(&self) -> &ProcessorConfig {
        &self.core.config
    }

    /// Connection source handed to the handler
    pub fn source(&self) -> &Arc<S> {
        &self.core.source
    }

    /// Reports of packages whose handler failed.
    ///
    /// Reports are buffered up to a fixed capacity; later ones are logged and
    /// dropped while nobody drains the channel.
    pub fn failures(&self) -> Receiver<PackageFailure> {
        self.core.failures_rx.clone()
    }
}

impl<T, S, H> Drop for AggregatingQueueProcessor<T, S, H>
where
    T: Send + 'static,
    S: Send + Sync + 'static,
    H: PackageHandler<T, S>,
{
    fn drop(&mut self) {
        self.dispose();
    }
}

impl<T, S, H> std::fmt::Debug for AggregatingQueueProcessor<T, S, H>
where
    T: Send + 'static,
    S: Send + Sync + 'static,
    H: PackageHandler<T, S>,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AggregatingQueueProcessor")
            .field("name", &self.core.config.name)
            .field("state", &self.state())
            .field("pending_items", &self.pending_items())
            .field("current_queue_size", &self.current_queue_size())
            .finish()
    }
}
