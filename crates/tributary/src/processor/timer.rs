//! Periodic flush signal

use crossbeam_channel::{bounded, select, tick, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Dedicated thread turning a ticker channel into flush calls.
///
/// The first flush happens one period after spawning.
pub(crate) struct FlushTimer {
    name: String,
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl FlushTimer {
    pub(crate) fn spawn<F>(name: &str, period: Duration, on_tick: F) -> Result<Self>
    where
        F: Fn() + Send + 'static,
    {
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let ticker = tick(period);

        let handle = thread::Builder::new()
            .name(format!("{}-timer", name))
            .spawn(move || loop {
                select! {
                    recv(ticker) -> _ => on_tick(),
                    recv(stop_rx) -> _ => break,
                }
            })
            .map_err(|e| Error::internal(format!("failed to spawn timer of {}: {}", name, e)))?;

        debug!(processor = %name, period_ms = period.as_millis() as u64, "Flush timer armed");
        Ok(Self {
            name: name.to_string(),
            stop: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Disarm the timer and wait for an in-progress flush to finish
    pub(crate) fn stop(&mut self) {
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!(processor = %self.name, "Timer thread panicked");
            }
            debug!(processor = %self.name, "Flush timer disarmed");
        }
    }
}

impl Drop for FlushTimer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_timer_ticks_until_stopped() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ticks);

        let mut timer = FlushTimer::spawn("test", Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        thread::sleep(Duration::from_millis(100));
        timer.stop();
        let after_stop = ticks.load(Ordering::SeqCst);
        assert!(after_stop >= 1);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(ticks.load(Ordering::SeqCst), after_stop);
    }
}
