//! Fixed-size worker pool draining the processing queue

use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

use super::Package;
use crate::error::{Error, Result};

/// OS threads pulling packages off the processing queue.
///
/// Each worker takes one package at a time and runs it to completion before
/// looking at the shutdown signal again. Once shutdown is signalled, workers
/// empty whatever is still queued and exit.
pub(crate) struct WorkerPool {
    name: String,
    shutdown: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn spawn<T, F>(
        name: &str,
        count: usize,
        queue: Receiver<Package<T>>,
        process: F,
    ) -> Result<Self>
    where
        T: Send + 'static,
        F: Fn(Package<T>) + Send + Sync + 'static,
    {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let process = Arc::new(process);
        let mut pool = Self {
            name: name.to_string(),
            shutdown: Some(shutdown_tx),
            handles: Vec::with_capacity(count),
        };

        for index in 0..count {
            let queue = queue.clone();
            let shutdown = shutdown_rx.clone();
            let process = Arc::clone(&process);

            let spawned = thread::Builder::new()
                .name(format!("{}-worker-{}", name, index))
                .spawn(move || run(queue, shutdown, process.as_ref()));

            match spawned {
                Ok(handle) => pool.handles.push(handle),
                Err(e) => {
                    pool.shutdown();
                    return Err(Error::internal(format!(
                        "failed to spawn worker {} of {}: {}",
                        index, name, e
                    )));
                }
            }
        }

        debug!(processor = %name, workers = count, "Workers started");
        Ok(pool)
    }

    /// Signal shutdown and wait for every worker to exit
    pub(crate) fn shutdown(&mut self) {
        // Dropping the only sender disconnects the channel, which wakes every worker.
        self.shutdown.take();

        for handle in self.handles.drain(..) {
            if handle.join().is_err() {
                warn!(processor = %self.name, "Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run<T, F>(queue: Receiver<Package<T>>, shutdown: Receiver<()>, process: &F)
where
    F: Fn(Package<T>),
{
    loop {
        select! {
            recv(queue) -> package => match package {
                Ok(package) => process(package),
                Err(_) => break,
            },
            recv(shutdown) -> _ => {
                while let Ok(package) = queue.try_recv() {
                    process(package);
                }
                break;
            }
        }
    }
}
