//! Periodic progress instrumentation
//!
//! Long archive and extract runs are silent for minutes at a time. Two
//! background timers make them observable:
//!
//! - [`sample_size`] reports the current size of a growing artifact
//! - [`heartbeat`] fires unconditionally with the elapsed time
//!
//! Both run on their own thread and return a [`Ticker`]. Stopping a ticker is
//! idempotent, safe from any thread (including the ticker's own callback) and
//! happens automatically on drop.

use crate::utils;
use parking_lot::{Condvar, Mutex};
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

#[derive(Default)]
struct Signal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Stop handle for a background timer
pub struct Ticker {
    label: String,
    signal: Arc<Signal>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Ticker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ticker")
            .field("label", &self.label)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl Ticker {
    /// Stop the timer and wait for its thread to exit
    ///
    /// Calling this more than once, or from inside the timer callback, is
    /// fine; the thread is only joined once and never by itself.
    pub fn stop(&self) {
        {
            let mut stopped = self.signal.stopped.lock();
            *stopped = true;
        }
        self.signal.wake.notify_all();

        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!("Timer {} panicked", self.label);
            }
        }
    }

    /// Whether [`Ticker::stop`] has been called or the callback finished
    pub fn is_stopped(&self) -> bool {
        *self.signal.stopped.lock()
    }

    /// Timer label used in logs
    pub fn label(&self) -> &str {
        &self.label
    }
}

impl Drop for Ticker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run `tick` every `interval` until stopped or until it returns `Break`
///
/// The first call happens one interval after start.
pub fn every<F>(label: impl Into<String>, interval: Duration, mut tick: F) -> Ticker
where
    F: FnMut() -> ControlFlow<()> + Send + 'static,
{
    let label = label.into();
    let signal = Arc::new(Signal::default());
    let thread_signal = Arc::clone(&signal);
    let thread_label = label.clone();

    let spawned = thread::Builder::new()
        .name(format!("coldsnap-{}", label))
        .spawn(move || loop {
            {
                let deadline = Instant::now() + interval;
                let mut stopped = thread_signal.stopped.lock();
                while !*stopped {
                    if thread_signal.wake.wait_until(&mut stopped, deadline).timed_out() {
                        break;
                    }
                }
                if *stopped {
                    break;
                }
            }
            trace!("Timer {} tick", thread_label);
            if tick().is_break() {
                *thread_signal.stopped.lock() = true;
                break;
            }
        });

    let handle = match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!("Failed to start timer {}: {}", label, e);
            *signal.stopped.lock() = true;
            None
        }
    };

    Ticker {
        label,
        signal,
        handle: Mutex::new(handle),
    }
}

/// Periodically report the size of `path`
///
/// A path that does not exist yet reports `0`; directories report the
/// recursive size of their files.
pub fn sample_size<F>(path: impl Into<PathBuf>, interval: Duration, on_sample: F) -> Ticker
where
    F: Fn(u64) + Send + 'static,
{
    let path = path.into();
    every("sampler", interval, move || {
        on_sample(utils::path_size(&path));
        ControlFlow::Continue(())
    })
}

/// Periodically report the time elapsed since start
pub fn heartbeat<F>(interval: Duration, on_tick: F) -> Ticker
where
    F: Fn(Duration) + Send + 'static,
{
    let started = Instant::now();
    every("heartbeat", interval, move || {
        on_tick(started.elapsed());
        ControlFlow::Continue(())
    })
}
