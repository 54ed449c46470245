use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use super::JobObject;
use crate::Result;

pub const DEFAULT_POLL_PERIOD: Duration = Duration::from_secs(1);

type LimitCallback = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct LastSample {
    peak: Option<u64>,
    limit: Option<u64>,
}

/// Raises "memory limit reached" when a job's peak usage meets its limit.
///
/// Fires at most once per observed change of the peak or the limit, so a
/// job sitting at its limit is reported once rather than every period.
pub struct MemoryLimitMonitor {
    job: Arc<dyn JobObject>,
    period: Duration,
    last: Mutex<LastSample>,
    callbacks: RwLock<Vec<LimitCallback>>,
    poller: Mutex<Option<(Sender<()>, JoinHandle<()>)>>,
}

impl MemoryLimitMonitor {
    pub fn new(job: Arc<dyn JobObject>, period: Duration) -> Arc<Self> {
        Arc::new(Self {
            job,
            period,
            last: Mutex::new(LastSample::default()),
            callbacks: RwLock::new(Vec::new()),
            poller: Mutex::new(None),
        })
    }

    pub fn on_limit_reached(&self, callback: impl Fn() + Send + Sync + 'static) {
        self.callbacks.write().push(Arc::new(callback));
    }

    /// Sample the job once; returns whether subscribers were notified
    pub fn check(&self) -> Result<bool> {
        let mut last = self.last.lock();
        let peak = self.job.peak_memory_used()?;
        let limit = self.job.memory_limit()?;

        let changed = last.peak != Some(peak) || last.limit != Some(limit);
        last.peak = Some(peak);
        last.limit = Some(limit);

        if changed && limit > 0 && peak >= limit {
            drop(last);
            tracing::info!(job = ?self.job.name(), peak, limit, "job memory limit reached");
            let callbacks = self.callbacks.read().clone();
            for callback in callbacks {
                callback();
            }
            return Ok(true);
        }
        Ok(false)
    }

    /// Start periodic sampling; calling again is a no-op
    pub fn start(self: &Arc<Self>) {
        let mut poller = self.poller.lock();
        if poller.is_some() {
            return;
        }

        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let monitor: Weak<Self> = Arc::downgrade(self);
        let period = self.period;
        let handle = std::thread::Builder::new()
            .name("ironframe-memory-limit".into())
            .spawn(move || loop {
                match stop_rx.recv_timeout(period) {
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(monitor) = monitor.upgrade() else {
                            break;
                        };
                        if let Err(e) = monitor.check() {
                            tracing::debug!(error = %e, "memory limit sample failed");
                        }
                    }
                    _ => break,
                }
            });

        match handle {
            Ok(handle) => *poller = Some((stop_tx, handle)),
            Err(e) => tracing::warn!(error = %e, "failed to start memory limit monitor"),
        }
    }

    pub fn stop(&self) {
        if let Some((stop, handle)) = self.poller.lock().take() {
            let _ = stop.send(());
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for MemoryLimitMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}
