//! Cancellable background tasks
//!
//! A `ScheduledTask` owns its ticker loop: it stops when the owner cancels
//! it, when the tick asks to stop, or when the handle is dropped.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

/// Returned by a periodic tick to keep going or end the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskControl {
    Continue,
    Stop,
}

pub struct ScheduledTask {
    name: String,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl ScheduledTask {
    /// Runs `tick` every `period`, first after one full period.
    pub fn spawn_periodic<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = TaskControl> + Send + 'static,
    {
        let name = name.into();
        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let task_name = name.clone();
        let period = period.max(Duration::from_millis(1));

        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if tick().await == TaskControl::Stop {
                            debug!(task = %task_name, "Scheduled task finished");
                            break;
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        info!(task = %name, period_ms = period.as_millis() as u64, "Scheduled task started");
        ScheduledTask {
            name,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| h.is_finished())
    }

    /// Signals the loop and waits for it to exit. A tick already in flight
    /// completes first.
    pub async fn cancel(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!(task = %self.name, "Scheduled task cancelled");
    }
}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.shutdown.send(true);
            handle.abort();
        }
    }
}
