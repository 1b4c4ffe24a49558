//! Periodic poll scheduler.
//!
//! Emits a [`Tick`] every poll interval and whenever a refresh is requested
//! through the trigger channel. The controller answers each tick by
//! reconciling every Application it watches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;

/// Why a poll round starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tick {
    Interval,
    Refresh,
}

pub struct PollScheduler {
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    wake: Arc<Notify>,
}

impl PollScheduler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            wake: Arc::new(Notify::new()),
        }
    }

    /// Starts the poll loop. Ticks go to `ticks`; the loop ends when
    /// stopped or when the receiving side is dropped.
    pub fn start(
        &self,
        mut trigger_rx: broadcast::Receiver<()>,
        ticks: mpsc::Sender<Tick>,
    ) -> JoinHandle<()> {
        let shutdown = Arc::clone(&self.shutdown);
        let wake = Arc::clone(&self.wake);
        let interval = self.interval;

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            timer.tick().await; // the first tick fires immediately

            loop {
                if shutdown.load(Ordering::Acquire) {
                    break;
                }

                let tick = tokio::select! {
                    _ = timer.tick() => Tick::Interval,
                    trigger = trigger_rx.recv() => match trigger {
                        Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            log::info!("Refresh of all Applications requested");
                            Tick::Refresh
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = wake.notified() => continue,
                };

                if shutdown.load(Ordering::Acquire) {
                    break;
                }
                if ticks.send(tick).await.is_err() {
                    log::debug!("Tick receiver dropped; poll scheduler stopping");
                    break;
                }
            }
            log::debug!("Poll scheduler stopped");
        })
    }

    /// Signals the scheduler to stop.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_one();
    }
}
