//! Scheduling signals for the periodic fetch tasks

use crate::config::FetcherConfig;
use crate::types::{now_millis, Timepoint};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

/// Periodic task types, one signal stream each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TaskKind {
    OrderBook,
    AuthData,
    Rates,
    Block,
    ReferencePrices,
}

impl TaskKind {
    pub const ALL: [TaskKind; 5] = [
        TaskKind::OrderBook,
        TaskKind::AuthData,
        TaskKind::Rates,
        TaskKind::Block,
        TaskKind::ReferencePrices,
    ];
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskKind::OrderBook => "order_book",
            TaskKind::AuthData => "auth_data",
            TaskKind::Rates => "rates",
            TaskKind::Block => "block",
            TaskKind::ReferencePrices => "reference_prices",
        };
        f.write_str(s)
    }
}

/// Read side of a signal stream; each message is the tick's timepoint
pub type TickReceiver = mpsc::Receiver<Timepoint>;

pub trait Scheduler: Send + Sync {
    /// Take the signal stream of `task`. Each stream can be taken once.
    fn signal(&self, task: TaskKind) -> Option<TickReceiver>;

    fn start(&self);

    /// Stop emitting; receivers observe the stream closing
    fn stop(&self);
}

/// Tokio-interval scheduler.
///
/// Every stream has capacity 1 and ticks are offered with `try_send`, so a
/// tick that fires while the consumer is still busy with the previous cycle
/// is dropped instead of queued.
pub struct IntervalScheduler {
    intervals: HashMap<TaskKind, Duration>,
    senders: Mutex<HashMap<TaskKind, mpsc::Sender<Timepoint>>>,
    receivers: Mutex<HashMap<TaskKind, TickReceiver>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl IntervalScheduler {
    pub fn new(intervals: HashMap<TaskKind, Duration>) -> Self {
        let mut senders = HashMap::new();
        let mut receivers = HashMap::new();
        for task in intervals.keys() {
            let (tx, rx) = mpsc::channel(1);
            senders.insert(*task, tx);
            receivers.insert(*task, rx);
        }

        Self {
            intervals,
            senders: Mutex::new(senders),
            receivers: Mutex::new(receivers),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(config: &FetcherConfig) -> Self {
        let intervals = HashMap::from([
            (TaskKind::OrderBook, Duration::from_millis(config.order_book_interval_ms)),
            (TaskKind::AuthData, Duration::from_millis(config.auth_interval_ms)),
            (TaskKind::Rates, Duration::from_millis(config.rate_interval_ms)),
            (TaskKind::Block, Duration::from_millis(config.block_interval_ms)),
            (
                TaskKind::ReferencePrices,
                Duration::from_millis(config.reference_interval_ms),
            ),
        ]);
        Self::new(intervals)
    }
}

impl Scheduler for IntervalScheduler {
    fn signal(&self, task: TaskKind) -> Option<TickReceiver> {
        self.receivers.lock().remove(&task)
    }

    fn start(&self) {
        let senders: Vec<_> = self.senders.lock().drain().collect();
        let mut handles = self.handles.lock();

        for (task, tx) in senders {
            let period = match self.intervals.get(&task) {
                Some(period) => *period,
                None => continue,
            };

            handles.push(tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    match tx.try_send(now_millis()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            debug!(task = %task, "Previous cycle still running, tick skipped");
                        }
                        Err(TrySendError::Closed(_)) => break,
                    }
                }
            }));
        }

        info!(tasks = handles.len(), "⏱️ Scheduler started");
    }

    fn stop(&self) {
        for handle in self.handles.lock().drain(..) {
            handle.abort();
        }
        self.senders.lock().clear();
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_busy_consumer_skips_ticks() {
        let scheduler = IntervalScheduler::new(HashMap::from([(
            TaskKind::Block,
            Duration::from_millis(100),
        )]));
        let mut rx = scheduler.signal(TaskKind::Block).unwrap();
        assert!(scheduler.signal(TaskKind::Block).is_none());

        scheduler.start();
        // Nobody consumes for ten periods; only one tick may be buffered.
        tokio::time::sleep(Duration::from_millis(1_000)).await;

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        scheduler.stop();
        tokio::task::yield_now().await;
        assert!(rx.recv().await.is_none());
    }
}
