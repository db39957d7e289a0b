//! Background worker driving periodic and on-demand engine tasks.
//!
//! A single tokio task owns the [`BackgroundRunnable`], so ticks and tasks
//! never run concurrently with each other. Ticks that come due while a
//! previous tick is still running are skipped rather than queued
//! (`MissedTickBehavior::Skip`).

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;

/// Capacity of the on-demand task channel.
const TASK_CHANNEL_CAPACITY: usize = 64;

// ---------------------------------------------------------------------------
// BackgroundRunnable trait
// ---------------------------------------------------------------------------

/// Work executed by a [`BackgroundWorker`].
#[async_trait]
pub trait BackgroundRunnable: Send + 'static {
    /// On-demand task type.
    type Task: Send + 'static;

    /// Handle one submitted task.
    async fn run(&mut self, task: Self::Task);

    /// Called once per tick interval. Default is a no-op.
    async fn on_tick(&mut self) {}

    /// Called once when the worker stops. Default is a no-op.
    async fn shutdown(&mut self) {}
}

// ---------------------------------------------------------------------------
// BackgroundWorker
// ---------------------------------------------------------------------------

/// Handle to a spawned worker task.
pub struct BackgroundWorker<R: BackgroundRunnable> {
    tx: Option<mpsc::Sender<R::Task>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<R: BackgroundRunnable> BackgroundWorker<R> {
    /// Spawns the worker on the current tokio runtime.
    ///
    /// The first tick fires one full interval after start, not immediately.
    pub fn start(mut runnable: R, tick_interval: Duration) -> Self {
        let (tx, mut rx) = mpsc::channel::<R::Task>(TASK_CHANNEL_CAPACITY);
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + tick_interval;
            let mut ticker = tokio::time::interval_at(start, tick_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    task = rx.recv() => match task {
                        Some(task) => runnable.run(task).await,
                        None => break,
                    },
                    _ = ticker.tick() => runnable.on_tick().await,
                }
            }

            runnable.shutdown().await;
        });

        Self {
            tx: Some(tx),
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    /// Clone of the task sender, for submitting without holding a borrow of
    /// the worker across an await. `None` once stopped.
    #[must_use]
    pub fn sender(&self) -> Option<mpsc::Sender<R::Task>> {
        self.tx.clone()
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signals shutdown and waits for the worker task to finish.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        self.tx.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[derive(Clone, Default)]
    struct Counters {
        runs: Arc<AtomicU32>,
        ticks: Arc<AtomicU32>,
        shutdowns: Arc<AtomicU32>,
    }

    struct CountingRunnable {
        counters: Counters,
        tick_delay: Duration,
    }

    #[async_trait]
    impl BackgroundRunnable for CountingRunnable {
        type Task = u32;

        async fn run(&mut self, _task: u32) {
            self.counters.runs.fetch_add(1, Ordering::SeqCst);
        }

        async fn on_tick(&mut self) {
            self.counters.ticks.fetch_add(1, Ordering::SeqCst);
            if !self.tick_delay.is_zero() {
                tokio::time::sleep(self.tick_delay).await;
            }
        }

        async fn shutdown(&mut self) {
            self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn runnable(counters: &Counters, tick_delay: Duration) -> CountingRunnable {
        CountingRunnable {
            counters: counters.clone(),
            tick_delay,
        }
    }

    #[tokio::test]
    async fn submitted_tasks_run_and_stop_calls_shutdown() {
        let counters = Counters::default();
        let mut worker =
            BackgroundWorker::start(runnable(&counters, Duration::ZERO), Duration::from_secs(60));

        let tx = worker.sender().unwrap();
        for task in 0..3 {
            tx.send(task).await.unwrap();
        }
        drop(tx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(counters.runs.load(Ordering::SeqCst), 3);
        assert!(worker.is_running());

        worker.stop().await;
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
        assert!(!worker.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_fire_on_interval() {
        let counters = Counters::default();
        let mut worker =
            BackgroundWorker::start(runnable(&counters, Duration::ZERO), Duration::from_millis(20));

        tokio::time::sleep(Duration::from_millis(105)).await;
        worker.stop().await;

        assert_eq!(counters.ticks.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_tick_skips_instead_of_piling_up() {
        let counters = Counters::default();
        // Each tick takes 3.5 intervals; skipped ticks must not be replayed.
        let mut worker = BackgroundWorker::start(
            runnable(&counters, Duration::from_millis(35)),
            Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(100)).await;
        worker.stop().await;

        let ticks = counters.ticks.load(Ordering::SeqCst);
        assert!(ticks <= 3, "expected at most 3 ticks, got {ticks}");
        assert!(ticks >= 2);
    }

    #[tokio::test]
    async fn no_sender_after_stop() {
        let counters = Counters::default();
        let mut worker =
            BackgroundWorker::start(runnable(&counters, Duration::ZERO), Duration::from_secs(60));
        assert!(worker.sender().is_some());
        worker.stop().await;

        assert!(worker.sender().is_none());
        assert!(!worker.is_running());
    }
}
