//! Serial execution context for everything that touches UI observers.
//!
//! Producers on any task or thread hand closures to a [`MainContext`];
//! a single [`MainQueue`] runs them one at a time, in submission order.

use std::panic::{AssertUnwindSafe, catch_unwind};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send>;

/// Cloneable handle used to submit work to the main queue.
#[derive(Clone)]
pub struct MainContext {
    tx: mpsc::UnboundedSender<Job>,
}

/// Receiving side of a [`MainContext`]. The host drives it from its UI
/// loop, or lets [`MainContext::spawn`] run it on tokio.
pub struct MainQueue {
    rx: mpsc::UnboundedReceiver<Job>,
}

impl MainContext {
    /// Creates a context and the queue that executes its jobs.
    pub fn channel() -> (Self, MainQueue) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, MainQueue { rx })
    }

    /// Creates a context whose queue runs on a spawned tokio task.
    pub fn spawn() -> (Self, JoinHandle<()>) {
        let (ctx, queue) = Self::channel();
        let handle = tokio::spawn(queue.run());
        (ctx, handle)
    }

    /// Submits a job. Never blocks. Returns `false` if the queue is gone.
    pub fn dispatch(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(job)).is_ok()
    }

    /// Resolves once every job submitted before this call has run.
    pub async fn barrier(&self) {
        let (tx, rx) = oneshot::channel();
        if self.dispatch(move || {
            let _ = tx.send(());
        }) {
            let _ = rx.await;
        }
    }
}

impl MainQueue {
    /// Runs jobs until every [`MainContext`] handle is dropped.
    pub async fn run(mut self) {
        while let Some(job) = self.rx.recv().await {
            run_job(job);
        }
        debug!("main queue closed");
    }

    /// Runs the jobs that are already queued, without waiting.
    /// Returns how many ran.
    pub fn drain_pending(&mut self) -> usize {
        let mut ran = 0;
        while let Ok(job) = self.rx.try_recv() {
            run_job(job);
            ran += 1;
        }
        ran
    }
}

fn run_job(job: Job) {
    if catch_unwind(AssertUnwindSafe(job)).is_err() {
        error!("main context job panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let (ctx, _handle) = MainContext::spawn();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let s = Arc::clone(&seen);
            ctx.dispatch(move || s.lock().unwrap().push(i));
        }
        ctx.barrier().await;
        assert_eq!(*seen.lock().unwrap(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn panicking_job_does_not_stop_the_queue() {
        let (ctx, _handle) = MainContext::spawn();
        let seen = Arc::new(Mutex::new(0));
        ctx.dispatch(|| panic!("boom"));
        let s = Arc::clone(&seen);
        ctx.dispatch(move || *s.lock().unwrap() += 1);
        ctx.barrier().await;
        assert_eq!(*seen.lock().unwrap(), 1);
    }

    #[test]
    fn drain_pending_runs_queued_jobs() {
        let (ctx, mut queue) = MainContext::channel();
        let seen = Arc::new(Mutex::new(0));
        for _ in 0..3 {
            let s = Arc::clone(&seen);
            ctx.dispatch(move || *s.lock().unwrap() += 1);
        }
        assert_eq!(queue.drain_pending(), 3);
        assert_eq!(*seen.lock().unwrap(), 3);
        assert_eq!(queue.drain_pending(), 0);
    }
}
