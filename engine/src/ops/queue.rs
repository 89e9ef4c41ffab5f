//! In-process task queue
//!
//! Work is spawned on the tokio runtime and counted while in flight so
//! shutdown can wait for it to drain. Delayed tasks count from the moment
//! they are scheduled.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, error};

#[derive(Default)]
struct Counter {
    in_flight: AtomicUsize,
    idle: Notify,
}

/// Decrements the in-flight count when dropped, including on panic
struct InFlight(Arc<Counter>);

impl InFlight {
    fn new(counter: &Arc<Counter>) -> Self {
        counter.in_flight.fetch_add(1, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

#[derive(Clone, Default)]
pub struct TaskQueue {
    counter: Arc<Counter>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `task` as soon as a worker is free
    pub fn schedule_now<F>(&self, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = InFlight::new(&self.counter);
        tokio::spawn(async move {
            let output = task.await;
            drop(guard);
            output
        })
    }

    /// Run `task` once `delay` has elapsed
    pub fn schedule_after<F>(&self, delay: Duration, task: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        let guard = InFlight::new(&self.counter);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let output = task.await;
            drop(guard);
            output
        })
    }

    /// Spawn every task, then call `on_join` once with all results in task
    /// order. A task that panicked contributes `None`; siblings keep running.
    pub fn group_then_join<T, F, J, JF>(&self, tasks: Vec<F>, on_join: J) -> JoinHandle<()>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
        J: FnOnce(Vec<Option<T>>) -> JF + Send + 'static,
        JF: Future<Output = ()> + Send + 'static,
    {
        let handles: Vec<JoinHandle<T>> = tasks.into_iter().map(|t| self.schedule_now(t)).collect();
        debug!("Scheduled group of {} task(s)", handles.len());

        self.schedule_now(async move {
            let results = join_all(handles)
                .await
                .into_iter()
                .map(|r| match r {
                    Ok(value) => Some(value),
                    Err(e) => {
                        error!("Grouped task failed: {}", e);
                        None
                    }
                })
                .collect();
            on_join(results).await;
        })
    }

    pub fn in_flight(&self) -> usize {
        self.counter.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until nothing is in flight; false if `timeout` elapsed first
    pub async fn drain(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, async {
            loop {
                let idle = self.counter.idle.notified();
                if self.in_flight() == 0 {
                    return;
                }
                idle.await;
            }
        })
        .await
        .is_ok()
    }
}
