use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

#[cfg(feature = "metrics")]
fn metric_gauge(name: &'static str, subscription: &str, value: usize) {
    metrics::gauge!(name, value as f64, "subscription" => subscription.to_string());
}

#[cfg(not(feature = "metrics"))]
fn metric_gauge(_name: &'static str, _subscription: &str, _value: usize) {}

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Default)]
struct Counters {
    queued: AtomicUsize,
    in_flight: AtomicUsize,
}

impl Counters {
    fn publish(&self, subscription: &str) {
        metric_gauge("webhook_relay.dispatch.backlog", subscription, self.queued.load(Ordering::SeqCst));
        metric_gauge("webhook_relay.dispatch.in_flight", subscription, self.in_flight.load(Ordering::SeqCst));
    }
}

/// Bounded-concurrency gate for fire-and-forget deliveries.
///
/// Submissions are admitted in FIFO order by a single admission loop; at
/// most `max_parallel` run at once. There is no back-pressure towards the
/// submitter: the queue is unbounded and its depth is only observable
/// through [`DispatchLimiter::backlog`].
///
/// Must be created inside a tokio runtime.
pub struct DispatchLimiter {
    tx: mpsc::UnboundedSender<Job>,
    counters: Arc<Counters>,
    max_parallel: usize,
    subscription: Arc<str>,
}

impl DispatchLimiter {
    pub fn new(subscription: impl Into<String>, max_parallel: usize) -> Self {
        let max_parallel = max_parallel.max(1);
        let subscription: Arc<str> = Arc::from(subscription.into());
        let counters = Arc::new(Counters::default());
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(admission_loop(
            rx,
            Arc::new(Semaphore::new(max_parallel)),
            counters.clone(),
            subscription.clone(),
        ));

        Self {
            tx,
            counters,
            max_parallel,
            subscription,
        }
    }

    /// Queue `task`. Returns immediately; the task's result is discarded.
    pub fn submit<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.counters.queued.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(Box::pin(task)).is_err() {
            self.counters.queued.fetch_sub(1, Ordering::SeqCst);
            warn!(subscription = %self.subscription, "dispatch limiter stopped, dropping delivery");
            return;
        }
        self.counters.publish(&self.subscription);
    }

    /// Tasks waiting for a slot.
    pub fn backlog(&self) -> usize {
        self.counters.queued.load(Ordering::SeqCst)
    }

    /// Tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }
}

/// Holds a slot for one running task; releases it even if the task panics.
struct Slot {
    _permit: OwnedSemaphorePermit,
    counters: Arc<Counters>,
    subscription: Arc<str>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.counters.publish(&self.subscription);
    }
}

async fn admission_loop(
    mut rx: mpsc::UnboundedReceiver<Job>,
    semaphore: Arc<Semaphore>,
    counters: Arc<Counters>,
    subscription: Arc<str>,
) {
    while let Some(job) = rx.recv().await {
        let Ok(permit) = semaphore.clone().acquire_owned().await else {
            break;
        };

        counters.queued.fetch_sub(1, Ordering::SeqCst);
        counters.in_flight.fetch_add(1, Ordering::SeqCst);
        counters.publish(&subscription);

        let slot = Slot {
            _permit: permit,
            counters: counters.clone(),
            subscription: subscription.clone(),
        };
        tokio::spawn(async move {
            job.await;
            drop(slot);
        });
    }
    debug!(subscription = %subscription, "dispatch limiter closed");
}
