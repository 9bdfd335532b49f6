//! Worker-pool dispatcher.
//!
//! A [`PooledDispatcher`] owns a fixed set of tokio worker tasks that share
//! one unbounded queue. Every enqueue is counted by a [`CompletionTracker`];
//! workers mark each item done after handling it, whether or not the handler
//! succeeded, so [`join`](Dispatcher::join) returns once all known and
//! recursively generated work has been handled.
//!
//! # Failure semantics
//!
//! A handler error or panic ends the worker that hosted it. The worker is
//! not restarted and its queue share is picked up by the surviving workers;
//! pool capacity silently shrinks.
//!
//! # Shutdown
//!
//! [`close`](Dispatcher::close) first waits for outstanding work, so items
//! posted by a busy worker are not stranded behind stop sentinels. It then
//! sends one sentinel per live worker and waits briefly, repeating with
//! whoever is still alive. A single round is not enough when workers are busy
//! or mid-dequeue while sentinels go out.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use super::completion::CompletionTracker;
use super::dispatcher::Dispatcher;
use super::handler::{Handler, HandlerError};
use super::{Bus, BusError, BusResult, Message, WeakBus};

/// Attempts made to mark an item done before forcing the counter forward.
pub const DONE_ATTEMPTS: usize = 10;

/// Pause between rejected completion attempts.
pub const DONE_RETRY_DELAY: Duration = Duration::from_millis(10);

/// How long a shutdown round waits for each worker it signalled.
pub const STOP_WAIT: Duration = Duration::from_millis(100);

enum Envelope {
    Work(Message),
    Stop,
}

type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Envelope>>>;

/// Decrements the live-worker count when a worker task ends, however it ends.
struct LiveGuard(Arc<watch::Sender<usize>>);

impl Drop for LiveGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

/// Dispatcher that fans messages out to a pool of worker tasks.
pub struct PooledDispatcher {
    handler: Arc<dyn Handler>,
    tracker: Arc<CompletionTracker>,
    sender: mpsc::UnboundedSender<Envelope>,
    receiver: SharedReceiver,
    pool_size: usize,
    started: AtomicBool,
    live: Arc<watch::Sender<usize>>,
}

impl PooledDispatcher {
    /// Creates the dispatcher and its worker slots without starting them.
    ///
    /// The pool holds `min(handler.worker_limit() or degree, degree)`
    /// workers, and never fewer than one.
    pub fn new(handler: Arc<dyn Handler>, degree: usize) -> Self {
        let pool_size = handler
            .worker_limit()
            .map_or(degree, |limit| limit.min(degree))
            .max(1);
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            handler,
            tracker: Arc::new(CompletionTracker::new()),
            sender,
            receiver: Arc::new(tokio::sync::Mutex::new(receiver)),
            pool_size,
            started: AtomicBool::new(false),
            live: Arc::new(watch::Sender::new(0)),
        }
    }

    /// Number of workers created for this pool.
    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Number of started workers that have not exited.
    pub fn live_workers(&self) -> usize {
        *self.live.borrow()
    }

    /// The completion tracker backing `join`.
    pub fn tracker(&self) -> &CompletionTracker {
        &self.tracker
    }

    /// Stops every worker and returns the number of sentinel rounds it took.
    ///
    /// Outstanding work is not waited for; see [`close`](Dispatcher::close).
    pub async fn shutdown(&self) -> usize {
        let mut live = self.live.subscribe();
        let mut rounds = 0;
        loop {
            let alive = *live.borrow_and_update();
            if alive == 0 {
                return rounds;
            }
            rounds += 1;
            for _ in 0..alive {
                let _ = self.sender.send(Envelope::Stop);
            }
            let wait = STOP_WAIT * alive as u32;
            if tokio::time::timeout(wait, live.wait_for(|n| *n == 0))
                .await
                .is_err()
            {
                debug!(
                    round = rounds,
                    remaining = self.live_workers(),
                    "Workers still alive after stop round"
                );
            }
        }
    }
}

#[async_trait]
impl Dispatcher for PooledDispatcher {
    fn start(&self, bus: &Bus) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        for id in 0..self.pool_size {
            self.live.send_modify(|n| *n += 1);
            let worker = run_worker(
                id,
                self.handler.clone(),
                self.receiver.clone(),
                self.tracker.clone(),
                bus.downgrade(),
                LiveGuard(self.live.clone()),
            );
            tokio::spawn(worker);
        }
        info!(workers = self.pool_size, "Started worker pool");
    }

    fn accepts(&self, name: &str) -> bool {
        self.handler.accepts(name)
    }

    async fn receive(&self, _bus: &Bus, message: Message) -> BusResult<()> {
        self.tracker.task_added();
        self.sender.send(Envelope::Work(message)).map_err(|e| {
            self.tracker.force_task_done();
            let name = match e.0 {
                Envelope::Work(message) => message.name().to_string(),
                Envelope::Stop => String::new(),
            };
            BusError::Closed(name)
        })
    }

    async fn join(&self) {
        self.tracker.wait_idle().await;
    }

    async fn settle(&self) {
        let mut live = self.live.subscribe();
        tokio::select! {
            _ = self.tracker.wait_idle() => {}
            _ = live.wait_for(|n| *n == 0) => {
                if self.tracker.in_flight() > 0 {
                    warn!(
                        abandoned = self.tracker.in_flight(),
                        "No live workers left, abandoning queued work"
                    );
                }
            }
        }
    }

    /// Work still queued when the last worker has crashed is abandoned.
    async fn close(&self) {
        self.settle().await;
        let rounds = self.shutdown().await;
        if rounds > 1 {
            warn!(rounds, "Worker pool needed several stop rounds to shut down");
        }
    }
}

async fn run_worker(
    id: usize,
    handler: Arc<dyn Handler>,
    queue: SharedReceiver,
    tracker: Arc<CompletionTracker>,
    bus: WeakBus,
    _live: LiveGuard,
) {
    debug!(worker = id, "Worker started");
    loop {
        let envelope = queue.lock().await.recv().await;
        let message = match envelope {
            Some(Envelope::Work(message)) => message,
            Some(Envelope::Stop) | None => {
                debug!(worker = id, "Worker stopping");
                return;
            }
        };

        let Some(bus) = bus.upgrade() else {
            warn!(worker = id, %message, "Bus dropped before message was handled");
            mark_done(&tracker).await;
            return;
        };

        let outcome = AssertUnwindSafe(handler.handle(&bus, &message))
            .catch_unwind()
            .await;
        drop(bus);
        mark_done(&tracker).await;

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(worker = id, %message, "Handler failed, worker exiting: {}", e);
                return;
            }
            Err(payload) => {
                let e = HandlerError::Panicked(panic_message(payload.as_ref()));
                error!(worker = id, %message, "Handler failed, worker exiting: {}", e);
                return;
            }
        }
    }
}

/// Marks one item done, retrying rejected completions before forcing the
/// counter forward so that `join` cannot hang on a lost completion.
async fn mark_done(tracker: &CompletionTracker) {
    for attempt in 1..=DONE_ATTEMPTS {
        match tracker.try_task_done() {
            Ok(()) => return,
            Err(e) => {
                debug!(attempt, "Completion rejected: {}", e);
                tokio::time::sleep(DONE_RETRY_DELAY).await;
            }
        }
    }
    warn!(
        attempts = DONE_ATTEMPTS,
        "Completion kept being rejected, forcing the counter forward"
    );
    tracker.force_task_done();
}

/// Extracts a readable message from a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::bus::HandlerResult;

    const TYPES: &[&str] = &["work", "boom", "slow"];

    struct Counter {
        handled: AtomicUsize,
        limit: Option<usize>,
    }

    impl Counter {
        fn new(limit: Option<usize>) -> Arc<Self> {
            Arc::new(Self {
                handled: AtomicUsize::new(0),
                limit,
            })
        }
    }

    #[async_trait]
    impl Handler for Counter {
        fn messages(&self) -> &[&str] {
            TYPES
        }

        fn worker_limit(&self) -> Option<usize> {
            self.limit
        }

        async fn handle(&self, _bus: &Bus, message: &Message) -> HandlerResult<()> {
            match message.name() {
                "boom" => Err(HandlerError::Other(anyhow::anyhow!("boom"))),
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    self.handled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                _ => {
                    self.handled.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        }
    }

    async fn wait_for_live(pool: &PooledDispatcher, expected: usize) {
        for _ in 0..100 {
            if pool.live_workers() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} live workers, found {}", expected, pool.live_workers());
    }

    #[test]
    fn test_pool_size_capped_by_worker_limit() {
        assert_eq!(PooledDispatcher::new(Counter::new(None), 4).pool_size(), 4);
        assert_eq!(PooledDispatcher::new(Counter::new(Some(1)), 4).pool_size(), 1);
        assert_eq!(PooledDispatcher::new(Counter::new(Some(8)), 4).pool_size(), 4);
        assert_eq!(PooledDispatcher::new(Counter::new(Some(0)), 4).pool_size(), 1);
    }

    #[tokio::test]
    async fn test_workers_not_running_before_start() {
        let pool = PooledDispatcher::new(Counter::new(None), 3);
        assert_eq!(pool.pool_size(), 3);
        assert_eq!(pool.live_workers(), 0);

        let bus = Bus::new(TYPES, Vec::new(), 3);
        pool.start(&bus);
        assert_eq!(pool.live_workers(), 3);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_every_item_handled_once() {
        let counter = Counter::new(None);
        let bus = Bus::new(TYPES, Vec::new(), 4);
        let pool = PooledDispatcher::new(counter.clone(), 4);
        pool.start(&bus);

        for _ in 0..50 {
            pool.receive(&bus, Message::new("work")).await.unwrap();
        }
        pool.join().await;

        assert_eq!(counter.handled.load(Ordering::SeqCst), 50);
        assert_eq!(pool.tracker().in_flight(), 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_handler_error_shrinks_pool() {
        let counter = Counter::new(None);
        let bus = Bus::new(TYPES, Vec::new(), 2);
        let pool = PooledDispatcher::new(counter.clone(), 2);
        pool.start(&bus);

        pool.receive(&bus, Message::new("boom")).await.unwrap();
        for _ in 0..5 {
            pool.receive(&bus, Message::new("work")).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), pool.join())
            .await
            .expect("join should return after a worker crash");

        assert_eq!(counter.handled.load(Ordering::SeqCst), 5);
        wait_for_live(&pool, 1).await;
        pool.close().await;
        assert_eq!(pool.live_workers(), 0);
        assert_eq!(pool.pool_size(), 2);
    }

    #[tokio::test]
    async fn test_close_drains_queued_work() {
        let counter = Counter::new(Some(1));
        let bus = Bus::new(TYPES, Vec::new(), 1);
        let pool = PooledDispatcher::new(counter.clone(), 1);
        pool.start(&bus);

        pool.receive(&bus, Message::new("slow")).await.unwrap();
        for _ in 0..3 {
            pool.receive(&bus, Message::new("work")).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), pool.close())
            .await
            .expect("close should converge");

        assert_eq!(counter.handled.load(Ordering::SeqCst), 4);
        assert_eq!(pool.tracker().in_flight(), 0);
        assert_eq!(pool.live_workers(), 0);
    }

    #[tokio::test]
    async fn test_close_returns_when_every_worker_crashed() {
        let counter = Counter::new(Some(1));
        let bus = Bus::new(TYPES, Vec::new(), 1);
        let pool = PooledDispatcher::new(counter.clone(), 1);
        pool.start(&bus);

        pool.receive(&bus, Message::new("boom")).await.unwrap();
        pool.receive(&bus, Message::new("work")).await.unwrap();
        wait_for_live(&pool, 0).await;

        tokio::time::timeout(Duration::from_secs(5), pool.close())
            .await
            .expect("close should not wait on a pool with no workers");
        assert_eq!(pool.tracker().in_flight(), 1);
        assert_eq!(counter.handled.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_join_survives_rejected_completions() {
        let counter = Counter::new(None);
        let bus = Bus::new(TYPES, Vec::new(), 2);
        let pool = PooledDispatcher::new(counter.clone(), 2);
        pool.start(&bus);

        // Fewer rejections than the retry bound: every completion lands.
        pool.tracker().inject_spurious_rejections(DONE_ATTEMPTS - 1);
        for _ in 0..3 {
            pool.receive(&bus, Message::new("work")).await.unwrap();
        }
        tokio::time::timeout(Duration::from_secs(5), pool.join())
            .await
            .expect("join should not hang on transient rejections");
        assert_eq!(pool.tracker().in_flight(), 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_join_forces_past_exhausted_retries() {
        let counter = Counter::new(Some(1));
        let bus = Bus::new(TYPES, Vec::new(), 1);
        let pool = PooledDispatcher::new(counter.clone(), 1);
        pool.start(&bus);

        pool.tracker().inject_spurious_rejections(DONE_ATTEMPTS * 2);
        pool.receive(&bus, Message::new("work")).await.unwrap();
        pool.receive(&bus, Message::new("work")).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), pool.join())
            .await
            .expect("join should not hang when retries are exhausted");
        assert_eq!(counter.handled.load(Ordering::SeqCst), 2);
        assert_eq!(pool.tracker().in_flight(), 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn test_close_converges_with_busy_worker() {
        let counter = Counter::new(Some(1));
        let bus = Bus::new(TYPES, Vec::new(), 1);
        let pool = PooledDispatcher::new(counter.clone(), 1);
        pool.start(&bus);

        pool.receive(&bus, Message::new("slow")).await.unwrap();
        // Let the worker pick the item up before shutting down.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let rounds = tokio::time::timeout(Duration::from_secs(5), pool.shutdown())
            .await
            .expect("shutdown should converge");

        assert!(rounds >= 2, "busy worker should need more than one round");
        assert_eq!(pool.live_workers(), 0);
        assert_eq!(counter.handled.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_join_after_close_returns() {
        let bus = Bus::new(TYPES, Vec::new(), 2);
        let pool = PooledDispatcher::new(Counter::new(None), 2);
        pool.start(&bus);
        pool.close().await;

        tokio::time::timeout(Duration::from_secs(1), pool.join())
            .await
            .expect("stop sentinels must not be counted as work");
    }

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn Any + Send> = Box::new("exploded");
        assert_eq!(panic_message(payload.as_ref()), "exploded");
        let payload: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(payload.as_ref()), "owned");
        let payload: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
    }
}
