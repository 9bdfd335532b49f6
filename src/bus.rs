//! Single-delivery message bus.
//!
//! A [`Bus`] owns an ordered list of [`Dispatcher`]s, one per registered
//! [`Handler`]. Posting a message delivers it to the **first** dispatcher
//! whose handler accepts the message name; it is routing, not broadcast.
//!
//! # Architecture
//!
//! ```text
//!   caller ── post(Message) ──► Bus
//!                                │ first dispatcher whose handler accepts
//!                                ▼
//!            ┌───────────────────┴───────────────────┐
//!            │                                       │
//!     InlineDispatcher                        PooledDispatcher
//!     (degree 0: awaits                       (degree N: enqueue,
//!      handler in place)                       worker tasks handle)
//!            │                                       │
//!            └──────────► Handler::handle(bus, msg) ◄┘
//!                                │
//!                                └── may post more messages ──► Bus
//! ```
//!
//! # Lifecycle
//!
//! 1. [`Bus::new`] builds every dispatcher, then starts them all. Workers
//!    never observe a half-built sibling.
//! 2. [`Bus::post`] as often as needed, including from inside handlers.
//! 3. [`Bus::join`] waits for all known and recursively generated work.
//! 4. [`Bus::close`] stops worker tasks.
//!
//! # Example
//!
//! ```
//! use std::sync::{Arc, Mutex};
//! use async_trait::async_trait;
//! use subtest::bus::{Bus, Handler, HandlerResult, Message};
//!
//! const MESSAGES: &[&str] = &["ping"];
//!
//! struct Pong(Mutex<Vec<String>>);
//!
//! #[async_trait]
//! impl Handler for Pong {
//!     fn messages(&self) -> &[&str] {
//!         MESSAGES
//!     }
//!
//!     async fn handle(&self, _bus: &Bus, _message: &Message) -> HandlerResult<()> {
//!         self.0.lock().unwrap().push("pong".to_string());
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pong = Arc::new(Pong(Mutex::new(Vec::new())));
//!     let bus = Bus::new(MESSAGES, vec![pong.clone()], 0);
//!
//!     bus.post(Message::new("ping")).await?;
//!     bus.join().await;
//!     bus.close().await;
//!
//!     assert_eq!(*pong.0.lock().unwrap(), vec!["pong"]);
//!     Ok(())
//! }
//! ```

pub mod completion;
pub mod dispatcher;
pub mod handler;
pub mod message;
pub mod pool;

use std::sync::{Arc, Weak};

use tracing::{debug, info};

pub use completion::{CompletionError, CompletionTracker};
pub use dispatcher::{Dispatcher, InlineDispatcher};
pub use handler::{Handler, HandlerError, HandlerResult};
pub use message::Message;
pub use pool::PooledDispatcher;

/// The fixed set of message names a bus accepts.
pub type MessageTypes = &'static [&'static str];

/// Result type for bus operations.
pub type BusResult<T> = Result<T, BusError>;

/// Errors surfaced to the caller of [`Bus::post`].
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// The name is not in the bus's declared message set.
    #[error("unknown message type: {0}")]
    UnknownMessage(String),

    /// A message argument could not be serialized.
    #[error("failed to encode argument for {message}: {source}")]
    Encode {
        message: String,
        #[source]
        source: serde_json::Error,
    },

    /// The dispatcher's queue no longer accepts work.
    #[error("dispatcher queue closed while posting {0}")]
    Closed(String),

    /// An inline handler failed.
    #[error("handler failed: {0}")]
    Handler(Box<HandlerError>),
}

struct BusInner {
    message_types: MessageTypes,
    degree: usize,
    dispatchers: Vec<Box<dyn Dispatcher>>,
}

/// Routes each posted message to exactly one dispatcher.
///
/// `Bus` is a cheap handle; clones share the same dispatchers. Worker tasks
/// only hold a [`WeakBus`], so dropping every `Bus` handle releases the
/// dispatchers and lets idle workers exit.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

/// Non-owning back-reference to a [`Bus`].
#[derive(Clone)]
pub struct WeakBus {
    inner: Weak<BusInner>,
}

impl WeakBus {
    pub fn upgrade(&self) -> Option<Bus> {
        self.inner.upgrade().map(|inner| Bus { inner })
    }
}

impl Bus {
    /// Builds a bus over `handlers` and starts its dispatchers.
    ///
    /// With `degree == 0` every handler runs inline on the poster's task.
    /// Otherwise each handler gets its own worker pool of up to `degree`
    /// tasks, capped by [`Handler::worker_limit`]. Pooled buses spawn tasks
    /// and must be created inside a tokio runtime.
    pub fn new(
        message_types: MessageTypes,
        handlers: Vec<Arc<dyn Handler>>,
        degree: usize,
    ) -> Self {
        let dispatchers = handlers
            .into_iter()
            .map(|handler| -> Box<dyn Dispatcher> {
                if degree == 0 {
                    Box::new(InlineDispatcher::new(handler))
                } else {
                    Box::new(PooledDispatcher::new(handler, degree))
                }
            })
            .collect();

        let bus = Self {
            inner: Arc::new(BusInner {
                message_types,
                degree,
                dispatchers,
            }),
        };

        // Start only once every dispatcher exists.
        for dispatcher in &bus.inner.dispatchers {
            dispatcher.start(&bus);
        }

        info!(
            dispatchers = bus.inner.dispatchers.len(),
            degree, "Bus started"
        );
        bus
    }

    /// The parallelism degree this bus was built with.
    pub fn degree(&self) -> usize {
        self.inner.degree
    }

    /// The message names this bus accepts.
    pub fn message_types(&self) -> MessageTypes {
        self.inner.message_types
    }

    pub fn downgrade(&self) -> WeakBus {
        WeakBus {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Delivers `message` to the first dispatcher that accepts it.
    ///
    /// A message nobody accepts is dropped without error.
    ///
    /// # Errors
    ///
    /// - [`BusError::UnknownMessage`] if the name was not declared for this bus
    /// - [`BusError::Handler`] if an inline handler failed
    pub async fn post(&self, message: Message) -> BusResult<()> {
        if !self.inner.message_types.contains(&message.name()) {
            return Err(BusError::UnknownMessage(message.name().to_string()));
        }

        for dispatcher in &self.inner.dispatchers {
            if dispatcher.accepts(message.name()) {
                debug!(%message, "Routing message");
                return dispatcher.receive(self, message).await;
            }
        }

        debug!(%message, "No handler accepts message, dropping it");
        Ok(())
    }

    /// Waits, dispatcher by dispatcher, until no work is outstanding.
    pub async fn join(&self) {
        for dispatcher in &self.inner.dispatchers {
            dispatcher.join().await;
        }
    }

    /// Lets outstanding work finish, then stops every dispatcher's workers.
    /// Handler state is left intact.
    ///
    /// Unlike [`join`](Self::join), this returns even when a pool has lost
    /// all its workers with work still queued.
    pub async fn close(&self) {
        for dispatcher in &self.inner.dispatchers {
            dispatcher.settle().await;
        }
        for dispatcher in &self.inner.dispatchers {
            dispatcher.close().await;
        }
        info!("Bus closed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_test::{assert_err, assert_ok};

    use super::*;

    const TYPES: &[&str] = &[
        "ping", "stage1", "stage2", "fanout", "leaf", "orphan", "parent", "child",
    ];

    struct Ping {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Handler for Ping {
        fn messages(&self) -> &[&str] {
            &["ping"]
        }

        async fn handle(&self, _bus: &Bus, _message: &Message) -> HandlerResult<()> {
            self.seen.lock().unwrap().push("pong".to_string());
            Ok(())
        }
    }

    struct Stage1;

    #[async_trait]
    impl Handler for Stage1 {
        fn messages(&self) -> &[&str] {
            &["stage1"]
        }

        async fn handle(&self, bus: &Bus, message: &Message) -> HandlerResult<()> {
            let data: String = message.arg(0)?;
            bus.post(Message::new("stage2").with_arg(&format!("{}.1", data))?)
                .await?;
            Ok(())
        }
    }

    struct Stage2 {
        results: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Handler for Stage2 {
        fn messages(&self) -> &[&str] {
            &["stage2"]
        }

        async fn handle(&self, _bus: &Bus, message: &Message) -> HandlerResult<()> {
            let data: String = message.arg(0)?;
            self.results.lock().unwrap().push(format!("{}.2", data));
            Ok(())
        }
    }

    /// Posts `width` children per level down to `depth`, counting leaves.
    struct Tree {
        width: usize,
        leaves: AtomicUsize,
        handled: AtomicUsize,
    }

    #[async_trait]
    impl Handler for Tree {
        fn messages(&self) -> &[&str] {
            &["fanout", "leaf"]
        }

        async fn handle(&self, bus: &Bus, message: &Message) -> HandlerResult<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            match message.name() {
                "fanout" => {
                    let depth: usize = message.arg(0)?;
                    for _ in 0..self.width {
                        let next = if depth == 0 {
                            Message::new("leaf")
                        } else {
                            Message::new("fanout").with_arg(&(depth - 1))?
                        };
                        bus.post(next).await?;
                    }
                    Ok(())
                }
                "leaf" => {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    self.leaves.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                other => Err(HandlerError::Unsupported(other.to_string())),
            }
        }
    }

    fn ping() -> Arc<Ping> {
        Arc::new(Ping {
            seen: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_inline_ping() {
        let handler = ping();
        let bus = Bus::new(TYPES, vec![handler.clone()], 0);

        assert_ok!(bus.post(Message::new("ping")).await);
        bus.join().await;
        bus.close().await;

        assert_eq!(*handler.seen.lock().unwrap(), vec!["pong"]);
    }

    #[tokio::test]
    async fn test_chained_call() {
        for degree in [0, 1, 2] {
            let stage2 = Arc::new(Stage2 {
                results: Mutex::new(Vec::new()),
            });
            let bus = Bus::new(TYPES, vec![Arc::new(Stage1), stage2.clone()], degree);

            let start = degree.to_string();
            assert_ok!(bus.post(Message::new("stage1").with_arg(&start).unwrap()).await);
            bus.join().await;
            bus.close().await;

            assert_eq!(
                *stage2.results.lock().unwrap(),
                vec![format!("{}.1.2", degree)]
            );
        }
    }

    #[tokio::test]
    async fn test_unknown_message_is_an_error() {
        let bus = Bus::new(TYPES, vec![ping()], 0);
        let err = assert_err!(bus.post(Message::new("pang")).await);
        assert!(matches!(err, BusError::UnknownMessage(name) if name == "pang"));
    }

    #[tokio::test]
    async fn test_unmatched_message_is_dropped() {
        for degree in [0, 2] {
            let handler = ping();
            let bus = Bus::new(TYPES, vec![handler.clone()], degree);
            assert_ok!(bus.post(Message::new("orphan")).await);
            bus.join().await;
            bus.close().await;
            assert!(handler.seen.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_first_matching_dispatcher_wins() {
        let first = ping();
        let second = ping();
        let bus = Bus::new(TYPES, vec![first.clone(), second.clone()], 2);

        for _ in 0..20 {
            bus.post(Message::new("ping")).await.unwrap();
        }
        bus.join().await;
        bus.close().await;

        assert_eq!(first.seen.lock().unwrap().len(), 20);
        assert!(second.seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_join_waits_for_recursive_fanout() {
        for degree in [0, 1, 4] {
            let tree = Arc::new(Tree {
                width: 3,
                leaves: AtomicUsize::new(0),
                handled: AtomicUsize::new(0),
            });
            let bus = Bus::new(TYPES, vec![tree.clone()], degree);

            bus.post(Message::new("fanout").with_arg(&2usize).unwrap())
                .await
                .unwrap();
            tokio::time::timeout(Duration::from_secs(10), bus.join())
                .await
                .expect("join should return once the tree is exhausted");

            // 1 + 3 + 9 fanouts, 27 leaves
            assert_eq!(tree.leaves.load(Ordering::SeqCst), 27);
            assert_eq!(tree.handled.load(Ordering::SeqCst), 40);
            bus.close().await;
        }
    }

    #[tokio::test]
    async fn test_inline_error_reaches_poster() {
        let tree = Arc::new(Tree {
            width: 1,
            leaves: AtomicUsize::new(0),
            handled: AtomicUsize::new(0),
        });
        let bus = Bus::new(TYPES, vec![tree], 0);

        // "fanout" without its depth argument
        let err = assert_err!(bus.post(Message::new("fanout")).await);
        match err {
            BusError::Handler(inner) => {
                assert!(matches!(*inner, HandlerError::MissingArgument { .. }))
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_pooled_error_does_not_reach_poster() {
        let tree = Arc::new(Tree {
            width: 1,
            leaves: AtomicUsize::new(0),
            handled: AtomicUsize::new(0),
        });
        let bus = Bus::new(TYPES, vec![tree], 2);

        assert_ok!(bus.post(Message::new("fanout")).await);
        tokio::time::timeout(Duration::from_secs(5), bus.join())
            .await
            .expect("failed work still counts as done");
        bus.close().await;
    }

    struct Parent;

    #[async_trait]
    impl Handler for Parent {
        fn messages(&self) -> &[&str] {
            &["parent"]
        }

        async fn handle(&self, bus: &Bus, _message: &Message) -> HandlerResult<()> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            for _ in 0..3 {
                bus.post(Message::new("child")).await?;
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Child {
        handled: AtomicUsize,
    }

    #[async_trait]
    impl Handler for Child {
        fn messages(&self) -> &[&str] {
            &["child"]
        }

        async fn handle(&self, _bus: &Bus, _message: &Message) -> HandlerResult<()> {
            self.handled.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_close_finishes_work_posted_by_busy_worker() {
        let child = Arc::new(Child::default());
        // Child pool first: it is idle until the parent's sleep ends.
        let handlers: Vec<Arc<dyn Handler>> = vec![child.clone(), Arc::new(Parent)];
        let bus = Bus::new(TYPES, handlers, 2);

        assert_ok!(bus.post(Message::new("parent")).await);
        tokio::time::sleep(Duration::from_millis(10)).await;
        tokio::time::timeout(Duration::from_secs(5), bus.close())
            .await
            .expect("close should converge");

        assert_eq!(child.handled.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_close_after_close() {
        let bus = Bus::new(TYPES, vec![ping()], 2);
        bus.join().await;
        bus.close().await;
        bus.close().await;
    }
}
