//! Execution strategies binding a handler to a bus.
//!
//! | Strategy | Type | When |
//! |----------|------|------|
//! | Inline | [`InlineDispatcher`] | parallelism degree 0 |
//! | Pooled | [`PooledDispatcher`](super::pool::PooledDispatcher) | degree > 0 |

use std::sync::Arc;

use async_trait::async_trait;

use super::handler::Handler;
use super::{Bus, BusError, BusResult, Message};

/// Binds exactly one [`Handler`] to a bus and decides where it runs.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Starts worker units, if any. Called once, after every dispatcher of
    /// the bus has been constructed.
    fn start(&self, bus: &Bus);

    /// Whether the bound handler accepts `name`.
    fn accepts(&self, name: &str) -> bool;

    /// Delivers one message.
    async fn receive(&self, bus: &Bus, message: Message) -> BusResult<()>;

    /// Waits until no work accepted by this dispatcher is outstanding.
    async fn join(&self);

    /// Like [`join`](Self::join), but also returns once no worker is left
    /// to do the outstanding work.
    async fn settle(&self) {
        self.join().await;
    }

    /// Settles, then releases worker units.
    async fn close(&self);
}

/// Runs the handler on the poster's own task.
///
/// Handler errors propagate back to the caller of `post`.
pub struct InlineDispatcher {
    handler: Arc<dyn Handler>,
}

impl InlineDispatcher {
    pub fn new(handler: Arc<dyn Handler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl Dispatcher for InlineDispatcher {
    fn start(&self, _bus: &Bus) {}

    fn accepts(&self, name: &str) -> bool {
        self.handler.accepts(name)
    }

    async fn receive(&self, bus: &Bus, message: Message) -> BusResult<()> {
        self.handler
            .handle(bus, &message)
            .await
            .map_err(|e| BusError::Handler(Box::new(e)))
    }

    async fn join(&self) {}

    async fn close(&self) {}
}
