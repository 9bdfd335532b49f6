//! The handler capability.

use async_trait::async_trait;

use super::{Bus, BusError, Message};

/// Result type for handler operations.
pub type HandlerResult<T> = Result<T, HandlerError>;

/// Errors raised while a handler processes a message.
///
/// On an inline dispatcher these propagate to the poster. On a pooled
/// dispatcher they end the worker that was hosting the call.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// The message did not carry the argument the handler needs.
    #[error("{message} is missing argument {argument}")]
    MissingArgument { message: String, argument: String },

    /// An argument could not be decoded into the expected type.
    #[error("failed to decode argument {argument} of {message}: {source}")]
    Decode {
        message: String,
        argument: String,
        #[source]
        source: serde_json::Error,
    },

    /// The handler was asked to process a message it does not define.
    #[error("handler does not understand {0}")]
    Unsupported(String),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),

    /// The failure has already been posted on the `error` channel.
    #[error("{0}")]
    Reported(String),

    /// A nested post failed.
    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    /// Returns `true` if this failure, or the nested failure that caused it,
    /// was already reported on the `error` channel.
    pub fn is_reported(&self) -> bool {
        match self {
            HandlerError::Reported(_) => true,
            HandlerError::Bus(BusError::Handler(inner)) => inner.is_reported(),
            // Runners wrap nested bus failures in `anyhow` context.
            HandlerError::Other(e) => e.chain().any(|cause| {
                if let Some(handler) = cause.downcast_ref::<HandlerError>() {
                    handler.is_reported()
                } else if let Some(BusError::Handler(inner)) = cause.downcast_ref::<BusError>() {
                    inner.is_reported()
                } else {
                    false
                }
            }),
            _ => false,
        }
    }
}

/// Something that can process messages posted on a [`Bus`].
///
/// A handler is a single shared instance: every worker of its dispatcher
/// calls into the same value concurrently, so implementations guard their own
/// mutable state.
///
/// # Example
///
/// ```
/// use std::sync::Mutex;
/// use async_trait::async_trait;
/// use subtest::bus::{Bus, Handler, HandlerResult, Message};
///
/// struct Pong {
///     seen: Mutex<Vec<String>>,
/// }
///
/// #[async_trait]
/// impl Handler for Pong {
///     fn messages(&self) -> &[&str] {
///         &["ping"]
///     }
///
///     async fn handle(&self, _bus: &Bus, _message: &Message) -> HandlerResult<()> {
///         self.seen.lock().unwrap().push("pong".to_string());
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Handler: Send + Sync {
    /// Names of the messages this handler defines.
    fn messages(&self) -> &[&str];

    /// Whether this handler understands `name`.
    fn accepts(&self, name: &str) -> bool {
        self.messages().contains(&name)
    }

    /// Upper bound on the workers a pooled dispatcher may run for this
    /// handler. `None` leaves the bus parallelism degree in charge.
    fn worker_limit(&self) -> Option<usize> {
        None
    }

    /// Processes one message. `bus` may be used to post follow-up messages.
    async fn handle(&self, bus: &Bus, message: &Message) -> HandlerResult<()>;
}
