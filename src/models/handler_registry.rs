use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::RwLock;
use tracing::debug;
use tracing::error;
use tracing::warn;

use super::peer::InboundMessage;

/// Application callback for one message type.
///
/// Errors and panics raised by a handler are logged and contained: they never
/// terminate the peer loop that invoked it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: InboundMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(InboundMessage) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: InboundMessage) -> anyhow::Result<()> {
        (self)(message).await
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    NoHandler,
    HandlerFailed,
    HandlerPanicked,
}

/// String-keyed handler table. At most one handler per message type; the
/// last registration wins.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn MessageHandler>>>,
}

impl Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered = self
            .handlers
            .try_read()
            .map(|handlers| handlers.len())
            .ok();
        f.debug_struct("HandlerRegistry")
            .field("registered", &registered)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true if a previous handler for `message_type` was replaced.
    pub async fn register<H>(&self, message_type: impl Into<String>, handler: H) -> bool
    where
        H: MessageHandler + 'static,
    {
        let message_type = message_type.into();
        debug!("Registered handler for {message_type}");
        self.handlers
            .write()
            .await
            .insert(message_type, Arc::new(handler))
            .is_some()
    }

    pub async fn get(&self, message_type: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.read().await.get(message_type).cloned()
    }

    /// Run the handler registered for the message's type, if any.
    pub async fn dispatch(&self, message: InboundMessage) -> DispatchOutcome {
        let Some(handler) = self.get(message.message_type()).await else {
            debug!(
                "No handler for {} from {}; dropping",
                message.message_type(),
                message.from_peer()
            );
            return DispatchOutcome::NoHandler;
        };

        let message_type = message.message_type().to_owned();
        let from_peer = message.from_peer().clone();
        match AssertUnwindSafe(handler.handle(message))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => DispatchOutcome::Handled,
            Ok(Err(err)) => {
                warn!("Handler for {message_type} from {from_peer} failed: {err:#}");
                DispatchOutcome::HandlerFailed
            }
            Err(_panic) => {
                error!("Handler for {message_type} from {from_peer} panicked");
                DispatchOutcome::HandlerPanicked
            }
        }
    }
}
