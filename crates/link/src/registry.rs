//! Action registration and routing.
//!
//! The registry maps message type tags to typed handlers. Messages whose
//! tag has no handler go to the registry's default handler.

use crate::connection::ConnectionHandle;
use crate::error::{Error, HandlerError, Result};
use crate::protocol::{Envelope, KeepAlive, Message};
use crate::role::Role;

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, warn};

/// Outcome of a handler: an optional reply for the peer.
pub type HandlerResult = std::result::Result<Option<Envelope>, HandlerError>;

/// Type alias for boxed futures
pub type BoxedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// Handler function signature
pub type HandlerFn<M> = Arc<dyn Fn(M, Context) -> BoxedFuture<HandlerResult> + Send + Sync>;

/// Handles one message type.
#[async_trait]
pub trait ActionHandler<M: Message>: Send + Sync + 'static {
    /// Handle a decoded message.
    ///
    /// A returned envelope is sent back to the peer when running on the
    /// server side and discarded on the client side.
    async fn handle(&self, message: M, ctx: &Context) -> HandlerResult;
}

/// Receives every message whose type has no registered action.
#[async_trait]
pub trait DefaultHandler: Send + Sync + 'static {
    /// Handle an unrouted envelope.
    async fn handle(&self, envelope: &Envelope, ctx: &Context) -> HandlerResult;
}

/// Default handler that logs and drops the message.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogUnhandled;

#[async_trait]
impl DefaultHandler for LogUnhandled {
    async fn handle(&self, envelope: &Envelope, ctx: &Context) -> HandlerResult {
        warn!(
            connection = %ctx.connection().id(),
            message_type = envelope.message_type(),
            "No action registered, dropping message"
        );
        Ok(None)
    }
}

/// Type-erased action stored in the registry.
#[async_trait]
trait ErasedAction: Send + Sync {
    async fn call(&self, envelope: &Envelope, ctx: &Context) -> Result<Option<Envelope>>;
}

struct TypedAction<M, H> {
    handler: H,
    _message: PhantomData<fn() -> M>,
}

#[async_trait]
impl<M, H> ErasedAction for TypedAction<M, H>
where
    M: Message,
    H: ActionHandler<M>,
{
    async fn call(&self, envelope: &Envelope, ctx: &Context) -> Result<Option<Envelope>> {
        let message = envelope.open::<M>()?;
        Ok(self.handler.handle(message, ctx).await?)
    }
}

/// Adapter turning an async closure into an [`ActionHandler`].
struct FnHandler<M> {
    handler: HandlerFn<M>,
}

#[async_trait]
impl<M: Message> ActionHandler<M> for FnHandler<M> {
    async fn handle(&self, message: M, ctx: &Context) -> HandlerResult {
        (self.handler)(message, ctx.clone()).await
    }
}

/// Registry for message actions.
///
/// Cloning is cheap and clones share the same handler table, so actions
/// registered after a role starts are visible to its running sessions.
#[derive(Clone)]
pub struct ActionRegistry {
    handlers: Arc<DashMap<&'static str, Arc<dyn ErasedAction>>>,
    fallback: Arc<dyn DefaultHandler>,
}

impl ActionRegistry {
    /// Create an empty registry that logs unhandled messages.
    #[must_use]
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(DashMap::new()),
            fallback: Arc::new(LogUnhandled),
        }
    }

    /// Replace the default handler.
    #[must_use]
    pub fn with_default(mut self, handler: impl DefaultHandler) -> Self {
        self.fallback = Arc::new(handler);
        self
    }

    /// Register the action for `M`, replacing any previous one.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReservedMessageType`] for [`KeepAlive`].
    pub fn register<M, H>(&self, handler: H) -> Result<()>
    where
        M: Message,
        H: ActionHandler<M>,
    {
        if M::MESSAGE_TYPE == KeepAlive::MESSAGE_TYPE {
            return Err(Error::ReservedMessageType(M::MESSAGE_TYPE));
        }

        let action: Arc<dyn ErasedAction> = Arc::new(TypedAction {
            handler,
            _message: PhantomData::<fn() -> M>,
        });

        if self.handlers.insert(M::MESSAGE_TYPE, action).is_some() {
            debug!("Replaced action for message type: {}", M::MESSAGE_TYPE);
        } else {
            debug!("Registered action for message type: {}", M::MESSAGE_TYPE);
        }
        Ok(())
    }

    /// Register an async closure as the action for `M`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReservedMessageType`] for [`KeepAlive`].
    pub fn register_fn<M, F, Fut>(&self, handler: F) -> Result<()>
    where
        M: Message,
        F: Fn(M, Context) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: HandlerFn<M> = Arc::new(move |message: M, ctx: Context| {
            Box::pin(handler(message, ctx)) as BoxedFuture<HandlerResult>
        });
        self.register::<M, _>(FnHandler { handler })
    }

    /// Remove the action for `M`. Returns whether one was registered.
    pub fn unregister<M: Message>(&self) -> bool {
        self.handlers.remove(M::MESSAGE_TYPE).is_some()
    }

    /// Whether an action is registered for `M`.
    #[must_use]
    pub fn contains<M: Message>(&self) -> bool {
        self.handlers.contains_key(M::MESSAGE_TYPE)
    }

    /// Number of registered actions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Whether no actions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Route an envelope to its action or the default handler.
    ///
    /// Keep-alives never reach application code.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Malformed`] if the payload does not decode as the
    /// registered type, or [`Error::Handler`] if the handler fails.
    pub async fn dispatch(&self, envelope: &Envelope, ctx: &Context) -> Result<Option<Envelope>> {
        if envelope.is_keep_alive() {
            return Ok(None);
        }

        // Clone out of the map so no shard lock is held across the await
        let action = self
            .handlers
            .get(envelope.message_type())
            .map(|entry| Arc::clone(entry.value()));

        match action {
            Some(action) => action.call(envelope, ctx).await,
            None => Ok(self.fallback.handle(envelope, ctx).await?),
        }
    }
}

impl Default for ActionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self.handlers.iter().map(|entry| *entry.key()).collect();
        types.sort_unstable();
        f.debug_struct("ActionRegistry")
            .field("actions", &types)
            .finish_non_exhaustive()
    }
}

/// What a handler knows about where its message came from.
#[derive(Debug, Clone)]
pub struct Context {
    role: Role,
    connection: ConnectionHandle,
    registry: ActionRegistry,
}

impl Context {
    /// Create a context for one connection.
    #[must_use]
    pub const fn new(role: Role, connection: ConnectionHandle, registry: ActionRegistry) -> Self {
        Self {
            role,
            connection,
            registry,
        }
    }

    /// Which side of the link is handling the message.
    #[must_use]
    pub const fn role(&self) -> Role {
        self.role
    }

    /// The connection the message arrived on.
    ///
    /// Handlers may send extra messages through it or close it.
    #[must_use]
    pub const fn connection(&self) -> &ConnectionHandle {
        &self.connection
    }

    /// The registry that routed the message.
    #[must_use]
    pub const fn registry(&self) -> &ActionRegistry {
        &self.registry
    }
}
