//! Handler seams plugged into the server.
//!
//! Exactly one of [`MessageHandler`] (synchronous, runs on the reactor
//! thread) or [`AsyncMessageHandler`] (returns a [`PendingReply`] completed
//! elsewhere) handles decoded messages. [`ResponseRefiner`]s transform a
//! handler's response buffer before it is framed, and an
//! [`InvalidKeyHandler`] observes readiness events for connections the
//! reactor no longer tracks.
//!
//! Closures with matching signatures implement each trait directly.

use std::{error::Error, time::Duration};

use bytes::BytesMut;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, bounded};
use thiserror::Error as ThisError;

use crate::{dispatch::Notifier, factory::Message, registry::ConnectionId};

/// Failure raised by a synchronous handler.
///
/// The connection that carried the offending message is closed; the server
/// stays up.
#[derive(Debug, ThisError)]
#[error("message handler failed: {source}")]
pub struct HandlerError {
    #[source]
    source: Box<dyn Error + Send + Sync>,
}

impl HandlerError {
    /// Wrap any error or message.
    pub fn new(source: impl Into<Box<dyn Error + Send + Sync>>) -> Self {
        Self {
            source: source.into(),
        }
    }
}

/// Connection specifics for the message being handled.
///
/// Carries the originating connection's id and a [`Notifier`], so handlers
/// can push unsolicited responses on that connection later — clone the
/// notifier and keep the id.
pub struct ConnectionContext<T> {
    id: ConnectionId,
    notifier: Notifier<T>,
}

impl<T> ConnectionContext<T> {
    pub(crate) fn new(id: ConnectionId, notifier: Notifier<T>) -> Self { Self { id, notifier } }

    /// Id of the connection the message arrived on.
    #[must_use]
    pub fn id(&self) -> ConnectionId { self.id }

    /// The notification capability for this server.
    #[must_use]
    pub fn notifier(&self) -> &Notifier<T> { &self.notifier }
}

/// Synchronous message handler, invoked on the reactor thread.
pub trait MessageHandler<T>: Send + Sync {
    /// Handle one decoded message.
    ///
    /// Return `Some(buffer)` to send a response (after refinement and
    /// framing), or `None` to stay silent.
    ///
    /// # Errors
    ///
    /// A [`HandlerError`] closes the originating connection.
    fn handle(
        &self,
        ctx: ConnectionContext<T>,
        message: &Message<T>,
    ) -> Result<Option<BytesMut>, HandlerError>;
}

impl<T, F> MessageHandler<T> for F
where
    F: Fn(ConnectionContext<T>, &Message<T>) -> Result<Option<BytesMut>, HandlerError>
        + Send
        + Sync,
{
    fn handle(
        &self,
        ctx: ConnectionContext<T>,
        message: &Message<T>,
    ) -> Result<Option<BytesMut>, HandlerError> {
        self(ctx, message)
    }
}

/// Asynchronous message handler.
///
/// The handler returns immediately with a [`PendingReply`]; the reply is
/// completed from wherever the implementation chose to run — the runtime
/// never sees that executor.
pub trait AsyncMessageHandler<T>: Send + Sync {
    /// Begin handling one decoded message.
    fn handle(&self, message: &Message<T>) -> PendingReply;
}

impl<T, F> AsyncMessageHandler<T> for F
where
    F: Fn(&Message<T>) -> PendingReply + Send + Sync,
{
    fn handle(&self, message: &Message<T>) -> PendingReply { self(message) }
}

/// Synchronous transformation applied to a response buffer before framing.
///
/// Refiners run in registration order on whichever thread produced the
/// response, and must not block.
pub trait ResponseRefiner<T>: Send + Sync {
    /// Produce the refined buffer from the decoded request value and the
    /// response so far.
    fn execute(&self, message: &T, response: BytesMut) -> BytesMut;
}

impl<T, F> ResponseRefiner<T> for F
where
    F: Fn(&T, BytesMut) -> BytesMut + Send + Sync,
{
    fn execute(&self, message: &T, response: BytesMut) -> BytesMut { self(message, response) }
}

/// Observer for readiness events that reference a connection the reactor no
/// longer tracks.
pub trait InvalidKeyHandler: Send {
    fn handle(&self, id: ConnectionId);
}

/// Default invalid-key handler. The reactor has already dropped (and so
/// closed) the connection's stream by the time this runs, so it only logs.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiscardInvalidKeys;

impl InvalidKeyHandler for DiscardInvalidKeys {
    fn handle(&self, id: ConnectionId) {
        log::debug!("[client {id}] readiness event for a defunct connection discarded");
    }
}

/// Outcome of one bounded wait on a [`PendingReply`].
#[derive(Debug)]
pub enum ReplyState {
    /// The handler finished; `None` means it chose not to respond.
    Ready(Option<BytesMut>),
    /// The wait window elapsed; the reply may still arrive later.
    TimedOut,
    /// The reply can never arrive: its [`ReplySlot`] was dropped
    /// uncompleted.
    Failed,
}

/// Completion side of a pending reply. One-shot.
pub struct ReplySlot {
    tx: Sender<Option<BytesMut>>,
}

impl ReplySlot {
    /// Complete the reply. `None` sends nothing to the client.
    pub fn complete(self, reply: Option<BytesMut>) {
        // The receiver is gone once the server shuts down; nothing to do.
        let _ = self.tx.send(reply);
    }
}

/// Pending result of an asynchronous handler.
///
/// The runtime's only interface to it is a bounded wait: ready, timed out,
/// or failed.
pub struct PendingReply {
    rx: Receiver<Option<BytesMut>>,
}

impl PendingReply {
    /// A reply that is already complete, for handlers that finish inline.
    #[must_use]
    pub fn ready(reply: Option<BytesMut>) -> Self {
        let (slot, pending) = reply_slot();
        slot.complete(reply);
        pending
    }

    /// Wait up to `window` for the reply.
    #[must_use]
    pub fn wait(&self, window: Duration) -> ReplyState {
        match self.rx.recv_timeout(window) {
            Ok(reply) => ReplyState::Ready(reply),
            Err(RecvTimeoutError::Timeout) => ReplyState::TimedOut,
            Err(RecvTimeoutError::Disconnected) => ReplyState::Failed,
        }
    }
}

/// Create a linked completion slot and pending reply.
#[must_use]
pub fn reply_slot() -> (ReplySlot, PendingReply) {
    let (tx, rx) = bounded(1);
    (ReplySlot { tx }, PendingReply { rx })
}
