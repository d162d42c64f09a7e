//! Routing of completed messages into handlers, and delivery of their
//! responses back to connection write queues.
//!
//! [`Dispatcher`] runs on the reactor thread. Synchronous handler results
//! are refined, framed and enqueued directly; asynchronous handlers yield a
//! pending reply that travels to the reaper as an [`AsyncJob`]. Off-thread
//! deliveries (reaper completions, [`Notifier`] pushes) go through the
//! shared state, which follows every enqueue with a write-interest request
//! and a selector wakeup so the reactor observes the change.

use std::sync::Arc;

use bytes::BytesMut;
use crossbeam_channel::Sender;
use mio::Waker;
use thiserror::Error;

use crate::{
    factory::Message,
    handler::{
        AsyncMessageHandler, ConnectionContext, HandlerError, MessageHandler, PendingReply,
    },
    registry::{ConnectionId, ConnectionRegistry},
    response::ResponseAssembly,
    writer::WriteJob,
};

/// The one handler a server instance routes messages to.
///
/// Registering either kind replaces the other, so exactly one is in effect
/// (last-writer-wins).
pub(crate) enum Registered<T> {
    Sync(Box<dyn MessageHandler<T>>),
    Async(Box<dyn AsyncMessageHandler<T>>),
}

/// A message whose asynchronous handling is still pending.
pub(crate) struct AsyncJob<T> {
    pub id: ConnectionId,
    pub message: Message<T>,
    pub pending: PendingReply,
}

/// Dispatch failures surfaced to the reactor.
#[derive(Debug, Error)]
pub(crate) enum DispatchError {
    /// The synchronous handler failed; the originating connection is closed.
    #[error(transparent)]
    Handler(HandlerError),
    /// The async-job queue is closed because the reaper terminated; the
    /// server shuts down rather than accept traffic it cannot answer.
    #[error("async-job queue is closed")]
    QueueClosed,
}

/// State shared between the reactor, the reaper and notifiers.
pub(crate) struct Shared<T> {
    pub registry: ConnectionRegistry,
    pub assembly: ResponseAssembly<T>,
    waker: Arc<Waker>,
    wake_tx: Sender<ConnectionId>,
}

impl<T> Shared<T> {
    pub(crate) fn new(
        assembly: ResponseAssembly<T>,
        waker: Arc<Waker>,
        wake_tx: Sender<ConnectionId>,
    ) -> Self {
        Self {
            registry: ConnectionRegistry::default(),
            assembly,
            waker,
            wake_tx,
        }
    }

    /// Ask the reactor to raise write interest for `id` and wake the
    /// selector. The wakeup must follow the queue append it signals.
    pub(crate) fn request_write(&self, id: ConnectionId) {
        let _ = self.wake_tx.send(id);
        if let Err(e) = self.waker.wake() {
            log::error!("selector wakeup failed: {e}");
        }
    }

    /// Refine, frame and enqueue a response for `id` without signalling;
    /// reactor-thread callers reconcile interest themselves.
    ///
    /// Returns false when the connection is gone or the refined payload no
    /// longer fits the length prefix.
    pub(crate) fn enqueue_response(&self, id: ConnectionId, request: &T, payload: BytesMut) -> bool {
        let Some(queue) = self.registry.get(id) else {
            log::trace!("[client {id}] response for a closed connection dropped");
            return false;
        };
        match self.assembly.refine_and_frame(request, payload) {
            Ok(framed) => {
                queue.enqueue(WriteJob::new(framed));
                true
            }
            Err(e) => {
                log::warn!("[client {id}] response dropped: {e}");
                false
            }
        }
    }

    /// Off-thread delivery: enqueue a response and signal the reactor.
    pub(crate) fn deliver(&self, id: ConnectionId, request: &T, payload: BytesMut) -> bool {
        if !self.enqueue_response(id, request, payload) {
            return false;
        }
        self.request_write(id);
        true
    }
}

/// Capability for pushing unsolicited responses on an existing connection.
///
/// Cloneable and cheap; long-lived handlers stash one together with the
/// originating [`ConnectionId`]. A push to a connection that has since
/// closed is silently dropped.
pub struct Notifier<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Notifier<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Notifier<T> {
    /// Refine `payload` against the original request value, frame it and
    /// queue it on connection `id`, waking the reactor.
    ///
    /// Returns whether the notification was queued; `false` means the
    /// connection is gone, the payload was `None`, or framing failed.
    pub fn notify(&self, id: ConnectionId, original: &T, payload: Option<BytesMut>) -> bool {
        let Some(payload) = payload else {
            log::trace!("[client {id}] empty notification ignored");
            return false;
        };
        self.shared.deliver(id, original, payload)
    }
}

/// Routes completed messages to the registered handler.
pub(crate) struct Dispatcher<T> {
    shared: Arc<Shared<T>>,
    handler: Option<Registered<T>>,
    jobs: Sender<AsyncJob<T>>,
}

impl<T> Dispatcher<T> {
    pub(crate) fn new(
        shared: Arc<Shared<T>>,
        handler: Option<Registered<T>>,
        jobs: Sender<AsyncJob<T>>,
    ) -> Self {
        Self {
            shared,
            handler,
            jobs,
        }
    }

    pub(crate) fn notifier(&self) -> Notifier<T> {
        Notifier {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Hand one decoded message to the registered handler.
    ///
    /// Synchronous results are enqueued on the connection's write queue;
    /// asynchronous handling is parked on the reaper's job queue.
    pub(crate) fn dispatch(
        &self,
        id: ConnectionId,
        label: &str,
        message: Message<T>,
    ) -> Result<(), DispatchError> {
        match &self.handler {
            None => {
                log::warn!("[{label}] no handler registered; message discarded");
                Ok(())
            }
            Some(Registered::Async(handler)) => {
                log::trace!("[{label}] parking message on the async-job queue");
                let pending = handler.handle(&message);
                self.jobs
                    .send(AsyncJob {
                        id,
                        message,
                        pending,
                    })
                    .map_err(|_| DispatchError::QueueClosed)
            }
            Some(Registered::Sync(handler)) => {
                let ctx = ConnectionContext::new(id, self.notifier());
                let reply = handler.handle(ctx, &message).map_err(DispatchError::Handler)?;
                if let Some(payload) = reply {
                    self.shared.enqueue_response(id, message.value(), payload);
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{io, sync::Arc};

    use bytes::{BufMut, Bytes, BytesMut};
    use crossbeam_channel::unbounded;
    use mio::{Poll, Token, Waker};

    use super::*;
    use crate::{
        framing::LengthFormat,
        handler::HandlerError,
        writer::OutboundQueue,
    };

    fn shared_fixture(
        refiners: Vec<Box<dyn crate::handler::ResponseRefiner<Bytes>>>,
    ) -> (Arc<Shared<Bytes>>, crossbeam_channel::Receiver<ConnectionId>, Poll) {
        let poll = Poll::new().expect("poll opens");
        let waker = Arc::new(Waker::new(poll.registry(), Token(1)).expect("waker registers"));
        let (wake_tx, wake_rx) = unbounded();
        let assembly = ResponseAssembly::new(refiners, LengthFormat::u32_be());
        (
            Arc::new(Shared::new(assembly, waker, wake_tx)),
            wake_rx,
            poll,
        )
    }

    fn drain_to_vec(queue: &OutboundQueue) -> Vec<u8> {
        let mut sink = Vec::new();
        queue.drain(&mut sink).expect("vec sink never blocks");
        sink
    }

    fn message(body: &[u8]) -> Message<Bytes> {
        Message::new(Bytes::copy_from_slice(body), Bytes::copy_from_slice(body))
    }

    #[test]
    fn sync_handler_response_is_framed_and_enqueued() {
        let (shared, _wake_rx, _poll) = shared_fixture(Vec::new());
        let queue = Arc::new(OutboundQueue::new());
        let id = ConnectionId(0);
        shared.registry.insert(id, &queue);

        let echo = |_ctx: ConnectionContext<Bytes>, msg: &Message<Bytes>| {
            Ok::<_, HandlerError>(Some(BytesMut::from(&msg.raw()[..])))
        };
        let (jobs_tx, _jobs_rx) = unbounded();
        let dispatcher = Dispatcher::new(
            Arc::clone(&shared),
            Some(Registered::Sync(Box::new(echo))),
            jobs_tx,
        );

        dispatcher
            .dispatch(id, "client 0", message(b"hello"))
            .expect("dispatch succeeds");
        assert_eq!(drain_to_vec(&queue), b"\x00\x00\x00\x05hello");
    }

    #[test]
    fn refiners_apply_before_framing() {
        let tag = |req: &Bytes, mut buf: BytesMut| {
            buf.put_slice(req);
            buf
        };
        let (shared, _wake_rx, _poll) = shared_fixture(vec![Box::new(tag)]);
        let queue = Arc::new(OutboundQueue::new());
        let id = ConnectionId(4);
        shared.registry.insert(id, &queue);

        assert!(shared.enqueue_response(id, &Bytes::from_static(b"!"), BytesMut::from(&b"ok"[..])));
        assert_eq!(drain_to_vec(&queue), b"\x00\x00\x00\x03ok!");
    }

    #[test]
    fn async_handler_parks_a_job() {
        let (shared, _wake_rx, _poll) = shared_fixture(Vec::new());
        let handler =
            |msg: &Message<Bytes>| PendingReply::ready(Some(BytesMut::from(&msg.raw()[..])));
        let (jobs_tx, jobs_rx) = unbounded();
        let dispatcher = Dispatcher::new(
            shared,
            Some(Registered::Async(Box::new(handler))),
            jobs_tx,
        );

        dispatcher
            .dispatch(ConnectionId(7), "client 7", message(b"later"))
            .expect("dispatch succeeds");
        let job = jobs_rx.try_recv().expect("job parked");
        assert_eq!(job.id, ConnectionId(7));
        assert_eq!(job.message.raw(), &Bytes::from_static(b"later"));
    }

    #[test]
    fn closed_job_queue_is_fatal() {
        let (shared, _wake_rx, _poll) = shared_fixture(Vec::new());
        let handler = |_msg: &Message<Bytes>| PendingReply::ready(None);
        let (jobs_tx, jobs_rx) = unbounded();
        drop(jobs_rx);
        let dispatcher = Dispatcher::new(
            shared,
            Some(Registered::Async(Box::new(handler))),
            jobs_tx,
        );

        assert!(matches!(
            dispatcher.dispatch(ConnectionId(1), "client 1", message(b"x")),
            Err(DispatchError::QueueClosed)
        ));
    }

    #[test]
    fn handler_failure_propagates() {
        let (shared, _wake_rx, _poll) = shared_fixture(Vec::new());
        let failing = |_ctx: ConnectionContext<Bytes>, _msg: &Message<Bytes>| {
            Err::<Option<BytesMut>, _>(HandlerError::new(io::Error::other("boom")))
        };
        let (jobs_tx, _jobs_rx) = unbounded();
        let dispatcher = Dispatcher::new(
            shared,
            Some(Registered::Sync(Box::new(failing))),
            jobs_tx,
        );

        assert!(matches!(
            dispatcher.dispatch(ConnectionId(2), "client 2", message(b"x")),
            Err(DispatchError::Handler(_))
        ));
    }

    #[test]
    fn no_handler_discards_the_message() {
        let (shared, _wake_rx, _poll) = shared_fixture(Vec::new());
        let (jobs_tx, _jobs_rx) = unbounded();
        let dispatcher: Dispatcher<Bytes> = Dispatcher::new(shared, None, jobs_tx);
        dispatcher
            .dispatch(ConnectionId(9), "client 9", message(b"nobody"))
            .expect("discard is not an error");
    }

    #[test]
    fn notify_signals_the_reactor() {
        let (shared, wake_rx, _poll) = shared_fixture(Vec::new());
        let queue = Arc::new(OutboundQueue::new());
        let id = ConnectionId(5);
        shared.registry.insert(id, &queue);
        let notifier = Notifier {
            shared: Arc::clone(&shared),
        };

        assert!(notifier.notify(id, &Bytes::from_static(b"sub"), Some(BytesMut::from(&b"tick"[..]))));
        assert_eq!(wake_rx.try_recv().expect("write requested"), id);
        assert_eq!(drain_to_vec(&queue), b"\x00\x00\x00\x04tick");
    }

    #[test]
    fn notify_to_a_dead_connection_is_dropped() {
        let (shared, wake_rx, _poll) = shared_fixture(Vec::new());
        let notifier = Notifier { shared };
        assert!(!notifier.notify(ConnectionId(8), &Bytes::new(), Some(BytesMut::new())));
        assert!(wake_rx.try_recv().is_err());
    }
}
