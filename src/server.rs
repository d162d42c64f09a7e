//! Server configuration and lifecycle.
//!
//! [`Server`] is a builder: hand it a codec, one handler, any response
//! refiners, and an address, then call [`Server::bind`]. Binding consumes
//! the builder and returns a [`BoundServer`] whose configuration can no
//! longer change; [`BoundServer::run`] spawns the reaper thread and blocks
//! in the reactor loop until a [`ShutdownHandle`] stops it.

use std::{
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use crossbeam_channel::{Sender, unbounded};
use mio::{Interest, Poll, Waker, net::TcpListener};
use thiserror::Error;

use crate::{
    dispatch::{Dispatcher, Registered, Shared},
    factory::MessageFactory,
    framing::{Endianness, LengthFormat},
    handler::{
        AsyncMessageHandler, DiscardInvalidKeys, InvalidKeyHandler, MessageHandler,
        ResponseRefiner,
    },
    reactor::{LISTENER, Reactor, WAKER},
    reaper::Reaper,
    response::ResponseAssembly,
};

/// Port the server listens on unless configured otherwise.
pub const DEFAULT_PORT: u16 = 12509;

/// Default bound on a frame's declared body length. Also sizes each
/// connection's body working buffer.
pub const DEFAULT_MAX_BODY_BYTES: usize = 1024 * 1024;

/// Errors surfaced by server setup and the event loop.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Selector, waker or socket-registration setup failed.
    #[error("server setup failed: {0}")]
    Setup(#[source] io::Error),
    /// The listening socket could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested listen address.
        addr: SocketAddr,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },
    /// The codec declared a length-prefix width outside `1..=8`.
    #[error("unsupported length-prefix width: {0}")]
    HeaderSize(usize),
    /// The selector failed while the server was running.
    #[error("selector failure: {0}")]
    Poll(#[source] io::Error),
    /// The reaper terminated, so async replies can no longer be delivered;
    /// the server shuts down instead of accepting traffic it cannot answer.
    #[error("async reply processing stopped")]
    AsyncHandlingStopped,
}

/// Builder for a single-reactor message server.
pub struct Server<F: MessageFactory> {
    factory: Arc<F>,
    address: SocketAddr,
    max_body_bytes: usize,
    handler: Option<Registered<F::Output>>,
    refiners: Vec<Box<dyn ResponseRefiner<F::Output>>>,
    invalid_keys: Box<dyn InvalidKeyHandler>,
}

impl<F: MessageFactory> Server<F> {
    /// Start configuring a server around `factory`.
    #[must_use]
    pub fn new(factory: F) -> Self {
        Self {
            factory: Arc::new(factory),
            address: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            handler: None,
            refiners: Vec::new(),
            invalid_keys: Box::new(DiscardInvalidKeys),
        }
    }

    /// Listen address; defaults to `0.0.0.0:12509`.
    #[must_use]
    pub fn address(mut self, address: SocketAddr) -> Self {
        self.address = address;
        self
    }

    /// Bound on the body length a frame may declare.
    #[must_use]
    pub fn max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Register the synchronous message handler.
    ///
    /// Replaces any handler registered earlier, async ones included; the
    /// last registration wins.
    #[must_use]
    pub fn handler(mut self, handler: impl MessageHandler<F::Output> + 'static) -> Self {
        self.handler = Some(Registered::Sync(Box::new(handler)));
        self
    }

    /// Register the asynchronous message handler.
    ///
    /// Replaces any handler registered earlier; the last registration wins.
    #[must_use]
    pub fn async_handler(
        mut self,
        handler: impl AsyncMessageHandler<F::Output> + 'static,
    ) -> Self {
        self.handler = Some(Registered::Async(Box::new(handler)));
        self
    }

    /// Append a refiner to the ordered response-refinement chain.
    #[must_use]
    pub fn refiner(mut self, refiner: impl ResponseRefiner<F::Output> + 'static) -> Self {
        self.refiners.push(Box::new(refiner));
        self
    }

    /// Replace the handler for readiness events on untracked connections.
    #[must_use]
    pub fn invalid_key_handler(mut self, handler: impl InvalidKeyHandler + 'static) -> Self {
        self.invalid_keys = Box::new(handler);
        self
    }

    /// Open the selector, bind the listening socket and freeze the
    /// configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::HeaderSize`] for an unusable codec prefix
    /// width, [`ServerError::Bind`] when the address is unavailable, and
    /// [`ServerError::Setup`] for selector failures.
    pub fn bind(self) -> Result<BoundServer<F>, ServerError> {
        let width = self.factory.header_size();
        if !(1..=8).contains(&width) {
            return Err(ServerError::HeaderSize(width));
        }
        let format = LengthFormat::new(width, Endianness::Big);

        let poll = Poll::new().map_err(ServerError::Setup)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER).map_err(ServerError::Setup)?);
        let mut listener = TcpListener::bind(self.address).map_err(|source| ServerError::Bind {
            addr: self.address,
            source,
        })?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(ServerError::Setup)?;
        let local_addr = listener.local_addr().map_err(ServerError::Setup)?;

        let (wake_tx, wake_rx) = unbounded();
        let shared = Arc::new(Shared::new(
            ResponseAssembly::new(self.refiners, format),
            Arc::clone(&waker),
            wake_tx,
        ));
        let (jobs_tx, jobs_rx) = unbounded();
        let (stop_tx, stop_rx) = unbounded();
        let dispatcher = Dispatcher::new(Arc::clone(&shared), self.handler, jobs_tx.clone());
        let reaper = Reaper::new(jobs_rx, jobs_tx, stop_rx, Arc::clone(&shared));
        let stop = Arc::new(AtomicBool::new(false));
        let reactor = Reactor::build(
            poll,
            listener,
            self.factory,
            format,
            self.max_body_bytes,
            dispatcher,
            shared,
            wake_rx,
            self.invalid_keys,
            Arc::clone(&stop),
        );
        Ok(BoundServer {
            reactor,
            reaper,
            local_addr,
            stop,
            waker,
            stop_tx,
        })
    }
}

/// A server whose listener is bound and whose configuration is frozen.
pub struct BoundServer<F: MessageFactory> {
    reactor: Reactor<F>,
    reaper: Reaper<F::Output>,
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
    stop_tx: Sender<()>,
}

impl<F: MessageFactory> BoundServer<F> {
    /// The address the listener actually bound, useful with port 0.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr { self.local_addr }

    /// A handle that can stop the server from any thread.
    #[must_use]
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            stop: Arc::clone(&self.stop),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Spawn the reaper and block in the reactor loop until shut down.
    ///
    /// On return every connection, the listener and the reaper are gone;
    /// pending async replies are discarded.
    ///
    /// # Errors
    ///
    /// Propagates reactor failures; see [`ServerError`].
    pub fn run(self) -> Result<(), ServerError> {
        let reaper = self.reaper;
        let reaper_thread = thread::Builder::new()
            .name("reply-reaper".into())
            .spawn(move || reaper.run())
            .map_err(ServerError::Setup)?;

        let result = self.reactor.run();

        self.stop.store(true, Ordering::Release);
        drop(self.stop_tx);
        if reaper_thread.join().is_err() {
            log::error!("reply reaper panicked");
        }
        result
    }
}

/// Cloneable handle that stops a running server.
#[derive(Clone)]
pub struct ShutdownHandle {
    stop: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Request shutdown: sets the stop flag and wakes the selector.
    pub fn shutdown(&self) {
        self.stop.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            log::error!("shutdown wakeup failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};

    use super::*;
    use crate::{
        factory::{Message, RawFactory},
        handler::{ConnectionContext, HandlerError, PendingReply},
    };

    #[test]
    fn defaults_match_the_wire_contract() {
        let server = Server::new(RawFactory::new());
        assert_eq!(server.address.port(), DEFAULT_PORT);
        assert_eq!(server.max_body_bytes, DEFAULT_MAX_BODY_BYTES);
        assert!(server.handler.is_none());
    }

    #[test]
    fn handler_registration_is_last_writer_wins() {
        let sync = |_ctx: ConnectionContext<Bytes>, _msg: &Message<Bytes>| {
            Ok::<Option<BytesMut>, HandlerError>(None)
        };
        let asynchronous = |_msg: &Message<Bytes>| PendingReply::ready(None);

        let server = Server::new(RawFactory::new())
            .handler(sync)
            .async_handler(asynchronous);
        assert!(matches!(server.handler, Some(Registered::Async(_))));

        let server = Server::new(RawFactory::new())
            .async_handler(asynchronous)
            .handler(sync);
        assert!(matches!(server.handler, Some(Registered::Sync(_))));
    }

    #[test]
    fn bind_freezes_an_ephemeral_port() {
        let bound = Server::new(RawFactory::new())
            .address(([127, 0, 0, 1], 0).into())
            .bind()
            .expect("ephemeral bind succeeds");
        assert_ne!(bound.local_addr().port(), 0);
    }

    #[test]
    fn absurd_prefix_width_is_rejected() {
        struct WideFactory;
        impl MessageFactory for WideFactory {
            type Output = ();

            fn header_size(&self) -> usize { 12 }

            fn create(&self, _body: &[u8]) -> Result<(), crate::factory::CodecError> { Ok(()) }
        }

        assert!(matches!(
            Server::new(WideFactory).bind(),
            Err(ServerError::HeaderSize(12))
        ));
    }
}
