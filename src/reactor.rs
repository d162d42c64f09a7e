//! The selector-driven event loop.
//!
//! One reactor thread owns the `mio::Poll`, the listening socket and every
//! connection's reader, working buffers and write queue. Readiness is
//! dispatched in-line: accepts register new connections for read interest,
//! reads drive frame decoding and dispatch, writes drain the outbound
//! queue. After handling a connection the reactor reconciles its interest
//! set so write interest always mirrors a non-empty queue.
//!
//! Off-thread work (the reaper, notifiers) never touches the poll directly;
//! it appends to a connection's queue, posts the connection id on the wake
//! channel and wakes the selector. The reactor drains that channel at the
//! end of every iteration.

use std::{
    collections::HashMap,
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use crossbeam_channel::Receiver;
use mio::{
    Events, Interest, Poll, Token,
    net::{TcpListener, TcpStream},
};

use crate::{
    dispatch::{DispatchError, Dispatcher, Shared},
    factory::MessageFactory,
    framing::LengthFormat,
    handler::InvalidKeyHandler,
    reader::{FrameBuf, RequestReader},
    registry::ConnectionId,
    server::ServerError,
    writer::OutboundQueue,
};

pub(crate) const LISTENER: Token = Token(0);
pub(crate) const WAKER: Token = Token(1);
const FIRST_CONNECTION: usize = 2;
const LISTENER_LABEL: &str = "listener";
const EVENTS_CAPACITY: usize = 1024;

fn token_for(id: ConnectionId) -> Token { Token(id.0 as usize + FIRST_CONNECTION) }

fn id_for(token: Token) -> ConnectionId { ConnectionId((token.0 - FIRST_CONNECTION) as u64) }

/// Per-connection state, owned exclusively by the reactor thread.
struct Connection<F: MessageFactory> {
    id: ConnectionId,
    label: Arc<str>,
    stream: TcpStream,
    reader: RequestReader<F>,
    header_buf: FrameBuf,
    body_buf: FrameBuf,
    outbound: Arc<OutboundQueue>,
    interest: Interest,
}

pub(crate) struct Reactor<F: MessageFactory> {
    poll: Poll,
    listener: TcpListener,
    factory: Arc<F>,
    format: LengthFormat,
    max_body_bytes: usize,
    dispatcher: Dispatcher<F::Output>,
    shared: Arc<Shared<F::Output>>,
    wake_rx: Receiver<ConnectionId>,
    invalid_keys: Box<dyn InvalidKeyHandler>,
    stop: Arc<AtomicBool>,
    events: Events,
    connections: HashMap<Token, Connection<F>>,
    next_id: u64,
}

impl<F: MessageFactory> Reactor<F> {
    pub(crate) fn build(
        poll: Poll,
        listener: TcpListener,
        factory: Arc<F>,
        format: LengthFormat,
        max_body_bytes: usize,
        dispatcher: Dispatcher<F::Output>,
        shared: Arc<Shared<F::Output>>,
        wake_rx: Receiver<ConnectionId>,
        invalid_keys: Box<dyn InvalidKeyHandler>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            poll,
            listener,
            factory,
            format,
            max_body_bytes,
            dispatcher,
            shared,
            wake_rx,
            invalid_keys,
            stop,
            events: Events::with_capacity(EVENTS_CAPACITY),
            connections: HashMap::new(),
            next_id: 0,
        }
    }

    /// Block on the selector and dispatch readiness until shut down.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Poll`] if the selector fails and
    /// [`ServerError::AsyncHandlingStopped`] when async dispatch finds the
    /// reaper gone.
    pub(crate) fn run(mut self) -> Result<(), ServerError> {
        if let Ok(addr) = self.listener.local_addr() {
            log::info!("[{LISTENER_LABEL}] listening on {addr}");
        }
        loop {
            if let Err(e) = self.poll.poll(&mut self.events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(ServerError::Poll(e));
            }
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            let events = std::mem::replace(&mut self.events, Events::with_capacity(0));
            let mut fatal = None;
            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_ready(),
                    WAKER => {}
                    token => {
                        let readable = event.is_readable() || event.is_error();
                        if let Err(err) =
                            self.connection_ready(token, readable, event.is_writable())
                        {
                            fatal = Some(err);
                            break;
                        }
                    }
                }
            }
            self.events = events;
            if let Some(err) = fatal {
                return Err(err);
            }
            self.drain_write_requests();
            if self.stop.load(Ordering::Acquire) {
                break;
            }
        }
        log::info!("[{LISTENER_LABEL}] shutting down");
        Ok(())
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let id = ConnectionId(self.next_id);
                    self.next_id += 1;
                    let token = token_for(id);
                    let label: Arc<str> = format!("client {id}").into();
                    if let Err(err) =
                        self.poll
                            .registry()
                            .register(&mut stream, token, Interest::READABLE)
                    {
                        log::error!("[{LISTENER_LABEL}] failed to register {peer}: {err}");
                        continue;
                    }
                    let outbound = Arc::new(OutboundQueue::new());
                    self.shared.registry.insert(id, &outbound);
                    let reader = RequestReader::new(
                        Arc::clone(&label),
                        Arc::clone(&self.factory),
                        self.format,
                        self.max_body_bytes,
                    );
                    self.connections.insert(
                        token,
                        Connection {
                            id,
                            label: Arc::clone(&label),
                            stream,
                            reader,
                            header_buf: FrameBuf::with_capacity(self.format.width()),
                            body_buf: FrameBuf::with_capacity(self.max_body_bytes),
                            outbound,
                            interest: Interest::READABLE,
                        },
                    );
                    log::debug!("[{LISTENER_LABEL}] accepted {peer} as {label}");
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    log::error!("[{LISTENER_LABEL}] accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn connection_ready(
        &mut self,
        token: Token,
        readable: bool,
        writable: bool,
    ) -> Result<(), ServerError> {
        if !self.connections.contains_key(&token) {
            self.invalid_keys.handle(id_for(token));
            return Ok(());
        }
        if readable && !self.read_ready(token)? {
            return Ok(());
        }
        if writable && !self.write_ready(token) {
            return Ok(());
        }
        self.sync_interest(token);
        Ok(())
    }

    /// Drive read cycles until the socket runs dry, dispatching every
    /// message that completes. Returns whether the connection survived.
    fn read_ready(&mut self, token: Token) -> Result<bool, ServerError> {
        loop {
            let conn = self.connections.get_mut(&token).expect("presence checked");
            let mut remainder = match conn.reader.read(
                &mut conn.stream,
                &mut conn.header_buf,
                &mut conn.body_buf,
            ) {
                Ok(remainder) => remainder,
                Err(err) => {
                    log::warn!("[{}] closing connection: {err}", conn.label);
                    self.close(token);
                    return Ok(false);
                }
            };
            let mut extracted = 0usize;
            loop {
                let conn = self.connections.get_mut(&token).expect("presence checked");
                let Some(message) = conn.reader.take_message() else {
                    break;
                };
                extracted += 1;
                conn.reader.reset();
                conn.header_buf.reset();
                conn.body_buf.reset();
                let carried = !remainder.is_empty();
                if carried {
                    conn.header_buf.preload(&remainder.header);
                    conn.body_buf.preload(&remainder.body);
                }
                let id = conn.id;
                let label = Arc::clone(&conn.label);
                match self.dispatcher.dispatch(id, &label, message) {
                    Ok(()) => {}
                    Err(DispatchError::Handler(err)) => {
                        log::warn!("[{label}] {err}; closing connection");
                        self.close(token);
                        return Ok(false);
                    }
                    Err(err @ DispatchError::QueueClosed) => {
                        log::error!("{err}");
                        return Err(ServerError::AsyncHandlingStopped);
                    }
                }
                if !carried {
                    break;
                }
                let conn = self.connections.get_mut(&token).expect("presence checked");
                remainder =
                    match conn.reader.read_preloaded(&mut conn.header_buf, &mut conn.body_buf) {
                        Ok(remainder) => remainder,
                        Err(err) => {
                            log::warn!("[{}] closing connection: {err}", conn.label);
                            self.close(token);
                            return Ok(false);
                        }
                    };
            }
            let conn = self.connections.get_mut(&token).expect("presence checked");
            if conn.reader.is_end_of_stream() {
                self.close(token);
                return Ok(false);
            }
            if extracted == 0 {
                return Ok(true);
            }
            // A message completed, so the last fill may have stopped on full
            // buffers rather than a dry socket; read again.
        }
    }

    /// Drain the connection's write queue. Returns whether it survived.
    fn write_ready(&mut self, token: Token) -> bool {
        let conn = self.connections.get_mut(&token).expect("presence checked");
        match conn.outbound.drain(&mut conn.stream) {
            Ok(_) => true,
            Err(err) => {
                log::error!("[{}] write failed: {err}; closing connection", conn.label);
                self.close(token);
                false
            }
        }
    }

    /// Reconcile the registered interest set with the write queue: write
    /// interest is set exactly while the queue is non-empty.
    fn sync_interest(&mut self, token: Token) {
        let Some(conn) = self.connections.get_mut(&token) else {
            return;
        };
        let desired = if conn.outbound.is_empty() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };
        if desired == conn.interest {
            return;
        }
        match self
            .poll
            .registry()
            .reregister(&mut conn.stream, token, desired)
        {
            Ok(()) => conn.interest = desired,
            Err(err) => {
                log::error!(
                    "[{}] interest update failed: {err}; closing connection",
                    conn.label
                );
                self.close(token);
            }
        }
    }

    /// Serve write requests posted from off-thread. Draining immediately
    /// (rather than only raising interest) closes the window where a queue
    /// refilled right after emptying would leave the interest bits unchanged
    /// and the edge never re-reported.
    fn drain_write_requests(&mut self) {
        while let Ok(id) = self.wake_rx.try_recv() {
            let token = token_for(id);
            if self.connections.contains_key(&token) {
                if self.write_ready(token) {
                    self.sync_interest(token);
                }
            } else {
                log::trace!("[client {id}] write request for a closed connection ignored");
            }
        }
    }

    fn close(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            self.shared.registry.remove(conn.id);
            if let Err(e) = self.poll.registry().deregister(&mut conn.stream) {
                log::debug!("[{}] deregister failed: {e}", conn.label);
            }
            log::debug!("[{}] connection closed", conn.label);
        }
    }
}
