//! Public API for the `wirelay` library.
//!
//! `wirelay` is a single-reactor server runtime for length-prefixed binary
//! messages. One reactor thread runs the selector loop and owns every
//! connection's reader state and write queue; a reaper thread polls pending
//! asynchronous replies with bounded waits. Applications plug in a
//! [`MessageFactory`] codec, one [`MessageHandler`] or
//! [`AsyncMessageHandler`], and an ordered chain of [`ResponseRefiner`]s.
//!
//! ```no_run
//! use bytes::BytesMut;
//! use wirelay::{ConnectionContext, HandlerError, Message, RawFactory, Server};
//!
//! # fn main() -> Result<(), wirelay::ServerError> {
//! let echo = |_ctx: ConnectionContext<bytes::Bytes>, msg: &Message<bytes::Bytes>| {
//!     Ok::<_, HandlerError>(Some(BytesMut::from(&msg.raw()[..])))
//! };
//! let server = Server::new(RawFactory::new())
//!     .address(([0, 0, 0, 0], wirelay::DEFAULT_PORT).into())
//!     .handler(echo)
//!     .bind()?;
//! server.run()
//! # }
//! ```

pub mod factory;
pub mod framing;
pub mod handler;
pub mod reader;
pub mod registry;
pub mod writer;

mod dispatch;
mod reactor;
mod reaper;
mod response;
mod server;

pub use dispatch::Notifier;
pub use factory::{BincodeFactory, CodecError, Message, MessageFactory, RawFactory};
pub use framing::{Endianness, FramingError, LengthFormat};
pub use handler::{
    AsyncMessageHandler, ConnectionContext, DiscardInvalidKeys, HandlerError, InvalidKeyHandler,
    MessageHandler, PendingReply, ReplySlot, ReplyState, ResponseRefiner, reply_slot,
};
pub use reader::{FrameBuf, ReadError, Remainder, RequestReader};
pub use registry::ConnectionId;
pub use server::{
    BoundServer, DEFAULT_MAX_BODY_BYTES, DEFAULT_PORT, Server, ServerError, ShutdownHandle,
};
pub use writer::{DrainOutcome, OutboundQueue, WriteJob};
