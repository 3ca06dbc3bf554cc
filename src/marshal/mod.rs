//! Marshalers - pluggable codecs between byte streams and [`Message`]s.
//!
//! A [`Marshaler`] is a factory. Each attendant invokes [`Marshaler::create`]
//! once over its own connection and gets back a bound pair:
//!
//! - a [`MessageReceiver`] that owns the read half and yields one decoded
//!   message per `receive()` call;
//! - a [`MessageEncoder`] that turns `(command, args, kwargs)` into the
//!   bytes of one frame. The attendant's writer task writes those bytes.
//!
//! Receivers flag a clean remote close by returning
//! [`ConveyorError::ConnectionClosed`](crate::ConveyorError::ConnectionClosed).
//! Any other error ends the connection as an abnormal stop.
//!
//! Bundled implementations:
//!
//! - [`JsonMarshaler`] - newline-delimited JSON objects
//! - [`MsgPackMarshaler`] - length-prefixed MessagePack maps
//!
//! # Example
//!
//! ```ignore
//! use conveyor::marshal::{JsonMarshaler, Marshaler};
//!
//! let (mut receiver, encoder) = JsonMarshaler::default().create(Box::pin(read_half));
//! let frame = encoder.encode("PING", &[], &Default::default())?;
//! let message = receiver.receive().await?;
//! ```

mod frame_buffer;
mod json;
mod msgpack;

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use tokio::io::AsyncRead;

use crate::error::Result;
use crate::message::{KwArgs, Message, Value};

pub use frame_buffer::{FrameBuffer, DEFAULT_MAX_PAYLOAD_SIZE, LENGTH_PREFIX_SIZE};
pub use json::{JsonMarshaler, DEFAULT_MAX_LINE_LENGTH};
pub use msgpack::MsgPackMarshaler;

/// Boxed future for receiver results.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Read half handed to a marshaler instance.
pub type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;

/// Factory that binds marshaler instances to streams.
pub trait Marshaler: Send + Sync + 'static {
    /// Bind a fresh instance to one stream's read half.
    ///
    /// The returned pair must never be shared across streams.
    fn create(&self, reader: BoxedReader) -> (Box<dyn MessageReceiver>, Box<dyn MessageEncoder>);
}

/// Decoding side of a bound marshaler instance.
pub trait MessageReceiver: Send + 'static {
    /// Wait for the next complete message.
    fn receive(&mut self) -> BoxFuture<'_, Result<Message>>;
}

/// Encoding side of a bound marshaler instance.
pub trait MessageEncoder: Send + Sync + 'static {
    /// Serialize one message into a ready-to-write frame.
    fn encode(&self, command: &str, args: &[Value], kwargs: &KwArgs) -> Result<Bytes>;
}
