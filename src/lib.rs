//! # conveyor
//!
//! Connection-oriented TCP server framework on tokio.
//!
//! Raw accept and read activity is turned into a typed, backpressured event
//! stream, and every connection gets an independently supervised lifecycle.
//! Suited for message-oriented protocols: games, chat, RPC-like services.
//!
//! ## Architecture
//!
//! - **Dispatcher** ([`transport`]): owns the TCP listener and the accept loop
//! - **Attendant** ([`attendant`]): one actor per connection with its own read
//!   loop, throttle and stop classification
//! - **Server** ([`server`]): a dispatcher plus the live attendants, with seven
//!   event channels, broadcast and coordinated shutdown
//! - **Marshalers** ([`marshal`]): pluggable wire formats; JSON lines and
//!   length-prefixed MessagePack ship with the crate
//! - **Funnels** ([`handler`]): optional sequential event dispatch
//!
//! ## Example
//!
//! ```ignore
//! use conveyor::{JsonMarshaler, KwArgs, Server};
//!
//! #[tokio::main]
//! async fn main() -> conveyor::Result<()> {
//!     let (server, mut events) = Server::builder()
//!         .marshaler(JsonMarshaler::new())
//!         .build()?;
//!     server.run("127.0.0.1:7000").await?;
//!
//!     while let Some(event) = events.messages.recv().await {
//!         if event.message.command() == "PING" {
//!             event.attendant.send("PONG", &[], &KwArgs::new()).await?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```

pub mod attendant;
pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod marshal;
pub mod message;
pub mod server;
pub mod transport;
pub mod writer;

pub use attendant::{Attendant, AttendantId, AttendantStatus};
pub use config::{AttendantConfig, ServerConfig};
pub use error::{ConveyorError, Result};
pub use event::{
    AcceptFailed, AttendantEvents, AttendantStopped, MessageEvent, StopType, Started, Stopped,
    Throttled,
};
pub use marshal::{JsonMarshaler, Marshaler, MsgPackMarshaler};
pub use message::{Args, KwArgs, Message, Value};
pub use server::{Server, ServerBuilder, ServerEvents};
