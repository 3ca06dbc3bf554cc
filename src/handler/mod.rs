//! Handler module - sequential event dispatch.
//!
//! A funnel drains a set of event receivers on one task and calls one handler
//! method per event, strictly one at a time. Handlers therefore never race
//! with each other, which makes a funnel the natural place to mutate
//! attendant context.
//!
//! Provides:
//! - [`ServerHandler`] + [`funnel`] - for a [`Server`](crate::Server)'s events
//! - [`AttendantHandler`] + [`funnel_attendant`] - for a dialed attendant
//!
//! # Example
//!
//! ```ignore
//! use conveyor::handler::{funnel, BoxFuture, ServerHandler};
//! use conveyor::{KwArgs, MessageEvent};
//!
//! struct Echo;
//!
//! impl ServerHandler for Echo {
//!     fn on_message(&mut self, event: MessageEvent) -> BoxFuture<'_, ()> {
//!         Box::pin(async move {
//!             let m = &event.message;
//!             let _ = event.attendant.send(m.command(), m.args(), m.kwargs()).await;
//!         })
//!     }
//! }
//!
//! let (server, events) = Server::builder().marshaler(JsonMarshaler::new()).build()?;
//! server.run("127.0.0.1:7000").await?;
//! let (_events, _echo) = funnel(events, Echo).await?;
//! ```

mod attendant;
mod server;

pub use crate::marshal::BoxFuture;
pub use attendant::{funnel_attendant, AttendantHandler};
pub use server::{funnel, ServerHandler};
