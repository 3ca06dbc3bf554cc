//! Transport module - TCP listening and accepting.
//!
//! The [`Dispatcher`] owns the listener; everything above it sees accepted
//! `TcpStream`s through the [`DispatchHandler`] callbacks.

mod dispatcher;

pub use dispatcher::{Closer, DispatchHandler, Dispatcher};
