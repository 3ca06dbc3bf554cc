//! Events published by attendants and servers.
//!
//! Every event travels over a bounded `tokio::sync::mpsc` channel. A consumer
//! that falls behind makes the producer wait, which in turn slows down reading
//! from the network.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::attendant::Attendant;
use crate::config::{MIN_LIFECYCLE_CAPACITY, MIN_MESSAGE_CAPACITY};
use crate::error::ConveyorError;
use crate::message::Message;

/// Why an attendant stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StopType {
    /// `stop()` was called on this side.
    Local,
    /// The peer closed the connection cleanly.
    Remote,
    /// A read or decode error ended the connection.
    Abnormal,
}

/// The server's listener is bound and accepting.
#[derive(Debug, Clone, Copy)]
pub struct Started {
    pub addr: SocketAddr,
}

/// Accepting a connection failed; the server keeps accepting.
#[derive(Debug)]
pub struct AcceptFailed {
    pub error: io::Error,
}

/// A message admitted by the attendant's throttle.
#[derive(Debug, Clone)]
pub struct MessageEvent {
    pub attendant: Attendant,
    pub message: Message,
}

/// A message that arrived sooner than the attendant's throttle allows.
#[derive(Debug, Clone)]
pub struct Throttled {
    pub attendant: Attendant,
    pub message: Message,
    /// When the message was received.
    pub instant: Instant,
    /// Time elapsed since the last admitted message.
    pub lapse: Duration,
}

/// An attendant reached its terminal state.
#[derive(Debug)]
pub struct AttendantStopped {
    pub attendant: Attendant,
    pub stop_type: StopType,
    /// Set only for [`StopType::Abnormal`].
    pub error: Option<ConveyorError>,
}

/// The server's accept loop has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Stopped;

/// Start and stop notifications of one attendant.
///
/// Both travel on the same channel so that an attendant's `Started` is always
/// received before its `Stopped`.
#[derive(Debug)]
pub enum AttendantLifecycle {
    Started(Attendant),
    Stopped(AttendantStopped),
}

/// Sending side of the channels an attendant publishes on.
#[derive(Debug, Clone)]
pub struct AttendantChannels {
    pub lifecycle: mpsc::Sender<AttendantLifecycle>,
    pub messages: mpsc::Sender<MessageEvent>,
    pub throttled: mpsc::Sender<Throttled>,
}

/// Receiving side matching [`AttendantChannels`].
#[derive(Debug)]
pub struct AttendantEvents {
    pub lifecycle: mpsc::Receiver<AttendantLifecycle>,
    pub messages: mpsc::Receiver<MessageEvent>,
    pub throttled: mpsc::Receiver<Throttled>,
}

/// Create a connected channel set.
///
/// Capacities below [`MIN_LIFECYCLE_CAPACITY`] and [`MIN_MESSAGE_CAPACITY`]
/// are raised to those floors.
pub fn attendant_channels(
    lifecycle_capacity: usize,
    message_capacity: usize,
) -> (AttendantChannels, AttendantEvents) {
    let lifecycle_capacity = lifecycle_capacity.max(MIN_LIFECYCLE_CAPACITY);
    let message_capacity = message_capacity.max(MIN_MESSAGE_CAPACITY);
    let (lifecycle_tx, lifecycle_rx) = mpsc::channel(lifecycle_capacity);
    let (messages_tx, messages_rx) = mpsc::channel(message_capacity);
    let (throttled_tx, throttled_rx) = mpsc::channel(message_capacity);

    (
        AttendantChannels {
            lifecycle: lifecycle_tx,
            messages: messages_tx,
            throttled: throttled_tx,
        },
        AttendantEvents {
            lifecycle: lifecycle_rx,
            messages: messages_rx,
            throttled: throttled_rx,
        },
    )
}
