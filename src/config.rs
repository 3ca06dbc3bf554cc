//! Server and attendant configuration.
//!
//! Capacities below their floor are raised silently when a server or
//! attendant is built; nothing here is ever rejected.

use std::time::Duration;

use crate::writer::WriterConfig;

/// Default capacity of the message and throttled channels.
pub const DEFAULT_MESSAGE_CAPACITY: usize = 256;

/// Smallest accepted capacity of the message and throttled channels.
pub const MIN_MESSAGE_CAPACITY: usize = 16;

/// Default capacity of lifecycle channels.
pub const DEFAULT_LIFECYCLE_CAPACITY: usize = 16;

/// Smallest accepted capacity of lifecycle channels.
pub const MIN_LIFECYCLE_CAPACITY: usize = 1;

/// Configuration for [`Server`](crate::Server).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Capacity of the `messages` and `throttled` channels.
    pub message_capacity: usize,
    /// Capacity of the `started`, `accept_failed`, `attendant_started`,
    /// `attendant_stopped` and `stopped` channels.
    pub lifecycle_capacity: usize,
    /// Throttle given to every accepted attendant. Zero disables it.
    pub default_throttle: Duration,
    /// Writer task settings for every accepted attendant.
    pub writer: WriterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            message_capacity: DEFAULT_MESSAGE_CAPACITY,
            lifecycle_capacity: DEFAULT_LIFECYCLE_CAPACITY,
            default_throttle: Duration::ZERO,
            writer: WriterConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Apply capacity floors.
    pub(crate) fn normalized(mut self) -> Self {
        self.message_capacity = self.message_capacity.max(MIN_MESSAGE_CAPACITY);
        self.lifecycle_capacity = self.lifecycle_capacity.max(MIN_LIFECYCLE_CAPACITY);
        self.writer.channel_capacity = self.writer.channel_capacity.max(1);
        self
    }
}

/// Configuration for a dialed attendant, see
/// [`Attendant::connect`](crate::Attendant::connect).
#[derive(Debug, Clone)]
pub struct AttendantConfig {
    /// Capacity of the `messages` and `throttled` channels.
    pub message_capacity: usize,
    /// Capacity of the lifecycle channel.
    pub lifecycle_capacity: usize,
    /// Minimum spacing between admitted messages. Zero disables throttling.
    pub throttle: Duration,
    /// Writer task settings.
    pub writer: WriterConfig,
}

impl Default for AttendantConfig {
    fn default() -> Self {
        Self {
            message_capacity: DEFAULT_MESSAGE_CAPACITY,
            lifecycle_capacity: DEFAULT_LIFECYCLE_CAPACITY,
            throttle: Duration::ZERO,
            writer: WriterConfig::default(),
        }
    }
}

impl AttendantConfig {
    pub(crate) fn normalized(mut self) -> Self {
        self.message_capacity = self.message_capacity.max(MIN_MESSAGE_CAPACITY);
        self.lifecycle_capacity = self.lifecycle_capacity.max(MIN_LIFECYCLE_CAPACITY);
        self.writer.channel_capacity = self.writer.channel_capacity.max(1);
        self
    }
}
