//! Attendants - one supervised actor per connection.
//!
//! An [`Attendant`] wraps a single TCP connection together with a marshaler
//! instance bound to it. After [`Attendant::start`] a read loop task decodes
//! messages and publishes them:
//!
//! - admitted messages on the `messages` channel,
//! - messages arriving faster than the throttle allows on `throttled`,
//! - one `Started` and exactly one `Stopped` notification on `lifecycle`.
//!
//! The stop notification says why the attendant stopped: a local
//! [`stop`](Attendant::stop), a clean close by the peer, or an error.
//!
//! # Example
//!
//! ```ignore
//! use conveyor::{Attendant, AttendantConfig, JsonMarshaler, KwArgs};
//!
//! let (attendant, mut events) =
//!     Attendant::connect("127.0.0.1:7000", &JsonMarshaler::new(), AttendantConfig::default()).await?;
//! attendant.start().await?;
//! attendant.send("PING", &[], &KwArgs::new()).await?;
//!
//! while let Some(event) = events.messages.recv().await {
//!     println!("{}", event.message.command());
//! }
//! ```

mod handle;
mod read_loop;
mod throttle;

pub use handle::{Attendant, AttendantId, AttendantStatus};
