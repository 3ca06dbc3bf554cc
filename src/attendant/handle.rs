//! The attendant handle and its state machine.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use super::read_loop::read_loop;
use crate::config::AttendantConfig;
use crate::error::{ConveyorError, Result};
use crate::event::{attendant_channels, AttendantChannels, AttendantEvents, AttendantLifecycle};
use crate::marshal::{Marshaler, MessageEncoder, MessageReceiver};
use crate::message::{KwArgs, Message, Value};
use crate::writer::{spawn_writer_task, WriterConfig, WriterHandle};

const STATUS_NEW: u8 = 0;
const STATUS_RUNNING: u8 = 1;
const STATUS_STOPPED: u8 = 2;

/// Lifecycle state of an attendant. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendantStatus {
    New,
    Running,
    Stopped,
}

impl AttendantStatus {
    fn from_u8(raw: u8) -> Self {
        match raw {
            STATUS_NEW => Self::New,
            STATUS_RUNNING => Self::Running,
            _ => Self::Stopped,
        }
    }
}

/// Identity of an attendant.
///
/// Shared by all clones of one handle; unique among live attendants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AttendantId(usize);

impl fmt::Display for AttendantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Receiver and channels held until `start` hands them to the read loop.
struct Pending {
    receiver: Box<dyn MessageReceiver>,
    channels: AttendantChannels,
}

pub(super) struct Inner {
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    status: AtomicU8,
    throttle_nanos: AtomicU64,
    context: Mutex<HashMap<String, Value>>,
    encoder: Box<dyn MessageEncoder>,
    writer: WriterHandle,
    pub(super) shutdown: CancellationToken,
    pending: Mutex<Option<Pending>>,
}

/// One connection, supervised.
///
/// An attendant owns a TCP connection and a marshaler instance bound to it.
/// Once started, a read loop decodes incoming messages and publishes them on
/// the channels given at construction; outgoing messages go through
/// [`send`](Self::send). The handle is cheap to clone and every clone refers
/// to the same connection.
///
/// ```text
/// New ──start()──► Running ──stop() / peer close / read error──► Stopped
///  └────────────────────stop()──────────────────────────────────────┘
/// ```
#[derive(Clone)]
pub struct Attendant {
    pub(super) inner: Arc<Inner>,
}

impl Attendant {
    /// Wrap an established connection.
    ///
    /// Binds a fresh marshaler instance to the read half and spawns the writer
    /// task for the write half, so it must be called inside a tokio runtime.
    /// Nothing is read until [`start`](Self::start).
    pub fn new(
        stream: TcpStream,
        marshaler: &dyn Marshaler,
        throttle: Duration,
        channels: AttendantChannels,
        writer_config: &WriterConfig,
    ) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        let (read_half, write_half) = stream.into_split();

        let (receiver, encoder) = marshaler.create(Box::pin(read_half));
        let shutdown = CancellationToken::new();
        let (writer, _task) = spawn_writer_task(write_half, writer_config, shutdown.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                peer_addr,
                local_addr,
                status: AtomicU8::new(STATUS_NEW),
                throttle_nanos: AtomicU64::new(duration_to_nanos(throttle)),
                context: Mutex::new(HashMap::new()),
                encoder,
                writer,
                shutdown,
                pending: Mutex::new(Some(Pending { receiver, channels })),
            }),
        })
    }

    /// Dial `host` and wrap the connection in a new attendant.
    ///
    /// The attendant publishes on its own channels, returned alongside it.
    /// Call [`start`](Self::start) to begin reading.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let (client, mut events) =
    ///     Attendant::connect("127.0.0.1:7000", &JsonMarshaler::new(), AttendantConfig::default()).await?;
    /// client.start().await?;
    /// client.send("PING", &[], &KwArgs::new()).await?;
    /// let reply = events.messages.recv().await;
    /// ```
    pub async fn connect(
        host: &str,
        marshaler: &dyn Marshaler,
        config: AttendantConfig,
    ) -> Result<(Self, AttendantEvents)> {
        let config = config.normalized();
        let stream = TcpStream::connect(host).await?;
        let (channels, events) = attendant_channels(config.lifecycle_capacity, config.message_capacity);
        let attendant = Self::new(stream, marshaler, config.throttle, channels, &config.writer)?;
        Ok((attendant, events))
    }

    /// Start the read loop.
    ///
    /// Publishes [`AttendantLifecycle::Started`] before the first read, so the
    /// start notification always precedes this attendant's messages.
    ///
    /// Fails with [`ConveyorError::AttendantNotNew`] unless the attendant is new.
    pub async fn start(&self) -> Result<()> {
        self.inner
            .status
            .compare_exchange(STATUS_NEW, STATUS_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| ConveyorError::AttendantNotNew)?;

        let pending = self.inner.pending.lock().take();
        let Pending { receiver, channels } = pending.ok_or(ConveyorError::AttendantNotNew)?;

        tracing::debug!(attendant = %self.id(), peer = ?self.inner.peer_addr, "attendant started");
        let _ = channels
            .lifecycle
            .send(AttendantLifecycle::Started(self.clone()))
            .await;

        tokio::spawn(read_loop(self.clone(), receiver, channels));
        Ok(())
    }

    /// Stop the attendant and close its connection.
    ///
    /// A running attendant reports a [`StopType::Local`](crate::StopType::Local)
    /// stop from its read loop. A never started attendant closes without
    /// publishing anything.
    ///
    /// Fails with [`ConveyorError::AttendantAlreadyStopped`] if already stopped,
    /// including when the read loop ended on its own first.
    pub fn stop(&self) -> Result<()> {
        let previous = self.inner.status.swap(STATUS_STOPPED, Ordering::AcqRel);
        if previous == STATUS_STOPPED {
            return Err(ConveyorError::AttendantAlreadyStopped);
        }

        self.inner.shutdown.cancel();
        if previous == STATUS_NEW {
            drop(self.inner.pending.lock().take());
        }
        Ok(())
    }

    /// Encode a message and queue it for writing.
    ///
    /// Waits while the outgoing queue is full. Fails with
    /// [`ConveyorError::AttendantStopped`] once stopped, or
    /// [`ConveyorError::ConnectionClosed`] if the connection can no longer be
    /// written.
    pub async fn send(&self, command: &str, args: &[Value], kwargs: &KwArgs) -> Result<()> {
        if self.status() == AttendantStatus::Stopped {
            return Err(ConveyorError::AttendantStopped);
        }

        let frame = self.inner.encoder.encode(command, args, kwargs)?;
        self.inner.writer.send(frame).await
    }

    /// Send an already built message.
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        self.send(message.command(), message.args(), message.kwargs())
            .await
    }

    /// Look up a context value.
    pub fn context(&self, key: &str) -> Option<Value> {
        self.inner.context.lock().get(key).cloned()
    }

    /// Store a context value, replacing any previous one.
    pub fn set_context(&self, key: impl Into<String>, value: Value) {
        self.inner.context.lock().insert(key.into(), value);
    }

    /// Remove a context value, returning it.
    pub fn remove_context(&self, key: &str) -> Option<Value> {
        self.inner.context.lock().remove(key)
    }

    /// Minimum spacing between admitted messages. Zero means disabled.
    pub fn throttle(&self) -> Duration {
        Duration::from_nanos(self.inner.throttle_nanos.load(Ordering::Relaxed))
    }

    /// Change the throttle. Takes effect from the next received message.
    pub fn set_throttle(&self, throttle: Duration) {
        self.inner
            .throttle_nanos
            .store(duration_to_nanos(throttle), Ordering::Relaxed);
    }

    /// Change the throttle from a signed nanosecond count.
    ///
    /// Negative values are taken as their absolute value: `-5ms` behaves
    /// exactly like `5ms`.
    pub fn set_throttle_signed(&self, nanos: i64) {
        self.inner
            .throttle_nanos
            .store(nanos.unsigned_abs(), Ordering::Relaxed);
    }

    /// Move from running to stopped on behalf of the read loop.
    ///
    /// Returns `false` if [`stop`](Self::stop) got there first.
    pub(super) fn claim_stop(&self) -> bool {
        self.inner
            .status
            .compare_exchange(STATUS_RUNNING, STATUS_STOPPED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Identity shared by every clone of this handle.
    pub fn id(&self) -> AttendantId {
        AttendantId(Arc::as_ptr(&self.inner) as usize)
    }

    /// Current lifecycle state.
    pub fn status(&self) -> AttendantStatus {
        AttendantStatus::from_u8(self.inner.status.load(Ordering::Acquire))
    }

    /// Address of the remote end.
    pub fn peer_addr(&self) -> SocketAddr {
        self.inner.peer_addr
    }

    /// Address of the local end.
    pub fn local_addr(&self) -> SocketAddr {
        self.inner.local_addr
    }
}

impl PartialEq for Attendant {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Attendant {}

impl fmt::Debug for Attendant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Attendant")
            .field("id", &self.id())
            .field("peer_addr", &self.inner.peer_addr)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

fn duration_to_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}
