//! The server: a dispatcher plus the set of attendants it accepted.
//!
//! Every accepted connection becomes an [`Attendant`] that is started right
//! away on the accept task. Attendants publish their messages straight onto
//! the server's `messages`/`throttled` channels. Their start and stop
//! notifications go through a private fan-in task instead, which keeps the
//! attendant set up to date and republishes each notification once the set
//! reflects it.
//!
//! ```text
//! Dispatcher ─accept─► Attendant ─┬─► messages, throttled
//!     │                           └─► lifecycle ─► fan-in ─► attendant_started,
//!     │                                          (owns set)  attendant_stopped
//!     └─► started, accept_failed, stopped
//! ```
//!
//! # Example
//!
//! ```ignore
//! use conveyor::{JsonMarshaler, Server};
//!
//! let (server, mut events) = Server::builder()
//!     .marshaler(JsonMarshaler::new())
//!     .default_throttle(Duration::from_millis(50))
//!     .build()?;
//! server.run("0.0.0.0:7000").await?;
//!
//! while let Some(event) = events.messages.recv().await {
//!     event.attendant.send("ECHO", event.message.args(), event.message.kwargs()).await?;
//! }
//! ```

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::attendant::{Attendant, AttendantId};
use crate::config::ServerConfig;
use crate::error::{ConveyorError, Result};
use crate::event::{
    AcceptFailed, AttendantChannels, AttendantLifecycle, AttendantStopped, MessageEvent, Started,
    Stopped, Throttled,
};
use crate::marshal::{BoxFuture, Marshaler};
use crate::transport::{Closer, DispatchHandler, Dispatcher};
use crate::writer::WriterConfig;

/// Capacity of the channel between attendants and the fan-in task.
const FAN_IN_CAPACITY: usize = 1;

type AttendantSet = Arc<RwLock<HashMap<AttendantId, Attendant>>>;

/// Receiving ends of a server's seven event channels.
#[derive(Debug)]
pub struct ServerEvents {
    pub started: mpsc::Receiver<Started>,
    pub accept_failed: mpsc::Receiver<AcceptFailed>,
    pub attendant_started: mpsc::Receiver<Attendant>,
    pub messages: mpsc::Receiver<MessageEvent>,
    pub throttled: mpsc::Receiver<Throttled>,
    pub attendant_stopped: mpsc::Receiver<AttendantStopped>,
    pub stopped: mpsc::Receiver<Stopped>,
}

struct Outbound {
    started: mpsc::Sender<Started>,
    accept_failed: mpsc::Sender<AcceptFailed>,
    attendant_started: mpsc::Sender<Attendant>,
    messages: mpsc::Sender<MessageEvent>,
    throttled: mpsc::Sender<Throttled>,
    attendant_stopped: mpsc::Sender<AttendantStopped>,
    stopped: mpsc::Sender<Stopped>,
}

fn event_channels(config: &ServerConfig) -> (Outbound, ServerEvents) {
    let lifecycle = config.lifecycle_capacity;
    let (started_tx, started_rx) = mpsc::channel(lifecycle);
    let (accept_failed_tx, accept_failed_rx) = mpsc::channel(lifecycle);
    let (attendant_started_tx, attendant_started_rx) = mpsc::channel(lifecycle);
    let (messages_tx, messages_rx) = mpsc::channel(config.message_capacity);
    let (throttled_tx, throttled_rx) = mpsc::channel(config.message_capacity);
    let (attendant_stopped_tx, attendant_stopped_rx) = mpsc::channel(lifecycle);
    let (stopped_tx, stopped_rx) = mpsc::channel(lifecycle);

    (
        Outbound {
            started: started_tx,
            accept_failed: accept_failed_tx,
            attendant_started: attendant_started_tx,
            messages: messages_tx,
            throttled: throttled_tx,
            attendant_stopped: attendant_stopped_tx,
            stopped: stopped_tx,
        },
        ServerEvents {
            started: started_rx,
            accept_failed: accept_failed_rx,
            attendant_started: attendant_started_rx,
            messages: messages_rx,
            throttled: throttled_rx,
            attendant_stopped: attendant_stopped_rx,
            stopped: stopped_rx,
        },
    )
}

/// Builder for configuring and creating a [`Server`].
pub struct ServerBuilder {
    marshaler: Option<Arc<dyn Marshaler>>,
    config: ServerConfig,
}

impl ServerBuilder {
    /// Create a builder with default configuration and no marshaler.
    pub fn new() -> Self {
        Self {
            marshaler: None,
            config: ServerConfig::default(),
        }
    }

    /// Set the marshaler used for every accepted connection. Required.
    pub fn marshaler<M: Marshaler>(mut self, marshaler: M) -> Self {
        self.marshaler = Some(Arc::new(marshaler));
        self
    }

    /// Set a marshaler shared with other servers.
    pub fn shared_marshaler(mut self, marshaler: Arc<dyn Marshaler>) -> Self {
        self.marshaler = Some(marshaler);
        self
    }

    /// Capacity of the `messages` and `throttled` channels.
    ///
    /// Default: 256, minimum 16
    pub fn message_capacity(mut self, capacity: usize) -> Self {
        self.config.message_capacity = capacity;
        self
    }

    /// Capacity of the lifecycle channels.
    ///
    /// Default: 16, minimum 1
    pub fn lifecycle_capacity(mut self, capacity: usize) -> Self {
        self.config.lifecycle_capacity = capacity;
        self
    }

    /// Throttle applied to every new attendant.
    ///
    /// Default: zero (disabled)
    pub fn default_throttle(mut self, throttle: Duration) -> Self {
        self.config.default_throttle = throttle;
        self
    }

    /// Writer task settings for every new attendant.
    pub fn writer_config(mut self, writer: WriterConfig) -> Self {
        self.config.writer = writer;
        self
    }

    /// Replace the whole configuration.
    pub fn config(mut self, config: ServerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the server and its event receivers.
    ///
    /// Fails with [`ConveyorError::Argument`] if no marshaler was given.
    pub fn build(self) -> Result<(Server, ServerEvents)> {
        let marshaler = self
            .marshaler
            .ok_or_else(|| ConveyorError::Argument("marshaler".to_string()))?;
        let config = self.config.normalized();
        let (outbound, events) = event_channels(&config);

        let core = Arc::new(ServerCore {
            marshaler,
            config,
            outbound,
            attendants: Arc::new(RwLock::new(HashMap::new())),
            run: Mutex::new(None),
            closing: Arc::new(AtomicBool::new(false)),
        });
        let dispatcher = Dispatcher::new(Arc::clone(&core) as Arc<dyn DispatchHandler>);

        let server = Server {
            dispatcher,
            core,
            closer: Mutex::new(None),
        };
        Ok((server, events))
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A TCP server that supervises one [`Attendant`] per connection.
///
/// Created through [`Server::builder`]. Events come out of the
/// [`ServerEvents`] returned by `build`; drain them directly or through
/// [`funnel`](crate::handler::funnel). Every event channel is bounded: a
/// consumer that stops draining eventually stalls reading and accepting.
pub struct Server {
    dispatcher: Dispatcher,
    core: Arc<ServerCore>,
    closer: Mutex<Option<Closer>>,
}

impl Server {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Bind `host` and start accepting connections.
    ///
    /// See [`Dispatcher::run`] for the accepted formats and errors.
    pub async fn run(&self, host: &str) -> Result<()> {
        let closer = self.dispatcher.run(host).await?;
        *self.closer.lock() = Some(closer);
        Ok(())
    }

    /// Stop accepting and stop every tracked attendant.
    ///
    /// Returns once the stop is requested; `stopped` is published when the
    /// accept loop has exited. Fails with [`ConveyorError::NotListening`] if
    /// the server is not running. Dropping a running server stops it too.
    pub fn stop(&self) -> Result<()> {
        let closer = self
            .closer
            .lock()
            .take()
            .ok_or(ConveyorError::NotListening)?;

        self.core.closing.store(true, Ordering::Release);
        closer.close();

        let attendants: Vec<Attendant> = self
            .core
            .attendants
            .write()
            .drain()
            .map(|(_, attendant)| attendant)
            .collect();
        tracing::debug!(count = attendants.len(), "stopping attendants");
        for attendant in attendants {
            let _ = attendant.stop();
        }
        Ok(())
    }

    /// Call `callback` once per tracked attendant.
    ///
    /// Works on a snapshot, so the callback may stop attendants or spawn
    /// sends freely.
    pub fn enumerate<F>(&self, mut callback: F)
    where
        F: FnMut(&Attendant),
    {
        for attendant in &self.attendants() {
            callback(attendant);
        }
    }

    /// Snapshot of the tracked attendants.
    pub fn attendants(&self) -> Vec<Attendant> {
        self.core.attendants.read().values().cloned().collect()
    }

    /// Number of tracked attendants.
    pub fn len(&self) -> usize {
        self.core.attendants.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The bound address, or [`ConveyorError::NotListening`].
    pub fn addr(&self) -> Result<SocketAddr> {
        self.dispatcher.addr()
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        // Not running is the only failure.
        let _ = self.stop();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("dispatcher", &self.dispatcher)
            .field("attendants", &self.len())
            .finish_non_exhaustive()
    }
}

/// State of one run, created in `on_start` and dropped in `on_stop`.
struct RunState {
    lifecycle: mpsc::Sender<AttendantLifecycle>,
    quit: CancellationToken,
}

struct ServerCore {
    marshaler: Arc<dyn Marshaler>,
    config: ServerConfig,
    outbound: Outbound,
    attendants: AttendantSet,
    run: Mutex<Option<RunState>>,
    /// Set by `Server::stop`; connections arriving afterwards are refused.
    closing: Arc<AtomicBool>,
}

impl ServerCore {
    async fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        if self.closing.load(Ordering::Acquire) {
            return;
        }
        let lifecycle = self.run.lock().as_ref().map(|run| run.lifecycle.clone());
        let Some(lifecycle) = lifecycle else {
            return;
        };

        let channels = AttendantChannels {
            lifecycle,
            messages: self.outbound.messages.clone(),
            throttled: self.outbound.throttled.clone(),
        };
        let attendant = match Attendant::new(
            stream,
            &*self.marshaler,
            self.config.default_throttle,
            channels,
            &self.config.writer,
        ) {
            Ok(attendant) => attendant,
            Err(e) => {
                tracing::warn!(?peer, error = %e, "cannot set up attendant");
                return;
            }
        };

        if let Err(e) = attendant.start().await {
            tracing::warn!(?peer, error = %e, "cannot start attendant");
        }
    }
}

impl DispatchHandler for ServerCore {
    fn on_start(&self, addr: SocketAddr) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let (lifecycle, inbox) = mpsc::channel(FAN_IN_CAPACITY);
            let quit = CancellationToken::new();
            *self.run.lock() = Some(RunState {
                lifecycle,
                quit: quit.clone(),
            });
            self.closing.store(false, Ordering::Release);

            tokio::spawn(fan_in(
                inbox,
                quit,
                Arc::clone(&self.attendants),
                Arc::clone(&self.closing),
                self.outbound.attendant_started.clone(),
                self.outbound.attendant_stopped.clone(),
            ));

            tracing::debug!(%addr, "server started");
            let _ = self.outbound.started.send(Started { addr }).await;
        })
    }

    fn on_accept(&self, stream: TcpStream, peer: SocketAddr) -> BoxFuture<'_, ()> {
        Box::pin(self.accept(stream, peer))
    }

    fn on_accept_error(&self, error: io::Error) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let _ = self.outbound.accept_failed.send(AcceptFailed { error }).await;
        })
    }

    fn on_stop(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let run = self.run.lock().take();
            if let Some(run) = run {
                run.quit.cancel();
            }

            tracing::debug!("server stopped");
            let _ = self.outbound.stopped.send(Stopped).await;
        })
    }
}

/// Single writer of the attendant set.
///
/// Applies each lifecycle notification to the set, then republishes it.
async fn fan_in(
    mut inbox: mpsc::Receiver<AttendantLifecycle>,
    quit: CancellationToken,
    attendants: AttendantSet,
    closing: Arc<AtomicBool>,
    started: mpsc::Sender<Attendant>,
    stopped: mpsc::Sender<AttendantStopped>,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = quit.cancelled() => break,
            event = inbox.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let forwarded = match event {
            AttendantLifecycle::Started(attendant) => {
                track(&attendants, &closing, &attendant);
                forward(&started, attendant, &quit).await
            }
            AttendantLifecycle::Stopped(event) => {
                attendants.write().remove(&event.attendant.id());
                forward(&stopped, event, &quit).await
            }
        };

        if !forwarded {
            break;
        }
    }

    // Starts still queued here were never tracked, so `Server::stop` missed them.
    inbox.close();
    while let Ok(event) = inbox.try_recv() {
        if let AttendantLifecycle::Started(attendant) = event {
            let _ = attendant.stop();
        }
    }
    tracing::debug!("fan-in exited");
}

/// Insert a freshly started attendant, or stop it if the server is stopping.
///
/// Checked under the set's write lock, so `Server::stop` either drains the
/// attendant or the attendant sees `closing`.
fn track(attendants: &AttendantSet, closing: &AtomicBool, attendant: &Attendant) {
    let mut set = attendants.write();
    if closing.load(Ordering::Acquire) {
        let _ = attendant.stop();
    } else {
        set.insert(attendant.id(), attendant.clone());
    }
}

async fn forward<T>(tx: &mpsc::Sender<T>, event: T, quit: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = quit.cancelled() => false,
        _ = tx.send(event) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marshal::JsonMarshaler;

    #[test]
    fn test_marshaler_required() {
        let err = Server::builder().build().unwrap_err();
        assert!(matches!(err, ConveyorError::Argument(ref what) if what == "marshaler"));
    }

    #[tokio::test]
    async fn test_not_running() {
        let (server, _events) = Server::builder()
            .marshaler(JsonMarshaler::new())
            .build()
            .unwrap();

        assert!(matches!(server.addr(), Err(ConveyorError::NotListening)));
        assert!(matches!(server.stop(), Err(ConveyorError::NotListening)));
        assert!(server.is_empty());
    }

    #[tokio::test]
    async fn test_run_and_stop_events() {
        let (server, mut events) = Server::builder()
            .marshaler(JsonMarshaler::new())
            .build()
            .unwrap();

        server.run("127.0.0.1:0").await.unwrap();
        let started = events.started.recv().await.unwrap();
        assert_eq!(started.addr, server.addr().unwrap());

        assert!(matches!(
            server.run("127.0.0.1:0").await,
            Err(ConveyorError::AlreadyListening)
        ));

        server.stop().unwrap();
        assert_eq!(events.stopped.recv().await, Some(Stopped));
        assert!(matches!(server.stop(), Err(ConveyorError::NotListening)));
    }

    #[tokio::test]
    async fn test_drop_stops_running_server() {
        let (server, mut events) = Server::builder()
            .marshaler(JsonMarshaler::new())
            .build()
            .unwrap();
        server.run("127.0.0.1:0").await.unwrap();
        events.started.recv().await.unwrap();

        let mut client = TcpStream::connect(server.addr().unwrap()).await.unwrap();
        events.attendant_started.recv().await.unwrap();

        drop(server);
        assert_eq!(events.stopped.recv().await, Some(Stopped));

        let mut buf = [0u8; 8];
        let read = tokio::io::AsyncReadExt::read(&mut client, &mut buf).await;
        assert!(matches!(read, Ok(0) | Err(_)));
    }

    #[tokio::test]
    async fn test_closing_refuses_new_members() {
        let attendants: AttendantSet = Arc::new(RwLock::new(HashMap::new()));
        let closing = AtomicBool::new(false);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let mut members = Vec::new();
        for _ in 0..2 {
            let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
            let (channels, _events) = crate::event::attendant_channels(1, 16);
            let attendant = Attendant::new(
                accepted.unwrap().0,
                &JsonMarshaler::new(),
                Duration::ZERO,
                channels,
                &WriterConfig::default(),
            )
            .unwrap();
            members.push((attendant, client.unwrap()));
        }

        track(&attendants, &closing, &members[0].0);
        closing.store(true, Ordering::Release);
        track(&attendants, &closing, &members[1].0);

        assert!(attendants.read().contains_key(&members[0].0.id()));
        assert!(!attendants.read().contains_key(&members[1].0.id()));
        assert_eq!(members[1].0.status(), crate::attendant::AttendantStatus::Stopped);
    }
}
