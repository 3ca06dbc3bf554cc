//! TCP listener ownership and the accept loop.
//!
//! A [`Dispatcher`] binds one listener at a time and runs its accept loop on a
//! dedicated task. Everything the loop observes is reported to a
//! [`DispatchHandler`]:
//!
//! ```text
//! run(host) ─► bind ─► spawn accept task
//!                         │ on_start(addr)            (once)
//!                         │ on_accept(stream, peer)   (per connection)
//!                         │ on_accept_error(err)      (loop continues)
//!                         │ ...
//! Closer::close() ───────►│ on_stop()                 (once)
//!                         └ listener dropped, dispatcher idle again
//! ```
//!
//! # Example
//!
//! ```ignore
//! use conveyor::transport::Dispatcher;
//!
//! let dispatcher = Dispatcher::new(Arc::new(MyHandler));
//! let closer = dispatcher.run("127.0.0.1:0").await?;
//! println!("listening on {}", dispatcher.addr()?);
//! closer.close();
//! ```

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::{ConveyorError, Result};
use crate::marshal::BoxFuture;

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Callbacks driven by the accept loop.
///
/// All methods run on the accept task, one at a time. A slow callback delays
/// the next accept, so bounded channel sends inside a callback push back on
/// the listener.
pub trait DispatchHandler: Send + Sync + 'static {
    /// The listener is bound and the accept loop is about to start.
    fn on_start(&self, addr: SocketAddr) -> BoxFuture<'_, ()>;

    /// A connection was accepted.
    fn on_accept(&self, stream: TcpStream, peer: SocketAddr) -> BoxFuture<'_, ()>;

    /// Accepting failed. The loop keeps going afterwards.
    fn on_accept_error(&self, error: io::Error) -> BoxFuture<'_, ()>;

    /// The loop has exited after a close request.
    fn on_stop(&self) -> BoxFuture<'_, ()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListenerState {
    Idle,
    Binding,
    Listening(SocketAddr),
}

/// Owns at most one TCP listener at a time.
///
/// A dispatcher returns to idle once its accept loop finishes, so it can be
/// run again.
pub struct Dispatcher {
    handler: Arc<dyn DispatchHandler>,
    state: Arc<Mutex<ListenerState>>,
}

impl Dispatcher {
    /// Create an idle dispatcher reporting to `handler`.
    pub fn new(handler: Arc<dyn DispatchHandler>) -> Self {
        Self {
            handler,
            state: Arc::new(Mutex::new(ListenerState::Idle)),
        }
    }

    /// Resolve `host`, bind a listener and start accepting.
    ///
    /// `host` is anything [`tokio::net::lookup_host`] understands, such as
    /// `"127.0.0.1:0"` or `"localhost:7000"`. The first resolved address is
    /// used.
    ///
    /// # Errors
    ///
    /// - [`ConveyorError::AlreadyListening`] if a listener is bound or binding
    /// - [`ConveyorError::Resolve`] if `host` yields no address
    /// - [`ConveyorError::Bind`] if the address cannot be bound
    pub async fn run(&self, host: &str) -> Result<Closer> {
        {
            let mut state = self.state.lock();
            if *state != ListenerState::Idle {
                return Err(ConveyorError::AlreadyListening);
            }
            *state = ListenerState::Binding;
        }

        let guard = BindingGuard {
            state: &self.state,
            armed: true,
        };
        let listener = bind(host).await?;
        let addr = listener.local_addr()?;
        guard.disarm();

        *self.state.lock() = ListenerState::Listening(addr);
        tracing::debug!(%addr, "dispatcher listening");

        let token = CancellationToken::new();
        tokio::spawn(accept_loop(
            listener,
            addr,
            Arc::clone(&self.handler),
            Arc::clone(&self.state),
            token.clone(),
        ));

        Ok(Closer { token })
    }

    /// The bound address.
    ///
    /// Fails with [`ConveyorError::NotListening`] unless a listener is bound.
    pub fn addr(&self) -> Result<SocketAddr> {
        match *self.state.lock() {
            ListenerState::Listening(addr) => Ok(addr),
            _ => Err(ConveyorError::NotListening),
        }
    }

    /// Whether a listener is currently bound.
    pub fn is_listening(&self) -> bool {
        matches!(*self.state.lock(), ListenerState::Listening(_))
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}

/// Stops a running accept loop.
///
/// Cloneable; closing more than once is harmless.
#[derive(Debug, Clone)]
pub struct Closer {
    token: CancellationToken,
}

impl Closer {
    /// Ask the accept loop to stop.
    ///
    /// Returns immediately; `on_stop` fires once the loop has exited.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Puts the state back to idle if binding fails or `run` is dropped mid-bind.
struct BindingGuard<'a> {
    state: &'a Mutex<ListenerState>,
    armed: bool,
}

impl BindingGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for BindingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            *self.state.lock() = ListenerState::Idle;
        }
    }
}

async fn bind(host: &str) -> Result<TcpListener> {
    let resolve_error = |source: io::Error| ConveyorError::Resolve {
        host: host.to_string(),
        source,
    };

    let addr = lookup_host(host)
        .await
        .map_err(resolve_error)?
        .next()
        .ok_or_else(|| resolve_error(io::Error::new(io::ErrorKind::NotFound, "no addresses")))?;

    TcpListener::bind(addr)
        .await
        .map_err(|source| ConveyorError::Bind { addr, source })
}

/// Source of incoming connections for the accept loop.
trait Accept: Send + Sync + 'static {
    fn accept(&self) -> BoxFuture<'_, io::Result<(TcpStream, SocketAddr)>>;
}

impl Accept for TcpListener {
    fn accept(&self) -> BoxFuture<'_, io::Result<(TcpStream, SocketAddr)>> {
        Box::pin(TcpListener::accept(self))
    }
}

async fn accept_loop<L: Accept>(
    listener: L,
    addr: SocketAddr,
    handler: Arc<dyn DispatchHandler>,
    state: Arc<Mutex<ListenerState>>,
    token: CancellationToken,
) {
    handler.on_start(addr).await;

    loop {
        let accepted = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => handler.on_accept(stream, peer).await,
            Err(e) => {
                tracing::warn!(%addr, error = %e, "accept failed");
                handler.on_accept_error(e).await;

                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                }
            }
        }
    }

    handler.on_stop().await;
    drop(listener);
    *state.lock() = ListenerState::Idle;
    tracing::debug!(%addr, "dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    #[derive(Debug)]
    enum Seen {
        Start(SocketAddr),
        Accept(SocketAddr),
        AcceptError(io::ErrorKind),
        Stop,
    }

    struct Recorder {
        tx: mpsc::UnboundedSender<Seen>,
    }

    impl DispatchHandler for Recorder {
        fn on_start(&self, addr: SocketAddr) -> BoxFuture<'_, ()> {
            let _ = self.tx.send(Seen::Start(addr));
            Box::pin(async {})
        }

        fn on_accept(&self, _stream: TcpStream, peer: SocketAddr) -> BoxFuture<'_, ()> {
            let _ = self.tx.send(Seen::Accept(peer));
            Box::pin(async {})
        }

        fn on_accept_error(&self, error: io::Error) -> BoxFuture<'_, ()> {
            let _ = self.tx.send(Seen::AcceptError(error.kind()));
            Box::pin(async {})
        }

        fn on_stop(&self) -> BoxFuture<'_, ()> {
            let _ = self.tx.send(Seen::Stop);
            Box::pin(async {})
        }
    }

    /// Fails the first `failures` accepts, then defers to a real listener.
    struct Flaky {
        listener: TcpListener,
        failures: AtomicUsize,
    }

    impl Accept for Flaky {
        fn accept(&self) -> BoxFuture<'_, io::Result<(TcpStream, SocketAddr)>> {
            let failing = self
                .failures
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                let error = io::Error::other("too many open files");
                return Box::pin(async move { Err::<(TcpStream, SocketAddr), _>(error) });
            }
            Box::pin(self.listener.accept())
        }
    }

    fn recorder() -> (Dispatcher, mpsc::UnboundedReceiver<Seen>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Dispatcher::new(Arc::new(Recorder { tx })), rx)
    }

    #[tokio::test]
    async fn test_addr_before_run() {
        let (dispatcher, _rx) = recorder();
        assert!(matches!(dispatcher.addr(), Err(ConveyorError::NotListening)));
        assert!(!dispatcher.is_listening());
    }

    #[tokio::test]
    async fn test_lifecycle_callbacks() {
        let (dispatcher, mut rx) = recorder();
        let closer = dispatcher.run("127.0.0.1:0").await.unwrap();
        let addr = dispatcher.addr().unwrap();
        assert_ne!(addr.port(), 0);

        assert!(matches!(rx.recv().await, Some(Seen::Start(a)) if a == addr));

        let client = TcpStream::connect(addr).await.unwrap();
        let local = client.local_addr().unwrap();
        assert!(matches!(rx.recv().await, Some(Seen::Accept(peer)) if peer == local));

        closer.close();
        assert!(closer.is_closed());
        assert!(matches!(rx.recv().await, Some(Seen::Stop)));
    }

    #[tokio::test]
    async fn test_accept_errors_do_not_end_loop() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let flaky = Flaky {
            listener,
            failures: AtomicUsize::new(2),
        };
        let state = Arc::new(Mutex::new(ListenerState::Listening(addr)));
        let token = CancellationToken::new();
        let task = tokio::spawn(accept_loop(
            flaky,
            addr,
            Arc::new(Recorder { tx }),
            Arc::clone(&state),
            token.clone(),
        ));

        assert!(matches!(rx.recv().await, Some(Seen::Start(a)) if a == addr));
        for _ in 0..2 {
            assert!(matches!(rx.recv().await, Some(Seen::AcceptError(io::ErrorKind::Other))));
        }

        let client = TcpStream::connect(addr).await.unwrap();
        let local = client.local_addr().unwrap();
        assert!(matches!(rx.recv().await, Some(Seen::Accept(peer)) if peer == local));

        token.cancel();
        assert!(matches!(rx.recv().await, Some(Seen::Stop)));
        task.await.unwrap();
        assert_eq!(*state.lock(), ListenerState::Idle);
    }

    #[tokio::test]
    async fn test_run_twice_fails() {
        let (dispatcher, _rx) = recorder();
        let closer = dispatcher.run("127.0.0.1:0").await.unwrap();

        let err = dispatcher.run("127.0.0.1:0").await.unwrap_err();
        assert!(matches!(err, ConveyorError::AlreadyListening));

        closer.close();
    }

    #[tokio::test]
    async fn test_reusable_after_close() {
        let (dispatcher, mut rx) = recorder();
        let closer = dispatcher.run("127.0.0.1:0").await.unwrap();
        closer.close();

        loop {
            if let Some(Seen::Stop) = rx.recv().await {
                break;
            }
        }
        // State is reset right after on_stop returns.
        while dispatcher.is_listening() {
            tokio::task::yield_now().await;
        }

        let closer = dispatcher.run("127.0.0.1:0").await.unwrap();
        assert!(dispatcher.addr().is_ok());
        closer.close();
    }

    #[tokio::test]
    async fn test_unresolvable_host() {
        let (dispatcher, _rx) = recorder();
        // Missing port: rejected by the resolver without touching DNS.
        let err = dispatcher.run("127.0.0.1").await.unwrap_err();
        assert!(matches!(err, ConveyorError::Resolve { .. }));

        // A failed run leaves the dispatcher idle.
        assert!(matches!(dispatcher.addr(), Err(ConveyorError::NotListening)));
        let closer = dispatcher.run("127.0.0.1:0").await.unwrap();
        closer.close();
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let (first, _rx1) = recorder();
        let closer = first.run("127.0.0.1:0").await.unwrap();
        let taken = first.addr().unwrap().to_string();

        let (second, _rx2) = recorder();
        let err = second.run(&taken).await.unwrap_err();
        assert!(matches!(err, ConveyorError::Bind { .. }));
        assert!(!second.is_listening());

        closer.close();
    }
}
