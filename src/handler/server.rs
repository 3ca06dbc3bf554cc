//! Funnel for server events.

use tokio::task::JoinHandle;

use crate::attendant::Attendant;
use crate::event::{AcceptFailed, AttendantStopped, MessageEvent, Started, Stopped, Throttled};
use crate::marshal::BoxFuture;
use crate::server::ServerEvents;

/// Callbacks for every server event. All default to doing nothing.
pub trait ServerHandler: Send + 'static {
    fn on_started(&mut self, _event: Started) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn on_accept_failed(&mut self, _event: AcceptFailed) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn on_attendant_started(&mut self, _attendant: Attendant) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn on_message(&mut self, _event: MessageEvent) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn on_throttled(&mut self, _event: Throttled) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn on_attendant_stopped(&mut self, _event: AttendantStopped) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    /// Last call of a funnel.
    fn on_stopped(&mut self, _event: Stopped) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Drain `events` into `handler` on a new task.
///
/// The task ends after `on_stopped` has run once, or when every channel has
/// closed, and hands back the receivers and the handler.
///
/// Pending events are picked in this priority: `started`, `accept_failed`,
/// `attendant_started`, `messages`, `throttled`, `attendant_stopped`,
/// `stopped`. An attendant's start is therefore handled before its messages,
/// and its messages before its stop.
pub fn funnel<H: ServerHandler>(
    mut events: ServerEvents,
    mut handler: H,
) -> JoinHandle<(ServerEvents, H)> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                Some(event) = events.started.recv() => handler.on_started(event).await,
                Some(event) = events.accept_failed.recv() => handler.on_accept_failed(event).await,
                Some(attendant) = events.attendant_started.recv() => {
                    handler.on_attendant_started(attendant).await
                }
                Some(event) = events.messages.recv() => handler.on_message(event).await,
                Some(event) = events.throttled.recv() => handler.on_throttled(event).await,
                Some(event) = events.attendant_stopped.recv() => {
                    handler.on_attendant_stopped(event).await
                }
                Some(event) = events.stopped.recv() => {
                    handler.on_stopped(event).await;
                    break;
                }
                else => break,
            }
        }

        tracing::debug!("server funnel finished");
        (events, handler)
    })
}
