//! Funnel for a single attendant's events.

use tokio::task::JoinHandle;

use crate::attendant::Attendant;
use crate::event::{AttendantEvents, AttendantLifecycle, AttendantStopped, MessageEvent, Throttled};
use crate::marshal::BoxFuture;

/// Callbacks for one attendant's events. All default to doing nothing.
pub trait AttendantHandler: Send + 'static {
    fn on_started(&mut self, _attendant: Attendant) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn on_message(&mut self, _event: MessageEvent) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    fn on_throttled(&mut self, _event: Throttled) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }

    /// Last call of a funnel.
    fn on_stopped(&mut self, _event: AttendantStopped) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Drain an attendant's `events` into `handler` on a new task.
///
/// Messages still queued when the stop notification arrives are handled
/// first, so `on_stopped` is always the last call.
pub fn funnel_attendant<H: AttendantHandler>(
    mut events: AttendantEvents,
    mut handler: H,
) -> JoinHandle<(AttendantEvents, H)> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                Some(lifecycle) = events.lifecycle.recv() => match lifecycle {
                    AttendantLifecycle::Started(attendant) => handler.on_started(attendant).await,
                    AttendantLifecycle::Stopped(stopped) => {
                        while let Ok(event) = events.messages.try_recv() {
                            handler.on_message(event).await;
                        }
                        while let Ok(event) = events.throttled.try_recv() {
                            handler.on_throttled(event).await;
                        }
                        handler.on_stopped(stopped).await;
                        break;
                    }
                },
                Some(event) = events.messages.recv() => handler.on_message(event).await,
                Some(event) = events.throttled.recv() => handler.on_throttled(event).await,
                else => break,
            }
        }

        (events, handler)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttendantConfig;
    use crate::marshal::JsonMarshaler;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
    }

    impl AttendantHandler for Recorder {
        fn on_started(&mut self, _attendant: Attendant) -> BoxFuture<'_, ()> {
            self.calls.push("started".to_string());
            Box::pin(async {})
        }

        fn on_message(&mut self, event: MessageEvent) -> BoxFuture<'_, ()> {
            self.calls.push(event.message.command().to_string());
            Box::pin(async {})
        }

        fn on_stopped(&mut self, event: AttendantStopped) -> BoxFuture<'_, ()> {
            self.calls.push(format!("stopped:{:?}", event.stop_type));
            Box::pin(async {})
        }
    }

    #[tokio::test]
    async fn test_stop_is_last() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let marshaler = JsonMarshaler::new();
        let (connected, accepted) = tokio::join!(
            Attendant::connect(&addr, &marshaler, AttendantConfig::default()),
            listener.accept()
        );
        let (attendant, events) = connected.unwrap();
        let (mut peer, _) = accepted.unwrap();

        // Everything is queued before the funnel starts looking.
        peer.write_all(b"{\"command\":\"A\"}\n{\"command\":\"B\"}\n")
            .await
            .unwrap();
        drop(peer);
        attendant.start().await.unwrap();

        let (_events, recorder) = funnel_attendant(events, Recorder::default()).await.unwrap();
        assert_eq!(recorder.calls, ["started", "A", "B", "stopped:Remote"]);
    }
}
