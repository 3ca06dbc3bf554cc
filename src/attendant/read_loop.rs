//! The per-attendant read loop.

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::handle::Attendant;
use super::throttle::{Admission, ThrottleGate};
use crate::error::ConveyorError;
use crate::event::{
    AttendantChannels, AttendantLifecycle, AttendantStopped, MessageEvent, StopType, Throttled,
};
use crate::marshal::MessageReceiver;

/// Receive until the attendant is stopped or the connection ends, then
/// publish exactly one stop notification.
pub(super) async fn read_loop(
    attendant: Attendant,
    mut receiver: Box<dyn MessageReceiver>,
    channels: AttendantChannels,
) {
    let shutdown = attendant.inner.shutdown.clone();
    let mut gate = ThrottleGate::new();

    let outcome = loop {
        let received = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break (StopType::Local, None),
            received = receiver.receive() => received,
        };

        let message = match received {
            Ok(message) => message,
            Err(e) => break classify(e, &shutdown),
        };

        let now = Instant::now();
        let delivered = match gate.check(attendant.throttle(), now) {
            Admission::Admit => {
                let event = MessageEvent {
                    attendant: attendant.clone(),
                    message,
                };
                publish(&channels.messages, event, &shutdown).await
            }
            Admission::Throttle { lapse } => {
                tracing::trace!(attendant = %attendant.id(), ?lapse, "message throttled");
                let event = Throttled {
                    attendant: attendant.clone(),
                    message,
                    instant: now,
                    lapse,
                };
                publish(&channels.throttled, event, &shutdown).await
            }
        };

        if !delivered {
            break (StopType::Local, None);
        }
    };

    let (stop_type, error) = settle(attendant.claim_stop(), outcome);
    // Releases both halves: the writer task shuts down and exits, and the
    // read half goes with the receiver.
    shutdown.cancel();
    drop(receiver);

    let id = attendant.id();
    let peer = attendant.peer_addr();
    match &error {
        Some(e) => tracing::warn!(attendant = %id, ?peer, error = %e, "attendant stopped abnormally"),
        None => tracing::debug!(attendant = %id, ?peer, ?stop_type, "attendant stopped"),
    }

    let stopped = AttendantStopped {
        attendant: attendant.clone(),
        stop_type,
        error,
    };
    let _ = channels
        .lifecycle
        .send(AttendantLifecycle::Stopped(stopped))
        .await;
}

/// Map a receive error to a stop type. The error is kept only for abnormal
/// stops.
fn classify(error: ConveyorError, shutdown: &CancellationToken) -> (StopType, Option<ConveyorError>) {
    if shutdown.is_cancelled() {
        (StopType::Local, None)
    } else if error.is_graceful() {
        (StopType::Remote, None)
    } else {
        (StopType::Abnormal, Some(error))
    }
}

/// Final stop type once the status transition is decided. Losing the
/// transition to `stop()` makes the stop local whatever the loop saw.
fn settle(
    claimed: bool,
    outcome: (StopType, Option<ConveyorError>),
) -> (StopType, Option<ConveyorError>) {
    if claimed {
        outcome
    } else {
        (StopType::Local, None)
    }
}

/// Send an event, giving up if the attendant is stopped meanwhile.
///
/// Returns `false` only when the shutdown token fired. A consumer that dropped
/// its receiver just misses the event.
async fn publish<T>(tx: &mpsc::Sender<T>, event: T, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        biased;
        _ = shutdown.cancelled() => false,
        _ = tx.send(event) => true,
    }
}
