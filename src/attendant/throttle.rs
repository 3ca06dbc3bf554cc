//! Per-attendant admission control.
//!
//! With a throttle `T > 0`, a message is admitted only when at least `T` has
//! passed since the last admitted one. The first message after the throttle is
//! enabled is always admitted. A zero throttle admits everything and forgets
//! the last admission, so re-enabling starts fresh.

use std::time::Duration;

use tokio::time::Instant;

/// Outcome of [`ThrottleGate::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Admit,
    /// Too soon; `lapse` is the time since the last admitted message.
    Throttle { lapse: Duration },
}

/// Tracks the last admitted message. Owned by the read loop.
#[derive(Debug, Default)]
pub(crate) struct ThrottleGate {
    from: Option<Instant>,
}

impl ThrottleGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn check(&mut self, throttle: Duration, now: Instant) -> Admission {
        if throttle.is_zero() {
            self.from = None;
            return Admission::Admit;
        }

        match self.from {
            Some(from) => {
                let lapse = now.saturating_duration_since(from);
                if lapse >= throttle {
                    self.from = Some(now);
                    Admission::Admit
                } else {
                    Admission::Throttle { lapse }
                }
            }
            None => {
                self.from = Some(now);
                Admission::Admit
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: Duration = Duration::from_millis(100);

    fn ms(n: u64) -> Duration {
        Duration::from_millis(n)
    }

    #[test]
    fn test_zero_throttle_admits_everything() {
        let mut gate = ThrottleGate::new();
        let t0 = Instant::now();
        for i in 0..5 {
            assert_eq!(gate.check(Duration::ZERO, t0 + ms(i)), Admission::Admit);
        }
    }

    #[test]
    fn test_first_message_always_admitted() {
        let mut gate = ThrottleGate::new();
        assert_eq!(gate.check(T, Instant::now()), Admission::Admit);
    }

    #[test]
    fn test_spacing_measured_from_last_admission() {
        let mut gate = ThrottleGate::new();
        let t0 = Instant::now();

        assert_eq!(gate.check(T, t0), Admission::Admit);
        assert_eq!(gate.check(T, t0 + ms(10)), Admission::Throttle { lapse: ms(10) });
        // Throttled messages do not move the reference point.
        assert_eq!(gate.check(T, t0 + ms(60)), Admission::Throttle { lapse: ms(60) });
        assert_eq!(gate.check(T, t0 + ms(100)), Admission::Admit);
        assert_eq!(gate.check(T, t0 + ms(150)), Admission::Throttle { lapse: ms(50) });
        assert_eq!(gate.check(T, t0 + ms(250)), Admission::Admit);
    }

    #[test]
    fn test_disabling_resets_reference() {
        let mut gate = ThrottleGate::new();
        let t0 = Instant::now();

        assert_eq!(gate.check(T, t0), Admission::Admit);
        assert_eq!(gate.check(Duration::ZERO, t0 + ms(5)), Admission::Admit);
        // Re-enabled: the next message counts as the first one again.
        assert_eq!(gate.check(T, t0 + ms(10)), Admission::Admit);
        assert!(matches!(gate.check(T, t0 + ms(20)), Admission::Throttle { .. }));
    }
}
