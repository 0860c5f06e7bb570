//! OS signal delivery, reduced to the plain events the controller consumes:
//! a shutdown request, or a resolved user-signal. The disambiguation between
//! `SIGUSR1` and `SIGUSR2` lives here as pure, directly testable logic; the
//! signal handlers themselves only ever set flags, never touch the
//! registry — the same discipline the original keeps between its signal
//! handler and its event loop.

use std::time::{Duration, Instant};

use tokio::signal::unix::{signal, Signal, SignalKind};

/// A USR1 followed by a USR2 within this window is reported as USR1; beyond
/// it, as USR2.
const DISAMBIGUATION_WINDOW: Duration = Duration::from_millis(2000);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSignal {
    Usr1,
    Usr2,
}

/// Resolves raw USR1/USR2 deliveries into a single `UserSignal` per tick.
#[derive(Default)]
pub struct SignalResolver {
    pending_usr1_at: Option<Instant>,
}

impl SignalResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a USR1 delivery; resolution happens on the next USR2.
    pub fn on_usr1(&mut self, at: Instant) {
        self.pending_usr1_at = Some(at);
    }

    /// Resolves a USR2 delivery. A lone USR2 with no preceding USR1 is
    /// ignored (`None`).
    pub fn on_usr2(&mut self, at: Instant) -> Option<UserSignal> {
        let usr1_at = self.pending_usr1_at.take()?;
        if at.duration_since(usr1_at) > DISAMBIGUATION_WINDOW {
            Some(UserSignal::Usr2)
        } else {
            Some(UserSignal::Usr1)
        }
    }
}

/// The Unix signal streams the controller multiplexes in its event loop.
pub struct SignalStreams {
    pub sigint: Signal,
    pub sigterm: Signal,
    pub sigusr1: Signal,
    pub sigusr2: Signal,
}

impl SignalStreams {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigusr1: signal(SignalKind::user_defined1())?,
            sigusr2: signal(SignalKind::user_defined2())?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_drift_resolves_to_usr1() {
        let mut resolver = SignalResolver::new();
        let t0 = Instant::now();
        resolver.on_usr1(t0);
        let resolved = resolver.on_usr2(t0 + Duration::from_millis(500));
        assert_eq!(resolved, Some(UserSignal::Usr1));
    }

    #[test]
    fn long_drift_resolves_to_usr2() {
        let mut resolver = SignalResolver::new();
        let t0 = Instant::now();
        resolver.on_usr1(t0);
        let resolved = resolver.on_usr2(t0 + Duration::from_millis(3000));
        assert_eq!(resolved, Some(UserSignal::Usr2));
    }

    #[test]
    fn lone_usr2_is_ignored() {
        let mut resolver = SignalResolver::new();
        assert_eq!(resolver.on_usr2(Instant::now()), None);
    }

    #[test]
    fn resolution_consumes_the_pending_usr1() {
        let mut resolver = SignalResolver::new();
        let t0 = Instant::now();
        resolver.on_usr1(t0);
        resolver.on_usr2(t0 + Duration::from_millis(100));
        // Second USR2 with nothing new pending is a lone USR2.
        assert_eq!(resolver.on_usr2(t0 + Duration::from_millis(200)), None);
    }
}
