//! Connection lifecycle and the single-reconnect guard.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Lifecycle of the persistent channel.
///
/// ```text
/// Disconnected -> Connecting -> Connected -> Reconnecting -> Connected
///                                                        \-> GaveUp
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnect attempts exhausted. Only an explicit `connect` leaves this.
    GaveUp,
}

impl ConnectionState {
    pub const fn is_connected(self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::GaveUp => "gave_up",
        };
        f.write_str(s)
    }
}

/// Ensures at most one reconnect loop runs at a time.
#[derive(Debug, Clone, Default)]
pub struct ReconnectGuard {
    in_flight: Arc<AtomicBool>,
}

impl ReconnectGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the permit, or `None` if a reconnect is already running.
    pub fn try_acquire(&self) -> Option<ReconnectPermit> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| ReconnectPermit {
                in_flight: Arc::clone(&self.in_flight),
            })
    }

    pub fn is_held(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }
}

/// Released on drop.
#[derive(Debug)]
pub struct ReconnectPermit {
    in_flight: Arc<AtomicBool>,
}

impl Drop for ReconnectPermit {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_one_permit_at_a_time() {
        let guard = ReconnectGuard::new();
        let permit = guard.try_acquire();
        assert!(permit.is_some());
        assert!(guard.is_held());
        assert!(guard.try_acquire().is_none());
        assert!(guard.clone().try_acquire().is_none());

        drop(permit);
        assert!(!guard.is_held());
        assert!(guard.try_acquire().is_some());
    }

    #[test]
    fn display_names() {
        assert_eq!(ConnectionState::GaveUp.to_string(), "gave_up");
        assert!(ConnectionState::Connected.is_connected());
        assert!(!ConnectionState::Reconnecting.is_connected());
    }
}
