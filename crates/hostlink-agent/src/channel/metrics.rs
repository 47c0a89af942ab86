//! Channel counters.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use hostlink_core::now_millis;
use serde::Serialize;

/// Snapshot of channel activity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChannelMetrics {
    pub connects: u64,
    pub connect_failures: u64,
    pub reconnects: u64,
    pub reconnect_attempts: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_buffered: u64,
    pub messages_dropped: u64,
    pub pings_sent: u64,
    pub pongs_sent: u64,
    pub pongs_received: u64,
    pub errors: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active_connections: u64,
    /// When the current connection opened. `None` while disconnected.
    pub connected_at: Option<i64>,
    pub last_message_at: Option<i64>,
    pub last_error_at: Option<i64>,
}

impl ChannelMetrics {
    /// Errors per frame handled. Zero before any traffic.
    pub fn error_rate(&self) -> f64 {
        let frames = self.messages_sent + self.messages_received + self.errors;
        if frames == 0 {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let rate = self.errors as f64 / frames as f64;
        rate
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub connects: AtomicU64,
    pub connect_failures: AtomicU64,
    pub reconnects: AtomicU64,
    pub reconnect_attempts: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub messages_buffered: AtomicU64,
    pub messages_dropped: AtomicU64,
    pub pings_sent: AtomicU64,
    pub pongs_sent: AtomicU64,
    pub pongs_received: AtomicU64,
    pub errors: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub active_connections: AtomicU64,
    connected_at: AtomicI64,
    last_message_at: AtomicI64,
    last_error_at: AtomicI64,
}

pub(crate) fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Counters {
    pub fn record_sent(&self, bytes: usize) {
        bump(&self.messages_sent);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_message_at.store(now_millis(), Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: usize) {
        bump(&self.messages_received);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.last_message_at.store(now_millis(), Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        bump(&self.errors);
        self.last_error_at.store(now_millis(), Ordering::Relaxed);
    }

    pub fn set_active(&self, active: bool) {
        self.active_connections
            .store(u64::from(active), Ordering::Relaxed);
        let since = if active { now_millis() } else { 0 };
        self.connected_at.store(since, Ordering::Relaxed);
    }

    /// Zero every counter. The connection gauge and its start time are kept.
    pub fn reset(&self) {
        for counter in [
            &self.connects,
            &self.connect_failures,
            &self.reconnects,
            &self.reconnect_attempts,
            &self.messages_sent,
            &self.messages_received,
            &self.messages_buffered,
            &self.messages_dropped,
            &self.pings_sent,
            &self.pongs_sent,
            &self.pongs_received,
            &self.errors,
            &self.bytes_sent,
            &self.bytes_received,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.last_message_at.store(0, Ordering::Relaxed);
        self.last_error_at.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ChannelMetrics {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let stamp = |c: &AtomicI64| Some(c.load(Ordering::Relaxed)).filter(|&t| t > 0);
        ChannelMetrics {
            connects: load(&self.connects),
            connect_failures: load(&self.connect_failures),
            reconnects: load(&self.reconnects),
            reconnect_attempts: load(&self.reconnect_attempts),
            messages_sent: load(&self.messages_sent),
            messages_received: load(&self.messages_received),
            messages_buffered: load(&self.messages_buffered),
            messages_dropped: load(&self.messages_dropped),
            pings_sent: load(&self.pings_sent),
            pongs_sent: load(&self.pongs_sent),
            pongs_received: load(&self.pongs_received),
            errors: load(&self.errors),
            bytes_sent: load(&self.bytes_sent),
            bytes_received: load(&self.bytes_received),
            active_connections: load(&self.active_connections),
            connected_at: stamp(&self.connected_at),
            last_message_at: stamp(&self.last_message_at),
            last_error_at: stamp(&self.last_error_at),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_counters() {
        let counters = Counters::default();
        let empty = counters.snapshot();
        assert_eq!(empty, ChannelMetrics::default());

        counters.record_sent(10);
        counters.record_sent(5);
        counters.record_received(3);
        counters.record_error();
        counters.set_active(true);

        let snap = counters.snapshot();
        assert_eq!(snap.messages_sent, 2);
        assert_eq!(snap.bytes_sent, 15);
        assert_eq!(snap.messages_received, 1);
        assert_eq!(snap.bytes_received, 3);
        assert_eq!(snap.errors, 1);
        assert_eq!(snap.active_connections, 1);
        assert!(snap.connected_at.is_some());
        assert!((snap.error_rate() - 1.0 / 4.0).abs() < 1e-9);
        assert!(snap.last_message_at.is_some());
        assert!(snap.last_error_at.is_some());
    }

    #[test]
    fn reset_keeps_the_connection_gauge() {
        let counters = Counters::default();
        counters.record_sent(10);
        counters.record_error();
        counters.set_active(true);

        counters.reset();
        let snap = counters.snapshot();
        assert_eq!(snap.messages_sent, 0);
        assert_eq!(snap.errors, 0);
        assert_eq!(snap.last_error_at, None);
        assert_eq!(snap.active_connections, 1);
        assert!(snap.connected_at.is_some());

        counters.set_active(false);
        assert_eq!(counters.snapshot().connected_at, None);
    }
}
