//! Link-level counters in Prometheus text exposition format
//!
//! Atomic counters, bumped from the dispatcher, read loops, senders and the
//! health monitor without taking any lock.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

const PREFIX: &str = "peerlink";

pub struct Metrics {
    /// Streams that made it into the registry
    pub connections_established_total: AtomicU64,
    /// Establishment attempts that ended in DISCONNECTED
    pub establishment_failures_total: AtomicU64,
    /// Connections torn down after being established
    pub evictions_total: AtomicU64,
    /// Application messages written (per peer)
    pub messages_sent_total: AtomicU64,
    /// Application messages delivered to the callback
    pub messages_received_total: AtomicU64,
    pub heartbeats_sent_total: AtomicU64,
    pub decrypt_failures_total: AtomicU64,
    pub start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_established_total: AtomicU64::new(0),
            establishment_failures_total: AtomicU64::new(0),
            evictions_total: AtomicU64::new(0),
            messages_sent_total: AtomicU64::new(0),
            messages_received_total: AtomicU64::new(0),
            heartbeats_sent_total: AtomicU64::new(0),
            decrypt_failures_total: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Render all counters plus the given live-connection gauge
    pub fn render(&self, active_connections: usize) -> String {
        let counters: [(&str, &str, &AtomicU64); 7] = [
            (
                "connections_established_total",
                "Peer streams established",
                &self.connections_established_total,
            ),
            (
                "establishment_failures_total",
                "Failed connection establishment attempts",
                &self.establishment_failures_total,
            ),
            (
                "evictions_total",
                "Established connections torn down",
                &self.evictions_total,
            ),
            (
                "messages_sent_total",
                "Application messages written to peers",
                &self.messages_sent_total,
            ),
            (
                "messages_received_total",
                "Application messages received from peers",
                &self.messages_received_total,
            ),
            (
                "heartbeats_sent_total",
                "Heartbeat envelopes written",
                &self.heartbeats_sent_total,
            ),
            (
                "decrypt_failures_total",
                "Encrypted envelopes that could not be opened",
                &self.decrypt_failures_total,
            ),
        ];

        let mut out = String::new();
        for (name, help, value) in counters {
            write_metric(&mut out, name, help, "counter", value.load(Ordering::Relaxed));
        }
        write_metric(
            &mut out,
            "active_connections",
            "Connections currently registered",
            "gauge",
            active_connections as u64,
        );
        write_metric(
            &mut out,
            "uptime_seconds",
            "Link manager uptime in seconds",
            "gauge",
            self.start_time.elapsed().as_secs(),
        );
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

fn write_metric(out: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    // Writing to a String cannot fail
    let _ = writeln!(out, "# HELP {}_{} {}", PREFIX, name, help);
    let _ = writeln!(out, "# TYPE {}_{} {}", PREFIX, name, kind);
    let _ = writeln!(out, "{}_{} {}", PREFIX, name, value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_reports_counters() {
        let m = Metrics::new();
        m.messages_sent_total.fetch_add(42, Ordering::Relaxed);
        Metrics::incr(&m.evictions_total);
        Metrics::incr(&m.evictions_total);

        let output = m.render(3);
        assert!(output.contains("peerlink_messages_sent_total 42"));
        assert!(output.contains("peerlink_evictions_total 2"));
        assert!(output.contains("peerlink_decrypt_failures_total 0"));
        assert!(output.contains("peerlink_active_connections 3"));
    }

    #[test]
    fn test_render_prometheus_format() {
        let output = Metrics::new().render(0);
        assert!(output.contains("# TYPE peerlink_connections_established_total counter"));
        assert!(output.contains("# HELP peerlink_heartbeats_sent_total Heartbeat envelopes written"));
        assert!(output.contains("# TYPE peerlink_active_connections gauge"));
        assert!(output
            .lines()
            .any(|l| l.starts_with("peerlink_uptime_seconds ")));
        // HELP, TYPE and value for each of the nine series
        assert_eq!(output.lines().count(), 27);
    }
}
