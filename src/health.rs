//! Health monitor
//!
//! Every heartbeat interval the monitor walks the registry. Each connection
//! is evaluated first; unhealthy ones are torn down through the same funnel
//! as a hard failure. Survivors get a heartbeat envelope written through the
//! normal message path, and a failed heartbeat write is itself a teardown.
//!
//! The monitor never reopens anything. Teardown emits DISCONNECTED, then
//! RECONNECTING after the reconnect delay, and continuous discovery brings
//! the peer back.

use std::io;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::connection::PeerConnection;
use crate::identity::short_id;
use crate::manager::Shared;
use crate::metrics::Metrics;

/// Outcome of evaluating one connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// The stream reports disconnected (closed, errored, peer gone)
    TransportDown,
    /// No traffic for this long, at or past the idle threshold
    Idle(Duration),
}

impl Health {
    pub fn is_healthy(self) -> bool {
        self == Health::Healthy
    }
}

pub fn evaluate(conn: &PeerConnection, idle_threshold: Duration) -> Health {
    if !conn.is_transport_connected() {
        return Health::TransportDown;
    }
    let idle = conn.idle_for();
    if idle >= idle_threshold {
        return Health::Idle(idle);
    }
    Health::Healthy
}

/// What one sweep did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub checked: usize,
    pub evicted: usize,
    pub heartbeats: usize,
}

/// Run one monitoring cycle over every registered connection
pub(crate) fn sweep(shared: &Arc<Shared>) -> SweepReport {
    let threshold = shared.config.idle_threshold();
    let mut report = SweepReport::default();

    for conn in shared.registry.all() {
        report.checked += 1;

        match evaluate(&conn, threshold) {
            Health::Healthy => {}
            Health::TransportDown => {
                shared.teardown(&conn, "transport disconnected");
                report.evicted += 1;
                continue;
            }
            Health::Idle(idle) => {
                shared.teardown(&conn, &format!("no traffic for {:?}", idle));
                report.evicted += 1;
                continue;
            }
        }

        match shared.pipeline.send_heartbeat(&conn) {
            Ok(()) => {
                Metrics::incr(&shared.metrics.heartbeats_sent_total);
                report.heartbeats += 1;
            }
            Err(e) => {
                shared.teardown(&conn, &format!("heartbeat failed: {}", e));
                report.evicted += 1;
            }
        }
    }

    if report.evicted > 0 {
        log::info!(
            "Health sweep: {} checked, {} evicted",
            report.checked,
            report.evicted
        );
    } else {
        log::trace!("Health sweep: {} checked", report.checked);
    }
    report
}

/// Background thread running [`sweep`] on the heartbeat interval
pub struct HealthMonitor {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    pub(crate) fn start(shared: Arc<Shared>) -> io::Result<Self> {
        let (stop, stopped) = mpsc::channel::<()>();
        let interval = shared.config.heartbeat_interval();

        let handle = thread::Builder::new()
            .name("peerlink-health".into())
            .spawn(move || {
                log::debug!(
                    "Health monitor for {} running every {:?}",
                    short_id(&shared.local_id),
                    interval
                );
                loop {
                    match stopped.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            sweep(&shared);
                        }
                        // Explicit stop or the manager went away
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                log::debug!("Health monitor stopped");
            })?;

        Ok(Self { stop, handle })
    }

    /// Stop promptly, even mid-interval
    pub fn stop(self) {
        let _ = self.stop.send(());
        if self.handle.join().is_err() {
            log::error!("Health monitor thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LinkConfig;
    use crate::connection::test_support::connection;
    use crate::connection::ConnectionState;
    use crate::identity::Role;
    use crate::manager::test_support::shared_with_events;
    use std::time::Instant;

    fn register(shared: &Arc<Shared>, id: &str) -> (Arc<PeerConnection>, std::net::TcpStream) {
        let (conn, far) = connection(id, Role::Initiator);
        let conn = Arc::new(conn);
        assert!(shared.registry.add(id, conn.clone()));
        (conn, far)
    }

    #[test]
    fn test_evaluate() {
        let (conn, _far) = connection("peer-a", Role::Initiator);
        let threshold = Duration::from_secs(60);
        assert_eq!(evaluate(&conn, threshold), Health::Healthy);

        conn.set_last_activity(Instant::now() - Duration::from_secs(61));
        assert!(matches!(evaluate(&conn, threshold), Health::Idle(d) if d >= threshold));

        conn.close();
        assert_eq!(evaluate(&conn, threshold), Health::TransportDown);
    }

    #[test]
    fn test_sweep_evicts_idle_and_heartbeats_healthy() {
        let config = LinkConfig {
            reconnect_delay_ms: 50,
            ..LinkConfig::default()
        };
        let shared = shared_with_events("local", config);
        let (healthy, _f1) = register(&shared, "peer-a");
        let (stale, _f2) = register(&shared, "peer-b");
        stale.set_last_activity(Instant::now() - Duration::from_secs(61));
        let before = healthy.last_activity();

        let report = sweep(&shared);

        assert_eq!(
            report,
            SweepReport {
                checked: 2,
                evicted: 1,
                heartbeats: 1
            }
        );
        assert_eq!(shared.registry.peer_ids(), vec!["peer-a".to_string()]);
        assert!(!stale.is_alive());
        // Our own heartbeat is not activity
        assert_eq!(healthy.last_activity(), before);
        assert_eq!(
            shared.notifier.state("peer-b"),
            Some(ConnectionState::Disconnected)
        );

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(
            shared.notifier.state("peer-b"),
            Some(ConnectionState::Reconnecting)
        );
        shared.stop_for_test();
    }

    #[test]
    fn test_sweep_evicts_dead_transport() {
        let shared = shared_with_events("local", LinkConfig::default());
        let (conn, _far) = register(&shared, "peer-a");
        conn.close();

        let report = sweep(&shared);
        assert_eq!(report.evicted, 1);
        assert!(shared.registry.is_empty());
        assert_eq!(
            shared.metrics.evictions_total.load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[test]
    fn test_monitor_stops_promptly() {
        let config = LinkConfig {
            heartbeat_interval_ms: 60_000,
            ..LinkConfig::default()
        };
        let shared = shared_with_events("local", config);
        let monitor = HealthMonitor::start(shared).unwrap();

        let started = Instant::now();
        monitor.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
