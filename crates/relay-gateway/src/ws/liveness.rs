//! Two-phase ping/pong liveness monitor.
//!
//! Each tick, a connection that answered since the previous tick is marked
//! unconfirmed and pinged again; one that did not is terminated. A
//! connection therefore survives one lost pong and is dropped after two
//! consecutive missed probes. Termination goes through the connection's
//! kill switch, never its outbound queue, so a peer that stopped reading
//! is dropped as promptly as an idle one.

use crate::domain::connection::ConnectionId;
use crate::middleware::metrics::GatewayMetrics;
use crate::ws::session::OutboundSender;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

struct Probe {
    alive: AtomicBool,
    outbound: OutboundSender,
}

/// Outcome of one monitor tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub pinged: usize,
    pub terminated: usize,
}

/// Tracks every open connection's probe state.
pub struct LivenessMonitor {
    probes: DashMap<ConnectionId, Probe>,
    metrics: Arc<GatewayMetrics>,
}

impl LivenessMonitor {
    pub fn new(metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            probes: DashMap::new(),
            metrics,
        }
    }

    /// Start tracking a connection. It counts as confirmed until the first tick.
    pub fn register(self: &Arc<Self>, id: ConnectionId, outbound: OutboundSender) -> LivenessGuard {
        self.probes.insert(
            id,
            Probe {
                alive: AtomicBool::new(true),
                outbound,
            },
        );
        trace!(connection_id = %id, "Liveness probe registered");
        LivenessGuard {
            monitor: Arc::clone(self),
            id,
        }
    }

    /// Number of tracked connections.
    pub fn tracked(&self) -> usize {
        self.probes.len()
    }

    /// Run one probe cycle.
    pub fn tick(&self) -> TickReport {
        let mut report = TickReport::default();
        self.probes.retain(|id, probe| {
            if probe.alive.swap(false, Ordering::AcqRel) {
                if probe.outbound.ping() {
                    report.pinged += 1;
                    true
                } else {
                    debug!(connection_id = %id, "Ping not queued, dropping probe");
                    false
                }
            } else {
                info!(connection_id = %id, "Terminating unresponsive connection");
                probe.outbound.terminate();
                report.terminated += 1;
                false
            }
        });

        self.metrics.record_pings(report.pinged as u64);
        self.metrics.record_terminations(report.terminated as u64);
        if report.terminated > 0 {
            debug!(pinged = report.pinged, terminated = report.terminated, "Liveness tick");
        }
        report
    }

    /// Terminate every tracked connection. Used on shutdown.
    pub fn terminate_all(&self) -> usize {
        let mut count = 0;
        self.probes.retain(|_, probe| {
            probe.outbound.terminate();
            count += 1;
            false
        });
        count
    }

    /// Tick every `interval` until the monitor is dropped.
    pub fn spawn(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let monitor: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(monitor) = monitor.upgrade() else {
                    break;
                };
                monitor.tick();
            }
        })
    }

    fn confirm(&self, id: &ConnectionId) {
        if let Some(probe) = self.probes.get(id) {
            probe.alive.store(true, Ordering::Release);
        }
    }
}

/// Registration of one connection; dropping it stops tracking.
pub struct LivenessGuard {
    monitor: Arc<LivenessMonitor>,
    id: ConnectionId,
}

impl LivenessGuard {
    /// Record a pong.
    pub fn confirm(&self) {
        self.monitor.confirm(&self.id);
    }
}

impl Drop for LivenessGuard {
    fn drop(&mut self) {
        self.monitor.probes.remove(&self.id);
    }
}
