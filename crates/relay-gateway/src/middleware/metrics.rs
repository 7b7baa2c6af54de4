//! Gateway counters, exposed on `/health`.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Gateway metrics
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    // Connections
    pub connections_active: AtomicU64,
    pub connections_total: AtomicU64,
    pub auth_rejected: AtomicU64,

    // Subscriptions
    pub subscriptions_active: AtomicU64,
    pub subscriptions_total: AtomicU64,
    pub subscribe_errors: AtomicU64,

    // Frames
    pub messages_sent: AtomicU64,
    pub error_frames_sent: AtomicU64,

    // Liveness
    pub pings_sent: AtomicU64,
    pub pongs_received: AtomicU64,
    pub liveness_terminations: AtomicU64,
}

/// Point-in-time copy of [`GatewayMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub connections_active: u64,
    pub connections_total: u64,
    pub auth_rejected: u64,
    pub subscriptions_active: u64,
    pub subscriptions_total: u64,
    pub subscribe_errors: u64,
    pub messages_sent: u64,
    pub error_frames_sent: u64,
    pub pings_sent: u64,
    pub pongs_received: u64,
    pub liveness_terminations: u64,
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_connect(&self) {
        self.connections_active.fetch_add(1, Ordering::Relaxed);
        self.connections_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_auth_rejected(&self) {
        self.auth_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_subscribe(&self) {
        self.subscriptions_active.fetch_add(1, Ordering::Relaxed);
        self.subscriptions_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unsubscribe(&self) {
        self.subscriptions_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_subscribe_error(&self) {
        self.subscribe_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error_frame(&self) {
        self.error_frames_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_pings(&self, count: u64) {
        self.pings_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_pong(&self) {
        self.pongs_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_terminations(&self, count: u64) {
        self.liveness_terminations
            .fetch_add(count, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_total: self.connections_total.load(Ordering::Relaxed),
            auth_rejected: self.auth_rejected.load(Ordering::Relaxed),
            subscriptions_active: self.subscriptions_active.load(Ordering::Relaxed),
            subscriptions_total: self.subscriptions_total.load(Ordering::Relaxed),
            subscribe_errors: self.subscribe_errors.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            error_frames_sent: self.error_frames_sent.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            pongs_received: self.pongs_received.load(Ordering::Relaxed),
            liveness_terminations: self.liveness_terminations.load(Ordering::Relaxed),
        }
    }
}
