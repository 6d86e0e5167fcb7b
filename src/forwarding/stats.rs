//! Traffic statistics
//!
//! Pipes bump `TrafficCounters` with relaxed atomics on every read. The
//! counters only hold what happened since the last publish: a publisher task
//! drains them into the rule's `ForwardStats` once per interval, so the
//! rule keeps its totals across forwarder restarts and readers never touch
//! the hot-path counters directly.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::events::ForwardEventEmitter;
use super::rule::ForwardRule;

/// Published statistics of one rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardStats {
    /// Bytes relayed local -> remote
    pub bytes_sent: u64,
    /// Bytes relayed remote -> local
    pub bytes_recv: u64,
    /// Currently active connections
    pub connections: u64,
    /// Connections accepted since the rule was created (or last clear)
    pub total_connections: u64,
    /// Last accept or transfer, None if never
    pub last_active: Option<DateTime<Utc>>,
}

/// Hot-path counters owned by one forwarder, relative to the last publish
#[derive(Debug, Default)]
pub struct TrafficCounters {
    bytes_sent: AtomicU64,
    bytes_recv: AtomicU64,
    opened: AtomicU64,
    closed: AtomicU64,
    /// Unix millis, 0 = nothing since the last publish
    last_active_ms: AtomicI64,
}

/// Activity recorded since the last publish
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Delta {
    bytes_sent: u64,
    bytes_recv: u64,
    opened: u64,
    closed: u64,
    last_active_ms: i64,
}

impl Delta {
    fn apply(self, stats: &mut ForwardStats) {
        stats.bytes_sent = stats.bytes_sent.saturating_add(self.bytes_sent);
        stats.bytes_recv = stats.bytes_recv.saturating_add(self.bytes_recv);
        stats.total_connections = stats.total_connections.saturating_add(self.opened);
        // Saturates: a clear may have zeroed connections that close afterwards
        stats.connections = stats
            .connections
            .saturating_add(self.opened)
            .saturating_sub(self.closed);
        if self.last_active_ms != 0 {
            let at = DateTime::<Utc>::from_timestamp_millis(self.last_active_ms);
            stats.last_active = stats.last_active.max(at);
        }
    }
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn record_recv(&self, n: u64) {
        self.bytes_recv.fetch_add(n, Ordering::Relaxed);
        self.touch();
    }

    pub fn connection_opened(&self) {
        self.opened.fetch_add(1, Ordering::Relaxed);
        self.touch();
    }

    pub fn connection_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn touch(&self) {
        self.last_active_ms
            .fetch_max(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Closes are read before opens so a close is never seen without its open
    fn take(&self) -> Delta {
        let closed = self.closed.swap(0, Ordering::Relaxed);
        Delta {
            closed,
            opened: self.opened.swap(0, Ordering::Relaxed),
            bytes_sent: self.bytes_sent.swap(0, Ordering::Relaxed),
            bytes_recv: self.bytes_recv.swap(0, Ordering::Relaxed),
            last_active_ms: self.last_active_ms.swap(0, Ordering::Relaxed),
        }
    }

    fn peek(&self) -> Delta {
        let closed = self.closed.load(Ordering::Relaxed);
        Delta {
            closed,
            opened: self.opened.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_recv: self.bytes_recv.load(Ordering::Relaxed),
            last_active_ms: self.last_active_ms.load(Ordering::Relaxed),
        }
    }

    /// The rule's published stats plus everything not yet published
    pub fn load(&self, rule: &ForwardRule) -> ForwardStats {
        let mut stats = rule.stats();
        self.peek().apply(&mut stats);
        stats
    }

    /// Add pending activity to the rule; returns true if its stats changed
    pub fn publish(&self, rule: &ForwardRule) -> bool {
        rule.update_stats(|stats| self.take().apply(stats))
    }

    /// Zero both these counters and the rule's published copy
    pub fn clear(&self, rule: &ForwardRule) {
        rule.update_stats(|stats| {
            self.take();
            *stats = ForwardStats::default();
        });
    }
}

/// Publish counters into the rule every `interval` until `shutdown` fires,
/// then flush once more so the final partial interval is not lost.
pub(crate) async fn run_publisher(
    rule: Arc<ForwardRule>,
    counters: Arc<TrafficCounters>,
    interval: Duration,
    shutdown: CancellationToken,
    events: ForwardEventEmitter,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if counters.publish(&rule) {
                    events.emit_stats_updated(rule.id(), rule.stats());
                }
            }
        }
    }

    if counters.publish(&rule) {
        events.emit_stats_updated(rule.id(), rule.stats());
    }
    debug!("Stats publisher for '{}' exited", rule.name());
}
