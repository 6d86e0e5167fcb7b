//! Forwarding rules
//!
//! `RuleSpec` is the persisted part of a rule. `ForwardRule` is the live
//! record shared between the registry, the forwarder bound to it and the
//! presentation layer: an immutable spec plus lock-protected published state.

use std::fmt;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::ForwardError;
use super::stats::ForwardStats;

/// Persisted rule fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl RuleSpec {
    pub fn new(
        name: impl Into<String>,
        local_port: u16,
        remote_host: impl Into<String>,
        remote_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            local_port,
            remote_host: remote_host.into(),
            remote_port,
        }
    }

    /// Remote endpoint as "host:port"
    pub fn target(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }

    /// Field-level checks; port uniqueness is the registry's job
    pub fn validate(&self) -> Result<(), ForwardError> {
        if self.name.trim().is_empty() {
            return Err(ForwardError::InvalidRule("name must not be empty".into()));
        }
        if self.local_port == 0 {
            return Err(ForwardError::InvalidRule(
                "local port must be between 1 and 65535".into(),
            ));
        }
        if self.remote_host.trim().is_empty() {
            return Err(ForwardError::InvalidRule("remote host must not be empty".into()));
        }
        if self.remote_port == 0 {
            return Err(ForwardError::InvalidRule(
                "remote port must be between 1 and 65535".into(),
            ));
        }
        Ok(())
    }
}

/// Status of a rule as seen by the presentation layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForwardStatus {
    /// Forwarder bound and accepting
    Active,
    /// No forwarder bound
    Stopped,
    /// Last start attempt failed
    Error,
}

#[derive(Debug, Default)]
struct RuleState {
    running: bool,
    error: Option<String>,
    stats: ForwardStats,
}

/// Live forwarding rule
#[derive(Debug)]
pub struct ForwardRule {
    id: String,
    spec: RuleSpec,
    state: RwLock<RuleState>,
}

impl ForwardRule {
    pub fn new(spec: RuleSpec) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), spec)
    }

    /// Create a rule that keeps an existing runtime id (used on edit)
    pub fn with_id(id: impl Into<String>, spec: RuleSpec) -> Self {
        Self {
            id: id.into(),
            spec,
            state: RwLock::new(RuleState::default()),
        }
    }

    /// Stable runtime id, never persisted
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn spec(&self) -> &RuleSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn local_port(&self) -> u16 {
        self.spec.local_port
    }

    pub fn is_running(&self) -> bool {
        self.state.read().running
    }

    pub fn error(&self) -> Option<String> {
        self.state.read().error.clone()
    }

    pub fn stats(&self) -> ForwardStats {
        self.state.read().stats.clone()
    }

    pub fn status(&self) -> ForwardStatus {
        let state = self.state.read();
        if state.running {
            ForwardStatus::Active
        } else if state.error.is_some() {
            ForwardStatus::Error
        } else {
            ForwardStatus::Stopped
        }
    }

    /// Consistent copy of every displayed field
    pub fn snapshot(&self) -> RuleSnapshot {
        let state = self.state.read();
        RuleSnapshot {
            id: self.id.clone(),
            name: self.spec.name.clone(),
            local_port: self.spec.local_port,
            remote_host: self.spec.remote_host.clone(),
            remote_port: self.spec.remote_port,
            is_running: state.running,
            error: state.error.clone(),
            bytes_sent: state.stats.bytes_sent,
            bytes_recv: state.stats.bytes_recv,
            connections: state.stats.connections,
            total_connections: state.stats.total_connections,
            last_active: state.stats.last_active,
        }
    }

    pub(crate) fn mark_running(&self) {
        let mut state = self.state.write();
        state.running = true;
        state.error = None;
    }

    pub(crate) fn mark_stopped(&self) {
        let mut state = self.state.write();
        state.running = false;
        state.error = None;
    }

    /// Clear `running` but keep a recorded start error
    pub(crate) fn mark_halted(&self) {
        self.state.write().running = false;
    }

    pub(crate) fn mark_failed(&self, error: impl Into<String>) {
        let mut state = self.state.write();
        state.running = false;
        state.error = Some(error.into());
    }

    /// Modify the published counters under the state lock; returns true if
    /// anything changed
    pub(crate) fn update_stats(&self, update: impl FnOnce(&mut ForwardStats)) -> bool {
        let mut state = self.state.write();
        let before = state.stats.clone();
        update(&mut state.stats);
        state.stats != before
    }

    /// Take over the totals of the record this one replaces. Live connections
    /// stay with the old record's forwarder.
    pub(crate) fn inherit_stats(&self, previous: &ForwardRule) {
        let stats = ForwardStats {
            connections: 0,
            ..previous.stats()
        };
        self.state.write().stats = stats;
    }

    pub(crate) fn clear_stats(&self) {
        self.state.write().stats = ForwardStats::default();
    }
}

/// Point-in-time view of a rule for display
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleSnapshot {
    pub id: String,
    pub name: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
    pub is_running: bool,
    pub error: Option<String>,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub connections: u64,
    pub total_connections: u64,
    pub last_active: Option<DateTime<Utc>>,
}

impl fmt::Display for RuleSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match (self.is_running, &self.error) {
            (true, _) => "running".to_string(),
            (false, Some(e)) => format!("failed: {}", e),
            (false, None) => "stopped".to_string(),
        };
        let last_active = format_last_active(self.last_active, Utc::now());
        write!(
            f,
            "{} :{} -> {}:{} [{}] sent {} recv {} conns {} last active {}",
            self.name,
            self.local_port,
            self.remote_host,
            self.remote_port,
            status,
            format_bytes(self.bytes_sent),
            format_bytes(self.bytes_recv),
            self.connections,
            last_active,
        )
    }
}

/// Age of the last activity relative to `now`, e.g. "3 minutes ago"
pub fn format_last_active(last_active: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(at) = last_active else {
        return "never".into();
    };
    let secs = (now - at).num_seconds();
    match secs {
        s if s < 5 => "just now".into(),
        s if s < 60 => format!("{} seconds ago", s),
        s if s < 3600 => format!("{} minutes ago", s / 60),
        s if s < 86400 => format!("{} hours ago", s / 3600),
        s => format!("{} days ago", s / 86400),
    }
}

/// Human-readable byte count (1024-based)
pub fn format_bytes(bytes: u64) -> String {
    const UNIT: u64 = 1024;
    if bytes < UNIT {
        return format!("{} B", bytes);
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    let suffix = ['K', 'M', 'G', 'T', 'P', 'E'][exp];
    format!("{:.1} {}B", bytes as f64 / div as f64, suffix)
}
