//! Port Forwarding Manager
//!
//! Coordinates rule mutations with forwarder lifecycles. Every operation
//! runs under one async lock, so a rule is never edited while another
//! caller is starting or stopping its forwarder.
//!
//! Running forwarders are kept in a side table keyed by the rule's runtime
//! id, which survives edits and renames.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

use super::error::ForwardError;
use super::events::{ForwardEvent, ForwardEventEmitter};
use super::forwarder::Forwarder;
use super::registry::RuleRegistry;
use super::rule::{ForwardRule, ForwardStatus, RuleSnapshot, RuleSpec};
use crate::config::ForwardSettings;

/// Event buffer per subscriber before slow readers start lagging
const EVENT_CAPACITY: usize = 256;

struct ManagerState {
    registry: RuleRegistry,
    /// Running forwarders by rule id
    forwarders: HashMap<String, Arc<Forwarder>>,
}

/// Port forwarding manager
///
/// Thread-safe; designed for concurrent access from the presentation layer
/// and the shutdown path.
pub struct ForwardingManager {
    state: Mutex<ManagerState>,
    settings: ForwardSettings,
    event_emitter: ForwardEventEmitter,
}

impl ForwardingManager {
    /// Create a manager over `registry`; no forwarder is started yet
    pub fn new(registry: RuleRegistry, settings: ForwardSettings) -> Self {
        Self::with_event_emitter(registry, settings, ForwardEventEmitter::new(EVENT_CAPACITY))
    }

    pub fn with_event_emitter(
        registry: RuleRegistry,
        settings: ForwardSettings,
        event_emitter: ForwardEventEmitter,
    ) -> Self {
        Self {
            state: Mutex::new(ManagerState {
                registry,
                forwarders: HashMap::new(),
            }),
            settings,
            event_emitter,
        }
    }

    /// Subscribe to status, stats and rule-set events
    pub fn subscribe(&self) -> broadcast::Receiver<ForwardEvent> {
        self.event_emitter.subscribe()
    }

    pub fn settings(&self) -> &ForwardSettings {
        &self.settings
    }

    /// Live rule records, in registry order
    pub async fn rules(&self) -> Vec<Arc<ForwardRule>> {
        self.state.lock().await.registry.rules().to_vec()
    }

    /// Display view of every rule, in registry order
    pub async fn snapshots(&self) -> Vec<RuleSnapshot> {
        self.state
            .lock()
            .await
            .registry
            .rules()
            .iter()
            .map(|r| r.snapshot())
            .collect()
    }

    /// Count running forwarders
    pub async fn count(&self) -> usize {
        self.state.lock().await.forwarders.len()
    }

    /// Add a rule, persist it and try to start it.
    ///
    /// A start failure is recorded on the rule and does not fail the add.
    pub async fn add_rule(&self, spec: RuleSpec) -> Result<Arc<ForwardRule>, ForwardError> {
        let mut state = self.state.lock().await;
        let rule = state.registry.insert(spec)?;
        let saved = state.registry.persist().await;

        let _ = self.start_rule(&mut state, &rule).await;
        self.event_emitter.emit_rules_changed();

        saved?;
        Ok(rule)
    }

    /// Replace the rule at `index`, restarting its forwarder if it was running.
    ///
    /// If the registry rejects the edit, the previous rule is restarted and
    /// the error returned. If the edited rule fails to start, the edit still
    /// succeeds and the start error is recorded on the rule.
    pub async fn update_rule(
        &self,
        index: usize,
        spec: RuleSpec,
    ) -> Result<Arc<ForwardRule>, ForwardError> {
        let mut state = self.state.lock().await;
        let old = state.registry.get(index)?.clone();
        let was_running = old.is_running() || state.forwarders.contains_key(old.id());

        if was_running {
            self.stop_rule(&mut state, &old).await;
        }

        let rule = match state.registry.replace(index, spec) {
            Ok(rule) => rule,
            Err(e) => {
                if was_running {
                    if let Err(restore_err) = self.start_rule(&mut state, &old).await {
                        warn!(
                            "Failed to restore forward '{}' after rejected edit: {}",
                            old.name(),
                            restore_err
                        );
                    }
                }
                return Err(e);
            }
        };
        let saved = state.registry.persist().await;

        if was_running {
            let _ = self.start_rule(&mut state, &rule).await;
        }
        self.event_emitter.emit_rules_changed();

        saved?;
        Ok(rule)
    }

    /// Stop and remove the rule at `index`
    pub async fn delete_rule(&self, index: usize) -> Result<Arc<ForwardRule>, ForwardError> {
        let mut state = self.state.lock().await;
        let rule = state.registry.get(index)?.clone();

        self.stop_rule(&mut state, &rule).await;
        let removed = state.registry.remove(index)?;
        let saved = state.registry.persist().await;
        self.event_emitter.emit_rules_changed();

        saved?;
        Ok(removed)
    }

    /// Start (or restart) the forwarder of the rule at `index`
    pub async fn start_forwarder(&self, index: usize) -> Result<(), ForwardError> {
        let mut state = self.state.lock().await;
        let rule = state.registry.get(index)?.clone();
        self.start_rule(&mut state, &rule).await
    }

    /// Stop the forwarder of the rule at `index`; no-op if not running
    pub async fn stop_forwarder(&self, index: usize) -> Result<(), ForwardError> {
        let mut state = self.state.lock().await;
        let rule = state.registry.get(index)?.clone();
        self.stop_rule(&mut state, &rule).await;
        Ok(())
    }

    /// Zero the counters of the rule at `index`, running or not
    pub async fn clear_stats(&self, index: usize) -> Result<(), ForwardError> {
        let state = self.state.lock().await;
        let rule = state.registry.get(index)?;
        match state.forwarders.get(rule.id()) {
            Some(forwarder) => forwarder.clear_stats(),
            None => rule.clear_stats(),
        }
        Ok(())
    }

    /// Start every rule that is not running; returns how many started
    pub async fn start_all(&self) -> usize {
        let mut state = self.state.lock().await;
        let rules = state.registry.rules().to_vec();
        let mut started = 0;
        for rule in rules {
            if state.forwarders.contains_key(rule.id()) {
                continue;
            }
            if self.start_rule(&mut state, &rule).await.is_ok() {
                started += 1;
            }
        }
        info!("Started {} of {} forwards", started, state.registry.len());
        started
    }

    /// Stop every running forwarder
    pub async fn stop_all(&self) {
        let mut state = self.state.lock().await;
        info!("Stopping all {} forwards", state.forwarders.len());

        for (_, forwarder) in state.forwarders.drain() {
            forwarder.stop().await;
            let rule = forwarder.rule();
            rule.mark_stopped();
            self.event_emitter
                .emit_status_changed(rule.id(), rule.name(), ForwardStatus::Stopped, None);
        }
        // Rules whose record drifted from the side table; start errors stay
        for rule in state.registry.rules() {
            rule.mark_halted();
        }

        info!("All forwards stopped");
    }

    async fn start_rule(
        &self,
        state: &mut ManagerState,
        rule: &Arc<ForwardRule>,
    ) -> Result<(), ForwardError> {
        if rule.is_running() || state.forwarders.contains_key(rule.id()) {
            self.stop_rule(state, rule).await;
        }

        let forwarder = Arc::new(Forwarder::new(
            rule.clone(),
            self.settings.clone(),
            self.event_emitter.clone(),
        ));
        match forwarder.start().await {
            Ok(_) => {
                rule.mark_running();
                state.forwarders.insert(rule.id().to_string(), forwarder);
                self.event_emitter
                    .emit_status_changed(rule.id(), rule.name(), ForwardStatus::Active, None);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to start forward '{}': {}", rule.name(), e);
                rule.mark_failed(e.to_string());
                self.event_emitter.emit_status_changed(
                    rule.id(),
                    rule.name(),
                    ForwardStatus::Error,
                    Some(e.to_string()),
                );
                Err(e)
            }
        }
    }

    async fn stop_rule(&self, state: &mut ManagerState, rule: &Arc<ForwardRule>) {
        if let Some(forwarder) = state.forwarders.remove(rule.id()) {
            forwarder.stop().await;
        }

        // Anything else still bound to this port is state drift
        let strays: Vec<String> = state
            .forwarders
            .iter()
            .filter(|(_, f)| f.local_port() == rule.local_port())
            .map(|(id, _)| id.clone())
            .collect();
        for id in strays {
            if let Some(forwarder) = state.forwarders.remove(&id) {
                warn!(
                    "Stopping stray forward '{}' bound to port {}",
                    forwarder.rule().name(),
                    forwarder.local_port()
                );
                forwarder.stop().await;
                forwarder.rule().mark_stopped();
            }
        }

        let was_running = rule.is_running();
        rule.mark_stopped();
        if was_running {
            self.event_emitter
                .emit_status_changed(rule.id(), rule.name(), ForwardStatus::Stopped, None);
        }
    }
}
