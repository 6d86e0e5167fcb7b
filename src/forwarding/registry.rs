//! Rule Registry
//!
//! Ordered collection of forwarding rules. Enforces local-port uniqueness
//! and hands the full rule list to a `RuleStore` after every mutation.
//! Order only matters for index-based addressing (the UI cursor).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use super::error::ForwardError;
use super::rule::{ForwardRule, RuleSpec};
use crate::config::StorageError;

/// Persistence collaborator: durably stores the persisted rule fields
#[async_trait]
pub trait RuleStore: Send + Sync {
    async fn load_rules(&self) -> Result<Vec<RuleSpec>, StorageError>;
    async fn save_rules(&self, rules: &[RuleSpec]) -> Result<(), StorageError>;
}

pub struct RuleRegistry {
    rules: Vec<Arc<ForwardRule>>,
    store: Arc<dyn RuleStore>,
}

impl RuleRegistry {
    /// Empty registry backed by `store`
    pub fn new(store: Arc<dyn RuleStore>) -> Self {
        Self {
            rules: Vec::new(),
            store,
        }
    }

    /// Build a registry from the rules currently in `store`.
    ///
    /// Invalid entries and entries reusing an earlier local port are skipped.
    pub async fn load(store: Arc<dyn RuleStore>) -> Result<Self, ForwardError> {
        let specs = store.load_rules().await?;
        let mut registry = Self::new(store);
        for spec in specs {
            if let Err(e) = registry.insert(spec.clone()) {
                warn!("Skipping stored rule '{}': {}", spec.name, e);
            }
        }
        info!("Loaded {} forwarding rules", registry.len());
        Ok(registry)
    }

    pub fn rules(&self) -> &[Arc<ForwardRule>] {
        &self.rules
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn get(&self, index: usize) -> Result<&Arc<ForwardRule>, ForwardError> {
        self.rules.get(index).ok_or(ForwardError::IndexOutOfRange {
            index,
            len: self.rules.len(),
        })
    }

    pub fn find_by_port(&self, port: u16) -> Option<&Arc<ForwardRule>> {
        self.rules.iter().find(|r| r.local_port() == port)
    }

    /// Append a rule and persist the rule set
    pub async fn add_rule(&mut self, spec: RuleSpec) -> Result<Arc<ForwardRule>, ForwardError> {
        let rule = self.insert(spec)?;
        self.persist().await?;
        Ok(rule)
    }

    /// Replace the rule at `index` and persist the rule set
    pub async fn update_rule(
        &mut self,
        index: usize,
        spec: RuleSpec,
    ) -> Result<Arc<ForwardRule>, ForwardError> {
        let rule = self.replace(index, spec)?;
        self.persist().await?;
        Ok(rule)
    }

    /// Remove the rule at `index` and persist the rule set
    pub async fn delete_rule(&mut self, index: usize) -> Result<Arc<ForwardRule>, ForwardError> {
        let rule = self.remove(index)?;
        self.persist().await?;
        Ok(rule)
    }

    /// Write the current rule set; on failure memory and disk may diverge
    pub async fn persist(&self) -> Result<(), ForwardError> {
        let specs: Vec<RuleSpec> = self.rules.iter().map(|r| r.spec().clone()).collect();
        self.store.save_rules(&specs).await.map_err(|e| {
            warn!("Failed to persist {} rules: {}", specs.len(), e);
            ForwardError::from(e)
        })
    }

    pub(crate) fn insert(&mut self, spec: RuleSpec) -> Result<Arc<ForwardRule>, ForwardError> {
        spec.validate()?;
        self.check_port(spec.local_port, None)?;

        let rule = Arc::new(ForwardRule::new(spec));
        info!(
            "Added rule '{}': :{} -> {}",
            rule.name(),
            rule.local_port(),
            rule.spec().target()
        );
        self.rules.push(rule.clone());
        Ok(rule)
    }

    /// The replacement keeps the old rule's id and traffic totals
    pub(crate) fn replace(
        &mut self,
        index: usize,
        spec: RuleSpec,
    ) -> Result<Arc<ForwardRule>, ForwardError> {
        let previous = self.get(index)?.clone();
        spec.validate()?;
        self.check_port(spec.local_port, Some(index))?;

        let rule = Arc::new(ForwardRule::with_id(previous.id(), spec));
        rule.inherit_stats(&previous);
        info!(
            "Updated rule #{} '{}': :{} -> {}",
            index,
            rule.name(),
            rule.local_port(),
            rule.spec().target()
        );
        self.rules[index] = rule.clone();
        Ok(rule)
    }

    pub(crate) fn remove(&mut self, index: usize) -> Result<Arc<ForwardRule>, ForwardError> {
        self.get(index)?;
        let rule = self.rules.remove(index);
        info!("Deleted rule #{} '{}'", index, rule.name());
        Ok(rule)
    }

    fn check_port(&self, port: u16, except: Option<usize>) -> Result<(), ForwardError> {
        let owner = self
            .rules
            .iter()
            .enumerate()
            .find(|(i, r)| Some(*i) != except && r.local_port() == port);
        match owner {
            Some((_, rule)) => Err(ForwardError::DuplicatePort {
                port,
                owner: rule.name().to_string(),
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::testing::MemoryStore;

    fn spec(name: &str, port: u16) -> RuleSpec {
        RuleSpec::new(name, port, "10.0.0.5", 80)
    }

    fn names(registry: &RuleRegistry) -> Vec<String> {
        registry.rules().iter().map(|r| r.name().to_string()).collect()
    }

    async fn registry_with(specs: &[RuleSpec]) -> (RuleRegistry, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_rules(specs.to_vec()));
        let registry = RuleRegistry::load(store.clone()).await.unwrap();
        (registry, store)
    }

    #[tokio::test]
    async fn test_add_persists_full_set() {
        let (mut registry, store) = registry_with(&[spec("web", 8080)]).await;
        registry.add_rule(spec("db", 5432)).await.unwrap();

        assert_eq!(names(&registry), vec!["web", "db"]);
        assert_eq!(store.saved(), vec![spec("web", 8080), spec("db", 5432)]);
    }

    #[tokio::test]
    async fn test_add_duplicate_port_rejected() {
        let (mut registry, store) = registry_with(&[spec("web", 8080), spec("db", 5432)]).await;

        let err = registry.add_rule(spec("other", 5432)).await.unwrap_err();
        assert!(matches!(err, ForwardError::DuplicatePort { port: 5432, ref owner } if owner == "db"));
        assert_eq!(names(&registry), vec!["web", "db"]);
        assert_eq!(*store.saves.lock(), 0);
    }

    #[tokio::test]
    async fn test_add_invalid_rule_rejected() {
        let (mut registry, _) = registry_with(&[]).await;
        let err = registry
            .add_rule(RuleSpec::new("x", 8080, "", 80))
            .await
            .unwrap_err();
        assert!(matches!(err, ForwardError::InvalidRule(_)));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_update_keeps_own_port_id_and_totals() {
        let (mut registry, _) = registry_with(&[spec("web", 8080)]).await;
        let id = registry.get(0).unwrap().id().to_string();
        registry.get(0).unwrap().update_stats(|s| {
            s.bytes_recv = 200;
            s.total_connections = 1;
        });

        let updated = registry
            .update_rule(0, RuleSpec::new("web2", 8080, "10.0.0.6", 81))
            .await
            .unwrap();
        assert_eq!(updated.id(), id);
        assert_eq!(updated.stats().bytes_recv, 200);
        assert_eq!(updated.stats().total_connections, 1);
        assert_eq!(registry.get(0).unwrap().spec().remote_host, "10.0.0.6");
    }

    #[tokio::test]
    async fn test_update_duplicate_port_leaves_rule_unchanged() {
        let (mut registry, _) = registry_with(&[spec("web", 8080), spec("db", 5432)]).await;
        let before = registry.get(0).unwrap().clone();

        let err = registry.update_rule(0, spec("web", 5432)).await.unwrap_err();
        assert!(matches!(err, ForwardError::DuplicatePort { port: 5432, .. }));
        assert!(Arc::ptr_eq(registry.get(0).unwrap(), &before));
    }

    #[tokio::test]
    async fn test_update_and_delete_out_of_range() {
        let (mut registry, _) = registry_with(&[spec("web", 8080)]).await;
        assert!(matches!(
            registry.update_rule(1, spec("x", 1)).await,
            Err(ForwardError::IndexOutOfRange { index: 1, len: 1 })
        ));
        assert!(matches!(
            registry.delete_rule(5).await,
            Err(ForwardError::IndexOutOfRange { index: 5, len: 1 })
        ));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_preserves_order() {
        let (mut registry, store) =
            registry_with(&[spec("a", 1001), spec("b", 1002), spec("c", 1003), spec("d", 1004)])
                .await;

        let removed = registry.delete_rule(1).await.unwrap();
        assert_eq!(removed.name(), "b");
        assert_eq!(names(&registry), vec!["a", "c", "d"]);
        assert_eq!(store.saved().len(), 3);
    }

    #[tokio::test]
    async fn test_save_failure_keeps_in_memory_mutation() {
        let (mut registry, store) = registry_with(&[spec("web", 8080)]).await;
        store.fail_saves(true);

        let err = registry.add_rule(spec("db", 5432)).await.unwrap_err();
        assert!(matches!(err, ForwardError::Storage(_)));
        assert!(!err.is_validation());
        assert_eq!(names(&registry), vec!["web", "db"]);
        assert_eq!(store.saved(), vec![spec("web", 8080)]);

        // Next successful save catches the store up
        store.fail_saves(false);
        registry.persist().await.unwrap();
        assert_eq!(store.saved().len(), 2);
    }

    #[tokio::test]
    async fn test_load_skips_conflicting_entries() {
        let (registry, _) =
            registry_with(&[spec("web", 8080), spec("dup", 8080), spec("", 9000)]).await;
        assert_eq!(names(&registry), vec!["web"]);
        assert!(registry.find_by_port(8080).is_some());
        assert!(registry.find_by_port(9000).is_none());
    }
}
