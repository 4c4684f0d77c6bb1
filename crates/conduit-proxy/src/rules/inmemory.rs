use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ForwardRule, RuleStore, StoreError};

/// In-memory implementation of RuleStore
///
/// Holds rules in insertion order. Useful for tests, embedded rule sets in the config
/// file, and hosts that manage rules programmatically.
#[derive(Default)]
pub struct InMemoryRuleStore {
    rules: RwLock<Vec<ForwardRule>>,
}

impl InMemoryRuleStore {
    pub fn new(rules: Vec<ForwardRule>) -> Self {
        let rules = rules
            .into_iter()
            .map(|mut rule| {
                rule.normalize();
                rule
            })
            .collect();
        Self {
            rules: RwLock::new(rules),
        }
    }

    /// Insert a rule, replacing any existing rule with the same id in place.
    pub fn upsert(&self, mut rule: ForwardRule) {
        rule.normalize();
        let mut rules = self.rules.write();
        match rules.iter_mut().find(|existing| existing.id == rule.id) {
            Some(existing) => *existing = rule,
            None => rules.push(rule),
        }
    }

    pub fn remove(&self, id: i64) -> Option<ForwardRule> {
        let mut rules = self.rules.write();
        let index = rules.iter().position(|rule| rule.id == id)?;
        Some(rules.remove(index))
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}

#[async_trait]
impl RuleStore for InMemoryRuleStore {
    async fn list_all(&self) -> Result<Vec<ForwardRule>, StoreError> {
        Ok(self.rules.read().clone())
    }

    async fn get_by_id(&self, id: i64) -> Result<Option<ForwardRule>, StoreError> {
        Ok(self.rules.read().iter().find(|rule| rule.id == id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::test_rule;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_inmemory_preserves_order() {
        let store = InMemoryRuleStore::new(vec![
            test_rule(3, "c", "http://c.example"),
            test_rule(1, "a", "http://a.example"),
            test_rule(2, "b", "http://b.example"),
        ]);
        let ids: Vec<i64> = store.list_all().await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[tokio::test]
    async fn test_inmemory_normalizes_on_insert() {
        let mut rule = test_rule(1, "", "http://a.example");
        rule.name = "Orders Service".to_string();
        let store = InMemoryRuleStore::new(vec![rule]);
        assert_eq!(store.get_by_id(1).await.unwrap().unwrap().slug, "orders-service");
    }

    #[tokio::test]
    async fn test_inmemory_upsert_replaces_in_place() {
        let store = InMemoryRuleStore::new(vec![
            test_rule(1, "a", "http://a.example"),
            test_rule(2, "b", "http://b.example"),
        ]);
        store.upsert(test_rule(1, "renamed", "http://a.example"));
        store.upsert(test_rule(3, "c", "http://c.example"));

        let rules = store.list_all().await.unwrap();
        assert_eq!(rules.len(), 3);
        assert_eq!(rules[0].slug, "renamed");
        assert_eq!(rules[2].id, 3);
    }

    #[tokio::test]
    async fn test_inmemory_remove() {
        let store = InMemoryRuleStore::new(vec![test_rule(1, "a", "http://a.example")]);
        assert!(store.remove(1).is_some());
        assert!(store.remove(1).is_none());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_reads_during_writes() {
        let store = Arc::new(InMemoryRuleStore::default());
        let writers: Vec<_> = (0..8)
            .map(|id| {
                let store = Arc::clone(&store);
                tokio::spawn(async move {
                    store.upsert(test_rule(id, &format!("r{id}"), "http://x.example"));
                    store.list_all().await.unwrap().len()
                })
            })
            .collect();

        for writer in writers {
            assert!(writer.await.unwrap() >= 1);
        }
        assert_eq!(store.len(), 8);
    }
}
