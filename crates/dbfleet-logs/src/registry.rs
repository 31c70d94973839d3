// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Deduplication of provider subscriptions shared between monitored servers.

use std::collections::HashSet;

/// Tracks which subscriptions already have a live receiver.
///
/// Owned by the coordinator, which starts subscriptions one target at a time. Mutation
/// takes `&mut self`, so handing the registry to concurrently running tasks would need
/// an owner task answering claim requests over a channel instead.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    active: HashSet<String>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` the first time `key` is seen and records it as active, `false`
    /// on every later call for the same key.
    pub fn should_start(&mut self, key: &str) -> bool {
        self.active.insert(key.to_string())
    }

    #[must_use]
    pub fn is_active(&self, key: &str) -> bool {
        self.active.contains(key)
    }

    /// Forgets `key`, so a later target referencing it may try to start it again.
    pub fn release(&mut self, key: &str) {
        self.active.remove(key);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.active.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_start_once_per_key() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.should_start("projects/p1/subscriptions/s1"));
        assert!(!registry.should_start("projects/p1/subscriptions/s1"));
        assert!(!registry.should_start("projects/p1/subscriptions/s1"));
        assert!(registry.should_start("projects/p1/subscriptions/s2"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_release_allows_restart() {
        let mut registry = SubscriptionRegistry::new();
        assert!(registry.should_start("k"));
        registry.release("k");
        assert!(!registry.is_active("k"));
        assert!(registry.should_start("k"));
    }

    #[test]
    fn test_empty_registry() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.is_empty());
        assert!(!registry.is_active("k"));
    }
}
