//! Registry of named circuit breakers.

use std::collections::BTreeMap;

use crate::breaker::{BreakerHealth, CircuitBreaker};

/// Tracks breakers for several dependencies by name.
#[derive(Debug, Default)]
pub struct DependencyMonitor {
    breakers: BTreeMap<String, CircuitBreaker>,
}

impl DependencyMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a breaker under its own name. Returns the breaker it replaced.
    pub fn register(&mut self, breaker: CircuitBreaker) -> Option<CircuitBreaker> {
        self.breakers.insert(breaker.name().to_string(), breaker)
    }

    pub fn unregister(&mut self, name: &str) -> Option<CircuitBreaker> {
        self.breakers.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut CircuitBreaker> {
        self.breakers.get_mut(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.breakers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn health(&self, name: &str) -> Option<BreakerHealth> {
        self.breakers.get(name).map(CircuitBreaker::health)
    }

    /// Health of every breaker, sorted by name.
    pub fn all_health(&self) -> Vec<BreakerHealth> {
        self.breakers.values().map(CircuitBreaker::health).collect()
    }

    /// Whether each dependency would currently accept a request.
    pub fn check_all(&mut self) -> BTreeMap<String, bool> {
        self.breakers
            .iter_mut()
            .map(|(name, breaker)| (name.clone(), breaker.allows_request()))
            .collect()
    }
}
