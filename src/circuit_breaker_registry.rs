//! Per-route circuit breakers.
//!
//! Breakers are created on first use with the registry's shared config and live until they are
//! explicitly removed or the registry is cleared.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitMetrics, CircuitState};
use crate::clock::Clock;
use crate::error::{ConfigError, RegistryError};
use crate::registry::Registry;
use std::sync::Arc;
use tracing::warn;

/// Owns one [`CircuitBreaker`] per route key.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: Registry<CircuitBreaker>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { breakers: Registry::new(), config, clock })
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Breaker for `route`, created lazily.
    pub fn breaker(&self, route: &str) -> Arc<CircuitBreaker> {
        self.breakers.get_or_insert_with(route, || {
            CircuitBreaker::from_validated(self.config.clone(), self.clock.clone())
        })
    }

    pub fn get(&self, route: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(route)
    }

    /// Force the route's breaker closed, erroring if the route was never seen.
    pub fn reset(&self, route: &str) -> Result<(), RegistryError> {
        match self.breakers.get(route) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => {
                warn!(route, "reset requested for unknown circuit breaker");
                Err(RegistryError::NotFound { route: route.to_string() })
            }
        }
    }

    pub fn reset_all(&self) {
        for (_, breaker) in self.breakers.entries() {
            breaker.reset();
        }
    }

    pub fn remove(&self, route: &str) -> bool {
        self.breakers.remove(route).is_some()
    }

    pub fn clear(&self) {
        self.breakers.clear();
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    pub fn state(&self, route: &str) -> Option<CircuitState> {
        self.breakers.get(route).map(|b| b.state())
    }

    /// Metrics of every breaker, sorted by route.
    pub fn snapshot(&self) -> Vec<(String, CircuitMetrics)> {
        self.breakers.entries().into_iter().map(|(route, b)| (route, b.metrics())).collect()
    }
}
