//! Infrastructure health tracking.
//!
//! The health endpoint reflects the router's own infrastructure (brokers,
//! coordination store, configuration freshness), never downstream targets:
//! mediation failures are an expected part of async delivery.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::debug;

use fc_core::{ComponentHealth, HealthReport, HealthStatus};

#[derive(Clone)]
struct ComponentState {
    healthy: bool,
    detail: Option<String>,
    /// Hard components take the whole instance to FAILED when down.
    hard: bool,
}

#[derive(Default)]
pub struct HealthService {
    components: RwLock<BTreeMap<String, ComponentState>>,
}

impl HealthService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a soft component: failure degrades, does not fail, the node.
    pub fn set_component(&self, name: &str, healthy: bool, detail: Option<String>) {
        self.set(name, healthy, detail, false);
    }

    /// Record a hard component: failure means the instance must not serve.
    pub fn set_hard_component(&self, name: &str, healthy: bool, detail: Option<String>) {
        self.set(name, healthy, detail, true);
    }

    fn set(&self, name: &str, healthy: bool, detail: Option<String>, hard: bool) {
        let mut components = self.components.write();
        let changed = components
            .get(name)
            .map(|c| c.healthy != healthy)
            .unwrap_or(true);
        components.insert(
            name.to_string(),
            ComponentState {
                healthy,
                detail,
                hard,
            },
        );
        if changed {
            debug!(component = %name, healthy, "component health changed");
        }
    }

    pub fn remove_component(&self, name: &str) {
        self.components.write().remove(name);
    }

    pub fn report(&self) -> HealthReport {
        let components = self.components.read();

        let mut status = HealthStatus::Up;
        for state in components.values() {
            if !state.healthy {
                if state.hard {
                    status = HealthStatus::Failed;
                    break;
                }
                status = HealthStatus::Degraded;
            }
        }

        HealthReport {
            status,
            components: components
                .iter()
                .map(|(name, state)| ComponentHealth {
                    name: name.clone(),
                    healthy: state.healthy,
                    detail: state.detail.clone(),
                })
                .collect(),
        }
    }

    pub fn is_serving(&self) -> bool {
        self.report().status != HealthStatus::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_health_is_up() {
        let health = HealthService::new();
        assert_eq!(health.report().status, HealthStatus::Up);
    }

    #[test]
    fn soft_failure_degrades() {
        let health = HealthService::new();
        health.set_component("broker:orders.fifo", false, Some("poll error".into()));
        assert_eq!(health.report().status, HealthStatus::Degraded);
        assert!(health.is_serving());
    }

    #[test]
    fn hard_failure_fails_the_instance() {
        let health = HealthService::new();
        health.set_component("broker:orders.fifo", true, None);
        health.set_hard_component("coordination-store", false, Some("unreachable".into()));

        let report = health.report();
        assert_eq!(report.status, HealthStatus::Failed);
        assert!(!health.is_serving());
    }

    #[test]
    fn recovery_restores_up() {
        let health = HealthService::new();
        health.set_hard_component("coordination-store", false, None);
        health.set_hard_component("coordination-store", true, None);
        assert_eq!(health.report().status, HealthStatus::Up);
    }
}
