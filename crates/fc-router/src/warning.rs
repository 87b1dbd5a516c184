//! In-memory operational warnings with categories and severities.

use parking_lot::RwLock;
use std::collections::HashMap;
use chrono::Utc;
use tracing::debug;

use fc_core::{Warning, WarningCategory, WarningSeverity};

#[derive(Debug, Clone)]
pub struct WarningServiceConfig {
    pub max_warning_age_hours: i64,
    pub max_warnings: usize,
    pub auto_acknowledge_hours: i64,
}

impl Default for WarningServiceConfig {
    fn default() -> Self {
        Self {
            max_warning_age_hours: 24,
            max_warnings: 1000,
            auto_acknowledge_hours: 8,
        }
    }
}

#[derive(Default)]
pub struct WarningService {
    warnings: RwLock<HashMap<String, Warning>>,
    config: WarningServiceConfig,
}

impl WarningService {
    pub fn new(config: WarningServiceConfig) -> Self {
        Self {
            warnings: RwLock::new(HashMap::new()),
            config,
        }
    }

    pub fn add_warning(
        &self,
        category: WarningCategory,
        severity: WarningSeverity,
        message: String,
        source: String,
    ) -> String {
        let warning = Warning::new(category, severity, message, source);
        let id = warning.id.clone();

        let mut warnings = self.warnings.write();
        if warnings.len() >= self.config.max_warnings {
            Self::evict_oldest(&mut warnings);
        }

        debug!(id = %id, category = ?category, severity = ?severity, "warning recorded");
        warnings.insert(id.clone(), warning);
        id
    }

    pub fn get_all(&self) -> Vec<Warning> {
        self.warnings.read().values().cloned().collect()
    }

    pub fn get_by_severity(&self, severity: WarningSeverity) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| w.severity == severity)
            .cloned()
            .collect()
    }

    pub fn get_unacknowledged(&self) -> Vec<Warning> {
        self.warnings
            .read()
            .values()
            .filter(|w| !w.acknowledged)
            .cloned()
            .collect()
    }

    pub fn acknowledge(&self, id: &str) -> bool {
        let mut warnings = self.warnings.write();
        if let Some(warning) = warnings.get_mut(id) {
            warning.acknowledged = true;
            warning.acknowledged_at = Some(Utc::now());
            true
        } else {
            false
        }
    }

    pub fn acknowledge_all(&self) -> usize {
        let mut warnings = self.warnings.write();
        let now = Utc::now();
        let mut count = 0;
        for warning in warnings.values_mut() {
            if !warning.acknowledged {
                warning.acknowledged = true;
                warning.acknowledged_at = Some(now);
                count += 1;
            }
        }
        count
    }

    pub fn critical_count(&self) -> usize {
        self.warnings
            .read()
            .values()
            .filter(|w| w.severity == WarningSeverity::Critical && !w.acknowledged)
            .count()
    }

    pub fn unacknowledged_count(&self) -> usize {
        self.warnings
            .read()
            .values()
            .filter(|w| !w.acknowledged)
            .count()
    }

    /// Age-based maintenance, called periodically from the lifecycle task.
    pub fn cleanup(&self) {
        let auto_ack_minutes = self.config.auto_acknowledge_hours * 60;
        let max_age_minutes = self.config.max_warning_age_hours * 60;

        let mut warnings = self.warnings.write();
        let now = Utc::now();
        for warning in warnings.values_mut() {
            if !warning.acknowledged && warning.age_minutes() > auto_ack_minutes {
                warning.acknowledged = true;
                warning.acknowledged_at = Some(now);
            }
        }
        warnings.retain(|_, w| w.age_minutes() <= max_age_minutes);
    }

    fn evict_oldest(warnings: &mut HashMap<String, Warning>) {
        let to_remove = (warnings.len() / 10).max(1);
        let mut sorted: Vec<(String, chrono::DateTime<Utc>)> = warnings
            .iter()
            .map(|(id, w)| (id.clone(), w.created_at))
            .collect();
        sorted.sort_by_key(|(_, at)| *at);

        for (id, _) in sorted.into_iter().take(to_remove) {
            warnings.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_acknowledge() {
        let service = WarningService::new(WarningServiceConfig::default());
        let id = service.add_warning(
            WarningCategory::Processing,
            WarningSeverity::Error,
            "delivery failed".to_string(),
            "worker".to_string(),
        );

        assert_eq!(service.unacknowledged_count(), 1);
        assert!(service.acknowledge(&id));
        assert_eq!(service.unacknowledged_count(), 0);
        assert!(!service.acknowledge("missing"));
    }

    #[test]
    fn critical_count_ignores_acknowledged() {
        let service = WarningService::new(WarningServiceConfig::default());
        let id = service.add_warning(
            WarningCategory::Coordination,
            WarningSeverity::Critical,
            "store down".to_string(),
            "standby".to_string(),
        );
        assert_eq!(service.critical_count(), 1);

        service.acknowledge(&id);
        assert_eq!(service.critical_count(), 0);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let service = WarningService::new(WarningServiceConfig {
            max_warnings: 10,
            ..Default::default()
        });
        for i in 0..15 {
            service.add_warning(
                WarningCategory::Processing,
                WarningSeverity::Warn,
                format!("warning {i}"),
                "test".to_string(),
            );
        }
        assert!(service.get_all().len() <= 10);
    }
}
