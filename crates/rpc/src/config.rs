use std::time::Duration;

use courier_engine::config::HandlerDeclaration;
use courier_engine::{ConfigError, EngineConfig, Violation};
use serde::{Deserialize, Serialize};

/// Worker configuration.
///
/// The engine section's routing key is the key requests are published with.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Engine settings shared with masters.
    pub engine: EngineConfig,

    /// Queue requests are consumed from.
    pub operator_name: String,

    /// Response routing key used when a request names no reply queue.
    pub response_name: Option<String>,

    /// Number of competing subscriptions on the operator queue.
    pub consumer_total: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            operator_name: String::new(),
            response_name: None,
            consumer_total: 1,
        }
    }
}

impl WorkerConfig {
    /// Creates a configuration consuming `operator_name`.
    pub fn new(engine: EngineConfig, operator_name: impl Into<String>) -> Self {
        Self {
            engine,
            operator_name: operator_name.into(),
            ..Self::default()
        }
    }

    /// Checks the configuration, reporting every problem at once.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] listing each violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut violations = self.engine.violations();

        if self.operator_name.trim().is_empty() {
            violations.push(Violation::new("operator_name", "must not be empty"));
        }
        if self.response_name.as_ref().is_some_and(|n| n.trim().is_empty()) {
            violations.push(Violation::new("response_name", "must not be empty"));
        }
        if self.consumer_total == 0 {
            violations.push(Violation::new("consumer_total", "must be at least 1"));
        }
        if self.response_name.as_ref() == Some(&self.operator_name) {
            violations.push(Violation::new(
                "response_name",
                "must differ from operator_name",
            ));
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { violations })
        }
    }

    /// Broker identifiers this worker uses, for [`courier_engine::Topology`] checks.
    #[must_use]
    pub fn declaration(&self, name: impl Into<String>) -> HandlerDeclaration {
        HandlerDeclaration {
            name: name.into(),
            exchange_name: self.engine.exchange_name.clone(),
            routing_key: self.engine.routing_key.clone(),
            queue_name: Some(self.operator_name.clone()),
            recyclebin_name: None,
        }
    }
}

/// Master configuration.
///
/// The engine section's routing key is the key requests are published with.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Engine settings shared with workers.
    pub engine: EngineConfig,

    /// Response queue, also used as its binding key. Generated when absent.
    pub response_name: Option<String>,

    /// How long a job may wait for its terminal event.
    pub monitor_timeout: Duration,

    /// How often pending jobs are checked against their deadline.
    pub monitor_interval: Duration,

    /// Ask workers for progress events.
    pub progress_enabled: bool,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            response_name: None,
            monitor_timeout: Duration::from_secs(2),
            monitor_interval: Duration::from_millis(100),
            progress_enabled: true,
        }
    }
}

impl MasterConfig {
    /// Creates a configuration with default timing.
    #[must_use]
    pub fn new(engine: EngineConfig) -> Self {
        Self {
            engine,
            ..Self::default()
        }
    }

    /// Checks the configuration, reporting every problem at once.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] listing each violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut violations = self.engine.violations();

        if self.response_name.as_ref().is_some_and(|n| n.trim().is_empty()) {
            violations.push(Violation::new("response_name", "must not be empty"));
        }
        if self.monitor_timeout.is_zero() {
            violations.push(Violation::new("monitor_timeout", "must be positive"));
        }
        if self.monitor_interval.is_zero() {
            violations.push(Violation::new("monitor_interval", "must be positive"));
        }

        if violations.is_empty() {
            Ok(())
        } else {
            Err(ConfigError { violations })
        }
    }

    /// Broker identifiers this master uses, for [`courier_engine::Topology`]
    /// checks. `None` when the response queue is generated.
    #[must_use]
    pub fn declaration(&self, name: impl Into<String>) -> Option<HandlerDeclaration> {
        self.response_name
            .as_ref()
            .map(|response_name| HandlerDeclaration {
                name: name.into(),
                exchange_name: self.engine.exchange_name.clone(),
                routing_key: response_name.clone(),
                queue_name: Some(response_name.clone()),
                recyclebin_name: None,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use courier_engine::Topology;

    fn engine() -> EngineConfig {
        EngineConfig::new("rpc", "fibonacci")
    }

    #[test]
    fn test_worker_config_reports_every_violation() {
        let config = WorkerConfig {
            consumer_total: 0,
            ..WorkerConfig::new(EngineConfig::default(), "")
        };

        let err = config.validate().unwrap_err();
        assert!(err.concerns("exchange_name"));
        assert!(err.concerns("operator_name"));
        assert!(err.concerns("consumer_total"));
    }

    #[test]
    fn test_master_config_defaults() {
        let config: MasterConfig = serde_json::from_value(serde_json::json!({
            "engine": { "exchange_name": "rpc", "routing_key": "fibonacci" }
        }))
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.monitor_timeout, Duration::from_secs(2));
        assert!(config.progress_enabled);
        assert!(config.declaration("master").is_none());
    }

    #[test]
    fn test_workers_sharing_a_route_collide() {
        let first = WorkerConfig::new(engine(), "fibonacci.operator");
        let second = WorkerConfig::new(engine(), "fibonacci.operator");
        let master = MasterConfig {
            response_name: Some("fibonacci.response".to_string()),
            ..MasterConfig::new(engine())
        };

        let mut topology = Topology::new();
        topology.declare(first.declaration("worker-1"));
        topology.declare(second.declaration("worker-2"));
        topology.declare(master.declaration("master").unwrap());

        let err = topology.validate().unwrap_err();
        assert_eq!(err.violations.len(), 2);
        assert!(err.concerns("rpc/fibonacci"));
        assert!(err.concerns("fibonacci.operator"));
    }
}
