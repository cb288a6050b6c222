//! Engine configuration and construction-time validation.
//!
//! Every `validate` call collects all violations it finds and reports them
//! together in one [`ConfigError`].

use std::fmt::{self, Display, Formatter};

use courier_transport::{ExchangeDeclaration, ExchangeKind, QueueDeclaration};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Default chunk size for oversized buffer payloads.
pub const DEFAULT_SEGMENT_SIZE: usize = 64 * 1024;

/// One problem found while validating configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Violation {
    /// Offending field or identifier.
    pub field: String,

    /// What is wrong with it.
    pub message: String,
}

impl Violation {
    /// Creates a violation.
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl Display for Violation {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Every violation found by a validation pass.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("invalid configuration: {}", .violations.iter().map(ToString::to_string).collect::<Vec<_>>().join("; "))]
pub struct ConfigError {
    /// The violations, in discovery order.
    pub violations: Vec<Violation>,
}

impl ConfigError {
    /// Whether any violation concerns `field`.
    #[must_use]
    pub fn concerns(&self, field: &str) -> bool {
        self.violations.iter().any(|v| v.field == field)
    }

    fn check(violations: Vec<Violation>) -> Result<(), Self> {
        if violations.is_empty() {
            Ok(())
        } else {
            Err(Self { violations })
        }
    }
}

/// Engine configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Identifier used in logs and observer events.
    pub engine_id: String,

    /// Broker address.
    pub uri: String,

    /// Stamped on outgoing messages as `appId`.
    pub application_id: Option<String>,

    /// Exchange every message is published to.
    pub exchange_name: String,

    /// Exchange routing behaviour.
    pub exchange_type: ExchangeKind,

    /// Declare the exchange durable.
    pub exchange_durable: bool,

    /// Default routing key for produce calls and queue bindings.
    pub routing_key: String,

    /// Maximum number of unconfirmed publishes in flight.
    pub exchange_quota: Option<usize>,

    /// Open the producer channel in confirm mode.
    pub confirmation: bool,

    /// Buffers larger than this are sent as a segmented stream.
    pub segment_size: usize,

    /// Queue used by `consume` when no explicit spec is given.
    pub queue: Option<QueueSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_id: Uuid::new_v4().to_string(),
            uri: "amqp://localhost".to_string(),
            application_id: None,
            exchange_name: String::new(),
            exchange_type: ExchangeKind::Direct,
            exchange_durable: false,
            routing_key: String::new(),
            exchange_quota: None,
            confirmation: false,
            segment_size: DEFAULT_SEGMENT_SIZE,
            queue: None,
        }
    }
}

impl EngineConfig {
    /// Creates a configuration for an exchange and default routing key.
    pub fn new(exchange_name: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange_name: exchange_name.into(),
            routing_key: routing_key.into(),
            ..Self::default()
        }
    }

    /// Checks the configuration, reporting every problem at once.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] listing each violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        ConfigError::check(self.violations())
    }

    /// Collects violations without failing.
    #[must_use]
    pub fn violations(&self) -> Vec<Violation> {
        let mut violations = Vec::new();

        if self.uri.trim().is_empty() {
            violations.push(Violation::new("uri", "must not be empty"));
        }
        if self.exchange_name.trim().is_empty() {
            violations.push(Violation::new("exchange_name", "must not be empty"));
        }
        if self.routing_key.trim().is_empty() {
            violations.push(Violation::new("routing_key", "must not be empty"));
        }
        if self.exchange_quota == Some(0) {
            violations.push(Violation::new("exchange_quota", "must be at least 1"));
        }
        if self.segment_size == 0 {
            violations.push(Violation::new("segment_size", "must be at least 1"));
        }
        if let Some(queue) = &self.queue {
            violations.extend(queue.violations());
        }

        violations
    }

    pub(crate) fn exchange_declaration(&self) -> ExchangeDeclaration {
        ExchangeDeclaration {
            name: self.exchange_name.clone(),
            kind: self.exchange_type,
            durable: self.exchange_durable,
        }
    }
}

/// How a consumer's queue is declared and consumed.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSpec {
    /// Queue name. Empty asks the broker to generate one.
    pub queue_name: String,

    /// Survive broker restarts.
    pub durable: bool,

    /// Owned by the subscribing channel.
    pub exclusive: bool,

    /// Removed once its last consumer goes away.
    pub auto_delete: bool,

    /// Deliveries are settled by the broker on send.
    pub no_ack: bool,

    /// Bind the queue to the engine exchange.
    pub binding: bool,

    /// Routing key for the binding; the engine routing key when absent.
    pub binding_key: Option<String>,

    /// Reassemble segmented payloads into one stream per message.
    pub payload_enabled: bool,

    /// Queue receiving deliveries rejected without requeue.
    pub recyclebin_name: Option<String>,

    /// Maximum unacknowledged deliveries per consumer (0 = unlimited).
    pub prefetch: u16,
}

impl Default for QueueSpec {
    fn default() -> Self {
        Self {
            queue_name: String::new(),
            durable: false,
            exclusive: false,
            auto_delete: false,
            no_ack: false,
            binding: true,
            binding_key: None,
            payload_enabled: false,
            recyclebin_name: None,
            prefetch: 0,
        }
    }
}

impl QueueSpec {
    /// A spec for a named queue with default options.
    pub fn named(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            ..Self::default()
        }
    }

    /// Collects violations without failing.
    #[must_use]
    pub fn violations(&self) -> Vec<Violation> {
        let mut violations = Vec::new();

        if let Some(recyclebin) = &self.recyclebin_name {
            if recyclebin.trim().is_empty() {
                violations.push(Violation::new("recyclebin_name", "must not be empty"));
            } else if *recyclebin == self.queue_name {
                violations.push(Violation::new(
                    "recyclebin_name",
                    format!("'{recyclebin}' is also the queue name"),
                ));
            }
        }
        if self.binding_key.as_ref().is_some_and(|k| k.trim().is_empty()) {
            violations.push(Violation::new("binding_key", "must not be empty"));
        }

        violations
    }

    pub(crate) fn queue_declaration(&self) -> QueueDeclaration {
        QueueDeclaration {
            name: self.queue_name.clone(),
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
            dead_letter_queue: self.recyclebin_name.clone(),
        }
    }

    pub(crate) fn recyclebin_declaration(&self) -> Option<QueueDeclaration> {
        self.recyclebin_name.as_ref().map(|name| QueueDeclaration {
            name: name.clone(),
            durable: self.durable,
            ..QueueDeclaration::default()
        })
    }
}

/// The broker identifiers one handler will use.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HandlerDeclaration {
    /// Handler name used in violation reports.
    pub name: String,

    /// Exchange the handler publishes or binds to.
    pub exchange_name: String,

    /// Routing key the handler binds with.
    pub routing_key: String,

    /// Queue the handler consumes, if any.
    pub queue_name: Option<String>,

    /// Recyclebin the handler dead-letters into, if any.
    pub recyclebin_name: Option<String>,
}

/// Cross-handler identity checks for handlers sharing one process.
///
/// Two handlers may not bind the same exchange and routing key, may not
/// consume the same queue, and no recyclebin may be another handler's queue.
#[derive(Clone, Debug, Default)]
pub struct Topology {
    handlers: Vec<HandlerDeclaration>,
}

impl Topology {
    /// Creates an empty topology.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler declaration.
    #[must_use]
    pub fn with(mut self, handler: HandlerDeclaration) -> Self {
        self.handlers.push(handler);
        self
    }

    /// Adds a handler declaration in place.
    pub fn declare(&mut self, handler: HandlerDeclaration) {
        self.handlers.push(handler);
    }

    /// Runs every check.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] listing each collision.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut routes: IndexMap<(&str, &str), Vec<&str>> = IndexMap::new();
        let mut queues: IndexMap<&str, Vec<&str>> = IndexMap::new();

        for handler in &self.handlers {
            routes
                .entry((handler.exchange_name.as_str(), handler.routing_key.as_str()))
                .or_default()
                .push(handler.name.as_str());
            if let Some(queue) = &handler.queue_name {
                queues
                    .entry(queue.as_str())
                    .or_default()
                    .push(handler.name.as_str());
            }
        }

        let mut violations = Vec::new();

        for ((exchange, routing_key), owners) in &routes {
            if owners.len() > 1 {
                violations.push(Violation::new(
                    format!("{exchange}/{routing_key}"),
                    format!("exchange and routing key shared by {}", owners.join(", ")),
                ));
            }
        }

        for (queue, owners) in &queues {
            if owners.len() > 1 {
                violations.push(Violation::new(
                    *queue,
                    format!("queue shared by {}", owners.join(", ")),
                ));
            }
        }

        for handler in &self.handlers {
            if let Some(recyclebin) = &handler.recyclebin_name {
                if let Some(owners) = queues.get(recyclebin.as_str()) {
                    violations.push(Violation::new(
                        recyclebin.as_str(),
                        format!(
                            "recyclebin of {} is the queue of {}",
                            handler.name,
                            owners.join(", ")
                        ),
                    ));
                }
            }
        }

        ConfigError::check(violations)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler(name: &str, routing_key: &str, queue: &str) -> HandlerDeclaration {
        HandlerDeclaration {
            name: name.to_string(),
            exchange_name: "tasks".to_string(),
            routing_key: routing_key.to_string(),
            queue_name: Some(queue.to_string()),
            recyclebin_name: None,
        }
    }

    #[test]
    fn test_engine_config_reports_every_violation() {
        let config = EngineConfig {
            uri: String::new(),
            exchange_quota: Some(0),
            ..EngineConfig::default()
        };

        let err = config.validate().unwrap_err();
        assert_eq!(err.violations.len(), 4);
        assert!(err.concerns("uri"));
        assert!(err.concerns("exchange_name"));
        assert!(err.concerns("routing_key"));
        assert!(err.concerns("exchange_quota"));
        assert!(err.to_string().starts_with("invalid configuration: uri:"));
    }

    #[test]
    fn test_engine_config_deserializes_with_defaults() {
        let config: EngineConfig = serde_json::from_value(serde_json::json!({
            "exchange_name": "tasks",
            "routing_key": "fibonacci",
            "confirmation": true,
            "queue": { "queue_name": "fibonacci.requests", "payload_enabled": true }
        }))
        .unwrap();

        assert!(config.validate().is_ok());
        assert_eq!(config.segment_size, DEFAULT_SEGMENT_SIZE);
        let queue = config.queue.unwrap();
        assert!(queue.binding);
        assert!(queue.payload_enabled);
        assert_eq!(queue.prefetch, 0);
    }

    #[test]
    fn test_recyclebin_must_differ_from_queue() {
        let spec = QueueSpec {
            recyclebin_name: Some("orders".to_string()),
            ..QueueSpec::named("orders")
        };
        assert_eq!(spec.violations().len(), 1);
    }

    #[test]
    fn test_topology_accepts_distinct_handlers() {
        let topology = Topology::new()
            .with(handler("worker", "fibonacci", "fibonacci.requests"))
            .with(handler("master", "fibonacci.responses", "fibonacci.responses"));
        assert!(topology.validate().is_ok());
    }

    #[test]
    fn test_topology_reports_all_collisions() {
        let mut recycler = handler("recycler", "cleanup", "cleanup");
        recycler.recyclebin_name = Some("fibonacci.requests".to_string());

        let topology = Topology::new()
            .with(handler("worker-1", "fibonacci", "fibonacci.requests"))
            .with(handler("worker-2", "fibonacci", "fibonacci.requests"))
            .with(recycler);

        let err = topology.validate().unwrap_err();
        assert_eq!(err.violations.len(), 3);
        assert!(err.concerns("tasks/fibonacci"));
        assert_eq!(
            err.violations
                .iter()
                .filter(|v| v.field == "fibonacci.requests")
                .count(),
            2
        );
    }
}
