use serde::{Deserialize, Serialize};

/// How an exchange matches routing keys to bindings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Exact routing-key match.
    #[default]
    Direct,

    /// Every bound queue receives every message.
    Fanout,
}

/// Exchange declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeDeclaration {
    /// Exchange name.
    pub name: String,

    /// Routing behaviour.
    pub kind: ExchangeKind,

    /// Survive broker restarts.
    pub durable: bool,
}

/// Queue declaration.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueDeclaration {
    /// Queue name; empty asks the broker to generate one.
    pub name: String,

    /// Survive broker restarts.
    pub durable: bool,

    /// Owned by the declaring channel and removed when it closes.
    pub exclusive: bool,

    /// Removed once its last consumer is cancelled.
    pub auto_delete: bool,

    /// Queue that receives deliveries rejected without requeue.
    pub dead_letter_queue: Option<String>,
}
