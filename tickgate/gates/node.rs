//! Minimal node contract between gates and the tree executor.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared_event_bus::TelemetryValue;
use thiserror::Error;

/// Status reported to the executor on every tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Still waiting on data.
    Running,
    /// Condition holds.
    Success,
    /// Condition does not hold, or the node is misconfigured.
    Failure,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "RUNNING"),
            Self::Success => write!(f, "SUCCESS"),
            Self::Failure => write!(f, "FAILURE"),
        }
    }
}

/// Errors reading input ports.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PortError {
    /// The node does not declare this port.
    #[error("port {0} is not declared")]
    Undeclared(String),
    /// No value and no default.
    #[error("{0} not provided")]
    Missing(String),
    /// The value is not usable.
    #[error("port {name} has invalid value {raw}")]
    Invalid {
        /// Port name.
        name: String,
        /// Offending value as text.
        raw: String,
    },
}

/// Declared input port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortSpec {
    /// Port name.
    pub name: String,
    /// Value used when the executor supplies none.
    pub default: Option<Value>,
    /// Human readable description.
    pub description: String,
}

impl PortSpec {
    /// Declares an input port without default.
    #[must_use]
    pub fn input(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default: None,
            description: description.into(),
        }
    }

    /// Sets the default value.
    #[must_use]
    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }
}

/// Ports declared by a node.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortsList(Vec<PortSpec>);

impl PortsList {
    /// Creates a list from specs.
    #[must_use]
    pub fn new(ports: Vec<PortSpec>) -> Self {
        Self(ports)
    }

    /// Finds a port by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&PortSpec> {
        self.0.iter().find(|port| port.name == name)
    }

    /// Iterates over declared ports.
    pub fn iter(&self) -> impl Iterator<Item = &PortSpec> {
        self.0.iter()
    }

    /// Number of ports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no port is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Input values supplied by the executor, read fresh on every tick.
///
/// An entry set to `null` counts as explicitly missing and does not fall back
/// to the port default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PortInputs {
    values: IndexMap<String, Value>,
}

impl PortInputs {
    /// Creates empty inputs; every port uses its default.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(name, value);
        self
    }

    /// Sets a port value.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.values.insert(name.into(), value.into());
    }

    /// Marks a port as explicitly missing.
    pub fn clear(&mut self, name: impl Into<String>) {
        self.values.insert(name.into(), Value::Null);
    }

    /// Removes a port value so the default applies again.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.values.shift_remove(name)
    }

    /// Raw value as supplied.
    #[must_use]
    pub fn raw(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Resolves a numeric port against the declared ports.
    ///
    /// Numbers and numeric strings are accepted; non-finite values are not.
    pub fn number(&self, ports: &PortsList, name: &str) -> Result<TelemetryValue, PortError> {
        let port = ports
            .get(name)
            .ok_or_else(|| PortError::Undeclared(name.to_string()))?;
        let value = match self.values.get(name) {
            Some(Value::Null) => return Err(PortError::Missing(name.to_string())),
            Some(value) => value,
            None => port
                .default
                .as_ref()
                .ok_or_else(|| PortError::Missing(name.to_string()))?,
        };
        let invalid = || PortError::Invalid {
            name: name.to_string(),
            raw: value.to_string(),
        };
        let parsed = match value {
            Value::Number(number) => number
                .as_i64()
                .map(TelemetryValue::Int)
                .or_else(|| number.as_f64().map(TelemetryValue::Float))
                .ok_or_else(invalid)?,
            Value::String(text) => text.parse::<TelemetryValue>().map_err(|_| invalid())?,
            _ => return Err(invalid()),
        };
        if parsed.is_finite() {
            Ok(parsed)
        } else {
            Err(invalid())
        }
    }
}

/// Capability implemented by every condition node.
pub trait ConditionNode: Send + Sync {
    /// Instance name used in logs.
    fn name(&self) -> &str;

    /// Declared input ports.
    fn provided_ports(&self) -> PortsList;

    /// Evaluates the condition. Must not block.
    fn tick(&self, inputs: &PortInputs) -> NodeStatus;
}
