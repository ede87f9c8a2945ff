#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Condition gates for a behavior-tree executor.
//!
//! A gate listens to one telemetry channel in the background and answers the
//! executor's synchronous `tick` from the latest cached value.

/// Node contract shared with the decision engine.
#[path = "../node.rs"]
pub mod node;

/// Latest-value cache written by listeners and read by ticks.
#[path = "../cache.rs"]
pub mod cache;

/// Threshold gate and its background listener.
#[path = "../threshold.rs"]
pub mod threshold;

/// TOML configuration for gate instances.
#[path = "../gate_config.rs"]
pub mod gate_config;

/// Telemetry helpers.
#[path = "../telemetry.rs"]
pub mod telemetry;

pub use cache::{GateState, LatestValueCell};
pub use gate_config::{GateDocument, GateEntry};
pub use node::{ConditionNode, NodeStatus, PortError, PortInputs, PortSpec, PortsList};
pub use telemetry::{GateTelemetry, GateTelemetryBuilder};
pub use threshold::{
    ComparisonPolicy, GateError, GateSpec, ThresholdConfig, ThresholdGate, ThresholdGateBuilder,
    Verdict, VerdictCause,
};
