#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Telemetry source: a parameter store of resource-state fields and the
//! publisher that emits them on a fixed period.

/// Parameter store holding the live field values.
#[path = "../store.rs"]
pub mod store;

/// Periodic publisher and its background handle.
#[path = "../publisher.rs"]
pub mod publisher;

/// TOML configuration for the source.
#[path = "../source_config.rs"]
pub mod source_config;

/// Telemetry helpers.
#[path = "../telemetry.rs"]
pub mod telemetry;

pub use publisher::{
    EmitReport, PublisherHandle, ReconfigureAck, SkippedField, TelemetryPublisher,
    TelemetryPublisherBuilder,
};
pub use source_config::SourceDocument;
pub use store::{ParameterStore, SourceError};
pub use telemetry::{SourceTelemetry, SourceTelemetryBuilder};
