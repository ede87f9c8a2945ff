//! Periodic telemetry publisher.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::json;
use shared_event_bus::{SamplePublisher, TelemetrySample, TelemetryValue};
use shared_logging::LogLevel;
use tokio::{
    sync::oneshot,
    task::JoinHandle,
    time::{interval, MissedTickBehavior},
};

use crate::{
    store::{ParameterStore, SourceError},
    telemetry::SourceTelemetry,
};

/// Default emission period.
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(1);

/// Acknowledgment returned to the configuration source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconfigureAck {
    /// Whether the new value was applied.
    pub successful: bool,
    /// Human readable outcome.
    pub reason: String,
}

/// Field left out of a cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkippedField {
    /// Field name.
    pub field: String,
    /// Why the sample was not published.
    pub reason: String,
}

/// Outcome of a single emission cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmitReport {
    /// Monotonic cycle number, starting at 1.
    pub cycle: u64,
    /// Samples accepted by the transport.
    pub published: Vec<TelemetrySample>,
    /// Fields skipped this cycle.
    pub skipped: Vec<SkippedField>,
    /// Cycle start.
    pub started_at: DateTime<Utc>,
}

impl EmitReport {
    /// Published value for a field, if any.
    #[must_use]
    pub fn value_of(&self, field: &str) -> Option<TelemetryValue> {
        self.published
            .iter()
            .find(|sample| sample.field == field)
            .map(|sample| sample.value)
    }
}

#[derive(Debug, Clone)]
struct FieldBinding {
    field: String,
    channel: String,
}

/// Builder for [`TelemetryPublisher`].
pub struct TelemetryPublisherBuilder {
    store: Arc<ParameterStore>,
    transport: Arc<dyn SamplePublisher>,
    channel_prefix: String,
    channel_overrides: IndexMap<String, String>,
    telemetry: Option<SourceTelemetry>,
}

impl TelemetryPublisherBuilder {
    /// Prefix prepended to field names to form channel names.
    #[must_use]
    pub fn channel_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.channel_prefix = prefix.into();
        self
    }

    /// Routes a field to an explicit channel.
    #[must_use]
    pub fn channel_override(mut self, field: impl Into<String>, channel: impl Into<String>) -> Self {
        self.channel_overrides.insert(field.into(), channel.into());
        self
    }

    /// Attaches telemetry.
    #[must_use]
    pub fn telemetry(mut self, telemetry: SourceTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Builds the publisher. Fields are registered later through
    /// [`TelemetryPublisher::configure`].
    #[must_use]
    pub fn build(self) -> TelemetryPublisher {
        TelemetryPublisher {
            store: self.store,
            transport: self.transport,
            channel_prefix: self.channel_prefix,
            channel_overrides: self.channel_overrides,
            bindings: OnceCell::new(),
            cycles: AtomicU64::new(0),
            telemetry: self
                .telemetry
                .unwrap_or_else(|| SourceTelemetry::tracing_only("telemetry_source")),
        }
    }
}

/// Converts the store's fields into periodic samples.
pub struct TelemetryPublisher {
    store: Arc<ParameterStore>,
    transport: Arc<dyn SamplePublisher>,
    channel_prefix: String,
    channel_overrides: IndexMap<String, String>,
    bindings: OnceCell<Vec<FieldBinding>>,
    cycles: AtomicU64,
    telemetry: SourceTelemetry,
}

impl fmt::Debug for TelemetryPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TelemetryPublisher")
            .field("channel_prefix", &self.channel_prefix)
            .field("bindings", &self.bindings.get())
            .field("cycles", &self.cycles.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TelemetryPublisher {
    /// Returns a builder publishing `store` fields to `transport`.
    #[must_use]
    pub fn builder(
        store: Arc<ParameterStore>,
        transport: Arc<dyn SamplePublisher>,
    ) -> TelemetryPublisherBuilder {
        TelemetryPublisherBuilder {
            store,
            transport,
            channel_prefix: "/".into(),
            channel_overrides: IndexMap::new(),
            telemetry: None,
        }
    }

    /// Backing store.
    #[must_use]
    pub fn store(&self) -> &Arc<ParameterStore> {
        &self.store
    }

    /// Channel a field is published on, once configured.
    #[must_use]
    pub fn channel_for(&self, field: &str) -> Option<&str> {
        self.bindings
            .get()?
            .iter()
            .find(|binding| binding.field == field)
            .map(|binding| binding.channel.as_str())
    }

    /// Registers the fields and their defaults. Must run once, before emission.
    pub fn configure(
        &self,
        field_defaults: &IndexMap<String, TelemetryValue>,
    ) -> Result<(), SourceError> {
        let result = self.try_configure(field_defaults);
        match &result {
            Ok(()) => {
                let _ = self.telemetry.log(
                    LogLevel::Info,
                    "source.configured",
                    json!({ "fields": field_defaults.keys().collect::<Vec<_>>() }),
                );
            }
            Err(err) => {
                let _ = self.telemetry.log(
                    LogLevel::Error,
                    "source.configure.rejected",
                    json!({ "error": err.to_string() }),
                );
            }
        }
        result
    }

    fn try_configure(
        &self,
        field_defaults: &IndexMap<String, TelemetryValue>,
    ) -> Result<(), SourceError> {
        if self.bindings.get().is_some() {
            return Err(SourceError::AlreadyConfigured);
        }
        if field_defaults.is_empty() {
            return Err(SourceError::NoFields);
        }
        self.store.declare_all(field_defaults)?;
        let mut bindings = Vec::with_capacity(field_defaults.len());
        for field in field_defaults.keys() {
            let channel = self
                .channel_overrides
                .get(field)
                .cloned()
                .unwrap_or_else(|| format!("{}{field}", self.channel_prefix));
            bindings.push(FieldBinding {
                field: field.clone(),
                channel,
            });
        }
        self.bindings
            .set(bindings)
            .map_err(|_| SourceError::AlreadyConfigured)
    }

    /// Applies an external parameter change.
    ///
    /// Unknown fields and invalid values are rejected and logged at error
    /// severity; the acknowledgment says which.
    pub fn on_reconfigure(&self, name: &str, value: impl Into<TelemetryValue>) -> ReconfigureAck {
        let value = value.into();
        match self.store.set(name, value) {
            Ok(previous) => {
                let _ = self.telemetry.log(
                    LogLevel::Info,
                    "source.param.changed",
                    json!({
                        "field": name,
                        "previous": previous,
                        "value": self.store.get(name),
                    }),
                );
                ReconfigureAck {
                    successful: true,
                    reason: format!("{name} set to {value}"),
                }
            }
            Err(err) => {
                let _ = self.telemetry.log(
                    LogLevel::Error,
                    "source.param.rejected",
                    json!({ "field": name, "value": value, "error": err.to_string() }),
                );
                ReconfigureAck {
                    successful: false,
                    reason: err.to_string(),
                }
            }
        }
    }

    /// Reads every field once and publishes one sample per field.
    ///
    /// Transport failures skip the affected field for this cycle only. A
    /// sample that reached the primary target but not a mirror still counts
    /// as published.
    pub async fn emit_cycle(&self) -> Result<EmitReport, SourceError> {
        let bindings = self.bindings.get().ok_or(SourceError::NotConfigured)?;
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let mut report = EmitReport {
            cycle,
            published: Vec::with_capacity(bindings.len()),
            skipped: Vec::new(),
            started_at: Utc::now(),
        };
        for binding in bindings {
            let Some(value) = self.store.get(&binding.field) else {
                report.skipped.push(SkippedField {
                    field: binding.field.clone(),
                    reason: SourceError::UnknownField(binding.field.clone()).to_string(),
                });
                continue;
            };
            let sample = TelemetrySample::new(&binding.channel, &binding.field, value);
            match self.transport.publish(sample.clone()).await {
                Ok(()) => report.published.push(sample),
                Err(err) if err.delivered() => {
                    let _ = self.telemetry.log(
                        LogLevel::Warn,
                        "source.emit.mirror_failed",
                        json!({
                            "cycle": cycle,
                            "field": binding.field,
                            "channel": binding.channel,
                            "error": err.to_string(),
                        }),
                    );
                    report.published.push(sample);
                }
                Err(err) => {
                    let _ = self.telemetry.log(
                        LogLevel::Warn,
                        "source.emit.skipped",
                        json!({
                            "cycle": cycle,
                            "field": binding.field,
                            "channel": binding.channel,
                            "error": err.to_string(),
                        }),
                    );
                    report.skipped.push(SkippedField {
                        field: binding.field.clone(),
                        reason: err.to_string(),
                    });
                }
            }
        }
        let _ = self.telemetry.log(
            LogLevel::Debug,
            "source.emit.cycle",
            json!({
                "cycle": cycle,
                "published": report.published.len(),
                "skipped": report.skipped.len(),
            }),
        );
        Ok(report)
    }

    /// Number of cycles started so far.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Runs [`Self::emit_cycle`] every `period` on a background task.
    ///
    /// The first cycle fires immediately. Must be called from within a tokio
    /// runtime.
    pub fn spawn(self: &Arc<Self>, period: Duration) -> Result<PublisherHandle, SourceError> {
        if self.bindings.get().is_none() {
            return Err(SourceError::NotConfigured);
        }
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let publisher = Arc::clone(self);
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        if let Err(err) = publisher.emit_cycle().await {
                            let _ = publisher.telemetry.log(
                                LogLevel::Error,
                                "source.emit.failed",
                                json!({ "error": err.to_string() }),
                            );
                        }
                    }
                }
            }
            let _ = publisher.telemetry.log(
                LogLevel::Info,
                "source.emitter.stopped",
                json!({ "cycles": publisher.cycles() }),
            );
        });
        let _ = self.telemetry.log(
            LogLevel::Info,
            "source.emitter.started",
            json!({ "period_ms": u64::try_from(period.as_millis()).unwrap_or(u64::MAX) }),
        );
        Ok(PublisherHandle {
            stop: Some(stop_tx),
            task: Some(task),
        })
    }
}

/// Handle to a running emission loop.
///
/// [`Self::shutdown`] stops the timer and waits for the in-flight cycle to
/// finish. Dropping the handle aborts the task instead.
#[derive(Debug)]
pub struct PublisherHandle {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl PublisherHandle {
    /// Signals the loop to stop and waits for it.
    pub async fn shutdown(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Whether the loop is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for PublisherHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
