//! Threshold gate: one background listener, one cache, synchronous ticks.

use std::{cmp::Ordering, fmt, sync::Arc};

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_event_bus::{SampleSubscriber, TelemetrySample, TelemetryValue, TransportError};
use shared_logging::LogLevel;
use thiserror::Error;
use tokio::{
    sync::{broadcast, oneshot},
    task::JoinHandle,
};

use crate::{
    cache::{GateState, LatestValueCell},
    node::{ConditionNode, NodeStatus, PortError, PortInputs, PortSpec, PortsList},
    telemetry::GateTelemetry,
};

/// Name of the threshold input port.
pub const THRESHOLD_PORT: &str = "threshold";

/// Threshold used when the executor supplies none.
pub const DEFAULT_THRESHOLD: i64 = 30;

/// Errors raised while constructing a gate.
#[derive(Debug, Error)]
pub enum GateError {
    /// Subscribing to the channel failed.
    #[error("failed to subscribe to {channel}: {source}")]
    Transport {
        /// Channel requested.
        channel: String,
        /// Transport failure.
        #[source]
        source: TransportError,
    },
    /// The gate specification is unusable.
    #[error("invalid gate spec: {0}")]
    InvalidSpec(String),
}

/// Which side of the threshold fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonPolicy {
    /// `value < threshold` fails.
    BelowFails,
    /// `value >= threshold` fails.
    AtOrAboveFails,
}

impl ComparisonPolicy {
    /// Whether `value` fails against `threshold`; `None` if incomparable.
    #[must_use]
    pub fn fails(self, value: &TelemetryValue, threshold: &TelemetryValue) -> Option<bool> {
        let ordering = value.compare(threshold)?;
        Some(match self {
            Self::BelowFails => ordering == Ordering::Less,
            Self::AtOrAboveFails => ordering != Ordering::Less,
        })
    }

    /// Message key logged when the condition fails.
    #[must_use]
    pub const fn failure_message(self) -> &'static str {
        match self {
            Self::BelowFails => "gates.tick.below_threshold",
            Self::AtOrAboveFails => "gates.tick.at_or_above_threshold",
        }
    }
}

impl fmt::Display for ComparisonPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BelowFails => write!(f, "below_fails"),
            Self::AtOrAboveFails => write!(f, "at_or_above_fails"),
        }
    }
}

/// Threshold and policy applied by one tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    /// Threshold value.
    pub threshold: TelemetryValue,
    /// Comparison direction.
    pub comparison: ComparisonPolicy,
}

/// Why a tick produced its status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum VerdictCause {
    /// No sample has arrived yet.
    AwaitingData,
    /// The cached value passes the comparison.
    ConditionMet {
        /// Cached value.
        value: TelemetryValue,
        /// Threshold applied.
        threshold: TelemetryValue,
    },
    /// The cached value fails the comparison.
    ConditionFailed {
        /// Cached value.
        value: TelemetryValue,
        /// Threshold applied.
        threshold: TelemetryValue,
    },
    /// Inputs were missing or malformed.
    ConfigurationError {
        /// Description of the problem.
        reason: String,
    },
}

/// Tick result with its cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    /// Status handed to the executor.
    pub status: NodeStatus,
    /// Cause of the status.
    pub cause: VerdictCause,
}

impl Verdict {
    /// Whether the failure stems from configuration rather than data.
    #[must_use]
    pub const fn is_configuration_error(&self) -> bool {
        matches!(self.cause, VerdictCause::ConfigurationError { .. })
    }
}

/// Static description of a gate instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateSpec {
    /// Instance name.
    pub name: String,
    /// Channel the listener subscribes to.
    pub channel: String,
    /// Comparison direction, fixed for the gate's lifetime.
    pub policy: ComparisonPolicy,
    /// Default for the threshold port.
    pub default_threshold: TelemetryValue,
}

impl GateSpec {
    /// Creates a spec with the default threshold.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        channel: impl Into<String>,
        policy: ComparisonPolicy,
    ) -> Self {
        Self {
            name: name.into(),
            channel: channel.into(),
            policy,
            default_threshold: TelemetryValue::Int(DEFAULT_THRESHOLD),
        }
    }

    /// Overrides the threshold port default.
    #[must_use]
    pub fn with_default_threshold(mut self, threshold: impl Into<TelemetryValue>) -> Self {
        self.default_threshold = threshold.into();
        self
    }

    fn validate(&self) -> Result<(), GateError> {
        if self.name.trim().is_empty() {
            return Err(GateError::InvalidSpec("gate name is empty".into()));
        }
        if self.channel.trim().is_empty() {
            return Err(GateError::InvalidSpec(format!(
                "gate {} has no channel",
                self.name
            )));
        }
        if !self.default_threshold.is_finite() {
            return Err(GateError::InvalidSpec(format!(
                "gate {} has a non-finite default threshold",
                self.name
            )));
        }
        Ok(())
    }

    fn ports(&self) -> PortsList {
        let default = match self.default_threshold {
            TelemetryValue::Int(v) => json!(v),
            TelemetryValue::Float(v) => json!(v),
        };
        PortsList::new(vec![PortSpec::input(
            THRESHOLD_PORT,
            "Minimum ammunition threshold",
        )
        .with_default(default)])
    }
}

/// Kind of the last data-driven tick, used to spot transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickOutcome {
    Waiting,
    Passed,
    Failed,
}

/// State shared between the gate and its listener task.
#[derive(Debug)]
struct GateCore {
    spec: GateSpec,
    cache: LatestValueCell,
    telemetry: GateTelemetry,
    last_outcome: Mutex<Option<TickOutcome>>,
}

impl GateCore {
    fn accept(&self, sample: &TelemetrySample) -> bool {
        if sample.channel != self.spec.channel {
            let _ = self.telemetry.log(
                LogLevel::Debug,
                "gates.sample.ignored",
                json!({ "channel": sample.channel }),
            );
            return false;
        }
        if !sample.value.is_finite() {
            let _ = self.telemetry.log(
                LogLevel::Warn,
                "gates.sample.rejected",
                json!({ "channel": sample.channel, "reason": "non-finite value" }),
            );
            return false;
        }
        let updates = self.cache.store(sample.value, Utc::now());
        let _ = self.telemetry.log(
            LogLevel::Info,
            "gates.sample.received",
            json!({
                "channel": sample.channel,
                "value": sample.value,
                "updates": updates,
            }),
        );
        true
    }
}

struct Listener {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

async fn listen(
    core: Arc<GateCore>,
    mut receiver: broadcast::Receiver<TelemetrySample>,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => break,
            received = receiver.recv() => match received {
                Ok(sample) => {
                    core.accept(&sample);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // The next recv yields the oldest retained sample; newer
                    // ones follow, so the cache still ends on the latest.
                    let _ = core.telemetry.log(
                        LogLevel::Warn,
                        "gates.listener.lagged",
                        json!({ "skipped": skipped }),
                    );
                }
                Err(broadcast::error::RecvError::Closed) => {
                    let _ = core.telemetry.log(
                        LogLevel::Warn,
                        "gates.listener.closed",
                        json!({ "channel": core.spec.channel }),
                    );
                    break;
                }
            }
        }
    }
}

/// Builder for [`ThresholdGate`].
#[derive(Debug)]
pub struct ThresholdGateBuilder {
    spec: GateSpec,
    telemetry: Option<GateTelemetry>,
}

impl ThresholdGateBuilder {
    /// Attaches telemetry; the handle is scoped to the gate name.
    #[must_use]
    pub fn telemetry(mut self, telemetry: GateTelemetry) -> Self {
        self.telemetry = Some(telemetry);
        self
    }

    /// Subscribes to the gate's channel and starts its listener.
    ///
    /// Fails if the subscription cannot be established. Must be called from
    /// within a tokio runtime.
    pub async fn spawn(self, subscriber: &dyn SampleSubscriber) -> Result<ThresholdGate, GateError> {
        self.spec.validate()?;
        let telemetry = self
            .telemetry
            .unwrap_or_else(|| GateTelemetry::tracing_only("gates"))
            .scoped(&self.spec.name);
        let receiver = match subscriber.subscribe(&self.spec.channel).await {
            Ok(receiver) => receiver,
            Err(source) => {
                let _ = telemetry.log(
                    LogLevel::Error,
                    "gates.subscribe.failed",
                    json!({ "channel": self.spec.channel, "error": source.to_string() }),
                );
                return Err(GateError::Transport {
                    channel: self.spec.channel,
                    source,
                });
            }
        };
        let ports = self.spec.ports();
        let core = Arc::new(GateCore {
            spec: self.spec,
            cache: LatestValueCell::new(),
            telemetry,
            last_outcome: Mutex::new(None),
        });
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(listen(Arc::clone(&core), receiver, stop_rx));
        let _ = core.telemetry.log(
            LogLevel::Info,
            "gates.created",
            json!({
                "channel": core.spec.channel,
                "policy": core.spec.policy,
                "default_threshold": core.spec.default_threshold,
            }),
        );
        Ok(ThresholdGate {
            core,
            ports,
            listener: Mutex::new(Some(Listener { stop, task })),
        })
    }
}

/// Condition node comparing the latest sample of one channel to a threshold.
///
/// Each instance owns its listener and cache; two gates on the same channel
/// share nothing.
pub struct ThresholdGate {
    core: Arc<GateCore>,
    ports: PortsList,
    listener: Mutex<Option<Listener>>,
}

impl fmt::Debug for ThresholdGate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThresholdGate")
            .field("spec", &self.core.spec)
            .field("state", &self.core.cache.load())
            .field("listening", &self.is_listening())
            .finish()
    }
}

impl ThresholdGate {
    /// Returns a builder for the given spec.
    #[must_use]
    pub fn builder(spec: GateSpec) -> ThresholdGateBuilder {
        ThresholdGateBuilder {
            spec,
            telemetry: None,
        }
    }

    /// Gate specification.
    #[must_use]
    pub fn spec(&self) -> &GateSpec {
        &self.core.spec
    }

    /// Current cache contents.
    #[must_use]
    pub fn state(&self) -> GateState {
        self.core.cache.load()
    }

    /// Listener callback. Samples for other channels and non-finite values
    /// are ignored; returns whether the cache was updated.
    pub fn on_sample_received(&self, sample: &TelemetrySample) -> bool {
        self.core.accept(sample)
    }

    /// Resolves the threshold port for this tick.
    pub fn threshold_config(&self, inputs: &PortInputs) -> Result<ThresholdConfig, PortError> {
        let threshold = inputs.number(&self.ports, THRESHOLD_PORT)?;
        Ok(ThresholdConfig {
            threshold,
            comparison: self.core.spec.policy,
        })
    }

    /// Evaluates the cached value against an explicit configuration.
    ///
    /// Every tick is mirrored to `tracing`. Log sinks, which may write to
    /// disk, only receive a tick record when its outcome differs from the
    /// previous tick's, so repeated ticks never touch a file.
    #[must_use]
    pub fn evaluate_with(&self, config: &ThresholdConfig) -> Verdict {
        if !config.threshold.is_finite() {
            return self.configuration_error(format!(
                "threshold {} is not finite",
                config.threshold
            ));
        }
        let state = self.core.cache.load();
        let Some(value) = state.last_value() else {
            self.log_tick(
                TickOutcome::Waiting,
                LogLevel::Debug,
                "gates.tick.waiting",
                json!({ "channel": self.core.spec.channel }),
            );
            return Verdict {
                status: NodeStatus::Running,
                cause: VerdictCause::AwaitingData,
            };
        };
        let threshold = config.threshold;
        // Cached values are finite, so the comparison is always defined.
        let fails = config.comparison.fails(&value, &threshold).unwrap_or(true);
        if fails {
            self.log_tick(
                TickOutcome::Failed,
                LogLevel::Warn,
                config.comparison.failure_message(),
                json!({ "value": value, "threshold": threshold }),
            );
            Verdict {
                status: NodeStatus::Failure,
                cause: VerdictCause::ConditionFailed { value, threshold },
            }
        } else {
            self.log_tick(
                TickOutcome::Passed,
                LogLevel::Debug,
                "gates.tick.passed",
                json!({ "value": value, "threshold": threshold }),
            );
            Verdict {
                status: NodeStatus::Success,
                cause: VerdictCause::ConditionMet { value, threshold },
            }
        }
    }

    /// Reads the ports and evaluates; the tick with its cause.
    #[must_use]
    pub fn evaluate(&self, inputs: &PortInputs) -> Verdict {
        match self.threshold_config(inputs) {
            Ok(config) => self.evaluate_with(&config),
            Err(err) => self.configuration_error(err.to_string()),
        }
    }

    fn log_tick(&self, outcome: TickOutcome, level: LogLevel, message: &str, metadata: Value) {
        let changed = self.core.last_outcome.lock().replace(outcome) != Some(outcome);
        if changed {
            let _ = self.core.telemetry.log(level, message, metadata);
        } else {
            self.core.telemetry.trace(level, message, &metadata);
        }
    }

    fn configuration_error(&self, reason: String) -> Verdict {
        // Configuration errors always reach the sinks, and the next
        // data-driven tick is logged again.
        *self.core.last_outcome.lock() = None;
        let _ = self.core.telemetry.log(
            LogLevel::Error,
            "gates.tick.config_error",
            json!({ "error": reason }),
        );
        Verdict {
            status: NodeStatus::Failure,
            cause: VerdictCause::ConfigurationError { reason },
        }
    }

    /// Whether the background listener is still running.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|listener| !listener.task.is_finished())
    }

    /// Stops the listener and waits for it to exit.
    ///
    /// Once this returns no further sample reaches the cache. Ticks keep
    /// answering from the last cached value. Calling it twice is a no-op.
    pub async fn shutdown(&self) {
        let listener = self.listener.lock().take();
        let Some(Listener { stop, task }) = listener else {
            return;
        };
        let _ = stop.send(());
        if let Err(err) = task.await {
            let _ = self.core.telemetry.log(
                LogLevel::Error,
                "gates.listener.join_failed",
                json!({ "error": err.to_string() }),
            );
        }
        let _ = self.core.telemetry.log(
            LogLevel::Info,
            "gates.listener.stopped",
            json!({ "updates": self.core.cache.load().updates() }),
        );
    }
}

impl Drop for ThresholdGate {
    fn drop(&mut self) {
        if let Some(listener) = self.listener.get_mut().take() {
            listener.task.abort();
        }
    }
}

impl ConditionNode for ThresholdGate {
    fn name(&self) -> &str {
        &self.core.spec.name
    }

    fn provided_ports(&self) -> PortsList {
        self.ports.clone()
    }

    fn tick(&self, inputs: &PortInputs) -> NodeStatus {
        self.evaluate(inputs).status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_event_bus::{MemoryTelemetryBus, SamplePublisher};
    use shared_logging::MemoryLogSink;
    use std::time::Duration;

    const AMMO: &str = "/my_ammunition";

    fn sample(value: impl Into<TelemetryValue>) -> TelemetrySample {
        TelemetrySample::new(AMMO, "my_ammunition", value)
    }

    async fn gate(
        bus: &MemoryTelemetryBus,
        policy: ComparisonPolicy,
        sink: &Arc<MemoryLogSink>,
    ) -> ThresholdGate {
        let telemetry = GateTelemetry::builder("gates")
            .sink(sink.clone())
            .build()
            .unwrap();
        ThresholdGate::builder(GateSpec::new("ammo", AMMO, policy))
            .telemetry(telemetry)
            .spawn(bus)
            .await
            .unwrap()
    }

    async fn wait_for_updates(gate: &ThresholdGate, updates: u64) {
        for _ in 0..200 {
            if gate.state().updates() >= updates {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("listener never reached {updates} updates");
    }

    #[tokio::test]
    async fn running_until_first_sample() {
        let bus = MemoryTelemetryBus::new(16);
        let sink = Arc::new(MemoryLogSink::new(64));
        for policy in [ComparisonPolicy::BelowFails, ComparisonPolicy::AtOrAboveFails] {
            let gate = gate(&bus, policy, &sink).await;
            for threshold in [-5, 0, 30, 10_000] {
                let inputs = PortInputs::new().with(THRESHOLD_PORT, threshold);
                assert_eq!(gate.tick(&inputs), NodeStatus::Running);
            }
            gate.shutdown().await;
        }
    }

    #[tokio::test]
    async fn below_fails_boundary() {
        let bus = MemoryTelemetryBus::new(16);
        let sink = Arc::new(MemoryLogSink::new(64));
        let gate = gate(&bus, ComparisonPolicy::BelowFails, &sink).await;
        let inputs = PortInputs::new();
        gate.on_sample_received(&sample(29));
        assert_eq!(gate.tick(&inputs), NodeStatus::Failure);
        assert_eq!(sink.count("gates.tick.below_threshold"), 1);
        gate.on_sample_received(&sample(30));
        assert_eq!(gate.tick(&inputs), NodeStatus::Success);
        gate.shutdown().await;
    }

    #[tokio::test]
    async fn at_or_above_fails_boundary() {
        let bus = MemoryTelemetryBus::new(16);
        let sink = Arc::new(MemoryLogSink::new(64));
        let gate = gate(&bus, ComparisonPolicy::AtOrAboveFails, &sink).await;
        let inputs = PortInputs::new();
        gate.on_sample_received(&sample(30));
        assert_eq!(gate.tick(&inputs), NodeStatus::Failure);
        assert_eq!(sink.count("gates.tick.at_or_above_threshold"), 1);
        assert_eq!(sink.count("gates.tick.below_threshold"), 0);
        gate.on_sample_received(&sample(29));
        assert_eq!(gate.tick(&inputs), NodeStatus::Success);
        gate.shutdown().await;
    }

    #[tokio::test]
    async fn configuration_error_is_distinct_from_data_failure() {
        let bus = MemoryTelemetryBus::new(16);
        let sink = Arc::new(MemoryLogSink::new(64));
        let gate = gate(&bus, ComparisonPolicy::BelowFails, &sink).await;
        gate.on_sample_received(&sample(10));

        let mut missing = PortInputs::new();
        missing.clear(THRESHOLD_PORT);
        let config_verdict = gate.evaluate(&missing);
        assert_eq!(config_verdict.status, NodeStatus::Failure);
        assert!(config_verdict.is_configuration_error());

        let garbage = PortInputs::new().with(THRESHOLD_PORT, "plenty");
        assert!(gate.evaluate(&garbage).is_configuration_error());

        let data_verdict = gate.evaluate(&PortInputs::new());
        assert_eq!(data_verdict.status, NodeStatus::Failure);
        assert!(!data_verdict.is_configuration_error());
        assert_eq!(
            data_verdict.cause,
            VerdictCause::ConditionFailed {
                value: TelemetryValue::Int(10),
                threshold: TelemetryValue::Int(30),
            }
        );

        assert_eq!(sink.count("gates.tick.config_error"), 2);
        let record = sink.last("gates.tick.config_error").unwrap();
        assert_eq!(record.level, LogLevel::Error);
    }

    #[tokio::test]
    async fn non_finite_threshold_is_a_configuration_error() {
        let bus = MemoryTelemetryBus::new(16);
        let sink = Arc::new(MemoryLogSink::new(64));
        let gate = gate(&bus, ComparisonPolicy::AtOrAboveFails, &sink).await;
        gate.on_sample_received(&sample(10));
        for threshold in [f64::NAN, f64::INFINITY] {
            let verdict = gate.evaluate_with(&ThresholdConfig {
                threshold: TelemetryValue::Float(threshold),
                comparison: ComparisonPolicy::AtOrAboveFails,
            });
            assert_eq!(verdict.status, NodeStatus::Failure);
            assert!(verdict.is_configuration_error());
        }
        assert_eq!(sink.count("gates.tick.config_error"), 2);
        assert_eq!(sink.count("gates.tick.at_or_above_threshold"), 0);
    }

    #[tokio::test]
    async fn repeated_outcomes_reach_sinks_once() {
        let bus = MemoryTelemetryBus::new(16);
        let sink = Arc::new(MemoryLogSink::new(64));
        let gate = gate(&bus, ComparisonPolicy::BelowFails, &sink).await;
        let inputs = PortInputs::new();
        for _ in 0..3 {
            assert_eq!(gate.tick(&inputs), NodeStatus::Running);
        }
        assert_eq!(sink.count("gates.tick.waiting"), 1);

        gate.on_sample_received(&sample(5));
        for _ in 0..10 {
            assert_eq!(gate.tick(&inputs), NodeStatus::Failure);
        }
        assert_eq!(sink.count("gates.tick.below_threshold"), 1);

        gate.on_sample_received(&sample(50));
        assert_eq!(gate.tick(&inputs), NodeStatus::Success);
        assert_eq!(gate.tick(&inputs), NodeStatus::Success);
        assert_eq!(sink.count("gates.tick.passed"), 1);

        gate.on_sample_received(&sample(5));
        assert_eq!(gate.tick(&inputs), NodeStatus::Failure);
        assert_eq!(sink.count("gates.tick.below_threshold"), 2);

        let mut missing = PortInputs::new();
        missing.clear(THRESHOLD_PORT);
        assert!(gate.evaluate(&missing).is_configuration_error());
        assert_eq!(gate.tick(&inputs), NodeStatus::Failure);
        assert_eq!(sink.count("gates.tick.below_threshold"), 3);
    }

    #[tokio::test]
    async fn configuration_error_wins_over_missing_data() {
        let bus = MemoryTelemetryBus::new(16);
        let sink = Arc::new(MemoryLogSink::new(64));
        let gate = gate(&bus, ComparisonPolicy::AtOrAboveFails, &sink).await;
        let mut missing = PortInputs::new();
        missing.clear(THRESHOLD_PORT);
        assert_eq!(gate.tick(&missing), NodeStatus::Failure);
    }

    #[tokio::test]
    async fn threshold_is_read_fresh_each_tick() {
        let bus = MemoryTelemetryBus::new(16);
        let sink = Arc::new(MemoryLogSink::new(64));
        let gate = gate(&bus, ComparisonPolicy::BelowFails, &sink).await;
        gate.on_sample_received(&sample(100));
        let mut inputs = PortInputs::new();
        assert_eq!(gate.tick(&inputs), NodeStatus::Success);
        inputs.set(THRESHOLD_PORT, 150);
        assert_eq!(gate.tick(&inputs), NodeStatus::Failure);
        inputs.set(THRESHOLD_PORT, 99.5);
        assert_eq!(gate.tick(&inputs), NodeStatus::Success);
    }

    #[tokio::test]
    async fn ticks_are_idempotent_and_reflect_latest_sample() {
        let bus = MemoryTelemetryBus::new(16);
        let sink = Arc::new(MemoryLogSink::new(64));
        let gate = gate(&bus, ComparisonPolicy::BelowFails, &sink).await;
        let inputs = PortInputs::new();
        gate.on_sample_received(&sample(5));
        for _ in 0..5 {
            assert_eq!(gate.tick(&inputs), NodeStatus::Failure);
        }
        gate.on_sample_received(&sample(50));
        let verdicts: Vec<_> = (0..5).map(|_| gate.evaluate(&inputs)).collect();
        assert!(verdicts.windows(2).all(|pair| pair[0] == pair[1]));
        assert_eq!(verdicts[0].status, NodeStatus::Success);
        assert_eq!(gate.state().last_value(), Some(TelemetryValue::Int(50)));
    }

    #[tokio::test]
    async fn listener_feeds_cache_from_bus() {
        let bus = MemoryTelemetryBus::new(16);
        let sink = Arc::new(MemoryLogSink::new(64));
        let gate = gate(&bus, ComparisonPolicy::BelowFails, &sink).await;
        bus.publish(TelemetrySample::new("/my_hp", "my_hp", 1))
            .await
            .unwrap();
        bus.publish(sample(400)).await.unwrap();
        bus.publish(sample(12)).await.unwrap();
        wait_for_updates(&gate, 2).await;
        assert_eq!(gate.state().last_value(), Some(TelemetryValue::Int(12)));
        assert_eq!(gate.tick(&PortInputs::new()), NodeStatus::Failure);
        gate.shutdown().await;
    }

    #[tokio::test]
    async fn ignores_foreign_channels_and_non_finite_values() {
        let bus = MemoryTelemetryBus::new(16);
        let sink = Arc::new(MemoryLogSink::new(64));
        let gate = gate(&bus, ComparisonPolicy::BelowFails, &sink).await;
        assert!(!gate.on_sample_received(&TelemetrySample::new("/my_hp", "my_hp", 1)));
        assert!(!gate.on_sample_received(&sample(f64::NAN)));
        assert!(!gate.state().received());
        assert_eq!(sink.count("gates.sample.rejected"), 1);
    }

    #[tokio::test]
    async fn shutdown_stops_callbacks() {
        let bus = MemoryTelemetryBus::new(16);
        let sink = Arc::new(MemoryLogSink::new(64));
        let gate = gate(&bus, ComparisonPolicy::BelowFails, &sink).await;
        bus.publish(sample(40)).await.unwrap();
        wait_for_updates(&gate, 1).await;
        assert!(gate.is_listening());
        gate.shutdown().await;
        assert!(!gate.is_listening());
        assert_eq!(bus.subscriber_count(AMMO), 0);
        bus.publish(sample(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(gate.state().last_value(), Some(TelemetryValue::Int(40)));
        assert_eq!(gate.tick(&PortInputs::new()), NodeStatus::Success);
        gate.shutdown().await;
        assert_eq!(sink.count("gates.listener.stopped"), 1);
    }

    #[tokio::test]
    async fn subscribe_failure_aborts_construction() {
        let bus = MemoryTelemetryBus::new(16);
        bus.close();
        let result = ThresholdGate::builder(GateSpec::new("ammo", AMMO, ComparisonPolicy::BelowFails))
            .spawn(&bus)
            .await;
        assert!(matches!(result, Err(GateError::Transport { .. })));
    }

    #[tokio::test]
    async fn rejects_invalid_specs() {
        let bus = MemoryTelemetryBus::new(16);
        let result = ThresholdGate::builder(GateSpec::new("ammo", " ", ComparisonPolicy::BelowFails))
            .spawn(&bus)
            .await;
        assert!(matches!(result, Err(GateError::InvalidSpec(_))));
    }

    #[tokio::test]
    async fn declares_threshold_port_with_default() {
        let bus = MemoryTelemetryBus::new(16);
        let sink = Arc::new(MemoryLogSink::new(64));
        let gate = gate(&bus, ComparisonPolicy::BelowFails, &sink).await;
        let ports = gate.provided_ports();
        let port = ports.get(THRESHOLD_PORT).unwrap();
        assert_eq!(port.default, Some(json!(30)));
        assert_eq!(port.description, "Minimum ammunition threshold");
        assert_eq!(gate.name(), "ammo");
    }
}
