#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    missing_docs,
    rust_2018_idioms
)]

//! Named-channel telemetry transport.
//!
//! Every channel carries scalar [`TelemetrySample`]s. Delivery is
//! at-least-once with per-channel ordering; nothing is promised across
//! channels.

use std::{
    cmp::Ordering,
    collections::{HashMap, VecDeque},
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{
        atomic::{AtomicBool, Ordering as AtomicOrdering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::broadcast};

/// Errors raised by transport implementations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The transport has been closed and accepts no more traffic.
    #[error("transport closed")]
    Closed,
    /// Underlying I/O failure.
    #[error("transport io failure: {0}")]
    Io(#[from] std::io::Error),
    /// Sample could not be encoded.
    #[error("sample encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    /// The primary target took the sample but a mirror rejected it.
    #[error("sample delivered, mirror failed: {0}")]
    MirrorFailed(#[source] Box<TransportError>),
}

impl TransportError {
    /// Whether the sample still reached its primary target.
    #[must_use]
    pub const fn delivered(&self) -> bool {
        matches!(self, Self::MirrorFailed(_))
    }
}

/// Scalar telemetry value.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TelemetryValue {
    /// Integer reading (health, ammunition count).
    Int(i64),
    /// Floating-point reading (positions).
    Float(f64),
}

/// Discriminant of a [`TelemetryValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    /// Integer values.
    Int,
    /// Floating-point values.
    Float,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => write!(f, "integer"),
            Self::Float => write!(f, "float"),
        }
    }
}

impl TelemetryValue {
    /// Returns the value kind.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Self::Int(_) => ValueKind::Int,
            Self::Float(_) => ValueKind::Float,
        }
    }

    /// Widens the value to `f64`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> f64 {
        match *self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }

    /// Whether the value is usable in a comparison.
    #[must_use]
    pub fn is_finite(&self) -> bool {
        match self {
            Self::Int(_) => true,
            Self::Float(v) => v.is_finite(),
        }
    }

    /// Orders two values. Integer pairs compare exactly, anything else as `f64`.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => Some(a.cmp(b)),
            _ => self.as_f64().partial_cmp(&other.as_f64()),
        }
    }
}

impl fmt::Display for TelemetryValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:?}"),
        }
    }
}

impl From<i64> for TelemetryValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<i32> for TelemetryValue {
    fn from(value: i32) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for TelemetryValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// Error returned when text is not a number.
#[derive(Debug, Clone, Error)]
#[error("not a numeric value: {0:?}")]
pub struct ValueParseError(pub String);

impl FromStr for TelemetryValue {
    type Err = ValueParseError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if let Ok(v) = trimmed.parse::<i64>() {
            return Ok(Self::Int(v));
        }
        trimmed
            .parse::<f64>()
            .map(Self::Float)
            .map_err(|_| ValueParseError(raw.to_string()))
    }
}

/// Immutable sample sent over a telemetry channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    /// Channel the sample travels on (e.g. `/my_ammunition`).
    pub channel: String,
    /// Source field name (e.g. `my_ammunition`).
    pub field: String,
    /// Reading.
    pub value: TelemetryValue,
    /// Emission timestamp.
    pub emitted_at: DateTime<Utc>,
}

impl TelemetrySample {
    /// Creates a sample stamped with the current time.
    #[must_use]
    pub fn new(
        channel: impl Into<String>,
        field: impl Into<String>,
        value: impl Into<TelemetryValue>,
    ) -> Self {
        Self {
            channel: channel.into(),
            field: field.into(),
            value: value.into(),
            emitted_at: Utc::now(),
        }
    }
}

/// Sample publisher interface.
#[async_trait]
pub trait SamplePublisher: Send + Sync {
    /// Publishes a sample on its channel.
    async fn publish(&self, sample: TelemetrySample) -> Result<(), TransportError>;
}

/// Sample subscriber interface.
#[async_trait]
pub trait SampleSubscriber: Send + Sync {
    /// Opens a receiver for a single channel.
    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<broadcast::Receiver<TelemetrySample>, TransportError>;
}

/// In-memory named-channel bus backed by one broadcast sender per channel.
#[derive(Debug, Clone)]
pub struct MemoryTelemetryBus {
    inner: Arc<BusInner>,
}

#[derive(Debug)]
struct BusInner {
    capacity: usize,
    channels: Mutex<HashMap<String, broadcast::Sender<TelemetrySample>>>,
    backlog: Mutex<VecDeque<TelemetrySample>>,
    closed: AtomicBool,
}

impl MemoryTelemetryBus {
    /// Creates a bus; `capacity` bounds both per-channel buffers and the backlog.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(BusInner {
                capacity,
                channels: Mutex::new(HashMap::new()),
                backlog: Mutex::new(VecDeque::with_capacity(capacity)),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// The closed flag is read under the channel lock, so no sender is
    /// created after [`Self::close`] cleared the map.
    fn sender(&self, channel: &str) -> Result<broadcast::Sender<TelemetrySample>, TransportError> {
        let mut channels = self.inner.channels.lock();
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.inner.capacity).0)
            .clone())
    }

    /// Snapshot of recent samples across all channels, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<TelemetrySample> {
        self.inner.backlog.lock().iter().cloned().collect()
    }

    /// Recent samples for one channel, oldest first.
    #[must_use]
    pub fn channel_snapshot(&self, channel: &str) -> Vec<TelemetrySample> {
        self.inner
            .backlog
            .lock()
            .iter()
            .filter(|sample| sample.channel == channel)
            .cloned()
            .collect()
    }

    /// Most recent sample published on a channel.
    #[must_use]
    pub fn latest(&self, channel: &str) -> Option<TelemetrySample> {
        self.inner
            .backlog
            .lock()
            .iter()
            .rev()
            .find(|sample| sample.channel == channel)
            .cloned()
    }

    /// Number of live receivers on a channel.
    #[must_use]
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner
            .channels
            .lock()
            .get(channel)
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Closes the bus. Open receivers drain what they hold and then observe
    /// `Closed`; later publish and subscribe calls fail.
    pub fn close(&self) {
        let mut channels = self.inner.channels.lock();
        self.inner.closed.store(true, AtomicOrdering::SeqCst);
        channels.clear();
    }

    /// Whether [`Self::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl SamplePublisher for MemoryTelemetryBus {
    async fn publish(&self, sample: TelemetrySample) -> Result<(), TransportError> {
        let sender = self.sender(&sample.channel)?;
        {
            let mut backlog = self.inner.backlog.lock();
            if backlog.len() == self.inner.capacity {
                backlog.pop_front();
            }
            backlog.push_back(sample.clone());
        }
        // No receivers is not an error: nobody listens yet.
        let _ = sender.send(sample);
        Ok(())
    }
}

#[async_trait]
impl SampleSubscriber for MemoryTelemetryBus {
    async fn subscribe(
        &self,
        channel: &str,
    ) -> Result<broadcast::Receiver<TelemetrySample>, TransportError> {
        Ok(self.sender(channel)?.subscribe())
    }
}

/// File-backed publisher appending samples as JSON lines.
#[derive(Debug, Clone)]
pub struct FileSamplePublisher {
    path: PathBuf,
}

impl FileSamplePublisher {
    /// Creates a publisher that appends JSON lines to the given path.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, TransportError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Target file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl SamplePublisher for FileSamplePublisher {
    async fn publish(&self, sample: TelemetrySample) -> Result<(), TransportError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        let mut data = serde_json::to_vec(&sample)?;
        data.push(b'\n');
        file.write_all(&data).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Publishes every sample to each wrapped publisher in order.
///
/// The first target is the primary; the rest are mirrors such as a journal.
/// A primary failure is returned as is. When only a mirror fails the result
/// is [`TransportError::MirrorFailed`], and the sample counts as delivered.
#[derive(Clone, Default)]
pub struct FanoutPublisher {
    targets: Vec<Arc<dyn SamplePublisher>>,
}

impl fmt::Debug for FanoutPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FanoutPublisher")
            .field("targets", &self.targets.len())
            .finish()
    }
}

impl FanoutPublisher {
    /// Creates an empty fanout.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a target. The first one added is the primary.
    #[must_use]
    pub fn with_target(mut self, target: Arc<dyn SamplePublisher>) -> Self {
        self.targets.push(target);
        self
    }
}

#[async_trait]
impl SamplePublisher for FanoutPublisher {
    /// Every target is attempted, even after the primary fails.
    async fn publish(&self, sample: TelemetrySample) -> Result<(), TransportError> {
        let Some((primary, mirrors)) = self.targets.split_first() else {
            return Ok(());
        };
        let primary_result = primary.publish(sample.clone()).await;
        let mut mirror_error = None;
        for mirror in mirrors {
            if let Err(err) = mirror.publish(sample.clone()).await {
                mirror_error.get_or_insert(err);
            }
        }
        primary_result?;
        mirror_error.map_or(Ok(()), |err| {
            Err(TransportError::MirrorFailed(Box::new(err)))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn delivers_only_the_subscribed_channel() {
        let bus = MemoryTelemetryBus::new(16);
        let mut rx = bus.subscribe("/my_ammunition").await.unwrap();
        bus.publish(TelemetrySample::new("/my_hp", "my_hp", 100))
            .await
            .unwrap();
        bus.publish(TelemetrySample::new("/my_ammunition", "my_ammunition", 400))
            .await
            .unwrap();
        let sample = rx.recv().await.unwrap();
        assert_eq!(sample.channel, "/my_ammunition");
        assert_eq!(sample.value, TelemetryValue::Int(400));
        assert!(rx.try_recv().is_err());
        assert_eq!(bus.snapshot().len(), 2);
    }

    #[tokio::test]
    async fn preserves_order_within_a_channel() {
        let bus = MemoryTelemetryBus::new(16);
        let mut rx = bus.subscribe("/my_hp").await.unwrap();
        for hp in [100, 80, 55] {
            bus.publish(TelemetrySample::new("/my_hp", "my_hp", hp))
                .await
                .unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(rx.recv().await.unwrap().value);
        }
        assert_eq!(
            seen,
            vec![
                TelemetryValue::Int(100),
                TelemetryValue::Int(80),
                TelemetryValue::Int(55)
            ]
        );
        assert_eq!(bus.latest("/my_hp").unwrap().value, TelemetryValue::Int(55));
    }

    #[tokio::test]
    async fn closed_bus_rejects_traffic() {
        let bus = MemoryTelemetryBus::new(4);
        let mut rx = bus.subscribe("/enemy_x").await.unwrap();
        bus.close();
        assert!(matches!(
            bus.publish(TelemetrySample::new("/enemy_x", "enemy_x", 1.0))
                .await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            bus.subscribe("/enemy_x").await,
            Err(TransportError::Closed)
        ));
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
    }

    #[tokio::test]
    async fn backlog_is_bounded() {
        let bus = MemoryTelemetryBus::new(2);
        for hp in 0..5 {
            bus.publish(TelemetrySample::new("/my_hp", "my_hp", hp))
                .await
                .unwrap();
        }
        let values: Vec<_> = bus.snapshot().into_iter().map(|s| s.value).collect();
        assert_eq!(values, vec![TelemetryValue::Int(3), TelemetryValue::Int(4)]);
    }

    #[tokio::test]
    async fn file_publisher_writes_samples() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("samples/telemetry.jsonl");
        let publisher = FileSamplePublisher::new(&path).unwrap();
        publisher
            .publish(TelemetrySample::new("/enemy_y", "enemy_y", 5.0))
            .await
            .unwrap();
        let content = std::fs::read_to_string(path).unwrap();
        let decoded: TelemetrySample = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(decoded.value, TelemetryValue::Float(5.0));
    }

    #[tokio::test]
    async fn fanout_attempts_every_target() {
        let closed = MemoryTelemetryBus::new(4);
        closed.close();
        let open = MemoryTelemetryBus::new(4);
        let fanout = FanoutPublisher::new()
            .with_target(Arc::new(closed))
            .with_target(Arc::new(open.clone()));
        let result = fanout
            .publish(TelemetrySample::new("/my_hp", "my_hp", 1))
            .await;
        assert!(matches!(result, Err(TransportError::Closed)));
        assert_eq!(open.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn fanout_reports_mirror_failure_as_delivered() {
        let dir = tempdir().unwrap();
        let primary = MemoryTelemetryBus::new(4);
        // Appending to a directory fails.
        let broken_journal = FileSamplePublisher::new(dir.path()).unwrap();
        let fanout = FanoutPublisher::new()
            .with_target(Arc::new(primary.clone()))
            .with_target(Arc::new(broken_journal));
        let err = fanout
            .publish(TelemetrySample::new("/my_hp", "my_hp", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::MirrorFailed(_)));
        assert!(err.delivered());
        assert_eq!(primary.latest("/my_hp").unwrap().value, TelemetryValue::Int(1));
        assert!(!TransportError::Closed.delivered());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn receivers_opened_around_close_all_end() {
        for _ in 0..50 {
            let bus = MemoryTelemetryBus::new(4);
            let subscribers: Vec<_> = (0..8)
                .map(|i| {
                    let bus = bus.clone();
                    tokio::spawn(async move { bus.subscribe(&format!("/ch{i}")).await })
                })
                .collect();
            let closer = bus.clone();
            tokio::spawn(async move { closer.close() }).await.unwrap();
            for handle in subscribers {
                if let Ok(mut rx) = handle.await.unwrap() {
                    let received = tokio::time::timeout(Duration::from_secs(1), rx.recv())
                        .await
                        .expect("receiver outlived close");
                    assert!(matches!(received, Err(broadcast::error::RecvError::Closed)));
                }
            }
            for i in 0..8 {
                assert_eq!(bus.subscriber_count(&format!("/ch{i}")), 0);
            }
        }
    }

    #[test]
    fn values_compare_and_parse() {
        assert_eq!(
            TelemetryValue::Int(29).compare(&TelemetryValue::Int(30)),
            Some(Ordering::Less)
        );
        assert_eq!(
            TelemetryValue::Float(30.0).compare(&TelemetryValue::Int(30)),
            Some(Ordering::Equal)
        );
        assert_eq!(TelemetryValue::Float(f64::NAN).compare(&30.into()), None);
        assert_eq!("55".parse::<TelemetryValue>().unwrap(), TelemetryValue::Int(55));
        assert_eq!(
            "10.5".parse::<TelemetryValue>().unwrap(),
            TelemetryValue::Float(10.5)
        );
        assert!("lots".parse::<TelemetryValue>().is_err());
        let decoded: TelemetryValue = serde_json::from_str("10.0").unwrap();
        assert_eq!(decoded.kind(), ValueKind::Float);
    }
}
