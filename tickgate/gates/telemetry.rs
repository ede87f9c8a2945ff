use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_logging::{JsonLogger, LogLevel, LogRecord, LogSink};

/// Builder for gate telemetry sinks.
pub struct GateTelemetryBuilder {
    module: String,
    log_path: Option<PathBuf>,
    sinks: Vec<Arc<dyn LogSink>>,
}

impl GateTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            log_path: None,
            sinks: Vec::new(),
        }
    }

    /// Sets the JSON-lines log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Adds an extra sink.
    #[must_use]
    pub fn sink(mut self, sink: Arc<dyn LogSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<GateTelemetry> {
        let mut sinks = self.sinks;
        if let Some(path) = self.log_path {
            sinks.push(Arc::new(JsonLogger::new(path)?));
        }
        Ok(GateTelemetry {
            module: Arc::from(self.module),
            sinks: Arc::new(sinks),
        })
    }
}

/// Telemetry handle shared by gate instances.
///
/// [`Self::scoped`] derives a per-gate handle writing to the same sinks.
#[derive(Clone)]
pub struct GateTelemetry {
    module: Arc<str>,
    sinks: Arc<Vec<Arc<dyn LogSink>>>,
}

impl fmt::Debug for GateTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GateTelemetry")
            .field("module", &self.module)
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

impl GateTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> GateTelemetryBuilder {
        GateTelemetryBuilder::new(module)
    }

    /// Handle that only mirrors to `tracing`.
    #[must_use]
    pub fn tracing_only(module: impl Into<String>) -> Self {
        Self {
            module: Arc::from(module.into()),
            sinks: Arc::new(Vec::new()),
        }
    }

    /// Same sinks, module suffixed with `.{name}`.
    #[must_use]
    pub fn scoped(&self, name: &str) -> Self {
        Self {
            module: Arc::from(format!("{}.{name}", self.module)),
            sinks: Arc::clone(&self.sinks),
        }
    }

    /// Module name stamped on every record.
    #[must_use]
    pub fn module(&self) -> &str {
        &self.module
    }

    /// Mirrors a record to `tracing` only; sinks are not touched.
    pub fn trace(&self, level: LogLevel, message: &str, metadata: &Value) {
        let module = &*self.module;
        match level {
            LogLevel::Debug => tracing::debug!(module, %metadata, "{message}"),
            LogLevel::Info => tracing::info!(module, %metadata, "{message}"),
            LogLevel::Warn => tracing::warn!(module, %metadata, "{message}"),
            LogLevel::Error => tracing::error!(module, %metadata, "{message}"),
        }
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        self.trace(level, message, &metadata);
        if self.sinks.is_empty() {
            return Ok(());
        }
        let record = LogRecord::new(&*self.module, level, message).with_metadata(&metadata);
        for sink in self.sinks.iter() {
            sink.write(&record)?;
        }
        Ok(())
    }
}
