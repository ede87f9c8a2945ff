use std::{fs, path::Path, time::Duration};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use shared_event_bus::TelemetryValue;

/// Configuration for the telemetry source.
///
/// ```toml
/// period_ms = 1000
/// channel_prefix = "/"
///
/// [fields]
/// my_hp = 100
/// enemy_x = 10.0
///
/// [channels]
/// enemy_x = "/enemy_point/x"
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceDocument {
    /// Emission period in milliseconds.
    #[serde(default = "default_period_ms")]
    pub period_ms: u64,
    /// Prefix applied to field names to form channel names.
    #[serde(default = "default_channel_prefix")]
    pub channel_prefix: String,
    /// Field defaults, in emission order.
    #[serde(default = "default_fields")]
    pub fields: IndexMap<String, TelemetryValue>,
    /// Explicit channel per field.
    #[serde(default)]
    pub channels: IndexMap<String, String>,
}

impl Default for SourceDocument {
    fn default() -> Self {
        Self {
            period_ms: default_period_ms(),
            channel_prefix: default_channel_prefix(),
            fields: default_fields(),
            channels: IndexMap::new(),
        }
    }
}

impl SourceDocument {
    /// Loads configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading source config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses and normalizes a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut document: Self = toml::from_str(raw)?;
        if document.period_ms == 0 {
            bail!("period_ms must be positive");
        }
        if document.fields.is_empty() {
            document.fields = default_fields();
        }
        if let Some((name, _)) = document.fields.iter().find(|(_, v)| !v.is_finite()) {
            bail!("field {name} has a non-finite default");
        }
        if let Some(field) = document
            .channels
            .keys()
            .find(|field| !document.fields.contains_key(*field))
        {
            bail!("channel override for undeclared field {field}");
        }
        Ok(document)
    }

    /// Emission period.
    #[must_use]
    pub const fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

const fn default_period_ms() -> u64 {
    1_000
}

fn default_channel_prefix() -> String {
    "/".into()
}

fn default_fields() -> IndexMap<String, TelemetryValue> {
    IndexMap::from([
        ("my_hp".to_string(), TelemetryValue::Int(100)),
        ("my_ammunition".to_string(), TelemetryValue::Int(400)),
        ("enemy_x".to_string(), TelemetryValue::Float(10.0)),
        ("enemy_y".to_string(), TelemetryValue::Float(5.0)),
        ("enemy_z".to_string(), TelemetryValue::Float(0.0)),
    ])
}
