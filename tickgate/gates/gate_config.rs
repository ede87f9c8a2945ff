use std::{collections::HashSet, fs, path::Path};

use anyhow::{bail, Context, Result};
use indexmap::IndexMap;
use serde::Deserialize;
use shared_event_bus::TelemetryValue;

use crate::{
    node::PortInputs,
    threshold::{ComparisonPolicy, GateSpec, DEFAULT_THRESHOLD},
};

/// Gate declarations loaded from TOML.
///
/// ```toml
/// [[gates]]
/// name = "ammo_low"
/// channel = "/my_ammunition"
/// policy = "below_fails"
/// threshold = 30
///
/// [gates.inputs]
/// threshold = 45
/// ```
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GateDocument {
    /// Gate instances.
    #[serde(default = "default_gates")]
    pub gates: Vec<GateEntry>,
}

impl Default for GateDocument {
    fn default() -> Self {
        Self {
            gates: default_gates(),
        }
    }
}

/// One gate instance.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GateEntry {
    /// Instance name.
    pub name: String,
    /// Channel to listen on.
    #[serde(default = "default_channel")]
    pub channel: String,
    /// Comparison direction.
    pub policy: ComparisonPolicy,
    /// Default of the threshold port.
    #[serde(default = "default_threshold")]
    pub threshold: TelemetryValue,
    /// Port values handed to the gate on every tick.
    #[serde(default)]
    pub inputs: IndexMap<String, serde_json::Value>,
}

impl GateEntry {
    /// Spec used to spawn the gate.
    #[must_use]
    pub fn spec(&self) -> GateSpec {
        GateSpec::new(&self.name, &self.channel, self.policy).with_default_threshold(self.threshold)
    }

    /// Tick inputs declared for this gate.
    #[must_use]
    pub fn port_inputs(&self) -> PortInputs {
        self.inputs
            .iter()
            .fold(PortInputs::new(), |inputs, (name, value)| {
                inputs.with(name.clone(), value.clone())
            })
    }
}

impl GateDocument {
    /// Loads configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("reading gate config {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut document: Self = toml::from_str(raw)?;
        if document.gates.is_empty() {
            document.gates = default_gates();
        }
        let mut seen = HashSet::new();
        for gate in &document.gates {
            if !seen.insert(gate.name.as_str()) {
                bail!("duplicate gate name {}", gate.name);
            }
            if !gate.threshold.is_finite() {
                bail!("gate {} has a non-finite threshold", gate.name);
            }
        }
        Ok(document)
    }
}

fn default_channel() -> String {
    "/my_ammunition".into()
}

const fn default_threshold() -> TelemetryValue {
    TelemetryValue::Int(DEFAULT_THRESHOLD)
}

fn default_gates() -> Vec<GateEntry> {
    vec![
        GateEntry {
            name: "ammo_low".into(),
            channel: default_channel(),
            policy: ComparisonPolicy::BelowFails,
            threshold: default_threshold(),
            inputs: IndexMap::new(),
        },
        GateEntry {
            name: "ammo_high".into(),
            channel: default_channel(),
            policy: ComparisonPolicy::AtOrAboveFails,
            threshold: default_threshold(),
            inputs: IndexMap::new(),
        },
    ]
}
