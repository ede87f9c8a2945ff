//! Explicit parameter store backing the telemetry fields.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;
use shared_event_bus::{TelemetryValue, ValueKind};
use thiserror::Error;

/// Errors surfaced by the telemetry source.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum SourceError {
    /// The field was never declared.
    #[error("unknown field: {0}")]
    UnknownField(String),
    /// The field is already declared.
    #[error("field already declared: {0}")]
    DuplicateField(String),
    /// The value kind differs from the declared default.
    #[error("field {field} expects {expected} values, got {found}")]
    KindMismatch {
        /// Field name.
        field: String,
        /// Kind fixed by the default.
        expected: ValueKind,
        /// Kind of the rejected value.
        found: ValueKind,
    },
    /// NaN or infinite floats are rejected.
    #[error("field {0} rejects non-finite values")]
    NonFinite(String),
    /// `configure` was called twice.
    #[error("publisher already configured")]
    AlreadyConfigured,
    /// Emission or spawning attempted before `configure`.
    #[error("publisher not configured")]
    NotConfigured,
    /// `configure` received no fields.
    #[error("no telemetry fields supplied")]
    NoFields,
}

#[derive(Debug)]
struct FieldSlot {
    kind: ValueKind,
    value: RwLock<TelemetryValue>,
}

impl FieldSlot {
    fn shared(default: TelemetryValue) -> Arc<Self> {
        Arc::new(Self {
            kind: default.kind(),
            value: RwLock::new(default),
        })
    }
}

/// Named numeric fields, each guarded by its own lock.
///
/// Declaration order is preserved. Updates to one field never block reads of
/// another, and there is no multi-field transaction.
#[derive(Debug, Default)]
pub struct ParameterStore {
    slots: RwLock<IndexMap<String, Arc<FieldSlot>>>,
}

impl ParameterStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declares a field; its default fixes the value kind.
    pub fn declare(
        &self,
        name: impl Into<String>,
        default: impl Into<TelemetryValue>,
    ) -> Result<(), SourceError> {
        let name = name.into();
        let default = default.into();
        if !default.is_finite() {
            return Err(SourceError::NonFinite(name));
        }
        let mut slots = self.slots.write();
        if slots.contains_key(&name) {
            return Err(SourceError::DuplicateField(name));
        }
        slots.insert(name, FieldSlot::shared(default));
        Ok(())
    }

    /// Declares every field or none.
    ///
    /// All defaults are checked against the store before the first insert,
    /// so a rejected batch leaves the store as it was.
    pub fn declare_all(
        &self,
        defaults: &IndexMap<String, TelemetryValue>,
    ) -> Result<(), SourceError> {
        let mut slots = self.slots.write();
        for (name, default) in defaults {
            if !default.is_finite() {
                return Err(SourceError::NonFinite(name.clone()));
            }
            if slots.contains_key(name) {
                return Err(SourceError::DuplicateField(name.clone()));
            }
        }
        for (name, default) in defaults {
            slots.insert(name.clone(), FieldSlot::shared(*default));
        }
        Ok(())
    }

    fn slot(&self, name: &str) -> Option<Arc<FieldSlot>> {
        self.slots.read().get(name).cloned()
    }

    /// Current value of a field.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<TelemetryValue> {
        self.slot(name).map(|slot| *slot.value.read())
    }

    /// Replaces a field's value, returning the previous one.
    ///
    /// Integers written to a float field are widened; floats written to an
    /// integer field are rejected.
    pub fn set(
        &self,
        name: &str,
        value: impl Into<TelemetryValue>,
    ) -> Result<TelemetryValue, SourceError> {
        let slot = self
            .slot(name)
            .ok_or_else(|| SourceError::UnknownField(name.to_string()))?;
        let value = coerce(name, slot.kind, value.into())?;
        let mut current = slot.value.write();
        Ok(std::mem::replace(&mut *current, value))
    }

    /// Declared kind of a field.
    #[must_use]
    pub fn kind(&self, name: &str) -> Option<ValueKind> {
        self.slot(name).map(|slot| slot.kind)
    }

    /// Whether the field exists.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.slots.read().contains_key(name)
    }

    /// Field names in declaration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.slots.read().keys().cloned().collect()
    }

    /// Current values in declaration order. Each field is read independently.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, TelemetryValue)> {
        self.slots
            .read()
            .iter()
            .map(|(name, slot)| (name.clone(), *slot.value.read()))
            .collect()
    }

    /// Number of declared fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    /// Whether no field is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.read().is_empty()
    }
}

#[allow(clippy::cast_precision_loss)]
fn coerce(
    name: &str,
    expected: ValueKind,
    value: TelemetryValue,
) -> Result<TelemetryValue, SourceError> {
    if !value.is_finite() {
        return Err(SourceError::NonFinite(name.to_string()));
    }
    match (expected, value) {
        (ValueKind::Int, TelemetryValue::Int(_)) | (ValueKind::Float, TelemetryValue::Float(_)) => {
            Ok(value)
        }
        (ValueKind::Float, TelemetryValue::Int(v)) => Ok(TelemetryValue::Float(v as f64)),
        (ValueKind::Int, TelemetryValue::Float(_)) => Err(SourceError::KindMismatch {
            field: name.to_string(),
            expected,
            found: ValueKind::Float,
        }),
    }
}
