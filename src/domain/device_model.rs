//! Device model: the OCPP 2.0.1/2.1 component/variable store backing
//! `GetVariables`/`SetVariables`/`GetBaseReport`.
//!
//! 1.6 has no equivalent; stations running that version simply carry an
//! empty model.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeType {
    Actual,
    Target,
    MinSet,
    MaxSet,
}

impl AttributeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Actual => "Actual",
            Self::Target => "Target",
            Self::MinSet => "MinSet",
            Self::MaxSet => "MaxSet",
        }
    }
}

/// Identifies a single variable: a component (optionally with an
/// instance, e.g. `"Connector"` #1) and a variable name (optionally with
/// an instance).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VariableKey {
    pub component: String,
    pub component_instance: Option<String>,
    pub variable: String,
    pub variable_instance: Option<String>,
}

impl VariableKey {
    pub fn new(component: impl Into<String>, variable: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            component_instance: None,
            variable: variable.into(),
            variable_instance: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum VariableValue {
    String(String),
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
}

impl VariableValue {
    pub fn to_wire_string(&self) -> String {
        match self {
            Self::String(s) => s.clone(),
            Self::Integer(i) => i.to_string(),
            Self::Decimal(d) => d.to_string(),
            Self::Boolean(b) => b.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

struct VariableSlot {
    values: DashMap<AttributeType, VariableValue>,
    mutability: Mutability,
}

/// In-memory component/variable registry for a single station.
pub struct DeviceModel {
    variables: DashMap<VariableKey, VariableSlot>,
}

impl DeviceModel {
    pub fn new() -> Self {
        Self {
            variables: DashMap::new(),
        }
    }

    /// Declare a variable with an initial `Actual` value. Subsequent
    /// calls overwrite the declaration.
    pub fn declare(&self, key: VariableKey, initial: VariableValue, mutability: Mutability) {
        let values = DashMap::new();
        values.insert(AttributeType::Actual, initial);
        self.variables.insert(
            key,
            VariableSlot {
                values,
                mutability,
            },
        );
    }

    pub fn get(&self, key: &VariableKey, attribute: AttributeType) -> Option<VariableValue> {
        self.variables
            .get(key)
            .and_then(|slot| slot.values.get(&attribute).map(|v| v.clone()))
    }

    /// Set a variable's value, rejecting writes to read-only variables.
    pub fn set(
        &self,
        key: &VariableKey,
        attribute: AttributeType,
        value: VariableValue,
    ) -> Result<(), &'static str> {
        let slot = self.variables.get(key).ok_or("UnknownComponent")?;
        if slot.mutability == Mutability::ReadOnly {
            return Err("Rejected");
        }
        slot.values.insert(attribute, value);
        Ok(())
    }

    /// Whether any variable has been declared under `component`, used to
    /// distinguish `UnknownComponent` from `UnknownVariable` on a
    /// `GetVariables` miss.
    pub fn has_component(&self, component: &str) -> bool {
        self.variables.iter().any(|e| e.key().component == component)
    }

    pub fn known_components(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .variables
            .iter()
            .map(|e| e.key().component.clone())
            .collect();
        names.sort();
        names.dedup();
        names
    }
}

impl Default for DeviceModel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn declare_then_get_round_trips() {
        let model = DeviceModel::new();
        let key = VariableKey::new("OCPPCommCtrlr", "HeartbeatInterval");
        model.declare(key.clone(), VariableValue::Integer(300), Mutability::ReadWrite);
        assert_eq!(
            model.get(&key, AttributeType::Actual),
            Some(VariableValue::Integer(300))
        );
    }

    #[test]
    fn read_only_variable_rejects_set() {
        let model = DeviceModel::new();
        let key = VariableKey::new("ChargingStation", "VendorName");
        model.declare(
            key.clone(),
            VariableValue::String("Acme".into()),
            Mutability::ReadOnly,
        );
        let result = model.set(&key, AttributeType::Actual, VariableValue::String("Other".into()));
        assert!(result.is_err());
    }

    #[test]
    fn has_component_reflects_declarations() {
        let model = DeviceModel::new();
        model.declare(
            VariableKey::new("ChargingStation", "VendorName"),
            VariableValue::String("Acme".into()),
            Mutability::ReadOnly,
        );
        assert!(model.has_component("ChargingStation"));
        assert!(!model.has_component("EVSE"));
    }

    #[test]
    fn unknown_component_set_is_rejected() {
        let model = DeviceModel::new();
        let key = VariableKey::new("Nope", "Nothing");
        assert!(model
            .set(&key, AttributeType::Actual, VariableValue::Boolean(true))
            .is_err());
    }
}
