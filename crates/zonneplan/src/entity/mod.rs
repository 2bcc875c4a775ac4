//! Entities exposed by the integration.
//!
//! An [`Entity`] is a static [`EntityDescription`] bound to one coordinator
//! and one install index. It has no state of its own beyond what
//! [`SensorMemory`] keeps between evaluations; everything shown is read from
//! the coordinator payload on every notification.

pub mod descriptions;
mod value;

use std::sync::Arc;

use chrono::DateTime;
use chrono::Utc;
use serde::Serialize;
use serde_json::Map;
use serde_json::Value;
use tracing::debug;
use tracing::info;
use zonneplan_api::InstallIndex;
use zonneplan_api::path;

pub use value::SensorMemory;
pub use value::resolve_value;
pub use value::skip_for_daily_update;
pub use value::to_timestamp;

use crate::coordinator::ActionError;
use crate::coordinator::Coordinator;
use crate::coordinator::CoordinatorState;
use crate::coordinator::battery_control;
use crate::coordinator::battery_control::BatteryControl;
use crate::coordinator::battery_control::PowerLimit;
use crate::coordinator::charge_point;
use crate::coordinator::charge_point::ChargePoint;
use crate::coordinator::charge_point::ChargePointAction;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Platform {
    Sensor,
    BinarySensor,
    Button,
    Select,
    Number,
}

/// What a sensor shows when its path resolves to nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NoneBehaviour {
    #[default]
    Unavailable,
    Zero,
    /// Keep showing the last value.
    UsePrevious,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceClass {
    Power,
    Energy,
    Gas,
    Monetary,
    Battery,
    Timestamp,
    Connectivity,
    Running,
}

/// Command an entity accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    None,
    Press(ChargePointAction),
    SelectMode,
    SetPower(PowerLimit),
}

/// Extra attribute read from the payload next to the main value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attribute {
    pub label: &'static str,
    pub path: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityDescription {
    pub key: &'static str,
    pub name: &'static str,
    pub platform: Platform,
    /// Dotted path, may contain `{install_index}`.
    pub path: &'static str,
    pub unit: Option<&'static str>,
    pub device_class: Option<DeviceClass>,
    pub value_factor: Option<f64>,
    pub none_behaviour: NoneBehaviour,
    /// Once a value is shown, only take a new one once a day after this
    /// local hour.
    pub daily_update_hour: Option<u32>,
    pub last_reset_path: Option<&'static str>,
    pub attributes: &'static [Attribute],
    pub control: Control,
}

impl EntityDescription {
    pub const fn sensor(key: &'static str, name: &'static str, path: &'static str) -> Self {
        Self {
            key,
            name,
            platform: Platform::Sensor,
            path,
            unit: None,
            device_class: None,
            value_factor: None,
            none_behaviour: NoneBehaviour::Unavailable,
            daily_update_hour: None,
            last_reset_path: None,
            attributes: &[],
            control: Control::None,
        }
    }

    pub const fn binary_sensor(key: &'static str, name: &'static str, path: &'static str) -> Self {
        Self::sensor(key, name, path).platform(Platform::BinarySensor)
    }

    pub const fn button(key: &'static str, name: &'static str, action: ChargePointAction) -> Self {
        Self::sensor(key, name, charge_point::PROCESSING_PATH)
            .platform(Platform::Button)
            .control(Control::Press(action))
    }

    pub const fn select(key: &'static str, name: &'static str, path: &'static str) -> Self {
        Self::sensor(key, name, path)
            .platform(Platform::Select)
            .control(Control::SelectMode)
    }

    pub const fn number(key: &'static str, name: &'static str, limit: PowerLimit) -> Self {
        Self::sensor(key, name, limit.path())
            .platform(Platform::Number)
            .unit("W")
            .device_class(DeviceClass::Power)
            .control(Control::SetPower(limit))
    }

    const fn platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    const fn control(mut self, control: Control) -> Self {
        self.control = control;
        self
    }

    pub const fn unit(mut self, unit: &'static str) -> Self {
        self.unit = Some(unit);
        self
    }

    pub const fn device_class(mut self, device_class: DeviceClass) -> Self {
        self.device_class = Some(device_class);
        self
    }

    pub const fn factor(mut self, factor: f64) -> Self {
        self.value_factor = Some(factor);
        self
    }

    pub const fn none_as(mut self, behaviour: NoneBehaviour) -> Self {
        self.none_behaviour = behaviour;
        self
    }

    pub const fn daily_update_hour(mut self, hour: u32) -> Self {
        self.daily_update_hour = Some(hour);
        self
    }

    pub const fn last_reset(mut self, path: &'static str) -> Self {
        self.last_reset_path = Some(path);
        self
    }

    pub const fn attributes(mut self, attributes: &'static [Attribute]) -> Self {
        self.attributes = attributes;
        self
    }
}

/// Snapshot of one entity as the engine stores it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EntityState {
    pub entity_id: String,
    pub unique_id: String,
    pub name: &'static str,
    pub platform: Platform,
    pub available: bool,
    pub value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device_class: Option<DeviceClass>,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub attributes: Map<String, Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<DateTime<Utc>>,
}

/// Command sent to an entity from outside.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Press,
    SelectOption(String),
    SetValue(f64),
}

/// The action object an entity's commands run against.
#[derive(Clone)]
pub enum Controller {
    None,
    ChargePoint(Arc<ChargePoint>),
    BatteryControl(Arc<BatteryControl>),
}

pub struct Entity {
    pub entity_id: String,
    pub unique_id: String,
    pub description: &'static EntityDescription,
    pub install_index: InstallIndex,
    pub coordinator: Coordinator,
    pub controller: Controller,
}

impl Entity {
    /// `install_uuid` is the contract the entity belongs to, or the
    /// connection for connection level resources.
    pub fn new(
        install_uuid: &str,
        description: &'static EntityDescription,
        install_index: InstallIndex,
        coordinator: Coordinator,
        controller: Controller,
    ) -> Self {
        let short: String = install_uuid.chars().filter(|c| *c != '-').take(8).collect();
        Self {
            entity_id: format!(
                "{}.zonneplan_{}_{}",
                description.platform, short, description.key
            ),
            unique_id: format!("{}_{}", install_uuid, description.key),
            description,
            install_index,
            coordinator,
            controller,
        }
    }

    /// Work out what to show for `state`. `None` means keep showing what
    /// was published last.
    pub fn evaluate(
        &self,
        state: &CoordinatorState,
        memory: &mut SensorMemory,
        now: DateTime<Utc>,
    ) -> Option<EntityState> {
        let description = self.description;
        let data = state.data.as_ref();
        let mut snapshot = EntityState {
            entity_id: self.entity_id.clone(),
            unique_id: self.unique_id.clone(),
            name: description.name,
            platform: description.platform,
            available: data.is_some(),
            value: Value::Null,
            unit: description.unit,
            device_class: description.device_class,
            attributes: Map::new(),
            options: None,
            min: None,
            max: None,
            last_reset: None,
            last_updated: state.last_updated,
        };

        match description.platform {
            Platform::Sensor => {
                let value = data.and_then(|d| resolve_value(description, self.install_index, d));
                if value.is_none() && description.none_behaviour == NoneBehaviour::UsePrevious {
                    return None;
                }
                if skip_for_daily_update(description, memory, now) {
                    info!(
                        "Skip update {} until {}h",
                        self.unique_id,
                        description.daily_update_hour.unwrap_or_default()
                    );
                    return None;
                }
                debug!("Update {}: {:?}", self.unique_id, value);

                snapshot.value = value.unwrap_or(Value::Null);
                memory.remember(&snapshot.value, now);
                if let Some(reset) = description.last_reset_path {
                    snapshot.last_reset = data
                        .and_then(|d| path::get(d, &self.install_index.resolve(reset)))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                }
            }
            Platform::BinarySensor => {
                snapshot.value = Value::Bool(
                    data.and_then(|d| path::get(d, &self.install_index.resolve(description.path)))
                        .is_some_and(path::is_truthy),
                );
            }
            Platform::Button => {
                snapshot.available = match description.control {
                    Control::Press(action) => charge_point::button_available(action, state),
                    _ => false,
                };
            }
            Platform::Select => {
                snapshot.value = data
                    .and_then(|d| path::get(d, description.path))
                    .cloned()
                    .unwrap_or(Value::Null);
                snapshot.options = Some(
                    data.map(battery_control::available_modes)
                        .unwrap_or_default(),
                );
            }
            Platform::Number => {
                let home_optimization = data
                    .and_then(|d| path::get(d, battery_control::CONTROL_MODE_PATH))
                    .and_then(Value::as_str)
                    == Some("home_optimization");
                snapshot.available = state.last_update_success && home_optimization;
                snapshot.value = data
                    .and_then(|d| path::get(d, description.path))
                    .cloned()
                    .unwrap_or(Value::Null);
                if let (Control::SetPower(limit), Some(data)) = (description.control, data) {
                    let (min, max) = limit.range(data);
                    snapshot.min = Some(min);
                    snapshot.max = Some(max);
                }
            }
        }

        if let Some(data) = data {
            for attribute in description.attributes {
                let value = path::get(data, &self.install_index.resolve(attribute.path))
                    .cloned()
                    .unwrap_or(Value::Null);
                snapshot.attributes.insert(attribute.label.to_string(), value);
            }
        }

        Some(snapshot)
    }

    /// Run `command` against the entity's controller.
    pub async fn execute(&self, command: &Command) -> Result<(), ActionError> {
        match (&self.description.control, &self.controller, command) {
            (Control::Press(action), Controller::ChargePoint(cp), Command::Press) => {
                cp.run(*action).await
            }
            (Control::SelectMode, Controller::BatteryControl(bc), Command::SelectOption(option)) => {
                bc.select_mode(option).await
            }
            (Control::SetPower(limit), Controller::BatteryControl(bc), Command::SetValue(watts)) => {
                bc.set_power_limit(*limit, *watts).await
            }
            _ => Err(ActionError::Precondition(format!(
                "{} does not accept {:?}",
                self.entity_id, command
            ))),
        }
    }
}
