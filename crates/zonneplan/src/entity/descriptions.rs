//! Entity tables per resource.
//!
//! Money is in units of 10^-7 euro and energy in Wh unless a coordinator
//! already converted it (battery charts).

use super::Attribute;
use super::DeviceClass;
use super::EntityDescription;
use super::NoneBehaviour;
use crate::coordinator::battery_control::CONTROL_MODE_PATH;
use crate::coordinator::battery_control::PowerLimit;
use crate::coordinator::charge_point::ChargePointAction;

const MONEY: f64 = 0.000_000_1;
const KILO: f64 = 0.001;

pub static SUMMARY_ELECTRICITY: &[EntityDescription] = &[
    EntityDescription::sensor("usage", "Current usage", "usage.value")
        .unit("W")
        .device_class(DeviceClass::Power)
        .none_as(NoneBehaviour::UsePrevious),
    EntityDescription::sensor("usage_measured_at", "Usage measured at", "usage.measured_at")
        .device_class(DeviceClass::Timestamp),
    EntityDescription::sensor(
        "current_electricity_tariff",
        "Current electricity tariff",
        "price_per_hour.0.electricity_price",
    )
    .unit("EUR/kWh")
    .device_class(DeviceClass::Monetary)
    .factor(MONEY)
    .attributes(&[
        Attribute {
            label: "tariff_group",
            path: "price_per_hour.0.tariff_group",
        },
        Attribute {
            label: "forecast",
            path: "price_per_hour",
        },
    ]),
    EntityDescription::sensor(
        "current_tariff_group",
        "Current tariff group",
        "price_per_hour.0.tariff_group",
    ),
    EntityDescription::sensor(
        "sustainability_score",
        "Sustainability score",
        "price_per_hour.0.sustainability_score",
    )
    .unit("%")
    .factor(0.1),
    EntityDescription::sensor(
        "solar_percentage",
        "Solar percentage",
        "price_per_hour.0.solar_percentage",
    )
    .unit("%"),
    EntityDescription::sensor(
        "forecast_tariff_1",
        "Forecast tariff hour 1",
        "price_per_hour.1.electricity_price",
    )
    .unit("EUR/kWh")
    .device_class(DeviceClass::Monetary)
    .factor(MONEY),
    EntityDescription::sensor(
        "forecast_tariff_2",
        "Forecast tariff hour 2",
        "price_per_hour.2.electricity_price",
    )
    .unit("EUR/kWh")
    .device_class(DeviceClass::Monetary)
    .factor(MONEY),
    EntityDescription::sensor(
        "forecast_tariff_3",
        "Forecast tariff hour 3",
        "price_per_hour.3.electricity_price",
    )
    .unit("EUR/kWh")
    .device_class(DeviceClass::Monetary)
    .factor(MONEY),
];

pub static SUMMARY_GAS: &[EntityDescription] = &[
    // Gas prices change at 06:00 local.
    EntityDescription::sensor("current_gas_tariff", "Current gas tariff", "gas_price")
        .unit("EUR/m³")
        .device_class(DeviceClass::Monetary)
        .factor(MONEY)
        .daily_update_hour(6),
    EntityDescription::sensor("next_gas_tariff", "Next gas tariff", "gas_price_next")
        .unit("EUR/m³")
        .device_class(DeviceClass::Monetary)
        .factor(MONEY),
];

pub static PV_TOTALS: &[EntityDescription] = &[
    EntityDescription::sensor("yield_total", "Yield total", "total_power_measured")
        .unit("kWh")
        .device_class(DeviceClass::Energy)
        .factor(KILO)
        .none_as(NoneBehaviour::UsePrevious),
    EntityDescription::sensor("last_measured_value", "Last measured value", "last_measured_power_value")
        .unit("W")
        .device_class(DeviceClass::Power)
        .none_as(NoneBehaviour::Zero),
    EntityDescription::sensor("last_measured_at", "Last measured at", "last_measured_at")
        .device_class(DeviceClass::Timestamp),
];

pub static PV_INSTALL: &[EntityDescription] = &[
    EntityDescription::sensor(
        "yield_total",
        "Yield total",
        "contracts.{install_index}.meta.total_power_measured",
    )
    .unit("kWh")
    .device_class(DeviceClass::Energy)
    .factor(KILO)
    .none_as(NoneBehaviour::UsePrevious),
    EntityDescription::sensor(
        "last_measured_value",
        "Last measured value",
        "contracts.{install_index}.meta.last_measured_power_value",
    )
    .unit("W")
    .device_class(DeviceClass::Power)
    .none_as(NoneBehaviour::Zero),
    EntityDescription::sensor(
        "last_measured_at",
        "Last measured at",
        "contracts.{install_index}.meta.last_measured_at",
    )
    .device_class(DeviceClass::Timestamp),
    EntityDescription::sensor(
        "highest_measured_power_value",
        "Highest yield",
        "contracts.{install_index}.meta.highest_measured_power_value",
    )
    .unit("W")
    .device_class(DeviceClass::Power),
    EntityDescription::sensor(
        "highest_power_measured_at",
        "Highest yield at",
        "contracts.{install_index}.meta.highest_power_measured_at",
    )
    .device_class(DeviceClass::Timestamp),
];

pub static P1_ELECTRICITY_TOTALS: &[EntityDescription] = &[
    EntityDescription::sensor(
        "electricity_delivery_today",
        "Electricity delivered today",
        "measurement_groups.0.meta.delivery",
    )
    .unit("kWh")
    .device_class(DeviceClass::Energy)
    .factor(KILO)
    .last_reset("measurement_groups.0.date"),
    EntityDescription::sensor(
        "electricity_production_today",
        "Electricity returned today",
        "measurement_groups.0.meta.production",
    )
    .unit("kWh")
    .device_class(DeviceClass::Energy)
    .factor(KILO)
    .last_reset("measurement_groups.0.date"),
];

pub static P1_ELECTRICITY_INSTALL: &[EntityDescription] = &[
    EntityDescription::sensor(
        "electricity_last_measured_delivery",
        "Last measured delivery",
        "contracts.{install_index}.meta.electricity_last_measured_delivery_value",
    )
    .unit("W")
    .device_class(DeviceClass::Power)
    .none_as(NoneBehaviour::Zero),
    EntityDescription::sensor(
        "electricity_last_measured_production",
        "Last measured production",
        "contracts.{install_index}.meta.electricity_last_measured_production_value",
    )
    .unit("W")
    .device_class(DeviceClass::Power)
    .none_as(NoneBehaviour::Zero),
    EntityDescription::sensor(
        "electricity_last_measured_at",
        "Electricity last measured at",
        "contracts.{install_index}.meta.electricity_last_measured_at",
    )
    .device_class(DeviceClass::Timestamp),
    EntityDescription::sensor(
        "dsmr_version",
        "DSMR version",
        "contracts.{install_index}.meta.dsmr_version",
    ),
];

pub static P1_GAS_TOTALS: &[EntityDescription] = &[EntityDescription::sensor(
    "gas_today",
    "Gas used today",
    "measurement_groups.0.total",
)
.unit("m³")
.device_class(DeviceClass::Gas)
.factor(KILO)
.last_reset("measurement_groups.0.date")];

pub static P1_GAS_INSTALL: &[EntityDescription] = &[
    EntityDescription::sensor(
        "gas_last_measured",
        "Gas meter reading",
        "contracts.{install_index}.meta.gas_last_measured",
    )
    .unit("m³")
    .device_class(DeviceClass::Gas)
    .factor(KILO)
    .none_as(NoneBehaviour::UsePrevious),
    EntityDescription::sensor(
        "gas_last_measured_at",
        "Gas last measured at",
        "contracts.{install_index}.meta.gas_last_measured_at",
    )
    .device_class(DeviceClass::Timestamp),
];

pub static CHARGE_POINT: &[EntityDescription] = &[
    EntityDescription::sensor("status", "Charge point status", "state.state"),
    EntityDescription::sensor("power_actual", "Charging power", "state.power_actual")
        .unit("W")
        .device_class(DeviceClass::Power)
        .none_as(NoneBehaviour::Zero),
    EntityDescription::sensor(
        "session_energy",
        "Session energy",
        "charge_point_session.energy_delivered",
    )
    .unit("kWh")
    .device_class(DeviceClass::Energy)
    .factor(KILO)
    .attributes(&[Attribute {
        label: "session_start",
        path: "charge_point_session.start_time",
    }]),
    EntityDescription::sensor("plugged_in_at", "Plugged in at", "state.plugged_in_at")
        .device_class(DeviceClass::Timestamp),
    EntityDescription::binary_sensor(
        "connectivity_state",
        "Connected",
        "state.connectivity_state",
    )
    .device_class(DeviceClass::Connectivity),
    EntityDescription::binary_sensor(
        "dynamic_charging_enabled",
        "Dynamic charging",
        "state.dynamic_charging_enabled",
    ),
    EntityDescription::binary_sensor("processing", "Processing", "state.processing")
        .device_class(DeviceClass::Running),
    EntityDescription::button("start", "Start charging", ChargePointAction::StartCharge),
    EntityDescription::button("stop", "Stop charging", ChargePointAction::StopCharge),
];

pub static BATTERY: &[EntityDescription] = &[
    EntityDescription::sensor(
        "state_of_charge",
        "State of charge",
        "contracts.{install_index}.meta.state_of_charge",
    )
    .unit("%")
    .device_class(DeviceClass::Battery)
    .factor(0.1),
    EntityDescription::sensor("power_ac", "Battery power", "contracts.{install_index}.meta.power_ac")
        .unit("W")
        .device_class(DeviceClass::Power)
        .none_as(NoneBehaviour::Zero),
    EntityDescription::sensor(
        "battery_state",
        "Battery state",
        "contracts.{install_index}.meta.battery_state",
    ),
    EntityDescription::sensor(
        "battery_cycles",
        "Battery cycles",
        "contracts.{install_index}.meta.cycle_count",
    ),
    EntityDescription::sensor(
        "delivery_day",
        "Battery charged today",
        "contracts.{install_index}.meta.delivery_day",
    )
    .unit("kWh")
    .device_class(DeviceClass::Energy)
    .factor(KILO),
    EntityDescription::sensor(
        "production_day",
        "Battery discharged today",
        "contracts.{install_index}.meta.production_day",
    )
    .unit("kWh")
    .device_class(DeviceClass::Energy)
    .factor(KILO),
    EntityDescription::sensor(
        "last_measured_at",
        "Battery last measured at",
        "contracts.{install_index}.meta.last_measured_at",
    )
    .device_class(DeviceClass::Timestamp),
    EntityDescription::binary_sensor(
        "dynamic_load_balancing",
        "Dynamic load balancing",
        "contracts.{install_index}.meta.dynamic_load_balancing_enabled",
    ),
];

pub static BATTERY_CONTROL: &[EntityDescription] = &[
    EntityDescription::select("control_mode", "Battery control mode", CONTROL_MODE_PATH),
    EntityDescription::number(
        "max_desired_charge_power",
        "Maximum charge power",
        PowerLimit::Charge,
    ),
    EntityDescription::number(
        "max_desired_discharge_power",
        "Maximum discharge power",
        PowerLimit::Discharge,
    ),
    EntityDescription::binary_sensor(
        "control_mode_processing",
        "Control mode change in progress",
        "battery_control_mode.processing",
    )
    .device_class(DeviceClass::Running),
];

pub static BATTERY_CHARTS: &[EntityDescription] = &[
    EntityDescription::sensor(
        "result_this_year",
        "Result this year",
        "contracts.{install_index}.charts.this_year.total_result",
    )
    .unit("EUR")
    .device_class(DeviceClass::Monetary)
    .none_as(NoneBehaviour::UsePrevious),
    EntityDescription::sensor(
        "result_last_year",
        "Result last year",
        "contracts.{install_index}.charts.last_year.total_result",
    )
    .unit("EUR")
    .device_class(DeviceClass::Monetary)
    .none_as(NoneBehaviour::UsePrevious),
    EntityDescription::sensor(
        "result_this_month",
        "Result this month",
        "contracts.{install_index}.charts.this_month.total_result",
    )
    .unit("EUR")
    .device_class(DeviceClass::Monetary)
    .none_as(NoneBehaviour::UsePrevious)
    .attributes(&[Attribute {
        label: "days",
        path: "contracts.{install_index}.charts.this_month.days",
    }]),
    EntityDescription::sensor(
        "result_last_month",
        "Result last month",
        "contracts.{install_index}.charts.last_month.total_result",
    )
    .unit("EUR")
    .device_class(DeviceClass::Monetary)
    .none_as(NoneBehaviour::UsePrevious),
    EntityDescription::sensor(
        "delivery_this_month",
        "Charged this month",
        "contracts.{install_index}.charts.this_month.total_delivery_kwh",
    )
    .unit("kWh")
    .device_class(DeviceClass::Energy),
    EntityDescription::sensor(
        "production_this_month",
        "Discharged this month",
        "contracts.{install_index}.charts.this_month.total_production_kwh",
    )
    .unit("kWh")
    .device_class(DeviceClass::Energy),
];

pub static HOME_CONSUMPTION: &[EntityDescription] = &[
    EntityDescription::sensor(
        "home_consumption_today",
        "Home consumption today",
        "measurement_groups.0.total",
    )
    .unit("kWh")
    .device_class(DeviceClass::Energy)
    .factor(KILO),
    EntityDescription::sensor(
        "home_consumption_last_value",
        "Home consumption",
        "measurement_groups.0.measurements.-1.value",
    )
    .unit("W")
    .device_class(DeviceClass::Power)
    .none_as(NoneBehaviour::UsePrevious),
    EntityDescription::sensor(
        "home_consumption_measured_at",
        "Home consumption measured at",
        "measurement_groups.0.measurements.-1.measured_at",
    )
    .device_class(DeviceClass::Timestamp),
];
