//! The coordinators of one connection and the entities reading them.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;
use zonneplan_api::ApiClient;
use zonneplan_api::InstallIndex;
use zonneplan_api::types::ConnectionContracts;
use zonneplan_api::types::ContractType;

use crate::coordinator::AuthSignal;
use crate::coordinator::Coordinator;
use crate::coordinator::CoordinatorOptions;
use crate::coordinator::Fetch;
use crate::coordinator::RetryOptions;
use crate::coordinator::battery_charts::BatteryChartsFetch;
use crate::coordinator::battery_control::BatteryControl;
use crate::coordinator::battery_control::BatteryControlFetch;
use crate::coordinator::charge_point::ChargePoint;
use crate::coordinator::charge_point::ChargePointFetch;
use crate::coordinator::resource::ResourceFetch;
use crate::coordinator::summary::SummaryFetch;
use crate::entity::Controller;
use crate::entity::Entity;
use crate::entity::EntityDescription;
use crate::entity::descriptions;

const SUMMARY_INTERVAL: Duration = Duration::from_secs(15 * 60);
const RESOURCE_INTERVAL: Duration = Duration::from_secs(5 * 60);
const CONTROL_INTERVAL: Duration = Duration::from_secs(60);
/// Charts throttle themselves per battery; this only bounds how late a
/// due fetch can happen.
const CHARTS_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Shared by every coordinator the integration creates.
#[derive(Clone)]
pub struct CoordinatorContext {
    pub api: Arc<ApiClient>,
    pub auth: AuthSignal,
    pub debounce_cooldown: Duration,
    pub retry: RetryOptions,
}

impl CoordinatorContext {
    pub fn coordinator(
        &self,
        name: String,
        interval: Duration,
        fetch: impl Fetch + 'static,
    ) -> Coordinator {
        Coordinator::new(
            CoordinatorOptions::new(name, interval).with_debounce_cooldown(self.debounce_cooldown),
            fetch,
            self.auth.clone(),
        )
    }
}

pub struct BatteryCoordinators {
    pub uuid: String,
    pub status: Coordinator,
    pub control: Arc<BatteryControl>,
}

pub struct ConnectionCoordinators {
    pub uuid: String,
    pub contracts: ConnectionContracts,
    pub summary: Option<Coordinator>,
    pub pv: Option<Coordinator>,
    pub p1_electricity: Option<Coordinator>,
    pub p1_gas: Option<Coordinator>,
    pub charge_points: Vec<Arc<ChargePoint>>,
    pub batteries: Vec<BatteryCoordinators>,
    pub battery_charts: Option<Coordinator>,
    pub home_consumption: Option<Coordinator>,
}

impl ConnectionCoordinators {
    pub fn new(ctx: &CoordinatorContext, uuid: &str, contracts: ConnectionContracts) -> Self {
        let has = |t: ContractType| !contracts.of_type(t).is_empty();
        let short = uuid.get(..8).unwrap_or(uuid);
        let api = &ctx.api;

        let summary = (has(ContractType::Electricity) || has(ContractType::Gas)).then(|| {
            let options = CoordinatorOptions::new(format!("summary {}", short), SUMMARY_INTERVAL)
                .with_debounce_cooldown(ctx.debounce_cooldown)
                .with_hourly_listener_refresh();
            Coordinator::new(options, SummaryFetch::new(api.clone(), uuid), ctx.auth.clone())
        });

        let pv = has(ContractType::PvInstallation).then(|| {
            ctx.coordinator(
                format!("pv {}", short),
                RESOURCE_INTERVAL,
                ResourceFetch::pv(api.clone(), uuid),
            )
        });

        let p1 = has(ContractType::P1Installation);
        let p1_electricity = p1.then(|| {
            ctx.coordinator(
                format!("p1 electricity {}", short),
                RESOURCE_INTERVAL,
                ResourceFetch::p1_electricity(api.clone(), uuid),
            )
        });
        let p1_gas = (p1 && has(ContractType::Gas)).then(|| {
            ctx.coordinator(
                format!("p1 gas {}", short),
                RESOURCE_INTERVAL,
                ResourceFetch::p1_gas(api.clone(), uuid),
            )
        });

        let charge_points = contracts
            .of_type(ContractType::ChargePointInstallation)
            .iter()
            .map(|cp| {
                let coordinator = ctx.coordinator(
                    format!("charge point {}", cp.label),
                    CONTROL_INTERVAL,
                    ChargePointFetch::new(api.clone(), uuid, &cp.uuid),
                );
                Arc::new(ChargePoint::new(
                    coordinator,
                    api.clone(),
                    uuid,
                    &cp.uuid,
                    ctx.retry,
                ))
            })
            .collect();

        let battery_contracts = contracts.of_type(ContractType::HomeBatteryInstallation);
        let batteries = battery_contracts
            .iter()
            .map(|battery| {
                let status = ctx.coordinator(
                    format!("battery {}", battery.label),
                    RESOURCE_INTERVAL,
                    ResourceFetch::battery(api.clone(), uuid, &battery.uuid),
                );
                let control = ctx.coordinator(
                    format!("battery control {}", battery.label),
                    CONTROL_INTERVAL,
                    BatteryControlFetch::new(api.clone(), &battery.uuid),
                );
                BatteryCoordinators {
                    uuid: battery.uuid.clone(),
                    status,
                    control: Arc::new(BatteryControl::new(
                        control,
                        api.clone(),
                        uuid,
                        &battery.uuid,
                        ctx.retry,
                    )),
                }
            })
            .collect();

        let battery_uuids: Vec<String> = battery_contracts.iter().map(|b| b.uuid.clone()).collect();
        let battery_charts = (!battery_uuids.is_empty()).then(|| {
            ctx.coordinator(
                format!("battery charts {}", short),
                CHARTS_INTERVAL,
                BatteryChartsFetch::new(api.clone(), battery_uuids),
            )
        });
        let home_consumption = battery_charts.is_some().then(|| {
            ctx.coordinator(
                format!("home consumption {}", short),
                RESOURCE_INTERVAL,
                ResourceFetch::home_consumption(api.clone(), uuid),
            )
        });

        debug!("Built coordinators for connection {}", uuid);
        Self {
            uuid: uuid.to_string(),
            contracts,
            summary,
            pv,
            p1_electricity,
            p1_gas,
            charge_points,
            batteries,
            battery_charts,
            home_consumption,
        }
    }

    /// Every entity of the connection, in a stable order.
    pub fn entities(&self) -> Vec<Entity> {
        let mut entities = Vec::new();
        let mut add = |install_uuid: &str,
                       table: &'static [EntityDescription],
                       index: InstallIndex,
                       coordinator: &Coordinator,
                       controller: &Controller| {
            for description in table {
                entities.push(Entity::new(
                    install_uuid,
                    description,
                    index,
                    coordinator.clone(),
                    controller.clone(),
                ));
            }
        };
        let none = Controller::None;

        if let Some(summary) = &self.summary {
            if !self.contracts.of_type(ContractType::Electricity).is_empty() {
                let table = descriptions::SUMMARY_ELECTRICITY;
                add(&self.uuid, table, InstallIndex::Connection, summary, &none);
            }
            if !self.contracts.of_type(ContractType::Gas).is_empty() {
                let table = descriptions::SUMMARY_GAS;
                add(&self.uuid, table, InstallIndex::Connection, summary, &none);
            }
        }

        let per_install = [
            (
                &self.pv,
                ContractType::PvInstallation,
                descriptions::PV_TOTALS,
                descriptions::PV_INSTALL,
            ),
            (
                &self.p1_electricity,
                ContractType::P1Installation,
                descriptions::P1_ELECTRICITY_TOTALS,
                descriptions::P1_ELECTRICITY_INSTALL,
            ),
            (
                &self.p1_gas,
                ContractType::P1Installation,
                descriptions::P1_GAS_TOTALS,
                descriptions::P1_GAS_INSTALL,
            ),
        ];
        for (coordinator, contract_type, totals, install) in per_install {
            let Some(coordinator) = coordinator else {
                continue;
            };
            add(&self.uuid, totals, InstallIndex::Connection, coordinator, &none);
            for (index, contract) in self.contracts.of_type(contract_type).iter().enumerate() {
                add(
                    &contract.uuid,
                    install,
                    InstallIndex::Install(index),
                    coordinator,
                    &none,
                );
            }
        }

        for cp in &self.charge_points {
            let controller = Controller::ChargePoint(cp.clone());
            add(
                cp.uuid(),
                descriptions::CHARGE_POINT,
                InstallIndex::Install(0),
                cp.coordinator(),
                &controller,
            );
        }

        for (index, battery) in self.batteries.iter().enumerate() {
            add(
                &battery.uuid,
                descriptions::BATTERY,
                InstallIndex::Install(0),
                &battery.status,
                &none,
            );
            let controller = Controller::BatteryControl(battery.control.clone());
            add(
                &battery.uuid,
                descriptions::BATTERY_CONTROL,
                InstallIndex::Connection,
                battery.control.coordinator(),
                &controller,
            );
            if let Some(charts) = &self.battery_charts {
                add(
                    &battery.uuid,
                    descriptions::BATTERY_CHARTS,
                    InstallIndex::Install(index),
                    charts,
                    &none,
                );
            }
        }

        if let Some(home_consumption) = &self.home_consumption {
            add(
                &self.uuid,
                descriptions::HOME_CONSUMPTION,
                InstallIndex::Connection,
                home_consumption,
                &none,
            );
        }

        entities
    }

    /// Contract uuids this connection was built for.
    pub fn contract_uuids(&self) -> Vec<&str> {
        self.contracts
            .contracts
            .values()
            .flatten()
            .map(|c| c.uuid.as_str())
            .collect()
    }

    pub fn shutdown(&self) {
        let plain = [
            &self.summary,
            &self.pv,
            &self.p1_electricity,
            &self.p1_gas,
            &self.battery_charts,
            &self.home_consumption,
        ];
        for coordinator in plain.into_iter().flatten() {
            coordinator.shutdown();
        }
        for cp in &self.charge_points {
            cp.shutdown();
            cp.coordinator().shutdown();
        }
        for battery in &self.batteries {
            battery.status.shutdown();
            battery.control.shutdown();
            battery.control.coordinator().shutdown();
        }
    }
}
