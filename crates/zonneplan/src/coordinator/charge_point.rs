use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;
use tracing::info;
use zonneplan_api::ApiClient;
use zonneplan_api::ApiError;
use zonneplan_api::Revalidate;
use zonneplan_api::path;

use super::ActionError;
use super::ActionStatus;
use super::Coordinator;
use super::CoordinatorState;
use super::Fetch;
use super::ProcessingRetry;
use super::RetryOptions;

pub const PROCESSING_PATH: &str = "state.processing";

/// Fetches `connections/{c}/charge-points/{cp}`. The payload kept is the
/// first entry of its `contracts`.
pub struct ChargePointFetch {
    api: Arc<ApiClient>,
    connection_uuid: String,
    charge_point_uuid: String,
}

impl ChargePointFetch {
    pub fn new(api: Arc<ApiClient>, connection_uuid: &str, charge_point_uuid: &str) -> Self {
        Self {
            api,
            connection_uuid: connection_uuid.to_string(),
            charge_point_uuid: charge_point_uuid.to_string(),
        }
    }
}

#[async_trait]
impl Fetch for ChargePointFetch {
    async fn fetch(&mut self, previous: Option<Value>) -> Result<Option<Value>, ApiError> {
        let resource = format!("charge-points/{}", self.charge_point_uuid);
        let Some(mut data) = self
            .api
            .connection_resource(
                &self.connection_uuid,
                &resource,
                Revalidate::holding(previous.is_some()),
            )
            .await?
        else {
            return Ok(None);
        };

        match data.get_mut("contracts").and_then(|c| c.get_mut(0)) {
            Some(contract) => Ok(Some(contract.take())),
            None => Err(ApiError::UnexpectedResponse(format!(
                "charge point {} without contracts",
                self.charge_point_uuid
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ChargePointAction {
    StartCharge,
    StopCharge,
}

impl ChargePointAction {
    /// Action verb in the API path.
    pub fn verb(&self) -> &'static str {
        match self {
            ChargePointAction::StartCharge => "start_boost",
            ChargePointAction::StopCharge => "stop_charging",
        }
    }

    fn required_state(&self) -> &'static str {
        match self {
            ChargePointAction::StartCharge => "VehicleDetected",
            ChargePointAction::StopCharge => "Charging",
        }
    }
}

/// Whether `action` can be sent given the cached charge point state.
///
/// Requires a successful last update, a connected charge point, no action in
/// flight, and the state the action applies to.
pub fn button_available(action: ChargePointAction, state: &CoordinatorState) -> bool {
    if !state.last_update_success {
        return false;
    }
    let Some(data) = state.data.as_ref() else {
        return false;
    };

    let connected = path::get(data, "state.connectivity_state").is_some_and(path::is_truthy);
    let processing = path::get(data, PROCESSING_PATH).is_some_and(path::is_truthy);
    let current = path::get(data, "state.state").and_then(Value::as_str);

    connected && !processing && current == Some(action.required_state())
}

pub struct ChargePoint {
    coordinator: Coordinator,
    api: Arc<ApiClient>,
    connection_uuid: String,
    charge_point_uuid: String,
    retry: ProcessingRetry,
}

impl ChargePoint {
    pub fn new(
        coordinator: Coordinator,
        api: Arc<ApiClient>,
        connection_uuid: &str,
        charge_point_uuid: &str,
        retry: RetryOptions,
    ) -> Self {
        Self {
            coordinator,
            api,
            connection_uuid: connection_uuid.to_string(),
            charge_point_uuid: charge_point_uuid.to_string(),
            retry: ProcessingRetry::new(PROCESSING_PATH, retry),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn uuid(&self) -> &str {
        &self.charge_point_uuid
    }

    pub async fn start_charge(&self) -> Result<(), ActionError> {
        self.run(ChargePointAction::StartCharge).await
    }

    pub async fn stop_charge(&self) -> Result<(), ActionError> {
        self.run(ChargePointAction::StopCharge).await
    }

    pub async fn run(&self, action: ChargePointAction) -> Result<(), ActionError> {
        if !button_available(action, &self.coordinator.state()) {
            return Err(ActionError::Precondition(format!(
                "{} needs charge point state {}",
                action,
                action.required_state()
            )));
        }

        let resource = format!(
            "charge-points/{}/actions/{}",
            self.charge_point_uuid,
            action.verb()
        );
        self.api
            .connection_action(&self.connection_uuid, &resource, &json!({}))
            .await?;
        info!("Sent {} to charge point {}", action, self.charge_point_uuid);

        self.coordinator.update(|data| {
            path::set(data, PROCESSING_PATH, Value::Bool(true));
        });
        self.retry.start(self.coordinator.clone());
        Ok(())
    }

    pub fn retry_status(&self) -> ActionStatus {
        self.retry.status()
    }

    pub fn shutdown(&self) {
        self.retry.cancel();
    }
}
