//! Home battery control modes.
//!
//! The battery runs in exactly one of three modes. Switching is done with
//! separate enable/disable actions, so a switch can take up to two POSTs.
//! Disables are sent before the enable. Steps that already succeeded are
//! not rolled back when a later one fails; the error names them and a
//! refresh is requested so the cache catches up with the backend.

use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use serde_json::json;
use tracing::info;
use tracing::warn;
use zonneplan_api::ApiClient;
use zonneplan_api::ApiError;
use zonneplan_api::Revalidate;
use zonneplan_api::path;

use super::ActionError;
use super::ActionStatus;
use super::Coordinator;
use super::Fetch;
use super::ProcessingRetry;
use super::RetryOptions;

pub const PROCESSING_PATH: &str = "battery_control_mode.processing";
pub const CONTROL_MODE_PATH: &str = "battery_control_mode.control_mode";
pub const MODES_PATH: &str = "battery_control_mode.modes";

const DEFAULT_MIN_WATTS: f64 = 0.0;
const DEFAULT_MAX_WATTS: f64 = 2000.0;

/// Fetches the control mode and the home optimization settings and merges
/// them into `{battery_control_mode, battery_home_optimization}`.
pub struct BatteryControlFetch {
    api: Arc<ApiClient>,
    battery_uuid: String,
}

impl BatteryControlFetch {
    pub fn new(api: Arc<ApiClient>, battery_uuid: &str) -> Self {
        Self {
            api,
            battery_uuid: battery_uuid.to_string(),
        }
    }
}

#[async_trait]
impl Fetch for BatteryControlFetch {
    async fn fetch(&mut self, previous: Option<Value>) -> Result<Option<Value>, ApiError> {
        // Each half is revalidated only against a copy of it we still hold.
        let holds = |key: &str| previous.as_ref().and_then(|p| p.get(key)).is_some();
        let control_mode = self
            .api
            .battery_control_mode(
                &self.battery_uuid,
                Revalidate::holding(holds("battery_control_mode")),
            )
            .await?;
        let home_optimization = self
            .api
            .battery_home_optimization(
                &self.battery_uuid,
                Revalidate::holding(holds("battery_home_optimization")),
            )
            .await?;

        if control_mode.is_none() && home_optimization.is_none() {
            return Ok(None);
        }

        let mut data = match previous {
            Some(Value::Object(fields)) => fields,
            _ => serde_json::Map::new(),
        };
        if let Some(control_mode) = control_mode {
            data.insert("battery_control_mode".to_string(), control_mode);
        }
        if let Some(home_optimization) = home_optimization {
            data.insert("battery_home_optimization".to_string(), home_optimization);
        }
        Ok(Some(Value::Object(data)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum BatteryMode {
    SelfConsumption,
    DynamicCharging,
    HomeOptimization,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum BatteryAction {
    EnableSelfConsumption,
    DisableSelfConsumption,
    EnableHomeOptimization,
    DisableHomeOptimization,
}

/// Desired power limit used by home optimization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum PowerLimit {
    Charge,
    Discharge,
}

impl PowerLimit {
    /// Where the limit lives in the cached payload.
    pub const fn path(&self) -> &'static str {
        match self {
            PowerLimit::Charge => "battery_home_optimization.max_desired_charge_power_watts",
            PowerLimit::Discharge => "battery_home_optimization.max_desired_discharge_power_watts",
        }
    }

    /// Field name in action requests and responses.
    pub fn request_field(&self) -> &'static str {
        match self {
            PowerLimit::Charge => "max_desired_charge_power_w",
            PowerLimit::Discharge => "max_desired_discharge_power_w",
        }
    }

    /// Allowed range, read from the `_limits` sibling of the value.
    pub fn range(&self, data: &Value) -> (f64, f64) {
        let limits = self.path().replace("_watts", "_limits");
        let bound = |key: &str, default: f64| {
            path::get(data, &format!("{}.{}", limits, key))
                .and_then(Value::as_f64)
                .filter(|v| *v != 0.0)
                .unwrap_or(default)
        };
        (
            bound("min_watts", DEFAULT_MIN_WATTS),
            bound("max_watts", DEFAULT_MAX_WATTS),
        )
    }
}

pub fn is_mode_enabled(data: &Value, mode: BatteryMode) -> bool {
    path::get(data, &format!("{}.{}.enabled", MODES_PATH, mode)).is_some_and(path::is_truthy)
}

/// Modes the backend reports as available, sorted by name.
pub fn available_modes(data: &Value) -> Vec<String> {
    path::get(data, MODES_PATH)
        .and_then(Value::as_object)
        .map(|modes| {
            modes
                .iter()
                .filter(|(_, mode)| mode.get("available").is_some_and(path::is_truthy))
                .map(|(name, _)| name.clone())
                .collect()
        })
        .unwrap_or_default()
}

pub struct BatteryControl {
    coordinator: Coordinator,
    api: Arc<ApiClient>,
    connection_uuid: String,
    battery_uuid: String,
    retry: ProcessingRetry,
}

impl BatteryControl {
    pub fn new(
        coordinator: Coordinator,
        api: Arc<ApiClient>,
        connection_uuid: &str,
        battery_uuid: &str,
        retry: RetryOptions,
    ) -> Self {
        Self {
            coordinator,
            api,
            connection_uuid: connection_uuid.to_string(),
            battery_uuid: battery_uuid.to_string(),
            retry: ProcessingRetry::new(PROCESSING_PATH, retry),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn retry_status(&self) -> ActionStatus {
        self.retry.status()
    }

    pub fn shutdown(&self) {
        self.retry.cancel();
    }

    pub async fn select_mode(&self, option: &str) -> Result<(), ActionError> {
        let mode = BatteryMode::from_str(option)
            .map_err(|_| ActionError::UnknownOption(option.to_string()))?;
        match mode {
            BatteryMode::SelfConsumption => self.enable_self_consumption().await,
            BatteryMode::DynamicCharging => self.enable_dynamic_charging().await,
            BatteryMode::HomeOptimization => self.enable_home_optimization().await,
        }
    }

    pub async fn enable_self_consumption(&self) -> Result<(), ActionError> {
        let data = self.cached()?;

        let mut steps = Vec::new();
        if is_mode_enabled(&data, BatteryMode::HomeOptimization) {
            steps.push((BatteryAction::DisableHomeOptimization, json!({})));
        }
        steps.push((BatteryAction::EnableSelfConsumption, json!({})));

        self.run_steps(&steps).await?;
        self.mark_processing();
        Ok(())
    }

    /// Dynamic charging is what the battery does when neither of the other
    /// modes is enabled.
    pub async fn enable_dynamic_charging(&self) -> Result<(), ActionError> {
        let data = self.cached()?;

        let mut steps = Vec::new();
        if is_mode_enabled(&data, BatteryMode::HomeOptimization) {
            steps.push((BatteryAction::DisableHomeOptimization, json!({})));
        }
        if is_mode_enabled(&data, BatteryMode::SelfConsumption) {
            steps.push((BatteryAction::DisableSelfConsumption, json!({})));
        }
        if steps.is_empty() {
            info!("Battery {} already in dynamic charging", self.battery_uuid);
            return Ok(());
        }

        self.run_steps(&steps).await?;
        self.mark_processing();
        Ok(())
    }

    /// Both desired power limits are sent, or neither.
    pub async fn enable_home_optimization(&self) -> Result<(), ActionError> {
        self.enable_home_optimization_with(None).await
    }

    /// Re-enable home optimization with a new power limit. The cache only
    /// takes the new limit once the backend has accepted it.
    pub async fn set_power_limit(&self, limit: PowerLimit, watts: f64) -> Result<(), ActionError> {
        if !watts.is_finite() {
            return Err(ActionError::Precondition(format!(
                "{} power limit must be a finite number of watts, got {}",
                limit, watts
            )));
        }
        // Whole watts only.
        let watts = watts.trunc() as i64;
        self.enable_home_optimization_with(Some((limit, json!(watts))))
            .await
    }

    async fn enable_home_optimization_with(
        &self,
        requested: Option<(PowerLimit, Value)>,
    ) -> Result<(), ActionError> {
        let data = self.cached()?;
        if requested.is_some() && path::get(&data, "battery_home_optimization").is_none() {
            return Err(ActionError::MissingData(
                "battery_home_optimization".to_string(),
            ));
        }

        let limit_value = |limit: PowerLimit| match &requested {
            Some((requested, watts)) if *requested == limit => Some(watts.clone()),
            _ => path::get(&data, limit.path()).cloned(),
        };
        let params = match (limit_value(PowerLimit::Charge), limit_value(PowerLimit::Discharge)) {
            (Some(charge), Some(discharge)) => json!({
                "max_desired_charge_power_w": charge,
                "max_desired_discharge_power_w": discharge,
            }),
            (None, None) => json!({}),
            (charge, discharge) => {
                return Err(ActionError::Precondition(format!(
                    "home optimization needs both power limits or neither (charge={:?}, discharge={:?})",
                    charge, discharge
                )));
            }
        };

        let mut steps = Vec::new();
        if is_mode_enabled(&data, BatteryMode::SelfConsumption) {
            steps.push((BatteryAction::DisableSelfConsumption, json!({})));
        }
        steps.push((BatteryAction::EnableHomeOptimization, params));

        let response = self.run_steps(&steps).await?;

        // The backend clamps the limits; keep what it actually applied.
        for limit in [PowerLimit::Charge, PowerLimit::Discharge] {
            let applied = response
                .as_ref()
                .and_then(|response| response.get(limit.request_field()))
                .cloned()
                .or_else(|| match &requested {
                    Some((requested, watts)) if *requested == limit => Some(watts.clone()),
                    _ => None,
                });
            if let Some(applied) = applied {
                self.coordinator.set_value(limit.path(), applied);
            }
        }
        self.mark_processing();
        Ok(())
    }

    fn cached(&self) -> Result<Value, ActionError> {
        self.coordinator
            .data()
            .ok_or_else(|| ActionError::MissingData(self.coordinator.name().to_string()))
    }

    async fn post(&self, action: BatteryAction, params: &Value) -> Result<Value, ApiError> {
        let resource = format!(
            "home-battery-installation/{}/actions/{}",
            self.battery_uuid, action
        );
        self.api
            .connection_action(&self.connection_uuid, &resource, params)
            .await
    }

    /// Run the steps in order. Returns the response of the last one.
    async fn run_steps(&self, steps: &[(BatteryAction, Value)]) -> Result<Option<Value>, ActionError> {
        let mut completed: Vec<String> = Vec::new();
        let mut last = None;

        for (action, params) in steps {
            match self.post(*action, params).await {
                Ok(response) => {
                    info!("Battery {}: {} done", self.battery_uuid, action);
                    completed.push(action.to_string());
                    last = Some(response);
                }
                Err(source) if completed.is_empty() => return Err(ActionError::Api(source)),
                Err(source) => {
                    warn!(
                        "Battery {}: {} failed after {:?}: {}",
                        self.battery_uuid, action, completed, source
                    );
                    self.coordinator.request_refresh();
                    return Err(ActionError::Partial {
                        completed,
                        failed: action.to_string(),
                        source,
                    });
                }
            }
        }

        Ok(last)
    }

    fn mark_processing(&self) {
        self.coordinator.update(|data| {
            path::set(data, PROCESSING_PATH, Value::Bool(true));
        });
        self.retry.start(self.coordinator.clone());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Utc;
    use mockito::Matcher;
    use mockito::Server;
    use zonneplan_api::ClientConfig;
    use zonneplan_api::Token;

    use super::*;
    use crate::coordinator::AuthSignal;
    use crate::coordinator::CoordinatorOptions;
    use crate::coordinator::tests::Scripted;

    const ACTIONS: &str = "/connections/c1/home-battery-installation/b1/actions";

    fn api(server: &Server) -> Arc<ApiClient> {
        let config = ClientConfig {
            base_url: server.url(),
            timeout: Duration::from_secs(5),
        };
        let token = Token {
            access_token: "t".to_string(),
            refresh_token: "r".to_string(),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        };
        Arc::new(ApiClient::new(&config, Some(token), None).unwrap())
    }

    fn payload(enabled: &str, home_optimization: Value) -> Value {
        json!({
            "battery_control_mode": {
                "control_mode": enabled,
                "modes": {
                    "self_consumption": {"available": true, "enabled": enabled == "self_consumption"},
                    "dynamic_charging": {"available": true, "enabled": enabled == "dynamic_charging"},
                    "home_optimization": {"available": false, "enabled": enabled == "home_optimization"}
                }
            },
            "battery_home_optimization": home_optimization
        })
    }

    async fn control(server: &Server, data: Value) -> BatteryControl {
        let coordinator = Coordinator::new(
            CoordinatorOptions::new("battery_control", Duration::from_secs(60)),
            Scripted::new(vec![Ok(Some(data))]),
            AuthSignal::new(),
        );
        coordinator.refresh().await.unwrap();
        BatteryControl::new(coordinator, api(server), "c1", "b1", RetryOptions::default())
    }

    #[test]
    fn test_modes_and_ranges() {
        let data = payload(
            "home_optimization",
            json!({
                "max_desired_charge_power_watts": 1500,
                "max_desired_charge_power_limits": {"min_watts": 100, "max_watts": 3000}
            }),
        );

        assert!(is_mode_enabled(&data, BatteryMode::HomeOptimization));
        assert!(!is_mode_enabled(&data, BatteryMode::SelfConsumption));
        assert_eq!(available_modes(&data), vec!["dynamic_charging", "self_consumption"]);
        assert_eq!(PowerLimit::Charge.range(&data), (100.0, 3000.0));
        assert_eq!(PowerLimit::Discharge.range(&data), (0.0, 2000.0));
    }

    #[tokio::test]
    async fn test_fetch_merges_into_previous() {
        let mut server = Server::new_async().await;
        let _mode = server
            .mock("GET", "/api/contracts/b1/home-battery/control-mode")
            .with_status(200)
            .with_body(json!({"data": {"control_mode": "self_consumption"}}).to_string())
            .create_async()
            .await;
        let _optimization = server
            .mock("GET", "/api/contracts/b1/home-battery/control-mode/home_optimization")
            .with_status(304)
            .create_async()
            .await;

        let mut fetch = BatteryControlFetch::new(api(&server), "b1");
        let previous = json!({
            "battery_control_mode": {"control_mode": "dynamic_charging", "processing": true},
            "battery_home_optimization": {"max_desired_charge_power_watts": 800}
        });

        let merged = fetch.fetch(Some(previous)).await.unwrap().unwrap();
        assert_eq!(
            merged,
            json!({
                "battery_control_mode": {"control_mode": "self_consumption"},
                "battery_home_optimization": {"max_desired_charge_power_watts": 800}
            })
        );
    }

    #[tokio::test]
    async fn test_failed_half_does_not_strand_the_other() {
        let mut server = Server::new_async().await;
        let mode = server
            .mock("GET", "/api/contracts/b1/home-battery/control-mode")
            .match_header("if-none-match", Matcher::Missing)
            .with_status(200)
            .with_header("etag", "\"v1\"")
            .with_body(
                json!({"data": {"control_mode": "self_consumption", "modes": {}}}).to_string(),
            )
            .expect(2)
            .create_async()
            .await;
        let _mode_unchanged = server
            .mock("GET", "/api/contracts/b1/home-battery/control-mode")
            .match_header("if-none-match", "\"v1\"")
            .with_status(304)
            .create_async()
            .await;
        let _optimization_down = server
            .mock("GET", "/api/contracts/b1/home-battery/control-mode/home_optimization")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;
        let _optimization = server
            .mock("GET", "/api/contracts/b1/home-battery/control-mode/home_optimization")
            .with_status(200)
            .with_body(json!({"data": {"max_desired_charge_power_watts": 800}}).to_string())
            .create_async()
            .await;

        let coordinator = Coordinator::new(
            CoordinatorOptions::new("battery_control", Duration::from_secs(60)),
            BatteryControlFetch::new(api(&server), "b1"),
            AuthSignal::new(),
        );

        assert!(coordinator.refresh().await.is_err());
        for _ in 0..3 {
            coordinator.refresh().await.unwrap();
        }

        assert_eq!(
            coordinator.get_value(CONTROL_MODE_PATH),
            Some(json!("self_consumption"))
        );
        assert_eq!(
            coordinator.get_value(PowerLimit::Charge.path()),
            Some(json!(800))
        );
        mode.assert_async().await;
    }

    #[tokio::test]
    async fn test_self_consumption_disables_home_optimization_first() {
        let mut server = Server::new_async().await;
        let disable = server
            .mock("POST", format!("{}/disable_home_optimization", ACTIONS).as_str())
            .with_status(204)
            .expect(1)
            .create_async()
            .await;
        let enable = server
            .mock("POST", format!("{}/enable_self_consumption", ACTIONS).as_str())
            .with_status(204)
            .expect(1)
            .create_async()
            .await;

        let control = control(&server, payload("home_optimization", json!({}))).await;
        control.select_mode("self_consumption").await.unwrap();

        disable.assert_async().await;
        enable.assert_async().await;
        assert_eq!(
            control.coordinator().get_value(PROCESSING_PATH),
            Some(Value::Bool(true))
        );
        assert_eq!(control.retry_status(), ActionStatus::Pending);
        control.shutdown();
    }

    #[tokio::test]
    async fn test_dynamic_charging_only_disables() {
        let mut server = Server::new_async().await;
        let disable = server
            .mock("POST", format!("{}/disable_self_consumption", ACTIONS).as_str())
            .with_status(204)
            .expect(1)
            .create_async()
            .await;
        let other = server
            .mock("POST", Matcher::Regex("enable_|disable_home".to_string()))
            .expect(0)
            .create_async()
            .await;

        let control = control(&server, payload("self_consumption", json!({}))).await;
        control.enable_dynamic_charging().await.unwrap();

        disable.assert_async().await;
        other.assert_async().await;
        control.shutdown();
    }

    #[tokio::test]
    async fn test_home_optimization_needs_both_limits() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let control = control(
            &server,
            payload(
                "dynamic_charging",
                json!({"max_desired_charge_power_watts": 1000}),
            ),
        )
        .await;

        let err = control.enable_home_optimization().await.unwrap_err();
        assert!(matches!(err, ActionError::Precondition(_)));
        assert_eq!(control.coordinator().get_value(PROCESSING_PATH), None);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_home_optimization_keeps_clamped_limits() {
        let mut server = Server::new_async().await;
        let enable = server
            .mock("POST", format!("{}/enable_home_optimization", ACTIONS).as_str())
            .match_body(Matcher::Json(json!({
                "max_desired_charge_power_w": 5000,
                "max_desired_discharge_power_w": 1000
            })))
            .with_status(200)
            .with_body(
                json!({"max_desired_charge_power_w": 2500, "max_desired_discharge_power_w": 1000})
                    .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let control = control(
            &server,
            payload(
                "dynamic_charging",
                json!({
                    "max_desired_charge_power_watts": 800,
                    "max_desired_discharge_power_watts": 1000
                }),
            ),
        )
        .await;

        control.set_power_limit(PowerLimit::Charge, 5000.7).await.unwrap();

        enable.assert_async().await;
        assert_eq!(
            control.coordinator().get_value(PowerLimit::Charge.path()),
            Some(json!(2500))
        );
        control.shutdown();
    }

    #[tokio::test]
    async fn test_rejected_power_limit_is_not_cached() {
        let mut server = Server::new_async().await;
        let enable = server
            .mock("POST", format!("{}/enable_home_optimization", ACTIONS).as_str())
            .match_body(Matcher::Json(json!({
                "max_desired_charge_power_w": 1500,
                "max_desired_discharge_power_w": 1000
            })))
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        let control = control(
            &server,
            payload(
                "dynamic_charging",
                json!({
                    "max_desired_charge_power_watts": 800,
                    "max_desired_discharge_power_watts": 1000
                }),
            ),
        )
        .await;

        let err = control
            .set_power_limit(PowerLimit::Charge, 1500.0)
            .await
            .unwrap_err();

        assert!(matches!(err, ActionError::Api(_)));
        enable.assert_async().await;
        assert_eq!(
            control.coordinator().get_value(PowerLimit::Charge.path()),
            Some(json!(800))
        );
        assert_eq!(control.coordinator().get_value(PROCESSING_PATH), None);
    }

    #[tokio::test]
    async fn test_power_limit_must_be_finite() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("POST", Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let control = control(
            &server,
            payload(
                "dynamic_charging",
                json!({
                    "max_desired_charge_power_watts": 800,
                    "max_desired_discharge_power_watts": 1000
                }),
            ),
        )
        .await;

        for watts in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
            let err = control
                .set_power_limit(PowerLimit::Discharge, watts)
                .await
                .unwrap_err();
            assert!(matches!(err, ActionError::Precondition(_)), "{}", watts);
        }
        assert_eq!(
            control.coordinator().get_value(PowerLimit::Discharge.path()),
            Some(json!(1000))
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_power_limit_needs_home_optimization_data() {
        let server = Server::new_async().await;
        let control = control(&server, json!({"battery_control_mode": {"modes": {}}})).await;

        let err = control
            .set_power_limit(PowerLimit::Charge, 1000.0)
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::MissingData(_)));
    }

    #[tokio::test]
    async fn test_partial_failure_is_reported() {
        let mut server = Server::new_async().await;
        let _disable = server
            .mock("POST", format!("{}/disable_self_consumption", ACTIONS).as_str())
            .with_status(204)
            .create_async()
            .await;
        let _enable = server
            .mock("POST", format!("{}/enable_home_optimization", ACTIONS).as_str())
            .with_status(500)
            .create_async()
            .await;

        let control = control(&server, payload("self_consumption", json!({}))).await;
        let err = control.enable_home_optimization().await.unwrap_err();

        match err {
            ActionError::Partial {
                completed, failed, ..
            } => {
                assert_eq!(completed, vec!["disable_self_consumption"]);
                assert_eq!(failed, "enable_home_optimization");
            }
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(control.coordinator().get_value(PROCESSING_PATH), None);
        assert_eq!(control.retry_status(), ActionStatus::Idle);
    }

    #[tokio::test]
    async fn test_first_step_failure_is_plain_api_error() {
        let mut server = Server::new_async().await;
        let _enable = server
            .mock("POST", format!("{}/enable_self_consumption", ACTIONS).as_str())
            .with_status(503)
            .create_async()
            .await;

        let control = control(&server, payload("dynamic_charging", json!({}))).await;
        let err = control.enable_self_consumption().await.unwrap_err();

        assert!(matches!(err, ActionError::Api(_)));
    }

    #[tokio::test]
    async fn test_unknown_option() {
        let server = Server::new_async().await;
        let control = control(&server, payload("dynamic_charging", json!({}))).await;

        let err = control.select_mode("turbo").await.unwrap_err();
        assert!(matches!(err, ActionError::UnknownOption(option) if option == "turbo"));
    }
}
