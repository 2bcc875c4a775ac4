use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use zonneplan_api::ApiClient;
use zonneplan_api::ApiError;
use zonneplan_api::Revalidate;

use super::Fetch;

/// Fetches one connection scoped resource as is.
pub struct ResourceFetch {
    api: Arc<ApiClient>,
    connection_uuid: String,
    suffix: String,
}

impl ResourceFetch {
    pub fn new(api: Arc<ApiClient>, connection_uuid: &str, suffix: impl Into<String>) -> Self {
        Self {
            api,
            connection_uuid: connection_uuid.to_string(),
            suffix: suffix.into(),
        }
    }

    pub fn pv(api: Arc<ApiClient>, connection_uuid: &str) -> Self {
        Self::new(api, connection_uuid, "pv-installation")
    }

    pub fn p1_electricity(api: Arc<ApiClient>, connection_uuid: &str) -> Self {
        Self::new(api, connection_uuid, "electricity-delivered")
    }

    pub fn p1_gas(api: Arc<ApiClient>, connection_uuid: &str) -> Self {
        Self::new(api, connection_uuid, "gas")
    }

    pub fn home_consumption(api: Arc<ApiClient>, connection_uuid: &str) -> Self {
        Self::new(api, connection_uuid, "electricity-home-consumption")
    }

    pub fn battery(api: Arc<ApiClient>, connection_uuid: &str, battery_uuid: &str) -> Self {
        Self::new(
            api,
            connection_uuid,
            format!("home-battery-installation/{}", battery_uuid),
        )
    }
}

#[async_trait]
impl Fetch for ResourceFetch {
    async fn fetch(&mut self, previous: Option<Value>) -> Result<Option<Value>, ApiError> {
        self.api
            .connection_resource(
                &self.connection_uuid,
                &self.suffix,
                Revalidate::holding(previous.is_some()),
            )
            .await
    }
}
