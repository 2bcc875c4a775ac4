use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use zonneplan_api::ApiClient;
use zonneplan_api::ApiError;
use zonneplan_api::Revalidate;

use super::Fetch;

/// Fetches `connections/{c}/summary` and adds `gas_price` and
/// `gas_price_next`.
pub struct SummaryFetch {
    api: Arc<ApiClient>,
    connection_uuid: String,
}

impl SummaryFetch {
    pub fn new(api: Arc<ApiClient>, connection_uuid: &str) -> Self {
        Self {
            api,
            connection_uuid: connection_uuid.to_string(),
        }
    }
}

#[async_trait]
impl Fetch for SummaryFetch {
    async fn fetch(&mut self, previous: Option<Value>) -> Result<Option<Value>, ApiError> {
        let Some(mut summary) = self
            .api
            .connection_resource(
                &self.connection_uuid,
                "summary",
                Revalidate::holding(previous.is_some()),
            )
            .await?
        else {
            return Ok(None);
        };

        let (current, next) = gas_prices(&summary);
        if let Some(fields) = summary.as_object_mut() {
            fields.insert("gas_price".to_string(), current.unwrap_or(Value::Null));
            fields.insert("gas_price_next".to_string(), next.unwrap_or(Value::Null));
        }
        Ok(Some(summary))
    }
}

/// Current and next gas price: the first and second `price_per_hour` rows
/// that carry a `gas_price`. The table is not aligned to the current hour,
/// so no fixed offset can be used.
pub fn gas_prices(summary: &Value) -> (Option<Value>, Option<Value>) {
    let mut prices = summary
        .get("price_per_hour")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|hour| hour.get("gas_price"));

    let current = prices.next().cloned();
    let next = prices.next().cloned();
    (current, next)
}
