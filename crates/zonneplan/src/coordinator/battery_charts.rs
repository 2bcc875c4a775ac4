//! Home battery result charts.
//!
//! Charts change slowly and are expensive to fetch (four requests per
//! battery), so each battery is fetched at most once per [`CHART_THROTTLE`].
//! Measurements are bucketed by civil date in Europe/Amsterdam, which is
//! how the vendor bills, not by UTC date.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Datelike;
use chrono::Days;
use chrono::NaiveDate;
use chrono::NaiveDateTime;
use chrono::TimeDelta;
use chrono::Utc;
use chrono_tz::Europe::Amsterdam;
use chrono_tz::Tz;
use serde_json::Map;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use tracing::warn;
use zonneplan_api::ApiClient;
use zonneplan_api::ApiError;
use zonneplan_api::Revalidate;
use zonneplan_api::types::ChartKind;

use super::Fetch;

pub const CHART_THROTTLE: TimeDelta = TimeDelta::hours(12);

/// Money amounts are integers in units of 10^-7 euro.
const MONEY_FACTOR: f64 = 0.000_000_1;
/// Energy amounts are integers in Wh.
const ENERGY_FACTOR: f64 = 0.001;

pub struct BatteryChartsFetch {
    api: Arc<ApiClient>,
    contract_uuids: Vec<String>,
    last_fetch: HashMap<String, DateTime<Utc>>,
}

impl BatteryChartsFetch {
    pub fn new(api: Arc<ApiClient>, contract_uuids: Vec<String>) -> Self {
        Self {
            api,
            contract_uuids,
            last_fetch: HashMap::new(),
        }
    }

    /// Fetch the four charts of one contract. A chart is only revalidated
    /// against a block that `cached` still holds.
    async fn fetch_contract(
        &self,
        contract_uuid: &str,
        today: NaiveDate,
        cached: &Map<String, Value>,
    ) -> Result<Map<String, Value>, ApiError> {
        let mut blocks = Map::new();
        for (key, kind, date) in chart_dates(today) {
            let revalidate = Revalidate::holding(cached.contains_key(key));
            let Some(chart) = self
                .api
                .battery_chart(contract_uuid, kind, date, revalidate)
                .await?
            else {
                continue;
            };
            match parse_chart(kind, &chart, date) {
                Some(block) => {
                    blocks.insert(key.to_string(), block);
                }
                None => warn!("No {} chart data for {} in {}", kind, contract_uuid, chart),
            }
        }
        Ok(blocks)
    }
}

#[async_trait]
impl Fetch for BatteryChartsFetch {
    async fn fetch(&mut self, previous: Option<Value>) -> Result<Option<Value>, ApiError> {
        let now = Utc::now();
        let today = now.with_timezone(&Amsterdam).date_naive();

        let mut fresh = HashMap::new();
        for uuid in &self.contract_uuids {
            if let Some(at) = self.last_fetch.get(uuid) {
                if now - *at < CHART_THROTTLE {
                    debug!("Battery charts for {} fetched at {}, skipping", uuid, at);
                    continue;
                }
            }

            let cached = previous_charts(previous.as_ref(), uuid);
            let blocks = self.fetch_contract(uuid, today, &cached).await?;
            fresh.insert(uuid.clone(), blocks);
        }

        if fresh.is_empty() {
            return Ok(None);
        }
        // Only a fetch the coordinator keeps starts the throttle window.
        for uuid in fresh.keys() {
            self.last_fetch.insert(uuid.clone(), now);
        }
        Ok(Some(merge_battery_charts(
            previous.as_ref(),
            &fresh,
            &self.contract_uuids,
        )))
    }
}

/// Build `{"contracts": [{"uuid", "charts"}]}` in `order`, laying fresh
/// blocks over the previous ones. A block missing from `fresh` keeps its
/// previous value, so an empty fetch never blanks a chart.
pub fn merge_battery_charts(
    previous: Option<&Value>,
    fresh: &HashMap<String, Map<String, Value>>,
    order: &[String],
) -> Value {
    let contracts: Vec<Value> = order
        .iter()
        .map(|uuid| {
            let mut charts = previous_charts(previous, uuid);
            if let Some(blocks) = fresh.get(uuid) {
                for (key, block) in blocks {
                    charts.insert(key.clone(), block.clone());
                }
            }
            json!({ "uuid": uuid, "charts": charts })
        })
        .collect();

    json!({ "contracts": contracts })
}

/// Chart blocks cached for `uuid` in a merged payload.
fn previous_charts(previous: Option<&Value>, uuid: &str) -> Map<String, Value> {
    previous
        .and_then(|p| p.get("contracts"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .find(|c| c.get("uuid").and_then(Value::as_str) == Some(uuid))
        .and_then(|c| c.get("charts"))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default()
}

/// The four charts kept per battery and the date each is requested for.
pub fn chart_dates(today: NaiveDate) -> [(&'static str, ChartKind, NaiveDate); 4] {
    let this_year = today - Days::new(u64::from(today.ordinal0()));
    let last_year_end = this_year - Days::new(1);
    let last_year = last_year_end - Days::new(u64::from(last_year_end.ordinal0()));
    let this_month = today - Days::new(u64::from(today.day0()));
    let last_month_end = this_month - Days::new(1);
    let last_month = last_month_end - Days::new(u64::from(last_month_end.day0()));

    [
        ("this_year", ChartKind::Months, this_year),
        ("last_year", ChartKind::Months, last_year),
        ("this_month", ChartKind::Days, this_month),
        ("last_month", ChartKind::Days, last_month),
    ]
}

/// Parse one chart response. `None` when it holds no group.
pub fn parse_chart(kind: ChartKind, chart: &Value, date: NaiveDate) -> Option<Value> {
    let group = chart.get(0).filter(|g| g.as_object().is_some_and(|o| !o.is_empty()))?;

    let bucket_format = match kind {
        ChartKind::Months => "%Y-%m",
        ChartKind::Days => "%Y-%m-%d",
    };

    let mut buckets = Map::new();
    for measurement in group
        .get("measurements")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
    {
        let Some(measured_at) = measurement
            .get("measured_at")
            .and_then(Value::as_str)
            .and_then(parse_measured_at)
        else {
            continue;
        };

        buckets.insert(
            measured_at.format(bucket_format).to_string(),
            json!({
                "result": scaled(measurement.get("value"), MONEY_FACTOR),
                "delivery_kwh": scaled(measurement.pointer("/meta/delivery"), ENERGY_FACTOR),
                "production_kwh": scaled(measurement.pointer("/meta/production"), ENERGY_FACTOR),
            }),
        );
    }

    let mut block = Map::new();
    match kind {
        ChartKind::Months => block.insert("year".to_string(), json!(date.year())),
        ChartKind::Days => block.insert(
            "month".to_string(),
            json!(date.format("%Y-%m").to_string()),
        ),
    };
    block.insert(
        "total_result".to_string(),
        json!(scaled(group.get("total"), MONEY_FACTOR)),
    );
    block.insert(
        "total_delivery_kwh".to_string(),
        json!(scaled(group.pointer("/meta/delivery"), ENERGY_FACTOR)),
    );
    block.insert(
        "total_production_kwh".to_string(),
        json!(scaled(group.pointer("/meta/production"), ENERGY_FACTOR)),
    );
    block.insert(kind.to_string(), Value::Object(buckets));

    Some(Value::Object(block))
}

fn scaled(value: Option<&Value>, factor: f64) -> f64 {
    value.and_then(Value::as_f64).unwrap_or(0.0) * factor
}

/// Timestamps without an offset are taken as UTC.
fn parse_measured_at(raw: &str) -> Option<DateTime<Tz>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Amsterdam));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(raw, format).ok())
        .map(|naive| naive.and_utc().with_timezone(&Amsterdam))
}
