use chrono::DateTime;
use chrono::TimeZone;
use chrono::Utc;
use chrono_tz::Europe::Amsterdam;
use serde_json::Value;
use serde_json::json;
use tracing::debug;
use zonneplan_api::InstallIndex;
use zonneplan_api::path;

use super::DeviceClass;
use super::EntityDescription;
use super::NoneBehaviour;

/// Epoch values above this are microseconds, below it milliseconds.
const MICROSECOND_THRESHOLD: i64 = 100_000_000_000_000;

/// Last value a sensor published.
#[derive(Debug, Clone, Default)]
pub struct SensorMemory {
    pub value: Option<Value>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl SensorMemory {
    pub fn remember(&mut self, value: &Value, at: DateTime<Utc>) {
        self.value = Some(value.clone());
        self.updated_at = Some(at);
    }
}

/// Read a sensor value out of `data`.
///
/// Falsy values are returned as read; conversions only apply to values
/// that carry something. The factor is applied last, once.
pub fn resolve_value(
    description: &EntityDescription,
    install_index: InstallIndex,
    data: &Value,
) -> Option<Value> {
    let value_path = install_index.resolve(description.path);
    let mut value = path::get(data, &value_path).cloned();

    if value.is_none() && description.none_behaviour == NoneBehaviour::Zero {
        value = Some(json!(0));
    }
    let value = value?;
    if !path::is_truthy(&value) {
        return Some(value);
    }

    let value = if description.device_class == Some(DeviceClass::Timestamp) {
        to_timestamp(&value)?
    } else {
        value
    };

    match (description.value_factor, value.as_f64()) {
        (Some(factor), Some(number)) => Some(json!(number * factor)),
        _ => Some(value),
    }
}

/// Render a vendor timestamp as RFC 3339 in Europe/Amsterdam.
pub fn to_timestamp(raw: &Value) -> Option<Value> {
    let parsed = match raw {
        Value::String(s) => match DateTime::parse_from_rfc3339(s) {
            Ok(parsed) => Some(parsed.with_timezone(&Utc)),
            Err(e) => {
                debug!("Not a timestamp: {}: {}", s, e);
                None
            }
        },
        Value::Number(n) => n.as_i64().and_then(|epoch| {
            if epoch > MICROSECOND_THRESHOLD {
                DateTime::from_timestamp_micros(epoch)
            } else {
                DateTime::from_timestamp_millis(epoch)
            }
        }),
        _ => None,
    }?;
    Some(Value::String(parsed.with_timezone(&Amsterdam).to_rfc3339()))
}

/// Whether a sensor with a daily update hour must keep its current value.
///
/// Before the hour nothing changes; after it, one update per day.
pub fn skip_for_daily_update(
    description: &EntityDescription,
    memory: &SensorMemory,
    now: DateTime<Utc>,
) -> bool {
    let Some(hour) = description.daily_update_hour else {
        return false;
    };
    let (Some(value), Some(updated_at)) = (&memory.value, memory.updated_at) else {
        return false;
    };
    if !path::is_truthy(value) {
        return false;
    }

    let local_now = now.with_timezone(&Amsterdam);
    let Some(update_today) = local_now
        .date_naive()
        .and_hms_opt(hour, 0, 0)
        .and_then(|at| Amsterdam.from_local_datetime(&at).earliest())
    else {
        return false;
    };

    if update_today > local_now {
        debug!("Before {} (update today), skipping", update_today);
        return true;
    }
    if updated_at >= update_today {
        debug!("Already updated at {}, skipping", updated_at);
        return true;
    }
    false
}
