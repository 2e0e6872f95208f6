use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

pub const DAY_MS: i64 = 86_400_000;

pub fn now_ts() -> f64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_secs_f64()
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// `part` as a percentage of `whole`; 0 when `whole` is 0.
pub fn pct(part: f64, whole: f64) -> f64 {
    if whole == 0.0 {
        return 0.0;
    }
    (part / whole) * 100.0
}

/// Numeric view of a JSON value. Numeric strings count, everything else is `None`.
pub fn as_number(v: &JsonValue) -> Option<f64> {
    match v {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|x| x.is_finite())
}

/// A number that is present and non-zero (JS truthiness for numeric fields).
pub fn truthy_number(v: Option<&JsonValue>) -> Option<f64> {
    v.and_then(as_number).filter(|x| *x != 0.0)
}

/// Epoch milliseconds from a number or an RFC 3339 string.
pub fn as_epoch_ms(v: &JsonValue) -> Option<i64> {
    match v {
        JsonValue::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        JsonValue::String(s) => {
            let s = s.trim();
            if let Ok(ms) = s.parse::<i64>() {
                return Some(ms);
            }
            DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|d| d.with_timezone(&Utc).timestamp_millis())
        }
        _ => None,
    }
}
