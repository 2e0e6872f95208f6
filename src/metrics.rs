//! Challenge metadata normalisation.
//!
//! `normalize` turns a challenge's opaque metadata blob into [`DerivedMetrics`], resolves the
//! stage that governs the current phase and computes the absolute drawdown/profit thresholds.
//! Nothing here fails: unusable metadata degrades to basic stats built from the initial balance.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::{
    models::{stages_from_value, BrokerAccount, BrokerAccountView, Challenge, ChallengeStage},
    stage::{determine_stage, ChallengeObjectives, Thresholds},
    utils::{as_epoch_ms, as_number, pct, truthy_number, DAY_MS},
};

/// Chart baseline when the broker account carries no balance.
pub const FALLBACK_BALANCE: f64 = 10_000.0;

const DERIVED_KEYS: [&str; 9] = [
    "balance",
    "equity",
    "profit",
    "profitPercent",
    "maxDrawdown",
    "maxDrawdownPercent",
    "initialBalance",
    "broker_account",
    "equityChart",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EquityPoint {
    /// Epoch milliseconds.
    pub timestamp: i64,
    pub equity: f64,
    pub balance: f64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DerivedMetrics {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub equity: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profit: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profit_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_drawdown: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_drawdown_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initial_balance: Option<f64>,
    #[serde(rename = "broker_account", skip_serializing_if = "Option::is_none")]
    pub broker_account: Option<BrokerAccountView>,
    /// Always at least two points, ordered by timestamp.
    pub equity_chart: Vec<EquityPoint>,
    /// Remaining metadata fields (trades, win rate, ...) passed through untouched.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StatsSource {
    Metadata,
    Fallback,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Normalized {
    pub source: StatsSource,
    /// `None` only on the fallback path with no known initial balance.
    pub stats: Option<DerivedMetrics>,
    pub stage: Option<ChallengeStage>,
    pub objectives: Option<ChallengeObjectives>,
    pub thresholds: Thresholds,
}

fn js_truthy(v: &JsonValue) -> bool {
    match v {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|x| x != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(_) | JsonValue::Object(_) => true,
    }
}

fn known_balance(ib: Option<f64>) -> Option<f64> {
    ib.filter(|b| *b > 0.0 && b.is_finite())
}

fn parse_metadata(raw: Option<&JsonValue>) -> Option<Map<String, JsonValue>> {
    let raw = match raw {
        Some(v) if js_truthy(v) => v,
        _ => {
            log::warn!("metrix.metadata_missing");
            return None;
        }
    };
    match raw {
        JsonValue::Object(m) => Some(m.clone()),
        JsonValue::String(s) => match serde_json::from_str::<JsonValue>(s) {
            Ok(JsonValue::Object(m)) => Some(m),
            Ok(other) => {
                log::warn!("metrix.metadata_not_object kind={}", json_kind(&other));
                None
            }
            Err(e) => {
                log::error!("metrix.metadata_parse_error err={}", e);
                None
            }
        },
        other => {
            log::warn!("metrix.metadata_not_object kind={}", json_kind(other));
            None
        }
    }
}

fn json_kind(v: &JsonValue) -> &'static str {
    match v {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}

fn parse_point(v: &JsonValue) -> Option<EquityPoint> {
    let m = v.as_object()?;
    let timestamp = ["timestamp", "time", "date"]
        .iter()
        .find_map(|k| m.get(*k).and_then(as_epoch_ms))?;
    let equity = m.get("equity").and_then(as_number);
    let balance = m.get("balance").and_then(as_number);
    let (equity, balance) = match (equity, balance) {
        (Some(e), Some(b)) => (e, b),
        (Some(e), None) => (e, e),
        (None, Some(b)) => (b, b),
        (None, None) => return None,
    };
    Some(EquityPoint {
        timestamp,
        equity,
        balance,
    })
}

/// A usable chart: at least two decodable points, stably sorted by timestamp.
fn parse_chart(v: &JsonValue) -> Option<Vec<EquityPoint>> {
    let items = v.as_array()?;
    let mut points: Vec<EquityPoint> = items.iter().filter_map(parse_point).collect();
    if points.len() < 2 {
        log::warn!(
            "metrix.equity_chart_unusable items={} points={}",
            items.len(),
            points.len()
        );
        return None;
    }
    points.sort_by_key(|p| p.timestamp);
    Some(points)
}

fn flat_chart(level: f64, now_ms: i64) -> Vec<EquityPoint> {
    vec![
        EquityPoint {
            timestamp: now_ms - DAY_MS,
            equity: level,
            balance: level,
        },
        EquityPoint {
            timestamp: now_ms,
            equity: level,
            balance: level,
        },
    ]
}

fn resolve_stage(
    phase: Option<u32>,
    stages: Option<&[ChallengeStage]>,
    initial_balance: Option<f64>,
) -> (Option<ChallengeStage>, Option<ChallengeObjectives>, Thresholds) {
    let Some(stage) = determine_stage(phase, stages) else {
        return (None, None, Thresholds::default());
    };
    let objectives = ChallengeObjectives::from_stage(&stage);
    let thresholds = Thresholds::compute(&objectives, initial_balance);
    (Some(stage), Some(objectives), thresholds)
}

/// Derive metrics for `challenge` as of `now_ms`.
pub fn normalize(challenge: &Challenge, now_ms: i64) -> Normalized {
    let initial_balance = known_balance(challenge.broker_account.as_ref().and_then(|b| b.balance));

    let Some(metadata) = parse_metadata(challenge.metadata.as_ref()) else {
        return basic_stats(challenge, now_ms);
    };

    let mut base = match metadata.get("metrics") {
        Some(JsonValue::Object(m)) => m.clone(),
        _ => metadata.clone(),
    };

    let balance = base.get("balance").and_then(as_number);
    let equity = base.get("equity").and_then(as_number);
    let balance_t = truthy_number(base.get("balance"));
    let equity_t = truthy_number(base.get("equity"));
    let baseline = initial_balance.unwrap_or(FALLBACK_BALANCE);

    let source_chart = metadata
        .get("equityChart")
        .filter(|v| js_truthy(v))
        .and_then(parse_chart)
        .or_else(|| {
            metadata
                .get("metrics")
                .and_then(|m| m.get("equityChart"))
                .filter(|v| js_truthy(v))
                .and_then(parse_chart)
        });

    let equity_chart = match (source_chart, balance_t, equity_t) {
        (Some(chart), _, _) => chart,
        (None, Some(b), Some(e)) => {
            log::warn!("metrix.equity_chart_missing synthesized=balance_equity");
            vec![
                EquityPoint {
                    timestamp: now_ms - DAY_MS,
                    equity: baseline,
                    balance: baseline,
                },
                EquityPoint {
                    timestamp: now_ms,
                    equity: e,
                    balance: b,
                },
            ]
        }
        _ => {
            log::warn!("metrix.equity_chart_missing synthesized=flat");
            flat_chart(baseline, now_ms)
        }
    };

    let broker_account = metadata
        .get("broker_account")
        .filter(|v| js_truthy(v))
        .and_then(BrokerAccount::from_value)
        .or_else(|| challenge.broker_account.clone())
        .map(|b| b.view());

    let stages = match metadata.get("challenge_stages") {
        Some(v) if js_truthy(v) => stages_from_value(v),
        _ => challenge.relation_stages.clone(),
    };
    let (stage, objectives, thresholds) =
        resolve_stage(challenge.phase, stages.as_deref(), initial_balance);

    let mut max_drawdown = base.get("maxDrawdown").and_then(as_number);
    let mut max_drawdown_percent = base.get("maxDrawdownPercent").and_then(as_number);
    if truthy_number(base.get("maxDrawdown")).is_none() {
        if let (Some(current), Some(ib)) = (balance_t.or(equity_t), initial_balance) {
            let dd = (ib - current).max(0.0);
            max_drawdown = Some(dd);
            max_drawdown_percent = Some(pct(dd, ib));
        }
    }

    let mut profit = base.get("profit").and_then(as_number);
    let mut profit_percent = base.get("profitPercent").and_then(as_number);
    if truthy_number(base.get("profit")).is_none() {
        if let (Some(b), Some(ib)) = (balance_t, initial_balance) {
            let p = b - ib;
            profit = Some(p);
            profit_percent = Some(pct(p, ib));
        }
    }

    for k in DERIVED_KEYS {
        base.remove(k);
    }

    Normalized {
        source: StatsSource::Metadata,
        stats: Some(DerivedMetrics {
            balance,
            equity,
            profit,
            profit_percent,
            max_drawdown,
            max_drawdown_percent,
            initial_balance,
            broker_account,
            equity_chart,
            extra: base,
        }),
        stage,
        objectives,
        thresholds,
    }
}

/// Stats for a challenge whose metadata is missing or unusable. Stage thresholds still come from
/// the challenge's own stage relation.
pub fn basic_stats(challenge: &Challenge, now_ms: i64) -> Normalized {
    let initial_balance = known_balance(challenge.broker_account.as_ref().and_then(|b| b.balance));

    let stats = initial_balance.map(|ib| DerivedMetrics {
        balance: Some(ib),
        equity: Some(ib),
        profit: Some(0.0),
        profit_percent: Some(0.0),
        max_drawdown: Some(0.0),
        max_drawdown_percent: Some(0.0),
        initial_balance: Some(ib),
        broker_account: challenge.broker_account.as_ref().map(|b| b.view()),
        equity_chart: flat_chart(ib, now_ms),
        extra: Map::new(),
    });

    let (stage, objectives, thresholds) = resolve_stage(
        challenge.phase,
        challenge.relation_stages.as_deref(),
        initial_balance,
    );

    Normalized {
        source: StatsSource::Fallback,
        stats,
        stage,
        objectives,
        thresholds,
    }
}
