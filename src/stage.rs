use serde::{Deserialize, Serialize};

use crate::models::ChallengeStage;

pub const DEFAULT_MAX_TOTAL_LOSS_PCT: f64 = 10.0;
pub const DEFAULT_PROFIT_TARGET_PCT: f64 = 10.0;
pub const DEFAULT_MAX_DAILY_LOSS_PCT: f64 = 5.0;
pub const DEFAULT_MIN_TRADING_DAYS: f64 = 0.0;

/// Index of the stage that governs `phase` when the challenge has `stage_count` stages.
///
/// Challenges with 2 or 3 stages run a compressed funnel: phases 2 and 3 both map to the first
/// stage, while phase 1 and phases 4+ use the general `min(phase - 1, n - 1)` rule. The asymmetry
/// is a product rule and must not be normalised away.
pub fn stage_index(phase: u32, stage_count: usize) -> Option<usize> {
    if stage_count == 0 {
        return None;
    }
    let general = (phase as usize).checked_sub(1)?.min(stage_count - 1);
    match (stage_count, phase) {
        (2 | 3, 2 | 3) => Some(0),
        _ => Some(general),
    }
}

/// The stage applicable to `phase`, or `None` when there are no stages (or no usable phase).
pub fn determine_stage(phase: Option<u32>, stages: Option<&[ChallengeStage]>) -> Option<ChallengeStage> {
    let stages = match stages {
        Some(s) if !s.is_empty() => s,
        _ => {
            log::warn!("stage.none reason=no_stages");
            return None;
        }
    };
    let Some(phase) = phase else {
        log::warn!("stage.none reason=no_phase stages={}", stages.len());
        return None;
    };
    let idx = stage_index(phase, stages.len())?;
    log::debug!("stage.resolved phase={} stages={} index={}", phase, stages.len(), idx);
    stages.get(idx).cloned()
}

fn nonzero_or(v: Option<f64>, default: f64) -> f64 {
    v.filter(|x| *x != 0.0 && x.is_finite()).unwrap_or(default)
}

/// Limits of a stage with defaults applied. A zero or missing value takes the default.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeObjectives {
    pub minimum_trading_days: f64,
    pub maximum_daily_loss_percent: f64,
    pub max_drawdown_percent: f64,
    pub profit_target_percent: f64,
}

impl ChallengeObjectives {
    pub fn from_stage(stage: &ChallengeStage) -> Self {
        Self {
            minimum_trading_days: nonzero_or(stage.minimum_trading_days, DEFAULT_MIN_TRADING_DAYS),
            maximum_daily_loss_percent: nonzero_or(stage.maximum_daily_loss, DEFAULT_MAX_DAILY_LOSS_PCT),
            max_drawdown_percent: nonzero_or(stage.maximum_total_loss, DEFAULT_MAX_TOTAL_LOSS_PCT),
            profit_target_percent: nonzero_or(stage.profit_target, DEFAULT_PROFIT_TARGET_PCT),
        }
    }
}

/// Absolute monetary thresholds. Unset means "pending": no stage or no known initial balance.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Thresholds {
    pub drawdown_floor: Option<f64>,
    pub profit_ceiling: Option<f64>,
}

impl Thresholds {
    pub fn compute(objectives: &ChallengeObjectives, initial_balance: Option<f64>) -> Self {
        let Some(ib) = initial_balance.filter(|b| *b > 0.0) else {
            return Self::default();
        };
        Self {
            drawdown_floor: Some(ib - (objectives.max_drawdown_percent / 100.0) * ib),
            profit_ceiling: Some(ib + (objectives.profit_target_percent / 100.0) * ib),
        }
    }
}

/// Lines drawn on the equity chart. Falls back to a ±10% band when a threshold is unknown.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChartBand {
    pub drawdown_floor: f64,
    pub profit_ceiling: f64,
}

impl ChartBand {
    pub fn from_thresholds(t: &Thresholds, initial_balance: Option<f64>) -> Self {
        let ib = initial_balance.filter(|b| *b > 0.0);
        Self {
            drawdown_floor: t
                .drawdown_floor
                .unwrap_or_else(|| ib.map(|b| b * 0.9).unwrap_or(9_000.0)),
            profit_ceiling: t
                .profit_ceiling
                .unwrap_or_else(|| ib.map(|b| b * 1.1).unwrap_or(11_000.0)),
        }
    }
}
