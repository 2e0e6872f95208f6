use anyhow::{Context, Result};
use serde::Serialize;

use crate::{
    backend::BackendClient,
    metrics::{normalize, DerivedMetrics, StatsSource},
    models::{merge_challenge, Certificate, Challenge, ChallengeStage, ChallengeSummary},
    stage::{
        ChallengeObjectives, ChartBand, Thresholds, DEFAULT_MAX_TOTAL_LOSS_PCT,
        DEFAULT_PROFIT_TARGET_PCT,
    },
};

/// Everything the trader's metrics page renders for one challenge.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MetrixReport {
    pub document_id: String,
    /// Username of the challenge owner.
    pub trader: Option<String>,
    pub phase: Option<u32>,
    pub initial_balance: Option<f64>,
    pub source: StatsSource,
    pub stats: Option<DerivedMetrics>,
    pub stage: Option<ChallengeStage>,
    /// `None` while no stage resolved: objectives are still loading/unknown.
    pub objectives: Option<ChallengeObjectives>,
    /// Percentages behind the gauges; 10/10 until a stage says otherwise.
    pub max_drawdown_percent: f64,
    pub profit_target_percent: f64,
    pub thresholds: Thresholds,
    pub chart_band: ChartBand,
    pub related: Vec<ChallengeSummary>,
    pub certificate: Option<Certificate>,
}

pub fn build_report(
    document_id: &str,
    trader: Option<String>,
    challenge: &Challenge,
    related: Vec<ChallengeSummary>,
    certificate: Option<Certificate>,
    now_ms: i64,
) -> MetrixReport {
    let initial_balance = challenge.broker_account.as_ref().and_then(|b| b.balance);
    let n = normalize(challenge, now_ms);
    let chart_band = ChartBand::from_thresholds(&n.thresholds, initial_balance);

    MetrixReport {
        document_id: document_id.to_string(),
        trader,
        phase: challenge.phase,
        initial_balance,
        source: n.source,
        max_drawdown_percent: n
            .objectives
            .map(|o| o.max_drawdown_percent)
            .unwrap_or(DEFAULT_MAX_TOTAL_LOSS_PCT),
        profit_target_percent: n
            .objectives
            .map(|o| o.profit_target_percent)
            .unwrap_or(DEFAULT_PROFIT_TARGET_PCT),
        stats: n.stats,
        stage: n.stage,
        objectives: n.objectives,
        thresholds: n.thresholds,
        chart_band,
        related,
        certificate,
    }
}

/// Load and derive the metrics of the caller's challenge `document_id`.
///
/// `Ok(None)` when the caller has no such challenge. A failing profile fetch is terminal; a
/// failing detail fetch degrades to the listing record.
pub async fn load_report(
    client: &BackendClient,
    token: &str,
    document_id: &str,
    now_ms: i64,
) -> Result<Option<MetrixReport>> {
    let profile = client.fetch_me(token).await.context("fetch user challenges")?;

    let Some(basic) = profile.find_challenge(document_id) else {
        log::warn!("metrix.challenge_not_found document_id={}", document_id);
        return Ok(None);
    };

    let merged = match client.fetch_challenge(token, document_id).await {
        Ok(detail) => merge_challenge(basic, &detail),
        Err(e) => {
            log::error!("metrix.detail_error document_id={} err={}", document_id, e);
            merge_challenge(basic, &serde_json::Value::Null)
        }
    };
    let challenge = Challenge::from_value(&merged);

    let related = profile
        .challenges
        .iter()
        .map(Challenge::from_value)
        .filter(|c| c.document_id.as_deref() != Some(document_id))
        .map(|c| c.summary())
        .collect();

    let report = build_report(
        document_id,
        profile.username.clone(),
        &challenge,
        related,
        profile.featured_certificate().cloned(),
        now_ms,
    );
    log::info!(
        "metrix.report document_id={} phase={:?} source={:?} stage={}",
        document_id,
        report.phase,
        report.source,
        report.stage.is_some()
    );
    Ok(Some(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        backend::fake::{FakeBackend, TOKEN},
        config::test_settings,
    };
    use serde_json::json;
    use std::sync::atomic::Ordering;

    const NOW: i64 = 1_760_000_000_000;

    async fn seeded() -> (FakeBackend, BackendClient) {
        let backend = FakeBackend::default();
        *backend.me.lock().await = json!({
            "id": 5,
            "username": "trader",
            "challenges": [
                {"id": 1, "documentId": "ch-1", "phase": 2, "result": "progress"},
                {"id": 2, "documentId": "ch-0", "phase": 1, "result": "disapproved"}
            ],
            "certificates": [{"firstName": "Ana", "tipoChallenge": "Two Step"}]
        });
        backend.challenges.lock().await.push(json!({
            "documentId": "ch-1",
            "phase": 2,
            "metadata": "{\"metrics\":{\"balance\":9500,\"equity\":9480}}",
            "broker_account": {"id": 9, "login": "880011", "password": "pw", "balance": 10000},
            "challenge_relation": {"challenge_stages": [
                {"maximumTotalLoss": 8, "profitTarget": 6},
                {"maximumTotalLoss": 10, "profitTarget": 5},
                {"maximumTotalLoss": 12, "profitTarget": 4}
            ]}
        }));
        let url = backend.spawn().await;
        let client = BackendClient::new(&test_settings(&url, "./unused.sqlite")).unwrap();
        (backend, client)
    }

    #[tokio::test]
    async fn report_for_known_challenge() {
        let (_backend, client) = seeded().await;
        let r = load_report(&client, TOKEN, "ch-1", NOW).await.unwrap().unwrap();

        assert_eq!(r.trader.as_deref(), Some("trader"));
        assert_eq!(r.phase, Some(2));
        assert_eq!(r.initial_balance, Some(10_000.0));
        assert_eq!(r.source, StatsSource::Metadata);
        // three stages, phase 2 → first stage
        assert_eq!(r.stage.as_ref().and_then(|s| s.profit_target), Some(6.0));
        assert_eq!(r.max_drawdown_percent, 8.0);
        assert_eq!(r.thresholds.drawdown_floor, Some(9_200.0));
        assert_eq!(r.chart_band.drawdown_floor, 9_200.0);

        let s = r.stats.as_ref().unwrap();
        assert_eq!(s.max_drawdown, Some(500.0));
        assert_eq!(s.equity_chart.len(), 2);

        assert_eq!(r.related.len(), 1);
        assert_eq!(r.related[0].document_id.as_deref(), Some("ch-0"));
        assert_eq!(
            r.certificate.as_ref().and_then(|c| c.challenge_type.as_deref()),
            Some("Two Step")
        );

        let text = serde_json::to_string(&r).unwrap();
        assert!(!text.contains("\"pw\""));
    }

    #[tokio::test]
    async fn unknown_document_is_none() {
        let (_backend, client) = seeded().await;
        assert!(load_report(&client, TOKEN, "nope", NOW).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn detail_failure_degrades_to_listing_record() {
        let (backend, client) = seeded().await;
        backend.fail_detail.store(true, Ordering::SeqCst);
        let r = load_report(&client, TOKEN, "ch-1", NOW).await.unwrap().unwrap();
        assert_eq!(r.source, StatsSource::Fallback);
        assert!(r.stats.is_none());
        assert!(r.stage.is_none());
        assert_eq!(r.max_drawdown_percent, 10.0);
        assert_eq!(r.chart_band.profit_ceiling, 11_000.0);
    }

    #[tokio::test]
    async fn rejected_session_is_terminal() {
        let (_backend, client) = seeded().await;
        let err = load_report(&client, "expired", "ch-1", NOW).await.unwrap_err();
        assert!(format!("{err:#}").contains("unauthorized"));
    }
}
