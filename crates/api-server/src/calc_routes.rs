//! KPI calculation endpoint.

use axum::extract::{Path, Query, State};
use axum::{routing::get, Json, Router};
use chrono::NaiveDate;
use kpi_engine::{ComputeRequest, KpiResult};
use metric_core::{Frequency, PeriodRequest};
use serde::Deserialize;

use crate::{ApiError, AppState};

#[derive(Deserialize)]
pub struct CalcQuery {
    /// "latest", "YYYY-Qn" or "YYYY". Defaults to latest.
    pub period: Option<String>,
    /// "Q" or "A". Defaults to quarterly.
    pub freq: Option<String>,
    #[serde(default)]
    pub ttm: bool,
    /// Upper bound on period end, for point-in-time queries.
    pub as_of: Option<NaiveDate>,
}

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/finance/calc/:ticker/:metric", get(calc))
}

async fn calc(
    State(state): State<AppState>,
    Path((ticker, metric)): Path<(String, String)>,
    Query(query): Query<CalcQuery>,
) -> Result<Json<KpiResult>, ApiError> {
    let period = match query.period.as_deref() {
        Some(raw) => PeriodRequest::parse(raw)
            .map_err(|_| ApiError::bad_request(format!("unparseable period '{}'", raw)))?,
        None => PeriodRequest::Latest,
    };
    let frequency = match query.freq.as_deref() {
        Some(raw) => Frequency::parse(raw)
            .map_err(|_| ApiError::bad_request(format!("unknown frequency '{}', expected Q or A", raw)))?,
        None => Frequency::Quarterly,
    };

    let request = ComputeRequest {
        ticker,
        metric,
        period,
        frequency,
        ttm: query.ttm,
        as_of: query.as_of,
    };
    let result = state.engine.compute(&request).await?;
    Ok(Json(result))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{app, AppState};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{Request, StatusCode};
    use chrono::Utc;
    use fact_store::FactStore;
    use fact_validation::ValidationRules;
    use kpi_engine::{CalcEngine, KpiRegistry};
    use metric_core::{Fact, PeriodHint, PriorityTier, SourceAdapter, SourceError};
    use rust_decimal_macros::dec;
    use source_router::SourceRouter;
    use std::sync::Arc;
    use tower::ServiceExt;

    struct CannedSource {
        facts: Vec<Fact>,
    }

    #[async_trait]
    impl SourceAdapter for CannedSource {
        fn source_id(&self) -> &'static str {
            "sec-edgar"
        }

        fn priority_tier(&self) -> PriorityTier {
            PriorityTier::Regulatory
        }

        fn supports(&self, _concept: &str) -> bool {
            true
        }

        async fn fetch(
            &self,
            _ticker: &str,
            concept: &str,
            _hint: &PeriodHint,
        ) -> Result<Vec<Fact>, SourceError> {
            let matching: Vec<Fact> = self
                .facts
                .iter()
                .filter(|f| f.concept == concept)
                .cloned()
                .collect();
            if matching.is_empty() {
                return Err(SourceError::NotFound(format!("no {}", concept)));
            }
            Ok(matching)
        }
    }

    fn canned_fact(concept: &str, value: rust_decimal::Decimal) -> Fact {
        Fact {
            entity_id: "0000320193".to_string(),
            entity_name: Some("Apple Inc.".to_string()),
            concept: concept.to_string(),
            period_end: NaiveDate::from_ymd_opt(2024, 12, 28).unwrap(),
            fiscal_quarter: Some(1),
            fiscal_year: Some(2025),
            frequency: Frequency::Quarterly,
            value,
            unit: "USD".to_string(),
            source_id: "sec-edgar".to_string(),
            retrieved_at: Utc::now(),
            url: Some("https://www.sec.gov/Archives/edgar/data/320193".to_string()),
            accession: None,
            form: Some("10-Q".to_string()),
        }
    }

    fn test_app() -> axum::Router {
        let source = CannedSource {
            facts: vec![
                canned_fact("revenue", dec!(124_300_000_000)),
                canned_fact("costOfRevenue", dec!(66_025_000_000)),
            ],
        };
        let router = SourceRouter::new(
            vec![Arc::new(source)],
            Arc::new(FactStore::new()),
            Arc::new(ValidationRules::with_defaults()),
        );
        let engine = CalcEngine::new(KpiRegistry::standard().unwrap(), Arc::new(router));
        app(AppState {
            engine: Arc::new(engine),
        })
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn calc_returns_composed_result() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .uri("/v1/finance/calc/AAPL/grossMargin")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["ticker"], "AAPL");
        assert_eq!(body["metric"], "grossMargin");
        assert_eq!(body["unit"], "ratio");
        assert_eq!(body["period"], "2025-Q1");
        assert_eq!(body["confidence"], "high");
        assert_eq!(body["citations"].as_array().unwrap().len(), 1);
        assert_eq!(body["citations"][0]["source"], "sec-edgar");
        assert_eq!(body["entity"]["name"], "Apple Inc.");
    }

    #[tokio::test]
    async fn unknown_metric_is_problem_details_404() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .uri("/v1/finance/calc/AAPL/shareOfWallet")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(response).await;
        assert_eq!(body["type"], "not-found");
        assert!(body["detail"].as_str().unwrap().contains("shareOfWallet"));
    }

    #[tokio::test]
    async fn missing_input_is_unprocessable() {
        // netIncome is not served, so netMargin cannot be computed.
        let response = test_app()
            .oneshot(
                Request::builder()
                    .uri("/v1/finance/calc/AAPL/netMargin")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
        let body = body_json(response).await;
        assert_eq!(body["type"], "undefined");
    }

    #[tokio::test]
    async fn bad_period_is_rejected_up_front() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .uri("/v1/finance/calc/AAPL/revenue?period=2024-Q7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["type"], "invalid-parameter");
    }

    #[tokio::test]
    async fn responses_carry_a_request_id() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[tokio::test]
    async fn incoming_request_id_is_propagated() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .header("x-request-id", "edge-proxy-7f3a")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get("x-request-id").unwrap(),
            "edge-proxy-7f3a"
        );
    }

    #[tokio::test]
    async fn kpi_listing_names_formulas_and_inputs() {
        let response = test_app()
            .oneshot(
                Request::builder()
                    .uri("/v1/finance/kpis")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        let kpis = body.as_array().unwrap();
        let gross_margin = kpis
            .iter()
            .find(|k| k["name"] == "grossMargin")
            .expect("grossMargin listed");
        assert_eq!(gross_margin["formula"], "grossProfit / revenue");
        assert_eq!(gross_margin["inputs"][0], "grossProfit");
    }
}
