//! HTTP surface for the fact aggregation and KPI engine.
//!
//! One thin axum layer over `CalcEngine`: routes parse the request,
//! the engine does the work, and failures map onto problem-details
//! bodies with the status taxonomy the clients key off.

pub mod calc_routes;
pub mod kpi_routes;
pub mod request_id;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{middleware, routing::get, Json, Router};
use edgar_source::EdgarAdapter;
use fact_store::FactStore;
use fact_validation::{PlausibilityBand, ValidationRules};
use kpi_engine::{CalcEngine, KpiRegistry};
use metric_core::{EngineError, Frequency, SourceAdapter};
use rust_decimal_macros::dec;
use serde::Serialize;
use source_router::SourceRouter;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use websearch_source::WebSearchAdapter;
use yahoo_source::YahooAdapter;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CalcEngine>,
}

/// RFC 7807-style error body.
#[derive(Debug, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub kind: String,
    pub title: String,
    pub detail: String,
}

#[derive(Debug)]
pub enum ApiError {
    Engine(EngineError),
    BadRequest(String),
}

impl ApiError {
    pub fn bad_request(detail: impl Into<String>) -> Self {
        ApiError::BadRequest(detail.into())
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        ApiError::Engine(err)
    }
}

fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::AmbiguousPeriod(_) => StatusCode::CONFLICT,
        EngineError::ValidationFailed(_)
        | EngineError::InsufficientHistory(_)
        | EngineError::Undefined(_) => StatusCode::UNPROCESSABLE_ENTITY,
        EngineError::SourceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::DeadlineExceeded => StatusCode::GATEWAY_TIMEOUT,
    }
}

fn title_for(err: &EngineError) -> &'static str {
    match err {
        EngineError::NotFound(_) => "Metric or entity not found",
        EngineError::AmbiguousPeriod(_) => "Period is ambiguous",
        EngineError::ValidationFailed(_) => "No source passed validation",
        EngineError::InsufficientHistory(_) => "Not enough quarterly history",
        EngineError::Undefined(_) => "KPI is undefined for this input",
        EngineError::SourceUnavailable(_) => "All sources unavailable",
        EngineError::DeadlineExceeded => "Request deadline exceeded",
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, problem) = match self {
            ApiError::Engine(err) => (
                status_for(&err),
                ProblemDetails {
                    kind: err.kind().to_string(),
                    title: title_for(&err).to_string(),
                    detail: err.to_string(),
                },
            ),
            ApiError::BadRequest(detail) => (
                StatusCode::BAD_REQUEST,
                ProblemDetails {
                    kind: "invalid-parameter".to_string(),
                    title: "Invalid request parameter".to_string(),
                    detail,
                },
            ),
        };
        (status, Json(problem)).into_response()
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .merge(calc_routes::routes())
        .merge(kpi_routes::routes())
        .route("/health", get(health))
        .layer(middleware::from_fn(request_id::request_id_middleware))
        // The span leaves request_id empty; the middleware inside it
        // records the propagated or minted ID so log lines carry it.
        .layer(TraceLayer::new_for_http().make_span_with(|request: &Request<Body>| {
            tracing::info_span!(
                "http_request",
                method = %request.method(),
                uri = %request.uri(),
                request_id = tracing::field::Empty,
            )
        }))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Wide defaults plus the per-entity bands we ship with. Entity bands
/// are what catch an annual figure mislabeled as quarterly.
fn default_rules() -> ValidationRules {
    ValidationRules::with_defaults().with_entity_band(
        "AAPL",
        "revenue",
        Frequency::Quarterly,
        PlausibilityBand::new(dec!(20_000_000_000), dec!(120_000_000_000)),
    )
}

fn build_engine() -> anyhow::Result<CalcEngine> {
    let adapters: Vec<Arc<dyn SourceAdapter>> = vec![
        Arc::new(EdgarAdapter::new()),
        Arc::new(YahooAdapter::new()),
        Arc::new(WebSearchAdapter::from_env()),
    ];
    let router = SourceRouter::new(
        adapters,
        Arc::new(FactStore::new()),
        Arc::new(default_rules()),
    );
    let registry = KpiRegistry::standard()?;

    let deadline_secs: u64 = std::env::var("REQUEST_DEADLINE_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(15);
    Ok(CalcEngine::new(registry, Arc::new(router))
        .with_deadline(Duration::from_secs(deadline_secs)))
}

pub async fn run_server() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let json_logging = std::env::var("LOG_JSON")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let engine = build_engine()?;
    let state = AppState {
        engine: Arc::new(engine),
    };

    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(%bind_addr, "listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}
