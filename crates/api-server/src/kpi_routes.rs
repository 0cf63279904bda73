//! Registry listing endpoint.

use axum::extract::State;
use axum::{routing::get, Json, Router};
use kpi_engine::KpiListing;

use crate::AppState;

pub fn routes() -> Router<AppState> {
    Router::new().route("/v1/finance/kpis", get(list_kpis))
}

async fn list_kpis(State(state): State<AppState>) -> Json<Vec<KpiListing>> {
    Json(state.engine.list_kpis())
}
