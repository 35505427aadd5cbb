use axum::{extract::State, routing::get, Json, Router};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use utoipa::openapi::OpenApi;
use utoipa_axum::{router::OpenApiRouter, routes};

use crate::export::{ConfigReport, DiagnosticsReport, StatusReport};
use crate::station::Station;

pub fn router(station: Station) -> Router {
    let (router, api) = OpenApiRouter::<Station>::new()
        .routes(routes!(get_status))
        .routes(routes!(get_config))
        .routes(routes!(get_diagnostics))
        .split_for_parts();

    router
        .route("/apidoc/openapi.json", get(move || openapi(api.clone())))
        .with_state(station)
}

pub async fn handle_web(station: Station, shutdown: CancellationToken) -> anyhow::Result<()> {
    let web = &station.config.web;
    let listener = TcpListener::bind((web.host.as_str(), web.port)).await?;
    info!(address = %listener.local_addr()?, "status api listening");

    axum::serve(listener, router(station))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn openapi(api: OpenApi) -> Json<OpenApi> {
    Json(api)
}

#[utoipa::path(
    get,
    path = "/api/status",
    responses(
        (status = 200, description = "Relay, receiver and client status", body = StatusReport)
    )
)]
async fn get_status(State(station): State<Station>) -> Json<StatusReport> {
    Json(StatusReport::collect(&station))
}

#[utoipa::path(
    get,
    path = "/api/config",
    responses(
        (status = 200, description = "Static configuration without credentials", body = ConfigReport)
    )
)]
async fn get_config(State(station): State<Station>) -> Json<ConfigReport> {
    Json(ConfigReport::collect(&station))
}

#[utoipa::path(
    get,
    path = "/api/diagnostics",
    responses(
        (status = 200, description = "Link state, rejection counters and per-type message counts", body = DiagnosticsReport)
    )
)]
async fn get_diagnostics(State(station): State<Station>) -> Json<DiagnosticsReport> {
    Json(DiagnosticsReport::collect(&station))
}
