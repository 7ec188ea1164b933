use actix_web::{web, HttpResponse, Responder};

use crate::error::{ErrorBody, ErrorKind, ProcmanError};
use crate::models::{ControlAction, FleetConfig, StatusReport};
use crate::services::IngestOutcome;
use crate::state::SheriffState;

pub async fn list_deputies(data: web::Data<SheriffState>) -> impl Responder {
    HttpResponse::Ok().json(data.deputies().await)
}

pub async fn list_processes(data: web::Data<SheriffState>) -> impl Responder {
    HttpResponse::Ok().json(data.processes().await)
}

/// `POST /api/process/{name}/{action}`
pub async fn dispatch(
    data: web::Data<SheriffState>,
    path: web::Path<(String, String)>,
) -> Result<HttpResponse, ProcmanError> {
    let (name, action) = path.into_inner();
    let action: ControlAction = action.parse().map_err(ProcmanError::Validation)?;
    let ack = data.dispatch(&name, action).await?;
    Ok(HttpResponse::Ok().json(ack))
}

pub async fn apply_config(
    data: web::Data<SheriffState>,
    req: web::Json<FleetConfig>,
) -> Result<HttpResponse, ProcmanError> {
    let report = data.get_ref().reload(req.into_inner()).await?;
    Ok(HttpResponse::Ok().json(report))
}

pub async fn reload_config(data: web::Data<SheriffState>) -> Result<HttpResponse, ProcmanError> {
    let report = data.get_ref().reload_from_file().await?;
    Ok(HttpResponse::Ok().json(report))
}

/// Push-mode report ingestion
pub async fn ingest_report(
    data: web::Data<SheriffState>,
    req: web::Json<StatusReport>,
) -> impl Responder {
    let report = req.into_inner();
    let address = report.host.clone();

    match data.get_ref().ingest_report(&address, report).await {
        IngestOutcome::Accepted { .. } => HttpResponse::Ok().json(serde_json::json!({
            "accepted": true
        })),
        IngestOutcome::Stale => HttpResponse::Ok().json(serde_json::json!({
            "accepted": false
        })),
        IngestOutcome::UnknownDeputy => HttpResponse::NotFound().json(ErrorBody {
            kind: ErrorKind::NotFound,
            message: format!("deputy '{}' is not part of the fleet", address),
            name: None,
            detail: None,
        }),
    }
}

pub async fn health() -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "role": "sheriff"
    }))
}

pub fn configure_sheriff(cfg: &mut web::ServiceConfig) {
    cfg.app_data(super::json_config())
        .route("/api/deputies", web::get().to(list_deputies))
        .route("/api/processes", web::get().to(list_processes))
        .route("/api/process/{name}/{action}", web::post().to(dispatch))
        .route("/api/config", web::post().to(apply_config))
        .route("/api/config/reload", web::post().to(reload_config))
        .route("/api/report", web::post().to(ingest_report))
        .route("/health", web::get().to(health));
}
