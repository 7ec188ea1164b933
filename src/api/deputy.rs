use actix_web::{web, HttpResponse, Responder};

use crate::error::ProcmanError;
use crate::metrics::METRICS;
use crate::models::Command;
use crate::state::DeputyState;

pub async fn handle_command(
    data: web::Data<DeputyState>,
    req: web::Json<Command>,
) -> Result<HttpResponse, ProcmanError> {
    let command = req.into_inner();
    log::info!("Received {}", command);
    let ack = data.handle(command).await?;
    Ok(HttpResponse::Ok().json(ack))
}

/// Pull-mode status report
pub async fn get_status(data: web::Data<DeputyState>) -> impl Responder {
    HttpResponse::Ok().json(data.status_report().await)
}

pub async fn list_processes(data: web::Data<DeputyState>) -> impl Responder {
    HttpResponse::Ok().json(data.list().await)
}

pub async fn get_process(
    data: web::Data<DeputyState>,
    path: web::Path<String>,
) -> Result<HttpResponse, ProcmanError> {
    let view = data.process(&path.into_inner()).await?;
    Ok(HttpResponse::Ok().json(view))
}

pub async fn get_metrics(data: web::Data<DeputyState>) -> impl Responder {
    METRICS.record(data.hostname(), &data.entries().await);

    match METRICS.render() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => {
            log::error!("Failed to render metrics: {}", e);
            HttpResponse::InternalServerError().body(e.to_string())
        }
    }
}

pub async fn health(data: web::Data<DeputyState>) -> impl Responder {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "hostname": data.hostname(),
        "boot_id": data.boot_id()
    }))
}

pub fn configure_deputy(cfg: &mut web::ServiceConfig) {
    cfg.app_data(super::json_config())
        .route("/api/command", web::post().to(handle_command))
        .route("/api/status", web::get().to(get_status))
        .route("/api/process/list", web::get().to(list_processes))
        .route("/api/process/{name}", web::get().to(get_process))
        .route("/metrics", web::get().to(get_metrics))
        .route("/health", web::get().to(health));
}
