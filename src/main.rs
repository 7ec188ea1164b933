use actix_web::{web, App, HttpServer};
use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

mod api;
mod cli;
mod error;
mod metrics;
mod models;
mod services;
mod state;

use api::{configure_deputy, configure_sheriff};
use cli::{CommandArgs, DeputyArgs, Role, SheriffArgs};
use models::FleetConfig;
use services::{Deputy, HttpDeputyClient, Sheriff};
use state::{DeputyState, SheriffState};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = CommandArgs::parse();
    match args.role {
        Role::Deputy(args) => run_deputy(args).await,
        Role::Sheriff(args) => run_sheriff(args).await,
    }
}

async fn run_deputy(args: DeputyArgs) -> anyhow::Result<()> {
    let settings = args.settings();
    let bind_address = format!("{}:{}", settings.address, settings.port);
    let deputy: DeputyState = Arc::new(Deputy::new(settings.clone()));

    if let Some(path) = &settings.config {
        let config = FleetConfig::load(path)
            .with_context(|| format!("failed to load {}", path.display()))?;
        config.validate()?;
        let specs: Vec<_> = config.specs_for(&settings.advertise).into_values().collect();
        log::info!(
            "📄 Loading {} process specs bound to {} from {}",
            specs.len(),
            settings.advertise,
            path.display()
        );
        deputy.load_specs(specs).await;
    }

    let tasks = deputy.spawn_background();
    print_deputy_banner(&args, &settings.advertise);

    let state = deputy.clone();
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(configure_deputy)
    })
        .bind(&bind_address)
        .with_context(|| format!("failed to bind {}", bind_address))?
        .run()
        .await?;

    log::info!("🛑 Server stopped, cleaning up supervised processes");
    for task in tasks {
        task.abort();
    }
    deputy.shutdown().await;
    Ok(())
}

async fn run_sheriff(args: SheriffArgs) -> anyhow::Result<()> {
    let settings = args.settings();
    let bind_address = format!("{}:{}", settings.address, settings.port);

    let client = Arc::new(HttpDeputyClient::new(settings.command_timeout)?);
    let sheriff: SheriffState = Arc::new(Sheriff::new(settings.clone(), client));

    match &settings.config {
        Some(path) => {
            sheriff
                .reload_from_file()
                .await
                .with_context(|| format!("failed to load fleet configuration {}", path.display()))?;
        }
        None => log::warn!("No --config given; starting with an empty fleet"),
    }

    let liveness = sheriff.spawn_background();
    let hangup = reload_on_hangup(sheriff.clone()).context("failed to install SIGHUP handler")?;
    print_sheriff_banner(&args);

    let state = sheriff.clone();
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .configure(configure_sheriff)
    })
        .bind(&bind_address)
        .with_context(|| format!("failed to bind {}", bind_address))?
        .run()
        .await?;

    liveness.abort();
    hangup.abort();
    sheriff.shutdown();
    Ok(())
}

/// Reload the fleet file on every SIGHUP; a rejected document keeps the old one
fn reload_on_hangup(sheriff: SheriffState) -> std::io::Result<JoinHandle<()>> {
    let mut hangups = signal(SignalKind::hangup())?;
    Ok(tokio::spawn(async move {
        while hangups.recv().await.is_some() {
            log::info!("🔄 SIGHUP received, reloading configuration");
            match sheriff.reload_from_file().await {
                Ok(report) => {
                    let sent: usize = report.deputies.iter().map(|d| d.sent.len()).sum();
                    log::info!("✅ Reload applied, {} commands delivered", sent);
                }
                Err(e) => log::error!("❌ Reload rejected, keeping previous configuration: {}", e),
            }
        }
    }))
}

fn print_deputy_banner(args: &DeputyArgs, advertise: &str) {
    println!("╔═══════════════════════════════════════════════════════════╗");
    println!("║      procman deputy v{:<37}║", env!("CARGO_PKG_VERSION"));
    println!("╚═══════════════════════════════════════════════════════════╝");
    println!();
    println!("🚀 Deputy starting on http://{}:{} (advertised as {})", args.address, args.port, advertise);
    if let Some(sheriff) = &args.sheriff {
        println!("📡 Pushing status reports to {}", sheriff);
    }
    println!();
    println!("📋 Available endpoints:");
    println!("  POST   /api/command            - Execute a sheriff command");
    println!("  GET    /api/status             - Current status report");
    println!("  GET    /api/process/list       - List supervised processes");
    println!("  GET    /api/process/{{name}}     - Inspect one process");
    println!("  GET    /metrics                - Prometheus metrics");
    println!("  GET    /health                 - Health check");
    println!("═══════════════════════════════════════════════════════════");
}

fn print_sheriff_banner(args: &SheriffArgs) {
    println!("╔═══════════════════════════════════════════════════════════╗");
    println!("║      procman sheriff v{:<36}║", env!("CARGO_PKG_VERSION"));
    println!("╚═══════════════════════════════════════════════════════════╝");
    println!();
    println!("🚀 Sheriff starting on http://{}:{}", args.address, args.port);
    println!();
    println!("📋 Available endpoints:");
    println!("  GET    /api/deputies                   - Deputy connection states");
    println!("  GET    /api/processes                  - Declared processes and observed state");
    println!("  POST   /api/process/{{name}}/{{action}}    - start | stop | restart");
    println!("  POST   /api/config                     - Apply a fleet document");
    println!("  POST   /api/config/reload              - Reload the fleet file (also SIGHUP)");
    println!("  POST   /api/report                     - Deputy report push");
    println!("  GET    /health                         - Health check");
    println!("═══════════════════════════════════════════════════════════");
}
