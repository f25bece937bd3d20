use actix_web::middleware::Logger;
use actix_web::{App, HttpServer, web};
use anyhow::Context;
use clap::Parser;
use tracing::info;

use hairswap_gateway::logging::init_tracing;
use hairswap_gateway::{AppState, Config, configure};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(&config.log_level);

    let app_state = web::Data::new(
        AppState::from_config(&config).context("failed to initialize gateway")?,
    );

    info!(
        host = %config.host,
        port = config.port,
        resize_mode = ?config.resize_mode,
        concurrency = ?config.concurrency,
        "starting hair swap gateway"
    );

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .app_data(app_state.clone())
            .configure(configure)
    })
    .bind((config.host.as_str(), config.port))
    .with_context(|| format!("failed to bind {}:{}", config.host, config.port))?
    .run()
    .await
    .context("server exited with an error")
}
