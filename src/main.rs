use kiro2api::config::Tuning;
use kiro2api::{core, logger, proxy};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    logger::init_logger();

    let tuning = Tuning::from_env();
    info!(region = %tuning.region, "Starting kiro2api server...");

    let core = core::bootstrap(tuning);
    core.start_background_tasks();

    let port = std::env::var("KIRO_PORT")
        .or_else(|_| std::env::var("PORT"))
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(8080);

    info!("--------------------------------------------------");
    info!("Proxy service starting...");
    info!(port, "Listening");
    match &core.api_key {
        Some(_) => info!("API key auth: enabled"),
        None => info!("API key auth: disabled (KIRO_API_KEY not set)"),
    }
    info!("--------------------------------------------------");

    if let Err(e) = proxy::server::serve(core, port).await {
        error!(error = %e, "Failed to start proxy service");
        std::process::exit(1);
    }

    info!("Shutting down");
}
