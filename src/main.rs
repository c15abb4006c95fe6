use tracing_subscriber::EnvFilter;

use stagedoor::config::AppConfig;
use stagedoor::server;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,stagedoor=debug")),
        )
        .init();

    tracing::info!("stagedoor backend starting...");

    let config = AppConfig::load();
    if let Err(e) = server::run_server(config).await {
        tracing::error!("Server error: {:#}", e);
        std::process::exit(1);
    }
}
