// src/main.rs
use ringhttpd::{bootstrap, seed_routes, ServerConfig};

fn main() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args: Vec<String> = std::env::args().collect();
    let config = match ServerConfig::from_args(&args) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!(error = %e, "invalid startup configuration");
            std::process::exit(-1);
        }
    };

    let routes = seed_routes(&config.html_root);

    tracing::info!(port = config.port, workers = config.worker_count, "starting server");

    if let Err(e) = bootstrap::run(config, routes) {
        tracing::error!(error = %e, "fatal startup error");
        std::process::exit(-1);
    }
}
