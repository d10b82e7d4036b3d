mod activity;
mod app;
mod config;
mod connection;
mod discovery;
mod lmstudio;
mod media;
mod metrics;
mod model;
mod platform;
mod router;
mod runtime;
mod scheduler;
mod security;
mod startup;
mod state;
mod status;
#[cfg(test)]
mod testing;
mod topics;

#[tokio::main]
async fn main() {
    init_logging();
    if let Err(err) = app::run().await {
        tracing::error!(error = %err, "fatal");
        std::process::exit(1);
    }
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).init();
}
