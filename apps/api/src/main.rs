mod config;
mod container;
mod handlers;
mod middleware;
mod routes;

use crate::config::AppConfig;
use crate::container::ServiceContainer;
use tracing_subscriber::{fmt, fmt::time::ChronoUtc, prelude::*, EnvFilter};

fn init_logger() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_timer(ChronoUtc::rfc_3339())
        .with_thread_ids(true)
        .with_target(true)
        .json();

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}

#[tokio::main]
async fn main() {
    init_logger();

    let config = AppConfig::load().expect("load config");
    let addr = config.bind_addr();

    let container = ServiceContainer::build(config)
        .await
        .expect("build service container");
    let app = routes::build_router(container);

    tracing::info!(%addr, "starting api server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("bind addr");
    axum::serve(listener, app).await.expect("serve");
}
