use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use drivemirror_service::config::Config;
use drivemirror_service::metric;
use drivemirror_service::services::SharedServices;

use crate::endpoints;

/// Creates all services and runs the HTTP server based on the loaded config.
pub fn run(config: Config) -> Result<()> {
    // Log this metric before actually starting the server. This allows to see restarts even if
    // service creation fails.
    metric!(counter("server.starting") += 1);

    let megs = 1024 * 1024;
    let web_pool = tokio::runtime::Builder::new_multi_thread()
        .thread_name("drivemirror-web")
        .enable_all()
        .thread_stack_size(8 * megs)
        .build()?;

    let socket = config
        .bind
        .parse::<SocketAddr>()
        .with_context(|| format!("invalid bind address `{}`", config.bind))?;
    let services = SharedServices::new(config).context("failed to create services")?;

    let app = endpoints::create_app(Arc::new(services));
    let server = axum_server::bind(socket).serve(app.into_make_service_with_connect_info::<SocketAddr>());
    tracing::info!("Starting HTTP server on {}", socket);

    web_pool.block_on(server)?;
    tracing::info!("System shutdown complete");

    Ok(())
}
