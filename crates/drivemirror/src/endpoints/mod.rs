use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::Router;
use axum::extract::{ConnectInfo, FromRequestParts};
use axum::http::request::Parts;
use axum::routing::get;
use drivemirror_service::metric;
use drivemirror_service::services::SharedServices;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use serde::Serialize;
use tower::ServiceBuilder;

mod download;
mod error;
mod folders;
mod info;
mod metrics;
mod search;
mod stats;

pub use error::ResponseError;
use metrics::MetricsLayer;

use download::download_file as download;
use folders::list_folder as folders;
use info::file_info as info;
use search::search_files as search;
use stats::{file_stats, top_files};

/// The state shared by all handlers.
pub type Service = Arc<SharedServices>;

/// The envelope of every successful JSON response.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    success: bool,
    data: T,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// The address of the client, preferring the first `X-Forwarded-For` entry over the peer.
#[derive(Clone, Copy, Debug)]
pub struct ClientIp(pub Option<IpAddr>);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .and_then(|ip| ip.trim().parse().ok());
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip());

        Ok(Self(forwarded.or(peer)))
    }
}

pub async fn healthcheck() -> &'static str {
    metric!(counter("healthcheck") += 1);
    "ok"
}

pub fn create_app(service: Service) -> Router {
    // The layers here go "top to bottom" according to the reading order here.
    let layer = ServiceBuilder::new()
        .layer(NewSentryLayer::new_from_top())
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(MetricsLayer);

    Router::new()
        .route("/dl/{file_id}", get(download))
        .route("/info", get(info))
        .route("/folders/list", get(folders))
        .route("/search", get(search))
        .route("/stats", get(top_files))
        .route("/stats/{file_id}", get(file_stats))
        .with_state(service)
        .layer(layer)
        // the healthcheck is last, as it will bypass all the middlewares
        .route("/healthcheck", get(healthcheck))
}
