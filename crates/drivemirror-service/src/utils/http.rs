use std::time::Duration;

use reqwest::redirect;

use crate::config::Config;

/// Various timeouts for all upstream requests.
#[derive(Copy, Clone, Debug)]
pub struct UpstreamTimeouts {
    /// The timeout for establishing a connection.
    pub connect: Duration,
    /// The timeout for a stalled read, either waiting for headers or for the next body chunk.
    ///
    /// Streams have no total timeout, a long transfer is fine as long as bytes keep flowing.
    pub read: Duration,
    /// Total timeout for API and token requests, which are small.
    pub api: Duration,
}

impl UpstreamTimeouts {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect: config.connect_timeout,
            read: config.read_timeout,
            api: config.api_timeout,
        }
    }
}

impl Default for UpstreamTimeouts {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(5),
            read: Duration::from_secs(30),
            api: Duration::from_secs(60),
        }
    }
}

/// Creates the [`reqwest::Client`] shared by all API and token requests.
///
/// The client keeps a connection pool, clone it instead of creating new ones.
pub fn create_client(timeouts: &UpstreamTimeouts) -> reqwest::Client {
    builder(timeouts)
        .timeout(timeouts.api)
        .pool_idle_timeout(Duration::from_secs(30))
        .build()
        .unwrap_or_else(|err| {
            tracing::error!(error = &err as &dyn std::error::Error, "failed to build client");
            reqwest::Client::new()
        })
}

/// Creates a [`reqwest::Client`] owned by a single stream.
///
/// It does not keep idle connections around, dropping the client together with the
/// in-flight response closes the upstream connection.
pub fn create_stream_client(timeouts: &UpstreamTimeouts) -> reqwest::Client {
    builder(timeouts)
        .pool_max_idle_per_host(0)
        .build()
        .unwrap_or_else(|err| {
            tracing::error!(error = &err as &dyn std::error::Error, "failed to build client");
            reqwest::Client::new()
        })
}

fn builder(timeouts: &UpstreamTimeouts) -> reqwest::ClientBuilder {
    reqwest::ClientBuilder::new()
        .connect_timeout(timeouts.connect)
        .read_timeout(timeouts.read)
        .redirect(redirect::Policy::limited(5))
        .user_agent(concat!("drivemirror/", env!("CARGO_PKG_VERSION")))
}
