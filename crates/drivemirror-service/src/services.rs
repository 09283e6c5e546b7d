use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::credentials::CredentialPool;
use crate::listing::Catalog;
use crate::streaming::Streamer;
use crate::tokens::TokenProvider;
use crate::tracker::DownloadTracker;
use crate::upstream::{DriveApi, RetryPolicy};
use crate::utils::http::{UpstreamTimeouts, create_client};

/// The folder listed when neither the request nor the configuration name one.
const DEFAULT_ROOT_FOLDER: &str = "root";

/// All services of the mirror, created once at startup and shared by every request.
#[derive(Debug)]
pub struct SharedServices {
    pub config: Config,
    pub api: Arc<DriveApi>,
    pub catalog: Arc<Catalog>,
    pub streamer: Arc<Streamer>,
    pub tracker: Arc<DownloadTracker>,
}

impl SharedServices {
    pub fn new(config: Config) -> Result<Self> {
        let pool = CredentialPool::from_config(&config.credentials)
            .context("failed to load credentials")?;

        let timeouts = UpstreamTimeouts::from_config(&config);
        let client = create_client(&timeouts);

        let tokens = TokenProvider::new(
            client.clone(),
            config.tokens.clone(),
            config.upstream.oauth_token_url.clone(),
        );
        let retry = RetryPolicy {
            attempts: config.streaming.max_request_attempts.max(1),
            backoff: config.streaming.retry_backoff,
        };
        let api = Arc::new(DriveApi::new(
            client,
            config.upstream.api_url.clone(),
            Arc::new(pool),
            Arc::new(tokens),
            retry,
        ));

        let catalog = Arc::new(Catalog::new(Arc::clone(&api), &config.listing));
        let streamer = Arc::new(Streamer::new(
            Arc::clone(&api),
            timeouts,
            config.streaming.clone(),
        ));
        let tracker = Arc::new(DownloadTracker::new(config.listing.stats_ttl));

        Ok(Self {
            config,
            api,
            catalog,
            streamer,
            tracker,
        })
    }

    /// The folder listed when a request does not name one.
    pub fn root_folder_id(&self) -> &str {
        self.config
            .root_folder_id
            .as_deref()
            .unwrap_or(DEFAULT_ROOT_FOLDER)
    }
}
