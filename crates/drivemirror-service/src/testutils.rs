//! Fakes of the upstream drive shared by the unit tests.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::Form;
use axum::routing::{MethodRouter, post};
use drivemirror_test::HitCounter;
use reqwest::Client;
use serde_json::json;

use crate::config::TokensConfig;
use crate::credentials::{Credential, CredentialPool, RefreshTokenRecord};
use crate::tokens::TokenProvider;
use crate::upstream::{DriveApi, RetryPolicy};

/// A token endpoint handing out `refreshed-<refresh token>` for every refresh grant.
pub fn token_route() -> MethodRouter {
    post(|Form(form): Form<HashMap<String, String>>| async move {
        Json(json!({
            "access_token": format!("refreshed-{}", form["refresh_token"]),
            "expires_in": 3599,
        }))
    })
}

/// Creates an API client talking to `server`, with `credentials` refresh tokens `rt-0`, `rt-1`...
///
/// The server is expected to serve the token endpoint at `/token`.
pub fn drive_api(server: &HitCounter, credentials: usize) -> Arc<DriveApi> {
    let credentials = (0..credentials)
        .map(|i| {
            Credential::RefreshToken(RefreshTokenRecord {
                client_id: format!("client-{i}"),
                client_secret: "secret".into(),
                refresh_token: format!("rt-{i}"),
                token_uri: server.url("/token"),
            })
        })
        .collect();
    let pool = Arc::new(CredentialPool::new(credentials).unwrap());

    let client = Client::new();
    let tokens_config = TokensConfig {
        exchange_backoff: Duration::from_millis(1),
        ..Default::default()
    };
    let tokens = Arc::new(TokenProvider::new(client.clone(), tokens_config, None));
    let retry = RetryPolicy {
        attempts: 3,
        backoff: Duration::from_millis(1),
    };
    Arc::new(DriveApi::new(client, server.url("/"), pool, tokens, retry))
}
