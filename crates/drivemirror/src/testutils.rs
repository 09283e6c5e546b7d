//! A fake drive and a mirror server in front of it, for testing the endpoints.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Form, Path, Query};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use drivemirror_service::config::{Config, UpstreamConfig};
use drivemirror_service::services::SharedServices;
use serde_json::{Value, json};

pub use drivemirror_test::*;

use crate::endpoints;

pub const MOVIE_ID: &str = "movie-file-id";
pub const MOVIE_SIZE: usize = 2500;

/// The contents of the movie served by the fake drive.
pub fn movie_bytes() -> Vec<u8> {
    (0..MOVIE_SIZE).map(|i| (i % 251) as u8).collect()
}

fn metadata(file_id: &str) -> Option<Value> {
    let file = match file_id {
        MOVIE_ID => json!({
            "id": MOVIE_ID,
            "name": "movie.mkv",
            "mimeType": "video/x-matroska",
            "size": MOVIE_SIZE.to_string(),
            "fileExtension": "mkv",
        }),
        "folder-id-1" => json!({
            "id": "folder-id-1",
            "name": "Movies",
            "mimeType": "application/vnd.google-apps.folder",
        }),
        "empty-file" => json!({
            "id": "empty-file",
            "name": "empty.txt",
            "mimeType": "text/plain",
            "size": "0",
        }),
        "quota-file" => json!({
            "id": "quota-file",
            "name": "popular.zip",
            "mimeType": "application/zip",
            "size": "1000",
        }),
        _ => return None,
    };
    Some(file)
}

fn serve_range(headers: &HeaderMap) -> Response {
    let range = headers
        .get(header::RANGE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("bytes="))
        .and_then(|value| value.split_once('-'))
        .and_then(|(start, end)| Some((start.parse::<usize>().ok()?, end.parse::<usize>().ok()?)));
    let Some((start, end)) = range else {
        return (StatusCode::OK, movie_bytes()).into_response();
    };

    let end = end.min(MOVIE_SIZE - 1);
    let content_range = format!("bytes {start}-{end}/{MOVIE_SIZE}");
    (
        StatusCode::PARTIAL_CONTENT,
        [(header::CONTENT_RANGE, content_range)],
        movie_bytes()[start..=end].to_vec(),
    )
        .into_response()
}

async fn file(
    Path(file_id): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Response {
    if !headers.contains_key(header::AUTHORIZATION) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let media = query.get("alt").is_some_and(|alt| alt == "media");
    match (file_id.as_str(), media) {
        ("locked-file", _) => (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": {"errors": [{"reason": "authError"}], "code": 401}})),
        )
            .into_response(),
        ("quota-file", true) => (
            StatusCode::FORBIDDEN,
            Json(json!({"error": {"errors": [{"reason": "downloadQuotaExceeded"}], "code": 403}})),
        )
            .into_response(),
        (MOVIE_ID, true) => serve_range(&headers),
        (file_id, false) => match metadata(file_id) {
            Some(file) => Json(file).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn list(Query(query): Query<HashMap<String, String>>) -> Json<Value> {
    let q = query.get("q").map(String::as_str).unwrap_or_default();
    let page_token = query.get("pageToken");

    let (ids, next_page_token): (&[&str], _) = if q.contains("'root' in parents") {
        (&["folder-id-1"], None)
    } else if q.contains("'folder-id-1' in parents") {
        match page_token {
            None => (&[MOVIE_ID, "empty-file"], Some("page-2")),
            Some(_) => (&["quota-file"], None),
        }
    } else if q.contains("name contains 'movie'") {
        (&[MOVIE_ID], None)
    } else {
        (&[], None)
    };

    let files: Vec<_> = ids.iter().filter_map(|id| metadata(id)).collect();
    Json(json!({"files": files, "nextPageToken": next_page_token}))
}

/// Creates a fake drive API, including the token endpoint at `/token`.
///
/// Serves the movie [`MOVIE_ID`], the folder `folder-id-1` containing it, `empty-file`,
/// `quota-file` which is out of download quota and `locked-file` which rejects every
/// credential. Everything else is not found.
pub fn fake_drive() -> HitCounter {
    let token = post(|Form(form): Form<HashMap<String, String>>| async move {
        Json(json!({
            "access_token": format!("refreshed-{}", form["refresh_token"]),
            "expires_in": 3599,
        }))
    });

    let router = Router::new()
        .route("/token", token)
        .route("/files", get(list))
        .route("/files/{file_id}", get(file));

    HitCounter::new(router)
}

/// Serves the mirror app in front of `drive`.
pub fn mirror(drive: &HitCounter) -> Server {
    let mut config = Config::default();
    config.credentials.token_file = fixture("token.json");
    config.upstream = UpstreamConfig {
        api_url: drive.url("/"),
        oauth_token_url: Some(drive.url("/token")),
    };
    config.streaming.retry_backoff = Duration::from_millis(1);
    config.tokens.exchange_backoff = Duration::from_millis(1);

    let services = SharedServices::new(config).unwrap();
    Server::new(endpoints::create_app(Arc::new(services)))
}
