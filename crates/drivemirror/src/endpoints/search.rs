use std::sync::Arc;

use axum::extract;
use axum::response::Json;
use drivemirror_service::types::Page;
use axum::http::StatusCode;
use serde::Deserialize;

use super::folders::page_params;
use super::{ApiResponse, ResponseError, Service};

/// Queries shorter than this match too much to be useful.
const MIN_QUERY_LEN: usize = 3;

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    query: String,
    #[serde(default)]
    page_token: Option<String>,
    #[serde(default)]
    page_size: Option<u32>,
}

pub async fn search_files(
    extract::State(service): extract::State<Service>,
    extract::Query(params): extract::Query<SearchQuery>,
) -> Result<Json<ApiResponse<Arc<Page>>>, ResponseError> {
    sentry::configure_scope(|scope| {
        scope.set_transaction(Some("GET /search"));
    });

    let query = params.query.trim();
    if query.chars().count() < MIN_QUERY_LEN {
        return Err((
            StatusCode::BAD_REQUEST,
            "the query must be at least 3 characters long",
        )
            .into());
    }
    let (page_token, page_size) = page_params(params.page_token, params.page_size)?;

    let page = service.catalog.search(query, page_token, page_size).await?;
    Ok(Json(ApiResponse::new(page)))
}
