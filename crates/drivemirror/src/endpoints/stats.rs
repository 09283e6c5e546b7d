use std::sync::Arc;

use axum::extract;
use axum::response::Json;
use drivemirror_service::types::FileStats;
use axum::http::StatusCode;
use serde::Deserialize;

use super::{ApiResponse, ResponseError, Service};

const DEFAULT_LIMIT: usize = 10;
const MAX_LIMIT: usize = 100;

#[derive(Debug, Deserialize)]
pub struct TopQuery {
    #[serde(default)]
    limit: Option<usize>,
}

/// The most downloaded files, ranked by trending score.
pub async fn top_files(
    extract::State(service): extract::State<Service>,
    extract::Query(query): extract::Query<TopQuery>,
) -> Result<Json<ApiResponse<Arc<Vec<FileStats>>>>, ResponseError> {
    sentry::configure_scope(|scope| {
        scope.set_transaction(Some("GET /stats"));
    });

    let limit = query.limit.unwrap_or(DEFAULT_LIMIT);
    if !(1..=MAX_LIMIT).contains(&limit) {
        return Err((StatusCode::BAD_REQUEST, "limit must be between 1 and 100").into());
    }

    let top = service.tracker.top_files(limit).await;
    Ok(Json(ApiResponse::new(top)))
}

pub async fn file_stats(
    extract::State(service): extract::State<Service>,
    extract::Path(file_id): extract::Path<String>,
) -> Json<ApiResponse<FileStats>> {
    sentry::configure_scope(|scope| {
        scope.set_transaction(Some("GET /stats/:file_id"));
    });

    Json(ApiResponse::new(service.tracker.file_stats(file_id.trim())))
}
