use std::sync::Arc;

use axum::extract;
use axum::response::Json;
use drivemirror_service::types::Page;
use axum::http::StatusCode;
use serde::Deserialize;

use super::{ApiResponse, ResponseError, Service};

const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 50;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    folder_id: Option<String>,
    #[serde(default)]
    page_token: Option<String>,
    #[serde(default)]
    page_size: Option<u32>,
}

/// Validates the paging parameters shared by listings and searches.
///
/// An empty page token requests the first page.
pub fn page_params(
    page_token: Option<String>,
    page_size: Option<u32>,
) -> Result<(Option<String>, u32), ResponseError> {
    let page_size = page_size.unwrap_or(DEFAULT_PAGE_SIZE);
    if !(1..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err((StatusCode::BAD_REQUEST, "page_size must be between 1 and 50").into());
    }
    let page_token = page_token.filter(|token| !token.trim().is_empty());
    Ok((page_token, page_size))
}

pub async fn list_folder(
    extract::State(service): extract::State<Service>,
    extract::Query(query): extract::Query<ListQuery>,
) -> Result<Json<ApiResponse<Arc<Page>>>, ResponseError> {
    sentry::configure_scope(|scope| {
        scope.set_transaction(Some("GET /folders/list"));
    });

    let (page_token, page_size) = page_params(query.page_token, query.page_size)?;
    let folder_id = match query.folder_id.as_deref().map(str::trim) {
        Some(folder_id) if !folder_id.is_empty() => folder_id,
        _ => service.root_folder_id(),
    };

    let page = service
        .catalog
        .list_children(folder_id, page_token, page_size)
        .await?;
    Ok(Json(ApiResponse::new(page)))
}
