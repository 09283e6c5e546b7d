use std::sync::Arc;

use axum::extract;
use axum::response::Json;
use drivemirror_service::types::FileInfo;
use axum::http::StatusCode;
use serde::Deserialize;

use super::{ApiResponse, ResponseError, Service};

#[derive(Debug, Deserialize)]
pub struct InfoQuery {
    #[serde(default)]
    file_id: String,
}

pub async fn file_info(
    extract::State(service): extract::State<Service>,
    extract::Query(query): extract::Query<InfoQuery>,
) -> Result<Json<ApiResponse<Arc<FileInfo>>>, ResponseError> {
    sentry::configure_scope(|scope| {
        scope.set_transaction(Some("GET /info"));
    });

    let file_id = query.file_id.trim();
    if file_id.is_empty() {
        return Err((StatusCode::BAD_REQUEST, "missing file id").into());
    }

    let info = service.catalog.file_info(file_id).await?;
    Ok(Json(ApiResponse::new(info)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::{self, MOVIE_ID};

    #[tokio::test]
    async fn test_file_info() {
        testutils::setup();
        let drive = testutils::fake_drive();
        let server = testutils::mirror(&drive);

        let url = server.url(&format!("/info?file_id=%20{MOVIE_ID}%20"));
        let response = reqwest::get(url).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body: serde_json::Value = response.json().await.unwrap();
        insta::assert_json_snapshot!(body, @r#"
        {
          "data": {
            "created_time": null,
            "extension": "mkv",
            "id": "movie-file-id",
            "mime_type": "video/x-matroska",
            "modified_time": null,
            "name": "movie.mkv",
            "size": 2500,
            "thumbnail_link": null,
            "type": "file"
          },
          "success": true
        }
        "#);

        // Served from the cache the second time.
        reqwest::get(server.url(&format!("/info?file_id={MOVIE_ID}")))
            .await
            .unwrap();
        assert_eq!(drive.hits(&format!("/files/{MOVIE_ID}")), 1);
    }

    #[tokio::test]
    async fn test_missing_file() {
        testutils::setup();
        let drive = testutils::fake_drive();
        let server = testutils::mirror(&drive);

        let response = reqwest::get(server.url("/info?file_id=nope-nope"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = reqwest::get(server.url("/info")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
