use axum::body::Body;
use axum::extract;
use axum::http::{HeaderMap, HeaderValue, Response, StatusCode, header};
use drivemirror_service::error::DriveError;
use drivemirror_service::streaming::{RequestedRange, ResolvedRange};
use drivemirror_service::types::FileInfo;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use super::{ClientIp, ResponseError, Service};

/// Characters kept verbatim in an RFC 5987 `filename*` value.
const ATTR_CHARS: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

/// Ids shorter than this are rejected without asking upstream.
const MIN_FILE_ID_LEN: usize = 5;

/// Builds the `Content-Disposition` header for a download of `name`.
///
/// The quoted `filename` is an ASCII fallback, the full name goes into `filename*`.
fn content_disposition(name: &str) -> HeaderValue {
    let fallback: String = name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();
    let encoded = utf8_percent_encode(name, ATTR_CHARS);
    let value = format!("attachment; filename=\"{fallback}\"; filename*=UTF-8''{encoded}");

    HeaderValue::from_str(&value).unwrap_or_else(|_| HeaderValue::from_static("attachment"))
}

/// Checks the `Range` header against the file.
///
/// Returns `None` for an empty file requested without a range.
fn requested_range(headers: &HeaderMap, size: u64) -> Result<Option<ResolvedRange>, DriveError> {
    let Some(value) = headers.get(header::RANGE) else {
        return Ok(ResolvedRange::full(size));
    };

    let unsatisfiable = || DriveError::RangeNotSatisfiable { size };
    let range = value
        .to_str()
        .ok()
        .and_then(|value| RequestedRange::parse(value).ok())
        .ok_or_else(unsatisfiable)?;

    range.resolve(size).map(Some)
}

fn response_for(info: &FileInfo) -> axum::http::response::Builder {
    let content_type = match info.mime_type.as_str() {
        "" => "application/octet-stream",
        mime_type => mime_type,
    };

    Response::builder()
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_DISPOSITION, content_disposition(&info.name))
}

pub async fn download_file(
    extract::State(service): extract::State<Service>,
    extract::Path(file_id): extract::Path<String>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
) -> Result<Response<Body>, ResponseError> {
    sentry::configure_scope(|scope| {
        scope.set_transaction(Some("GET /dl"));
    });

    let file_id = file_id.trim();
    if file_id.chars().count() < MIN_FILE_ID_LEN {
        return Err((StatusCode::BAD_REQUEST, "invalid file id").into());
    }

    let info = service.catalog.file_info(file_id).await?;
    if info.is_folder() {
        return Err((StatusCode::BAD_REQUEST, "folders cannot be downloaded").into());
    }

    let Some(range) = requested_range(&headers, info.size)? else {
        tracing::debug!(file_id, "serving empty file");
        service.tracker.track_download(file_id, ip);
        return Ok(response_for(&info)
            .header(header::CONTENT_LENGTH, 0)
            .body(Body::empty())?);
    };

    let stream = service.streamer.open(file_id, range).await?;
    service.tracker.track_download(file_id, ip);

    let mut response = response_for(&info).header(header::CONTENT_LENGTH, range.len());
    if range.is_partial() {
        response = response
            .status(StatusCode::PARTIAL_CONTENT)
            .header(header::CONTENT_RANGE, range.content_range());
    }

    Ok(response.body(Body::from_stream(stream))?)
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::*;
    use crate::testutils::{self, MOVIE_ID, MOVIE_SIZE};

    #[test]
    fn test_content_disposition() {
        assert_eq!(
            content_disposition("movie.mkv"),
            "attachment; filename=\"movie.mkv\"; filename*=UTF-8''movie.mkv"
        );
        assert_eq!(
            content_disposition("Amélie \"2001\".mkv"),
            "attachment; filename=\"Am_lie _2001_.mkv\"; \
             filename*=UTF-8''Am%C3%A9lie%20%222001%22.mkv"
        );
    }

    #[test]
    fn test_requested_range() {
        let mut headers = HeaderMap::new();
        assert_eq!(
            requested_range(&headers, 100).unwrap(),
            ResolvedRange::full(100)
        );
        assert_eq!(requested_range(&headers, 0).unwrap(), None);

        headers.insert(header::RANGE, HeaderValue::from_static("bytes=10-19"));
        let range = requested_range(&headers, 100).unwrap().unwrap();
        assert_eq!((range.start(), range.end()), (10, 19));
        assert_eq!(
            requested_range(&headers, 0),
            Err(DriveError::RangeNotSatisfiable { size: 0 })
        );

        headers.insert(header::RANGE, HeaderValue::from_static("items=1-2"));
        assert_eq!(
            requested_range(&headers, 100),
            Err(DriveError::RangeNotSatisfiable { size: 100 })
        );
    }

    #[tokio::test]
    async fn test_full_download() {
        testutils::setup();
        let drive = testutils::fake_drive();
        let server = testutils::mirror(&drive);

        let response = reqwest::get(server.url(&format!("/dl/{MOVIE_ID}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let headers = response.headers();
        assert_eq!(headers["accept-ranges"], "bytes");
        assert_eq!(headers["content-type"], "video/x-matroska");
        assert_eq!(headers["content-length"], MOVIE_SIZE.to_string());
        assert!(
            headers["content-disposition"]
                .to_str()
                .unwrap()
                .starts_with("attachment; filename=\"movie.mkv\"")
        );
        assert!(headers.get("content-range").is_none());

        let body = response.bytes().await.unwrap();
        assert_eq!(body, testutils::movie_bytes());
    }

    #[tokio::test]
    async fn test_partial_download() {
        testutils::setup();
        let drive = testutils::fake_drive();
        let server = testutils::mirror(&drive);

        let response = reqwest::Client::new()
            .get(server.url(&format!("/dl/{MOVIE_ID}")))
            .header("range", "bytes=100-199")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response.headers()["content-range"],
            format!("bytes 100-199/{MOVIE_SIZE}")
        );
        assert_eq!(response.headers()["content-length"], "100");

        let body = response.bytes().await.unwrap();
        assert_eq!(body, testutils::movie_bytes()[100..200]);
    }

    #[tokio::test]
    async fn test_full_range_is_not_partial() {
        testutils::setup();
        let drive = testutils::fake_drive();
        let server = testutils::mirror(&drive);

        let response = reqwest::Client::new()
            .get(server.url(&format!("/dl/{MOVIE_ID}")))
            .header("range", "bytes=0-")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("content-range").is_none());
    }

    #[tokio::test]
    async fn test_unsatisfiable_range() {
        testutils::setup();
        let drive = testutils::fake_drive();
        let server = testutils::mirror(&drive);

        for range in ["bytes=5000-6000", "bytes=10-5", "bytes=0-1,5-6", "lines=1-2"] {
            let response = reqwest::Client::new()
                .get(server.url(&format!("/dl/{MOVIE_ID}")))
                .header("range", range)
                .send()
                .await
                .unwrap();
            assert_eq!(
                response.status(),
                StatusCode::RANGE_NOT_SATISFIABLE,
                "{range}"
            );
            assert_eq!(
                response.headers()["content-range"],
                format!("bytes */{MOVIE_SIZE}")
            );
        }

        // Only the cached metadata lookup, no stream is opened.
        assert_eq!(drive.hits(&format!("/files/{MOVIE_ID}")), 1);
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        testutils::setup();
        let drive = testutils::fake_drive();
        let server = testutils::mirror(&drive);

        let response = reqwest::get(server.url("/dl/abc")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(drive.accesses(), 0);

        let response = reqwest::get(server.url("/dl/folder-id-1")).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["detail"], "folders cannot be downloaded");
    }

    #[tokio::test]
    async fn test_upstream_errors() {
        testutils::setup();
        let drive = testutils::fake_drive();
        let server = testutils::mirror(&drive);

        let response = reqwest::get(server.url("/dl/missing-file")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["detail"], "not found");

        let response = reqwest::get(server.url("/dl/quota-file")).await.unwrap();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        let response = reqwest::get(server.url("/dl/locked-file")).await.unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_empty_file() {
        testutils::setup();
        let drive = testutils::fake_drive();
        let server = testutils::mirror(&drive);

        let response = reqwest::get(server.url("/dl/empty-file")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-length"], "0");
        assert!(response.bytes().await.unwrap().is_empty());

        let response = reqwest::Client::new()
            .get(server.url("/dl/empty-file"))
            .header("range", "bytes=0-")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(response.headers()["content-range"], "bytes */0");
    }

    #[tokio::test]
    async fn test_download_is_tracked() {
        testutils::setup();
        let drive = testutils::fake_drive();
        let server = testutils::mirror(&drive);

        for _ in 0..2 {
            let response = reqwest::get(server.url(&format!("/dl/{MOVIE_ID}")))
                .await
                .unwrap();
            response.bytes().await.unwrap();
        }
        reqwest::get(server.url("/dl/missing-file")).await.unwrap();

        let response = reqwest::get(server.url(&format!("/stats/{MOVIE_ID}")))
            .await
            .unwrap();
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["data"]["download_count"], 2);

        let response = reqwest::get(server.url("/stats/missing-file")).await.unwrap();
        let body: serde_json::Value = response.json().await.unwrap();
        assert_eq!(body["data"]["download_count"], 0);
    }
}
