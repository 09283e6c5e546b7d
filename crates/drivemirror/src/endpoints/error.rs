use axum::Json;
use axum::http::{Error as HttpError, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use drivemirror_service::error::DriveError;
use drivemirror_service::streaming::unsatisfied_range;
use sentry::integrations::anyhow::capture_anyhow;
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub struct ResponseError {
    status: StatusCode,
    err: anyhow::Error,
    /// Set for `416` responses, the size of the file as `bytes */size`.
    content_range: Option<String>,
}

impl ResponseError {
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

/// Maps an upstream failure to the status code reported to the client.
fn status_of(err: &DriveError) -> StatusCode {
    match err {
        DriveError::Transient { .. } => StatusCode::SERVICE_UNAVAILABLE,
        DriveError::QuotaExhausted { .. } | DriveError::AllCredentialsExhausted { .. } => {
            StatusCode::TOO_MANY_REQUESTS
        }
        DriveError::NotFound => StatusCode::NOT_FOUND,
        DriveError::Auth(_) => StatusCode::UNAUTHORIZED,
        DriveError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
        DriveError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        DriveError::Upstream { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        DriveError::Malformed(_) => StatusCode::BAD_GATEWAY,
    }
}

impl From<DriveError> for ResponseError {
    fn from(err: DriveError) -> Self {
        let content_range = match err {
            DriveError::RangeNotSatisfiable { size } => Some(unsatisfied_range(size)),
            _ => None,
        };
        Self {
            status: status_of(&err),
            err: err.into(),
            content_range,
        }
    }
}

impl From<(StatusCode, &'static str)> for ResponseError {
    fn from((code, msg): (StatusCode, &'static str)) -> Self {
        Self {
            status: code,
            err: anyhow::anyhow!(msg),
            content_range: None,
        }
    }
}

impl From<(StatusCode, anyhow::Error)> for ResponseError {
    fn from((status, err): (StatusCode, anyhow::Error)) -> Self {
        Self {
            status,
            err,
            content_range: None,
        }
    }
}

impl From<HttpError> for ResponseError {
    fn from(err: HttpError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            err: err.into(),
            content_range: None,
        }
    }
}

impl IntoResponse for ResponseError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            capture_anyhow(&self.err);
        }
        let mut response = Json(ApiErrorResponse::from(self.err)).into_response();
        *response.status_mut() = self.status;
        if let Some(value) = self
            .content_range
            .and_then(|range| HeaderValue::from_str(&range).ok())
        {
            response.headers_mut().insert(header::CONTENT_RANGE, value);
        }
        response
    }
}

/// An error response from an api.
#[derive(Serialize, Deserialize, Default, Debug)]
pub struct ApiErrorResponse {
    success: bool,
    detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    causes: Option<Vec<String>>,
}

impl From<anyhow::Error> for ApiErrorResponse {
    fn from(err: anyhow::Error) -> Self {
        let mut chain = err.chain().map(|err| err.to_string());
        let detail = chain.next();
        let causes: Vec<_> = chain.collect();
        let causes = if causes.is_empty() {
            None
        } else {
            Some(causes)
        };

        ApiErrorResponse {
            success: false,
            detail,
            causes,
        }
    }
}
