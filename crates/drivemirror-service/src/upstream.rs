//! The HTTP boundary to the drive API.
//!
//! Every upstream response is classified exactly once into an [`UpstreamOutcome`]. Retry,
//! rotation and error mapping further up only look at the outcome, never at raw responses.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, Response, StatusCode, header};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::credentials::{Credential, CredentialPool};
use crate::error::DriveError;
use crate::tokens::{AccessToken, TokenProvider};

/// Mime type of folders.
pub const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
/// Mime type of shortcuts pointing to another file.
pub const SHORTCUT_MIME_TYPE: &str = "application/vnd.google-apps.shortcut";

/// Error reasons meaning the quota of the credential is used up.
const QUOTA_REASONS: &[&str] = &[
    "downloadQuotaExceeded",
    "dailyLimitExceeded",
    "userRateLimitExceeded",
    "rateLimitExceeded",
    "quotaExceeded",
];

/// Fields requested for a single file.
const FILE_FIELDS: &str = "id, name, mimeType, size, createdTime, modifiedTime, \
                           thumbnailLink, fileExtension, shortcutDetails";

/// Points a shortcut to its target.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ShortcutDetails {
    pub target_id: String,
    #[serde(default)]
    pub target_mime_type: Option<String>,
}

/// A file resource as returned by the drive API.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    /// The size in bytes, as a decimal string. Missing for folders and native documents.
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub modified_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub thumbnail_link: Option<String>,
    #[serde(default)]
    pub file_extension: Option<String>,
    #[serde(default)]
    pub shortcut_details: Option<ShortcutDetails>,
}

impl DriveFile {
    /// The size in bytes, `0` if unknown.
    pub fn size(&self) -> u64 {
        self.size
            .as_deref()
            .and_then(|size| size.parse().ok())
            .unwrap_or(0)
    }

    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME_TYPE
    }
}

/// A page of a `files.list` call.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileList {
    #[serde(default)]
    pub files: Vec<DriveFile>,
    #[serde(default)]
    pub next_page_token: Option<String>,
}

/// Parameters of a `files.list` call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FilesQuery {
    /// The search expression.
    pub q: String,
    pub fields: &'static str,
    pub order_by: &'static str,
    pub page_size: u32,
    pub page_token: Option<String>,
    /// Searches all shared drives instead of the user's corpus.
    pub all_drives: bool,
}

impl FilesQuery {
    fn to_pairs(&self) -> Vec<(&'static str, String)> {
        let mut pairs = vec![
            ("q", self.q.clone()),
            ("fields", self.fields.to_owned()),
            ("orderBy", self.order_by.to_owned()),
            ("pageSize", self.page_size.to_string()),
            ("supportsAllDrives", "true".to_owned()),
            ("includeItemsFromAllDrives", "true".to_owned()),
        ];
        if self.all_drives {
            pairs.push(("corpora", "allDrives".to_owned()));
        } else {
            pairs.push(("spaces", "drive".to_owned()));
        }
        if let Some(ref page_token) = self.page_token {
            pairs.push(("pageToken", page_token.clone()));
        }
        pairs
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    error: ErrorDetails,
}

#[derive(Deserialize)]
struct ErrorDetails {
    #[serde(default)]
    errors: Vec<ErrorItem>,
}

#[derive(Deserialize)]
struct ErrorItem {
    #[serde(default)]
    reason: Option<String>,
}

/// Extracts the reason of the first error of a drive error body.
fn error_reason(body: &str) -> Option<String> {
    let body: ErrorBody = serde_json::from_str(body).ok()?;
    body.error.errors.into_iter().next()?.reason
}

/// The classified result of a single upstream request.
#[derive(Debug)]
pub enum UpstreamOutcome {
    /// A successful (2xx) response, with the body not consumed yet.
    Success(Response),
    /// The quota of the credential is exhausted, with the upstream reason.
    RateLimited(String),
    NotFound,
    /// The credential was rejected.
    AuthInvalid(String),
    /// A temporary failure, either a 5xx status or a transport error.
    Transient { status: Option<u16>, details: String },
    /// Any other unsuccessful response.
    Other { status: u16, body: String },
}

impl UpstreamOutcome {
    /// Sends the request and classifies its response.
    pub async fn send(request: RequestBuilder) -> Self {
        match request.send().await {
            Ok(response) => Self::classify(response).await,
            Err(err) => match DriveError::from(err) {
                DriveError::Transient { status, details } => Self::Transient { status, details },
                err => Self::Transient {
                    status: None,
                    details: err.to_string(),
                },
            },
        }
    }

    pub async fn classify(response: Response) -> Self {
        let status = response.status();
        if status.is_success() {
            return Self::Success(response);
        }

        match status {
            StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT => Self::Transient {
                status: Some(status.as_u16()),
                details: status.to_string(),
            },
            StatusCode::NOT_FOUND => Self::NotFound,
            StatusCode::UNAUTHORIZED => {
                let body = response.text().await.unwrap_or_default();
                Self::AuthInvalid(body.trim().to_owned())
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                let quota_reason = matches!(
                    status,
                    StatusCode::FORBIDDEN | StatusCode::TOO_MANY_REQUESTS
                )
                .then(|| error_reason(&body))
                .flatten()
                .filter(|reason| QUOTA_REASONS.contains(&reason.as_str()));

                match quota_reason {
                    Some(reason) => Self::RateLimited(reason),
                    None => Self::Other {
                        status: status.as_u16(),
                        body,
                    },
                }
            }
        }
    }

    /// Converts every outcome but [`Success`](Self::Success) into the matching error.
    pub fn into_result(self) -> Result<Response, DriveError> {
        match self {
            Self::Success(response) => Ok(response),
            Self::RateLimited(reason) => Err(DriveError::QuotaExhausted { reason }),
            Self::NotFound => Err(DriveError::NotFound),
            Self::AuthInvalid(details) => Err(DriveError::Auth(details)),
            Self::Transient { status, details } => Err(DriveError::Transient { status, details }),
            Self::Other { status, body } => Err(DriveError::Upstream { status, body }),
        }
    }
}

/// How often API calls are attempted on transient failures.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub backoff: Duration,
}

/// Client of the drive API.
///
/// Holds everything needed to make authorized requests: the shared HTTP client, the
/// credential pool and the token provider.
#[derive(Debug)]
pub struct DriveApi {
    client: Client,
    base: Url,
    pool: Arc<CredentialPool>,
    tokens: Arc<TokenProvider>,
    retry: RetryPolicy,
}

impl DriveApi {
    pub fn new(
        client: Client,
        base: Url,
        pool: Arc<CredentialPool>,
        tokens: Arc<TokenProvider>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            base,
            pool,
            tokens,
            retry,
        }
    }

    pub fn pool(&self) -> &Arc<CredentialPool> {
        &self.pool
    }

    pub fn tokens(&self) -> &Arc<TokenProvider> {
        &self.tokens
    }

    fn files_url(&self) -> Result<Url, DriveError> {
        self.base
            .join("files")
            .map_err(|err| DriveError::Configuration(format!("invalid api url: {err}")))
    }

    /// Returns the URL of a single file resource.
    pub fn file_url(&self, file_id: &str) -> Result<Url, DriveError> {
        let mut url = self.files_url()?;
        url.path_segments_mut()
            .map_err(|_| DriveError::Configuration("api url cannot be a base".into()))?
            .push(file_id);
        Ok(url)
    }

    /// Returns the URL downloading the contents of a file.
    pub fn media_url(&self, file_id: &str) -> Result<Url, DriveError> {
        let mut url = self.file_url(file_id)?;
        url.query_pairs_mut()
            .append_pair("alt", "media")
            .append_pair("supportsAllDrives", "true");
        Ok(url)
    }

    /// Fetches the metadata of a file.
    pub async fn get_file(&self, file_id: &str) -> Result<DriveFile, DriveError> {
        let url = self.file_url(file_id)?;
        self.authorized("files.get", |token| {
            let request = self
                .client
                .get(url.clone())
                .query(&[("supportsAllDrives", "true"), ("fields", FILE_FIELDS)])
                .header(header::AUTHORIZATION, token.bearer_token());
            async move { json(UpstreamOutcome::send(request).await).await }
        })
        .await
    }

    /// Lists files matching `query`.
    pub async fn list_files(&self, query: &FilesQuery) -> Result<FileList, DriveError> {
        let url = self.files_url()?;
        let pairs = query.to_pairs();
        self.authorized("files.list", |token| {
            let request = self
                .client
                .get(url.clone())
                .query(&pairs)
                .header(header::AUTHORIZATION, token.bearer_token());
            async move { json(UpstreamOutcome::send(request).await).await }
        })
        .await
    }

    /// Runs `request` with a token of the current credential.
    ///
    /// Transient failures are retried with a fixed backoff. Quota errors rotate to the next
    /// credential until every credential of the pool was tried.
    async fn authorized<T, F, Fut>(&self, operation: &'static str, mut request: F) -> Result<T, DriveError>
    where
        F: FnMut(AccessToken) -> Fut,
        Fut: Future<Output = Result<T, DriveError>>,
    {
        let mut escalation = self.pool.escalation();
        let (mut slot, mut credential) = self.pool.current();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let result = match self.tokens.get_token(&credential).await {
                Ok(token) => request(token).await,
                Err(err) => Err(err),
            };

            match result {
                Ok(value) => return Ok(value),
                Err(DriveError::QuotaExhausted { reason }) => {
                    metric!(counter("upstream.quota_exceeded") += 1, "operation" => operation);
                    (slot, credential) = escalation.exhausted(&self.pool, slot, &reason)?;
                    attempt = 0;
                }
                Err(err) if err.is_transient() && attempt < self.retry.attempts => {
                    tracing::warn!(operation, attempt, error = %err, "upstream request failed, retrying");
                    tokio::time::sleep(self.retry.backoff).await;
                }
                Err(err) => {
                    if let DriveError::Auth(_) = err {
                        self.tokens.invalidate(&credential).await;
                    }
                    tracing::debug!(operation, error = %err, "upstream request failed");
                    return Err(err);
                }
            }
        }
    }

    /// Starts a ranged download of a file with the given credential.
    ///
    /// `client` is the dedicated client of the stream.
    pub async fn media(
        &self,
        client: &Client,
        credential: &Arc<Credential>,
        file_id: &str,
        range: (u64, u64),
    ) -> UpstreamOutcome {
        let url = match self.media_url(file_id) {
            Ok(url) => url,
            Err(err) => {
                return UpstreamOutcome::Other {
                    status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                    body: err.to_string(),
                };
            }
        };
        let token = match self.tokens.get_token(credential).await {
            Ok(token) => token,
            Err(DriveError::Auth(details)) => return UpstreamOutcome::AuthInvalid(details),
            Err(DriveError::Transient { status, details }) => {
                return UpstreamOutcome::Transient { status, details };
            }
            Err(err) => {
                return UpstreamOutcome::Other {
                    status: StatusCode::BAD_GATEWAY.as_u16(),
                    body: err.to_string(),
                };
            }
        };

        let (start, end) = range;
        let request = client
            .get(url)
            .header(header::AUTHORIZATION, token.bearer_token())
            .header(header::RANGE, format!("bytes={start}-{end}"));

        let outcome = UpstreamOutcome::send(request).await;
        if let UpstreamOutcome::AuthInvalid(_) = outcome {
            self.tokens.invalidate(credential).await;
        }
        outcome
    }
}

/// Parses the JSON body of a successful outcome.
async fn json<T: DeserializeOwned>(outcome: UpstreamOutcome) -> Result<T, DriveError> {
    let response = outcome.into_result()?;
    let bytes = response.bytes().await?;
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_reason() {
        let body = r#"{
            "error": {
                "errors": [{
                    "domain": "usageLimits",
                    "reason": "downloadQuotaExceeded",
                    "message": "The download quota for this file has been exceeded."
                }],
                "code": 403,
                "message": "The download quota for this file has been exceeded."
            }
        }"#;
        assert_eq!(error_reason(body).as_deref(), Some("downloadQuotaExceeded"));

        assert_eq!(error_reason(r#"{"error": {"errors": []}}"#), None);
        assert_eq!(error_reason("{'error': 'not json'}"), None);
        assert_eq!(error_reason(""), None);
    }

    #[test]
    fn test_drive_file() {
        let json = r#"{
            "id": "1AbC",
            "name": "movie.mkv",
            "mimeType": "video/x-matroska",
            "size": "1073741824",
            "createdTime": "2024-01-02T03:04:05.000Z",
            "fileExtension": "mkv"
        }"#;
        let file: DriveFile = serde_json::from_str(json).unwrap();
        assert_eq!(file.size(), 1 << 30);
        assert!(!file.is_folder());
        assert_eq!(file.file_extension.as_deref(), Some("mkv"));
        assert!(file.created_time.is_some());

        let folder: DriveFile = serde_json::from_str(
            r#"{"id": "2", "name": "Shows", "mimeType": "application/vnd.google-apps.folder"}"#,
        )
        .unwrap();
        assert_eq!(folder.size(), 0);
        assert!(folder.is_folder());
    }

    #[test]
    fn test_files_query_pairs() {
        let query = FilesQuery {
            q: "'root' in parents".into(),
            fields: "files(id)",
            order_by: "folder,name",
            page_size: 50,
            page_token: Some("next".into()),
            all_drives: false,
        };
        let pairs = query.to_pairs();
        assert!(pairs.contains(&("spaces", "drive".into())));
        assert!(pairs.contains(&("pageToken", "next".into())));
        assert!(pairs.contains(&("pageSize", "50".into())));
        assert!(!pairs.iter().any(|(key, _)| *key == "corpora"));
    }

    fn test_pool() -> CredentialPool {
        CredentialPool::new(vec![Credential::RefreshToken(
            crate::credentials::RefreshTokenRecord {
                client_id: "client".into(),
                client_secret: "secret".into(),
                refresh_token: "refresh".into(),
                token_uri: Url::parse("http://localhost/token").unwrap(),
            },
        )])
        .unwrap()
    }

    #[test]
    fn test_urls() {
        let api = DriveApi::new(
            Client::new(),
            Url::parse("https://www.googleapis.com/drive/v3/").unwrap(),
            Arc::new(test_pool()),
            Arc::new(TokenProvider::new(Client::new(), Default::default(), None)),
            RetryPolicy {
                attempts: 1,
                backoff: Duration::ZERO,
            },
        );
        assert_eq!(
            api.file_url("a/b c").unwrap().as_str(),
            "https://www.googleapis.com/drive/v3/files/a%2Fb%20c"
        );
        assert_eq!(
            api.media_url("1AbC").unwrap().as_str(),
            "https://www.googleapis.com/drive/v3/files/1AbC?alt=media&supportsAllDrives=true"
        );
    }
}
