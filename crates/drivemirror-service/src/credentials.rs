//! The pool of credentials used to talk to the drive, and its rotation.
//!
//! Requests always use the [`current`](CredentialPool::current) credential. When upstream
//! reports that its quota is exhausted, the request advances the pool to the next credential
//! and tries again. An [`Escalation`] tracks how many credentials a single request has gone
//! through, so it can give up once every credential was tried.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use rand::Rng;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use url::Url;

use crate::config::{CredentialMode, CredentialsConfig};
use crate::error::DriveError;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

fn default_token_uri() -> Url {
    Url::parse(DEFAULT_TOKEN_URI).expect("static url is valid")
}

/// The contents of a service account key file.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    /// The email of the service account, used as the JWT issuer.
    pub client_email: String,
    /// The PEM encoded RSA key signing the JWT assertion.
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: Url,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key", &"[redacted]")
            .field("token_uri", &self.token_uri.as_str())
            .finish()
    }
}

/// An authorized user record holding a long-lived refresh token.
#[derive(Clone, Deserialize)]
pub struct RefreshTokenRecord {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: Url,
}

impl fmt::Debug for RefreshTokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefreshTokenRecord")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[redacted]")
            .field("refresh_token", &"[redacted]")
            .field("token_uri", &self.token_uri.as_str())
            .finish()
    }
}

/// An identity that can be exchanged for an access token.
#[derive(Clone, Debug)]
pub enum Credential {
    ServiceAccount(ServiceAccountKey),
    RefreshToken(RefreshTokenRecord),
}

/// Stable identity of a [`Credential`], used to key cached access tokens.
///
/// The identity never contains secrets.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CredentialId(Arc<str>);

impl fmt::Display for CredentialId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Credential {
    pub fn id(&self) -> CredentialId {
        let id = match self {
            Credential::ServiceAccount(key) => format!("sa:{}", key.client_email),
            Credential::RefreshToken(record) => {
                let digest = format!("{:x}", Sha256::digest(record.refresh_token.as_bytes()));
                format!("oauth:{}:{}", record.client_id, &digest[..12])
            }
        };
        CredentialId(id.into())
    }

    /// The OAuth endpoint this credential is exchanged at.
    pub fn token_uri(&self) -> &Url {
        match self {
            Credential::ServiceAccount(key) => &key.token_uri,
            Credential::RefreshToken(record) => &record.token_uri,
        }
    }
}

/// The position of the rotation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RotationCursor {
    /// Index of the current credential.
    pub index: usize,
    /// Number of rotations since the pool was created.
    pub rotations: u64,
}

/// An ordered, non-empty sequence of credentials with a rotation cursor.
#[derive(Debug)]
pub struct CredentialPool {
    credentials: Vec<Arc<Credential>>,
    cursor: Mutex<RotationCursor>,
}

impl CredentialPool {
    /// Creates a pool starting at the first credential.
    ///
    /// An empty pool is a [`DriveError::Configuration`] error.
    pub fn new(credentials: Vec<Credential>) -> Result<Self, DriveError> {
        if credentials.is_empty() {
            return Err(DriveError::Configuration(
                "no credentials configured".into(),
            ));
        }

        Ok(Self {
            credentials: credentials.into_iter().map(Arc::new).collect(),
            cursor: Mutex::new(RotationCursor::default()),
        })
    }

    /// Loads the credentials selected by the configuration.
    pub fn from_config(config: &CredentialsConfig) -> Result<Self, DriveError> {
        let credentials = match config.mode {
            CredentialMode::ServiceAccount => load_service_accounts(&config.accounts_dir)?,
            CredentialMode::RefreshToken => vec![load_refresh_token(&config.token_file)?],
        };
        let pool = Self::new(credentials)?;

        if config.randomize_start && pool.len() > 1 {
            let start = rand::thread_rng().gen_range(0..pool.len());
            pool.lock().index = start;
        }

        let (index, credential) = pool.current();
        tracing::info!(
            credentials = pool.len(),
            index,
            credential = %credential.id(),
            "loaded credentials"
        );

        Ok(pool)
    }

    fn lock(&self) -> MutexGuard<'_, RotationCursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.credentials.len()
    }

    /// Always `false`, pools are never empty.
    pub fn is_empty(&self) -> bool {
        self.credentials.is_empty()
    }

    /// Returns the current credential together with its slot in the pool.
    pub fn current(&self) -> (usize, Arc<Credential>) {
        let index = self.lock().index;
        (index, Arc::clone(&self.credentials[index]))
    }

    /// Advances to the next credential, wrapping around at the end.
    pub fn rotate(&self) -> (usize, Arc<Credential>) {
        let mut cursor = self.lock();
        self.advance(&mut cursor)
    }

    /// Advances to the next credential if `slot` is still the current one.
    ///
    /// Concurrent requests that saw the same credential run out of quota all call this with
    /// the same `slot`, and the pool only advances once. Every caller gets the new current
    /// credential.
    pub fn rotate_from(&self, slot: usize) -> (usize, Arc<Credential>) {
        let mut cursor = self.lock();
        if cursor.index != slot {
            return (cursor.index, Arc::clone(&self.credentials[cursor.index]));
        }
        self.advance(&mut cursor)
    }

    fn advance(&self, cursor: &mut RotationCursor) -> (usize, Arc<Credential>) {
        cursor.index = (cursor.index + 1) % self.credentials.len();
        cursor.rotations += 1;
        metric!(counter("credentials.rotation") += 1);
        tracing::info!(
            index = cursor.index,
            rotations = cursor.rotations,
            "switched to the next credential"
        );
        (cursor.index, Arc::clone(&self.credentials[cursor.index]))
    }

    pub fn cursor(&self) -> RotationCursor {
        *self.lock()
    }

    pub fn rotations(&self) -> u64 {
        self.lock().rotations
    }

    /// Starts a new escalation episode for a single request.
    pub fn escalation(&self) -> Escalation {
        Escalation { tried: 1 }
    }
}

/// Counts the credentials a single request went through because of quota errors.
#[derive(Debug)]
pub struct Escalation {
    tried: usize,
}

impl Escalation {
    /// Records that the credential in `slot` ran out of quota.
    ///
    /// Returns the credential to try next, or [`DriveError::AllCredentialsExhausted`] once every
    /// credential of the pool was tried.
    pub fn exhausted(
        &mut self,
        pool: &CredentialPool,
        slot: usize,
        reason: &str,
    ) -> Result<(usize, Arc<Credential>), DriveError> {
        if self.tried >= pool.len() {
            tracing::error!(reason, tried = self.tried, "all credentials are out of quota");
            return Err(DriveError::AllCredentialsExhausted {
                reason: reason.to_owned(),
            });
        }

        tracing::info!(reason, slot, "credential is out of quota");
        self.tried += 1;
        Ok(pool.rotate_from(slot))
    }

    /// The number of credentials tried so far.
    pub fn tried(&self) -> usize {
        self.tried
    }
}

/// Loads every `*.json` service account file in `dir`, ordered by file name.
pub fn load_service_accounts(dir: &Path) -> Result<Vec<Credential>, DriveError> {
    let entries = fs::read_dir(dir).map_err(|err| {
        DriveError::Configuration(format!(
            "failed to read service accounts from {}: {err}",
            dir.display()
        ))
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|err| DriveError::Configuration(err.to_string()))?;
        let path = entry.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "json") {
            paths.push(path);
        }
    }
    paths.sort();

    paths
        .iter()
        .map(|path| read_json(path).map(Credential::ServiceAccount))
        .collect()
}

/// Loads a single refresh token record.
pub fn load_refresh_token(path: &Path) -> Result<Credential, DriveError> {
    read_json(path).map(Credential::RefreshToken)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, DriveError> {
    let contents = fs::read(path).map_err(|err| {
        DriveError::Configuration(format!("failed to read {}: {err}", path.display()))
    })?;
    serde_json::from_slice(&contents).map_err(|err| {
        DriveError::Configuration(format!("invalid credentials in {}: {err}", path.display()))
    })
}

#[cfg(test)]
mod tests {
    use drivemirror_test as dtest;

    use super::*;

    fn service_account(n: usize) -> Credential {
        Credential::ServiceAccount(ServiceAccountKey {
            client_email: format!("mirror-{n}@example.iam.gserviceaccount.com"),
            private_key: String::new(),
            token_uri: default_token_uri(),
        })
    }

    fn pool(size: usize) -> CredentialPool {
        CredentialPool::new((0..size).map(service_account).collect()).unwrap()
    }

    #[test]
    fn test_empty_pool() {
        let err = CredentialPool::new(vec![]).unwrap_err();
        assert!(matches!(err, DriveError::Configuration(_)));
    }

    #[test]
    fn test_rotation_wraps() {
        let pool = pool(3);
        assert_eq!(pool.current().0, 0);

        let indices: Vec<_> = (0..3).map(|_| pool.rotate().0).collect();
        assert_eq!(indices, [1, 2, 0]);
        assert_eq!(pool.current().0, 0);
        assert_eq!(pool.rotations(), 3);

        pool.rotate();
        assert_eq!(
            pool.cursor(),
            RotationCursor {
                index: 1,
                rotations: 4
            }
        );
    }

    #[test]
    fn test_rotate_from_advances_once() {
        let pool = pool(3);
        let (slot, _) = pool.current();

        // Two requests observed the same exhausted credential.
        let (first, _) = pool.rotate_from(slot);
        let (second, _) = pool.rotate_from(slot);

        assert_eq!(first, 1);
        assert_eq!(second, 1);
        assert_eq!(pool.rotations(), 1);
    }

    #[test]
    fn test_concurrent_rotation() {
        let pool = Arc::new(pool(4));
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        pool.rotate();
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(
            pool.cursor(),
            RotationCursor {
                index: 0,
                rotations: 800
            }
        );
    }

    #[test]
    fn test_escalation() {
        let pool = pool(2);
        let mut escalation = pool.escalation();
        let (slot, _) = pool.current();

        let (slot, _) = escalation.exhausted(&pool, slot, "downloadQuotaExceeded").unwrap();
        assert_eq!(slot, 1);
        assert_eq!(escalation.tried(), 2);

        let err = escalation
            .exhausted(&pool, slot, "downloadQuotaExceeded")
            .unwrap_err();
        assert_eq!(
            err,
            DriveError::AllCredentialsExhausted {
                reason: "downloadQuotaExceeded".into()
            }
        );
        assert_eq!(pool.rotations(), 1);
    }

    #[test]
    fn test_single_credential_never_rotates() {
        let pool = pool(1);
        let mut escalation = pool.escalation();
        assert!(escalation.exhausted(&pool, 0, "quotaExceeded").is_err());
        assert_eq!(pool.rotations(), 0);
    }

    #[test]
    fn test_load_service_accounts() {
        dtest::setup();

        let dir = dtest::tempdir();
        for name in ["sa-1.json", "sa-0.json"] {
            fs::copy(
                dtest::fixture(format!("accounts/{name}")),
                dir.path().join(name),
            )
            .unwrap();
        }
        fs::write(dir.path().join("README.md"), "not a key").unwrap();

        let credentials = load_service_accounts(dir.path()).unwrap();
        let ids: Vec<_> = credentials.iter().map(|c| c.id().to_string()).collect();
        assert_eq!(
            ids,
            [
                "sa:mirror-0@drivemirror-test.iam.gserviceaccount.com",
                "sa:mirror-1@drivemirror-test.iam.gserviceaccount.com",
            ]
        );
        assert_eq!(
            credentials[0].token_uri().as_str(),
            "https://oauth2.googleapis.com/token"
        );
    }

    #[test]
    fn test_load_from_config() {
        dtest::setup();

        let config = CredentialsConfig {
            mode: CredentialMode::ServiceAccount,
            accounts_dir: dtest::fixture("accounts"),
            randomize_start: false,
            ..Default::default()
        };
        let pool = CredentialPool::from_config(&config).unwrap();
        assert_eq!(pool.len(), 2);
        assert_eq!(pool.current().0, 0);

        let empty = dtest::tempdir();
        let config = CredentialsConfig {
            mode: CredentialMode::ServiceAccount,
            accounts_dir: empty.path().to_owned(),
            ..Default::default()
        };
        let err = CredentialPool::from_config(&config).unwrap_err();
        assert!(matches!(err, DriveError::Configuration(_)));
    }

    #[test]
    fn test_load_refresh_token() {
        let credential = load_refresh_token(&dtest::fixture("token.json")).unwrap();
        let id = credential.id().to_string();
        assert!(id.starts_with("oauth:1234567890-test.apps.googleusercontent.com:"));
        assert_eq!(id.len(), "oauth:1234567890-test.apps.googleusercontent.com:".len() + 12);

        // Secrets are not part of the debug output.
        let debug = format!("{credential:?}");
        assert!(!debug.contains("test-client-secret"));
        assert!(!debug.contains("1//test-refresh-token"));
    }

    #[test]
    fn test_missing_refresh_token() {
        let err = load_refresh_token(Path::new("/does/not/exist.json")).unwrap_err();
        assert!(matches!(err, DriveError::Configuration(_)));
    }
}
