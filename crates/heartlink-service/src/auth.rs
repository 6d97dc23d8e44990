//! Token acquisition and authenticated requests.
//!
//! [`AuthSession`] caches one bearer token. Callers run requests through
//! [`AuthSession::authorize`], which acquires a token when none is cached
//! (or it has expired), retries once after a 401, and drops the cached
//! token whenever anything goes wrong.
//!
//! Concurrent callers share a single acquisition: the cache sits behind an
//! async mutex that is held for the duration of the token request.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};

use heartlink_core::Clock;
use heartlink_store::KeyValueStore;
use heartlink_store::kv::AUTH_TOKEN_KEY;

use crate::error::{Error, Result};

/// An access token with its expiry.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthTokenPair {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(with = "time::serde::timestamp")]
    pub expires_at: OffsetDateTime,
}

impl AuthTokenPair {
    /// Whether the token can still be used at `now`. Expiry is exclusive.
    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        now < self.expires_at
    }
}

impl fmt::Debug for AuthTokenPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthTokenPair")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Outcome of one authenticated request attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorized<T> {
    Ok(T),
    /// The server answered 401.
    Unauthorized,
}

/// Something that can issue fresh tokens.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn acquire(&self) -> Result<AuthTokenPair>;
}

/// Persistence for the cached token.
pub trait TokenStore: Send + Sync {
    fn load(&self) -> Result<Option<AuthTokenPair>>;
    fn save(&self, token: &AuthTokenPair) -> Result<()>;
    fn clear(&self) -> Result<()>;
}

impl TokenStore for KeyValueStore {
    fn load(&self) -> Result<Option<AuthTokenPair>> {
        Ok(self.get(AUTH_TOKEN_KEY)?)
    }

    fn save(&self, token: &AuthTokenPair) -> Result<()> {
        self.set(AUTH_TOKEN_KEY, token)?;
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.remove(AUTH_TOKEN_KEY)?;
        Ok(())
    }
}

/// A token store that only lives as long as the process.
#[derive(Debug, Default)]
pub struct MemoryTokenStore {
    token: Mutex<Option<AuthTokenPair>>,
}

impl TokenStore for MemoryTokenStore {
    fn load(&self) -> Result<Option<AuthTokenPair>> {
        Ok(self
            .token
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    fn save(&self, token: &AuthTokenPair) -> Result<()> {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = Some(token.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        *self.token.lock().unwrap_or_else(PoisonError::into_inner) = None;
        Ok(())
    }
}

/// Client credentials and user login for the password grant.
#[derive(Clone)]
pub struct Credentials {
    pub token_url: String,
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("token_url", &self.token_url)
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// Acquires tokens from an OAuth2 token endpoint with the password grant.
#[derive(Debug, Clone)]
pub struct HttpTokenSource {
    client: Client,
    credentials: Credentials,
    clock: Arc<dyn Clock>,
}

impl HttpTokenSource {
    pub fn new(client: Client, credentials: Credentials, clock: Arc<dyn Clock>) -> Self {
        Self {
            client,
            credentials,
            clock,
        }
    }
}

#[async_trait]
impl TokenSource for HttpTokenSource {
    async fn acquire(&self) -> Result<AuthTokenPair> {
        let creds = &self.credentials;
        debug!(url = %creds.token_url, "Requesting access token");

        let response = self
            .client
            .post(&creds.token_url)
            .basic_auth(&creds.client_id, Some(&creds.client_secret))
            .form(&[
                ("client_id", creds.client_id.as_str()),
                ("client_secret", creds.client_secret.as_str()),
                ("grant_type", "password"),
                ("username", creds.username.as_str()),
                ("password", creds.password.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(Error::TokenRejected {
                status: status.as_u16(),
                message,
            });
        }

        let body: TokenResponse = response.json().await?;
        let expires_at = self.clock.now() + time::Duration::seconds(body.expires_in);
        info!("Acquired access token valid until {}", expires_at);

        Ok(AuthTokenPair {
            access_token: body.access_token,
            refresh_token: body.refresh_token,
            expires_at,
        })
    }
}

/// Cached bearer token shared by every authenticated request.
pub struct AuthSession {
    source: Arc<dyn TokenSource>,
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    token: tokio::sync::Mutex<Option<AuthTokenPair>>,
}

impl fmt::Debug for AuthSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSession").finish_non_exhaustive()
    }
}

impl AuthSession {
    pub fn new(
        source: Arc<dyn TokenSource>,
        store: Arc<dyn TokenStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            source,
            store,
            clock,
            token: tokio::sync::Mutex::new(None),
        }
    }

    /// A usable token, acquiring one if needed.
    ///
    /// Falls back to the persisted token before asking the source.
    pub async fn token(&self) -> Result<AuthTokenPair> {
        let mut cached = self.token.lock().await;
        let now = self.clock.now();

        if let Some(token) = cached.as_ref().filter(|t| t.is_valid_at(now)) {
            return Ok(token.clone());
        }

        if cached.is_none() {
            match self.store.load() {
                Ok(Some(stored)) if stored.is_valid_at(now) => {
                    debug!("Using persisted access token");
                    *cached = Some(stored.clone());
                    return Ok(stored);
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to read persisted token: {}", e),
            }
        }

        let fresh = match self.source.acquire().await {
            Ok(token) => token,
            Err(e) => {
                *cached = None;
                self.clear_persisted();
                return Err(e);
            }
        };

        if let Err(e) = self.store.save(&fresh) {
            warn!("Failed to persist access token: {}", e);
        }
        *cached = Some(fresh.clone());
        Ok(fresh)
    }

    /// Drop the cached and persisted token.
    pub async fn invalidate(&self) {
        *self.token.lock().await = None;
        self.clear_persisted();
    }

    /// Drop the cached token only if it is still `access_token`.
    ///
    /// Another caller may already have replaced it.
    async fn invalidate_token(&self, access_token: &str) {
        let mut cached = self.token.lock().await;
        if cached
            .as_ref()
            .is_some_and(|t| t.access_token == access_token)
        {
            *cached = None;
            self.clear_persisted();
        }
    }

    fn clear_persisted(&self) {
        if let Err(e) = self.store.clear() {
            warn!("Failed to clear persisted token: {}", e);
        }
    }

    /// Run `request` with a bearer token.
    ///
    /// On [`Authorized::Unauthorized`] the token is replaced and the request
    /// is retried once. A second 401 gives [`Error::Unauthorized`]. Any error
    /// invalidates the token.
    pub async fn authorize<T, F, Fut>(&self, request: F) -> Result<T>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<Authorized<T>>>,
    {
        for attempt in 1..=2 {
            let token = self.token().await?;
            match request(token.access_token.clone()).await {
                Ok(Authorized::Ok(value)) => return Ok(value),
                Ok(Authorized::Unauthorized) => {
                    warn!(attempt, "Request unauthorized, dropping token");
                    self.invalidate_token(&token.access_token).await;
                }
                Err(e) => {
                    self.invalidate_token(&token.access_token).await;
                    return Err(e);
                }
            }
        }
        Err(Error::Unauthorized)
    }
}

/// Map a response status to [`Authorized`].
pub(crate) fn check_status(status: StatusCode) -> Authorized<()> {
    if status == StatusCode::UNAUTHORIZED {
        Authorized::Unauthorized
    } else {
        Authorized::Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use heartlink_core::ManualClock;

    #[derive(Debug)]
    struct CountingSource {
        calls: AtomicUsize,
        clock: Arc<ManualClock>,
        delay: Duration,
        fail: bool,
    }

    impl CountingSource {
        fn new(clock: Arc<ManualClock>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                clock,
                delay: Duration::from_millis(50),
                fail: false,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenSource for CountingSource {
        async fn acquire(&self) -> Result<AuthTokenPair> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.fail {
                return Err(Error::TokenRejected {
                    status: 400,
                    message: "invalid_grant".into(),
                });
            }
            Ok(AuthTokenPair {
                access_token: format!("token-{n}"),
                refresh_token: None,
                expires_at: self.clock.now() + time::Duration::hours(1),
            })
        }
    }

    fn session(source: Arc<CountingSource>, store: Arc<MemoryTokenStore>) -> AuthSession {
        let clock = source.clock.clone();
        AuthSession::new(source, store, clock)
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_share_one_acquisition() {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let source = Arc::new(CountingSource::new(clock));
        let auth = Arc::new(session(source.clone(), Arc::default()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let auth = auth.clone();
                tokio::spawn(async move { auth.token().await })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap().access_token, "token-1");
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_is_replaced() {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let source = Arc::new(CountingSource::new(clock.clone()));
        let auth = session(source.clone(), Arc::default());

        assert_eq!(auth.token().await.unwrap().access_token, "token-1");
        clock.advance(Duration::from_secs(30 * 60));
        assert_eq!(auth.token().await.unwrap().access_token, "token-1");
        clock.advance(Duration::from_secs(30 * 60));
        assert_eq!(auth.token().await.unwrap().access_token, "token-2");
    }

    #[test]
    fn test_token_invalid_at_expiry() {
        let expires_at = OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(60);
        let token = AuthTokenPair {
            access_token: "a".into(),
            refresh_token: None,
            expires_at,
        };
        assert!(token.is_valid_at(expires_at - time::Duration::seconds(1)));
        assert!(!token.is_valid_at(expires_at));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persisted_token_is_reused() {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let source = Arc::new(CountingSource::new(clock.clone()));
        let store = Arc::new(MemoryTokenStore::default());
        store
            .save(&AuthTokenPair {
                access_token: "stored".into(),
                refresh_token: None,
                expires_at: clock.now() + time::Duration::hours(1),
            })
            .unwrap();

        let auth = session(source.clone(), store);
        assert_eq!(auth.token().await.unwrap().access_token, "stored");
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_requests_share_one_acquisition() {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let source = Arc::new(CountingSource::new(clock));
        let auth = Arc::new(session(source.clone(), Arc::default()));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let auth = auth.clone();
                tokio::spawn(async move {
                    auth.authorize(|token| async move {
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        Ok(Authorized::Ok(token))
                    })
                    .await
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "token-1");
        }
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unauthorized_retries_once() {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let source = Arc::new(CountingSource::new(clock));
        let auth = session(source.clone(), Arc::default());
        let attempts = AtomicUsize::new(0);

        let seen = auth
            .authorize(|token| {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Ok(Authorized::Unauthorized)
                    } else {
                        Ok(Authorized::Ok(token))
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(seen, "token-2");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_unauthorized_is_an_error() {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let source = Arc::new(CountingSource::new(clock));
        let store = Arc::new(MemoryTokenStore::default());
        let auth = session(source.clone(), store.clone());

        let result: Result<()> = auth
            .authorize(|_| async { Ok(Authorized::Unauthorized) })
            .await;

        assert!(matches!(result, Err(Error::Unauthorized)));
        assert_eq!(source.calls(), 2);
        assert!(store.load().unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_error_invalidates_token() {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let source = Arc::new(CountingSource::new(clock));
        let store = Arc::new(MemoryTokenStore::default());
        let auth = session(source.clone(), store.clone());

        let result: Result<()> = auth
            .authorize(|_| async { Err(Error::InvalidConfig("boom".into())) })
            .await;
        assert!(result.is_err());
        assert!(store.load().unwrap().is_none());

        assert_eq!(auth.token().await.unwrap().access_token, "token-2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_failure_clears_persisted_token() {
        let clock = Arc::new(ManualClock::new(OffsetDateTime::UNIX_EPOCH));
        let mut source = CountingSource::new(clock.clone());
        source.fail = true;
        let store = Arc::new(MemoryTokenStore::default());
        store
            .save(&AuthTokenPair {
                access_token: "stale".into(),
                refresh_token: None,
                expires_at: clock.now(),
            })
            .unwrap();

        let auth = session(Arc::new(source), store.clone());
        assert!(matches!(
            auth.token().await,
            Err(Error::TokenRejected { status: 400, .. })
        ));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_kv_token_store() {
        let dir = tempfile::tempdir().unwrap();
        let kv = KeyValueStore::open(dir.path().join("state.json")).unwrap();
        let token = AuthTokenPair {
            access_token: "abc".into(),
            refresh_token: Some("def".into()),
            expires_at: OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap(),
        };

        TokenStore::save(&kv, &token).unwrap();
        assert_eq!(TokenStore::load(&kv).unwrap(), Some(token));
        TokenStore::clear(&kv).unwrap();
        assert_eq!(TokenStore::load(&kv).unwrap(), None);
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let creds = Credentials {
            token_url: "https://auth.example.com/token".into(),
            client_id: "client".into(),
            client_secret: "s3cret".into(),
            username: "user".into(),
            password: "hunter2".into(),
        };
        let debug = format!("{creds:?}");
        assert!(!debug.contains("s3cret"));
        assert!(!debug.contains("hunter2"));
    }
}
