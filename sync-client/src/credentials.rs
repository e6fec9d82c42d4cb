//! Session credentials.
//!
//! A [`Credential`] pairs the current session token with the provider
//! that can mint a new one. The [`CredentialRepository`] holds the current
//! credential and runs refreshes: concurrent refresh requests share a
//! single provider call, and a cancelled refresh resolves everyone
//! waiting on it with [`ClientError::Cancelled`].

use async_trait::async_trait;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chatsync_types::UserId;
use serde::Deserialize;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;
use tokio::sync::oneshot;
use zeroize::Zeroizing;

use crate::api::{decode, ApiClient, ApiError, Endpoint, GuestTokenResponse};
use crate::error::ClientError;

/// Token errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TokenError {
    /// The token could not be parsed.
    #[error("malformed token: {0}")]
    Malformed(String),

    /// The provider could not produce a token.
    #[error("token provider failed: {0}")]
    Provider(String),

    /// The token endpoint failed.
    #[error(transparent)]
    Api(#[from] ApiError),
}

/// A session token.
///
/// The raw value is wiped from memory on drop and never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    raw: Zeroizing<String>,
    user_id: UserId,
    expires_at: Option<u64>,
}

#[derive(Deserialize)]
struct Claims {
    user_id: String,
    #[serde(default)]
    exp: Option<u64>,
}

impl Token {
    /// Wrap a raw token issued for `user_id`.
    pub fn new(raw: impl Into<String>, user_id: UserId) -> Self {
        Self {
            raw: Zeroizing::new(raw.into()),
            user_id,
            expires_at: None,
        }
    }

    /// Parse a JWT, taking the user id from its `user_id` claim.
    pub fn from_jwt(raw: impl Into<String>) -> Result<Self, TokenError> {
        let raw = Zeroizing::new(raw.into());
        let payload = raw
            .split('.')
            .nth(1)
            .ok_or_else(|| TokenError::Malformed("expected three segments".into()))?;
        let bytes = URL_SAFE_NO_PAD
            .decode(payload.trim_end_matches('='))
            .map_err(|e| TokenError::Malformed(e.to_string()))?;
        let claims: Claims =
            serde_json::from_slice(&bytes).map_err(|e| TokenError::Malformed(e.to_string()))?;
        Ok(Self {
            raw,
            user_id: UserId::new(claims.user_id),
            expires_at: claims.exp.map(|secs| secs.saturating_mul(1000)),
        })
    }

    /// Unsigned token accepted by backends with auth checks disabled.
    pub fn development(user_id: UserId) -> Self {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let claims = serde_json::json!({ "user_id": user_id.as_str() }).to_string();
        let payload = URL_SAFE_NO_PAD.encode(claims.as_bytes());
        Self::new(format!("{header}.{payload}.devtoken"), user_id)
    }

    /// The raw token.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// User the token was issued for.
    pub fn user_id(&self) -> &UserId {
        &self.user_id
    }

    /// Expiry (unix millis), when the token carries one.
    pub fn expires_at(&self) -> Option<u64> {
        self.expires_at
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("user_id", &self.user_id)
            .field("raw", &"[REDACTED]")
            .finish()
    }
}

/// User identity sent with the connect request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserInfo {
    /// User id
    pub id: UserId,
    /// Display name
    pub name: Option<String>,
}

impl UserInfo {
    /// User with only an id.
    pub fn new(id: impl Into<UserId>) -> Self {
        Self {
            id: id.into(),
            name: None,
        }
    }

    /// Set the display name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// Source of session tokens.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    /// Fetch a token for `user_id`.
    async fn fetch_token(&self, user_id: &UserId) -> Result<Token, TokenError>;
}

/// Provider that always returns the same token.
#[derive(Debug)]
pub struct StaticTokenProvider {
    token: Token,
    calls: AtomicUsize,
}

impl StaticTokenProvider {
    /// Create a provider for `token`.
    pub fn new(token: Token) -> Self {
        Self {
            token,
            calls: AtomicUsize::new(0),
        }
    }

    /// Number of fetches so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn fetch_token(&self, _user_id: &UserId) -> Result<Token, TokenError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.token.clone())
    }
}

/// Provider that creates guest users through the API.
pub struct GuestTokenProvider {
    api: Arc<dyn ApiClient>,
    user: UserInfo,
}

impl GuestTokenProvider {
    /// Create a provider for the guest `user`.
    pub fn new(api: Arc<dyn ApiClient>, user: UserInfo) -> Self {
        Self { api, user }
    }
}

#[async_trait]
impl TokenProvider for GuestTokenProvider {
    async fn fetch_token(&self, _user_id: &UserId) -> Result<Token, TokenError> {
        let response: GuestTokenResponse =
            decode(self.api.request(Endpoint::guest_token(&self.user)).await?)?;
        Ok(Token::new(response.access_token, response.user.id))
    }
}

/// Who the client connects as.
#[derive(Clone)]
pub struct Principal {
    /// User identity
    pub user: UserInfo,
    /// Where tokens come from
    pub provider: Arc<dyn TokenProvider>,
}

impl Principal {
    /// Create a principal.
    pub fn new(user: UserInfo, provider: Arc<dyn TokenProvider>) -> Self {
        Self { user, provider }
    }

    /// Fetch a credential for this principal.
    ///
    /// The user id carried by the token wins over the one in `user`.
    pub async fn resolve(&self) -> Result<Credential, ClientError> {
        let token = self
            .provider
            .fetch_token(&self.user.id)
            .await
            .map_err(ClientError::CredentialRefreshFailed)?;
        let user = UserInfo {
            id: token.user_id().clone(),
            name: self.user.name.clone(),
        };
        Ok(Credential {
            token,
            user,
            provider: Arc::clone(&self.provider),
        })
    }
}

impl fmt::Debug for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Principal").field("user", &self.user).finish()
    }
}

/// The current token and the means to refresh it.
#[derive(Clone)]
pub struct Credential {
    /// Current token
    pub token: Token,
    /// User the token belongs to
    pub user: UserInfo,
    /// Provider used for refreshes
    pub provider: Arc<dyn TokenProvider>,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("token", &self.token)
            .field("user", &self.user)
            .finish()
    }
}

type RefreshWaiter = oneshot::Sender<Result<Arc<Credential>, ClientError>>;

#[derive(Default)]
struct RefreshState {
    generation: u64,
    waiters: Option<Vec<RefreshWaiter>>,
}

/// Holds the current credential and coordinates refreshes.
#[derive(Default)]
pub struct CredentialRepository {
    current: RwLock<Option<Arc<Credential>>>,
    refresh: Mutex<RefreshState>,
}

impl CredentialRepository {
    /// Create an empty repository.
    pub fn new() -> Self {
        Self::default()
    }

    fn refresh_state(&self) -> MutexGuard<'_, RefreshState> {
        self.refresh
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// The current credential.
    pub fn current(&self) -> Option<Arc<Credential>> {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// User of the current credential.
    pub fn current_user(&self) -> Option<UserId> {
        self.current().map(|c| c.user.id.clone())
    }

    /// Replace the current credential.
    pub fn install(&self, credential: Credential) -> Arc<Credential> {
        let credential = Arc::new(credential);
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::clone(&credential));
        credential
    }

    /// A refresh is in progress.
    pub fn is_refreshing(&self) -> bool {
        self.refresh_state().waiters.is_some()
    }

    /// Fetch a new token from the current provider and install it.
    ///
    /// Concurrent callers share one provider call and all receive its
    /// result.
    pub async fn refresh(&self) -> Result<Arc<Credential>, ClientError> {
        let (generation, follower) = {
            let mut state = self.refresh_state();
            match state.waiters.as_mut() {
                Some(waiters) => {
                    let (tx, rx) = oneshot::channel();
                    waiters.push(tx);
                    (state.generation, Some(rx))
                }
                None => {
                    state.waiters = Some(Vec::new());
                    (state.generation, None)
                }
            }
        };

        if let Some(rx) = follower {
            tracing::debug!("Joining credential refresh in progress");
            return rx.await.unwrap_or(Err(ClientError::Cancelled));
        }

        // Releases the followers if this future is dropped mid-fetch
        let guard = LeaderGuard {
            repository: self,
            generation,
        };
        let result = self.fetch_current().await;
        std::mem::forget(guard);

        let waiters = {
            let mut state = self.refresh_state();
            if state.generation != generation {
                // Cancelled meanwhile; waiters were already released
                return Err(ClientError::Cancelled);
            }
            state.waiters.take().unwrap_or_default()
        };

        let result = result.map(|credential| self.install(credential));
        if let Err(error) = &result {
            tracing::warn!("Credential refresh failed: {}", error);
        }
        for waiter in waiters {
            let _ = waiter.send(result.clone());
        }
        result
    }

    async fn fetch_current(&self) -> Result<Credential, ClientError> {
        let current = self.current().ok_or(ClientError::MissingTokenProvider)?;
        let token = current
            .provider
            .fetch_token(&current.user.id)
            .await
            .map_err(ClientError::CredentialRefreshFailed)?;
        Ok(Credential {
            token,
            user: current.user.clone(),
            provider: Arc::clone(&current.provider),
        })
    }

    /// Cancel the refresh in progress, if any.
    ///
    /// Everyone waiting on it receives [`ClientError::Cancelled`] and its
    /// result, when it arrives, is discarded.
    pub fn cancel_refresh(&self) {
        self.cancel_generation(None);
    }

    /// Cancel the refresh in progress if it still belongs to `generation`.
    fn cancel_generation(&self, generation: Option<u64>) {
        let mut state = self.refresh_state();
        if generation.is_some_and(|g| g != state.generation) {
            return;
        }
        if let Some(waiters) = state.waiters.take() {
            tracing::debug!("Cancelling credential refresh ({} waiters)", waiters.len());
            state.generation += 1;
            for waiter in waiters {
                let _ = waiter.send(Err(ClientError::Cancelled));
            }
        }
    }

    /// Cancel any refresh and forget the current credential.
    pub fn clear(&self) {
        self.cancel_refresh();
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = None;
    }
}

/// Held by the caller running the provider fetch.
struct LeaderGuard<'a> {
    repository: &'a CredentialRepository,
    generation: u64,
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        tracing::debug!("Credential refresh dropped before completing");
        self.repository.cancel_generation(Some(self.generation));
    }
}

impl fmt::Debug for CredentialRepository {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRepository")
            .field("user", &self.current_user())
            .field("refreshing", &self.is_refreshing())
            .finish()
    }
}
