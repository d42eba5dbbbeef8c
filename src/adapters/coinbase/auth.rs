//! Short-lived signed tokens for the streaming protocol.
//!
//! Tokens are ES256 JWTs signed with the API key's EC private key. Each one
//! carries a fresh random nonce and lives `token_lifetime_secs`. The manager
//! never hands out a token with less than `refresh_buffer_secs` of remaining
//! lifetime and refreshes proactively `refresh_lead_secs` before that point.
//!
//! All regeneration goes through one async mutex, so a subscribe that asks for
//! a token while a refresh is running waits for the new one.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::logging::sanitize_token;
use crate::config::AuthConfig;
use crate::core::types::Clock;

/// Retry delay of the refresh task after a signing failure
const REFRESH_RETRY_MS: u64 = 1_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Key material missing or unusable. Fatal at startup.
    #[error("Invalid signing key: {0}")]
    InvalidKey(String),

    /// Signing failed this time; the caller retries
    #[error("Token signing failed: {0}")]
    Signing(String),
}

/// A signed token and its validity window
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken {
    pub value: String,
    pub issued_at_ms: u64,
    pub expires_at_ms: u64,
}

impl AuthToken {
    pub fn remaining_ms(&self, now_ms: u64) -> u64 {
        self.expires_at_ms.saturating_sub(now_ms)
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("value", &sanitize_token(&self.value))
            .field("issued_at_ms", &self.issued_at_ms)
            .field("expires_at_ms", &self.expires_at_ms)
            .finish()
    }
}

/// Produces signed tokens
pub trait TokenSigner: Send + Sync {
    fn sign(&self, issued_at_secs: u64, expires_at_secs: u64, nonce: &str) -> Result<String, AuthError>;
}

// =============================================================================
// ES256 signer
// =============================================================================

#[derive(Debug, Serialize)]
struct StreamClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    nbf: u64,
    exp: u64,
    nonce: &'a str,
}

/// ES256 signer over a PKCS#8 EC private key
pub struct Es256Signer {
    key_name: String,
    key: EncodingKey,
}

impl fmt::Debug for Es256Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Es256Signer")
            .field("key_name", &self.key_name)
            .finish_non_exhaustive()
    }
}

impl Es256Signer {
    /// Load and verify key material.
    ///
    /// Environment-provided PEMs often carry literal `\n`; those are unescaped.
    /// A trial signature is produced so a bad key fails here, not on first use.
    pub fn from_pem(key_name: &str, pem: &str) -> Result<Self, AuthError> {
        if key_name.trim().is_empty() {
            return Err(AuthError::InvalidKey("API key name is empty".to_string()));
        }
        let pem = pem.replace("\\n", "\n");
        if !pem.contains("-----BEGIN") {
            return Err(AuthError::InvalidKey("private key is not PEM encoded".to_string()));
        }
        let key = EncodingKey::from_ec_pem(pem.as_bytes()).map_err(|e| {
            AuthError::InvalidKey(format!("{} (EC keys must be PKCS#8 PEM)", e))
        })?;

        let signer = Self {
            key_name: key_name.to_string(),
            key,
        };
        signer
            .sign(0, 1, "startup-check")
            .map_err(|e| AuthError::InvalidKey(e.to_string()))?;
        Ok(signer)
    }

    /// Read the key name and PEM from the environment variables named in config.
    pub fn from_env(config: &AuthConfig) -> Result<Self, AuthError> {
        let key_name = std::env::var(&config.key_name_env)
            .map_err(|_| AuthError::InvalidKey(format!("{} not set", config.key_name_env)))?;
        let pem = std::env::var(&config.private_key_env)
            .map_err(|_| AuthError::InvalidKey(format!("{} not set", config.private_key_env)))?;
        Self::from_pem(&key_name, &pem)
    }
}

impl TokenSigner for Es256Signer {
    fn sign(&self, issued_at_secs: u64, expires_at_secs: u64, nonce: &str) -> Result<String, AuthError> {
        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.key_name.clone());

        let claims = StreamClaims {
            iss: "cdp",
            sub: &self.key_name,
            nbf: issued_at_secs,
            exp: expires_at_secs,
            nonce,
        };
        encode(&header, &claims, &self.key).map_err(|e| AuthError::Signing(e.to_string()))
    }
}

// =============================================================================
// AuthTokenManager
// =============================================================================

pub struct AuthTokenManager {
    signer: Arc<dyn TokenSigner>,
    clock: Arc<dyn Clock>,
    lifetime_ms: u64,
    buffer_ms: u64,
    lead_ms: u64,
    current: Mutex<Option<AuthToken>>,
    generated: AtomicU64,
}

impl fmt::Debug for AuthTokenManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthTokenManager")
            .field("lifetime_ms", &self.lifetime_ms)
            .field("buffer_ms", &self.buffer_ms)
            .field("generated", &self.generated.load(Ordering::Relaxed))
            .finish()
    }
}

impl AuthTokenManager {
    pub fn new(signer: Arc<dyn TokenSigner>, clock: Arc<dyn Clock>, config: &AuthConfig) -> Self {
        Self {
            signer,
            clock,
            lifetime_ms: config.token_lifetime_secs * 1_000,
            buffer_ms: config.refresh_buffer_secs * 1_000,
            lead_ms: config.refresh_lead_secs * 1_000,
            current: Mutex::new(None),
            generated: AtomicU64::new(0),
        }
    }

    /// A token valid for at least the safety buffer.
    pub async fn current_token(&self) -> Result<AuthToken, AuthError> {
        let mut current = self.current.lock().await;
        let now = self.clock.now_ms();
        if let Some(token) = current.as_ref() {
            if token.remaining_ms(now) >= self.buffer_ms {
                return Ok(token.clone());
            }
        }
        let token = self.generate(now)?;
        *current = Some(token.clone());
        Ok(token)
    }

    /// Regenerate unconditionally (after the exchange rejected the token).
    pub async fn force_refresh(&self) -> Result<AuthToken, AuthError> {
        let mut current = self.current.lock().await;
        let token = self.generate(self.clock.now_ms())?;
        *current = Some(token.clone());
        info!(expires_at_ms = token.expires_at_ms, "[AUTH] Token force-refreshed");
        Ok(token)
    }

    /// Regenerate when within `buffer + lead` of expiry. Returns true if it did.
    pub async fn refresh_if_due(&self) -> Result<bool, AuthError> {
        let mut current = self.current.lock().await;
        let now = self.clock.now_ms();
        let due = match current.as_ref() {
            Some(token) => token.remaining_ms(now) < self.buffer_ms + self.lead_ms,
            None => true,
        };
        if !due {
            return Ok(false);
        }
        let token = self.generate(now)?;
        debug!(expires_at_ms = token.expires_at_ms, "[AUTH] Token refreshed proactively");
        *current = Some(token);
        Ok(true)
    }

    /// Time until the proactive refresh point of the current token.
    pub async fn until_refresh(&self) -> Duration {
        let current = self.current.lock().await;
        let now = self.clock.now_ms();
        let ms = current
            .as_ref()
            .map(|t| t.remaining_ms(now).saturating_sub(self.buffer_ms + self.lead_ms))
            .unwrap_or(0);
        Duration::from_millis(ms)
    }

    /// Number of tokens generated so far
    pub fn generated(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }

    /// Spawn the proactive refresh timer. Stops when `cancel` fires.
    pub fn spawn_refresh_task(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let wait = self.until_refresh().await;
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(wait) => {}
                }
                if let Err(e) = self.refresh_if_due().await {
                    warn!(error = %e, "[AUTH] Proactive refresh failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_millis(REFRESH_RETRY_MS)) => {}
                    }
                }
            }
            debug!("[AUTH] Refresh task stopped");
        })
    }

    fn generate(&self, now_ms: u64) -> Result<AuthToken, AuthError> {
        let nonce = hex::encode(rand::random::<[u8; 16]>());
        let issued_at_secs = now_ms / 1_000;
        let expires_at_secs = issued_at_secs + self.lifetime_ms / 1_000;
        let value = self.signer.sign(issued_at_secs, expires_at_secs, &nonce)?;
        self.generated.fetch_add(1, Ordering::Relaxed);
        Ok(AuthToken {
            value,
            issued_at_ms: issued_at_secs * 1_000,
            expires_at_ms: expires_at_secs * 1_000,
        })
    }
}

// =============================================================================
// Test support
// =============================================================================

/// Signer producing opaque numbered tokens; can be told to fail.
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct CountingSigner {
    pub calls: AtomicU64,
    pub fail: std::sync::atomic::AtomicBool,
    pub nonces: parking_lot::Mutex<Vec<String>>,
}

#[cfg(test)]
impl TokenSigner for CountingSigner {
    fn sign(&self, issued_at_secs: u64, expires_at_secs: u64, nonce: &str) -> Result<String, AuthError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(AuthError::Signing("hsm unavailable".to_string()));
        }
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.nonces.lock().push(nonce.to_string());
        Ok(format!("token-{}-{}-{}", n, issued_at_secs, expires_at_secs))
    }
}
