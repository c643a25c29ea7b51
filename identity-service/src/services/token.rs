//! Session token manager.
//!
//! Tokens are kept in a sharded map keyed by id. Only the SHA-256 digest of
//! a token's secret is stored; validation hashes the presented secret and
//! compares digests in constant time. Revocation and expiry are one-way.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use secrecy::SecretString;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::task::JoinHandle;

use crate::models::{IssuedToken, Principal, SessionSnapshot, Token};
use crate::services::clock::Clock;
use crate::services::error::{IdentityError, IdentityResult};

const SECRET_ALPHABET: &[u8] = b"bcdfghjklmnpqrstvwxz2456789";
const SECRET_LENGTH: usize = 54;
const ID_SUFFIX_LENGTH: usize = 5;

/// Lifetime rules applied to every issued token.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenPolicy {
    pub default_ttl_millis: i64,
    /// Upper bound for requested TTLs; 0 means unbounded.
    pub max_ttl_millis: i64,
    /// Whether a requested TTL of 0 yields a token without expiry.
    pub allow_non_expiring: bool,
    /// How long expired or revoked tokens stay listed before the sweep drops
    /// them; 0 keeps them until their user is deleted.
    pub retention_millis: i64,
}

impl Default for TokenPolicy {
    fn default() -> Self {
        Self {
            default_ttl_millis: 57_600_000,
            max_ttl_millis: 0,
            allow_non_expiring: false,
            retention_millis: 86_400_000,
        }
    }
}

impl TokenPolicy {
    pub fn effective_ttl(&self, requested: Option<i64>) -> IdentityResult<i64> {
        let ttl = match requested {
            None => self.default_ttl_millis,
            Some(ttl) if ttl < 0 => {
                return Err(IdentityError::Validation(format!(
                    "Token TTL must not be negative: {}",
                    ttl
                )))
            }
            Some(0) if self.allow_non_expiring => return Ok(0),
            Some(0) => self.default_ttl_millis,
            Some(ttl) => ttl,
        };
        if self.max_ttl_millis > 0 && (ttl == 0 || ttl > self.max_ttl_millis) {
            return Ok(self.max_ttl_millis);
        }
        Ok(ttl)
    }
}

/// What a new token should vouch for.
#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub user_id: String,
    pub user_principal: Principal,
    pub group_principals: Vec<Principal>,
    pub auth_provider: String,
    pub provider_info: BTreeMap<String, String>,
    /// `None` uses the policy default.
    pub ttl_millis: Option<i64>,
    pub is_derived: bool,
    pub description: String,
}

impl TokenRequest {
    pub fn new(
        user_id: impl Into<String>,
        user_principal: Principal,
        group_principals: Vec<Principal>,
        auth_provider: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_principal,
            group_principals,
            auth_provider: auth_provider.into(),
            provider_info: BTreeMap::new(),
            ttl_millis: None,
            is_derived: false,
            description: String::new(),
        }
    }

    pub fn with_ttl(mut self, ttl_millis: i64) -> Self {
        self.ttl_millis = Some(ttl_millis);
        self
    }
}

struct StoredToken {
    token: Token,
    secret_hash: String,
}

pub struct TokenManager {
    tokens: DashMap<String, StoredToken>,
    policy: TokenPolicy,
    clock: Arc<dyn Clock>,
}

fn random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| SECRET_ALPHABET[rng.gen_range(0..SECRET_ALPHABET.len())] as char)
        .collect()
}

/// Length and alphabet check, done before any hashing.
pub fn is_well_formed_secret(secret: &str) -> bool {
    secret.len() == SECRET_LENGTH && secret.bytes().all(|b| SECRET_ALPHABET.contains(&b))
}

fn hash_secret(secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

impl TokenManager {
    pub fn new(policy: TokenPolicy, clock: Arc<dyn Clock>) -> Self {
        Self {
            tokens: DashMap::new(),
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> &TokenPolicy {
        &self.policy
    }

    pub fn issue(&self, request: TokenRequest) -> IdentityResult<IssuedToken> {
        let ttl_millis = self.policy.effective_ttl(request.ttl_millis)?;
        self.insert(request, ttl_millis)
    }

    fn insert(&self, request: TokenRequest, ttl_millis: i64) -> IdentityResult<IssuedToken> {
        let now = self.clock.now();
        let secret = random_string(SECRET_LENGTH);
        let secret_hash = hash_secret(&secret);

        loop {
            let id = format!("token-{}", random_string(ID_SUFFIX_LENGTH));
            let Entry::Vacant(slot) = self.tokens.entry(id.clone()) else {
                continue;
            };

            let token = Token {
                id,
                user_principal: request.user_principal,
                group_principals: request.group_principals,
                provider_info: request.provider_info,
                user_id: request.user_id,
                auth_provider: request.auth_provider,
                ttl_millis,
                issued_at: now,
                last_update_time: now,
                is_derived: request.is_derived,
                description: request.description,
                expired: false,
                expires_at: Token::compute_expires_at(now, ttl_millis),
                revoked: false,
            };
            slot.insert(StoredToken {
                token: token.clone(),
                secret_hash,
            });

            tracing::info!(
                token_id = %token.id,
                user_id = %token.user_id,
                provider = %token.auth_provider,
                ttl_millis,
                is_derived = token.is_derived,
                "Token issued"
            );
            return Ok(IssuedToken {
                token,
                secret: SecretString::new(secret),
            });
        }
    }

    /// Check a token's secret and state.
    ///
    /// Unknown ids, wrong secrets and revoked tokens are all `Invalid`.
    /// Never contacts a provider: the snapshot taken at issuance is returned.
    pub fn validate(&self, token_id: &str, secret: &str) -> IdentityResult<SessionSnapshot> {
        let now = self.clock.now();
        if !is_well_formed_secret(secret) {
            return Err(IdentityError::Invalid);
        }
        let Some(mut stored) = self.tokens.get_mut(token_id) else {
            return Err(IdentityError::Invalid);
        };

        let presented = hash_secret(secret);
        let matches: bool = presented
            .as_bytes()
            .ct_eq(stored.secret_hash.as_bytes())
            .into();
        if !matches || stored.token.revoked {
            return Err(IdentityError::Invalid);
        }

        stored.token.refresh_expired(now);
        if stored.token.expired {
            return Err(IdentityError::Expired);
        }

        let token = &stored.token;
        Ok(SessionSnapshot {
            token_id: token.id.clone(),
            user_id: token.user_id.clone(),
            user_principal: token.user_principal.clone(),
            group_principals: token.group_principals.clone(),
            auth_provider: token.auth_provider.clone(),
        })
    }

    /// Validate the `<token id>:<secret>` form.
    pub fn validate_bearer(&self, bearer: &str) -> IdentityResult<SessionSnapshot> {
        let (id, secret) = bearer.split_once(':').ok_or(IdentityError::Invalid)?;
        self.validate(id, secret)
    }

    pub fn revoke(&self, token_id: &str) -> IdentityResult<()> {
        let now = self.clock.now();
        let mut stored = self
            .tokens
            .get_mut(token_id)
            .ok_or_else(|| IdentityError::NotFound(format!("Token {}", token_id)))?;
        if !stored.token.revoked {
            stored.token.revoked = true;
            stored.token.last_update_time = now;
            tracing::info!(token_id = %token_id, user_id = %stored.token.user_id, "Token revoked");
        }
        Ok(())
    }

    /// Mark every token past its lifetime as expired. Returns how many changed.
    ///
    /// Tokens that have been expired or revoked for longer than the
    /// retention window are removed in the same pass.
    pub fn expire_sweep(&self, now: DateTime<Utc>) -> usize {
        let mut changed = 0;
        for mut entry in self.tokens.iter_mut() {
            if entry.token.refresh_expired(now) {
                changed += 1;
            }
        }

        let before = self.tokens.len();
        if self.policy.retention_millis > 0 {
            let retention = chrono::Duration::milliseconds(self.policy.retention_millis);
            self.tokens.retain(|_, stored| {
                let token = &stored.token;
                !((token.expired || token.revoked) && token.last_update_time + retention <= now)
            });
        }
        let purged = before.saturating_sub(self.tokens.len());

        if changed > 0 || purged > 0 {
            tracing::info!(expired = changed, purged, "Token sweep completed");
        }
        changed
    }

    /// Mint a derived token that carries the parent's snapshot.
    ///
    /// The derived token never outlives its parent.
    pub fn derive(
        &self,
        parent_id: &str,
        ttl_millis: Option<i64>,
        description: &str,
    ) -> IdentityResult<IssuedToken> {
        let now = self.clock.now();
        let parent = {
            let mut stored = self.tokens.get_mut(parent_id).ok_or(IdentityError::Invalid)?;
            if stored.token.revoked {
                return Err(IdentityError::Invalid);
            }
            stored.token.refresh_expired(now);
            if stored.token.expired {
                return Err(IdentityError::Expired);
            }
            stored.token.clone()
        };

        let mut ttl = self.policy.effective_ttl(ttl_millis)?;
        if let Some(remaining) = parent.remaining_millis(now) {
            if ttl == 0 || ttl > remaining {
                ttl = remaining;
            }
        }

        let request = TokenRequest {
            user_id: parent.user_id,
            user_principal: parent.user_principal,
            group_principals: parent.group_principals,
            auth_provider: parent.auth_provider,
            provider_info: parent.provider_info,
            ttl_millis: Some(ttl),
            is_derived: true,
            description: description.to_string(),
        };
        self.insert(request, ttl)
    }

    pub fn get(&self, token_id: &str) -> IdentityResult<Token> {
        let now = self.clock.now();
        let mut stored = self
            .tokens
            .get_mut(token_id)
            .ok_or_else(|| IdentityError::NotFound(format!("Token {}", token_id)))?;
        stored.token.refresh_expired(now);
        Ok(stored.token.clone())
    }

    /// The user's tokens, oldest first.
    pub fn list_for_user(&self, user_id: &str) -> Vec<Token> {
        let now = self.clock.now();
        let mut tokens: Vec<Token> = self
            .tokens
            .iter()
            .filter(|entry| entry.token.user_id == user_id)
            .map(|entry| {
                let mut token = entry.token.clone();
                token.refresh_expired(now);
                token
            })
            .collect();
        tokens.sort_by(|a, b| a.issued_at.cmp(&b.issued_at).then_with(|| a.id.cmp(&b.id)));
        tokens
    }

    /// Remove all of a user's tokens. Returns how many were removed.
    pub fn delete_for_user(&self, user_id: &str) -> usize {
        let before = self.tokens.len();
        self.tokens.retain(|_, stored| stored.token.user_id != user_id);
        let removed = before.saturating_sub(self.tokens.len());
        tracing::info!(user_id = %user_id, removed, "User tokens deleted");
        removed
    }

    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                self.expire_sweep(self.clock.now());
            }
        })
    }
}
