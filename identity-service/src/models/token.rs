//! Token model - session credentials bound to a principal snapshot.

use chrono::{DateTime, Duration, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::principal::Principal;

/// Session token. The secret is never part of this record; only its digest
/// is kept by the token manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Token {
    pub id: String,
    pub user_principal: Principal,
    pub group_principals: Vec<Principal>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provider_info: BTreeMap<String, String>,
    pub user_id: String,
    pub auth_provider: String,
    #[serde(rename = "ttl")]
    pub ttl_millis: i64,
    pub issued_at: DateTime<Utc>,
    pub last_update_time: DateTime<Utc>,
    pub is_derived: bool,
    pub description: String,
    pub expired: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub revoked: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Token {
    /// `None` for tokens without expiry (TTL 0).
    pub fn compute_expires_at(issued_at: DateTime<Utc>, ttl_millis: i64) -> Option<DateTime<Utc>> {
        (ttl_millis > 0).then(|| issued_at + Duration::milliseconds(ttl_millis))
    }

    /// `now - issued_at >= ttl`, never true for TTL 0.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.ttl_millis > 0 && (now - self.issued_at).num_milliseconds() >= self.ttl_millis
    }

    /// Milliseconds left before expiry, `None` when the token never expires.
    pub fn remaining_millis(&self, now: DateTime<Utc>) -> Option<i64> {
        self.expires_at
            .map(|at| (at - now).num_milliseconds().max(0))
    }

    /// Recompute the derived `expired` flag. Returns whether it changed.
    pub fn refresh_expired(&mut self, now: DateTime<Utc>) -> bool {
        if !self.expired && self.is_expired_at(now) {
            self.expired = true;
            self.last_update_time = now;
            return true;
        }
        false
    }
}

/// A freshly issued token together with its one-time secret.
pub struct IssuedToken {
    pub token: Token,
    pub secret: SecretString,
}

impl IssuedToken {
    /// `<token id>:<secret>`, the form presented back for validation.
    pub fn bearer(&self) -> String {
        format!("{}:{}", self.token.id, self.secret.expose_secret())
    }
}

impl std::fmt::Debug for IssuedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedToken")
            .field("token", &self.token)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// What a valid token vouches for.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub token_id: String,
    pub user_id: String,
    pub user_principal: Principal,
    pub group_principals: Vec<Principal>,
    pub auth_provider: String,
}
