//! Principal model - canonical identity records for users and groups.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

use crate::services::IdentityError;

/// Kind of identity a principal stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrincipalType {
    User,
    Group,
}

impl PrincipalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrincipalType::User => "user",
            PrincipalType::Group => "group",
        }
    }
}

impl std::str::FromStr for PrincipalType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(PrincipalType::User),
            "group" => Ok(PrincipalType::Group),
            _ => Err(format!("Invalid principal type: {}", s)),
        }
    }
}

/// Provider-agnostic identity snapshot.
///
/// Principals are produced by a provider query and never edited in place;
/// a changed identity is picked up by resolving it again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub login_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub profile_picture: String,
    #[serde(default, rename = "profileURL", skip_serializing_if = "String::is_empty")]
    pub profile_url: String,
    pub principal_type: PrincipalType,
    #[serde(default, skip_serializing_if = "is_false")]
    pub me: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub member_of: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub provider: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra_info: BTreeMap<String, String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Principal {
    pub fn new(id: &PrincipalId, display_name: impl Into<String>, login_name: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.into(),
            login_name: login_name.into(),
            profile_picture: String::new(),
            profile_url: String::new(),
            principal_type: id.principal_type,
            me: false,
            member_of: false,
            provider: id.provider.clone(),
            extra_info: BTreeMap::new(),
        }
    }

    pub fn parsed_id(&self) -> Result<PrincipalId, IdentityError> {
        PrincipalId::parse(&self.id)
    }

    /// Copy with `me`/`memberOf` computed against the calling session.
    pub fn for_caller(mut self, caller: Option<&CallerContext>) -> Self {
        self.me = false;
        self.member_of = false;
        if let Some(caller) = caller {
            match self.principal_type {
                PrincipalType::User => self.me = caller.principal_id == self.id,
                PrincipalType::Group => self.member_of = caller.group_ids.contains(&self.id),
            }
        }
        self
    }
}

/// Who is asking: the principal and group ids from the caller's token.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    pub principal_id: String,
    pub group_ids: HashSet<String>,
}

impl CallerContext {
    pub fn new(principal: &Principal, groups: &[Principal]) -> Self {
        Self {
            principal_id: principal.id.clone(),
            group_ids: groups.iter().map(|g| g.id.clone()).collect(),
        }
    }
}

/// Structured form of a principal identifier.
///
/// Local users are `local://<user id>`; everything else is
/// `<provider>_<user|group>://<native id>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PrincipalId {
    pub provider: String,
    pub principal_type: PrincipalType,
    pub native_id: String,
}

pub const LOCAL_PROVIDER: &str = "local";

impl PrincipalId {
    pub fn new(provider: &str, principal_type: PrincipalType, native_id: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            principal_type,
            native_id: native_id.into(),
        }
    }

    pub fn local_user(user_id: &str) -> Self {
        Self::new(LOCAL_PROVIDER, PrincipalType::User, user_id)
    }

    pub fn parse(id: &str) -> Result<Self, IdentityError> {
        let (scheme, native) = id
            .split_once("://")
            .ok_or_else(|| IdentityError::Validation(format!("Malformed principal id: {}", id)))?;
        if native.is_empty() {
            return Err(IdentityError::Validation(format!(
                "Principal id has no native part: {}",
                id
            )));
        }

        if scheme == LOCAL_PROVIDER {
            return Ok(Self::local_user(native));
        }

        let (provider, kind) = scheme
            .rsplit_once('_')
            .ok_or_else(|| IdentityError::Validation(format!("Malformed principal id: {}", id)))?;
        let principal_type = kind
            .parse()
            .map_err(|e: String| IdentityError::Validation(e))?;

        Ok(Self::new(provider, principal_type, native))
    }
}

impl fmt::Display for PrincipalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.provider == LOCAL_PROVIDER && self.principal_type == PrincipalType::User {
            write!(f, "{}://{}", LOCAL_PROVIDER, self.native_id)
        } else {
            write!(
                f,
                "{}_{}://{}",
                self.provider,
                self.principal_type.as_str(),
                self.native_id
            )
        }
    }
}

/// Input for free-text principal search.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchPrincipalsInput {
    pub name: String,
    #[serde(default)]
    pub principal_type: Option<PrincipalType>,
}
