//! Login and logout: provider authentication through token issuance.

use std::sync::Arc;

use crate::models::{
    AccessMode, AuthConfig, Credentials, IssuedToken, Principal, PrincipalId, ProviderKind,
    SessionSnapshot,
};
use crate::services::error::{IdentityError, IdentityResult};
use crate::services::group_cache::GroupMembershipCache;
use crate::services::resolver::{retry_once, PrincipalResolver};
use crate::services::token::{TokenManager, TokenRequest};
use crate::services::users::UserService;

#[derive(Debug, Clone)]
pub struct LoginRequest {
    pub provider: ProviderKind,
    pub credentials: Credentials,
    pub ttl_millis: Option<i64>,
    pub description: String,
}

impl LoginRequest {
    pub fn new(provider: ProviderKind, credentials: Credentials) -> Self {
        Self {
            provider,
            credentials,
            ttl_millis: None,
            description: String::new(),
        }
    }

    pub fn with_ttl(mut self, ttl_millis: i64) -> Self {
        self.ttl_millis = Some(ttl_millis);
        self
    }
}

pub struct AuthService {
    resolver: Arc<PrincipalResolver>,
    users: Arc<UserService>,
    groups: Arc<GroupMembershipCache>,
    tokens: Arc<TokenManager>,
}

fn is_allowed<'a>(auth: &AuthConfig, mut candidates: impl Iterator<Item = &'a str>) -> bool {
    candidates.any(|id| auth.allowed_principal_ids.iter().any(|allowed| allowed == id))
}

impl AuthService {
    pub fn new(
        resolver: Arc<PrincipalResolver>,
        users: Arc<UserService>,
        groups: Arc<GroupMembershipCache>,
        tokens: Arc<TokenManager>,
    ) -> Self {
        Self {
            resolver,
            users,
            groups,
            tokens,
        }
    }

    /// Authenticate and issue a token.
    ///
    /// "No such identity" and "wrong credential" surface as the same error.
    pub async fn login(&self, request: LoginRequest) -> IdentityResult<IssuedToken> {
        let provider = request.provider;
        self.login_inner(request).await.map_err(|err| {
            tracing::info!(provider = %provider, reason = %err, "Login failed");
            err.masked_for_login()
        })
    }

    async fn login_inner(&self, request: LoginRequest) -> IdentityResult<IssuedToken> {
        let kind = request.provider;
        let configs = self.resolver.configs();
        if !configs.is_active(kind) {
            return Err(IdentityError::Validation(format!(
                "Provider {} is not enabled",
                kind
            )));
        }

        let identity = match &request.credentials {
            Credentials::Password { .. } => {
                retry_once(|| self.resolver.authenticate(kind, &request.credentials)).await?
            }
            _ => self.resolver.authenticate(kind, &request.credentials).await?,
        };

        let local_groups = if kind.is_local() {
            identity.groups.clone()
        } else {
            self.resolver
                .groups_for(ProviderKind::Local, &identity.user.parsed_id()?)
                .await?
        };

        let user = if kind.is_local() {
            let user_id = identity.user.parsed_id()?.native_id;
            let user = self.users.get(&user_id, None).await?;
            self.check_local_access(&user.principal_ids, &local_groups).await?;
            user
        } else {
            let auth = configs.get_config(kind).await?.auth;
            let existing = self.users.find_by_principal(&identity.user.id).await?;
            let candidates = std::iter::once(identity.user.id.as_str())
                .chain(identity.groups.iter().map(|g| g.id.as_str()))
                .chain(local_groups.iter().map(|g| g.id.as_str()));
            let admitted = match auth.access_mode {
                AccessMode::Unrestricted => true,
                AccessMode::Restricted => existing.is_some() || is_allowed(&auth, candidates),
                AccessMode::Required => is_allowed(&auth, candidates),
            };
            if !admitted {
                return Err(IdentityError::Credential(format!(
                    "{} is not allowed to log in",
                    identity.user.id
                )));
            }
            match existing {
                Some(user) => user,
                None => self.users.get_or_create_for_principal(&identity.user).await?,
            }
        };

        if !kind.is_local() {
            self.groups
                .store_groups(&user.id, kind, identity.groups.clone())
                .await?;
        }
        self.groups
            .store_groups(&user.id, ProviderKind::Local, local_groups.clone())
            .await?;

        let mut group_principals: Vec<Principal> = identity.groups;
        if !kind.is_local() {
            group_principals.extend(local_groups);
        }

        let mut token_request = TokenRequest::new(&user.id, identity.user, group_principals, kind.as_str());
        token_request.provider_info = identity.provider_info;
        token_request.ttl_millis = request.ttl_millis;
        token_request.description = request.description;
        let issued = self.tokens.issue(token_request)?;

        tracing::info!(
            user_id = %user.id,
            provider = %kind,
            token_id = %issued.token.id,
            "Login succeeded"
        );
        Ok(issued)
    }

    /// Local accounts while a federated provider is active follow its access mode.
    async fn check_local_access(
        &self,
        principal_ids: &[String],
        local_groups: &[Principal],
    ) -> IdentityResult<()> {
        let configs = self.resolver.configs();
        let active = configs.active_kind();
        if active.is_local() {
            return Ok(());
        }

        let auth = configs.get_config(active).await?.auth;
        let candidates = principal_ids
            .iter()
            .map(String::as_str)
            .chain(local_groups.iter().map(|g| g.id.as_str()));
        let admitted = match auth.access_mode {
            AccessMode::Unrestricted => true,
            AccessMode::Required => is_allowed(&auth, candidates),
            AccessMode::Restricted => {
                let linked = principal_ids.iter().any(|id| {
                    PrincipalId::parse(id)
                        .map(|parsed| parsed.provider == active.as_str())
                        .unwrap_or(false)
                });
                linked || is_allowed(&auth, candidates)
            }
        };

        if admitted {
            Ok(())
        } else {
            Err(IdentityError::Credential(format!(
                "local login is not allowed while {} is active",
                active
            )))
        }
    }

    pub async fn logout(&self, token_id: &str) -> IdentityResult<()> {
        self.tokens.revoke(token_id)
    }

    /// The session behind a `<token id>:<secret>` credential.
    pub fn session(&self, bearer: &str) -> IdentityResult<SessionSnapshot> {
        self.tokens.validate_bearer(bearer)
    }
}
