//! Test-then-apply pipeline for provider configurations.
//!
//! A candidate moves `Draft -> Testing` and ends either `Applied` or
//! `Rejected`. Nothing is persisted until the provider test has passed, and a
//! failed commit leaves the previously applied config in place.

use serde::Serialize;
use std::sync::Arc;

use crate::models::{
    ApplyRequest, ConfigTestOutput, ProviderConfig, ProviderKind,
};
use crate::services::error::{IdentityError, IdentityResult};
use crate::services::group_cache::GroupMembershipCache;
use crate::services::provider::AuthenticatedIdentity;
use crate::services::providers::with_deadline;
use crate::services::resolver::PrincipalResolver;
use crate::services::store::Versioned;
use crate::services::users::UserService;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyState {
    Draft,
    Testing,
    Applied,
    Rejected,
}

impl ApplyState {
    fn can_move_to(self, next: ApplyState) -> bool {
        matches!(
            (self, next),
            (ApplyState::Draft, ApplyState::Testing)
                | (ApplyState::Testing, ApplyState::Applied)
                | (ApplyState::Testing, ApplyState::Rejected)
        )
    }
}

/// Result of a successful apply.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub kind: ProviderKind,
    pub state: ApplyState,
    pub version: u64,
    /// False when the request matched what was already applied.
    pub changed: bool,
    pub identity: Option<AuthenticatedIdentity>,
}

struct ApplyAttempt {
    kind: ProviderKind,
    state: ApplyState,
}

impl ApplyAttempt {
    fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            state: ApplyState::Draft,
        }
    }

    fn advance(&mut self, next: ApplyState) -> IdentityResult<()> {
        if !self.state.can_move_to(next) {
            return Err(IdentityError::Internal(anyhow::anyhow!(
                "Illegal apply transition for {}: {:?} -> {:?}",
                self.kind,
                self.state,
                next
            )));
        }
        tracing::debug!(provider = %self.kind, from = ?self.state, to = ?next, "Apply state changed");
        self.state = next;
        Ok(())
    }
}

pub struct ApplyPipeline {
    resolver: Arc<PrincipalResolver>,
    users: Arc<UserService>,
    groups: Arc<GroupMembershipCache>,
}

impl ApplyPipeline {
    pub fn new(
        resolver: Arc<PrincipalResolver>,
        users: Arc<UserService>,
        groups: Arc<GroupMembershipCache>,
    ) -> Self {
        Self {
            resolver,
            users,
            groups,
        }
    }

    async fn stored(&self, kind: ProviderKind) -> IdentityResult<Option<Versioned<ProviderConfig>>> {
        match self.resolver.configs().get(kind).await {
            Ok(stored) => Ok(Some(stored)),
            Err(IdentityError::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn prepare(&self, mut candidate: ProviderConfig) -> IdentityResult<(ProviderConfig, Option<Versioned<ProviderConfig>>)> {
        let stored = self.stored(candidate.kind()).await?;
        if let Some(stored) = &stored {
            candidate.inherit_secrets(&stored.value);
        }
        candidate.validate()?;
        Ok((candidate, stored))
    }

    /// Check a candidate without applying it. OAuth and SAML kinds return the
    /// redirect that starts the interactive half of the test.
    pub async fn test_config(&self, config: ProviderConfig) -> IdentityResult<ConfigTestOutput> {
        let kind = config.kind();
        let (candidate, _) = self.prepare(config).await?;
        let provider = self.resolver.provider(kind)?;
        with_deadline(
            "configuration test",
            self.resolver.call_timeout(),
            provider.test_config(&candidate),
        )
        .await
    }

    pub async fn test_and_apply(&self, request: ApplyRequest) -> IdentityResult<ApplyOutcome> {
        let kind = request.config.kind();
        let mut attempt = ApplyAttempt::new(kind);
        attempt.advance(ApplyState::Testing)?;

        match self.run(request).await {
            Ok(mut outcome) => {
                attempt.advance(ApplyState::Applied)?;
                outcome.state = attempt.state;
                tracing::info!(
                    provider = %kind,
                    version = outcome.version,
                    changed = outcome.changed,
                    "Provider configuration applied"
                );
                Ok(outcome)
            }
            Err(err) => {
                attempt.advance(ApplyState::Rejected)?;
                tracing::warn!(
                    provider = %kind,
                    error_kind = ?err.kind(),
                    error = %err,
                    "Provider configuration rejected"
                );
                Err(err)
            }
        }
    }

    async fn run(&self, request: ApplyRequest) -> IdentityResult<ApplyOutcome> {
        let ApplyRequest {
            config,
            credentials,
            enable,
            invoking_user,
            expected_version,
        } = request;
        let kind = config.kind();
        let configs = self.resolver.configs();

        let (candidate, stored) = self.prepare(config).await?;
        let current_version = stored.as_ref().map(|s| s.version).unwrap_or(0);
        if let Some(expected) = expected_version {
            if expected != current_version {
                return Err(IdentityError::Conflict(format!(
                    "Configuration for {} changed: expected version {}, found {}",
                    kind, expected, current_version
                )));
            }
        }

        if let Some(stored) = &stored {
            let already_active = !enable || configs.is_active(kind);
            if stored.version > 0 && stored.value.same_settings(&candidate) && already_active {
                return Ok(ApplyOutcome {
                    kind,
                    state: ApplyState::Testing,
                    version: stored.version,
                    changed: false,
                    identity: None,
                });
            }
        }

        let provider = self.resolver.provider(kind)?;
        let identity = with_deadline(
            "configuration test",
            self.resolver.call_timeout(),
            provider.test_and_apply(&candidate, &credentials),
        )
        .await?;

        let mut linked = None;
        if let (Some(user_id), Some(identity)) = (&invoking_user, &identity) {
            let user = self.users.get(user_id, None).await?;
            if !user.has_principal(&identity.user.id) {
                self.users.link_principal(user_id, &identity.user.id).await?;
                linked = Some((user_id.clone(), identity.user.id.clone()));
            }
        }

        let version = match configs
            .commit_applied(candidate, Some(current_version), enable)
            .await
        {
            Ok(version) => version,
            Err(err) => {
                if let Some((user_id, principal_id)) = linked {
                    if let Err(unlink) = self.users.unlink_principal(&user_id, &principal_id).await {
                        tracing::error!(
                            user_id = %user_id,
                            principal_id = %principal_id,
                            error = %unlink,
                            "Failed to undo principal link after rejected apply"
                        );
                    }
                }
                return Err(err);
            }
        };

        if let (Some(user_id), Some(identity)) = (&invoking_user, &identity) {
            if let Err(err) = self
                .groups
                .store_groups(user_id, kind, identity.groups.clone())
                .await
            {
                tracing::warn!(user_id = %user_id, provider = %kind, error = %err, "Could not record groups after apply");
            }
        }

        Ok(ApplyOutcome {
            kind,
            state: ApplyState::Testing,
            version,
            changed: true,
            identity,
        })
    }

    /// Turn a provider off; the active marker falls back to Local.
    pub async fn disable(&self, kind: ProviderKind) -> IdentityResult<()> {
        self.resolver.configs().disable(kind).await?;
        tracing::info!(provider = %kind, "Provider disabled");
        Ok(())
    }
}
