//! Group membership cache.
//!
//! One [`UserAttribute`] per user holds, per provider, the group principals
//! of the most recent successful resolution. Refreshes of the same
//! (user, provider) pair are single-flight: callers that arrive while a
//! refresh is running wait for it and share its outcome.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::models::{Principal, ProviderKind, User, UserAttribute};
use crate::services::clock::Clock;
use crate::services::config_store::ProviderConfigStore;
use crate::services::error::{IdentityError, IdentityResult};
use crate::services::resolver::PrincipalResolver;
use crate::services::store::ObjectStore;

const MAX_WRITE_ATTEMPTS: usize = 5;

type RefreshKey = (String, ProviderKind);

#[derive(Default)]
struct RefreshSlot {
    completed: AtomicU64,
    last: Mutex<Option<IdentityResult<Vec<Principal>>>>,
}

pub struct GroupMembershipCache {
    attributes: Arc<dyn ObjectStore<UserAttribute>>,
    users: Arc<dyn ObjectStore<User>>,
    resolver: Arc<PrincipalResolver>,
    clock: Arc<dyn Clock>,
    slots: DashMap<RefreshKey, Arc<RefreshSlot>>,
}

impl GroupMembershipCache {
    pub fn new(
        attributes: Arc<dyn ObjectStore<UserAttribute>>,
        users: Arc<dyn ObjectStore<User>>,
        resolver: Arc<PrincipalResolver>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            attributes,
            users,
            resolver,
            clock,
            slots: DashMap::new(),
        }
    }

    fn configs(&self) -> &ProviderConfigStore {
        self.resolver.configs()
    }

    /// Re-query the provider for the user's groups and replace the cached entry.
    pub async fn refresh(&self, user_id: &str, kind: ProviderKind) -> IdentityResult<Vec<Principal>> {
        let slot = self
            .slots
            .entry((user_id.to_string(), kind))
            .or_default()
            .clone();

        let ticket = slot.completed.load(Ordering::SeqCst);
        let mut last = slot.last.lock().await;
        if slot.completed.load(Ordering::SeqCst) != ticket {
            if let Some(outcome) = last.as_ref() {
                tracing::debug!(user_id = %user_id, provider = %kind, "Reusing in-flight group refresh");
                return match outcome {
                    Ok(groups) => Ok(groups.clone()),
                    Err(err) => Err(err.replicate()),
                };
            }
        }

        let outcome = self.query_and_store(user_id, kind).await;
        let shared = match &outcome {
            Ok(groups) => Ok(groups.clone()),
            Err(err) => Err(err.replicate()),
        };
        *last = Some(shared);
        slot.completed.fetch_add(1, Ordering::SeqCst);
        outcome
    }

    async fn query_and_store(&self, user_id: &str, kind: ProviderKind) -> IdentityResult<Vec<Principal>> {
        let user = self
            .users
            .get(user_id)
            .await?
            .ok_or_else(|| IdentityError::NotFound(format!("User {}", user_id)))?
            .value;
        let principal = user.principal_for_provider(kind.as_str()).ok_or_else(|| {
            IdentityError::NotFound(format!("User {} has no {} principal", user_id, kind))
        })?;

        let provider = self.resolver.provider(kind)?;
        if !provider.supports_group_refresh() {
            return Err(IdentityError::Validation(format!(
                "{} group membership is only known at login",
                kind
            )));
        }

        let groups = self.resolver.groups_for(kind, &principal).await.map_err(|err| {
            tracing::warn!(user_id = %user_id, provider = %kind, error = %err, "Group refresh failed");
            err
        })?;

        self.store_groups(user_id, kind, groups).await
    }

    /// Record a freshly resolved group set (e.g. at login).
    ///
    /// The write replaces the provider's whole entry and is a
    /// compare-and-swap on the user's record, retried on concurrent writes.
    pub async fn store_groups(
        &self,
        user_id: &str,
        kind: ProviderKind,
        groups: Vec<Principal>,
    ) -> IdentityResult<Vec<Principal>> {
        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            let current = self.attributes.get(user_id).await?;
            let (mut attribute, expected) = match current {
                Some(stored) => (stored.value, stored.version),
                None => (UserAttribute::new(user_id), 0),
            };
            attribute.replace(kind.as_str(), groups.clone(), self.clock.now());
            let stored_groups = attribute.groups(kind.as_str()).to_vec();

            match self.attributes.put(user_id, attribute, Some(expected)).await {
                Ok(_) => {
                    tracing::debug!(
                        user_id = %user_id,
                        provider = %kind,
                        groups = stored_groups.len(),
                        "Group membership stored"
                    );
                    return Ok(stored_groups);
                }
                Err(IdentityError::Conflict(_)) if attempt < MAX_WRITE_ATTEMPTS => continue,
                Err(err) => return Err(err),
            }
        }
        Err(IdentityError::Conflict(format!(
            "Group membership of {} kept changing",
            user_id
        )))
    }

    /// Cached groups without contacting the provider.
    ///
    /// Entries of inactive providers are withheld unless `include_inactive`.
    pub async fn lookup(
        &self,
        user_id: &str,
        kind: ProviderKind,
        include_inactive: bool,
    ) -> IdentityResult<Vec<Principal>> {
        if !include_inactive && !self.configs().is_active(kind) {
            return Ok(Vec::new());
        }
        Ok(self
            .attributes
            .get(user_id)
            .await?
            .map(|stored| stored.value.groups(kind.as_str()).to_vec())
            .unwrap_or_default())
    }

    /// Groups usable for authorization right now: local plus the active provider.
    pub async fn active_groups(&self, user_id: &str) -> IdentityResult<Vec<Principal>> {
        let Some(stored) = self.attributes.get(user_id).await? else {
            return Ok(Vec::new());
        };
        let active = self.configs().active_kind();
        let mut groups = stored.value.groups(ProviderKind::Local.as_str()).to_vec();
        if !active.is_local() {
            groups.extend_from_slice(stored.value.groups(active.as_str()));
        }
        Ok(groups)
    }

    pub async fn get(&self, user_id: &str) -> IdentityResult<Option<UserAttribute>> {
        Ok(self.attributes.get(user_id).await?.map(|stored| stored.value))
    }

    /// Drop the user's cache record along with its refresh slots.
    pub async fn remove_user(&self, user_id: &str) -> IdentityResult<()> {
        self.slots.retain(|(user, _), _| user != user_id);
        self.attributes.delete(user_id).await?;
        Ok(())
    }

    /// Refresh every user linked to `kind`. Returns how many succeeded.
    pub async fn refresh_all(&self, kind: ProviderKind) -> IdentityResult<usize> {
        let mut refreshed = 0;
        for (user_id, stored) in self.users.list().await? {
            if stored.value.principal_for_provider(kind.as_str()).is_none() {
                continue;
            }
            match self.refresh(&user_id, kind).await {
                Ok(_) => refreshed += 1,
                Err(err) => {
                    tracing::warn!(user_id = %user_id, provider = %kind, error = %err, "Scheduled group refresh failed")
                }
            }
        }
        Ok(refreshed)
    }

    /// Periodically refresh all users of the active provider.
    pub fn spawn_schedule(self: Arc<Self>, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let active = self.configs().active_kind();
                if active.is_local() {
                    continue;
                }
                let supported = self
                    .resolver
                    .provider(active)
                    .map(|provider| provider.supports_group_refresh())
                    .unwrap_or(false);
                if !supported {
                    continue;
                }
                match self.refresh_all(active).await {
                    Ok(count) => {
                        tracing::info!(provider = %active, users = count, "Scheduled group refresh completed")
                    }
                    Err(err) => {
                        tracing::error!(provider = %active, error = %err, "Scheduled group refresh aborted")
                    }
                }
            }
        })
    }
}
