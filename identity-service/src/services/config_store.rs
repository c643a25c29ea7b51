//! Provider configuration store.
//!
//! One configuration per provider kind plus the active-provider marker. The
//! marker is only ever changed while holding the activation lock, so there is
//! exactly one owner of the "which federated provider is on" transition.

use std::sync::Arc;
use tokio::sync::{watch, Mutex};

use crate::models::{ProviderConfig, ProviderKind};
use crate::services::error::{IdentityError, IdentityResult};
use crate::services::store::{ObjectStore, Versioned};

pub struct ProviderConfigStore {
    store: Arc<dyn ObjectStore<ProviderConfig>>,
    kind_locks: [Mutex<()>; ProviderKind::ALL.len()],
    activation: Mutex<()>,
    active: watch::Sender<ProviderKind>,
}

impl ProviderConfigStore {
    /// Build the store, recovering the active marker from stored `enabled` flags.
    pub async fn load(store: Arc<dyn ObjectStore<ProviderConfig>>) -> IdentityResult<Self> {
        let mut active = ProviderKind::Local;
        for (_, stored) in store.list().await? {
            let kind = stored.value.kind();
            if kind.is_local() || !stored.value.auth.enabled {
                continue;
            }
            if active.is_local() {
                active = kind;
            } else {
                tracing::warn!(
                    kept = %active,
                    ignored = %kind,
                    "More than one federated provider stored as enabled"
                );
            }
        }

        tracing::info!(active_provider = %active, "Provider configuration store loaded");

        let (active_tx, _) = watch::channel(active);
        Ok(Self {
            store,
            kind_locks: std::array::from_fn(|_| Mutex::new(())),
            activation: Mutex::new(()),
            active: active_tx,
        })
    }

    fn kind_lock(&self, kind: ProviderKind) -> &Mutex<()> {
        &self.kind_locks[kind as usize]
    }

    /// Kind of the active federated provider, `Local` when none is active.
    pub fn active_kind(&self) -> ProviderKind {
        *self.active.borrow()
    }

    /// Local is always active; a federated kind only while it holds the marker.
    pub fn is_active(&self, kind: ProviderKind) -> bool {
        kind.is_local() || self.active_kind() == kind
    }

    pub fn subscribe(&self) -> watch::Receiver<ProviderKind> {
        self.active.subscribe()
    }

    pub async fn get(&self, kind: ProviderKind) -> IdentityResult<Versioned<ProviderConfig>> {
        match self.store.get(kind.as_str()).await? {
            Some(stored) => Ok(stored),
            None if kind.is_local() => Ok(Versioned {
                value: ProviderConfig::local(),
                version: 0,
            }),
            None => Err(IdentityError::NotFound(format!(
                "No configuration for provider {}",
                kind
            ))),
        }
    }

    /// Store only, without the version.
    pub async fn get_config(&self, kind: ProviderKind) -> IdentityResult<ProviderConfig> {
        self.get(kind).await.map(|stored| stored.value)
    }

    /// Current version of a kind's config, 0 when nothing is stored.
    pub async fn version(&self, kind: ProviderKind) -> IdentityResult<u64> {
        Ok(self
            .store
            .get(kind.as_str())
            .await?
            .map(|stored| stored.version)
            .unwrap_or(0))
    }

    /// Replace the configuration of one kind.
    ///
    /// Blank secrets keep the stored value and the stored `enabled` flag is
    /// preserved; activation only changes through [`Self::set_active`] or an
    /// apply.
    pub async fn put(
        &self,
        mut config: ProviderConfig,
        expected_version: Option<u64>,
    ) -> IdentityResult<u64> {
        let kind = config.kind();
        let _guard = self.kind_lock(kind).lock().await;

        let stored = self.store.get(kind.as_str()).await?;
        if let Some(stored) = &stored {
            config.inherit_secrets(&stored.value);
        }
        config.validate()?;

        config.auth.enabled = kind.is_local()
            || stored
                .as_ref()
                .map(|s| s.value.auth.enabled)
                .unwrap_or(false);

        let expected = expected_version.or(Some(stored.map(|s| s.version).unwrap_or(0)));
        let version = self.store.put(kind.as_str(), config, expected).await?;

        tracing::info!(provider = %kind, version, "Provider configuration stored");
        Ok(version)
    }

    /// Make `kind` the active provider.
    ///
    /// Fails with `Conflict` when a different federated provider is active and
    /// `switch` is false. Activating `Local` turns every federated provider off.
    pub async fn set_active(&self, kind: ProviderKind, switch: bool) -> IdentityResult<()> {
        let _activation = self.activation.lock().await;
        let previous = self.active_kind();

        if previous == kind {
            return Ok(());
        }
        if !previous.is_local() && !kind.is_local() && !switch {
            return Err(IdentityError::Conflict(format!(
                "Provider {} is already active",
                previous
            )));
        }

        if !kind.is_local() && self.write_enabled(kind, true).await?.is_none() {
            return Err(IdentityError::NotFound(format!(
                "No configuration for provider {}",
                kind
            )));
        }

        if !previous.is_local() {
            if let Err(err) = self.write_enabled(previous, false).await {
                if !kind.is_local() {
                    if let Err(rollback) = self.write_enabled(kind, false).await {
                        tracing::error!(provider = %kind, error = %rollback, "Failed to roll back activation");
                    }
                }
                return Err(err);
            }
        }

        self.active.send_replace(kind);
        tracing::info!(provider = %kind, previous = %previous, "Active provider changed");
        Ok(())
    }

    /// Turn a federated provider off; the active marker falls back to Local.
    pub async fn disable(&self, kind: ProviderKind) -> IdentityResult<()> {
        if kind.is_local() {
            return Err(IdentityError::Validation(
                "The local provider cannot be disabled".to_string(),
            ));
        }

        let _activation = self.activation.lock().await;
        if self.write_enabled(kind, false).await?.is_none() {
            return Err(IdentityError::NotFound(format!(
                "No configuration for provider {}",
                kind
            )));
        }

        if self.active_kind() == kind {
            self.active.send_replace(ProviderKind::Local);
        }
        tracing::info!(provider = %kind, "Provider disabled");
        Ok(())
    }

    /// Commit a config that passed its provider test.
    ///
    /// The write is a compare-and-swap against `expected_version` (or the
    /// version read under the lock). With `activate` the provider takes over
    /// the active marker; if the previous provider cannot be turned off the
    /// committed config is rolled back.
    pub async fn commit_applied(
        &self,
        mut config: ProviderConfig,
        expected_version: Option<u64>,
        activate: bool,
    ) -> IdentityResult<u64> {
        let kind = config.kind();
        let _activation = self.activation.lock().await;
        let previous = self.active_kind();

        let (snapshot, version) = {
            let _guard = self.kind_lock(kind).lock().await;
            let stored = self.store.get(kind.as_str()).await?;
            let current = stored.as_ref().map(|s| s.version).unwrap_or(0);
            if let Some(expected) = expected_version {
                if expected != current {
                    return Err(IdentityError::Conflict(format!(
                        "Configuration for {} changed: expected version {}, found {}",
                        kind, expected, current
                    )));
                }
            }

            config.auth.enabled = kind.is_local()
                || activate
                || stored
                    .as_ref()
                    .map(|s| s.value.auth.enabled)
                    .unwrap_or(false);
            let version = self.store.put(kind.as_str(), config, Some(current)).await?;
            (stored, version)
        };

        if activate && !kind.is_local() && previous != kind {
            if !previous.is_local() {
                if let Err(err) = self.write_enabled(previous, false).await {
                    self.restore(kind, snapshot, version).await;
                    return Err(err);
                }
            }
            self.active.send_replace(kind);
            tracing::info!(provider = %kind, previous = %previous, "Active provider changed");
        }

        Ok(version)
    }

    async fn write_enabled(&self, kind: ProviderKind, enabled: bool) -> IdentityResult<Option<u64>> {
        let _guard = self.kind_lock(kind).lock().await;
        let Some(current) = self.store.get(kind.as_str()).await? else {
            return Ok(None);
        };
        if current.value.auth.enabled == enabled {
            return Ok(Some(current.version));
        }

        let mut config = current.value;
        config.auth.enabled = enabled;
        let version = self
            .store
            .put(kind.as_str(), config, Some(current.version))
            .await?;
        Ok(Some(version))
    }

    async fn restore(
        &self,
        kind: ProviderKind,
        snapshot: Option<Versioned<ProviderConfig>>,
        written_version: u64,
    ) {
        let _guard = self.kind_lock(kind).lock().await;
        let result = match snapshot {
            Some(previous) => self
                .store
                .put(kind.as_str(), previous.value, Some(written_version))
                .await
                .map(|_| ()),
            None => self.store.delete(kind.as_str()).await.map(|_| ()),
        };
        if let Err(err) = result {
            tracing::error!(provider = %kind, error = %err, "Failed to restore configuration");
        }
    }
}
