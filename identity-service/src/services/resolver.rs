//! Principal resolution and search across the active provider and the local store.

use futures::stream::{self, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::models::{
    CallerContext, Credentials, Principal, PrincipalId, PrincipalType, ProviderKind,
    SearchPrincipalsInput,
};
use crate::services::config_store::ProviderConfigStore;
use crate::services::error::{IdentityError, IdentityResult};
use crate::services::provider::{
    AuthenticatedIdentity, IdentityProvider, NativeRecord, PrincipalStream, ProviderRegistry,
};
use crate::services::providers::with_deadline;

pub struct PrincipalResolver {
    configs: Arc<ProviderConfigStore>,
    registry: ProviderRegistry,
    call_timeout: Duration,
}

impl PrincipalResolver {
    pub fn new(configs: Arc<ProviderConfigStore>, registry: ProviderRegistry, call_timeout: Duration) -> Self {
        Self {
            configs,
            registry,
            call_timeout,
        }
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    pub fn configs(&self) -> &Arc<ProviderConfigStore> {
        &self.configs
    }

    /// Map a native record with the attribute names of the stored config.
    pub async fn resolve(&self, kind: ProviderKind, record: &NativeRecord) -> IdentityResult<Principal> {
        let provider = self.registry.get(kind)?;
        let config = self.configs.get_config(kind).await?;
        provider.resolve(&config, record)
    }

    /// Search the active provider, then the local store.
    ///
    /// The returned stream is lazy: the local query only runs once the active
    /// provider's results are exhausted. Each item must arrive within the
    /// call timeout; a stalled provider ends the stream with
    /// `ProviderUnavailable`.
    pub async fn search(
        &self,
        text: &str,
        principal_type: Option<PrincipalType>,
        caller: Option<CallerContext>,
    ) -> IdentityResult<PrincipalStream> {
        let active = self.configs.active_kind();
        let mut kinds = Vec::new();
        if !active.is_local() {
            kinds.push(active);
        }
        kinds.push(ProviderKind::Local);

        let mut sources = Vec::with_capacity(kinds.len());
        for kind in kinds {
            let provider = self.registry.get(kind)?;
            let config = self.configs.get_config(kind).await?;
            sources.push((provider, config));
        }

        let deadline = self.call_timeout;
        let text = text.to_string();
        let results = stream::iter(sources)
            .flat_map(move |(provider, config)| {
                let text = text.clone();
                let opened = stream::once(async move {
                    with_deadline(
                        "principal search",
                        deadline,
                        provider.search(&config, &text, principal_type),
                    )
                    .await
                });
                opened
                    .flat_map(move |result| match result {
                        Ok(inner) => with_item_deadline(inner, deadline),
                        Err(err) => stream::iter(vec![Err(err)]).boxed(),
                    })
                    .boxed()
            })
            .map(move |item| item.map(|principal| principal.for_caller(caller.as_ref())));

        Ok(results.boxed())
    }

    pub async fn search_principals(
        &self,
        input: &SearchPrincipalsInput,
        caller: Option<CallerContext>,
    ) -> IdentityResult<PrincipalStream> {
        self.search(&input.name, input.principal_type, caller).await
    }

    /// Look up one principal through the provider that owns its id.
    ///
    /// Federated principals of a provider that is not active are reported as
    /// `ProviderUnavailable`, never as missing.
    pub async fn get_principal(&self, id: &str, caller: Option<&CallerContext>) -> IdentityResult<Principal> {
        let parsed = PrincipalId::parse(id)?;
        let provider = self.registry.for_principal(&parsed)?;
        let kind = provider.kind();
        if !self.configs.is_active(kind) {
            return Err(IdentityError::ProviderUnavailable(format!(
                "Provider {} is not active",
                kind
            )));
        }

        let config = self.configs.get_config(kind).await?;
        let principal = with_deadline(
            "principal lookup",
            self.call_timeout,
            provider.get_principal(&config, &parsed),
        )
        .await?;
        Ok(principal.for_caller(caller))
    }

    pub async fn authenticate(
        &self,
        kind: ProviderKind,
        credentials: &Credentials,
    ) -> IdentityResult<AuthenticatedIdentity> {
        let provider = self.registry.get(kind)?;
        let config = self.configs.get_config(kind).await?;
        with_deadline(
            "authentication",
            self.call_timeout,
            provider.authenticate(&config, credentials),
        )
        .await
    }

    pub async fn groups_for(&self, kind: ProviderKind, principal: &PrincipalId) -> IdentityResult<Vec<Principal>> {
        let provider = self.registry.get(kind)?;
        let config = self.configs.get_config(kind).await?;
        with_deadline(
            "group lookup",
            self.call_timeout,
            provider.groups_for(&config, principal),
        )
        .await
    }

    pub fn provider(&self, kind: ProviderKind) -> IdentityResult<Arc<dyn IdentityProvider>> {
        self.registry.get(kind)
    }
}

/// Enforce `deadline` on every item of `inner`; a timeout ends the stream.
fn with_item_deadline(inner: PrincipalStream, deadline: Duration) -> PrincipalStream {
    stream::unfold(Some(inner), move |state| async move {
        let mut inner = state?;
        match timeout(deadline, inner.next()).await {
            Ok(Some(item)) => Some((item, Some(inner))),
            Ok(None) => None,
            Err(_) => Some((
                Err(IdentityError::ProviderUnavailable(format!(
                    "principal search stalled for {}ms",
                    deadline.as_millis()
                ))),
                None,
            )),
        }
    })
    .boxed()
}

/// Run `op`, retrying exactly once when it fails with a transient error.
pub async fn retry_once<T, F, Fut>(mut op: F) -> IdentityResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = IdentityResult<T>>,
{
    match op().await {
        Err(err) if err.is_retryable() => {
            tracing::warn!(error = %err, "Provider call failed, retrying once");
            op().await
        }
        other => other,
    }
}
