pub mod config;
pub mod models;
pub mod services;
pub mod utils;

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::models::{Group, GroupMember, ProviderConfig, ProviderKind, User, UserAttribute};
use crate::services::providers::{
    AzureAdProvider, AzureGraphApi, AzureGraphClient, DirectoryConnector, DirectoryProvider,
    GithubApi, GithubClient, GithubProvider, HttpMetadataSource, LdapConnector, LocalProvider,
    SamlMetadataSource, SamlProvider,
};
use crate::services::{
    ApplyPipeline, AuthService, Clock, GroupMembershipCache, IdentityResult, MemoryStore,
    ObjectStore, PrincipalResolver, ProviderConfigStore, ProviderRegistry, SystemClock,
    TokenManager, TokenPolicy, UserService,
};

/// Backing stores for everything the core persists.
#[derive(Clone)]
pub struct CoreStores {
    pub configs: Arc<dyn ObjectStore<ProviderConfig>>,
    pub users: Arc<dyn ObjectStore<User>>,
    pub attributes: Arc<dyn ObjectStore<UserAttribute>>,
    pub groups: Arc<dyn ObjectStore<Group>>,
    pub members: Arc<dyn ObjectStore<GroupMember>>,
}

impl CoreStores {
    pub fn in_memory() -> Self {
        Self {
            configs: Arc::new(MemoryStore::new()),
            users: Arc::new(MemoryStore::new()),
            attributes: Arc::new(MemoryStore::new()),
            groups: Arc::new(MemoryStore::new()),
            members: Arc::new(MemoryStore::new()),
        }
    }
}

/// Remote systems the federated providers talk to.
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn DirectoryConnector>,
    pub github: Arc<dyn GithubApi>,
    pub azure: Arc<dyn AzureGraphApi>,
    pub saml_metadata: Arc<dyn SamlMetadataSource>,
}

impl Collaborators {
    /// Network-backed collaborators sharing one HTTP client.
    pub fn network(client: reqwest::Client) -> Self {
        Self {
            directory: Arc::new(LdapConnector::new()),
            github: Arc::new(GithubClient::new(client.clone())),
            azure: Arc::new(AzureGraphClient::new(client.clone())),
            saml_metadata: Arc::new(HttpMetadataSource::new(client)),
        }
    }
}

pub struct IdentityCoreBuilder {
    collaborators: Collaborators,
    stores: CoreStores,
    policy: TokenPolicy,
    call_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl IdentityCoreBuilder {
    pub fn stores(mut self, stores: CoreStores) -> Self {
        self.stores = stores;
        self
    }

    pub fn token_policy(mut self, policy: TokenPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub async fn build(self) -> IdentityResult<IdentityCore> {
        let Self {
            collaborators,
            stores,
            policy,
            call_timeout,
            clock,
        } = self;

        let configs = Arc::new(ProviderConfigStore::load(stores.configs.clone()).await?);

        let local = Arc::new(LocalProvider::new(
            stores.users.clone(),
            stores.groups.clone(),
            stores.members.clone(),
        ));
        let mut registry = ProviderRegistry::new()
            .with(local.clone())
            .with(Arc::new(GithubProvider::new(collaborators.github)))
            .with(Arc::new(AzureAdProvider::new(collaborators.azure)));
        for kind in ProviderKind::ALL {
            if kind.is_directory() {
                registry.register(Arc::new(DirectoryProvider::new(
                    kind,
                    collaborators.directory.clone(),
                )));
            } else if kind.is_saml() {
                registry.register(Arc::new(SamlProvider::new(
                    kind,
                    collaborators.saml_metadata.clone(),
                )));
            }
        }

        let resolver = Arc::new(PrincipalResolver::new(configs.clone(), registry, call_timeout));
        let groups = Arc::new(GroupMembershipCache::new(
            stores.attributes.clone(),
            stores.users.clone(),
            resolver.clone(),
            clock.clone(),
        ));
        let tokens = Arc::new(TokenManager::new(policy, clock.clone()));
        let users = Arc::new(UserService::new(
            stores.users.clone(),
            tokens.clone(),
            groups.clone(),
        ));
        let auth = AuthService::new(resolver.clone(), users.clone(), groups.clone(), tokens.clone());
        let apply = ApplyPipeline::new(resolver.clone(), users.clone(), groups.clone());

        tracing::info!(
            active_provider = %configs.active_kind(),
            call_timeout_ms = call_timeout.as_millis() as u64,
            "Identity core initialized"
        );

        Ok(IdentityCore {
            configs,
            resolver,
            groups,
            tokens,
            users,
            local,
            auth,
            apply,
        })
    }
}

/// The assembled services.
pub struct IdentityCore {
    pub configs: Arc<ProviderConfigStore>,
    pub resolver: Arc<PrincipalResolver>,
    pub groups: Arc<GroupMembershipCache>,
    pub tokens: Arc<TokenManager>,
    pub users: Arc<UserService>,
    pub local: Arc<LocalProvider>,
    pub auth: AuthService,
    pub apply: ApplyPipeline,
}

impl IdentityCore {
    pub fn builder(collaborators: Collaborators) -> IdentityCoreBuilder {
        IdentityCoreBuilder {
            collaborators,
            stores: CoreStores::in_memory(),
            policy: TokenPolicy::default(),
            call_timeout: Duration::from_secs(10),
            clock: Arc::new(SystemClock),
        }
    }

    /// Start the token sweeper and, when an interval is given, the scheduled
    /// group refresh.
    pub fn spawn_background(
        &self,
        sweep_every: Duration,
        refresh_every: Option<Duration>,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.tokens.clone().spawn_sweeper(sweep_every)];
        if let Some(every) = refresh_every {
            handles.push(self.groups.clone().spawn_schedule(every));
        }
        handles
    }
}
