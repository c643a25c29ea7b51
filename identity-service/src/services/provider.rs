//! Collaborator contract for identity providers.
//!
//! A provider authenticates credentials, searches and resolves identities in
//! its own native shape, and maps them into [`Principal`]s through the
//! attribute names declared by its configuration. Providers hold no
//! configuration themselves: each call receives the config it should act on,
//! so a candidate config can be tested without being stored.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::models::{
    ConfigTestOutput, Credentials, Principal, PrincipalId, PrincipalType, ProviderConfig,
    ProviderKind, LOCAL_PROVIDER,
};
use crate::services::error::{IdentityError, IdentityResult};

/// An identity record as the provider returned it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NativeRecord {
    /// Native unique id (DN, numeric account id, object id).
    pub id: String,
    pub principal_type: Option<PrincipalType>,
    pub attributes: BTreeMap<String, Vec<String>>,
}

impl NativeRecord {
    pub fn new(id: impl Into<String>, principal_type: PrincipalType) -> Self {
        Self {
            id: id.into(),
            principal_type: Some(principal_type),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attributes
            .entry(name.to_string())
            .or_default()
            .push(value.into());
        self
    }

    /// First value of an attribute. Names compare case-insensitively, as
    /// directory attribute names do.
    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attrs(name).first().map(String::as_str)
    }

    pub fn attrs(&self, name: &str) -> &[String] {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn has_value(&self, name: &str, value: &str) -> bool {
        self.attrs(name).iter().any(|v| v.eq_ignore_ascii_case(value))
    }
}

/// Attribute names used to build one principal type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMapping {
    /// Attribute holding the unique id; `None` uses [`NativeRecord::id`].
    pub unique_id: Option<String>,
    pub display_name: String,
    pub login_name: String,
    pub profile_picture: Option<String>,
    pub profile_url: Option<String>,
}

impl FieldMapping {
    pub fn new(display_name: &str, login_name: &str) -> Self {
        Self {
            display_name: display_name.to_string(),
            login_name: login_name.to_string(),
            ..Self::default()
        }
    }
}

/// Attribute mapping declared by a provider for its configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeMapping {
    pub user: FieldMapping,
    pub group: FieldMapping,
}

impl AttributeMapping {
    pub fn for_type(&self, principal_type: PrincipalType) -> &FieldMapping {
        match principal_type {
            PrincipalType::User => &self.user,
            PrincipalType::Group => &self.group,
        }
    }

    /// Map a native record to a principal of `provider`.
    pub fn resolve(&self, provider: &str, record: &NativeRecord) -> IdentityResult<Principal> {
        let principal_type = record.principal_type.ok_or_else(|| {
            IdentityError::Validation(format!("Record {} has no principal type", record.id))
        })?;
        let fields = self.for_type(principal_type);

        let native_id = match &fields.unique_id {
            Some(attr) => record.attr(attr).unwrap_or_default().to_string(),
            None => record.id.clone(),
        };
        if native_id.is_empty() {
            return Err(IdentityError::Validation(format!(
                "Record {} has no unique id",
                record.id
            )));
        }

        let id = PrincipalId::new(provider, principal_type, native_id);
        let login_name = record.attr(&fields.login_name).unwrap_or_default();
        let display_name = record
            .attr(&fields.display_name)
            .filter(|name| !name.is_empty())
            .unwrap_or(login_name);

        let mut principal = Principal::new(&id, display_name, login_name);
        if let Some(attr) = &fields.profile_picture {
            principal.profile_picture = record.attr(attr).unwrap_or_default().to_string();
        }
        if let Some(attr) = &fields.profile_url {
            principal.profile_url = record.attr(attr).unwrap_or_default().to_string();
        }
        Ok(principal)
    }
}

/// Outcome of a successful authentication.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthenticatedIdentity {
    pub user: Principal,
    pub groups: Vec<Principal>,
    /// Non-secret provider details kept on the token.
    pub provider_info: BTreeMap<String, String>,
}

impl AuthenticatedIdentity {
    pub fn new(user: Principal, groups: Vec<Principal>) -> Self {
        Self {
            user,
            groups,
            provider_info: BTreeMap::new(),
        }
    }
}

pub type PrincipalStream = BoxStream<'static, IdentityResult<Principal>>;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// Name used in principal ids and on tokens.
    fn name(&self) -> &'static str {
        self.kind().as_str()
    }

    fn attribute_mapping(&self, config: &ProviderConfig) -> AttributeMapping;

    /// Redirect-style check for OAuth and SAML kinds.
    async fn test_config(&self, _config: &ProviderConfig) -> IdentityResult<ConfigTestOutput> {
        Err(IdentityError::Validation(format!(
            "Provider {} does not support a redirect test",
            self.kind()
        )))
    }

    /// Exercise a candidate config with test credentials without storing it.
    ///
    /// Returns the identity the credentials belong to when the check
    /// authenticates someone.
    async fn test_and_apply(
        &self,
        config: &ProviderConfig,
        credentials: &Credentials,
    ) -> IdentityResult<Option<AuthenticatedIdentity>>;

    async fn authenticate(
        &self,
        config: &ProviderConfig,
        credentials: &Credentials,
    ) -> IdentityResult<AuthenticatedIdentity>;

    fn resolve(&self, config: &ProviderConfig, record: &NativeRecord) -> IdentityResult<Principal> {
        self.attribute_mapping(config).resolve(self.name(), record)
    }

    /// Lazily search by name prefix. Every call queries the provider again.
    async fn search(
        &self,
        config: &ProviderConfig,
        text: &str,
        principal_type: Option<PrincipalType>,
    ) -> IdentityResult<PrincipalStream>;

    async fn get_principal(
        &self,
        config: &ProviderConfig,
        id: &PrincipalId,
    ) -> IdentityResult<Principal>;

    /// All groups the principal currently belongs to.
    async fn groups_for(
        &self,
        config: &ProviderConfig,
        principal: &PrincipalId,
    ) -> IdentityResult<Vec<Principal>>;

    /// Whether group membership can be re-queried outside a login.
    fn supports_group_refresh(&self) -> bool {
        true
    }
}

/// Providers by kind.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<ProviderKind, Arc<dyn IdentityProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn IdentityProvider>) {
        tracing::debug!(provider = %provider.kind(), "Identity provider registered");
        self.providers.insert(provider.kind(), provider);
    }

    pub fn with(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn get(&self, kind: ProviderKind) -> IdentityResult<Arc<dyn IdentityProvider>> {
        self.providers.get(&kind).cloned().ok_or_else(|| {
            IdentityError::NotFound(format!("No identity provider registered for {}", kind))
        })
    }

    /// Provider owning a principal id.
    pub fn for_principal(&self, id: &PrincipalId) -> IdentityResult<Arc<dyn IdentityProvider>> {
        if id.provider == LOCAL_PROVIDER {
            return self.get(ProviderKind::Local);
        }
        let kind = id
            .provider
            .parse::<ProviderKind>()
            .map_err(IdentityError::NotFound)?;
        self.get(kind)
    }
}
