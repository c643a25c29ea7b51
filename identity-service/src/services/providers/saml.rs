//! SAML providers (generic SAML and Ping).
//!
//! Assertion signature checking belongs to the SAML collaborator; this
//! provider receives the attributes of an already verified assertion. IdPs
//! offer no directory search, so searches echo the query back as a principal.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::models::{
    ConfigTestOutput, Credentials, Principal, PrincipalId, PrincipalType, ProviderConfig,
    ProviderKind, ProviderSettings, SamlConfig,
};
use crate::services::error::{IdentityError, IdentityResult};
use crate::services::provider::{
    AttributeMapping, AuthenticatedIdentity, FieldMapping, IdentityProvider, NativeRecord,
    PrincipalStream,
};
use crate::services::providers::http_error;

/// Fetches IdP metadata documents.
#[async_trait]
pub trait SamlMetadataSource: Send + Sync {
    async fn fetch(&self, url: &str) -> IdentityResult<String>;
}

#[derive(Clone, Default)]
pub struct HttpMetadataSource {
    client: reqwest::Client,
}

impl HttpMetadataSource {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SamlMetadataSource for HttpMetadataSource {
    async fn fetch(&self, url: &str) -> IdentityResult<String> {
        self.client
            .get(url)
            .send()
            .await
            .map_err(|e| http_error("IdP metadata fetch failed", e))?
            .error_for_status()
            .map_err(|e| http_error("IdP metadata fetch rejected", e))?
            .text()
            .await
            .map_err(|e| http_error("IdP metadata read failed", e))
    }
}

pub struct SamlProvider {
    kind: ProviderKind,
    metadata: Arc<dyn SamlMetadataSource>,
}

impl SamlProvider {
    pub fn new(kind: ProviderKind, metadata: Arc<dyn SamlMetadataSource>) -> Self {
        Self { kind, metadata }
    }

    fn settings<'a>(&self, config: &'a ProviderConfig) -> IdentityResult<&'a SamlConfig> {
        match &config.settings {
            ProviderSettings::Saml(c) | ProviderSettings::Ping(c) if config.kind() == self.kind => Ok(c),
            other => Err(IdentityError::Validation(format!(
                "{} provider cannot use a {} configuration",
                self.kind,
                other.kind()
            ))),
        }
    }

    /// Inline metadata wins over the URL.
    async fn check_metadata(&self, settings: &SamlConfig) -> IdentityResult<()> {
        let document = if settings.idp_metadata_content.is_empty() {
            self.metadata.fetch(&settings.idp_metadata_url).await?
        } else {
            settings.idp_metadata_content.clone()
        };
        if !document.contains("EntityDescriptor") {
            return Err(IdentityError::Validation(
                "IdP metadata has no EntityDescriptor".to_string(),
            ));
        }
        Ok(())
    }

    fn login_url(&self, settings: &SamlConfig) -> String {
        format!(
            "{}/v1-saml/{}/saml/login",
            settings.rancher_api_host.trim_end_matches('/'),
            self.kind
        )
    }

    fn first<'a>(attributes: &'a BTreeMap<String, Vec<String>>, field: &str) -> Option<&'a str> {
        attributes
            .get(field)
            .and_then(|values| values.first())
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    fn identity_from_assertion(
        &self,
        settings: &SamlConfig,
        attributes: &BTreeMap<String, Vec<String>>,
    ) -> IdentityResult<AuthenticatedIdentity> {
        let uid = Self::first(attributes, &settings.uid_field).ok_or_else(|| {
            IdentityError::Credential(format!("assertion has no {} attribute", settings.uid_field))
        })?;

        let mut record = NativeRecord::new(uid, PrincipalType::User);
        for field in [&settings.display_name_field, &settings.user_name_field] {
            if let Some(value) = Self::first(attributes, field) {
                record = record.with_attr(field, value);
            }
        }
        let user = self.attribute_mapping_for(settings).resolve(self.name(), &record)?;

        let mut groups: Vec<Principal> = Vec::new();
        for name in attributes.get(&settings.groups_field).into_iter().flatten() {
            if name.is_empty() || groups.iter().any(|g| g.login_name == *name) {
                continue;
            }
            let id = PrincipalId::new(self.name(), PrincipalType::Group, name.as_str());
            groups.push(Principal::new(&id, name.as_str(), name.as_str()));
        }

        Ok(AuthenticatedIdentity::new(user, groups))
    }

    fn attribute_mapping_for(&self, settings: &SamlConfig) -> AttributeMapping {
        AttributeMapping {
            user: FieldMapping::new(&settings.display_name_field, &settings.user_name_field),
            group: FieldMapping::new(&settings.groups_field, &settings.groups_field),
        }
    }
}

#[async_trait]
impl IdentityProvider for SamlProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn attribute_mapping(&self, config: &ProviderConfig) -> AttributeMapping {
        self.settings(config)
            .map(|settings| self.attribute_mapping_for(settings))
            .unwrap_or_default()
    }

    async fn test_config(&self, config: &ProviderConfig) -> IdentityResult<ConfigTestOutput> {
        let settings = self.settings(config)?;
        self.check_metadata(settings).await?;
        Ok(ConfigTestOutput {
            redirect_url: self.login_url(settings),
        })
    }

    /// Metadata check; with assertion attributes, also maps the tester.
    async fn test_and_apply(
        &self,
        config: &ProviderConfig,
        credentials: &Credentials,
    ) -> IdentityResult<Option<AuthenticatedIdentity>> {
        let settings = self.settings(config)?;
        self.check_metadata(settings).await?;
        match credentials {
            Credentials::SamlAssertion(attributes) => self
                .identity_from_assertion(settings, attributes)
                .map(Some),
            _ => Ok(None),
        }
    }

    async fn authenticate(
        &self,
        config: &ProviderConfig,
        credentials: &Credentials,
    ) -> IdentityResult<AuthenticatedIdentity> {
        let settings = self.settings(config)?;
        match credentials {
            Credentials::SamlAssertion(attributes) => {
                self.identity_from_assertion(settings, attributes)
            }
            _ => Err(IdentityError::Validation(
                "SAML login requires a verified assertion".to_string(),
            )),
        }
    }

    async fn search(
        &self,
        config: &ProviderConfig,
        text: &str,
        principal_type: Option<PrincipalType>,
    ) -> IdentityResult<PrincipalStream> {
        self.settings(config)?;
        if text.is_empty() {
            return Ok(stream::empty().boxed());
        }

        let kinds = match principal_type {
            Some(kind) => vec![kind],
            None => vec![PrincipalType::User, PrincipalType::Group],
        };
        let name = self.name();
        let items: Vec<IdentityResult<Principal>> = kinds
            .into_iter()
            .map(|kind| {
                let id = PrincipalId::new(name, kind, text);
                Ok(Principal::new(&id, text, text))
            })
            .collect();
        Ok(stream::iter(items).boxed())
    }

    async fn get_principal(
        &self,
        config: &ProviderConfig,
        id: &PrincipalId,
    ) -> IdentityResult<Principal> {
        self.settings(config)?;
        Ok(Principal::new(id, id.native_id.as_str(), id.native_id.as_str()))
    }

    async fn groups_for(
        &self,
        _config: &ProviderConfig,
        _principal: &PrincipalId,
    ) -> IdentityResult<Vec<Principal>> {
        Err(IdentityError::Validation(format!(
            "{} group membership is only known at login",
            self.kind
        )))
    }

    fn supports_group_refresh(&self) -> bool {
        false
    }
}
