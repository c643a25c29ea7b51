//! Azure AD OAuth provider backed by Microsoft Graph.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;

use crate::models::{
    AzureAdConfig, ConfigTestOutput, Credentials, Principal, PrincipalId, PrincipalType,
    ProviderConfig, ProviderKind, ProviderSettings,
};
use crate::services::error::{IdentityError, IdentityResult};
use crate::services::provider::{
    AttributeMapping, AuthenticatedIdentity, FieldMapping, IdentityProvider, NativeRecord,
    PrincipalStream,
};
use crate::services::providers::http_error;

/// A Graph directory object (user or group).
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphObject {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub user_principal_name: Option<String>,
    #[serde(default, rename = "@odata.type")]
    pub odata_type: Option<String>,
}

impl GraphObject {
    fn record(&self, principal_type: PrincipalType) -> NativeRecord {
        let display = self.display_name.clone().unwrap_or_default();
        let login = match principal_type {
            PrincipalType::User => self.user_principal_name.clone().unwrap_or_default(),
            PrincipalType::Group => display.clone(),
        };
        NativeRecord::new(&self.id, principal_type)
            .with_attr("displayName", display)
            .with_attr("userPrincipalName", login)
    }

    fn is_group(&self) -> bool {
        self.odata_type.as_deref() == Some("#microsoft.graph.group")
    }
}

/// Microsoft identity platform and Graph calls used by the provider.
#[async_trait]
pub trait AzureGraphApi: Send + Sync {
    /// Exchange an authorization code for a delegated token.
    async fn exchange_code(&self, config: &AzureAdConfig, code: &str) -> IdentityResult<SecretString>;

    /// Application token from the client-credentials grant.
    async fn app_token(&self, config: &AzureAdConfig) -> IdentityResult<SecretString>;

    async fn me(&self, config: &AzureAdConfig, token: &SecretString) -> IdentityResult<GraphObject>;

    /// Direct memberships of a user; `None` means the token's own user.
    async fn member_of(
        &self,
        config: &AzureAdConfig,
        token: &SecretString,
        user_id: Option<&str>,
    ) -> IdentityResult<Vec<GraphObject>>;

    async fn object(
        &self,
        config: &AzureAdConfig,
        token: &SecretString,
        principal_type: PrincipalType,
        id: &str,
    ) -> IdentityResult<GraphObject>;

    async fn search(
        &self,
        config: &AzureAdConfig,
        token: &SecretString,
        principal_type: PrincipalType,
        text: &str,
    ) -> IdentityResult<Vec<GraphObject>>;
}

#[derive(Clone, Default)]
pub struct AzureGraphClient {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct GraphList {
    #[serde(default)]
    value: Vec<GraphObject>,
}

fn collection(principal_type: PrincipalType) -> &'static str {
    match principal_type {
        PrincipalType::User => "users",
        PrincipalType::Group => "groups",
    }
}

impl AzureGraphClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    fn graph_url(config: &AzureAdConfig, path: &str) -> String {
        format!("{}/v1.0/{}", config.graph_endpoint.trim_end_matches('/'), path)
    }

    async fn token(&self, config: &AzureAdConfig, form: &[(&str, &str)]) -> IdentityResult<SecretString> {
        let response = self
            .client
            .post(&config.token_endpoint)
            .form(form)
            .send()
            .await
            .map_err(|e| http_error("Azure AD token request failed", e))?;

        if response.status() == reqwest::StatusCode::BAD_REQUEST
            || response.status() == reqwest::StatusCode::UNAUTHORIZED
        {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            tracing::warn!(status = %status, body = %body, "Azure AD rejected token request");
            return Err(IdentityError::Credential(format!(
                "Azure AD rejected the token request: {}",
                status
            )));
        }

        let body: TokenResponse = response
            .error_for_status()
            .map_err(|e| http_error("Azure AD token request rejected", e))?
            .json()
            .await
            .map_err(|e| IdentityError::Internal(anyhow::anyhow!("Failed to parse Azure AD token: {}", e)))?;
        Ok(SecretString::new(body.access_token))
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        token: &SecretString,
    ) -> IdentityResult<T> {
        self.client
            .get(url)
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(|e| http_error("Graph request failed", e))?
            .error_for_status()
            .map_err(|e| http_error("Graph request rejected", e))?
            .json::<T>()
            .await
            .map_err(|e| IdentityError::Internal(anyhow::anyhow!("Failed to parse Graph response: {}", e)))
    }
}

#[async_trait]
impl AzureGraphApi for AzureGraphClient {
    async fn exchange_code(&self, config: &AzureAdConfig, code: &str) -> IdentityResult<SecretString> {
        let secret = config.application_secret.expose().unwrap_or_default();
        self.token(
            config,
            &[
                ("grant_type", "authorization_code"),
                ("client_id", config.application_id.as_str()),
                ("client_secret", secret),
                ("code", code),
                ("redirect_uri", config.rancher_url.as_str()),
                ("scope", "openid profile User.Read"),
            ],
        )
        .await
    }

    async fn app_token(&self, config: &AzureAdConfig) -> IdentityResult<SecretString> {
        let secret = config.application_secret.expose().unwrap_or_default();
        let scope = format!("{}/.default", config.graph_endpoint.trim_end_matches('/'));
        self.token(
            config,
            &[
                ("grant_type", "client_credentials"),
                ("client_id", config.application_id.as_str()),
                ("client_secret", secret),
                ("scope", scope.as_str()),
            ],
        )
        .await
    }

    async fn me(&self, config: &AzureAdConfig, token: &SecretString) -> IdentityResult<GraphObject> {
        self.get_json(&Self::graph_url(config, "me"), token).await
    }

    async fn member_of(
        &self,
        config: &AzureAdConfig,
        token: &SecretString,
        user_id: Option<&str>,
    ) -> IdentityResult<Vec<GraphObject>> {
        let path = match user_id {
            Some(id) => format!("users/{}/memberOf", urlencoding::encode(id)),
            None => "me/memberOf".to_string(),
        };
        let list: GraphList = self.get_json(&Self::graph_url(config, &path), token).await?;
        Ok(list.value.into_iter().filter(GraphObject::is_group).collect())
    }

    async fn object(
        &self,
        config: &AzureAdConfig,
        token: &SecretString,
        principal_type: PrincipalType,
        id: &str,
    ) -> IdentityResult<GraphObject> {
        let path = format!("{}/{}", collection(principal_type), urlencoding::encode(id));
        self.get_json(&Self::graph_url(config, &path), token).await
    }

    async fn search(
        &self,
        config: &AzureAdConfig,
        token: &SecretString,
        principal_type: PrincipalType,
        text: &str,
    ) -> IdentityResult<Vec<GraphObject>> {
        let quoted = text.replace('\'', "''");
        let filter = match principal_type {
            PrincipalType::User => format!(
                "startswith(userPrincipalName,'{q}') or startswith(displayName,'{q}')",
                q = quoted
            ),
            PrincipalType::Group => format!("startswith(displayName,'{}')", quoted),
        };
        let path = format!(
            "{}?$filter={}&$orderby=displayName",
            collection(principal_type),
            urlencoding::encode(&filter)
        );
        let list: GraphList = self.get_json(&Self::graph_url(config, &path), token).await?;
        Ok(list.value)
    }
}

pub struct AzureAdProvider {
    api: Arc<dyn AzureGraphApi>,
}

impl AzureAdProvider {
    pub fn new(api: Arc<dyn AzureGraphApi>) -> Self {
        Self { api }
    }

    fn settings(config: &ProviderConfig) -> IdentityResult<&AzureAdConfig> {
        match &config.settings {
            ProviderSettings::AzureAd(c) => Ok(c),
            other => Err(IdentityError::Validation(format!(
                "Azure AD provider cannot use a {} configuration",
                other.kind()
            ))),
        }
    }

    fn mapping() -> AttributeMapping {
        AttributeMapping {
            user: FieldMapping::new("displayName", "userPrincipalName"),
            group: FieldMapping::new("displayName", "displayName"),
        }
    }

    fn principal(&self, object: &GraphObject, principal_type: PrincipalType) -> IdentityResult<Principal> {
        Self::mapping().resolve(self.name(), &object.record(principal_type))
    }

    async fn exchange(
        &self,
        config: &AzureAdConfig,
        credentials: &Credentials,
    ) -> IdentityResult<AuthenticatedIdentity> {
        let Credentials::AuthorizationCode(code) = credentials else {
            return Err(IdentityError::Validation(
                "Azure AD login requires an authorization code".to_string(),
            ));
        };
        if code.is_empty() {
            return Err(IdentityError::Credential("authorization code is empty".to_string()));
        }

        let token = self.api.exchange_code(config, code).await?;
        let me = self.api.me(config, &token).await?;
        let user = self.principal(&me, PrincipalType::User)?;
        let groups = self
            .api
            .member_of(config, &token, None)
            .await?
            .iter()
            .map(|group| self.principal(group, PrincipalType::Group))
            .collect::<IdentityResult<Vec<_>>>()?;

        let mut identity = AuthenticatedIdentity::new(user, groups);
        identity
            .provider_info
            .insert("tenantId".to_string(), config.tenant_id.clone());
        Ok(identity)
    }
}

#[async_trait]
impl IdentityProvider for AzureAdProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::AzureAd
    }

    fn attribute_mapping(&self, _config: &ProviderConfig) -> AttributeMapping {
        Self::mapping()
    }

    async fn test_config(&self, config: &ProviderConfig) -> IdentityResult<ConfigTestOutput> {
        let settings = Self::settings(config)?;
        Ok(ConfigTestOutput {
            redirect_url: format!(
                "{}?client_id={}&redirect_uri={}&response_type=code&scope=openid",
                settings.auth_endpoint,
                urlencoding::encode(&settings.application_id),
                urlencoding::encode(&settings.rancher_url)
            ),
        })
    }

    async fn test_and_apply(
        &self,
        config: &ProviderConfig,
        credentials: &Credentials,
    ) -> IdentityResult<Option<AuthenticatedIdentity>> {
        self.exchange(Self::settings(config)?, credentials)
            .await
            .map(Some)
    }

    async fn authenticate(
        &self,
        config: &ProviderConfig,
        credentials: &Credentials,
    ) -> IdentityResult<AuthenticatedIdentity> {
        self.exchange(Self::settings(config)?, credentials).await
    }

    async fn search(
        &self,
        config: &ProviderConfig,
        text: &str,
        principal_type: Option<PrincipalType>,
    ) -> IdentityResult<PrincipalStream> {
        let settings = Self::settings(config)?.clone();
        let token = self.api.app_token(&settings).await?;
        let kinds: Vec<PrincipalType> = match principal_type {
            Some(kind) => vec![kind],
            None => vec![PrincipalType::User, PrincipalType::Group],
        };

        let api = self.api.clone();
        let text = text.to_string();
        let name = self.name();
        let pages = stream::iter(kinds).then(move |kind| {
            let api = api.clone();
            let settings = settings.clone();
            let token = token.clone();
            let text = text.clone();
            async move {
                api.search(&settings, &token, kind, &text)
                    .await
                    .map(|objects| (kind, objects))
            }
        });

        Ok(pages
            .flat_map(move |page| {
                let items: Vec<IdentityResult<Principal>> = match page {
                    Ok((kind, objects)) => objects
                        .iter()
                        .map(|object| Self::mapping().resolve(name, &object.record(kind)))
                        .collect(),
                    Err(err) => vec![Err(err)],
                };
                stream::iter(items)
            })
            .boxed())
    }

    async fn get_principal(
        &self,
        config: &ProviderConfig,
        id: &PrincipalId,
    ) -> IdentityResult<Principal> {
        let settings = Self::settings(config)?;
        let token = self.api.app_token(settings).await?;
        let object = self
            .api
            .object(settings, &token, id.principal_type, &id.native_id)
            .await?;
        self.principal(&object, id.principal_type)
    }

    async fn groups_for(
        &self,
        config: &ProviderConfig,
        principal: &PrincipalId,
    ) -> IdentityResult<Vec<Principal>> {
        if principal.principal_type == PrincipalType::Group {
            return Ok(Vec::new());
        }
        let settings = Self::settings(config)?;
        let token = self.api.app_token(settings).await?;
        self.api
            .member_of(settings, &token, Some(&principal.native_id))
            .await?
            .iter()
            .map(|group| self.principal(group, PrincipalType::Group))
            .collect()
    }
}
