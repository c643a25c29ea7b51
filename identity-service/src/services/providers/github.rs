//! GitHub OAuth provider.
//!
//! Users are GitHub accounts; organizations and teams both map to group
//! principals. Team ids are prefixed with `team:` so they cannot collide with
//! organization account ids.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::sync::Arc;

use crate::models::{
    ConfigTestOutput, Credentials, GithubConfig, Principal, PrincipalId, PrincipalType,
    ProviderConfig, ProviderKind, ProviderSettings,
};
use crate::services::error::{IdentityError, IdentityResult};
use crate::services::provider::{
    AttributeMapping, AuthenticatedIdentity, FieldMapping, IdentityProvider, NativeRecord,
    PrincipalStream,
};
use crate::services::providers::http_error;

const TEAM_PREFIX: &str = "team:";

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GithubAccount {
    pub id: i64,
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default, rename = "type")]
    pub account_type: String,
}

impl GithubAccount {
    pub fn is_org(&self) -> bool {
        self.account_type == "Organization"
    }

    fn record(&self) -> NativeRecord {
        let principal_type = if self.is_org() {
            PrincipalType::Group
        } else {
            PrincipalType::User
        };
        NativeRecord::new(self.id.to_string(), principal_type)
            .with_attr("login", &self.login)
            .with_attr("name", self.name.clone().unwrap_or_default())
            .with_attr("avatar_url", &self.avatar_url)
            .with_attr("html_url", &self.html_url)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GithubTeamOrg {
    pub login: String,
    #[serde(default)]
    pub avatar_url: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GithubTeam {
    pub id: i64,
    pub name: String,
    pub slug: String,
    #[serde(default)]
    pub html_url: String,
    pub organization: GithubTeamOrg,
}

impl GithubTeam {
    fn record(&self) -> NativeRecord {
        NativeRecord::new(format!("{}{}", TEAM_PREFIX, self.id), PrincipalType::Group)
            .with_attr("login", format!("{}/{}", self.organization.login, self.slug))
            .with_attr("name", &self.name)
            .with_attr("avatar_url", &self.organization.avatar_url)
            .with_attr("html_url", &self.html_url)
    }
}

/// GitHub REST API as used by the provider.
#[async_trait]
pub trait GithubApi: Send + Sync {
    /// Exchange an authorization code for an access token.
    async fn exchange_code(&self, config: &GithubConfig, code: &str) -> IdentityResult<SecretString>;

    async fn current_user(&self, config: &GithubConfig, token: &SecretString) -> IdentityResult<GithubAccount>;

    async fn user_orgs(&self, config: &GithubConfig, token: &SecretString) -> IdentityResult<Vec<GithubAccount>>;

    async fn user_teams(&self, config: &GithubConfig, token: &SecretString) -> IdentityResult<Vec<GithubTeam>>;

    /// Public organization memberships of any account.
    async fn public_orgs(&self, config: &GithubConfig, login: &str) -> IdentityResult<Vec<GithubAccount>>;

    async fn account(&self, config: &GithubConfig, id: &str) -> IdentityResult<GithubAccount>;

    async fn team(&self, config: &GithubConfig, id: &str) -> IdentityResult<GithubTeam>;

    async fn search_accounts(
        &self,
        config: &GithubConfig,
        text: &str,
        principal_type: Option<PrincipalType>,
    ) -> IdentityResult<Vec<GithubAccount>>;
}

/// [`GithubApi`] over HTTPS.
#[derive(Clone, Default)]
pub struct GithubClient {
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Deserialize)]
struct SearchResponse {
    items: Vec<GithubAccount>,
}

impl GithubClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        url: &str,
        token: Option<&SecretString>,
        config: &GithubConfig,
    ) -> IdentityResult<T> {
        let mut request = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json")
            .header(reqwest::header::USER_AGENT, "identity-service");
        request = match token {
            Some(token) => request.bearer_auth(token.expose_secret()),
            None => request.basic_auth(&config.client_id, config.client_secret.expose()),
        };

        let response = request
            .send()
            .await
            .map_err(|e| http_error("GitHub request failed", e))?
            .error_for_status()
            .map_err(|e| http_error("GitHub request rejected", e))?;

        response.json::<T>().await.map_err(|e| {
            tracing::error!(error = %e, url = %url, "Failed to parse GitHub response");
            IdentityError::Internal(anyhow::anyhow!("Failed to parse GitHub response: {}", e))
        })
    }
}

#[async_trait]
impl GithubApi for GithubClient {
    async fn exchange_code(&self, config: &GithubConfig, code: &str) -> IdentityResult<SecretString> {
        let url = format!("{}/login/oauth/access_token", config.web_base());
        let response = self
            .client
            .post(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(&[
                ("client_id", config.client_id.as_str()),
                ("client_secret", config.client_secret.expose().unwrap_or_default()),
                ("code", code),
            ])
            .send()
            .await
            .map_err(|e| http_error("GitHub code exchange failed", e))?
            .error_for_status()
            .map_err(|e| http_error("GitHub code exchange rejected", e))?;

        let body: AccessTokenResponse = response.json().await.map_err(|e| {
            IdentityError::Internal(anyhow::anyhow!("Failed to parse GitHub token response: {}", e))
        })?;

        match (body.access_token, body.error) {
            (Some(token), None) if !token.is_empty() => Ok(SecretString::new(token)),
            (_, Some(error)) => Err(IdentityError::Credential(format!(
                "GitHub rejected the authorization code: {}",
                error
            ))),
            _ => Err(IdentityError::Credential(
                "GitHub returned no access token".to_string(),
            )),
        }
    }

    async fn current_user(&self, config: &GithubConfig, token: &SecretString) -> IdentityResult<GithubAccount> {
        self.get_json(&format!("{}/user", config.api_base()), Some(token), config)
            .await
    }

    async fn user_orgs(&self, config: &GithubConfig, token: &SecretString) -> IdentityResult<Vec<GithubAccount>> {
        let mut orgs: Vec<GithubAccount> = self
            .get_json(&format!("{}/user/orgs", config.api_base()), Some(token), config)
            .await?;
        for org in &mut orgs {
            org.account_type = "Organization".to_string();
        }
        Ok(orgs)
    }

    async fn user_teams(&self, config: &GithubConfig, token: &SecretString) -> IdentityResult<Vec<GithubTeam>> {
        self.get_json(&format!("{}/user/teams", config.api_base()), Some(token), config)
            .await
    }

    async fn public_orgs(&self, config: &GithubConfig, login: &str) -> IdentityResult<Vec<GithubAccount>> {
        let url = format!(
            "{}/users/{}/orgs",
            config.api_base(),
            urlencoding::encode(login)
        );
        let mut orgs: Vec<GithubAccount> = self.get_json(&url, None, config).await?;
        for org in &mut orgs {
            org.account_type = "Organization".to_string();
        }
        Ok(orgs)
    }

    async fn account(&self, config: &GithubConfig, id: &str) -> IdentityResult<GithubAccount> {
        let url = format!("{}/user/{}", config.api_base(), urlencoding::encode(id));
        self.get_json(&url, None, config).await
    }

    async fn team(&self, config: &GithubConfig, id: &str) -> IdentityResult<GithubTeam> {
        let url = format!("{}/teams/{}", config.api_base(), urlencoding::encode(id));
        self.get_json(&url, None, config).await
    }

    async fn search_accounts(
        &self,
        config: &GithubConfig,
        text: &str,
        principal_type: Option<PrincipalType>,
    ) -> IdentityResult<Vec<GithubAccount>> {
        let mut query = format!("{} in:login", text);
        match principal_type {
            Some(PrincipalType::User) => query.push_str(" type:user"),
            Some(PrincipalType::Group) => query.push_str(" type:org"),
            None => {}
        }
        let url = format!(
            "{}/search/users?q={}&sort=login",
            config.api_base(),
            urlencoding::encode(&query)
        );
        let response: SearchResponse = self.get_json(&url, None, config).await?;
        Ok(response.items)
    }
}

pub struct GithubProvider {
    api: Arc<dyn GithubApi>,
}

impl GithubProvider {
    pub fn new(api: Arc<dyn GithubApi>) -> Self {
        Self { api }
    }

    fn settings(config: &ProviderConfig) -> IdentityResult<&GithubConfig> {
        match &config.settings {
            ProviderSettings::Github(c) => Ok(c),
            other => Err(IdentityError::Validation(format!(
                "GitHub provider cannot use a {} configuration",
                other.kind()
            ))),
        }
    }

    fn mapping() -> AttributeMapping {
        let fields = FieldMapping {
            profile_picture: Some("avatar_url".to_string()),
            profile_url: Some("html_url".to_string()),
            ..FieldMapping::new("name", "login")
        };
        AttributeMapping {
            user: fields.clone(),
            group: fields,
        }
    }

    fn principal(&self, record: &NativeRecord) -> IdentityResult<Principal> {
        Self::mapping().resolve(self.name(), record)
    }

    async fn exchange(
        &self,
        config: &GithubConfig,
        credentials: &Credentials,
    ) -> IdentityResult<AuthenticatedIdentity> {
        let Credentials::AuthorizationCode(code) = credentials else {
            return Err(IdentityError::Validation(
                "GitHub login requires an authorization code".to_string(),
            ));
        };
        if code.is_empty() {
            return Err(IdentityError::Credential("authorization code is empty".to_string()));
        }

        let token = self.api.exchange_code(config, code).await?;
        let account = self.api.current_user(config, &token).await?;
        let user = self.principal(&account.record())?;

        let mut groups = Vec::new();
        for org in self.api.user_orgs(config, &token).await? {
            groups.push(self.principal(&org.record())?);
        }
        for team in self.api.user_teams(config, &token).await? {
            groups.push(self.principal(&team.record())?);
        }

        let mut identity = AuthenticatedIdentity::new(user, groups);
        identity
            .provider_info
            .insert("login".to_string(), account.login.clone());
        identity
            .provider_info
            .insert("githubId".to_string(), account.id.to_string());
        Ok(identity)
    }
}

#[async_trait]
impl IdentityProvider for GithubProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Github
    }

    fn attribute_mapping(&self, _config: &ProviderConfig) -> AttributeMapping {
        Self::mapping()
    }

    async fn test_config(&self, config: &ProviderConfig) -> IdentityResult<ConfigTestOutput> {
        let settings = Self::settings(config)?;
        Ok(ConfigTestOutput {
            redirect_url: format!(
                "{}/login/oauth/authorize?client_id={}&scope=read:org",
                settings.web_base(),
                urlencoding::encode(&settings.client_id)
            ),
        })
    }

    async fn test_and_apply(
        &self,
        config: &ProviderConfig,
        credentials: &Credentials,
    ) -> IdentityResult<Option<AuthenticatedIdentity>> {
        let settings = Self::settings(config)?;
        self.exchange(settings, credentials).await.map(Some)
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
        let api = self.api.clone();
        let text = text.to_string();
        let name = self.name();

        let page = stream::once(async move {
            api.search_accounts(&settings, &text, principal_type).await
        });
        Ok(page
            .flat_map(move |result| {
                let items: Vec<IdentityResult<Principal>> = match result {
                    Ok(accounts) => accounts
                        .iter()
                        .map(|account| Self::mapping().resolve(name, &account.record()))
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
        let record = match id.native_id.strip_prefix(TEAM_PREFIX) {
            Some(team_id) if id.principal_type == PrincipalType::Group => {
                self.api.team(settings, team_id).await?.record()
            }
            _ => {
                let account = self.api.account(settings, &id.native_id).await?;
                let record = account.record();
                if record.principal_type != Some(id.principal_type) {
                    return Err(IdentityError::NotFound(format!("Principal {}", id)));
                }
                record
            }
        };
        self.principal(&record)
    }

    /// Public organizations only; team membership needs the user's own token.
    async fn groups_for(
        &self,
        config: &ProviderConfig,
        principal: &PrincipalId,
    ) -> IdentityResult<Vec<Principal>> {
        if principal.principal_type == PrincipalType::Group {
            return Ok(Vec::new());
        }
        let settings = Self::settings(config)?;
        let account = self.api.account(settings, &principal.native_id).await?;
        self.api
            .public_orgs(settings, &account.login)
            .await?
            .iter()
            .map(|org| self.principal(&org.record()))
            .collect()
    }
}
