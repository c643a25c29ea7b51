//! Provider configuration model.
//!
//! Every provider kind shares the [`AuthConfig`] envelope and adds its own
//! connection settings in [`ProviderSettings`]. On the wire the two are
//! flattened into one object discriminated by `type`.

use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::Validate;

use crate::models::principal::PrincipalId;
use crate::models::secret::WriteOnly;
use crate::services::IdentityError;

/// Supported identity provider kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Local,
    Github,
    AzureAd,
    ActiveDirectory,
    Ldap,
    OpenLdap,
    FreeIpa,
    Saml,
    Ping,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 9] = [
        ProviderKind::Local,
        ProviderKind::Github,
        ProviderKind::AzureAd,
        ProviderKind::ActiveDirectory,
        ProviderKind::Ldap,
        ProviderKind::OpenLdap,
        ProviderKind::FreeIpa,
        ProviderKind::Saml,
        ProviderKind::Ping,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::Local => "local",
            ProviderKind::Github => "github",
            ProviderKind::AzureAd => "azuread",
            ProviderKind::ActiveDirectory => "activedirectory",
            ProviderKind::Ldap => "ldap",
            ProviderKind::OpenLdap => "openldap",
            ProviderKind::FreeIpa => "freeipa",
            ProviderKind::Saml => "saml",
            ProviderKind::Ping => "ping",
        }
    }

    pub fn is_local(&self) -> bool {
        matches!(self, ProviderKind::Local)
    }

    /// OAuth kinds test by exchanging an authorization code.
    pub fn is_oauth(&self) -> bool {
        matches!(self, ProviderKind::Github | ProviderKind::AzureAd)
    }

    pub fn is_directory(&self) -> bool {
        matches!(
            self,
            ProviderKind::ActiveDirectory
                | ProviderKind::Ldap
                | ProviderKind::OpenLdap
                | ProviderKind::FreeIpa
        )
    }

    pub fn is_saml(&self) -> bool {
        matches!(self, ProviderKind::Saml | ProviderKind::Ping)
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_lowercase();
        ProviderKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == lowered)
            .ok_or_else(|| format!("Invalid provider kind: {}", s))
    }
}

/// Who may log in while a federated provider is active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Only allow-listed principals (or members of allow-listed groups).
    Required,
    /// Allow-listed principals plus users already known to the system.
    Restricted,
    /// Anyone the provider authenticates.
    #[default]
    Unrestricted,
}

/// Envelope shared by every provider configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "is_false")]
    pub enabled: bool,
    #[serde(default)]
    pub access_mode: AccessMode,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_principal_ids: Vec<String>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero_port(port: &u16) -> bool {
    *port == 0
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct LocalConfig {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "camelCase")]
pub struct GithubConfig {
    #[validate(length(min = 1, message = "hostname is required"))]
    pub hostname: String,
    pub tls: bool,
    #[validate(length(min = 1, message = "clientId is required"))]
    pub client_id: String,
    #[serde(skip_serializing)]
    pub client_secret: WriteOnly,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            hostname: "github.com".to_string(),
            tls: true,
            client_id: String::new(),
            client_secret: WriteOnly::empty(),
        }
    }
}

impl GithubConfig {
    fn scheme(&self) -> &'static str {
        if self.tls {
            "https"
        } else {
            "http"
        }
    }

    pub fn web_base(&self) -> String {
        format!("{}://{}", self.scheme(), self.hostname)
    }

    /// github.com serves its API from a separate host; Enterprise under `/api/v3`.
    pub fn api_base(&self) -> String {
        if self.hostname == "github.com" {
            "https://api.github.com".to_string()
        } else {
            format!("{}://{}/api/v3", self.scheme(), self.hostname)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "camelCase")]
pub struct AzureAdConfig {
    #[validate(url(message = "endpoint must be a URL"))]
    pub endpoint: String,
    #[validate(url(message = "graphEndpoint must be a URL"))]
    pub graph_endpoint: String,
    #[validate(url(message = "tokenEndpoint must be a URL"))]
    pub token_endpoint: String,
    #[validate(url(message = "authEndpoint must be a URL"))]
    pub auth_endpoint: String,
    #[validate(length(min = 1, message = "tenantId is required"))]
    pub tenant_id: String,
    #[validate(length(min = 1, message = "applicationId is required"))]
    pub application_id: String,
    #[serde(skip_serializing)]
    pub application_secret: WriteOnly,
    #[validate(url(message = "rancherUrl must be a URL"))]
    pub rancher_url: String,
}

impl Default for AzureAdConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://login.microsoftonline.com/".to_string(),
            graph_endpoint: String::new(),
            token_endpoint: String::new(),
            auth_endpoint: String::new(),
            tenant_id: String::new(),
            application_id: String::new(),
            application_secret: WriteOnly::empty(),
            rancher_url: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "camelCase")]
pub struct ActiveDirectoryConfig {
    #[validate(length(min = 1, message = "at least one server is required"))]
    pub servers: Vec<String>,
    #[validate(range(min = 1, message = "port must be positive"))]
    #[serde(skip_serializing_if = "is_zero_port")]
    pub port: u16,
    pub tls: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub certificate: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub default_login_domain: String,
    #[validate(length(min = 1, message = "serviceAccountUsername is required"))]
    pub service_account_username: String,
    #[serde(skip_serializing)]
    pub service_account_password: WriteOnly,
    pub user_disabled_bit_mask: i64,
    #[validate(length(min = 1, message = "userSearchBase is required"))]
    pub user_search_base: String,
    pub user_search_attribute: String,
    pub user_login_attribute: String,
    pub user_object_class: String,
    pub user_name_attribute: String,
    pub user_enabled_attribute: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group_search_base: String,
    pub group_search_attribute: String,
    pub group_object_class: String,
    pub group_name_attribute: String,
    #[serde(rename = "groupDNAttribute")]
    pub group_dn_attribute: String,
    pub group_member_user_attribute: String,
    pub group_member_mapping_attribute: String,
    #[validate(range(min = 1, message = "connectionTimeout must be positive"))]
    pub connection_timeout: u64,
}

impl Default for ActiveDirectoryConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            port: 389,
            tls: false,
            certificate: String::new(),
            default_login_domain: String::new(),
            service_account_username: String::new(),
            service_account_password: WriteOnly::empty(),
            user_disabled_bit_mask: 2,
            user_search_base: String::new(),
            user_search_attribute: "sAMAccountName|sn|givenName".to_string(),
            user_login_attribute: "sAMAccountName".to_string(),
            user_object_class: "person".to_string(),
            user_name_attribute: "name".to_string(),
            user_enabled_attribute: "userAccountControl".to_string(),
            group_search_base: String::new(),
            group_search_attribute: "sAMAccountName".to_string(),
            group_object_class: "group".to_string(),
            group_name_attribute: "name".to_string(),
            group_dn_attribute: "distinguishedName".to_string(),
            group_member_user_attribute: "distinguishedName".to_string(),
            group_member_mapping_attribute: "member".to_string(),
            connection_timeout: 5000,
        }
    }
}

/// Settings shared by generic LDAP, OpenLDAP and FreeIPA.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "camelCase")]
pub struct LdapConfig {
    #[validate(length(min = 1, message = "at least one server is required"))]
    pub servers: Vec<String>,
    #[validate(range(min = 1, message = "port must be positive"))]
    #[serde(skip_serializing_if = "is_zero_port")]
    pub port: u16,
    pub tls: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub certificate: String,
    #[validate(length(min = 1, message = "serviceAccountDistinguishedName is required"))]
    pub service_account_distinguished_name: String,
    #[serde(skip_serializing)]
    pub service_account_password: WriteOnly,
    pub user_disabled_bit_mask: i64,
    #[validate(length(min = 1, message = "userSearchBase is required"))]
    pub user_search_base: String,
    pub user_search_attribute: String,
    pub user_login_attribute: String,
    pub user_object_class: String,
    pub user_name_attribute: String,
    pub user_member_attribute: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub user_enabled_attribute: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub group_search_base: String,
    pub group_search_attribute: String,
    pub group_object_class: String,
    pub group_name_attribute: String,
    #[serde(rename = "groupDNAttribute")]
    pub group_dn_attribute: String,
    pub group_member_user_attribute: String,
    pub group_member_mapping_attribute: String,
    #[validate(range(min = 1, message = "connectionTimeout must be positive"))]
    pub connection_timeout: u64,
}

impl Default for LdapConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            port: 389,
            tls: false,
            certificate: String::new(),
            service_account_distinguished_name: String::new(),
            service_account_password: WriteOnly::empty(),
            user_disabled_bit_mask: 0,
            user_search_base: String::new(),
            user_search_attribute: "uid|sn|givenName".to_string(),
            user_login_attribute: "uid".to_string(),
            user_object_class: "inetOrgPerson".to_string(),
            user_name_attribute: "cn".to_string(),
            user_member_attribute: "memberOf".to_string(),
            user_enabled_attribute: String::new(),
            group_search_base: String::new(),
            group_search_attribute: "cn".to_string(),
            group_object_class: "groupOfNames".to_string(),
            group_name_attribute: "cn".to_string(),
            group_dn_attribute: "entryDN".to_string(),
            group_member_user_attribute: "entryDN".to_string(),
            group_member_mapping_attribute: "member".to_string(),
            connection_timeout: 1000,
        }
    }
}

/// Settings shared by generic SAML and Ping.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, Validate)]
#[serde(default, rename_all = "camelCase")]
pub struct SamlConfig {
    pub idp_metadata_url: String,
    pub idp_metadata_content: String,
    #[validate(length(min = 1, message = "spCert is required"))]
    pub sp_cert: String,
    #[serde(skip_serializing)]
    pub sp_key: WriteOnly,
    #[validate(length(min = 1, message = "groupsField is required"))]
    pub groups_field: String,
    #[validate(length(min = 1, message = "displayNameField is required"))]
    pub display_name_field: String,
    #[validate(length(min = 1, message = "userNameField is required"))]
    pub user_name_field: String,
    #[validate(length(min = 1, message = "uidField is required"))]
    pub uid_field: String,
    #[validate(url(message = "rancherApiHost must be a URL"))]
    pub rancher_api_host: String,
}

/// Provider-specific payload, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProviderSettings {
    Local(LocalConfig),
    Github(GithubConfig),
    AzureAd(AzureAdConfig),
    ActiveDirectory(ActiveDirectoryConfig),
    Ldap(LdapConfig),
    OpenLdap(LdapConfig),
    FreeIpa(LdapConfig),
    Saml(SamlConfig),
    Ping(SamlConfig),
}

impl ProviderSettings {
    pub fn kind(&self) -> ProviderKind {
        match self {
            ProviderSettings::Local(_) => ProviderKind::Local,
            ProviderSettings::Github(_) => ProviderKind::Github,
            ProviderSettings::AzureAd(_) => ProviderKind::AzureAd,
            ProviderSettings::ActiveDirectory(_) => ProviderKind::ActiveDirectory,
            ProviderSettings::Ldap(_) => ProviderKind::Ldap,
            ProviderSettings::OpenLdap(_) => ProviderKind::OpenLdap,
            ProviderSettings::FreeIpa(_) => ProviderKind::FreeIpa,
            ProviderSettings::Saml(_) => ProviderKind::Saml,
            ProviderSettings::Ping(_) => ProviderKind::Ping,
        }
    }

    fn secret(&self) -> Option<(&'static str, &WriteOnly)> {
        match self {
            ProviderSettings::Local(_) => None,
            ProviderSettings::Github(c) => Some(("clientSecret", &c.client_secret)),
            ProviderSettings::AzureAd(c) => Some(("applicationSecret", &c.application_secret)),
            ProviderSettings::ActiveDirectory(c) => {
                Some(("serviceAccountPassword", &c.service_account_password))
            }
            ProviderSettings::Ldap(c) | ProviderSettings::OpenLdap(c) | ProviderSettings::FreeIpa(c) => {
                Some(("serviceAccountPassword", &c.service_account_password))
            }
            ProviderSettings::Saml(c) | ProviderSettings::Ping(c) => Some(("spKey", &c.sp_key)),
        }
    }

    fn secret_mut(&mut self) -> Option<&mut WriteOnly> {
        match self {
            ProviderSettings::Local(_) => None,
            ProviderSettings::Github(c) => Some(&mut c.client_secret),
            ProviderSettings::AzureAd(c) => Some(&mut c.application_secret),
            ProviderSettings::ActiveDirectory(c) => Some(&mut c.service_account_password),
            ProviderSettings::Ldap(c) | ProviderSettings::OpenLdap(c) | ProviderSettings::FreeIpa(c) => {
                Some(&mut c.service_account_password)
            }
            ProviderSettings::Saml(c) | ProviderSettings::Ping(c) => Some(&mut c.sp_key),
        }
    }

    fn validate_fields(&self) -> Result<(), validator::ValidationErrors> {
        match self {
            ProviderSettings::Local(_) => Ok(()),
            ProviderSettings::Github(c) => c.validate(),
            ProviderSettings::AzureAd(c) => c.validate(),
            ProviderSettings::ActiveDirectory(c) => c.validate(),
            ProviderSettings::Ldap(c) | ProviderSettings::OpenLdap(c) | ProviderSettings::FreeIpa(c) => {
                c.validate()
            }
            ProviderSettings::Saml(c) | ProviderSettings::Ping(c) => c.validate(),
        }
    }
}

/// A complete provider configuration: envelope plus payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(flatten)]
    pub auth: AuthConfig,
    #[serde(flatten)]
    pub settings: ProviderSettings,
}

impl ProviderConfig {
    pub fn new(settings: ProviderSettings) -> Self {
        Self {
            auth: AuthConfig::default(),
            settings,
        }
    }

    /// The implicit local configuration: always enabled, unrestricted.
    pub fn local() -> Self {
        Self {
            auth: AuthConfig {
                enabled: true,
                ..AuthConfig::default()
            },
            settings: ProviderSettings::Local(LocalConfig {}),
        }
    }

    pub fn kind(&self) -> ProviderKind {
        self.settings.kind()
    }

    /// Fill secrets the caller left blank from the stored config of the same kind.
    pub fn inherit_secrets(&mut self, stored: &ProviderConfig) {
        if self.kind() != stored.kind() {
            return;
        }
        if let (Some(mine), Some((_, theirs))) = (self.settings.secret_mut(), stored.settings.secret())
        {
            mine.inherit(theirs);
        }
    }

    /// Check required fields, secrets and allow-listed ids.
    pub fn validate(&self) -> Result<(), IdentityError> {
        self.settings.validate_fields()?;

        if let Some((field, secret)) = self.settings.secret() {
            if !secret.is_set() {
                return Err(IdentityError::Validation(format!("{} is required", field)));
            }
        }

        if let ProviderSettings::Saml(c) | ProviderSettings::Ping(c) = &self.settings {
            if c.idp_metadata_content.is_empty() && c.idp_metadata_url.is_empty() {
                return Err(IdentityError::Validation(
                    "idpMetadataContent or idpMetadataUrl is required".to_string(),
                ));
            }
        }

        for id in &self.auth.allowed_principal_ids {
            PrincipalId::parse(id)?;
        }

        Ok(())
    }

    /// Same settings, ignoring the `enabled` flag.
    pub fn same_settings(&self, other: &ProviderConfig) -> bool {
        self.settings == other.settings
            && self.auth.access_mode == other.auth.access_mode
            && self.auth.allowed_principal_ids == other.auth.allowed_principal_ids
    }
}

/// Credentials presented to a provider, either for login or for a config test.
#[derive(Debug, Clone)]
pub enum Credentials {
    /// Nothing to present; the check is a metadata fetch.
    None,
    Password {
        username: String,
        password: SecretString,
    },
    /// OAuth authorization code returned to the redirect URL.
    AuthorizationCode(String),
    /// Attributes of an assertion already verified by the SAML collaborator.
    SamlAssertion(BTreeMap<String, Vec<String>>),
}

impl Credentials {
    pub fn password(username: impl Into<String>, password: impl Into<String>) -> Self {
        Credentials::Password {
            username: username.into(),
            password: SecretString::new(password.into()),
        }
    }
}

/// Provider-neutral test-and-apply request.
#[derive(Debug, Clone)]
pub struct ApplyRequest {
    pub config: ProviderConfig,
    pub credentials: Credentials,
    /// Activate the provider after a successful test.
    pub enable: bool,
    /// User invoking the apply; OAuth kinds link the tested principal to them.
    pub invoking_user: Option<String>,
    /// Version the caller last read, for compare-and-swap.
    pub expected_version: Option<u64>,
}

impl ApplyRequest {
    pub fn new(config: ProviderConfig, credentials: Credentials) -> Self {
        Self {
            config,
            credentials,
            enable: true,
            invoking_user: None,
            expected_version: None,
        }
    }

    pub fn invoked_by(mut self, user_id: impl Into<String>) -> Self {
        self.invoking_user = Some(user_id.into());
        self
    }
}

fn enabled_default() -> bool {
    true
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GithubConfigApplyInput {
    pub github_config: ProviderConfig,
    #[serde(default)]
    pub code: String,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

impl From<GithubConfigApplyInput> for ApplyRequest {
    fn from(input: GithubConfigApplyInput) -> Self {
        ApplyRequest {
            enable: input.enabled,
            ..ApplyRequest::new(input.github_config, Credentials::AuthorizationCode(input.code))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureAdConfigApplyInput {
    pub config: ProviderConfig,
    #[serde(default)]
    pub code: String,
}

impl From<AzureAdConfigApplyInput> for ApplyRequest {
    fn from(input: AzureAdConfigApplyInput) -> Self {
        ApplyRequest::new(input.config, Credentials::AuthorizationCode(input.code))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveDirectoryTestAndApplyInput {
    pub active_directory_config: ProviderConfig,
    pub username: String,
    #[serde(default)]
    pub password: WriteOnly,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

impl From<ActiveDirectoryTestAndApplyInput> for ApplyRequest {
    fn from(mut input: ActiveDirectoryTestAndApplyInput) -> Self {
        let password = input
            .password
            .take()
            .unwrap_or_else(|| SecretString::new(String::new()));
        ApplyRequest {
            enable: input.enabled,
            ..ApplyRequest::new(
                input.active_directory_config,
                Credentials::Password {
                    username: input.username,
                    password,
                },
            )
        }
    }
}

/// Test-and-apply input for the LDAP family (LDAP, OpenLDAP, FreeIPA).
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LdapTestAndApplyInput {
    pub ldap_config: ProviderConfig,
    pub username: String,
    #[serde(default)]
    pub password: WriteOnly,
}

impl From<LdapTestAndApplyInput> for ApplyRequest {
    fn from(mut input: LdapTestAndApplyInput) -> Self {
        let password = input
            .password
            .take()
            .unwrap_or_else(|| SecretString::new(String::new()));
        ApplyRequest::new(
            input.ldap_config,
            Credentials::Password {
                username: input.username,
                password,
            },
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SamlConfigApplyInput {
    pub saml_config: ProviderConfig,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

impl From<SamlConfigApplyInput> for ApplyRequest {
    fn from(input: SamlConfigApplyInput) -> Self {
        ApplyRequest {
            enable: input.enabled,
            ..ApplyRequest::new(input.saml_config, Credentials::None)
        }
    }
}

/// Result of a redirect-style configuration test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigTestOutput {
    pub redirect_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deserialize_flattened_github_config_with_defaults() {
        let json = serde_json::json!({
            "type": "github",
            "enabled": true,
            "accessMode": "restricted",
            "clientId": "abc",
            "clientSecret": "shh"
        });
        let config: ProviderConfig = serde_json::from_value(json).unwrap();

        assert_eq!(config.kind(), ProviderKind::Github);
        assert_eq!(config.auth.access_mode, AccessMode::Restricted);
        match &config.settings {
            ProviderSettings::Github(c) => {
                assert_eq!(c.hostname, "github.com");
                assert!(c.tls);
                assert_eq!(c.client_secret.expose(), Some("shh"));
            }
            other => panic!("unexpected settings: {:?}", other),
        }
    }

    #[test]
    fn test_secrets_never_serialized() {
        let config = ProviderConfig::new(ProviderSettings::ActiveDirectory(ActiveDirectoryConfig {
            servers: vec!["ad.corp.local".to_string()],
            service_account_username: "svc".to_string(),
            service_account_password: WriteOnly::new("p@ss"),
            user_search_base: "DC=corp,DC=local".to_string(),
            ..ActiveDirectoryConfig::default()
        }));
        let json = serde_json::to_value(&config).unwrap();

        assert_eq!(json["type"], "activedirectory");
        assert_eq!(json["port"], 389);
        assert_eq!(json["groupDNAttribute"], "distinguishedName");
        assert!(json.get("serviceAccountPassword").is_none());
        assert!(!json.to_string().contains("p@ss"));
    }

    #[test]
    fn test_unset_port_is_omitted() {
        let config = ProviderConfig::new(ProviderSettings::Ldap(LdapConfig {
            port: 0,
            ..LdapConfig::default()
        }));
        let json = serde_json::to_value(&config).unwrap();
        assert!(json.get("port").is_none());

        let back: ProviderConfig = serde_json::from_value(json).unwrap();
        let ProviderSettings::Ldap(ldap) = back.settings else {
            panic!("expected an LDAP config");
        };
        assert_eq!(ldap.port, 389);
    }

    #[test]
    fn test_validate_requires_secret_and_fields() {
        let mut config = ProviderConfig::new(ProviderSettings::Ldap(LdapConfig {
            servers: vec!["ldap.example.org".to_string()],
            service_account_distinguished_name: "cn=admin,dc=example,dc=org".to_string(),
            user_search_base: "ou=people,dc=example,dc=org".to_string(),
            ..LdapConfig::default()
        }));
        assert!(matches!(config.validate(), Err(IdentityError::Validation(_))));

        if let ProviderSettings::Ldap(c) = &mut config.settings {
            c.service_account_password = WriteOnly::new("secret");
        }
        assert!(config.validate().is_ok());

        if let ProviderSettings::Ldap(c) = &mut config.settings {
            c.servers.clear();
        }
        assert!(matches!(config.validate(), Err(IdentityError::Validation(_))));
    }

    #[test]
    fn test_validate_rejects_malformed_allowed_ids() {
        let mut config = ProviderConfig::local();
        config.auth.allowed_principal_ids = vec!["not-a-principal".to_string()];
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_inherit_secrets_from_stored() {
        let stored = ProviderConfig::new(ProviderSettings::Github(GithubConfig {
            client_id: "abc".to_string(),
            client_secret: WriteOnly::new("stored"),
            ..GithubConfig::default()
        }));
        let mut update = ProviderConfig::new(ProviderSettings::Github(GithubConfig {
            client_id: "abc".to_string(),
            ..GithubConfig::default()
        }));
        update.inherit_secrets(&stored);
        assert_eq!(update, stored);
    }

    #[test]
    fn test_github_api_base() {
        let public = GithubConfig::default();
        assert_eq!(public.api_base(), "https://api.github.com");

        let enterprise = GithubConfig {
            hostname: "git.corp.local".to_string(),
            ..GithubConfig::default()
        };
        assert_eq!(enterprise.api_base(), "https://git.corp.local/api/v3");
    }

    #[test]
    fn test_apply_input_conversion() {
        let json = serde_json::json!({
            "activeDirectoryConfig": {"type": "activedirectory"},
            "username": "jdoe",
            "password": "pw"
        });
        let input: ActiveDirectoryTestAndApplyInput = serde_json::from_value(json).unwrap();
        let request = ApplyRequest::from(input);
        assert!(request.enable);
        assert!(matches!(request.credentials, Credentials::Password { ref username, .. } if username == "jdoe"));
    }
}
