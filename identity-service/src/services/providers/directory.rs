//! Directory providers: Active Directory and the LDAP family.
//!
//! The wire protocol lives behind [`DirectoryConnector`]; this module owns
//! the search filters, the attribute mapping and the login rules (default
//! login domain, disabled-account bit mask).

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};

use crate::models::{
    ActiveDirectoryConfig, Credentials, LdapConfig, Principal, PrincipalId, PrincipalType,
    ProviderConfig, ProviderKind, ProviderSettings,
};
use crate::services::error::{IdentityError, IdentityResult};
use crate::services::provider::{
    AttributeMapping, AuthenticatedIdentity, FieldMapping, IdentityProvider, NativeRecord,
    PrincipalStream,
};
use crate::services::providers::with_deadline;

/// Where and as whom to connect.
#[derive(Clone)]
pub struct DirectoryEndpoint {
    pub servers: Vec<String>,
    pub port: u16,
    pub tls: bool,
    pub certificate: String,
    pub connection_timeout: Duration,
    pub service_account: String,
    pub service_password: SecretString,
}

impl std::fmt::Debug for DirectoryEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryEndpoint")
            .field("servers", &self.servers)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("service_account", &self.service_account)
            .finish()
    }
}

/// Search filter, rendered to RFC 4515 syntax by [`DirectoryFilter::to_ldap_string`].
#[derive(Debug, Clone, PartialEq)]
pub enum DirectoryFilter {
    And(Vec<DirectoryFilter>),
    Or(Vec<DirectoryFilter>),
    Equals(String, String),
    Prefix(String, String),
}

impl DirectoryFilter {
    pub fn equals(attr: &str, value: &str) -> Self {
        DirectoryFilter::Equals(attr.to_string(), value.to_string())
    }

    pub fn prefix(attr: &str, value: &str) -> Self {
        DirectoryFilter::Prefix(attr.to_string(), value.to_string())
    }

    pub fn to_ldap_string(&self) -> String {
        let mut out = String::new();
        self.write_ldap(&mut out);
        out
    }

    fn write_ldap(&self, out: &mut String) {
        match self {
            DirectoryFilter::And(parts) | DirectoryFilter::Or(parts) => {
                out.push('(');
                out.push(if matches!(self, DirectoryFilter::And(_)) { '&' } else { '|' });
                for part in parts {
                    part.write_ldap(out);
                }
                out.push(')');
            }
            DirectoryFilter::Equals(attr, value) => {
                let _ = write!(out, "({}={})", attr, escape_filter_value(value));
            }
            DirectoryFilter::Prefix(attr, value) => {
                let _ = write!(out, "({}={}*)", attr, escape_filter_value(value));
            }
        }
    }

    /// Evaluate against a record the way a directory server would,
    /// case-insensitively.
    pub fn matches(&self, record: &NativeRecord) -> bool {
        match self {
            DirectoryFilter::And(parts) => parts.iter().all(|p| p.matches(record)),
            DirectoryFilter::Or(parts) => parts.iter().any(|p| p.matches(record)),
            DirectoryFilter::Equals(attr, value) => record.has_value(attr, value),
            DirectoryFilter::Prefix(attr, value) => {
                let value = value.to_lowercase();
                record
                    .attrs(attr)
                    .iter()
                    .any(|v| v.to_lowercase().starts_with(&value))
            }
        }
    }
}

/// Escape a value for use inside a filter (RFC 4515 section 3).
pub fn escape_filter_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '*' => escaped.push_str("\\2a"),
            '(' => escaped.push_str("\\28"),
            ')' => escaped.push_str("\\29"),
            '\\' => escaped.push_str("\\5c"),
            '\0' => escaped.push_str("\\00"),
            other => escaped.push(other),
        }
    }
    escaped
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub base: String,
    pub filter: DirectoryFilter,
    pub attributes: Vec<String>,
}

/// Directory wire protocol.
///
/// `search` binds as the endpoint's service account. Implementations report
/// unreachable servers as `ProviderUnavailable` and rejected binds as
/// `Credential`.
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    async fn bind(
        &self,
        endpoint: &DirectoryEndpoint,
        dn: &str,
        password: &SecretString,
    ) -> IdentityResult<()>;

    async fn search(
        &self,
        endpoint: &DirectoryEndpoint,
        request: &SearchRequest,
    ) -> IdentityResult<Vec<NativeRecord>>;
}

/// The settings of either directory config flavour, in one shape.
#[derive(Debug, Clone)]
pub struct DirectorySchema {
    pub kind: ProviderKind,
    pub endpoint: DirectoryEndpoint,
    pub default_login_domain: String,
    pub user_disabled_bit_mask: i64,
    pub dn_attribute: String,
    pub user_search_base: String,
    pub user_search_attributes: Vec<String>,
    pub user_login_attribute: String,
    pub user_object_class: String,
    pub user_name_attribute: String,
    pub user_enabled_attribute: String,
    pub group_search_base: String,
    pub group_search_attribute: String,
    pub group_object_class: String,
    pub group_name_attribute: String,
    pub group_member_user_attribute: String,
    pub group_member_mapping_attribute: String,
}

fn service_password(secret: &crate::models::WriteOnly) -> SecretString {
    SecretString::new(secret.expose().unwrap_or_default().to_string())
}

fn split_attributes(attributes: &str) -> Vec<String> {
    attributes
        .split('|')
        .map(str::trim)
        .filter(|a| !a.is_empty())
        .map(str::to_string)
        .collect()
}

impl DirectorySchema {
    pub fn from_config(config: &ProviderConfig) -> IdentityResult<Self> {
        match &config.settings {
            ProviderSettings::ActiveDirectory(c) => Ok(Self::from_active_directory(c)),
            ProviderSettings::Ldap(c) | ProviderSettings::OpenLdap(c) | ProviderSettings::FreeIpa(c) => {
                Ok(Self::from_ldap(config.kind(), c))
            }
            other => Err(IdentityError::Validation(format!(
                "{} is not a directory provider",
                other.kind()
            ))),
        }
    }

    fn from_active_directory(c: &ActiveDirectoryConfig) -> Self {
        let mut schema = Self {
            kind: ProviderKind::ActiveDirectory,
            endpoint: DirectoryEndpoint {
                servers: c.servers.clone(),
                port: c.port,
                tls: c.tls,
                certificate: c.certificate.clone(),
                connection_timeout: Duration::from_millis(c.connection_timeout),
                service_account: String::new(),
                service_password: service_password(&c.service_account_password),
            },
            default_login_domain: c.default_login_domain.clone(),
            user_disabled_bit_mask: c.user_disabled_bit_mask,
            dn_attribute: c.group_dn_attribute.clone(),
            user_search_base: c.user_search_base.clone(),
            user_search_attributes: split_attributes(&c.user_search_attribute),
            user_login_attribute: c.user_login_attribute.clone(),
            user_object_class: c.user_object_class.clone(),
            user_name_attribute: c.user_name_attribute.clone(),
            user_enabled_attribute: c.user_enabled_attribute.clone(),
            group_search_base: c.group_search_base.clone(),
            group_search_attribute: c.group_search_attribute.clone(),
            group_object_class: c.group_object_class.clone(),
            group_name_attribute: c.group_name_attribute.clone(),
            group_member_user_attribute: c.group_member_user_attribute.clone(),
            group_member_mapping_attribute: c.group_member_mapping_attribute.clone(),
        };
        schema.endpoint.service_account = schema.bind_name(&c.service_account_username);
        schema
    }

    fn from_ldap(kind: ProviderKind, c: &LdapConfig) -> Self {
        Self {
            kind,
            endpoint: DirectoryEndpoint {
                servers: c.servers.clone(),
                port: c.port,
                tls: c.tls,
                certificate: c.certificate.clone(),
                connection_timeout: Duration::from_millis(c.connection_timeout),
                service_account: c.service_account_distinguished_name.clone(),
                service_password: service_password(&c.service_account_password),
            },
            default_login_domain: String::new(),
            user_disabled_bit_mask: c.user_disabled_bit_mask,
            dn_attribute: c.group_dn_attribute.clone(),
            user_search_base: c.user_search_base.clone(),
            user_search_attributes: split_attributes(&c.user_search_attribute),
            user_login_attribute: c.user_login_attribute.clone(),
            user_object_class: c.user_object_class.clone(),
            user_name_attribute: c.user_name_attribute.clone(),
            user_enabled_attribute: c.user_enabled_attribute.clone(),
            group_search_base: c.group_search_base.clone(),
            group_search_attribute: c.group_search_attribute.clone(),
            group_object_class: c.group_object_class.clone(),
            group_name_attribute: c.group_name_attribute.clone(),
            group_member_user_attribute: c.group_member_user_attribute.clone(),
            group_member_mapping_attribute: c.group_member_mapping_attribute.clone(),
        }
    }

    pub fn is_active_directory(&self) -> bool {
        self.kind == ProviderKind::ActiveDirectory
    }

    fn group_base(&self) -> &str {
        if self.group_search_base.is_empty() {
            &self.user_search_base
        } else {
            &self.group_search_base
        }
    }

    /// Name to bind with. Bare AD usernames get the default login domain.
    pub fn bind_name(&self, username: &str) -> String {
        if self.default_login_domain.is_empty() || username.contains('\\') || username.contains('@')
        {
            username.to_string()
        } else {
            format!("{}\\{}", self.default_login_domain, username)
        }
    }

    /// Login attribute value: the username without any `DOMAIN\` or `@domain` part.
    pub fn login_value<'a>(&self, username: &'a str) -> &'a str {
        if let Some((_, user)) = username.split_once('\\') {
            return user;
        }
        if self.is_active_directory() {
            if let Some((user, _)) = username.split_once('@') {
                return user;
            }
        }
        username
    }

    pub fn mapping(&self) -> AttributeMapping {
        AttributeMapping {
            user: FieldMapping::new(&self.user_name_attribute, &self.user_login_attribute),
            group: FieldMapping::new(&self.group_name_attribute, &self.group_search_attribute),
        }
    }

    fn user_attributes(&self) -> Vec<String> {
        let mut attrs = vec![
            self.dn_attribute.clone(),
            self.user_login_attribute.clone(),
            self.user_name_attribute.clone(),
            self.group_member_user_attribute.clone(),
        ];
        if !self.user_enabled_attribute.is_empty() {
            attrs.push(self.user_enabled_attribute.clone());
        }
        attrs.extend(self.user_search_attributes.iter().cloned());
        attrs.sort();
        attrs.dedup();
        attrs
    }

    fn group_attributes(&self) -> Vec<String> {
        let mut attrs = vec![
            self.dn_attribute.clone(),
            self.group_name_attribute.clone(),
            self.group_search_attribute.clone(),
        ];
        attrs.sort();
        attrs.dedup();
        attrs
    }

    fn user_request(&self, filter: DirectoryFilter) -> SearchRequest {
        SearchRequest {
            base: self.user_search_base.clone(),
            filter: DirectoryFilter::And(vec![
                DirectoryFilter::equals("objectClass", &self.user_object_class),
                filter,
            ]),
            attributes: self.user_attributes(),
        }
    }

    fn group_request(&self, filter: DirectoryFilter) -> SearchRequest {
        SearchRequest {
            base: self.group_base().to_string(),
            filter: DirectoryFilter::And(vec![
                DirectoryFilter::equals("objectClass", &self.group_object_class),
                filter,
            ]),
            attributes: self.group_attributes(),
        }
    }

    /// Whether the account's enabled attribute has a disabled bit set.
    pub fn is_disabled(&self, record: &NativeRecord) -> bool {
        if self.user_disabled_bit_mask == 0 || self.user_enabled_attribute.is_empty() {
            return false;
        }
        record
            .attr(&self.user_enabled_attribute)
            .and_then(|value| value.trim().parse::<i64>().ok())
            .map(|flags| flags & self.user_disabled_bit_mask != 0)
            .unwrap_or(false)
    }

    fn typed(records: Vec<NativeRecord>, principal_type: PrincipalType) -> Vec<NativeRecord> {
        records
            .into_iter()
            .map(|mut record| {
                record.principal_type = Some(principal_type);
                record
            })
            .collect()
    }
}

/// Provider for Active Directory, LDAP, OpenLDAP and FreeIPA.
pub struct DirectoryProvider {
    kind: ProviderKind,
    connector: Arc<dyn DirectoryConnector>,
}

impl DirectoryProvider {
    pub fn new(kind: ProviderKind, connector: Arc<dyn DirectoryConnector>) -> Self {
        Self { kind, connector }
    }

    fn schema(&self, config: &ProviderConfig) -> IdentityResult<DirectorySchema> {
        if config.kind() != self.kind {
            return Err(IdentityError::Validation(format!(
                "{} provider cannot use a {} configuration",
                self.kind,
                config.kind()
            )));
        }
        DirectorySchema::from_config(config)
    }

    async fn search_records(
        &self,
        schema: &DirectorySchema,
        request: SearchRequest,
        principal_type: PrincipalType,
    ) -> IdentityResult<Vec<NativeRecord>> {
        tracing::debug!(
            provider = %self.kind,
            base = %request.base,
            filter = %request.filter.to_ldap_string(),
            "Directory search"
        );
        let records = with_deadline(
            "directory search",
            schema.endpoint.connection_timeout,
            self.connector.search(&schema.endpoint, &request),
        )
        .await?;
        Ok(DirectorySchema::typed(records, principal_type))
    }

    async fn find_user(&self, schema: &DirectorySchema, username: &str) -> IdentityResult<NativeRecord> {
        let login = schema.login_value(username);
        let request = schema.user_request(DirectoryFilter::equals(&schema.user_login_attribute, login));
        let mut records = self.search_records(schema, request, PrincipalType::User).await?;

        match records.len() {
            0 => Err(IdentityError::NotFound(format!("Directory user {}", login))),
            1 => Ok(records.remove(0)),
            n => Err(IdentityError::Credential(format!(
                "{} directory entries match {}",
                n, login
            ))),
        }
    }

    async fn find_by_dn(
        &self,
        schema: &DirectorySchema,
        dn: &str,
        principal_type: PrincipalType,
    ) -> IdentityResult<NativeRecord> {
        let filter = DirectoryFilter::equals(&schema.dn_attribute, dn);
        let request = match principal_type {
            PrincipalType::User => schema.user_request(filter),
            PrincipalType::Group => schema.group_request(filter),
        };
        self.search_records(schema, request, principal_type)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| IdentityError::NotFound(format!("Directory entry {}", dn)))
    }

    async fn groups_of_record(
        &self,
        schema: &DirectorySchema,
        user: &NativeRecord,
    ) -> IdentityResult<Vec<Principal>> {
        let member_value = user
            .attr(&schema.group_member_user_attribute)
            .unwrap_or(user.id.as_str());
        let request = schema.group_request(DirectoryFilter::equals(
            &schema.group_member_mapping_attribute,
            member_value,
        ));
        let mapping = schema.mapping();
        let mut groups = self
            .search_records(schema, request, PrincipalType::Group)
            .await?
            .iter()
            .map(|record| mapping.resolve(self.name(), record))
            .collect::<IdentityResult<Vec<_>>>()?;
        groups.sort_by(|a, b| a.login_name.cmp(&b.login_name));
        Ok(groups)
    }

    async fn login(
        &self,
        schema: &DirectorySchema,
        credentials: &Credentials,
    ) -> IdentityResult<AuthenticatedIdentity> {
        let Credentials::Password { username, password } = credentials else {
            return Err(IdentityError::Validation(
                "Directory login requires a username and password".to_string(),
            ));
        };
        // An empty password would be an anonymous bind.
        if username.is_empty() || password.expose_secret().is_empty() {
            return Err(IdentityError::Credential("username and password are required".to_string()));
        }

        let record = self.find_user(schema, username).await?;
        if schema.is_disabled(&record) {
            tracing::info!(provider = %self.kind, user = %record.id, "Login rejected for disabled account");
            return Err(IdentityError::Credential("account disabled".to_string()));
        }

        let bind_as = if schema.is_active_directory() {
            schema.bind_name(username)
        } else {
            record.id.clone()
        };
        with_deadline(
            "directory bind",
            schema.endpoint.connection_timeout,
            self.connector.bind(&schema.endpoint, &bind_as, password),
        )
        .await?;

        let user = schema.mapping().resolve(self.name(), &record)?;
        let groups = self.groups_of_record(schema, &record).await?;
        Ok(AuthenticatedIdentity::new(user, groups))
    }
}

#[async_trait]
impl IdentityProvider for DirectoryProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn attribute_mapping(&self, config: &ProviderConfig) -> AttributeMapping {
        DirectorySchema::from_config(config)
            .map(|schema| schema.mapping())
            .unwrap_or_default()
    }

    /// Service-account bind followed by a bind as the test user.
    async fn test_and_apply(
        &self,
        config: &ProviderConfig,
        credentials: &Credentials,
    ) -> IdentityResult<Option<AuthenticatedIdentity>> {
        let schema = self.schema(config)?;
        with_deadline(
            "service account bind",
            schema.endpoint.connection_timeout,
            self.connector.bind(
                &schema.endpoint,
                &schema.endpoint.service_account,
                &schema.endpoint.service_password,
            ),
        )
        .await?;

        self.login(&schema, credentials).await.map(Some)
    }

    async fn authenticate(
        &self,
        config: &ProviderConfig,
        credentials: &Credentials,
    ) -> IdentityResult<AuthenticatedIdentity> {
        let schema = self.schema(config)?;
        self.login(&schema, credentials).await
    }

    async fn search(
        &self,
        config: &ProviderConfig,
        text: &str,
        principal_type: Option<PrincipalType>,
    ) -> IdentityResult<PrincipalStream> {
        let schema = self.schema(config)?;
        let mut requests = Vec::new();
        if principal_type != Some(PrincipalType::Group) {
            let filters = schema
                .user_search_attributes
                .iter()
                .map(|attr| DirectoryFilter::prefix(attr, text))
                .collect();
            requests.push((schema.user_request(DirectoryFilter::Or(filters)), PrincipalType::User));
        }
        if principal_type != Some(PrincipalType::User) {
            let filter = DirectoryFilter::prefix(&schema.group_search_attribute, text);
            requests.push((schema.group_request(filter), PrincipalType::Group));
        }

        let connector = self.connector.clone();
        let endpoint = schema.endpoint.clone();
        let mapping = schema.mapping();
        let name = self.name();

        let pages = stream::iter(requests).then(move |(request, principal_type)| {
            let connector = connector.clone();
            let endpoint = endpoint.clone();
            async move {
                let records = with_deadline(
                    "directory search",
                    endpoint.connection_timeout,
                    connector.search(&endpoint, &request),
                )
                .await?;
                Ok::<_, IdentityError>(DirectorySchema::typed(records, principal_type))
            }
        });

        Ok(pages
            .flat_map(move |page| {
                let items: Vec<IdentityResult<Principal>> = match page {
                    Ok(mut records) => {
                        records.sort_by_cached_key(|record| {
                            let login = record
                                .principal_type
                                .map(|t| mapping.for_type(t).login_name.as_str())
                                .unwrap_or_default();
                            record.attr(login).unwrap_or_default().to_lowercase()
                        });
                        records
                            .iter()
                            .map(|record| mapping.resolve(name, record))
                            .collect()
                    }
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
        let schema = self.schema(config)?;
        let record = self.find_by_dn(&schema, &id.native_id, id.principal_type).await?;
        self.resolve(config, &record)
    }

    async fn groups_for(
        &self,
        config: &ProviderConfig,
        principal: &PrincipalId,
    ) -> IdentityResult<Vec<Principal>> {
        if principal.principal_type == PrincipalType::Group {
            return Ok(Vec::new());
        }
        let schema = self.schema(config)?;
        let record = self
            .find_by_dn(&schema, &principal.native_id, PrincipalType::User)
            .await?;
        self.groups_of_record(&schema, &record).await
    }
}
