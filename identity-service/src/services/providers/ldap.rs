//! [`DirectoryConnector`] over LDAP v3.
//!
//! One short-lived connection per operation; servers are tried in order
//! until one accepts the connection.

use async_trait::async_trait;
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry};
use secrecy::{ExposeSecret, SecretString};

use crate::services::error::{IdentityError, IdentityResult};
use crate::services::provider::NativeRecord;
use crate::services::providers::directory::{DirectoryConnector, DirectoryEndpoint, SearchRequest};

const INVALID_CREDENTIALS: u32 = 49;
const NO_SUCH_OBJECT: u32 = 32;

#[derive(Debug, Clone, Default)]
pub struct LdapConnector;

impl LdapConnector {
    pub fn new() -> Self {
        Self
    }

    async fn connect(&self, endpoint: &DirectoryEndpoint) -> IdentityResult<Ldap> {
        let mut last_error = None;
        for server in &endpoint.servers {
            let url = server_url(server, endpoint.port, endpoint.tls);
            let settings = LdapConnSettings::new().set_conn_timeout(endpoint.connection_timeout);
            match LdapConnAsync::with_settings(settings, &url).await {
                Ok((conn, ldap)) => {
                    tokio::spawn(async move {
                        if let Err(e) = conn.drive().await {
                            tracing::warn!(error = %e, "Directory connection driver stopped");
                        }
                    });
                    return Ok(ldap);
                }
                Err(err) => {
                    tracing::warn!(server = %url, error = %err, "Directory server unreachable");
                    last_error = Some(err.to_string());
                }
            }
        }

        Err(IdentityError::ProviderUnavailable(format!(
            "No directory server reachable: {}",
            last_error.unwrap_or_else(|| "no servers configured".to_string())
        )))
    }

    async fn bind_as(ldap: &mut Ldap, dn: &str, password: &SecretString) -> IdentityResult<()> {
        ldap.simple_bind(dn, password.expose_secret())
            .await
            .and_then(|result| result.success())
            .map_err(|e| ldap_error("bind", e))?;
        Ok(())
    }
}

fn server_url(server: &str, port: u16, tls: bool) -> String {
    if server.contains("://") {
        return server.to_string();
    }
    let scheme = if tls { "ldaps" } else { "ldap" };
    format!("{}://{}:{}", scheme, server, port)
}

fn ldap_error(context: &str, err: LdapError) -> IdentityError {
    match err {
        LdapError::LdapResult { result } if result.rc == INVALID_CREDENTIALS => {
            IdentityError::Credential(format!("{}: invalid credentials", context))
        }
        LdapError::LdapResult { result } => IdentityError::Internal(anyhow::anyhow!(
            "{}: result code {} {}",
            context,
            result.rc,
            result.text
        )),
        other => IdentityError::ProviderUnavailable(format!("{}: {}", context, other)),
    }
}

#[async_trait]
impl DirectoryConnector for LdapConnector {
    async fn bind(
        &self,
        endpoint: &DirectoryEndpoint,
        dn: &str,
        password: &SecretString,
    ) -> IdentityResult<()> {
        let mut ldap = self.connect(endpoint).await?;
        let outcome = Self::bind_as(&mut ldap, dn, password).await;
        let _ = ldap.unbind().await;
        outcome
    }

    async fn search(
        &self,
        endpoint: &DirectoryEndpoint,
        request: &SearchRequest,
    ) -> IdentityResult<Vec<NativeRecord>> {
        let mut ldap = self.connect(endpoint).await?;
        Self::bind_as(&mut ldap, &endpoint.service_account, &endpoint.service_password).await?;

        let filter = request.filter.to_ldap_string();
        tracing::debug!(base = %request.base, filter = %filter, "Directory search");
        let result = ldap
            .search(&request.base, Scope::Subtree, &filter, request.attributes.clone())
            .await
            .and_then(|rs| rs.success());
        let _ = ldap.unbind().await;

        let entries = match result {
            Ok((entries, _)) => entries,
            Err(LdapError::LdapResult { result }) if result.rc == NO_SUCH_OBJECT => Vec::new(),
            Err(e) => return Err(ldap_error("search", e)),
        };

        Ok(entries
            .into_iter()
            .map(|entry| {
                let entry = SearchEntry::construct(entry);
                NativeRecord {
                    id: entry.dn,
                    principal_type: None,
                    attributes: entry.attrs.into_iter().collect(),
                }
            })
            .collect())
    }
}
