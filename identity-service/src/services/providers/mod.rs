pub mod azuread;
pub mod directory;
pub mod github;
pub mod ldap;
pub mod local;
pub mod saml;

pub use azuread::{AzureAdProvider, AzureGraphApi, AzureGraphClient, GraphObject};
pub use directory::{
    DirectoryConnector, DirectoryEndpoint, DirectoryFilter, DirectoryProvider, DirectorySchema,
    SearchRequest,
};
pub use github::{GithubAccount, GithubApi, GithubClient, GithubProvider, GithubTeam};
pub use ldap::LdapConnector;
pub use local::LocalProvider;
pub use saml::{HttpMetadataSource, SamlMetadataSource, SamlProvider};

use tokio::time::{timeout, Duration};

use crate::services::error::{IdentityError, IdentityResult};

/// Map an HTTP failure from an OAuth/REST collaborator into the error taxonomy.
pub(crate) fn http_error(context: &str, err: reqwest::Error) -> IdentityError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        return IdentityError::ProviderUnavailable(format!("{}: {}", context, err));
    }
    match err.status() {
        Some(status) if status == reqwest::StatusCode::NOT_FOUND => {
            IdentityError::NotFound(context.to_string())
        }
        Some(status)
            if status == reqwest::StatusCode::UNAUTHORIZED
                || status == reqwest::StatusCode::FORBIDDEN =>
        {
            IdentityError::Credential(format!("{}: {}", context, status))
        }
        Some(status) if status.is_server_error() => {
            IdentityError::ProviderUnavailable(format!("{}: {}", context, status))
        }
        _ => IdentityError::Internal(anyhow::anyhow!("{}: {}", context, err)),
    }
}

/// Run a collaborator call under a deadline.
pub(crate) async fn with_deadline<T, F>(
    what: &str,
    deadline: Duration,
    call: F,
) -> IdentityResult<T>
where
    F: std::future::Future<Output = IdentityResult<T>>,
{
    match timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(IdentityError::ProviderUnavailable(format!(
            "{} timed out after {}ms",
            what,
            deadline.as_millis()
        ))),
    }
}
