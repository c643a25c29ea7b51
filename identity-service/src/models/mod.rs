pub mod auth_config;
pub mod group;
pub mod principal;
pub mod secret;
pub mod token;
pub mod user;
pub mod user_attribute;

pub use auth_config::{
    AccessMode, ActiveDirectoryConfig, ActiveDirectoryTestAndApplyInput, ApplyRequest,
    AuthConfig, AzureAdConfig, AzureAdConfigApplyInput, ConfigTestOutput, Credentials,
    GithubConfig, GithubConfigApplyInput, LdapConfig, LdapTestAndApplyInput, LocalConfig,
    ProviderConfig, ProviderKind, ProviderSettings, SamlConfig, SamlConfigApplyInput,
};
pub use group::{Group, GroupMember};
pub use principal::{
    CallerContext, Principal, PrincipalId, PrincipalType, SearchPrincipalsInput, LOCAL_PROVIDER,
};
pub use secret::WriteOnly;
pub use token::{IssuedToken, SessionSnapshot, Token};
pub use user::{ChangePasswordInput, CreateUserInput, SetPasswordInput, User};
pub use user_attribute::UserAttribute;
