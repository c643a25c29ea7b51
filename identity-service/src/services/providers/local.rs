//! Local provider: accounts and groups held in this system's own stores.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::{Arc, OnceLock};

use crate::models::{
    Credentials, Group, GroupMember, Principal, PrincipalId, PrincipalType, ProviderConfig,
    ProviderKind, User, LOCAL_PROVIDER,
};
use crate::services::error::{IdentityError, IdentityResult};
use crate::services::provider::{
    AttributeMapping, AuthenticatedIdentity, FieldMapping, IdentityProvider, NativeRecord,
    PrincipalStream,
};
use crate::services::store::ObjectStore;
use crate::utils::{hash_password, verify_password, Password, PasswordHashString};

pub struct LocalProvider {
    users: Arc<dyn ObjectStore<User>>,
    groups: Arc<dyn ObjectStore<Group>>,
    members: Arc<dyn ObjectStore<GroupMember>>,
    // Verified against when the account is missing, so both paths pay for Argon2.
    decoy_hash: OnceLock<Option<PasswordHashString>>,
}

impl LocalProvider {
    pub fn new(
        users: Arc<dyn ObjectStore<User>>,
        groups: Arc<dyn ObjectStore<Group>>,
        members: Arc<dyn ObjectStore<GroupMember>>,
    ) -> Self {
        Self {
            users,
            groups,
            members,
            decoy_hash: OnceLock::new(),
        }
    }

    fn decoy_hash(&self) -> Option<&PasswordHashString> {
        self.decoy_hash
            .get_or_init(|| {
                hash_password(&Password::new("decoy-password".to_string()))
                    .map_err(|err| tracing::warn!(error = %err, "Failed to prepare decoy password hash"))
                    .ok()
            })
            .as_ref()
    }

    /// Burn a hash verification on a path that has no real hash to check.
    fn verify_decoy(&self, password: &Password) {
        if let Some(decoy) = self.decoy_hash() {
            let _ = verify_password(password, decoy);
        }
    }

    fn mapping() -> AttributeMapping {
        AttributeMapping {
            user: FieldMapping::new("displayName", "username"),
            group: FieldMapping::new("displayName", "displayName"),
        }
    }

    fn user_record(user: &User) -> NativeRecord {
        NativeRecord::new(&user.id, PrincipalType::User)
            .with_attr("displayName", &user.display_name)
            .with_attr("username", &user.username)
    }

    fn group_record(group: &Group) -> NativeRecord {
        NativeRecord::new(&group.id, PrincipalType::Group)
            .with_attr("displayName", &group.display_name)
    }

    fn principal(record: &NativeRecord) -> IdentityResult<Principal> {
        Self::mapping().resolve(LOCAL_PROVIDER, record)
    }

    async fn find_by_username(&self, username: &str) -> IdentityResult<User> {
        self.users
            .list()
            .await?
            .into_iter()
            .map(|(_, stored)| stored.value)
            .find(|user| user.username == username)
            .ok_or_else(|| IdentityError::NotFound(format!("Local user {}", username)))
    }

    /// Local groups that list `principal_id` as a member.
    pub async fn groups_of(&self, principal_id: &str) -> IdentityResult<Vec<Principal>> {
        let mut groups = Vec::new();
        for (_, member) in self.members.list().await? {
            if member.value.principal_id != principal_id {
                continue;
            }
            match self.groups.get(&member.value.group_name).await? {
                Some(group) => groups.push(Self::principal(&Self::group_record(&group.value))?),
                None => tracing::warn!(
                    group = %member.value.group_name,
                    "Group membership references a missing group"
                ),
            }
        }
        groups.sort_by(|a, b| a.display_name.cmp(&b.display_name));
        Ok(groups)
    }

    pub async fn create_group(&self, display_name: &str) -> IdentityResult<Group> {
        let group = Group::new(display_name);
        self.groups.put(&group.id, group.clone(), Some(0)).await?;
        tracing::info!(group_id = %group.id, "Local group created");
        Ok(group)
    }

    pub async fn add_member(&self, group_id: &str, principal_id: &str) -> IdentityResult<GroupMember> {
        let group = self
            .groups
            .get(group_id)
            .await?
            .ok_or_else(|| IdentityError::NotFound(format!("Group {}", group_id)))?
            .value;
        PrincipalId::parse(principal_id)?;

        let member = GroupMember::new(&group, principal_id);
        self.members.put(&member.id, member.clone(), Some(0)).await?;
        Ok(member)
    }
}

#[async_trait]
impl IdentityProvider for LocalProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn attribute_mapping(&self, _config: &ProviderConfig) -> AttributeMapping {
        Self::mapping()
    }

    async fn test_and_apply(
        &self,
        _config: &ProviderConfig,
        _credentials: &Credentials,
    ) -> IdentityResult<Option<AuthenticatedIdentity>> {
        Ok(None)
    }

    async fn authenticate(
        &self,
        _config: &ProviderConfig,
        credentials: &Credentials,
    ) -> IdentityResult<AuthenticatedIdentity> {
        let Credentials::Password { username, password } = credentials else {
            return Err(IdentityError::Validation(
                "Local login requires a username and password".to_string(),
            ));
        };

        let password = Password::from(password.clone());
        let user = match self.find_by_username(username).await {
            Ok(user) => user,
            Err(err) => {
                self.verify_decoy(&password);
                return Err(err);
            }
        };
        let Some(hash) = user.password_hash.as_ref() else {
            self.verify_decoy(&password);
            return Err(IdentityError::Credential("no local password set".to_string()));
        };
        verify_password(&password, hash)?;

        let principal = Self::principal(&Self::user_record(&user))?;
        let groups = self.groups_of(&principal.id).await?;
        Ok(AuthenticatedIdentity::new(principal, groups))
    }

    async fn search(
        &self,
        _config: &ProviderConfig,
        text: &str,
        principal_type: Option<PrincipalType>,
    ) -> IdentityResult<PrincipalStream> {
        let needle = text.to_lowercase();
        let users = self.users.clone();
        let groups = self.groups.clone();

        let user_needle = needle.clone();
        let user_page = stream::once(async move {
            let mut matches: Vec<User> = users
                .list()
                .await?
                .into_iter()
                .map(|(_, stored)| stored.value)
                .filter(|user| {
                    user.username.to_lowercase().starts_with(&user_needle)
                        || user.display_name.to_lowercase().starts_with(&user_needle)
                })
                .collect();
            matches.sort_by(|a, b| a.username.cmp(&b.username));
            matches
                .iter()
                .map(|user| Self::principal(&Self::user_record(user)))
                .collect::<IdentityResult<Vec<_>>>()
        });

        let group_page = stream::once(async move {
            let mut matches: Vec<Group> = groups
                .list()
                .await?
                .into_iter()
                .map(|(_, stored)| stored.value)
                .filter(|group| group.display_name.to_lowercase().starts_with(&needle))
                .collect();
            matches.sort_by(|a, b| a.display_name.cmp(&b.display_name));
            matches
                .iter()
                .map(|group| Self::principal(&Self::group_record(group)))
                .collect::<IdentityResult<Vec<_>>>()
        });

        let pages = match principal_type {
            Some(PrincipalType::User) => user_page.boxed(),
            Some(PrincipalType::Group) => group_page.boxed(),
            None => user_page.chain(group_page).boxed(),
        };

        Ok(pages
            .flat_map(|page| match page {
                Ok(principals) => stream::iter(principals.into_iter().map(Ok).collect::<Vec<_>>()),
                Err(err) => stream::iter(vec![Err(err)]),
            })
            .boxed())
    }

    async fn get_principal(
        &self,
        _config: &ProviderConfig,
        id: &PrincipalId,
    ) -> IdentityResult<Principal> {
        match id.principal_type {
            PrincipalType::User => {
                let user = self
                    .users
                    .get(&id.native_id)
                    .await?
                    .ok_or_else(|| IdentityError::NotFound(format!("Principal {}", id)))?;
                Self::principal(&Self::user_record(&user.value))
            }
            PrincipalType::Group => {
                let group = self
                    .groups
                    .get(&id.native_id)
                    .await?
                    .ok_or_else(|| IdentityError::NotFound(format!("Principal {}", id)))?;
                Self::principal(&Self::group_record(&group.value))
            }
        }
    }

    async fn groups_for(
        &self,
        _config: &ProviderConfig,
        principal: &PrincipalId,
    ) -> IdentityResult<Vec<Principal>> {
        self.groups_of(&principal.to_string()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::store::MemoryStore;
    use crate::utils::hash_password;
    use futures::TryStreamExt;

    async fn provider_with_user() -> (LocalProvider, User) {
        let users: Arc<dyn ObjectStore<User>> = Arc::new(MemoryStore::new());
        let mut user = User::new("admin".to_string(), "Default Admin".to_string());
        user.password_hash = Some(hash_password(&Password::new("correct-horse".to_string())).unwrap());
        users.put(&user.id, user.clone(), None).await.unwrap();

        let provider = LocalProvider::new(
            users,
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryStore::new()),
        );
        (provider, user)
    }

    #[tokio::test]
    async fn test_authenticate_with_groups() {
        let (provider, user) = provider_with_user().await;
        let group = provider.create_group("Operators").await.unwrap();
        provider
            .add_member(&group.id, &user.local_principal_id())
            .await
            .unwrap();

        let identity = provider
            .authenticate(
                &ProviderConfig::local(),
                &Credentials::password("admin", "correct-horse"),
            )
            .await
            .unwrap();
        assert_eq!(identity.user.id, format!("local://{}", user.id));
        assert_eq!(identity.user.login_name, "admin");
        assert_eq!(identity.groups.len(), 1);
        assert_eq!(identity.groups[0].id, format!("local_group://{}", group.id));
    }

    #[tokio::test]
    async fn test_authenticate_failures() {
        let (provider, _) = provider_with_user().await;
        let config = ProviderConfig::local();

        assert!(matches!(
            provider
                .authenticate(&config, &Credentials::password("admin", "wrong"))
                .await,
            Err(IdentityError::Credential(_))
        ));
        assert!(matches!(
            provider
                .authenticate(&config, &Credentials::password("nobody", "x"))
                .await,
            Err(IdentityError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_unknown_user_still_verifies_a_hash() {
        let (provider, _) = provider_with_user().await;
        let config = ProviderConfig::local();

        provider
            .authenticate(&config, &Credentials::password("admin", "correct-horse"))
            .await
            .unwrap();
        assert!(provider.decoy_hash.get().is_none());

        let err = provider
            .authenticate(&config, &Credentials::password("nobody", "correct-horse"))
            .await
            .unwrap_err();
        assert!(matches!(err, IdentityError::NotFound(_)));
        assert!(matches!(provider.decoy_hash.get(), Some(Some(_))));
    }

    #[tokio::test]
    async fn test_search_and_get_principal() {
        let (provider, user) = provider_with_user().await;
        provider.create_group("admins").await.unwrap();
        let config = ProviderConfig::local();

        let found: Vec<Principal> = provider
            .search(&config, "ad", None)
            .await
            .unwrap()
            .try_collect()
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].principal_type, PrincipalType::User);
        assert_eq!(found[1].principal_type, PrincipalType::Group);

        let id = PrincipalId::local_user(&user.id);
        let principal = provider.get_principal(&config, &id).await.unwrap();
        assert_eq!(principal.display_name, "Default Admin");

        let missing = PrincipalId::local_user("u-missing");
        assert!(matches!(
            provider.get_principal(&config, &missing).await,
            Err(IdentityError::NotFound(_))
        ));
    }
}
