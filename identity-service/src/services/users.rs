//! Local user accounts and their linked principals.

use std::sync::Arc;
use tokio::sync::Mutex;
use validator::Validate;

use crate::models::{
    ChangePasswordInput, CreateUserInput, Principal, PrincipalId, SetPasswordInput, User,
};
use crate::services::error::{IdentityError, IdentityResult};
use crate::services::group_cache::GroupMembershipCache;
use crate::services::store::{ObjectStore, Versioned};
use crate::services::token::TokenManager;
use crate::utils::{hash_password, verify_password, Password};

pub struct UserService {
    users: Arc<dyn ObjectStore<User>>,
    tokens: Arc<TokenManager>,
    groups: Arc<GroupMembershipCache>,
    // A principal may belong to one user only; linking is serialized.
    link_lock: Mutex<()>,
}

impl UserService {
    pub fn new(
        users: Arc<dyn ObjectStore<User>>,
        tokens: Arc<TokenManager>,
        groups: Arc<GroupMembershipCache>,
    ) -> Self {
        Self {
            users,
            tokens,
            groups,
            link_lock: Mutex::new(()),
        }
    }

    async fn load(&self, user_id: &str) -> IdentityResult<Versioned<User>> {
        self.users
            .get(user_id)
            .await?
            .ok_or_else(|| IdentityError::NotFound(format!("User {}", user_id)))
    }

    async fn all(&self) -> IdentityResult<Vec<User>> {
        Ok(self
            .users
            .list()
            .await?
            .into_iter()
            .map(|(_, stored)| stored.value)
            .collect())
    }

    pub async fn create_local(&self, input: CreateUserInput) -> IdentityResult<User> {
        input.validate()?;

        let _guard = self.link_lock.lock().await;
        if self.all().await?.iter().any(|u| u.username == input.username) {
            return Err(IdentityError::Conflict(format!(
                "Username {} is already taken",
                input.username
            )));
        }

        let display_name = if input.display_name.is_empty() {
            input.username.clone()
        } else {
            input.display_name
        };
        let mut user = User::new(input.username, display_name);
        user.description = input.description;
        user.must_change_password = input.must_change_password;
        user.password_hash = Some(hash_password(&Password::new(input.password))?);

        self.users.put(&user.id, user.clone(), Some(0)).await?;
        tracing::info!(user_id = %user.id, username = %user.username, "Local user created");
        Ok(user.sanitized(None))
    }

    /// Change one's own password after proving the current one.
    pub async fn change_password(&self, user_id: &str, input: ChangePasswordInput) -> IdentityResult<()> {
        input.validate()?;
        let stored = self.load(user_id).await?;
        let mut user = stored.value;

        let current = user
            .password_hash
            .as_ref()
            .ok_or_else(|| IdentityError::Credential("no local password set".to_string()))?;
        verify_password(&Password::new(input.current_password), current)?;

        user.password_hash = Some(hash_password(&Password::new(input.new_password))?);
        user.must_change_password = false;
        self.users.put(user_id, user, Some(stored.version)).await?;

        tracing::info!(user_id = %user_id, "Password changed");
        Ok(())
    }

    /// Administrative reset; the user must pick a new password at next login.
    pub async fn set_password(&self, user_id: &str, input: SetPasswordInput) -> IdentityResult<User> {
        input.validate()?;
        let stored = self.load(user_id).await?;
        let mut user = stored.value;

        user.password_hash = Some(hash_password(&Password::new(input.new_password))?);
        user.must_change_password = true;
        self.users.put(user_id, user.clone(), Some(stored.version)).await?;

        tracing::info!(user_id = %user_id, "Password set by administrator");
        Ok(user.sanitized(None))
    }

    pub async fn get(&self, user_id: &str, caller_user_id: Option<&str>) -> IdentityResult<User> {
        Ok(self.load(user_id).await?.value.sanitized(caller_user_id))
    }

    pub async fn list(&self, caller_user_id: Option<&str>) -> IdentityResult<Vec<User>> {
        Ok(self
            .all()
            .await?
            .iter()
            .map(|user| user.sanitized(caller_user_id))
            .collect())
    }

    pub async fn find_by_principal(&self, principal_id: &str) -> IdentityResult<Option<User>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .find(|user| user.has_principal(principal_id)))
    }

    /// The user linked to `principal`, created on first login.
    pub async fn get_or_create_for_principal(&self, principal: &Principal) -> IdentityResult<User> {
        let _guard = self.link_lock.lock().await;
        if let Some(user) = self.find_by_principal(&principal.id).await? {
            return Ok(user);
        }

        let display_name = if principal.display_name.is_empty() {
            principal.login_name.clone()
        } else {
            principal.display_name.clone()
        };
        let mut user = User::new(String::new(), display_name);
        user.add_principal(&principal.id);
        self.users.put(&user.id, user.clone(), Some(0)).await?;

        tracing::info!(user_id = %user.id, principal_id = %principal.id, "User created on first login");
        Ok(user)
    }

    /// Link a principal to a user. Existing links are kept.
    pub async fn link_principal(&self, user_id: &str, principal_id: &str) -> IdentityResult<User> {
        PrincipalId::parse(principal_id)?;

        let _guard = self.link_lock.lock().await;
        if let Some(owner) = self.find_by_principal(principal_id).await? {
            if owner.id == user_id {
                return Ok(owner);
            }
            return Err(IdentityError::Conflict(format!(
                "Principal {} is already linked to another user",
                principal_id
            )));
        }

        let stored = self.load(user_id).await?;
        let mut user = stored.value;
        user.add_principal(principal_id);
        self.users.put(user_id, user.clone(), Some(stored.version)).await?;

        tracing::info!(user_id = %user_id, principal_id = %principal_id, "Principal linked");
        Ok(user)
    }

    pub async fn unlink_principal(&self, user_id: &str, principal_id: &str) -> IdentityResult<User> {
        let _guard = self.link_lock.lock().await;
        let stored = self.load(user_id).await?;
        let mut user = stored.value;

        if principal_id == user.local_principal_id() {
            return Err(IdentityError::Validation(
                "A user's own local principal cannot be unlinked".to_string(),
            ));
        }
        if !user.remove_principal(principal_id) {
            return Err(IdentityError::NotFound(format!(
                "Principal {} is not linked to user {}",
                principal_id, user_id
            )));
        }
        self.users.put(user_id, user.clone(), Some(stored.version)).await?;

        tracing::info!(user_id = %user_id, principal_id = %principal_id, "Principal unlinked");
        Ok(user)
    }

    /// Delete a user with its group cache record and tokens.
    pub async fn delete(&self, user_id: &str) -> IdentityResult<()> {
        let _guard = self.link_lock.lock().await;
        if self.users.delete(user_id).await?.is_none() {
            return Err(IdentityError::NotFound(format!("User {}", user_id)));
        }
        self.groups.remove_user(user_id).await?;
        let tokens = self.tokens.delete_for_user(user_id);

        tracing::info!(user_id = %user_id, tokens, "User deleted");
        Ok(())
    }
}
