//! User model - locally managed accounts and their linked principals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::models::principal::{PrincipalId, LOCAL_PROVIDER};
use crate::models::secret::WriteOnly;
use crate::utils::PasswordHashString;

/// User entity.
///
/// `principal_ids` is an ordered set: the first entry is always the user's
/// own `local://` principal, followed by linked federated principals.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing)]
    pub password: WriteOnly,
    #[serde(skip)]
    pub password_hash: Option<PasswordHashString>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub must_change_password: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub principal_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub me: bool,
    pub created_utc: DateTime<Utc>,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl User {
    /// Create a new user with its local principal.
    pub fn new(username: String, display_name: String) -> Self {
        let id = format!("u-{}", &Uuid::new_v4().simple().to_string()[..12]);
        let local = PrincipalId::local_user(&id).to_string();
        Self {
            id,
            display_name,
            description: String::new(),
            username,
            password: WriteOnly::empty(),
            password_hash: None,
            must_change_password: false,
            principal_ids: vec![local],
            me: false,
            created_utc: Utc::now(),
        }
    }

    pub fn local_principal_id(&self) -> String {
        PrincipalId::local_user(&self.id).to_string()
    }

    pub fn has_principal(&self, principal_id: &str) -> bool {
        self.principal_ids.iter().any(|p| p == principal_id)
    }

    /// First linked principal that belongs to `provider`.
    pub fn principal_for_provider(&self, provider: &str) -> Option<PrincipalId> {
        self.principal_ids
            .iter()
            .filter_map(|id| PrincipalId::parse(id).ok())
            .find(|id| id.provider == provider)
    }

    /// Append a principal unless already present. Returns whether it was added.
    pub fn add_principal(&mut self, principal_id: &str) -> bool {
        if self.has_principal(principal_id) {
            return false;
        }
        self.principal_ids.push(principal_id.to_string());
        true
    }

    pub fn remove_principal(&mut self, principal_id: &str) -> bool {
        let before = self.principal_ids.len();
        self.principal_ids.retain(|p| p != principal_id);
        before != self.principal_ids.len()
    }

    /// Copy suitable for read responses, flagged when it is the caller.
    pub fn sanitized(&self, caller_user_id: Option<&str>) -> Self {
        let mut user = self.clone();
        user.password = WriteOnly::empty();
        user.me = caller_user_id == Some(self.id.as_str());
        user
    }
}

/// Request to create a local account.
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateUserInput {
    #[validate(length(min = 1, message = "Username is required"))]
    pub username: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub description: String,
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub password: String,
    #[serde(default)]
    pub must_change_password: bool,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ChangePasswordInput {
    #[validate(length(min = 1, message = "Current password is required"))]
    pub current_password: String,
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub new_password: String,
}

#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SetPasswordInput {
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub new_password: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_user_owns_local_principal() {
        let user = User::new("admin".to_string(), "Admin".to_string());
        assert!(user.id.starts_with("u-"));
        assert_eq!(user.principal_ids, vec![format!("local://{}", user.id)]);
        assert_eq!(
            user.principal_for_provider(LOCAL_PROVIDER).map(|p| p.native_id),
            Some(user.id.clone())
        );
    }

    #[test]
    fn test_principal_ids_behave_as_ordered_set() {
        let mut user = User::new("jdoe".to_string(), String::new());
        assert!(user.add_principal("github_user://1"));
        assert!(!user.add_principal("github_user://1"));
        assert!(user.add_principal("azuread_user://abc"));
        assert_eq!(user.principal_ids.len(), 3);
        assert_eq!(user.principal_ids[1], "github_user://1");

        assert_eq!(
            user.principal_for_provider("azuread").map(|p| p.native_id),
            Some("abc".to_string())
        );
        assert!(user.remove_principal("github_user://1"));
        assert!(user.principal_for_provider("github").is_none());
    }

    #[test]
    fn test_password_never_serialized() {
        let mut user = User::new("jdoe".to_string(), String::new());
        user.password = WriteOnly::new("hunter22");
        let json = serde_json::to_value(&user).unwrap();
        assert!(json.get("password").is_none());
        assert!(!json.to_string().contains("hunter22"));
    }
}
