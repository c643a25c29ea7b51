//! Local groups and their memberships.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::principal::{PrincipalId, PrincipalType, LOCAL_PROVIDER};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
}

impl Group {
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            id: format!("g-{}", &Uuid::new_v4().simple().to_string()[..12]),
            display_name: display_name.into(),
        }
    }

    pub fn principal_id(&self) -> PrincipalId {
        PrincipalId::new(LOCAL_PROVIDER, PrincipalType::Group, &self.id)
    }
}

/// Membership of any principal (local or federated) in a local group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupMember {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub group_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub principal_id: String,
}

impl GroupMember {
    pub fn new(group: &Group, principal_id: impl Into<String>) -> Self {
        Self {
            id: format!("gm-{}", &Uuid::new_v4().simple().to_string()[..12]),
            group_name: group.id.clone(),
            principal_id: principal_id.into(),
        }
    }
}
