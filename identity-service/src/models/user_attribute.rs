//! UserAttribute model - cached group memberships per provider.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

use crate::models::principal::Principal;

/// Group principals known for one user, keyed by provider name.
///
/// Each entry is the result of the most recent successful resolution for
/// that provider. Entries of providers that are no longer active are kept.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAttribute {
    pub user_name: String,
    #[serde(default)]
    pub group_principals: BTreeMap<String, Vec<Principal>>,
    #[serde(default)]
    pub last_refreshed: BTreeMap<String, DateTime<Utc>>,
}

impl UserAttribute {
    pub fn new(user_name: impl Into<String>) -> Self {
        Self {
            user_name: user_name.into(),
            ..Self::default()
        }
    }

    pub fn groups(&self, provider: &str) -> &[Principal] {
        self.group_principals
            .get(provider)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Replace the whole entry for `provider`, dropping duplicate ids.
    pub fn replace(&mut self, provider: &str, groups: Vec<Principal>, at: DateTime<Utc>) {
        let mut seen = HashSet::new();
        let groups = groups
            .into_iter()
            .filter(|g| seen.insert(g.id.clone()))
            .collect();
        self.group_principals.insert(provider.to_string(), groups);
        self.last_refreshed.insert(provider.to_string(), at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::principal::{PrincipalId, PrincipalType};

    fn group(native: &str) -> Principal {
        Principal::new(&PrincipalId::new("ldap", PrincipalType::Group, native), native, native)
    }

    #[test]
    fn test_replace_is_whole_entry_and_dedupes() {
        let mut attr = UserAttribute::new("u-1");
        attr.replace("ldap", vec![group("a"), group("b"), group("a")], Utc::now());
        assert_eq!(attr.groups("ldap").len(), 2);

        attr.replace("ldap", vec![group("c")], Utc::now());
        assert_eq!(attr.groups("ldap"), &[group("c")]);
        assert!(attr.groups("github").is_empty());
    }
}
