//! Write-only secret values.
//!
//! Secrets are accepted on input and held in memory, but the type has no
//! `Serialize` impl: every field carrying one is marked `skip_serializing`,
//! so read responses never contain them.

use secrecy::{ExposeSecret, Secret, SecretString};
use serde::{Deserialize, Deserializer};
use std::fmt;

#[derive(Clone, Default)]
pub struct WriteOnly(Option<SecretString>);

impl WriteOnly {
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        if value.is_empty() {
            Self(None)
        } else {
            Self(Some(Secret::new(value)))
        }
    }

    pub fn empty() -> Self {
        Self(None)
    }

    pub fn is_set(&self) -> bool {
        self.0.is_some()
    }

    pub fn expose(&self) -> Option<&str> {
        self.0.as_ref().map(|s| s.expose_secret().as_str())
    }

    /// Keep the stored value when no new one was supplied.
    pub fn inherit(&mut self, stored: &WriteOnly) {
        if self.0.is_none() {
            self.0 = stored.0.clone();
        }
    }

    pub fn take(&mut self) -> Option<SecretString> {
        self.0.take()
    }
}

impl PartialEq for WriteOnly {
    fn eq(&self, other: &Self) -> bool {
        self.expose() == other.expose()
    }
}

impl fmt::Debug for WriteOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("WriteOnly([REDACTED])"),
            None => f.write_str("WriteOnly(<unset>)"),
        }
    }
}

impl<'de> Deserialize<'de> for WriteOnly {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Option::<String>::deserialize(deserializer)?;
        Ok(value.map(WriteOnly::new).unwrap_or_default())
    }
}

impl From<&str> for WriteOnly {
    fn from(value: &str) -> Self {
        WriteOnly::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_string_is_unset() {
        assert!(!WriteOnly::new("").is_set());
        assert!(WriteOnly::new("s3cret").is_set());
    }

    #[test]
    fn test_inherit_keeps_stored_value_only_when_unset() {
        let stored = WriteOnly::new("old");

        let mut incoming = WriteOnly::empty();
        incoming.inherit(&stored);
        assert_eq!(incoming.expose(), Some("old"));

        let mut replaced = WriteOnly::new("new");
        replaced.inherit(&stored);
        assert_eq!(replaced.expose(), Some("new"));
    }

    #[test]
    fn test_debug_is_redacted() {
        let secret = WriteOnly::new("hunter2");
        assert!(!format!("{:?}", secret).contains("hunter2"));
    }

    #[test]
    fn test_deserialize_null_and_string() {
        let unset: WriteOnly = serde_json::from_str("null").unwrap();
        assert!(!unset.is_set());
        let set: WriteOnly = serde_json::from_str("\"abc\"").unwrap();
        assert_eq!(set.expose(), Some("abc"));
    }
}
