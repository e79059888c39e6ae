//! Identity providers: turn test-data credentials into an
//! authenticated user.

use crate::model::{UserData, UserIdentity};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::debug;

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, user: &UserData) -> Result<UserIdentity>;
}

/// Access tokens issued ahead of time, keyed by username.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StaticIdentityProvider {
    #[serde(default)]
    users: HashMap<String, StaticUser>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StaticUser {
    access_token: String,
}

impl StaticIdentityProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, username: impl Into<String>, access_token: impl Into<String>) -> Self {
        self.users.insert(
            username.into(),
            StaticUser {
                access_token: access_token.into(),
            },
        );
        self
    }

    /// Load from a YAML or JSON file of the form
    /// `users: { <username>: { accessToken: ... } }`.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .context(format!("Failed to read users file: {}", path.display()))?;
        // YAML is a superset of JSON.
        serde_yaml::from_str(&content)
            .context(format!("Failed to parse users file: {}", path.display()))
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentityProvider {
    async fn authenticate(&self, user: &UserData) -> Result<UserIdentity> {
        let known = self
            .users
            .get(&user.username)
            .ok_or_else(|| anyhow!("No access token configured for user '{}'", user.username))?;
        debug!("Authenticated '{}' from static tokens", user.username);
        Ok(UserIdentity {
            email: user.username.clone(),
            password: user.password.clone(),
            access_token: Some(known.access_token.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_known_user_gets_token() {
        let provider = StaticIdentityProvider::new().with_user("a@b.c", "tok");
        let identity = provider
            .authenticate(&UserData {
                username: "a@b.c".into(),
                password: Some("pw".into()),
            })
            .await
            .unwrap();
        assert_eq!(identity.email, "a@b.c");
        assert_eq!(identity.access_token.as_deref(), Some("tok"));
        assert_eq!(identity.password.as_deref(), Some("pw"));
    }

    #[tokio::test]
    async fn test_unknown_user_fails() {
        let provider = StaticIdentityProvider::new();
        let err = provider
            .authenticate(&UserData {
                username: "ghost".into(),
                password: None,
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("users.yaml");
        fs::write(&path, "users:\n  a@b.c:\n    accessToken: tok\n").unwrap();
        let provider = StaticIdentityProvider::from_file(&path).unwrap();
        assert_eq!(provider.users["a@b.c"].access_token, "tok");
    }
}
