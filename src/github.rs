//! GitHub display-name resolution for identified user ids.
//!
//! One REST call per identified connection. Failures are reported to the
//! caller and logged on the access record; they never take the server down.

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.github.com";

/// The subset of the GitHub user object the banner needs.
#[derive(Debug, Clone, Deserialize)]
pub struct GithubUser {
    pub login: String,
    pub name: Option<String>,
}

impl GithubUser {
    /// Display name for the banner: the profile name, or `@login` when the
    /// profile has none.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("@{}", self.login),
        }
    }
}

/// HTTP client for the GitHub REST API.
pub struct UserResolver {
    client: reqwest::Client,
    token: String,
    base_url: String,
}

impl UserResolver {
    /// Create a resolver authenticated with `token`.
    pub fn new(token: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("keyhole/0.1")
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("Failed to create HTTP client");
        Self {
            client,
            token: token.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    /// Point the resolver at a different API root. Tests aim this at a
    /// local mock.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Fetch the user record for a numeric GitHub user id.
    pub async fn user_by_id(&self, id: i64) -> Result<GithubUser> {
        let url = format!("{}/user/{}", self.base_url, id);
        debug!("Fetching GitHub user {id}");

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .with_context(|| format!("Failed to fetch GitHub user {id}"))?;

        if !response.status().is_success() {
            return Err(anyhow!(
                "GitHub returned {} for user id {}",
                response.status(),
                id
            ));
        }

        response
            .json::<GithubUser>()
            .await
            .with_context(|| format!("Failed to decode GitHub user {id}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_falls_back_to_login() {
        let named = GithubUser {
            login: "alice".into(),
            name: Some("Alice A.".into()),
        };
        assert_eq!(named.display_name(), "Alice A.");

        let anonymous = GithubUser {
            login: "alice".into(),
            name: None,
        };
        assert_eq!(anonymous.display_name(), "@alice");
    }

    #[test]
    fn user_object_decodes_with_and_without_name() {
        let user: GithubUser =
            serde_json::from_str(r#"{"login":"alice","name":"Alice A.","id":42}"#).unwrap();
        assert_eq!(user.login, "alice");
        assert_eq!(user.name.as_deref(), Some("Alice A."));

        let user: GithubUser = serde_json::from_str(r#"{"login":"bob","name":null}"#).unwrap();
        assert_eq!(user.display_name(), "@bob");
    }
}
