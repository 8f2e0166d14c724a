//! CRM credential.
//!
//! The credential is the switch for `crm_sync`: without one, CRM side
//! effects are skipped. Secrets never appear in `Debug` output or logs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Credential for the external CRM.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CrmCredential {
    /// API key sent in a header.
    ApiKey {
        key: String,
        /// Defaults to `Authorization: Bearer <key>` when absent.
        #[serde(default)]
        header_name: Option<String>,
    },
    /// OAuth 2.0 access token.
    Oauth2 {
        access_token: String,
        #[serde(default)]
        refresh_token: Option<String>,
        #[serde(default)]
        expires_at: Option<DateTime<Utc>>,
    },
    /// Static bearer token.
    BearerToken { token: String },
}

impl CrmCredential {
    /// An API key credential.
    #[must_use]
    pub fn api_key(key: impl Into<String>) -> Self {
        Self::ApiKey {
            key: key.into(),
            header_name: None,
        }
    }

    /// A bearer token credential.
    #[must_use]
    pub fn bearer(token: impl Into<String>) -> Self {
        Self::BearerToken {
            token: token.into(),
        }
    }

    /// Credential type name, safe to log.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ApiKey { .. } => "api_key",
            Self::Oauth2 { .. } => "oauth2",
            Self::BearerToken { .. } => "bearer_token",
        }
    }

    /// Header name and value to authenticate a request with.
    #[must_use]
    pub fn authorization_header(&self) -> (String, String) {
        match self {
            Self::ApiKey {
                key,
                header_name: Some(name),
            } => (name.clone(), key.clone()),
            Self::ApiKey {
                key,
                header_name: None,
            } => ("Authorization".to_string(), format!("Bearer {key}")),
            Self::Oauth2 { access_token, .. } => {
                ("Authorization".to_string(), format!("Bearer {access_token}"))
            }
            Self::BearerToken { token } => {
                ("Authorization".to_string(), format!("Bearer {token}"))
            }
        }
    }

    /// Checks if an OAuth2 token needs refresh.
    #[must_use]
    pub fn needs_refresh(&self) -> bool {
        if let Self::Oauth2 {
            expires_at: Some(expires),
            ..
        } = self
        {
            // Refresh if expiring within 5 minutes
            return *expires < Utc::now() + chrono::Duration::minutes(5);
        }
        false
    }
}

impl fmt::Debug for CrmCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CrmCredential")
            .field("type", &self.kind())
            .field("secret", &"<redacted>")
            .finish()
    }
}
