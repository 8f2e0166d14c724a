//! Permission scopes granted to the engine.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Scope names the built-in workflows declare.
pub mod scopes {
    pub const WORKFLOW_EXECUTE: &str = "workflow:execute";
    pub const AGENT_INVOKE: &str = "agent:invoke";
    pub const NOTIFICATION_SEND: &str = "notification:send";
    pub const CRM_SYNC: &str = "crm:sync";
    pub const FILE_UPLOAD: &str = "file:upload";

    /// All built-in scopes.
    pub const ALL: [&str; 5] = [
        WORKFLOW_EXECUTE,
        AGENT_INVOKE,
        NOTIFICATION_SEND,
        CRM_SYNC,
        FILE_UPLOAD,
    ];
}

/// Immutable mapping of scope name to granted flag.
///
/// Scopes that are absent from the map are treated as not granted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionGrants {
    grants: HashMap<String, bool>,
}

impl PermissionGrants {
    /// Grants nothing.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Grants every built-in scope.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            grants: scopes::ALL
                .iter()
                .map(|scope| ((*scope).to_string(), true))
                .collect(),
        }
    }

    /// Grants exactly the scopes marked true in `grants`.
    #[must_use]
    pub fn from_map(grants: HashMap<String, bool>) -> Self {
        Self { grants }
    }

    /// Grants or revokes one scope.
    #[must_use]
    pub fn with_grant(mut self, scope: impl Into<String>, granted: bool) -> Self {
        self.grants.insert(scope.into(), granted);
        self
    }

    /// True if `scope` is granted.
    #[must_use]
    pub fn is_granted(&self, scope: &str) -> bool {
        self.grants.get(scope).copied().unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_grants_all_known_scopes() {
        let grants = PermissionGrants::builtin();
        for scope in scopes::ALL {
            assert!(grants.is_granted(scope), "{scope} should be granted");
        }
    }

    #[test]
    fn unknown_scopes_are_denied() {
        assert!(!PermissionGrants::builtin().is_granted("payments:refund"));
        assert!(!PermissionGrants::none().is_granted(scopes::AGENT_INVOKE));
    }

    #[test]
    fn explicit_revocation_wins() {
        let grants = PermissionGrants::builtin().with_grant(scopes::CRM_SYNC, false);
        assert!(!grants.is_granted(scopes::CRM_SYNC));
        assert!(grants.is_granted(scopes::NOTIFICATION_SEND));
    }

    #[test]
    fn deserializes_from_plain_map() {
        let grants: PermissionGrants =
            serde_json::from_str(r#"{"agent:invoke": true, "file:upload": false}"#).unwrap();
        assert!(grants.is_granted("agent:invoke"));
        assert!(!grants.is_granted("file:upload"));
    }
}
