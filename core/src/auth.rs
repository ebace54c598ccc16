use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use thiserror::Error;

use crate::error::{ErrorCode, RhizomeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

/// A key entry as it appears in configuration. `key_hash` is the hex-encoded
/// SHA-256 digest of the raw API key; raw keys never live in config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyConfig {
    pub id: String,
    pub key_hash: String,
    pub permissions: Vec<Permission>,
}

/// The authenticated identity attached to a connection after `Auth`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub key_id: String,
    pub permissions: HashSet<Permission>,
}

impl Principal {
    /// Admin implies read and write.
    pub fn allows(&self, permission: Permission) -> bool {
        self.permissions.contains(&permission) || self.permissions.contains(&Permission::Admin)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("api key must not be empty")]
    MissingKey,
    #[error("unknown api key")]
    UnknownKey,
    #[error("missing permission: {0:?}")]
    Forbidden(Permission),
    #[error("connection is not authenticated")]
    Unauthenticated,
}

impl RhizomeError for AuthError {
    fn error_code(&self) -> ErrorCode {
        match self {
            AuthError::MissingKey | AuthError::UnknownKey | AuthError::Unauthenticated => {
                ErrorCode::Unauthorized
            }
            AuthError::Forbidden(_) => ErrorCode::Forbidden,
        }
    }
}

/// Hex SHA-256 of a raw API key, the form keys take in configuration.
pub fn hash_api_key(key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}

/// Shared-key authenticator. When no keys are configured every connection is
/// implicitly a full-permission principal and the `Auth` handshake is skipped.
pub struct ApiKeyAuthenticator {
    by_hash: HashMap<String, (String, HashSet<Permission>)>,
}

impl ApiKeyAuthenticator {
    pub fn new(keys: &[ApiKeyConfig]) -> Self {
        let by_hash = keys
            .iter()
            .map(|entry| {
                (
                    entry.key_hash.to_lowercase(),
                    (
                        entry.id.clone(),
                        entry.permissions.iter().copied().collect(),
                    ),
                )
            })
            .collect();
        Self { by_hash }
    }

    pub fn required(&self) -> bool {
        !self.by_hash.is_empty()
    }

    pub fn authenticate(&self, api_key: &str) -> Result<Principal, AuthError> {
        let trimmed = api_key.trim();
        if trimmed.is_empty() {
            return Err(AuthError::MissingKey);
        }

        let (key_id, permissions) = self
            .by_hash
            .get(&hash_api_key(trimmed))
            .ok_or(AuthError::UnknownKey)?;

        Ok(Principal {
            key_id: key_id.clone(),
            permissions: permissions.clone(),
        })
    }

    /// The principal used when authentication is disabled.
    pub fn open_principal() -> Principal {
        Principal {
            key_id: "anonymous".to_string(),
            permissions: [Permission::Read, Permission::Write, Permission::Admin]
                .into_iter()
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticator() -> ApiKeyAuthenticator {
        ApiKeyAuthenticator::new(&[ApiKeyConfig {
            id: "reader".to_string(),
            key_hash: hash_api_key("s3cret"),
            permissions: vec![Permission::Read],
        }])
    }

    #[test]
    fn authenticates_known_key() {
        let principal = authenticator().authenticate("s3cret").unwrap();
        assert_eq!(principal.key_id, "reader");
        assert!(principal.allows(Permission::Read));
        assert!(!principal.allows(Permission::Write));
    }

    #[test]
    fn rejects_unknown_and_empty_keys() {
        let auth = authenticator();
        assert_eq!(auth.authenticate("wrong"), Err(AuthError::UnknownKey));
        assert_eq!(auth.authenticate("   "), Err(AuthError::MissingKey));
    }

    #[test]
    fn admin_implies_read_and_write() {
        let principal = Principal {
            key_id: "root".to_string(),
            permissions: [Permission::Admin].into_iter().collect(),
        };
        assert!(principal.allows(Permission::Read));
        assert!(principal.allows(Permission::Write));
        assert!(principal.allows(Permission::Admin));
    }
}
