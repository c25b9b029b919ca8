// Credential check for the gateway
// The core never sees passwords; it only receives the tenant id resolved here.

use async_trait::async_trait;
use axum::http::{header, HeaderMap};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use codex_common::types::TenantId;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::Path;
use subtle::ConstantTimeEq;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
    pub tenant: TenantId,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication failed")]
    AuthFailed,
    #[error("missing or malformed Authorization header")]
    MissingCredentials,
    #[error("failed to read credentials file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid credentials file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Principal, AuthError>;
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    users: Vec<UserEntry>,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    username: String,
    /// Hex SHA-256 of the password.
    password_sha256: String,
    /// Defaults to the username.
    #[serde(default)]
    tenant: Option<String>,
}

struct Credential {
    digest: [u8; 32],
    tenant: TenantId,
}

/// Fixed username → password-digest table loaded at startup.
pub struct StaticAuthenticator {
    users: HashMap<String, Credential>,
}

impl StaticAuthenticator {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, AuthError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| AuthError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, AuthError> {
        let file: CredentialsFile = serde_json::from_str(content)?;
        let mut users = HashMap::new();
        for entry in file.users {
            let digest = decode_digest(&entry.password_sha256).ok_or_else(|| {
                AuthError::Parse(serde::de::Error::custom(format!(
                    "password_sha256 for '{}' is not a 64-character hex digest",
                    entry.username
                )))
            })?;
            let tenant = TenantId::new(entry.tenant.unwrap_or_else(|| entry.username.clone()));
            users.insert(entry.username, Credential { digest, tenant });
        }
        Ok(Self { users })
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

#[async_trait]
impl Authenticator for StaticAuthenticator {
    async fn authenticate(&self, username: &str, password: &str) -> Result<Principal, AuthError> {
        let presented: [u8; 32] = Sha256::digest(password.as_bytes()).into();
        let credential = self.users.get(username).ok_or(AuthError::AuthFailed)?;
        if bool::from(credential.digest[..].ct_eq(&presented[..])) {
            Ok(Principal {
                username: username.to_string(),
                tenant: credential.tenant.clone(),
            })
        } else {
            Err(AuthError::AuthFailed)
        }
    }
}

fn decode_digest(hex_digest: &str) -> Option<[u8; 32]> {
    hex::decode(hex_digest.trim()).ok()?.try_into().ok()
}

/// Hex SHA-256 digest in the format the credentials file stores.
pub fn password_digest(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

/// Extract `username:password` from an HTTP Basic `Authorization` header.
pub fn basic_credentials(headers: &HeaderMap) -> Result<(String, String), AuthError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or(AuthError::MissingCredentials)?;
    let encoded = value
        .strip_prefix("Basic ")
        .ok_or(AuthError::MissingCredentials)?;
    let decoded = STANDARD
        .decode(encoded.trim())
        .map_err(|_| AuthError::MissingCredentials)?;
    let pair = String::from_utf8(decoded).map_err(|_| AuthError::MissingCredentials)?;
    let (username, password) = pair.split_once(':').ok_or(AuthError::MissingCredentials)?;
    Ok((username.to_string(), password.to_string()))
}
