//! Bearer-token authentication for operator and trigger requests.
//!
//! Tokens are stored hashed (SHA-256) in the entity store under
//! `AuthToken/{hash-hex}`; the claims carry the site key the token is
//! scoped to.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::store::EntityStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub skey: i64,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub revoked: bool,
}

pub fn token_key(raw_token: &str) -> String {
    let hash = Sha256::digest(raw_token.as_bytes());
    let hex: String = hash.iter().map(|b| format!("{b:02x}")).collect();
    format!("AuthToken/{hex}")
}

/// Resolve a raw bearer token to its claims; revoked or unknown tokens
/// resolve to nothing.
pub fn validate_token(store: &dyn EntityStore, raw_token: &str) -> Option<TokenClaims> {
    let json = store.get(&token_key(raw_token)).ok()??;
    let claims: TokenClaims = serde_json::from_str(&json).ok()?;
    (!claims.revoked).then_some(claims)
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

/// Store a token (hashed) with its claims.  Used by provisioning tooling
/// and tests.
pub fn insert_token(
    store: &dyn EntityStore,
    raw_token: &str,
    claims: &TokenClaims,
) -> Result<(), crate::store::StoreError> {
    store.put(&token_key(raw_token), &serde_json::to_string(claims)?)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use tempfile::NamedTempFile;

    fn store() -> (SqliteStore, NamedTempFile) {
        let file = NamedTempFile::new().unwrap();
        (SqliteStore::open(file.path()).unwrap(), file)
    }

    #[test]
    fn validate_token_returns_claims_for_known_token() {
        let (store, _f) = store();
        let claims = TokenClaims {
            skey: 7,
            label: "site-trigger".to_owned(),
            revoked: false,
        };
        insert_token(&store, "good-token", &claims).unwrap();

        let got = validate_token(&store, "good-token").unwrap();
        assert_eq!(got.skey, 7);
    }

    #[test]
    fn validate_token_rejects_revoked_token() {
        let (store, _f) = store();
        let claims = TokenClaims {
            skey: 7,
            label: String::new(),
            revoked: true,
        };
        insert_token(&store, "revoked-token", &claims).unwrap();
        assert!(validate_token(&store, "revoked-token").is_none());
    }

    #[test]
    fn validate_token_rejects_unknown_token() {
        let (store, _f) = store();
        assert!(validate_token(&store, "missing").is_none());
    }

    #[test]
    fn extract_bearer_strips_scheme() {
        assert_eq!(extract_bearer("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("Basic abc"), None);
    }
}
