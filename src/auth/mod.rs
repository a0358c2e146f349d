//! Subscription / auth registry: opaque API keys mapped to user
//! identities, and the `<scope>@<topic>` stream-key grammar used to
//! gate private subscriptions.
//!
//! Flat `api_key -> user_id` map, no claims or expiry, guarded by a
//! reader-writer lock since lookups vastly outnumber key issuance and
//! revocation.

use parking_lot::RwLock;
use rand::RngCore;
use std::collections::HashMap;

use crate::error::AuthError;
use crate::models::UserId;

/// A parsed `<scope>@<topic>` stream key, e.g. `BTCUSDT@trade` or
/// `alice@order`. Public streams are keyed by symbol; private streams
/// are keyed by user id and require the subscriber to be authenticated
/// as that same user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamKey {
    pub scope: String,
    pub topic: String,
}

const PRIVATE_TOPICS: &[&str] = &["order", "account"];

impl StreamKey {
    pub fn parse(raw: &str) -> Result<Self, AuthError> {
        let (scope, topic) = raw.split_once('@').ok_or_else(|| AuthError::InvalidStreamKey(raw.to_string()))?;
        if scope.is_empty() || topic.is_empty() {
            return Err(AuthError::InvalidStreamKey(raw.to_string()));
        }
        Ok(StreamKey { scope: scope.to_string(), topic: topic.to_string() })
    }

    pub fn is_private(&self) -> bool {
        PRIVATE_TOPICS.contains(&self.topic.as_str())
    }
}

/// Maintains the `api_key -> user_id` map and authorizes subscribe
/// requests against it. Public (`<symbol>@...`) streams require no
/// auth at all; private (`<user_id>@...`) streams require the
/// requesting connection's tagged `user_id` to match the stream's
/// scope exactly.
pub struct AuthRegistry {
    keys: RwLock<HashMap<String, UserId>>,
}

impl Default for AuthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthRegistry {
    pub fn new() -> Self {
        AuthRegistry { keys: RwLock::new(HashMap::new()) }
    }

    /// Issues a fresh opaque 128-bit API key for `user_id`. A user may
    /// hold more than one concurrently-valid key.
    pub fn generate_api_key(&self, user_id: &str) -> String {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        let api_key = bytes.iter().map(|b| format!("{b:02x}")).collect::<String>();
        self.keys.write().insert(api_key.clone(), user_id.to_string());
        tracing::info!(user_id, "api key issued");
        api_key
    }

    pub fn revoke_api_key(&self, api_key: &str) -> bool {
        self.keys.write().remove(api_key).is_some()
    }

    /// Resolves an API key to the user it was issued for.
    pub fn authenticate(&self, api_key: &str) -> Result<UserId, AuthError> {
        self.keys.read().get(api_key).cloned().ok_or(AuthError::UnknownApiKey)
    }

    /// Authorizes a subscribe request for `stream_key` from a connection
    /// already tagged with `authenticated_user`. Public streams (scope is
    /// not a private topic) pass through regardless of `authenticated_user`.
    pub fn authorize_subscribe(&self, stream_key: &str, authenticated_user: Option<&str>) -> Result<StreamKey, AuthError> {
        let parsed = StreamKey::parse(stream_key)?;
        if !parsed.is_private() {
            return Ok(parsed);
        }
        match authenticated_user {
            Some(user_id) if user_id == parsed.scope => Ok(parsed),
            Some(_) => Err(AuthError::Forbidden(stream_key.to_string())),
            None => Err(AuthError::Unauthenticated),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_authenticates_back_to_owner() {
        let registry = AuthRegistry::new();
        let key = registry.generate_api_key("alice");
        assert_eq!(registry.authenticate(&key).unwrap(), "alice");
    }

    #[test]
    fn unknown_key_is_rejected() {
        let registry = AuthRegistry::new();
        assert!(matches!(registry.authenticate("deadbeef"), Err(AuthError::UnknownApiKey)));
    }

    #[test]
    fn public_stream_requires_no_auth() {
        let registry = AuthRegistry::new();
        assert!(registry.authorize_subscribe("BTCUSDT@trade", None).is_ok());
    }

    #[test]
    fn private_stream_requires_matching_authenticated_user() {
        let registry = AuthRegistry::new();
        assert!(matches!(registry.authorize_subscribe("alice@order", None), Err(AuthError::Unauthenticated)));
        assert!(matches!(registry.authorize_subscribe("alice@order", Some("bob")), Err(AuthError::Forbidden(_))));
        assert!(registry.authorize_subscribe("alice@order", Some("alice")).is_ok());
    }

    #[test]
    fn malformed_stream_key_is_rejected() {
        let registry = AuthRegistry::new();
        assert!(matches!(registry.authorize_subscribe("not-a-stream-key", None), Err(AuthError::InvalidStreamKey(_))));
    }
}
