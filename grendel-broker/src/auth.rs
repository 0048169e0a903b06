//! MQTT 5.0 enhanced authentication.
//!
//! The flow engine is fixed — `start → (continue)* → success | failed`
//! with opaque binary challenge/response data — while the mechanism set
//! is pluggable through [`AuthMethod`]. PLAIN is built in and validates
//! against the broker's user base.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;

use grendel_storage::password::verify_password;

use crate::acl::AclCache;

/// Terminal or intermediate state of an authentication exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Success,
    Continue,
    Failed,
}

/// Result of one authentication step, as handed back to the front-end.
#[derive(Debug, Clone)]
pub struct AuthOutcome {
    pub status: AuthStatus,
    /// Challenge or final server data for the next AUTH packet.
    pub response_data: Option<Bytes>,
    /// Human-readable failure reason.
    pub reason: Option<String>,
    /// Authenticated identity, set on success.
    pub username: Option<String>,
}

impl AuthOutcome {
    pub fn success(username: impl Into<String>) -> Self {
        AuthOutcome {
            status: AuthStatus::Success,
            response_data: None,
            reason: None,
            username: Some(username.into()),
        }
    }

    pub fn continue_with(challenge: Bytes) -> Self {
        AuthOutcome {
            status: AuthStatus::Continue,
            response_data: Some(challenge),
            reason: None,
            username: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        AuthOutcome {
            status: AuthStatus::Failed,
            response_data: None,
            reason: Some(reason.into()),
            username: None,
        }
    }
}

/// One authentication mechanism (PLAIN, SCRAM-SHA-256, ...).
pub trait AuthMethod: Send + Sync {
    /// Mechanism name as carried in the CONNECT/AUTH properties.
    fn name(&self) -> &str;

    /// First step, with the client's initial data if any.
    fn start(&self, initial_data: Option<&Bytes>) -> AuthOutcome;

    /// Subsequent steps for multi-round mechanisms.
    fn continue_auth(&self, response_data: &Bytes) -> AuthOutcome;
}

/// PLAIN (RFC 4616): `NUL authcid NUL passwd` with an empty authorization
/// identity, validated against the cached user base.
pub struct PlainAuth {
    acl: Arc<AclCache>,
}

impl PlainAuth {
    pub fn new(acl: Arc<AclCache>) -> Self {
        PlainAuth { acl }
    }

    fn parse(data: &Bytes) -> Option<(String, String)> {
        let data = data.as_ref();
        if data.is_empty() || data[0] != 0 {
            return None;
        }
        let second_nul = data[1..].iter().position(|&b| b == 0)?;
        let username_end = 1 + second_nul;

        let username = std::str::from_utf8(&data[1..username_end]).ok()?;
        let password = std::str::from_utf8(&data[username_end + 1..]).ok()?;
        Some((username.to_string(), password.to_string()))
    }
}

impl AuthMethod for PlainAuth {
    fn name(&self) -> &str {
        "PLAIN"
    }

    fn start(&self, initial_data: Option<&Bytes>) -> AuthOutcome {
        let Some(data) = initial_data else {
            return AuthOutcome::failed("PLAIN requires initial data");
        };
        let Some((username, password)) = Self::parse(data) else {
            return AuthOutcome::failed("malformed PLAIN data");
        };

        match self.acl.user(&username) {
            Some(user) if user.enabled && verify_password(&password, &user.password_hash) => {
                AuthOutcome::success(username)
            }
            _ => AuthOutcome::failed("bad username or password"),
        }
    }

    fn continue_auth(&self, _response_data: &Bytes) -> AuthOutcome {
        // PLAIN is single-step.
        AuthOutcome::failed("unexpected AUTH continuation for PLAIN")
    }
}

/// Registry of available mechanisms, consulted by the front-end when a
/// CONNECT carries an authentication method.
#[derive(Default)]
pub struct AuthRegistry {
    methods: HashMap<String, Box<dyn AuthMethod>>,
}

impl AuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, method: Box<dyn AuthMethod>) {
        self.methods.insert(method.name().to_string(), method);
    }

    pub fn supports(&self, method_name: &str) -> bool {
        self.methods.contains_key(method_name)
    }

    pub fn supported_methods(&self) -> Vec<&str> {
        self.methods.keys().map(|s| s.as_str()).collect()
    }

    pub fn start(&self, method_name: &str, initial_data: Option<&Bytes>) -> AuthOutcome {
        match self.methods.get(method_name) {
            Some(method) => method.start(initial_data),
            None => AuthOutcome::failed(format!("unsupported auth method `{method_name}`")),
        }
    }

    pub fn continue_auth(&self, method_name: &str, response_data: &Bytes) -> AuthOutcome {
        match self.methods.get(method_name) {
            Some(method) => method.continue_auth(response_data),
            None => AuthOutcome::failed(format!("unsupported auth method `{method_name}`")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grendel_storage::password::hash_password;
    use grendel_storage::types::User;

    fn acl_with_user(name: &str, password: &str) -> Arc<AclCache> {
        let acl = Arc::new(AclCache::new(100));
        let user = User::new(name, hash_password(password).unwrap());
        acl.load(vec![user], vec![]);
        acl
    }

    fn plain_data(username: &str, password: &str) -> Bytes {
        let mut data = vec![0u8];
        data.extend_from_slice(username.as_bytes());
        data.push(0);
        data.extend_from_slice(password.as_bytes());
        Bytes::from(data)
    }

    #[test]
    fn test_plain_success() {
        let auth = PlainAuth::new(acl_with_user("admin", "secret"));
        let outcome = auth.start(Some(&plain_data("admin", "secret")));
        assert_eq!(outcome.status, AuthStatus::Success);
        assert_eq!(outcome.username.as_deref(), Some("admin"));
    }

    #[test]
    fn test_plain_wrong_password() {
        let auth = PlainAuth::new(acl_with_user("admin", "secret"));
        let outcome = auth.start(Some(&plain_data("admin", "nope")));
        assert_eq!(outcome.status, AuthStatus::Failed);
        assert!(outcome.reason.is_some());
    }

    #[test]
    fn test_plain_disabled_user() {
        let acl = Arc::new(AclCache::new(100));
        let mut user = User::new("admin", hash_password("secret").unwrap());
        user.enabled = false;
        acl.load(vec![user], vec![]);

        let auth = PlainAuth::new(acl);
        let outcome = auth.start(Some(&plain_data("admin", "secret")));
        assert_eq!(outcome.status, AuthStatus::Failed);
    }

    #[test]
    fn test_plain_malformed() {
        let auth = PlainAuth::new(acl_with_user("admin", "secret"));

        assert_eq!(auth.start(None).status, AuthStatus::Failed);
        assert_eq!(
            auth.start(Some(&Bytes::from_static(b"no-nul-prefix"))).status,
            AuthStatus::Failed
        );
        assert_eq!(
            auth.continue_auth(&Bytes::from_static(b"x")).status,
            AuthStatus::Failed
        );
    }

    #[test]
    fn test_registry_dispatch() {
        let mut registry = AuthRegistry::new();
        registry.register(Box::new(PlainAuth::new(acl_with_user("u", "pw"))));

        assert!(registry.supports("PLAIN"));
        assert!(!registry.supports("SCRAM-SHA-256"));

        let outcome = registry.start("PLAIN", Some(&plain_data("u", "pw")));
        assert_eq!(outcome.status, AuthStatus::Success);

        let outcome = registry.start("GSSAPI", None);
        assert_eq!(outcome.status, AuthStatus::Failed);
    }
}
