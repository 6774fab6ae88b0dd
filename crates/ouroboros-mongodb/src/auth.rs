//! Credentials, per-connection authentication state and the nonce handshake

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use md5::{Digest, Md5};
use ouroboros_bson::doc;
use tracing::debug;

use crate::connection::Connection;
use crate::error::{DriverError, Result};

pub const ADMIN_DATABASE: &str = "admin";
pub const NONCE_MECHANISM: &str = "MONGODB-CR";

/// Who to authenticate as, and against which database
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential {
    username: String,
    password: String,
    source: String,
    mechanism: String,
}

impl Credential {
    pub fn new(username: impl Into<String>, password: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            source: source.into(),
            mechanism: NONCE_MECHANISM.to_string(),
        }
    }

    pub fn with_mechanism(mut self, mechanism: impl Into<String>) -> Self {
        self.mechanism = mechanism.into();
        self
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn mechanism(&self) -> &str {
        &self.mechanism
    }

    pub fn is_admin(&self) -> bool {
        self.source == ADMIN_DATABASE
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("username", &self.username)
            .field("source", &self.source)
            .field("mechanism", &self.mechanism)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
struct Authentication {
    credential: Credential,
    last_used: Instant,
}

/// What `check_authentication` decided
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthAction {
    /// No credential was requested
    NotRequired,
    /// The connection already holds this credential
    AlreadyAuthenticated,
    /// A handshake must be run before use
    Authenticate,
}

/// Authentications held by one connection, keyed by database
///
/// Admin credentials are exclusive: once admin is authenticated nothing
/// else is accepted, and admin is refused while any other database is.
#[derive(Debug, Default)]
pub struct AuthenticationState {
    by_database: HashMap<String, Authentication>,
}

impl AuthenticationState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.by_database.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_database.len()
    }

    pub fn is_authenticated(&self, credential: &Credential) -> bool {
        self.by_database
            .get(credential.source())
            .is_some_and(|a| a.credential == *credential)
    }

    pub fn can_authenticate(&self, credential: &Credential) -> bool {
        if self.by_database.is_empty() {
            return true;
        }
        if self.by_database.contains_key(ADMIN_DATABASE) || credential.is_admin() {
            return false;
        }
        !self.by_database.contains_key(credential.source())
    }

    pub fn check_authentication(&self, credential: Option<&Credential>) -> Result<AuthAction> {
        let Some(credential) = credential else {
            return Ok(AuthAction::NotRequired);
        };
        if self.is_authenticated(credential) {
            return Ok(AuthAction::AlreadyAuthenticated);
        }
        if self.can_authenticate(credential) {
            return Ok(AuthAction::Authenticate);
        }
        Err(DriverError::AuthenticationState(format!(
            "connection cannot add credential {}@{} to existing authentications on [{}]",
            credential.username(),
            credential.source(),
            self.databases().join(", ")
        )))
    }

    pub fn record(&mut self, credential: &Credential) {
        self.by_database.insert(
            credential.source().to_string(),
            Authentication {
                credential: credential.clone(),
                last_used: Instant::now(),
            },
        );
    }

    pub fn touch(&mut self, credential: &Credential) {
        if let Some(auth) = self.by_database.get_mut(credential.source()) {
            auth.last_used = Instant::now();
        }
    }

    pub fn last_used(&self, database: &str) -> Option<Instant> {
        self.by_database.get(database).map(|a| a.last_used)
    }

    fn databases(&self) -> Vec<String> {
        let mut names: Vec<String> = self.by_database.keys().cloned().collect();
        names.sort();
        names
    }
}

/// One authentication mechanism
#[async_trait]
pub trait Authenticator: Send + Sync {
    fn mechanism(&self) -> &str;

    async fn authenticate(&self, connection: &Connection, credential: &Credential) -> Result<()>;
}

/// Mechanisms available to connections, keyed by name
#[derive(Clone)]
pub struct Authenticators {
    by_mechanism: Arc<HashMap<String, Arc<dyn Authenticator>>>,
}

impl Authenticators {
    pub fn empty() -> Self {
        Self {
            by_mechanism: Arc::new(HashMap::new()),
        }
    }

    pub fn register(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        Arc::make_mut(&mut self.by_mechanism)
            .insert(authenticator.mechanism().to_string(), authenticator);
        self
    }

    pub fn get(&self, mechanism: &str) -> Option<Arc<dyn Authenticator>> {
        self.by_mechanism.get(mechanism).cloned()
    }
}

impl Default for Authenticators {
    fn default() -> Self {
        Self::empty().register(Arc::new(NonceAuthenticator))
    }
}

impl fmt::Debug for Authenticators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.by_mechanism.keys().collect();
        names.sort();
        f.debug_struct("Authenticators").field("mechanisms", &names).finish()
    }
}

/// `md5_hex(username + ":mongo:" + password)`
pub fn password_digest(username: &str, password: &str) -> String {
    md5_hex(&format!("{}:mongo:{}", username, password))
}

/// The proof sent with `authenticate`
pub fn nonce_key(nonce: &str, username: &str, password_digest: &str) -> String {
    md5_hex(&format!("{}{}{}", nonce, username, password_digest))
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Challenge-response over `getnonce` then `authenticate`
#[derive(Debug, Default, Clone, Copy)]
pub struct NonceAuthenticator;

#[async_trait]
impl Authenticator for NonceAuthenticator {
    fn mechanism(&self) -> &str {
        NONCE_MECHANISM
    }

    async fn authenticate(&self, connection: &Connection, credential: &Credential) -> Result<()> {
        let failed = |message: String| DriverError::Authentication {
            username: credential.username().to_string(),
            database: credential.source().to_string(),
            message,
        };

        let reply = connection
            .run_command(credential.source(), doc! { "getnonce": 1 })
            .await
            .map_err(|e| failed(format!("getnonce failed: {}", e)))?;
        let nonce = reply
            .get_str("nonce")
            .map_err(|e| failed(format!("getnonce reply has no nonce: {}", e)))?;

        let digest = password_digest(credential.username(), credential.password());
        let command = doc! {
            "authenticate": 1,
            "user": credential.username(),
            "nonce": nonce,
            "key": nonce_key(nonce, credential.username(), &digest),
        };
        connection
            .run_command(credential.source(), command)
            .await
            .map_err(|e| failed(e.to_string()))?;

        debug!(
            connection_id = connection.id(),
            username = credential.username(),
            database = credential.source(),
            "Authenticated connection"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_state_accepts_anything() {
        let state = AuthenticationState::new();
        assert!(state.can_authenticate(&Credential::new("root", "pw", "admin")));
        assert!(state.can_authenticate(&Credential::new("app", "pw", "a")));
        assert_eq!(state.check_authentication(None).unwrap(), AuthAction::NotRequired);
    }

    #[test]
    fn test_admin_is_exclusive() {
        let mut state = AuthenticationState::new();
        let admin = Credential::new("root", "pw", "admin");
        state.record(&admin);

        assert!(!state.can_authenticate(&Credential::new("app", "pw", "a")));
        assert_eq!(
            state.check_authentication(Some(&admin)).unwrap(),
            AuthAction::AlreadyAuthenticated
        );
        assert!(matches!(
            state.check_authentication(Some(&Credential::new("app", "pw", "a"))),
            Err(DriverError::AuthenticationState(_))
        ));
    }

    #[test]
    fn test_per_database_exclusivity() {
        let mut state = AuthenticationState::new();
        state.record(&Credential::new("alice", "pw", "a"));

        assert!(!state.can_authenticate(&Credential::new("bob", "pw", "a")));
        assert!(state.can_authenticate(&Credential::new("bob", "pw", "b")));
        assert!(!state.can_authenticate(&Credential::new("root", "pw", "admin")));
        assert_eq!(
            state
                .check_authentication(Some(&Credential::new("bob", "pw", "b")))
                .unwrap(),
            AuthAction::Authenticate
        );
    }

    #[test]
    fn test_nonce_key_matches_known_digest() {
        let digest = password_digest("user", "pencil");
        assert_eq!(digest.len(), 32);
        assert_eq!(digest, md5_hex("user:mongo:pencil"));
        assert_eq!(md5_hex(""), "d41d8cd98f00b204e9800998ecf8427e");

        let key = nonce_key("2375531c32080ae8", "user", &digest);
        assert_eq!(key, md5_hex(&format!("2375531c32080ae8user{}", digest)));
        assert_ne!(key, nonce_key("other", "user", &digest));
    }

    #[test]
    fn test_debug_hides_password() {
        let text = format!("{:?}", Credential::new("u", "secret", "db"));
        assert!(!text.contains("secret"));
    }

    #[test]
    fn test_default_authenticators() {
        let registry = Authenticators::default();
        assert!(registry.get(NONCE_MECHANISM).is_some());
        assert!(registry.get("GSSAPI").is_none());
    }
}
