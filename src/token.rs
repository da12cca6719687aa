//! Bearer token access
//!
//! The core never stores or refreshes credentials. It asks the injected
//! [`TokenProvider`] for the current token at every handshake; rotating a
//! token means reconnecting.

use std::fmt;

/// Bearer token. `Debug` output is redacted so tokens never reach logs.
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

impl From<&str> for AuthToken {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

impl From<String> for AuthToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// Supplies the current auth token
pub trait TokenProvider: Send + Sync {
    /// `None` when the user is logged out
    fn token(&self) -> Option<AuthToken>;
}

/// Fixed token, e.g. from the command line
#[derive(Debug, Clone)]
pub struct StaticToken(AuthToken);

impl StaticToken {
    pub fn new(token: impl Into<AuthToken>) -> Self {
        Self(token.into())
    }
}

impl TokenProvider for StaticToken {
    fn token(&self) -> Option<AuthToken> {
        Some(self.0.clone())
    }
}

impl<F> TokenProvider for F
where
    F: Fn() -> Option<AuthToken> + Send + Sync,
{
    fn token(&self) -> Option<AuthToken> {
        self()
    }
}
