//! Join-time credential checks on the relay.

use std::collections::HashMap;
use std::path::Path;

use crate::protocol::UserIdentity;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AuthError {
    #[error("missing credential")]
    MissingToken,
    #[error("invalid credential for user {0}")]
    InvalidToken(String),
    #[error("failed to load token file: {0}")]
    TokenFile(String),
}

/// Decides whether a joining identity may enter a project.
pub trait Authenticator: Send + Sync {
    fn authenticate(&self, identity: &UserIdentity, token: &str, project_id: &str) -> Result<(), AuthError>;
}

/// Accepts everyone. Default for local development.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl Authenticator for AllowAll {
    fn authenticate(&self, _identity: &UserIdentity, _token: &str, _project_id: &str) -> Result<(), AuthError> {
        Ok(())
    }
}

/// Fixed user id → token table.
#[derive(Debug, Default, Clone)]
pub struct StaticTokens {
    tokens: HashMap<String, String>,
}

impl StaticTokens {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, user_id: impl Into<String>, token: impl Into<String>) -> Self {
        self.insert(user_id, token);
        self
    }

    pub fn insert(&mut self, user_id: impl Into<String>, token: impl Into<String>) {
        self.tokens.insert(user_id.into(), token.into());
    }

    /// Parse `user_id=token` lines; blank lines and `#` comments are skipped.
    pub fn parse(contents: &str) -> Result<Self, AuthError> {
        let mut tokens = Self::new();
        for (lineno, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((user, token)) = line.split_once('=') else {
                return Err(AuthError::TokenFile(format!("line {}: expected user=token", lineno + 1)));
            };
            let (user, token) = (user.trim(), token.trim());
            if user.is_empty() || token.is_empty() {
                return Err(AuthError::TokenFile(format!("line {}: empty user or token", lineno + 1)));
            }
            tokens.insert(user, token);
        }
        Ok(tokens)
    }

    pub fn from_file(path: &Path) -> Result<Self, AuthError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| AuthError::TokenFile(format!("{}: {e}", path.display())))?;
        Self::parse(&contents)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authenticator for StaticTokens {
    fn authenticate(&self, identity: &UserIdentity, token: &str, _project_id: &str) -> Result<(), AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        match self.tokens.get(&identity.id) {
            Some(expected) if expected == token => Ok(()),
            _ => Err(AuthError::InvalidToken(identity.id.clone())),
        }
    }
}
