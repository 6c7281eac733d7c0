//! Token verification

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

use crate::token::EndpointToken;

/// Authentication errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing token")]
    MissingToken,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    TokenExpired,

    #[error("Endpoint not permitted: {0}")]
    EndpointNotPermitted(String),
}

/// Turns a raw bearer token into the endpoints it grants
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<EndpointToken, AuthError>;
}

/// Verifier backed by a fixed token table
#[derive(Debug, Default, Clone)]
pub struct StaticVerifier {
    tokens: HashMap<String, EndpointToken>,
}

impl StaticVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, raw: impl Into<String>, token: EndpointToken) -> Self {
        self.tokens.insert(raw.into(), token);
        self
    }
}

#[async_trait]
impl Verifier for StaticVerifier {
    async fn verify(&self, token: &str) -> Result<EndpointToken, AuthError> {
        let found = self
            .tokens
            .get(token)
            .cloned()
            .ok_or_else(|| AuthError::InvalidToken("unknown token".to_string()))?;

        if found.is_expired() {
            return Err(AuthError::TokenExpired);
        }

        Ok(found)
    }
}
