//! JWT (JSON Web Token) handling

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::token::EndpointToken;
use crate::verifier::{AuthError, Verifier};

/// JWT claims for upstream registration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointClaims {
    /// Subject (upstream identity)
    pub sub: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp); absent tokens never expire
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aud: Option<String>,
    /// Custom: endpoint IDs the holder may register, `*` for any
    #[serde(default)]
    pub endpoints: Vec<String>,
}

impl EndpointClaims {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            sub: subject.into(),
            iat: Utc::now().timestamp(),
            exp: None,
            iss: None,
            aud: None,
            endpoints: Vec::new(),
        }
    }

    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.endpoints = endpoints;
        self
    }

    pub fn with_validity(mut self, validity: Duration) -> Self {
        self.exp = Some((Utc::now() + validity).timestamp());
        self
    }

    pub fn with_issuer(mut self, issuer: impl Into<String>) -> Self {
        self.iss = Some(issuer.into());
        self
    }

    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.aud = Some(audience.into());
        self
    }

    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.exp
            .map(|exp| DateTime::<Utc>::from_timestamp(exp, 0).unwrap_or(DateTime::<Utc>::MIN_UTC))
    }

    pub fn is_expired(&self) -> bool {
        self.exp.is_some_and(|exp| Utc::now().timestamp() >= exp)
    }

    pub fn into_token(self) -> EndpointToken {
        let expiry = self.expiry();
        let token = EndpointToken::new(self.endpoints);
        match expiry {
            Some(expiry) => token.with_expiry(expiry),
            None => token,
        }
    }
}

#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,
}

pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation: Self::validation(Algorithm::HS256),
        }
    }

    pub fn from_rsa_pem(public_key_pem: &[u8]) -> Result<Self, JwtError> {
        Ok(Self {
            decoding_key: DecodingKey::from_rsa_pem(public_key_pem)?,
            validation: Self::validation(Algorithm::RS256),
        })
    }

    fn validation(algorithm: Algorithm) -> Validation {
        let mut validation = Validation::new(algorithm);
        // exp is optional; when present it is still checked
        validation.required_spec_claims.clear();
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;
        validation
    }

    pub fn with_audience(mut self, audience: String) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self
    }

    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn validate(&self, token: &str) -> Result<EndpointClaims, JwtError> {
        let token_data = decode::<EndpointClaims>(token, &self.decoding_key, &self.validation)?;

        if token_data.claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }

        Ok(token_data.claims)
    }

    pub fn encode(secret: &[u8], claims: &EndpointClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(secret);

        Ok(encode(&header, claims, &encoding_key)?)
    }

    pub fn encode_rsa(private_key_pem: &[u8], claims: &EndpointClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::RS256);
        let encoding_key = EncodingKey::from_rsa_pem(private_key_pem)?;

        Ok(encode(&header, claims, &encoding_key)?)
    }
}

#[async_trait]
impl Verifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<EndpointToken, AuthError> {
        let claims = self.validate(token).map_err(|e| match e {
            JwtError::TokenExpired => AuthError::TokenExpired,
            JwtError::EncodingError(e) => match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            },
        })?;

        debug!(
            "Verified token for {} (endpoints: {:?})",
            claims.sub, claims.endpoints
        );

        Ok(claims.into_token())
    }
}
