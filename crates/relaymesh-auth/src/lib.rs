//! Authentication for upstream listeners
//!
//! An upstream presents a bearer token when it registers. Verifying the token
//! yields an [`EndpointToken`]: the endpoints it may register and when that
//! permission lapses.

pub mod jwt;
pub mod token;
pub mod verifier;

pub use jwt::{EndpointClaims, JwtError, JwtVerifier};
pub use token::{EndpointToken, WILDCARD_ENDPOINT};
pub use verifier::{AuthError, StaticVerifier, Verifier};
