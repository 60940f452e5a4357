//! `tokenmill-auth` — bearer token validation boundary.
//!
//! Tokens are minted by the external identity service. This crate only
//! verifies them and exposes the caller's identity and subscription tier.

pub mod claims;
pub mod validator;

pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use validator::{Hs256JwtValidator, JwtValidator};
