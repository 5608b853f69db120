//! `offerdesk-auth` — token claims and validation (transport-agnostic).
//!
//! Authentication proper happens upstream; this crate only turns a bearer
//! token into the tenant/owner context jobs are accounted against.

pub mod claims;
pub mod validator;

pub use claims::{JwtClaims, TokenValidationError, validate_claims};
pub use validator::{Hs256JwtValidator, JwtValidator};
