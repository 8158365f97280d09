//! HS256 bearer tokens for the billing callables.

use std::env;

use jsonwebtoken::{
    decode, encode,
    errors::{Error, ErrorKind},
    Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation,
};
use thiserror::Error;

use crate::routes::auth::claims::Claims;

pub const MIN_SECRET_BYTES: usize = 32;
const MIN_DISTINCT_SECRET_BYTES: usize = 8;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum JwtSecretError {
    #[error("JWT_SECRET is not set")]
    Missing,
    #[error("JWT_SECRET has {len} bytes; at least {} are required", MIN_SECRET_BYTES)]
    TooShort { len: usize },
    #[error(
        "JWT_SECRET uses only {distinct} distinct byte values; at least {} are required",
        MIN_DISTINCT_SECRET_BYTES
    )]
    Repetitive { distinct: usize },
}

/// Signing and verification keys derived from one shared secret.
#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for JwtKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("JwtKeys(..)")
    }
}

impl JwtKeys {
    pub fn from_env() -> Result<Self, JwtSecretError> {
        match env::var("JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => Self::from_secret(secret),
            _ => Err(JwtSecretError::Missing),
        }
    }

    pub fn from_secret(secret: impl AsRef<[u8]>) -> Result<Self, JwtSecretError> {
        let secret = secret.as_ref();
        check_strength(secret)?;
        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        })
    }
}

/// State that can authenticate callers: keys plus the expected `iss`/`aud`.
pub trait JwtKeyProvider {
    fn jwt_keys(&self) -> &JwtKeys;
    fn jwt_issuer(&self) -> &str;
    fn jwt_audience(&self) -> &str;
}

fn check_strength(secret: &[u8]) -> Result<(), JwtSecretError> {
    if secret.len() < MIN_SECRET_BYTES {
        return Err(JwtSecretError::TooShort { len: secret.len() });
    }

    let mut seen = [false; 256];
    for &byte in secret {
        seen[usize::from(byte)] = true;
    }
    let distinct = seen.iter().filter(|seen| **seen).count();
    if distinct < MIN_DISTINCT_SECRET_BYTES {
        return Err(JwtSecretError::Repetitive { distinct });
    }
    Ok(())
}

fn validation(issuer: &str, audience: &str) -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    validation.set_issuer(&[issuer]);
    validation.set_audience(&[audience]);
    validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);
    validation
}

/// Signs `claims` after stamping them with `issuer` and `audience`.
pub fn create_jwt(
    claims: Claims,
    keys: &JwtKeys,
    issuer: &str,
    audience: &str,
) -> Result<String, Error> {
    let claims = Claims {
        iss: issuer.to_owned(),
        aud: audience.to_owned(),
        ..claims
    };
    encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding)
}

/// Verifies signature, expiry, issuer and audience. A blank subject is rejected
/// since it cannot name a ledger.
pub fn decode_jwt(
    token: &str,
    keys: &JwtKeys,
    issuer: &str,
    audience: &str,
) -> Result<TokenData<Claims>, Error> {
    let data = decode::<Claims>(token, &keys.decoding, &validation(issuer, audience))?;
    if data.claims.sub.trim().is_empty() {
        return Err(ErrorKind::InvalidSubject.into());
    }
    Ok(data)
}
