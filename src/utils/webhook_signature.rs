use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a signed webhook, in seconds.
pub const DEFAULT_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header is malformed")]
    MalformedHeader,
    #[error("signature header has no v1 signature")]
    NoSignatures,
    #[error("timestamp outside the tolerance window")]
    TimestampOutsideTolerance,
    #[error("no signature matches the payload")]
    Mismatch,
}

pub fn compute_signature(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(timestamp.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Builds a `t=..,v1=..` header, the same format the gateway sends.
pub fn sign_header(secret: &str, timestamp: i64, payload: &[u8]) -> String {
    format!(
        "t={},v1={}",
        timestamp,
        compute_signature(secret, timestamp, payload)
    )
}

/// Verifies `payload` against a `Stripe-Signature` header. Any matching `v1`
/// entry is accepted so secrets can be rolled.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    tolerance_secs: i64,
    now: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut candidates: Vec<&str> = Vec::new();

    for part in header.split(',') {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        match key {
            "t" => {
                timestamp = Some(
                    value
                        .parse::<i64>()
                        .map_err(|_| SignatureError::MalformedHeader)?,
                )
            }
            "v1" => candidates.push(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::MalformedHeader)?;
    if candidates.is_empty() {
        return Err(SignatureError::NoSignatures);
    }
    if (now - timestamp).abs() > tolerance_secs {
        return Err(SignatureError::TimestampOutsideTolerance);
    }

    let expected = compute_signature(secret, timestamp, payload);
    let matched = candidates
        .iter()
        .any(|provided| expected.as_bytes().ct_eq(provided.as_bytes()).unwrap_u8() == 1);
    if matched {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}
