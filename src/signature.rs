//! Callback signature verification.
//!
//! The chat provider signs every callback with the shared app secret:
//!
//! ```text
//! sign = base64( HMAC-SHA256( key = secret, msg = "{timestamp}\n{secret}" ) )
//! ```
//!
//! and sends `timestamp` and `sign` as request headers. The validator
//! recomputes the MAC and compares it in constant time.
//!
//! Every failure (missing or non-numeric timestamp, missing or garbled
//! signature, mismatch, no secret configured, stale timestamp) collapses
//! into [`PipelineError::InvalidSignature`]. The specific reason is only
//! logged at debug level.

use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{PipelineError, PipelineResult};

type HmacSha256 = Hmac<Sha256>;

/// A timestamp that passed signature verification (unix seconds).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifiedTimestamp(pub i64);

#[derive(Debug, Clone, Default)]
pub struct SignatureValidator {
    secret: Option<String>,
    max_skew_secs: Option<u64>,
}

impl SignatureValidator {
    /// An empty secret counts as not configured.
    pub fn new(secret: &str, max_skew_secs: Option<u64>) -> Self {
        Self {
            secret: (!secret.is_empty()).then(|| secret.to_string()),
            max_skew_secs,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.secret.is_some()
    }

    pub fn verify(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
    ) -> PipelineResult<VerifiedTimestamp> {
        self.verify_at(timestamp, signature, chrono::Utc::now().timestamp())
    }

    /// [`verify`](Self::verify) against an explicit clock.
    pub fn verify_at(
        &self,
        timestamp: Option<&str>,
        signature: Option<&str>,
        now_secs: i64,
    ) -> PipelineResult<VerifiedTimestamp> {
        let reject = |reason: &str| {
            tracing::debug!(reason, "callback signature rejected");
            PipelineError::InvalidSignature
        };

        let secret = self.secret.as_deref().ok_or_else(|| reject("no secret configured"))?;

        let ts_text = timestamp
            .map(str::trim)
            .filter(|t| !t.is_empty() && t.bytes().all(|b| b.is_ascii_digit()))
            .ok_or_else(|| reject("missing or malformed timestamp"))?;
        let ts: i64 = ts_text
            .parse()
            .map_err(|_| reject("timestamp out of range"))?;

        let provided = signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| reject("missing signature"))?;
        let provided = base64::engine::general_purpose::STANDARD
            .decode(provided)
            .map_err(|_| reject("signature is not base64"))?;

        let mut mac = new_mac(secret);
        mac.update(string_to_sign(ts_text, secret).as_bytes());
        mac.verify_slice(&provided)
            .map_err(|_| reject("signature mismatch"))?;

        if let Some(skew) = self.max_skew_secs {
            // Provider timestamps are milliseconds when they have 13 digits.
            let ts_secs = if ts_text.len() >= 13 { ts / 1000 } else { ts };
            if (now_secs - ts_secs).unsigned_abs() > skew {
                return Err(reject("timestamp outside allowed skew"));
            }
        }

        Ok(VerifiedTimestamp(ts))
    }
}

fn string_to_sign(timestamp: &str, secret: &str) -> String {
    format!("{}\n{}", timestamp, secret)
}

fn new_mac(secret: &str) -> HmacSha256 {
    <HmacSha256 as Mac>::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size")
}

/// Compute the signature the provider would send for `timestamp`.
pub fn sign(timestamp: &str, secret: &str) -> String {
    let mut mac = new_mac(secret);
    mac.update(string_to_sign(timestamp, secret).as_bytes());
    base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "test_secret";
    const TS: &str = "1700000000";

    fn validator() -> SignatureValidator {
        SignatureValidator::new(SECRET, None)
    }

    #[test]
    fn test_valid_signature_accepted() {
        let sig = sign(TS, SECRET);
        let verified = validator().verify(Some(TS), Some(&sig)).unwrap();
        assert_eq!(verified, VerifiedTimestamp(1_700_000_000));
    }

    #[test]
    fn test_empty_signature_rejected() {
        let err = validator().verify(Some(TS), Some("")).unwrap_err();
        assert!(matches!(err, PipelineError::InvalidSignature));
        assert!(validator().verify(Some(TS), None).is_err());
    }

    #[test]
    fn test_off_by_one_character_rejected() {
        let sig = sign(TS, SECRET);
        let mut chars: Vec<char> = sig.chars().collect();
        chars[0] = if chars[0] == 'A' { 'B' } else { 'A' };
        let tampered: String = chars.into_iter().collect();
        assert!(validator().verify(Some(TS), Some(&tampered)).is_err());

        let truncated = &sig[..sig.len() - 1];
        assert!(validator().verify(Some(TS), Some(truncated)).is_err());
    }

    #[test]
    fn test_wrong_timestamp_rejected() {
        let sig = sign(TS, SECRET);
        assert!(validator().verify(Some("1700000001"), Some(&sig)).is_err());
    }

    #[test]
    fn test_malformed_timestamp_rejected() {
        let sig = sign("abc", SECRET);
        assert!(validator().verify(Some("abc"), Some(&sig)).is_err());
        assert!(validator().verify(None, Some(&sig)).is_err());
        assert!(validator().verify(Some(""), Some(&sig)).is_err());
    }

    #[test]
    fn test_unconfigured_secret_rejects_everything() {
        let v = SignatureValidator::new("", None);
        assert!(!v.is_configured());
        let sig = sign(TS, "");
        assert!(v.verify(Some(TS), Some(&sig)).is_err());
    }

    #[test]
    fn test_other_secret_rejected() {
        let sig = sign(TS, "another_secret");
        assert!(validator().verify(Some(TS), Some(&sig)).is_err());
    }

    #[test]
    fn test_skew_window() {
        let v = SignatureValidator::new(SECRET, Some(60));
        let sig = sign(TS, SECRET);
        assert!(v.verify_at(Some(TS), Some(&sig), 1_700_000_030).is_ok());
        assert!(v.verify_at(Some(TS), Some(&sig), 1_700_000_100).is_err());

        let ms = "1700000000000";
        let sig_ms = sign(ms, SECRET);
        assert!(v.verify_at(Some(ms), Some(&sig_ms), 1_700_000_010).is_ok());
    }
}
