//! Link token and verification code issuing.
//!
//! Plaintext secrets exist only in the value returned at issue time; stores
//! keep the keyed digest. Both digests are HMAC-SHA256 under the configured
//! signing key, so a leaked database alone cannot be used to brute-force the
//! six-digit code space offline.

use hmac::{Hmac, Mac};
use rand::{Rng, RngCore};
use secrecy::{ExposeSecret, SecretString};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

pub const CODE_DIGITS: usize = 6;
const TOKEN_BYTES: usize = 32;
const SALT_BYTES: usize = 16;
const CODE_DIGEST_ROUNDS: u32 = 4096;
const CODE_DIGEST_VERSION: &str = "v1";

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("signing key is empty")]
    EmptyKey,
    #[error("hmac initialisation failed: {0}")]
    Mac(String),
}

/// A freshly generated secret: the plaintext goes to exactly one recipient,
/// the digest goes to storage.
pub struct IssuedSecret {
    pub plaintext: SecretString,
    pub digest: String,
}

impl std::fmt::Debug for IssuedSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IssuedSecret").field("plaintext", &"[REDACTED]").finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct SecretIssuer {
    signing_key: SecretString,
}

impl std::fmt::Debug for SecretIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretIssuer").field("signing_key", &"[REDACTED]").finish()
    }
}

impl SecretIssuer {
    pub fn new(signing_key: SecretString) -> Result<Self, SecretError> {
        if signing_key.expose_secret().trim().is_empty() {
            return Err(SecretError::EmptyKey);
        }
        Ok(Self { signing_key })
    }

    /// 256-bit random link token bound to one request and one approver.
    pub fn issue_token(
        &self,
        request_id: &str,
        approver_id: &str,
    ) -> Result<IssuedSecret, SecretError> {
        let mut bytes = [0_u8; TOKEN_BYTES];
        rand::thread_rng().fill_bytes(&mut bytes);
        let token = hex::encode(bytes);
        let digest = self.token_digest(request_id, approver_id, &token)?;
        Ok(IssuedSecret { plaintext: SecretString::from(token), digest })
    }

    pub fn verify_token(
        &self,
        request_id: &str,
        approver_id: &str,
        presented: &str,
        stored_digest: &str,
    ) -> Result<bool, SecretError> {
        let candidate = self.token_digest(request_id, approver_id, presented.trim())?;
        Ok(constant_time_eq(&candidate, stored_digest))
    }

    /// Uniform six-digit code with leading zeros preserved.
    pub fn issue_code(&self, request_id: &str) -> Result<IssuedSecret, SecretError> {
        let mut rng = rand::thread_rng();
        let code = format!("{:0width$}", rng.gen_range(0..1_000_000_u32), width = CODE_DIGITS);
        let mut salt = [0_u8; SALT_BYTES];
        rng.fill_bytes(&mut salt);
        let digest = self.code_digest(request_id, &code, &salt)?;
        let encoded =
            format!("{CODE_DIGEST_VERSION}${}${}", hex::encode(salt), hex::encode(digest));
        Ok(IssuedSecret { plaintext: SecretString::from(code), digest: encoded })
    }

    /// Malformed input or a malformed stored digest both verify as a mismatch.
    pub fn verify_code(
        &self,
        request_id: &str,
        presented: &str,
        stored_digest: &str,
    ) -> Result<bool, SecretError> {
        let presented = presented.trim();
        if presented.len() != CODE_DIGITS || !presented.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(false);
        }

        let mut parts = stored_digest.splitn(3, '$');
        let (Some(version), Some(salt_hex), Some(digest_hex)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return Ok(false);
        };
        if version != CODE_DIGEST_VERSION {
            return Ok(false);
        }
        let Ok(salt) = hex::decode(salt_hex) else {
            return Ok(false);
        };

        let candidate = hex::encode(self.code_digest(request_id, presented, &salt)?);
        Ok(constant_time_eq(&candidate, digest_hex))
    }

    fn token_digest(
        &self,
        request_id: &str,
        approver_id: &str,
        token: &str,
    ) -> Result<String, SecretError> {
        let mut mac = self.mac()?;
        mac.update(request_id.as_bytes());
        mac.update(b"|");
        mac.update(approver_id.as_bytes());
        mac.update(b"|");
        mac.update(token.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    fn code_digest(
        &self,
        request_id: &str,
        code: &str,
        salt: &[u8],
    ) -> Result<Vec<u8>, SecretError> {
        let mut mac = self.mac()?;
        mac.update(salt);
        mac.update(request_id.as_bytes());
        mac.update(b"|");
        mac.update(code.as_bytes());
        let mut digest = mac.finalize().into_bytes().to_vec();

        for _ in 1..CODE_DIGEST_ROUNDS {
            let mut round = self.mac()?;
            round.update(salt);
            round.update(&digest);
            digest = round.finalize().into_bytes().to_vec();
        }
        Ok(digest)
    }

    fn mac(&self) -> Result<HmacSha256, SecretError> {
        HmacSha256::new_from_slice(self.signing_key.expose_secret().as_bytes())
            .map_err(|error| SecretError::Mac(error.to_string()))
    }
}

pub fn constant_time_eq(left: &str, right: &str) -> bool {
    left.as_bytes().ct_eq(right.as_bytes()).into()
}
