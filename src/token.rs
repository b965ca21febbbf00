//! Run tokens: HMAC-SHA256 over `runId:userId:seed`.
//!
//! Tokens are never stored. The server recomputes the expected value from
//! the run record on every call, so a run's only revocation path is leaving
//! `IN_PROGRESS`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::protocol::UserId;

type HmacSha256 = Hmac<Sha256>;

/// Signs and verifies run tokens with one process-wide secret.
#[derive(Clone)]
pub struct RunTokenSigner {
    secret: Vec<u8>,
}

impl std::fmt::Debug for RunTokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunTokenSigner")
            .field("secret", &"<redacted>")
            .finish()
    }
}

impl RunTokenSigner {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn mac(&self, run_id: &str, user_id: UserId, seed: &str) -> HmacSha256 {
        let Ok(mut mac) = HmacSha256::new_from_slice(&self.secret) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(format!("{run_id}:{user_id}:{seed}").as_bytes());
        mac
    }

    /// Lowercase hex token for the given run fields.
    pub fn sign(&self, run_id: &str, user_id: UserId, seed: &str) -> String {
        hex::encode(self.mac(run_id, user_id, seed).finalize().into_bytes())
    }

    /// Constant-time check of a client-supplied token.
    pub fn verify(&self, run_id: &str, user_id: UserId, seed: &str, token: &str) -> bool {
        let Ok(provided) = hex::decode(token.trim()) else {
            return false;
        };
        self.mac(run_id, user_id, seed)
            .verify_slice(&provided)
            .is_ok()
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic_and_hex() {
        let signer = RunTokenSigner::new("secret");
        let a = signer.sign("run-1", 7, "S1");
        let b = signer.sign("run-1", 7, "S1");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn every_field_is_bound() {
        let signer = RunTokenSigner::new("secret");
        let token = signer.sign("run-1", 7, "S1");
        assert!(signer.verify("run-1", 7, "S1", &token));
        assert!(!signer.verify("run-2", 7, "S1", &token));
        assert!(!signer.verify("run-1", 8, "S1", &token));
        assert!(!signer.verify("run-1", 7, "S2", &token));
    }

    #[test]
    fn secret_matters() {
        let token = RunTokenSigner::new("one").sign("run-1", 7, "S1");
        assert!(!RunTokenSigner::new("two").verify("run-1", 7, "S1", &token));
    }

    #[test]
    fn garbage_tokens_are_rejected() {
        let signer = RunTokenSigner::new("secret");
        assert!(!signer.verify("run-1", 7, "S1", ""));
        assert!(!signer.verify("run-1", 7, "S1", "not-hex"));
        assert!(!signer.verify("run-1", 7, "S1", "abcd"));
    }

    #[test]
    fn debug_hides_secret() {
        let rendered = format!("{:?}", RunTokenSigner::new("hunter2"));
        assert!(!rendered.contains("hunter2"));
    }
}
