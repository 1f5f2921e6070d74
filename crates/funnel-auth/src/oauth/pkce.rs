//! RFC 7636 PKCE verification.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

use super::types::CodeChallengeMethod;

/// Verifies `verifier` against `challenge` per `method`.
///
/// - `plain`: the verifier must equal the challenge byte-for-byte.
/// - `S256`: `base64url(SHA-256(verifier))` (no padding) must equal the
///   challenge.
pub fn verify(method: CodeChallengeMethod, verifier: &str, challenge: &str) -> bool {
    match method {
        CodeChallengeMethod::Plain => verifier == challenge,
        CodeChallengeMethod::S256 => {
            let digest = Sha256::digest(verifier.as_bytes());
            URL_SAFE_NO_PAD.encode(digest) == challenge
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_requires_exact_match() {
        assert!(verify(CodeChallengeMethod::Plain, "abc", "abc"));
        assert!(!verify(CodeChallengeMethod::Plain, "abc", "xyz"));
    }

    #[test]
    fn s256_matches_known_vector() {
        // RFC 7636 Appendix B.
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        let challenge = "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM";
        assert!(verify(CodeChallengeMethod::S256, verifier, challenge));
    }

    #[test]
    fn s256_rejects_mismatched_verifier() {
        assert!(!verify(CodeChallengeMethod::S256, "wrong-verifier", "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"));
    }
}
