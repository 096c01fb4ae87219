// Upload signature verification.
//
// Two key formats coexist. MVP devices ship an opaque `DEVICE:` marker inside
// PEM wrapping and are accepted without a cryptographic check (documented
// trade-off from the pilot rollout). Real devices ship a P-256 public key and
// sign the payload with ECDSA over SHA-256.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};
use p256::pkcs8::DecodePublicKey;

/// Undo transport mangling of PEM newlines and trim whitespace.
pub fn normalize_pem(pem: &str) -> String {
    pem.replace("\\n", "\n").trim().to_string()
}

/// MVP key material: a `DEVICE:` marker either in the clear or as the start of
/// the base64 PEM body (`REVW` is base64 for `DEV`).
pub fn is_mvp_key(pem: &str) -> bool {
    pem.contains("DEVICE:") || pem.starts_with("-----BEGIN PUBLIC KEY-----\nREVW")
}

#[derive(Debug)]
pub enum VerifyError {
    /// The signature does not match the message under this key.
    Invalid,
    /// The key or signature could not be parsed at all.
    Other(String),
}

impl std::fmt::Display for VerifyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyError::Invalid => write!(f, "invalid signature"),
            VerifyError::Other(msg) => write!(f, "{}", msg),
        }
    }
}

/// Verify an ECDSA(P-256, SHA-256) signature over the exact message bytes.
/// Accepts DER-encoded signatures, falling back to raw r||s.
pub fn verify_ecdsa_signature(
    pem: &str,
    message: &[u8],
    signature_b64: &str,
) -> Result<(), VerifyError> {
    let key = VerifyingKey::from_public_key_pem(pem)
        .map_err(|e| VerifyError::Other(format!("cannot parse public key: {}", e)))?;

    let raw = B64
        .decode(signature_b64.trim())
        .map_err(|e| VerifyError::Other(format!("cannot decode signature: {}", e)))?;

    let signature = Signature::from_der(&raw)
        .or_else(|_| Signature::from_slice(&raw))
        .map_err(|e| VerifyError::Other(format!("cannot parse signature: {}", e)))?;

    key.verify(message, &signature)
        .map_err(|_| VerifyError::Invalid)
}

#[cfg(test)]
mod tests {
    use super::*;
    use p256::ecdsa::signature::Signer;
    use p256::ecdsa::SigningKey;
    use p256::pkcs8::EncodePublicKey;

    fn test_keypair() -> (SigningKey, String) {
        let signing_key = SigningKey::random(&mut rand::rngs::OsRng);
        let pem = signing_key
            .verifying_key()
            .to_public_key_pem(p256::pkcs8::LineEnding::LF)
            .unwrap();
        (signing_key, pem)
    }

    #[test]
    fn test_normalize_pem_unescapes_newlines() {
        let mangled = "-----BEGIN PUBLIC KEY-----\\nABC\\n-----END PUBLIC KEY-----\n";
        let normalized = normalize_pem(mangled);
        assert!(normalized.contains("\nABC\n"));
        assert!(!normalized.contains("\\n"));
        assert!(!normalized.ends_with('\n'));
    }

    #[test]
    fn test_mvp_marker_detection() {
        assert!(is_mvp_key("DEVICE:pixel-8-abc123"));
        assert!(is_mvp_key("-----BEGIN PUBLIC KEY-----\nREVWSUNFOmFiYw==\n-----END PUBLIC KEY-----"));
        let (_, pem) = test_keypair();
        assert!(!is_mvp_key(&pem));
    }

    #[test]
    fn test_valid_signature_accepted() {
        let (signing_key, pem) = test_keypair();
        let message = br#"{"video_hash": "abc"}"#;
        let signature: Signature = signing_key.sign(message);
        let b64 = B64.encode(signature.to_der().as_bytes());

        verify_ecdsa_signature(&pem, message, &b64).unwrap();
    }

    #[test]
    fn test_tampered_message_rejected_as_invalid() {
        let (signing_key, pem) = test_keypair();
        let signature: Signature = signing_key.sign(b"original");
        let b64 = B64.encode(signature.to_der().as_bytes());

        match verify_ecdsa_signature(&pem, b"tampered", &b64) {
            Err(VerifyError::Invalid) => {}
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_wrong_key_rejected_as_invalid() {
        let (signing_key, _) = test_keypair();
        let (_, other_pem) = test_keypair();
        let signature: Signature = signing_key.sign(b"message");
        let b64 = B64.encode(signature.to_der().as_bytes());

        match verify_ecdsa_signature(&other_pem, b"message", &b64) {
            Err(VerifyError::Invalid) => {}
            other => panic!("expected Invalid, got {:?}", other),
        }
    }

    #[test]
    fn test_garbage_key_is_other_error() {
        match verify_ecdsa_signature("not a pem", b"m", "c2ln") {
            Err(VerifyError::Other(_)) => {}
            other => panic!("expected Other, got {:?}", other),
        }
    }

    #[test]
    fn test_raw_signature_format_accepted() {
        let (signing_key, pem) = test_keypair();
        let message = b"raw format";
        let signature: Signature = signing_key.sign(message);
        let b64 = B64.encode(signature.to_bytes());

        verify_ecdsa_signature(&pem, message, &b64).unwrap();
    }
}
