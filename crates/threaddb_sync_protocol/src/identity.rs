//! Signing identities used by the token handshake.

use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Something that can prove ownership of a public key by signing a
/// challenge.
pub trait Identity: Send + Sync {
    /// The public key presented to the service.
    fn public_key(&self) -> String;

    /// Signs `data`.
    fn sign(&self, data: &[u8]) -> Vec<u8>;
}

/// An identity backed by a shared HMAC-SHA256 secret.
///
/// The public key is derived from the secret, so a service that knows
/// the secret can verify signatures with [`verify_hmac`].
#[derive(Clone)]
pub struct HmacIdentity {
    secret: Vec<u8>,
}

impl std::fmt::Debug for HmacIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacIdentity")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

impl HmacIdentity {
    /// Creates an identity from a secret.
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    /// Creates an identity with a random 32-byte secret.
    #[must_use]
    pub fn random() -> Self {
        let mut secret = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        Self { secret }
    }

    /// Returns the secret, for registering the identity with a service.
    #[must_use]
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }
}

impl Identity for HmacIdentity {
    fn public_key(&self) -> String {
        use sha2::Digest;
        let digest = Sha256::digest(&self.secret);
        format!("pk-{}", hex::encode(&digest[..16]))
    }

    fn sign(&self, data: &[u8]) -> Vec<u8> {
        hmac_sign(&self.secret, data)
    }
}

/// Computes an HMAC-SHA256 signature.
#[must_use]
pub fn hmac_sign(secret: &[u8], data: &[u8]) -> Vec<u8> {
    // HMAC accepts keys of any length.
    match HmacSha256::new_from_slice(secret) {
        Ok(mut mac) => {
            mac.update(data);
            mac.finalize().into_bytes().to_vec()
        }
        Err(_) => Vec::new(),
    }
}

/// Verifies an HMAC-SHA256 signature in constant time.
#[must_use]
pub fn verify_hmac(secret: &[u8], data: &[u8], signature: &[u8]) -> bool {
    match HmacSha256::new_from_slice(secret) {
        Ok(mut mac) => {
            mac.update(data);
            mac.verify_slice(signature).is_ok()
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_verify() {
        let id = HmacIdentity::new(b"secret".to_vec());
        let sig = id.sign(b"challenge");
        assert!(verify_hmac(id.secret(), b"challenge", &sig));
        assert!(!verify_hmac(id.secret(), b"other", &sig));
        assert!(!verify_hmac(b"wrong", b"challenge", &sig));
    }

    #[test]
    fn public_key_is_stable() {
        let a = HmacIdentity::new(b"k".to_vec());
        let b = HmacIdentity::new(b"k".to_vec());
        assert_eq!(a.public_key(), b.public_key());
        assert_ne!(a.public_key(), HmacIdentity::random().public_key());
    }
}
