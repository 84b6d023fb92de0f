//! X25519 key pairs, shared-key derivation and topic hashing.
//!
//! All keys cross module boundaries hex-encoded, which is also how they are
//! persisted in the keychain and written into pairing URIs.

use crate::{Result, SignkitError};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Length of every key and topic in bytes.
pub const KEY_LENGTH: usize = 32;

/// An X25519 key pair, hex-encoded.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    pub public_key: String,
    pub private_key: String,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .finish()
    }
}

/// Generate a fresh key pair from the OS RNG.
pub fn generate_key_pair() -> KeyPair {
    let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
    let public = PublicKey::from(&secret);
    KeyPair {
        public_key: hex::encode(public.as_bytes()),
        private_key: hex::encode(secret.to_bytes()),
    }
}

/// Derive the symmetric key shared by `private_key`'s owner and `peer_public_key`.
///
/// `derive_sym_key(a.private, b.public) == derive_sym_key(b.private, a.public)`.
pub fn derive_sym_key(private_key: &str, peer_public_key: &str) -> Result<String> {
    let secret = StaticSecret::from(*decode_key(private_key, "private key")?);
    let peer = PublicKey::from(*decode_key(peer_public_key, "public key")?);
    let shared = secret.diffie_hellman(&peer);

    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut sym_key = Zeroizing::new([0u8; KEY_LENGTH]);
    hk.expand(&[], sym_key.as_mut())
        .map_err(|e| SignkitError::Internal(format!("hkdf expand failed: {}", e)))?;
    Ok(hex::encode(sym_key.as_ref()))
}

/// Hash a symmetric key into the topic it protects.
pub fn hash_key(sym_key: &str) -> Result<String> {
    let bytes = decode_key(sym_key, "symmetric key")?;
    Ok(hex::encode(Sha256::digest(bytes.as_ref())))
}

/// 32 random bytes, hex-encoded. Used for fresh pairing symmetric keys.
pub fn generate_random_bytes32() -> String {
    let mut bytes = Zeroizing::new([0u8; KEY_LENGTH]);
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, bytes.as_mut());
    hex::encode(bytes.as_ref())
}

/// Decode a hex key and check its length.
pub(crate) fn decode_key(hex_key: &str, what: &str) -> Result<Zeroizing<[u8; KEY_LENGTH]>> {
    let bytes = Zeroizing::new(
        hex::decode(hex_key)
            .map_err(|e| SignkitError::validation(format!("invalid {} hex: {}", what, e)))?,
    );
    if bytes.len() != KEY_LENGTH {
        return Err(SignkitError::validation(format!(
            "invalid {} length: {} bytes (expected {})",
            what,
            bytes.len(),
            KEY_LENGTH
        )));
    }
    let mut out = Zeroizing::new([0u8; KEY_LENGTH]);
    out.copy_from_slice(&bytes);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_key_symmetry() {
        let a = generate_key_pair();
        let b = generate_key_pair();
        let ab = derive_sym_key(&a.private_key, &b.public_key).unwrap();
        let ba = derive_sym_key(&b.private_key, &a.public_key).unwrap();
        assert_eq!(ab, ba);
        assert_eq!(ab.len(), KEY_LENGTH * 2);
    }

    #[test]
    fn test_hash_key_is_deterministic_and_distinct() {
        let k1 = generate_random_bytes32();
        let k2 = generate_random_bytes32();
        assert_eq!(hash_key(&k1).unwrap(), hash_key(&k1).unwrap());
        assert_ne!(hash_key(&k1).unwrap(), hash_key(&k2).unwrap());
        assert_ne!(hash_key(&k1).unwrap(), k1);
    }

    #[test]
    fn test_rejects_malformed_keys() {
        assert!(hash_key("zz").is_err());
        assert!(hash_key("abcd").is_err());
        let a = generate_key_pair();
        assert!(derive_sym_key(&a.private_key, "00").is_err());
    }

    #[test]
    fn test_debug_redacts_private_key() {
        let pair = generate_key_pair();
        let printed = format!("{:?}", pair);
        assert!(printed.contains(&pair.public_key));
        assert!(!printed.contains(&pair.private_key));
    }
}
