//! ChaCha20-Poly1305 envelopes carried by the relay.
//!
//! # Wire Format
//!
//! ```text
//! type 0: [1 byte type][12 bytes iv][N bytes ciphertext+tag]
//! type 1: [1 byte type][32 bytes sender public key][12 bytes iv][N bytes ciphertext+tag]
//! ```
//!
//! The whole envelope is base64 (standard alphabet) on the wire. Type 1 lets a
//! receiver who knows only its own key pair derive the symmetric key from the
//! sender public key embedded in the envelope.

use super::keys::{decode_key, KEY_LENGTH};
use crate::{Result, SignkitError};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};

/// Envelope addressed to a topic whose symmetric key both sides hold.
pub const TYPE_0: u8 = 0;

/// Envelope carrying the sender public key for first-contact key agreement.
pub const TYPE_1: u8 = 1;

/// Size of the iv in bytes.
pub const IV_LENGTH: usize = 12;

/// Envelope fields after base64 decoding.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodingParams {
    pub envelope_type: u8,
    pub sender_public_key: Option<String>,
    pub iv: [u8; IV_LENGTH],
    pub sealed: Vec<u8>,
}

impl EncodingParams {
    /// Split a base64 envelope into its fields.
    pub fn deserialize(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| SignkitError::Decoding(format!("invalid base64: {}", e)))?;
        let (&envelope_type, rest) = bytes
            .split_first()
            .ok_or_else(|| SignkitError::Decoding("empty envelope".into()))?;

        let (sender_public_key, rest) = match envelope_type {
            TYPE_0 => (None, rest),
            TYPE_1 => {
                if rest.len() < KEY_LENGTH {
                    return Err(SignkitError::Decoding("truncated sender public key".into()));
                }
                let (key, rest) = rest.split_at(KEY_LENGTH);
                (Some(hex::encode(key)), rest)
            }
            other => {
                return Err(SignkitError::Decoding(format!(
                    "unsupported envelope type {}",
                    other
                )))
            }
        };

        if rest.len() < IV_LENGTH {
            return Err(SignkitError::Decoding("truncated iv".into()));
        }
        let (iv_bytes, sealed) = rest.split_at(IV_LENGTH);
        let mut iv = [0u8; IV_LENGTH];
        iv.copy_from_slice(iv_bytes);

        Ok(Self {
            envelope_type,
            sender_public_key,
            iv,
            sealed: sealed.to_vec(),
        })
    }

    /// Join the fields back into a base64 envelope.
    pub fn serialize(&self) -> Result<String> {
        let mut out = Vec::with_capacity(1 + KEY_LENGTH + IV_LENGTH + self.sealed.len());
        out.push(self.envelope_type);
        if self.envelope_type == TYPE_1 {
            let key = self.sender_public_key.as_deref().ok_or_else(|| {
                SignkitError::Encoding("type 1 envelope requires a sender public key".into())
            })?;
            let key = decode_key(key, "sender public key")
                .map_err(|e| SignkitError::Encoding(e.to_string()))?;
            out.extend_from_slice(key.as_ref());
        }
        out.extend_from_slice(&self.iv);
        out.extend_from_slice(&self.sealed);
        Ok(BASE64.encode(out))
    }
}

/// Seal `message` under `sym_key` (hex) and produce a base64 envelope.
pub fn encrypt(
    sym_key: &str,
    message: &str,
    envelope_type: u8,
    sender_public_key: Option<&str>,
) -> Result<String> {
    if envelope_type != TYPE_0 && envelope_type != TYPE_1 {
        return Err(SignkitError::Encoding(format!(
            "unsupported envelope type {}",
            envelope_type
        )));
    }
    let cipher = cipher_for(sym_key).map_err(|e| SignkitError::Encoding(e.to_string()))?;

    let mut iv = [0u8; IV_LENGTH];
    rand::RngCore::fill_bytes(&mut rand::rngs::OsRng, &mut iv);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&iv), message.as_bytes())
        .map_err(|e| SignkitError::Encoding(format!("seal failed: {}", e)))?;

    EncodingParams {
        envelope_type,
        sender_public_key: sender_public_key.map(str::to_string),
        iv,
        sealed,
    }
    .serialize()
}

/// Open a base64 envelope with `sym_key` (hex).
pub fn decrypt(sym_key: &str, encoded: &str) -> Result<String> {
    let params = EncodingParams::deserialize(encoded)?;
    let cipher = cipher_for(sym_key).map_err(|e| SignkitError::Decoding(e.to_string()))?;
    let opened = cipher
        .decrypt(Nonce::from_slice(&params.iv), params.sealed.as_ref())
        .map_err(|_| SignkitError::Decoding("authentication failed".into()))?;
    String::from_utf8(opened).map_err(|e| SignkitError::Decoding(format!("invalid utf-8: {}", e)))
}

fn cipher_for(sym_key: &str) -> Result<ChaCha20Poly1305> {
    let key = decode_key(sym_key, "symmetric key")?;
    ChaCha20Poly1305::new_from_slice(key.as_ref())
        .map_err(|e| SignkitError::Internal(format!("cipher init failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::keys::{generate_key_pair, generate_random_bytes32};

    #[test]
    fn test_type0_roundtrip() {
        let key = generate_random_bytes32();
        let encoded = encrypt(&key, r#"{"id":1}"#, TYPE_0, None).unwrap();
        assert_eq!(decrypt(&key, &encoded).unwrap(), r#"{"id":1}"#);

        let params = EncodingParams::deserialize(&encoded).unwrap();
        assert_eq!(params.envelope_type, TYPE_0);
        assert!(params.sender_public_key.is_none());
    }

    #[test]
    fn test_type1_embeds_sender_key() {
        let key = generate_random_bytes32();
        let sender = generate_key_pair();
        let encoded = encrypt(&key, "hello", TYPE_1, Some(&sender.public_key)).unwrap();
        let params = EncodingParams::deserialize(&encoded).unwrap();
        assert_eq!(params.envelope_type, TYPE_1);
        assert_eq!(params.sender_public_key.as_deref(), Some(sender.public_key.as_str()));
        assert_eq!(decrypt(&key, &encoded).unwrap(), "hello");
    }

    #[test]
    fn test_type1_without_sender_key_fails() {
        let key = generate_random_bytes32();
        let err = encrypt(&key, "hello", TYPE_1, None).unwrap_err();
        assert!(matches!(err, SignkitError::Encoding(_)));
    }

    #[test]
    fn test_wrong_key_or_tampering_fails() {
        let key = generate_random_bytes32();
        let other = generate_random_bytes32();
        let encoded = encrypt(&key, "secret", TYPE_0, None).unwrap();
        assert!(matches!(decrypt(&other, &encoded), Err(SignkitError::Decoding(_))));

        let mut bytes = BASE64.decode(&encoded).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        let tampered = BASE64.encode(bytes);
        assert!(matches!(decrypt(&key, &tampered), Err(SignkitError::Decoding(_))));
    }

    #[test]
    fn test_malformed_envelopes() {
        assert!(EncodingParams::deserialize("!!!").is_err());
        assert!(EncodingParams::deserialize("").is_err());
        assert!(EncodingParams::deserialize(&BASE64.encode([7u8, 0, 0])).is_err());
        assert!(EncodingParams::deserialize(&BASE64.encode([1u8; 10])).is_err());
    }
}
