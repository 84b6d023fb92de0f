//! Key management and envelope encryption.
//!
//! [`Crypto`] owns the [`Keychain`] and is the only component that touches key
//! material. Everyone else refers to keys by public key or by topic.
//!
//! ```rust,ignore
//! let self_pub = crypto.generate_key_pair().await?;
//! let topic = crypto.generate_shared_key(&self_pub, &peer_pub, None).await?;
//! let message = crypto.encode(&topic, &payload, &EncodeOptions::default()).await?;
//! let payload = crypto.decode(&topic, &message, &DecodeOptions::default()).await?;
//! ```

pub mod envelope;
pub mod keychain;
pub mod keys;

pub use envelope::{EncodingParams, TYPE_0, TYPE_1};
pub use keychain::Keychain;
pub use keys::{derive_sym_key, generate_key_pair, hash_key, KeyPair};

use crate::jsonrpc::JsonRpcPayload;
use crate::storage::KeyValueStorage;
use crate::{Result, SignkitError};
use std::sync::Arc;

/// Options for [`Crypto::encode`].
#[derive(Clone, Debug, Default)]
pub struct EncodeOptions {
    pub envelope_type: u8,
    /// Required for type 1 envelopes.
    pub sender_public_key: Option<String>,
}

impl EncodeOptions {
    /// A type 1 envelope announcing `sender_public_key`.
    pub fn type1(sender_public_key: impl Into<String>) -> Self {
        Self {
            envelope_type: TYPE_1,
            sender_public_key: Some(sender_public_key.into()),
        }
    }
}

/// Options for [`Crypto::decode`].
#[derive(Clone, Debug, Default)]
pub struct DecodeOptions {
    /// Our public key, required to open type 1 envelopes.
    pub receiver_public_key: Option<String>,
}

pub struct Crypto {
    keychain: Keychain,
}

impl Crypto {
    pub fn new(storage: Arc<dyn KeyValueStorage>, storage_key: String) -> Self {
        Self {
            keychain: Keychain::new(storage, storage_key),
        }
    }

    pub async fn init(&self) -> Result<()> {
        self.keychain.init().await
    }

    /// Generate a key pair, keep the private half, return the public half.
    pub async fn generate_key_pair(&self) -> Result<String> {
        let pair = generate_key_pair();
        self.keychain.set(&pair.public_key, &pair.private_key).await?;
        Ok(pair.public_key.clone())
    }

    /// Derive and store the symmetric key shared with `peer_public_key`.
    ///
    /// Returns the topic the key is stored under: `override_topic` if given,
    /// otherwise the hash of the key.
    pub async fn generate_shared_key(
        &self,
        self_public_key: &str,
        peer_public_key: &str,
        override_topic: Option<&str>,
    ) -> Result<String> {
        let private_key = self.keychain.get(self_public_key).await?;
        let sym_key = derive_sym_key(&private_key, peer_public_key)?;
        self.set_sym_key(&sym_key, override_topic).await
    }

    /// Store a symmetric key and return its topic.
    pub async fn set_sym_key(&self, sym_key: &str, override_topic: Option<&str>) -> Result<String> {
        let topic = match override_topic {
            Some(topic) => topic.to_string(),
            None => hash_key(sym_key)?,
        };
        self.keychain.set(&topic, sym_key).await?;
        Ok(topic)
    }

    /// The symmetric key for `topic`, used when exporting a pairing URI.
    pub async fn get_sym_key(&self, topic: &str) -> Result<String> {
        self.keychain.get(topic).await
    }

    pub async fn has_keys(&self, tag: &str) -> bool {
        self.keychain.has(tag).await
    }

    pub async fn delete_key_pair(&self, public_key: &str) -> Result<()> {
        self.keychain.del(public_key).await
    }

    pub async fn delete_sym_key(&self, topic: &str) -> Result<()> {
        self.keychain.del(topic).await
    }

    /// Serialize and seal a payload for `topic`.
    pub async fn encode(
        &self,
        topic: &str,
        payload: &JsonRpcPayload,
        opts: &EncodeOptions,
    ) -> Result<String> {
        let sym_key = self
            .keychain
            .get(topic)
            .await
            .map_err(|_| SignkitError::Encoding(format!("no symmetric key for topic {}", topic)))?;
        let message = serde_json::to_string(payload)?;
        envelope::encrypt(
            &sym_key,
            &message,
            opts.envelope_type,
            opts.sender_public_key.as_deref(),
        )
    }

    /// Open and parse an envelope received on `topic`.
    ///
    /// For type 1 envelopes the symmetric key is first derived from our
    /// `receiver_public_key` and the embedded sender key, and stored under
    /// `topic`.
    pub async fn decode(
        &self,
        topic: &str,
        encoded: &str,
        opts: &DecodeOptions,
    ) -> Result<JsonRpcPayload> {
        let params = EncodingParams::deserialize(encoded)?;
        if params.envelope_type == TYPE_1 {
            let receiver = opts.receiver_public_key.as_deref().ok_or_else(|| {
                SignkitError::Decoding("type 1 envelope requires a receiver public key".into())
            })?;
            let sender = params
                .sender_public_key
                .as_deref()
                .ok_or_else(|| SignkitError::Decoding("missing sender public key".into()))?;
            self.generate_shared_key(receiver, sender, Some(topic))
                .await
                .map_err(|e| SignkitError::Decoding(e.to_string()))?;
        }
        let sym_key = self
            .keychain
            .get(topic)
            .await
            .map_err(|_| SignkitError::Decoding(format!("no symmetric key for topic {}", topic)))?;
        let message = envelope::decrypt(&sym_key, encoded)?;
        serde_json::from_str(&message)
            .map_err(|e| SignkitError::Decoding(format!("invalid payload: {}", e)))
    }

    pub fn get_payload_type(&self, encoded: &str) -> Result<u8> {
        Ok(EncodingParams::deserialize(encoded)?.envelope_type)
    }

    pub fn get_payload_sender_public_key(&self, encoded: &str) -> Result<Option<String>> {
        Ok(EncodingParams::deserialize(encoded)?.sender_public_key)
    }
}
