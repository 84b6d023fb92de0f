//! Pairing URI codec.
//!
//! Format:
//!
//! ```text
//! wc:<topic>@2?relay-protocol=irn&symKey=<hex>&expiryTimestamp=<secs>[&methods=[a,b]][&relay-data=<data>]
//! ```
//!
//! # Examples
//!
//! ```rust
//! use signkit_lib::uri::{parse_uri, PairingUri};
//!
//! let uri = parse_uri(&format!(
//!     "wc:{}@2?relay-protocol=irn&symKey={}&expiryTimestamp=1700000000",
//!     "a".repeat(64),
//!     "b".repeat(64)
//! ))
//! .unwrap();
//! assert_eq!(uri.relay.protocol, "irn");
//! assert_eq!(uri.expiry_timestamp, Some(1_700_000_000));
//! ```

use crate::relay::RelayProtocol;
use crate::{Result, SignkitError};
use std::fmt;
use std::str::FromStr;

pub const URI_PROTOCOL: &str = "wc";
pub const URI_VERSION: u32 = 2;

/// Everything a peer needs to join a pairing topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingUri {
    pub topic: String,
    pub version: u32,
    pub sym_key: String,
    pub relay: RelayProtocol,
    pub expiry_timestamp: Option<u64>,
    /// Methods the creator will accept on the pairing topic, if advertised.
    pub methods: Option<Vec<String>>,
}

impl PairingUri {
    pub fn new(topic: impl Into<String>, sym_key: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            version: URI_VERSION,
            sym_key: sym_key.into(),
            relay: RelayProtocol::default(),
            expiry_timestamp: None,
            methods: None,
        }
    }

    pub fn with_expiry(mut self, expiry: u64) -> Self {
        self.expiry_timestamp = Some(expiry);
        self
    }

    pub fn with_methods(mut self, methods: Vec<String>) -> Self {
        self.methods = Some(methods);
        self
    }
}

impl fmt::Display for PairingUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}@{}?relay-protocol={}&symKey={}",
            URI_PROTOCOL,
            self.topic,
            self.version,
            urlencoding::encode(&self.relay.protocol),
            self.sym_key
        )?;
        if let Some(expiry) = self.expiry_timestamp {
            write!(f, "&expiryTimestamp={}", expiry)?;
        }
        if let Some(methods) = &self.methods {
            write!(f, "&methods={}", urlencoding::encode(&format!("[{}]", methods.join(","))))?;
        }
        if let Some(data) = &self.relay.data {
            write!(f, "&relay-data={}", urlencoding::encode(data))?;
        }
        Ok(())
    }
}

impl FromStr for PairingUri {
    type Err = SignkitError;

    fn from_str(s: &str) -> Result<Self> {
        parse_uri(s)
    }
}

pub fn format_uri(uri: &PairingUri) -> String {
    uri.to_string()
}

/// Parse a pairing URI.
///
/// # Errors
///
/// Returns `InvalidUri` for a wrong scheme, a missing or malformed topic,
/// version, `relay-protocol` or `symKey`.
pub fn parse_uri(uri: &str) -> Result<PairingUri> {
    let uri = uri.trim();
    let rest = uri
        .strip_prefix(URI_PROTOCOL)
        .and_then(|r| r.strip_prefix(':'))
        .ok_or_else(|| invalid("expected wc: scheme"))?;

    let (path, query) = rest.split_once('?').ok_or_else(|| invalid("missing query"))?;
    let (topic, version) = path
        .split_once('@')
        .ok_or_else(|| invalid("missing version"))?;
    if !is_hex_key(topic) {
        return Err(invalid("malformed topic"));
    }
    let version: u32 = version.parse().map_err(|_| invalid("malformed version"))?;
    if version != URI_VERSION {
        return Err(invalid(&format!("unsupported version {}", version)));
    }

    let mut protocol = None;
    let mut relay_data = None;
    let mut sym_key = None;
    let mut expiry_timestamp = None;
    let mut methods = None;

    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = urlencoding::decode(value)
            .map_err(|_| invalid("malformed query encoding"))?
            .into_owned();
        match key {
            "relay-protocol" => protocol = Some(value),
            "relay-data" => relay_data = Some(value),
            "symKey" => sym_key = Some(value),
            "expiryTimestamp" => {
                expiry_timestamp = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| invalid("malformed expiryTimestamp"))?,
                )
            }
            "methods" => methods = Some(parse_methods(&value)?),
            _ => {}
        }
    }

    let protocol = protocol
        .filter(|p| !p.is_empty())
        .ok_or_else(|| invalid("missing relay-protocol"))?;
    let sym_key = sym_key.ok_or_else(|| invalid("missing symKey"))?;
    if !is_hex_key(&sym_key) {
        return Err(invalid("malformed symKey"));
    }

    Ok(PairingUri {
        topic: topic.to_string(),
        version,
        sym_key,
        relay: RelayProtocol {
            protocol,
            data: relay_data,
        },
        expiry_timestamp,
        methods,
    })
}

fn parse_methods(value: &str) -> Result<Vec<String>> {
    let inner = value
        .strip_prefix('[')
        .and_then(|v| v.strip_suffix(']'))
        .ok_or_else(|| invalid("malformed methods"))?;
    Ok(inner
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(str::to_string)
        .collect())
}

fn is_hex_key(value: &str) -> bool {
    value.len() == 64 && value.chars().all(|c| c.is_ascii_hexdigit())
}

fn invalid(reason: &str) -> SignkitError {
    SignkitError::InvalidUri(reason.to_string())
}
