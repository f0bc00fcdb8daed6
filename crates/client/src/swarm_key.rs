//! Pre-shared swarm key decoding.
//!
//! The bootstrap API hands out the key in the standard v1 framing:
//!
//! ```text
//! /key/swarm/psk/1.0.0/
//! /base16/
//! <64 hex chars>
//! ```
//!
//! The transport refuses peers that do not present the same 32-byte secret.

const PSK_PATH: &str = "/key/swarm/psk/1.0.0/";
const BASE16_CODEC: &str = "/base16/";

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SwarmKeyError {
    #[error("swarm key is not valid utf-8")]
    NotText,

    #[error("unsupported psk version line {0:?}")]
    BadVersion(String),

    #[error("unsupported psk encoding {0:?}")]
    BadEncoding(String),

    #[error("swarm key is not 32 hex-encoded bytes")]
    BadKey,
}

/// Decode a v1 pre-shared key blob into the raw 32-byte secret.
pub fn decode_v1_psk(raw: &[u8]) -> Result<[u8; 32], SwarmKeyError> {
    let text = std::str::from_utf8(raw).map_err(|_| SwarmKeyError::NotText)?;
    let mut lines = text.lines().map(str::trim).filter(|l| !l.is_empty());

    let version = lines.next().unwrap_or_default();
    if version != PSK_PATH.trim_end_matches('/') && version != PSK_PATH {
        return Err(SwarmKeyError::BadVersion(version.to_owned()));
    }
    let encoding = lines.next().unwrap_or_default();
    if encoding != BASE16_CODEC.trim_end_matches('/') && encoding != BASE16_CODEC {
        return Err(SwarmKeyError::BadEncoding(encoding.to_owned()));
    }
    let key_hex = lines.next().ok_or(SwarmKeyError::BadKey)?;
    let bytes = hex::decode(key_hex).map_err(|_| SwarmKeyError::BadKey)?;
    bytes.try_into().map_err(|_| SwarmKeyError::BadKey)
}
