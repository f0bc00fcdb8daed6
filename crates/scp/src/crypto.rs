//! Signing and verification of micropayment transactions.
//!
//! The signed bytes are a canonical JSON object with keys `to`, `bcn` and
//! `amount`, plus every metadata entry flagged for signing. Keys serialise
//! in sorted order, so the same message and key always produce the same
//! signature.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use libp2p_identity::PeerId;
use ss_net_scp::{MetadataValue, MicropaymentMsg};
use tracing::warn;

use crate::api::{PeerKeystore, SwarmHost};

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("failed serialising transaction: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("signing failed: {0}")]
    Signing(String),
}

/// Signs outgoing micropayments with the local identity key.
pub trait MessageSigner: Send + Sync {
    fn sign_txn(&self, msg: &mut MicropaymentMsg) -> Result<(), CryptoError>;
}

/// Verifies incoming micropayments against the claimed sender.
pub trait SignatureVerifier: Send + Sync {
    fn verify_txn(&self, from: &PeerId, msg: &MicropaymentMsg) -> bool;
}

/// Checks whether a partner is on the swarm operator's whitelist.
pub trait WhitelistChecker: Send + Sync {
    fn is_whitelisted(&self, partner: &str) -> bool;
}

/// Canonical bytes covered by the transaction signature.
pub fn txn_signing_payload(msg: &MicropaymentMsg) -> Result<Vec<u8>, CryptoError> {
    let mut txn: BTreeMap<&str, serde_json::Value> = BTreeMap::new();
    txn.insert("to", serde_json::Value::from(msg.receiver.clone()));
    txn.insert("bcn", serde_json::Value::from(msg.billing_cycle));
    txn.insert("amount", serde_json::Value::from(msg.amount));
    for (key, entry) in &msg.metadata {
        if !entry.include_signature {
            continue;
        }
        let value = match &entry.value {
            MetadataValue::Int(v) => serde_json::Value::from(*v),
            MetadataValue::Str(v) => serde_json::Value::from(v.clone()),
        };
        txn.insert(key.as_str(), value);
    }
    Ok(serde_json::to_vec(&txn)?)
}

/// Host-key backed signer and verifier.
pub struct IdentityCrypto {
    host: Arc<dyn SwarmHost>,
    keystore: Arc<dyn PeerKeystore>,
}

impl IdentityCrypto {
    pub fn new(host: Arc<dyn SwarmHost>, keystore: Arc<dyn PeerKeystore>) -> Self {
        Self { host, keystore }
    }
}

impl MessageSigner for IdentityCrypto {
    fn sign_txn(&self, msg: &mut MicropaymentMsg) -> Result<(), CryptoError> {
        let payload = txn_signing_payload(msg)?;
        let signature = self
            .host
            .sign(&payload)
            .map_err(|e| CryptoError::Signing(e.to_string()))?;
        msg.txn_hash = BASE64.encode(signature);
        Ok(())
    }
}

impl SignatureVerifier for IdentityCrypto {
    fn verify_txn(&self, from: &PeerId, msg: &MicropaymentMsg) -> bool {
        let payload = match txn_signing_payload(msg) {
            Ok(p) => p,
            Err(e) => {
                warn!(peer = %from, error = %e, "failed serialising txn for verification");
                return false;
            }
        };
        let Some(key) = self.keystore.public_key(from) else {
            warn!(peer = %from, "public key missing for peer");
            return false;
        };
        let signature = match BASE64.decode(&msg.txn_hash) {
            Ok(s) => s,
            Err(e) => {
                warn!(peer = %from, error = %e, "txn hash is not valid base64");
                return false;
            }
        };
        key.verify(&payload, &signature)
    }
}

/// Signer used when no Streamspace configuration is provided.
pub struct DummySigner;

impl MessageSigner for DummySigner {
    fn sign_txn(&self, msg: &mut MicropaymentMsg) -> Result<(), CryptoError> {
        msg.txn_hash = "dummySign".to_owned();
        Ok(())
    }
}

/// Verifier counterpart of [`DummySigner`]: accepts everything.
pub struct DummyVerifier;

impl SignatureVerifier for DummyVerifier {
    fn verify_txn(&self, _from: &PeerId, _msg: &MicropaymentMsg) -> bool {
        true
    }
}

pub struct DummyWhitelistChecker;

impl WhitelistChecker for DummyWhitelistChecker {
    fn is_whitelisted(&self, _partner: &str) -> bool {
        true
    }
}
