//! Signed micropayment claims sent to serving peers.
//!
//! The metadata attached to a micropayment is a small tagged union of
//! integers and strings. Entries flagged `include_signature` contribute to
//! the signed transaction bytes; the rest are transported but not
//! authenticated.

use std::collections::BTreeMap;

use ss_net_codec::{CodecError, FrameCodec, ProtoMessage};

use crate::proto::{self, mtdt_val};

/// Metadata key whose value is covered by the transaction signature.
pub const SIGNED_METADATA_KEY: &str = "download_index";

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataValue {
    Int(i32),
    Str(String),
}

impl MetadataValue {
    fn to_json(&self) -> serde_json::Value {
        match self {
            MetadataValue::Int(v) => serde_json::Value::from(*v),
            MetadataValue::Str(v) => serde_json::Value::from(v.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetadataEntry {
    pub value: MetadataValue,
    pub include_signature: bool,
}

/// A claim that `receiver` is owed `amount` for `billing_cycle`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MicropaymentMsg {
    /// The partner's device id.
    pub receiver: String,
    pub amount: f64,
    pub billing_cycle: i32,
    /// Base64 signature over the canonical transaction bytes.
    pub txn_hash: String,
    pub metadata: BTreeMap<String, MetadataEntry>,
}

impl MicropaymentMsg {
    /// Build an unsigned micropayment from raw driver metadata. The
    /// [`SIGNED_METADATA_KEY`] entry, if present, is flagged for signing.
    pub fn new(
        amount: f64,
        billing_cycle: i64,
        receiver: impl Into<String>,
        raw_metadata: &BTreeMap<String, MetadataValue>,
    ) -> Self {
        let metadata = raw_metadata
            .iter()
            .map(|(k, v)| {
                let entry = MetadataEntry {
                    value: v.clone(),
                    include_signature: k == SIGNED_METADATA_KEY,
                };
                (k.clone(), entry)
            })
            .collect();
        Self {
            receiver: receiver.into(),
            amount,
            billing_cycle: billing_cycle as i32,
            txn_hash: String::new(),
            metadata,
        }
    }

    /// JSON bytes of the raw metadata values, for the ledger blob. `None`
    /// when the message carries no metadata.
    pub fn metadata_json(&self) -> Option<Vec<u8>> {
        if self.metadata.is_empty() {
            return None;
        }
        let raw: BTreeMap<&str, serde_json::Value> = self
            .metadata
            .iter()
            .map(|(k, e)| (k.as_str(), e.value.to_json()))
            .collect();
        serde_json::to_vec(&raw).ok()
    }
}

impl ProtoMessage for MicropaymentMsg {
    type Proto = proto::SignedTxn;

    fn into_proto(self) -> Self::Proto {
        let mtdt = if self.metadata.is_empty() {
            None
        } else {
            let vals = self
                .metadata
                .into_iter()
                .map(|(k, e)| {
                    let val = match e.value {
                        MetadataValue::Int(v) => mtdt_val::Val::IntVal(v),
                        MetadataValue::Str(v) => mtdt_val::Val::StrVal(v),
                    };
                    (
                        k,
                        proto::MtdtVal {
                            include_signature: e.include_signature,
                            val: Some(val),
                        },
                    )
                })
                .collect();
            Some(proto::Metadata { vals })
        };
        proto::SignedTxn {
            receiver: self.receiver,
            amount: self.amount,
            billing_cycle: self.billing_cycle,
            txn_hash: self.txn_hash,
            mtdt,
        }
    }

    fn from_proto(proto: Self::Proto) -> Result<Self, CodecError> {
        let mut metadata = BTreeMap::new();
        if let Some(mtdt) = proto.mtdt {
            for (k, v) in mtdt.vals {
                // Entries without a tagged value carry no information.
                let Some(val) = v.val else { continue };
                let value = match val {
                    mtdt_val::Val::IntVal(i) => MetadataValue::Int(i),
                    mtdt_val::Val::StrVal(s) => MetadataValue::Str(s),
                };
                metadata.insert(
                    k,
                    MetadataEntry {
                        value,
                        include_signature: v.include_signature,
                    },
                );
            }
        }
        Ok(Self {
            receiver: proto.receiver,
            amount: proto.amount,
            billing_cycle: proto.billing_cycle,
            txn_hash: proto.txn_hash,
            metadata,
        })
    }
}

pub type MicropaymentCodec = FrameCodec<MicropaymentMsg>;

#[cfg(test)]
mod tests {
    use super::*;
    use asynchronous_codec::{Decoder, Encoder};
    use bytes::BytesMut;

    use crate::MAX_MESSAGE_SIZE;

    fn sample_metadata() -> BTreeMap<String, MetadataValue> {
        let mut raw = BTreeMap::new();
        raw.insert(
            SIGNED_METADATA_KEY.to_owned(),
            MetadataValue::Str("17".to_owned()),
        );
        raw.insert("region".to_owned(), MetadataValue::Int(3));
        raw
    }

    #[test]
    fn roundtrip_with_metadata() {
        let mut original = MicropaymentMsg::new(1.048576, 1, "d-A", &sample_metadata());
        original.txn_hash = "c2lnbmF0dXJl".to_owned();

        let mut codec = MicropaymentCodec::new(MAX_MESSAGE_SIZE);
        let mut buf = BytesMut::new();
        codec.encode(original.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn only_download_index_is_signature_flagged() {
        let msg = MicropaymentMsg::new(2.0, 3, "d-B", &sample_metadata());
        assert!(msg.metadata[SIGNED_METADATA_KEY].include_signature);
        assert!(!msg.metadata["region"].include_signature);
    }

    #[test]
    fn metadata_json_holds_raw_values() {
        let msg = MicropaymentMsg::new(2.0, 3, "d-B", &sample_metadata());
        let json = msg.metadata_json().unwrap();
        let parsed: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(parsed["download_index"], "17");
        assert_eq!(parsed["region"], 3);
    }

    #[test]
    fn empty_metadata_has_no_json() {
        let msg = MicropaymentMsg::new(2.0, 3, "d-B", &BTreeMap::new());
        assert!(msg.metadata_json().is_none());
    }
}
