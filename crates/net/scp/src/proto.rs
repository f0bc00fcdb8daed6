//! Protobuf wire structs for the SCP protocols.
//!
//! Hand-annotated `prost` messages; field numbers are part of the wire
//! contract and must not change.

use std::collections::HashMap;

#[derive(Clone, PartialEq, prost::Message)]
pub struct Credentials {
    #[prost(string, tag = "1")]
    pub role: String,
    #[prost(string, tag = "2")]
    pub device_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SignedTxn {
    #[prost(string, tag = "1")]
    pub receiver: String,
    #[prost(double, tag = "2")]
    pub amount: f64,
    #[prost(int32, tag = "3")]
    pub billing_cycle: i32,
    #[prost(string, tag = "4")]
    pub txn_hash: String,
    #[prost(message, optional, tag = "5")]
    pub mtdt: Option<Metadata>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Metadata {
    #[prost(map = "string, message", tag = "1")]
    pub vals: HashMap<String, MtdtVal>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MtdtVal {
    #[prost(bool, tag = "3")]
    pub include_signature: bool,
    #[prost(oneof = "mtdt_val::Val", tags = "1, 2")]
    pub val: Option<mtdt_val::Val>,
}

pub mod mtdt_val {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Val {
        #[prost(int32, tag = "1")]
        IntVal(i32),
        #[prost(string, tag = "2")]
        StrVal(String),
    }
}
