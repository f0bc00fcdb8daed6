//! Streamspace Consumption Protocol (SCP) core.
//!
//! A light client fetching a file from a permissioned swarm continuously
//! proves consumption to the serving peers: every block received grows a
//! per-peer invoice, and signed micropayment messages are dispatched at a
//! fair-queued rate. This crate contains the whole accounting machine:
//!
//! - [`ledger`]: per-(cycle, peer) counters with pending/cleared lifecycle
//! - [`queue`]: fair per-peer task queue with topic-aware merging
//! - [`crypto`]: deterministic sign/verify over micropayment transactions
//! - [`engine`]: handshake state, byte accounting, invoice generation,
//!   billing-cycle rollover and the dispatch worker
//! - [`service`]: the shim wrapping the block-exchange network that feeds
//!   the engine and writes framed messages to peer streams
//!
//! The transport, DHT and block-exchange protocol live behind the narrow
//! traits in [`api`].

pub mod api;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod ledger;
pub mod queue;
pub mod service;

pub use api::{BlockBatch, BlockExchangeNetwork, BlockExchangeReceiver, PeerKeystore, SwarmHost};
pub use config::{ConfigError, ScpConfig, StreamspaceConfig};
pub use engine::{Engine, EngineOptions, Envelope, Receipt};
pub use service::{Hook, Scp, ScpParams, Stat};
