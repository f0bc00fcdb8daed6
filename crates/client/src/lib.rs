//! Streamspace light-client fetch driver.
//!
//! A thin consumer of the SCP core: it resolves a sharable link through the
//! bootstrap HTTP API, joins the permissioned swarm, installs the SCP shim
//! around the block exchange, and streams the file to disk while the engine
//! pays for consumed blocks. The transport itself plugs in through
//! [`stack::StackBuilder`].

pub mod bootstrap;
pub mod fetch;
pub mod output;
pub mod progress;
pub mod stack;
pub mod swarm_key;

pub use fetch::{ClientError, FetchOutcome, LightClient, DEFAULT_TIMEOUT};
pub use output::Out;
