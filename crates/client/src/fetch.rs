//! Fetch orchestration.
//!
//! [`LightClient`] ties the pieces together: resolve the sharable link
//! through the bootstrap API, create the destination file, decode the swarm
//! key, build the p2p stack, install the SCP shim, connect to leader peers,
//! stream the file to disk, and acknowledge completion. The whole run is
//! bounded by the caller-supplied timeout.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use libp2p_identity::Keypair;
use serde_json::json;
use ss_net_scp::{MetadataValue, SIGNED_METADATA_KEY};
use ss_scp::{Scp, ScpParams};
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bootstrap::{BootstrapClient, BootstrapError, FetchInfo};
use crate::output::{
    MSG_DOWNLOAD_SUCCESS, MSG_META_INFO, STATUS_DESTINATION, STATUS_INTERNAL, STATUS_SERVICE,
    STATUS_TIMEOUT,
};
use crate::progress::ProgressUpdater;
use crate::stack::{FetchError, StackBuilder, StackError};
use crate::swarm_key::{decode_v1_psk, SwarmKeyError};

/// Leaders we try to hold connections to before settling for fewer.
const PEER_THRESHOLD: usize = 5;

/// How long to keep asking the bootstrap API for additional leaders.
const LEADER_TOPUP_WINDOW: Duration = Duration::from_secs(15);

/// Grace period for outstanding micropayments after the last byte.
const MICROPAYMENT_DRAIN: Duration = Duration::from_secs(5);

const PROGRESS_POLL: Duration = Duration::from_millis(500);

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(45 * 60);

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Failed getting metadata")]
    Metadata(#[source] BootstrapError),

    #[error("Failed creating destination file")]
    Destination(#[source] std::io::Error),

    #[error("Failed decoding swarm key provided")]
    SwarmKey(#[source] SwarmKeyError),

    #[error("Failed setting up p2p peer")]
    Network(#[source] StackError),

    #[error("Failed setting up light client")]
    Scp(#[source] ss_scp::ConfigError),

    #[error("Failed getting file")]
    Fetch(#[source] FetchError),

    #[error("Failed writing to destination")]
    Write(#[source] std::io::Error),

    #[error("Unable to fetch data")]
    Timeout,
}

impl ClientError {
    /// Driver status code for the CLI envelope.
    pub fn status(&self) -> i32 {
        match self {
            ClientError::Destination(_) => STATUS_DESTINATION,
            ClientError::Metadata(_) | ClientError::Network(_) => STATUS_SERVICE,
            ClientError::Timeout => STATUS_TIMEOUT,
            _ => STATUS_INTERNAL,
        }
    }

    /// Underlying cause, for the `details` field.
    pub fn details(&self) -> String {
        use std::error::Error;
        self.source().map(|e| e.to_string()).unwrap_or_default()
    }
}

/// What a successful run hands back to the CLI.
#[derive(Debug)]
pub struct FetchOutcome {
    pub message: String,
    pub data: Option<serde_json::Value>,
}

pub struct LightClient {
    destination: PathBuf,
    timeout: Duration,
    api: BootstrapClient,
    keypair: Keypair,
    stack_builder: Arc<dyn StackBuilder>,
    src_ip: String,
}

impl LightClient {
    /// A client with a fresh ephemeral identity.
    pub fn new(
        destination: impl Into<PathBuf>,
        api_base: &str,
        timeout: Duration,
        stack_builder: Arc<dyn StackBuilder>,
    ) -> Self {
        Self {
            destination: destination.into(),
            timeout,
            api: BootstrapClient::new(api_base),
            keypair: Keypair::generate_ed25519(),
            stack_builder,
            src_ip: "0.0.0.0".to_owned(),
        }
    }

    pub fn with_src_ip(mut self, src_ip: impl Into<String>) -> Self {
        self.src_ip = src_ip.into();
        self
    }

    /// Run the fetch. With `only_info` the metadata is returned without
    /// downloading anything.
    pub async fn start(
        &self,
        sharable: &str,
        only_info: bool,
        progress: Option<Arc<dyn ProgressUpdater>>,
    ) -> Result<FetchOutcome, ClientError> {
        match tokio::time::timeout(self.timeout, self.run(sharable, only_info, progress)).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout),
        }
    }

    async fn run(
        &self,
        sharable: &str,
        only_info: bool,
        progress: Option<Arc<dyn ProgressUpdater>>,
    ) -> Result<FetchOutcome, ClientError> {
        let started = Instant::now();
        let public_key = BASE64.encode(self.keypair.public().encode_protobuf());

        let info = self
            .api
            .fetch(sharable, &public_key, &self.src_ip)
            .await
            .map_err(ClientError::Metadata)?;
        info!(file = %info.cookie.filename, hash = %info.cookie.hash,
            leaders = info.cookie.leaders.len(), "got fetch metadata");

        if only_info {
            return Ok(FetchOutcome {
                message: MSG_META_INFO.to_owned(),
                data: Some(info_json(&info)),
            });
        }

        let dst_path = self.destination.join(&info.cookie.filename);
        let mut dst = tokio::fs::File::create(&dst_path)
            .await
            .map_err(ClientError::Destination)?;

        let psk = decode_v1_psk(&info.swarm_key).map_err(ClientError::SwarmKey)?;

        // All SCP workers die with this token when the run ends, times out,
        // or fails.
        let token = CancellationToken::new();
        let _stop_workers = token.clone().drop_guard();

        let stack = self
            .stack_builder
            .build(&self.keypair, psk)
            .await
            .map_err(ClientError::Network)?;

        let device_id = format!("lc_{}", stack.host.local_peer_id().to_base58());
        let mut metadata = BTreeMap::new();
        metadata.insert(
            SIGNED_METADATA_KEY.to_owned(),
            MetadataValue::Str(info.cookie.download_index.to_string()),
        );
        let scp = Scp::with_params(
            token.clone(),
            Arc::clone(&stack.host),
            Arc::clone(&stack.keystore),
            Arc::clone(&stack.network),
            ScpParams {
                device_id,
                role: "light-client".to_owned(),
                metadata,
                rate: info.rate.clone(),
            },
        )
        .map_err(ClientError::Scp)?;
        let fetcher = stack.exchange.attach(&scp);

        // Connect to the leaders; keep asking the API for more while below
        // the threshold, and never start the download with zero peers.
        let mut connected = fetcher.connect(&info.cookie.leaders).await;
        let topup_deadline = Instant::now() + LEADER_TOPUP_WINDOW;
        while connected < PEER_THRESHOLD && Instant::now() < topup_deadline {
            tokio::time::sleep(Duration::from_secs(1)).await;
            connected += self.topup_leaders(sharable, &public_key, fetcher.as_ref()).await;
        }
        while connected == 0 {
            warn!("no nodes connected; waiting for more peers");
            tokio::time::sleep(Duration::from_secs(1)).await;
            connected += self.topup_leaders(sharable, &public_key, fetcher.as_ref()).await;
        }
        info!(connected, "connected to peers, starting download");

        let (size, mut reader) = fetcher
            .open(&info.cookie.hash)
            .await
            .map_err(ClientError::Fetch)?;

        if let Some(progress) = progress {
            spawn_progress_poller(dst_path.clone(), size, progress, token.clone());
        }

        tokio::io::copy(&mut reader, &mut dst)
            .await
            .map_err(ClientError::Write)?;
        dst.flush().await.map_err(ClientError::Write)?;

        // Let the engine flush outstanding micropayments before tearing the
        // swarm down.
        tokio::time::sleep(MICROPAYMENT_DRAIN).await;

        let receipts = scp.get_micro_payments().unwrap_or_default();
        let pending = scp.get_pending_micro_payments().unwrap_or_default();
        let stats = scp.stats();

        if let Err(e) = self
            .api
            .complete(&info.cookie.id, started.elapsed().as_secs())
            .await
        {
            warn!(error = %e, "failed acknowledging download completion");
        }

        Ok(FetchOutcome {
            message: MSG_DOWNLOAD_SUCCESS.to_owned(),
            data: Some(json!({
                "file": dst_path.display().to_string(),
                "connected": connected,
                "receipts": receipts,
                "pending_receipts": pending,
                "stats": stats,
            })),
        })
    }

    async fn topup_leaders(
        &self,
        sharable: &str,
        public_key: &str,
        fetcher: &dyn crate::stack::FileFetcher,
    ) -> usize {
        match self.api.fetch(sharable, public_key, &self.src_ip).await {
            Ok(fresh) if !fresh.cookie.leaders.is_empty() => {
                info!(new = fresh.cookie.leaders.len(), "got new leaders");
                fetcher.connect(&fresh.cookie.leaders).await
            }
            Ok(_) => 0,
            Err(e) => {
                debug!(error = %e, "leader top-up failed");
                0
            }
        }
    }
}

fn info_json(info: &FetchInfo) -> serde_json::Value {
    json!({
        "filename": info.cookie.filename,
        "hash": info.cookie.hash,
        "downloadindex": info.cookie.download_index,
        "link": info.cookie.link,
        "leaders": info.cookie.leaders.iter().map(|l| l.id.clone()).collect::<Vec<_>>(),
        "rate": info.rate,
    })
}

fn spawn_progress_poller(
    path: PathBuf,
    size: u64,
    progress: Arc<dyn ProgressUpdater>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            if token.is_cancelled() {
                return;
            }
            if let Ok(meta) = tokio::fs::metadata(&path).await {
                let percent = if size == 0 {
                    100
                } else {
                    (meta.len().saturating_mul(100) / size).min(100) as u8
                };
                progress.update_progress(percent);
                if percent >= 100 {
                    return;
                }
            }
            tokio::time::sleep(PROGRESS_POLL).await;
        }
    });
}
