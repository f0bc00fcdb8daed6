//! Client for the bootstrap HTTP API.
//!
//! Two endpoints: `/v1/fetch` resolves a sharable link into a fetch cookie
//! (file hash, filename, leader peers, swarm key, rate), `/v1/complete`
//! acknowledges a finished download.

use serde::Deserialize;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("service returned {status}: {body}")]
    Service { status: u16, body: String },
}

/// A serving peer returned by the bootstrap API.
#[derive(Debug, Clone, Deserialize)]
pub struct LeaderInfo {
    pub id: String,
    #[serde(default)]
    pub addrs: Vec<String>,
}

/// Server-issued fetch handle.
#[derive(Debug, Clone, Deserialize)]
pub struct Cookie {
    pub id: String,
    #[serde(default)]
    pub leaders: Vec<LeaderInfo>,
    #[serde(rename = "downloadindex")]
    pub download_index: i32,
    pub filename: String,
    pub hash: String,
    #[serde(default)]
    pub link: String,
}

/// Everything needed to join the swarm and fetch the file.
#[derive(Debug, Clone, Deserialize)]
pub struct FetchInfo {
    pub cookie: Cookie,
    #[serde(with = "base64_bytes")]
    pub swarm_key: Vec<u8>,
    pub rate: String,
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[derive(serde::Serialize)]
struct FetchRequest<'a> {
    public_key: &'a str,
    src_ip: &'a str,
}

pub struct BootstrapClient {
    base_url: String,
    http: reqwest::Client,
}

impl BootstrapClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            http: reqwest::Client::new(),
        }
    }

    /// Resolve a sharable link. `public_key` is the base64 protobuf encoding
    /// of the client's public key; `src_ip` the client's dotted-quad source
    /// address.
    pub async fn fetch(
        &self,
        sharable: &str,
        public_key: &str,
        src_ip: &str,
    ) -> Result<FetchInfo, BootstrapError> {
        let url = format!("{}/v1/fetch", self.base_url);
        let response = self
            .http
            .post(&url)
            .query(&[("link", sharable)])
            .json(&FetchRequest { public_key, src_ip })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BootstrapError::Service {
                status: status.as_u16(),
                body,
            });
        }
        let info = response.json::<FetchInfo>().await?;
        debug!(file = %info.cookie.filename, leaders = info.cookie.leaders.len(),
            "resolved sharable link");
        Ok(info)
    }

    /// Acknowledge a completed download. Best effort; the caller logs and
    /// ignores failures.
    pub async fn complete(&self, cookie_id: &str, elapsed_secs: u64) -> Result<(), BootstrapError> {
        let url = format!("{}/v1/complete", self.base_url);
        let elapsed = elapsed_secs.to_string();
        let response = self
            .http
            .post(&url)
            .query(&[("cookie", cookie_id), ("time", elapsed.as_str())])
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BootstrapError::Service {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_info_deserializes() {
        let raw = serde_json::json!({
            "cookie": {
                "id": "ck-1",
                "leaders": [
                    {"id": "12D3KooWExample", "addrs": ["/ip4/10.0.0.1/tcp/4001"]}
                ],
                "downloadindex": 17,
                "filename": "movie.mkv",
                "hash": "QmHash",
                "link": "share-1"
            },
            "swarm_key": "L2tleS9zd2FybS9wc2svMS4wLjAv",
            "rate": "0.000001"
        });
        let info: FetchInfo = serde_json::from_value(raw).unwrap();
        assert_eq!(info.cookie.download_index, 17);
        assert_eq!(info.cookie.leaders.len(), 1);
        assert_eq!(info.rate, "0.000001");
        assert!(info.swarm_key.starts_with(b"/key/swarm/psk/1.0.0/"));
    }
}
