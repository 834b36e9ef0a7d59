use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{NodeError, Result};

const PINATA_PIN_URL: &str = "https://api.pinata.cloud/pinning/pinJSONToIPFS";

/// Encode a raw 32-byte sha256 as a CIDv0 string: base58 of the
/// multihash prefix `0x12 0x20` followed by the hash.
pub fn cid_from_hash(hash: &[u8; 32]) -> String {
    let mut bytes = Vec::with_capacity(34);
    bytes.push(0x12);
    bytes.push(0x20);
    bytes.extend_from_slice(hash);
    bs58::encode(bytes).into_string()
}

/// Decode a CIDv0 string back into its 32-byte hash, rejecting anything
/// that is not a sha256 multihash.
pub fn hash_from_cid(cid: &str) -> Result<[u8; 32]> {
    let bytes = bs58::decode(cid)
        .into_vec()
        .map_err(|e| NodeError::InvalidAccountData(format!("cid not base58: {e}")))?;
    if bytes.len() != 34 || bytes[0] != 0x12 || bytes[1] != 0x20 {
        return Err(NodeError::InvalidAccountData(format!(
            "`{cid}` is not a CIDv0 sha256 multihash"
        )));
    }
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&bytes[2..]);
    Ok(hash)
}

/// A job's declarative pipeline as downloaded from IPFS. The body is JSON
/// with a `pipeline` member holding either a YAML document or an inline
/// object; both parse into the same structured value.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDefinition {
    pub pipeline: Value,
    pub raw: Value,
}

/// HTTP gateway client; the node runs no IPFS daemon of its own.
#[derive(Clone)]
pub struct IpfsClient {
    gateway_url: String,
    pin_url: String,
    pinata_jwt: Option<String>,
    http: Client,
}

impl IpfsClient {
    pub fn new(gateway_url: impl Into<String>, pinata_jwt: Option<String>, http: Client) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            pin_url: PINATA_PIN_URL.to_string(),
            pinata_jwt,
            http,
        }
    }

    pub fn with_pin_url(mut self, pin_url: impl Into<String>) -> Self {
        self.pin_url = pin_url.into();
        self
    }

    pub async fn fetch_json(&self, cid: &str) -> Result<Value> {
        let url = format!("{}/{cid}", self.gateway_url);
        debug!(%url, "ipfs download");
        let response = self.http.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NodeError::HttpStatus(status));
        }
        Ok(response.json().await?)
    }

    /// Download a job blob and parse its pipeline.
    pub async fn fetch_job(&self, cid: &str) -> Result<JobDefinition> {
        let raw = self.fetch_json(cid).await?;
        let pipeline = match raw.get("pipeline") {
            Some(Value::String(yaml)) => {
                let parsed: serde_yaml::Value = serde_yaml::from_str(yaml)?;
                serde_json::to_value(parsed)?
            }
            Some(inline) => inline.clone(),
            None => {
                return Err(NodeError::InvalidAccountData(format!(
                    "job `{cid}` has no pipeline"
                )))
            }
        };
        Ok(JobDefinition { pipeline, raw })
    }

    /// Pin a JSON document through Pinata, returning the new CID. Used to
    /// publish result artifacts.
    pub async fn pin_json(&self, content: &Value) -> Result<String> {
        let jwt = self
            .pinata_jwt
            .as_deref()
            .ok_or_else(|| NodeError::Config("pinata-jwt not configured".to_string()))?;
        let response = self
            .http
            .post(&self.pin_url)
            .bearer_auth(jwt)
            .json(&serde_json::json!({ "pinataContent": content }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NodeError::HttpStatus(status));
        }
        #[derive(Deserialize)]
        struct PinResponse {
            #[serde(rename = "IpfsHash")]
            ipfs_hash: String,
        }
        let pin: PinResponse = response.json().await?;
        info!(cid = %pin.ipfs_hash, "result pinned");
        Ok(pin.ipfs_hash)
    }
}
