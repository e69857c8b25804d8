//! HTTP implementation of the chain capabilities
//!
//! Queries go to the chain's REST gateway. Transactions are built and
//! broadcast through a signing gateway holding the account key; failures are
//! reported with the ABCI code embedded as `error code: 'N'` so the
//! submission engine can classify them.

use super::{ChainError, ChainMessage, ChainQuery, Registrar, TxClient, TxHandle, TxOptions, TxResponse};
use crate::bundle::ValueBundle;
use crate::types::{BlockHeight, Role, TopicId};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RestClientConfig {
    /// Chain REST gateway, e.g. `http://localhost:1317`
    pub api_url: String,
    /// Signing gateway; transactions are unavailable without it
    pub tx_gateway: Option<String>,
    /// Emissions module API version used in query paths
    pub emissions_version: String,
    pub request_timeout: Duration,
}

pub struct RestChainClient {
    http: reqwest::Client,
    config: RestClientConfig,
    address: String,
}

impl RestChainClient {
    pub fn new(config: RestClientConfig, address: impl Into<String>) -> Result<Self, ChainError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| ChainError::Transport(e.to_string()))?;
        Ok(Self {
            http,
            config,
            address: address.into(),
        })
    }

    fn emissions_url(&self, path: &str) -> String {
        format!(
            "{}/emissions/{}/{}",
            self.config.api_url.trim_end_matches('/'),
            self.config.emissions_version,
            path
        )
    }

    fn gateway_url(&self, path: &str) -> Result<String, ChainError> {
        let base = self
            .config
            .tx_gateway
            .as_deref()
            .ok_or_else(|| ChainError::Transport("no tx gateway configured".to_string()))?;
        Ok(format!("{}/{}", base.trim_end_matches('/'), path))
    }

    fn map_err(&self, err: reqwest::Error) -> ChainError {
        if err.is_timeout() {
            ChainError::Timeout(self.config.request_timeout)
        } else if err.is_decode() {
            ChainError::Decode(err.to_string())
        } else {
            ChainError::Transport(err.to_string())
        }
    }

    async fn read<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T, ChainError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
                return Err(ChainError::Unavailable {
                    status: status.as_u16(),
                    body,
                });
            }
            return Err(ChainError::Rejected(format!("HTTP {}: {}", status.as_u16(), body)));
        }
        response.json::<T>().await.map_err(|e| self.map_err(e))
    }

    async fn get<T: DeserializeOwned>(&self, url: String) -> Result<T, ChainError> {
        debug!(url = %url, "chain query");
        let response = self.http.get(&url).send().await.map_err(|e| self.map_err(e))?;
        self.read(response).await
    }

    async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(&self, url: String, body: &B) -> Result<T, ChainError> {
        let response = self
            .http
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_err(e))?;
        self.read(response).await
    }
}

// Cosmos REST encodes 64-bit integers as strings
#[derive(Deserialize)]
#[serde(untagged)]
enum IntRepr {
    Str(String),
    Num(i64),
}

fn de_int<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i128, D::Error> {
    match IntRepr::deserialize(deserializer)? {
        IntRepr::Num(n) => Ok(i128::from(n)),
        IntRepr::Str(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
struct NonceEntry {
    #[serde(deserialize_with = "de_int")]
    block_height: i128,
}

#[derive(Deserialize)]
struct NonceList<T> {
    #[serde(default = "Vec::new")]
    nonces: Vec<T>,
}

impl<T> Default for NonceList<T> {
    fn default() -> Self {
        Self { nonces: Vec::new() }
    }
}

#[derive(Deserialize)]
struct WorkerNoncesResponse {
    #[serde(default)]
    nonces: Option<NonceList<NonceEntry>>,
}

#[derive(Deserialize)]
struct ReputerNonceEntry {
    reputer_nonce: Option<NonceEntry>,
}

#[derive(Deserialize)]
struct ReputerNoncesResponse {
    #[serde(default)]
    nonces: Option<NonceList<ReputerNonceEntry>>,
}

#[derive(Deserialize)]
struct NetworkInferencesResponse {
    network_inferences: Option<ValueBundle>,
}

#[derive(Deserialize)]
struct RegisteredResponse {
    is_registered: bool,
}

#[derive(Deserialize)]
struct StakeResponse {
    #[serde(deserialize_with = "de_int")]
    amount: i128,
}

#[derive(Serialize)]
struct BuildRequest<'a> {
    messages: [&'a ChainMessage; 1],
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    fees: Option<String>,
}

#[derive(Deserialize)]
struct BuildResponse {
    #[serde(deserialize_with = "de_int")]
    gas_estimate: i128,
    #[serde(deserialize_with = "de_int")]
    sequence: i128,
    tx_bytes: String,
}

#[derive(Serialize)]
struct BroadcastRequest {
    tx_bytes: String,
}

#[derive(Deserialize)]
struct BroadcastResponse {
    #[serde(default)]
    tx_hash: String,
    #[serde(default)]
    code: u32,
    #[serde(default)]
    raw_log: String,
}

fn to_height(raw: i128) -> Result<BlockHeight, ChainError> {
    BlockHeight::try_from(raw).map_err(|_| ChainError::Decode(format!("block height {} out of range", raw)))
}

fn to_u64(raw: i128, field: &str) -> Result<u64, ChainError> {
    u64::try_from(raw).map_err(|_| ChainError::Decode(format!("{} {} out of range", field, raw)))
}

#[async_trait]
impl ChainQuery for RestChainClient {
    async fn latest_open_worker_nonce(&self, topic_id: TopicId) -> Result<Option<BlockHeight>, ChainError> {
        let response: WorkerNoncesResponse = self
            .get(self.emissions_url(&format!("unfulfilled_worker_nonces/{}", topic_id)))
            .await?;
        let latest = response
            .nonces
            .unwrap_or_default()
            .nonces
            .into_iter()
            .map(|n| n.block_height)
            .max();
        latest.map(to_height).transpose()
    }

    async fn oldest_open_reputer_nonce(&self, topic_id: TopicId) -> Result<Option<BlockHeight>, ChainError> {
        let response: ReputerNoncesResponse = self
            .get(self.emissions_url(&format!("unfulfilled_reputer_nonces/{}", topic_id)))
            .await?;
        let oldest = response
            .nonces
            .unwrap_or_default()
            .nonces
            .into_iter()
            .filter_map(|n| n.reputer_nonce.map(|r| r.block_height))
            .min();
        oldest.map(to_height).transpose()
    }

    async fn aggregated_value_bundle(
        &self,
        topic_id: TopicId,
        nonce: BlockHeight,
    ) -> Result<ValueBundle, ChainError> {
        let response: NetworkInferencesResponse = self
            .get(self.emissions_url(&format!(
                "network_inferences/{}/last_inference/{}",
                topic_id, nonce
            )))
            .await?;
        response
            .network_inferences
            .ok_or_else(|| ChainError::Decode("missing network_inferences".to_string()))
    }
}

#[async_trait]
impl TxClient for RestChainClient {
    async fn build_transaction(
        &self,
        message: &ChainMessage,
        options: &TxOptions,
    ) -> Result<TxHandle, ChainError> {
        let request = BuildRequest {
            messages: [message],
            sequence: options.sequence,
            fees: options.fees.as_ref().map(|c| c.to_string()),
        };
        let response: BuildResponse = self.post(self.gateway_url("tx/build")?, &request).await?;
        let tx_bytes = STANDARD
            .decode(response.tx_bytes)
            .map_err(|e| ChainError::Decode(format!("tx_bytes: {}", e)))?;
        Ok(TxHandle {
            gas: to_u64(response.gas_estimate, "gas_estimate")?,
            sequence: to_u64(response.sequence, "sequence")?,
            tx_bytes,
        })
    }

    async fn broadcast(&self, tx: &TxHandle) -> Result<TxResponse, ChainError> {
        let request = BroadcastRequest {
            tx_bytes: STANDARD.encode(&tx.tx_bytes),
        };
        let response: BroadcastResponse = self.post(self.gateway_url("tx/broadcast")?, &request).await?;
        if response.code != 0 {
            return Err(ChainError::Rejected(format!(
                "broadcast failed with error code: '{}': {}",
                response.code, response.raw_log
            )));
        }
        Ok(TxResponse {
            tx_hash: response.tx_hash,
        })
    }
}

#[async_trait]
impl Registrar for RestChainClient {
    async fn ensure_registered(&self, role: Role, topic_id: TopicId) -> Result<bool, ChainError> {
        let path = match role {
            Role::Worker => format!("worker_registered/{}/{}", topic_id, self.address),
            Role::Reputer => format!("reputer_registered/{}/{}", topic_id, self.address),
        };
        let response: RegisteredResponse = self.get(self.emissions_url(&path)).await?;
        if !response.is_registered {
            warn!(
                topic_id,
                role = %role,
                address = %self.address,
                "address is not registered on topic; register it before starting the node"
            );
        }
        Ok(response.is_registered)
    }

    async fn ensure_staked(&self, topic_id: TopicId, min_stake: u128) -> Result<bool, ChainError> {
        let response: StakeResponse = self
            .get(self.emissions_url(&format!(
                "stake_reputer_in_topic/{}/{}",
                self.address, topic_id
            )))
            .await?;
        let stake = u128::try_from(response.amount).unwrap_or(0);
        if stake < min_stake {
            warn!(topic_id, stake, min_stake, "reputer stake below configured minimum");
            return Ok(false);
        }
        Ok(true)
    }
}
