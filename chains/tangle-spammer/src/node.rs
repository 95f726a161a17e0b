//! Node API - the remote ledger node as seen by the spammer
//!
//! Every interaction with a node goes through the [`NodeApi`] trait so the
//! engine can run against an in-memory node in tests. [`HttpNodeApi`] speaks
//! the IRI JSON command protocol: each call is a `POST` of
//! `{"command": "<name>", ...}` with the `X-IOTA-API-Version: 1` header.
//!
//! # Error Mapping
//!
//! | Failure | Error |
//! |---|---|
//! | request timed out | [`NetworkError::Timeout`] |
//! | connection refused / DNS | [`NetworkError::ConnectionFailed`] |
//! | non-2xx with `{"error": ...}` body | [`NetworkError::NodeError`] |
//! | other non-2xx | [`NetworkError::HttpError`] |
//! | undecodable body | [`NetworkError::InvalidResponse`] |

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use core_logic::{ConfigError, NetworkError, Node, SecurityLevel};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::bundle::{prepare_zero_value_bundle, Transfer};
use crate::transaction::Transaction;

pub const API_VERSION_HEADER: &str = "X-IOTA-API-Version";
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Tip pair suggested by the node's tip selection.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TipHashes {
    pub trunk_transaction: String,
    pub branch_transaction: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeInfo {
    pub latest_milestone: String,
    pub latest_solid_subtangle_milestone: String,
    #[serde(default)]
    pub app_version: String,
}

#[async_trait]
pub trait NodeApi: Send + Sync {
    fn url(&self) -> &str;

    async fn get_tips(&self) -> Result<Vec<String>>;

    /// Bodies of the given transactions, in request order.
    async fn get_trytes(&self, hashes: &[String]) -> Result<Vec<Transaction>>;

    async fn get_transactions_to_approve(&self, depth: u32) -> Result<TipHashes>;

    async fn get_node_info(&self) -> Result<NodeInfo>;

    /// Builds an unsealed bundle for the transfers. Zero-value bundles need no
    /// signing, so the default builds them locally.
    async fn prepare_transfers(
        &self,
        _seed: &str,
        transfers: &[Transfer],
        _security: SecurityLevel,
    ) -> Result<Vec<Transaction>> {
        prepare_zero_value_bundle(transfers, Utc::now().timestamp())
    }

    /// Remote proof-of-work. Returns the sealed bundle in index order.
    async fn attach_to_tangle(
        &self,
        trunk: &str,
        branch: &str,
        mwm: u32,
        transactions: &[Transaction],
    ) -> Result<Vec<Transaction>>;

    async fn broadcast_transactions(&self, transactions: &[Transaction]) -> Result<()>;

    /// Whether each transaction is referenced by the latest solid milestone.
    async fn get_latest_inclusion(&self, hashes: &[String]) -> Result<Vec<bool>>;
}

/// Creates node clients. Swapped for an in-memory connector in tests.
pub trait Connector: Send + Sync {
    fn connect(&self, node: &Node) -> Result<Arc<dyn NodeApi>>;
}

#[derive(Debug, Clone)]
pub struct HttpConnector {
    request_timeout: Duration,
}

impl HttpConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

impl Default for HttpConnector {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl Connector for HttpConnector {
    fn connect(&self, node: &Node) -> Result<Arc<dyn NodeApi>> {
        Ok(Arc::new(HttpNodeApi::new(&node.url, self.request_timeout)?))
    }
}

#[derive(Debug, Clone)]
pub struct HttpNodeApi {
    url: String,
    client: Client,
    timeout: Duration,
}

#[derive(Deserialize)]
struct HashesResponse {
    hashes: Vec<String>,
}

#[derive(Deserialize)]
struct TrytesResponse {
    trytes: Vec<String>,
}

#[derive(Deserialize)]
struct StatesResponse {
    states: Vec<bool>,
}

#[derive(Deserialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HashesRequest<'a> {
    hashes: &'a [String],
}

#[derive(Serialize)]
struct DepthRequest {
    depth: u32,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AttachRequest<'a> {
    trunk_transaction: &'a str,
    branch_transaction: &'a str,
    min_weight_magnitude: u32,
    trytes: Vec<String>,
}

#[derive(Serialize)]
struct TrytesRequest {
    trytes: Vec<String>,
}

#[derive(Serialize)]
struct InclusionRequest<'a> {
    transactions: &'a [String],
    tips: Vec<String>,
}

#[derive(Serialize)]
struct Empty {}

/// Merges the command name into a serialized request body.
fn command_payload<T: Serialize>(command: &str, body: &T) -> Result<Value> {
    let mut payload = serde_json::to_value(body).context("Failed to encode request")?;
    if let Value::Object(map) = &mut payload {
        map.insert("command".to_string(), Value::String(command.to_string()));
    }
    Ok(payload)
}

fn parse_transactions(trytes: &[String]) -> Result<Vec<Transaction>> {
    trytes
        .iter()
        .map(|t| Transaction::from_trytes(t))
        .collect()
}

impl HttpNodeApi {
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        url::Url::parse(url).map_err(|_| ConfigError::InvalidNodeUrl {
            url: url.to_string(),
        })?;

        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            url: url.to_string(),
            client,
            timeout,
        })
    }

    async fn call<Req, Resp>(&self, command: &str, body: &Req) -> Result<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let payload = command_payload(command, body)?;
        debug!("{} -> {}", self.url, command);

        let response = self
            .client
            .post(&self.url)
            .header(API_VERSION_HEADER, "1")
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NetworkError::Timeout {
                        timeout_ms: self.timeout.as_millis() as u64,
                        endpoint: self.url.clone(),
                    }
                } else {
                    NetworkError::ConnectionFailed {
                        endpoint: self.url.clone(),
                        reason: e.to_string(),
                    }
                }
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| NetworkError::InvalidResponse {
                endpoint: self.url.clone(),
                reason: e.to_string(),
            })?;

        if !status.is_success() {
            let err = match serde_json::from_str::<ErrorResponse>(&text) {
                Ok(body) => NetworkError::NodeError {
                    endpoint: self.url.clone(),
                    command: command.to_string(),
                    message: body.error,
                },
                Err(_) => NetworkError::HttpError {
                    status_code: status.as_u16(),
                    endpoint: self.url.clone(),
                    body: text,
                },
            };
            return Err(err.into());
        }

        let decoded = serde_json::from_str(&text).map_err(|e| NetworkError::InvalidResponse {
            endpoint: self.url.clone(),
            reason: format!("{}: {}", command, e),
        })?;
        Ok(decoded)
    }
}

#[async_trait]
impl NodeApi for HttpNodeApi {
    fn url(&self) -> &str {
        &self.url
    }

    async fn get_tips(&self) -> Result<Vec<String>> {
        let resp: HashesResponse = self.call("getTips", &Empty {}).await?;
        Ok(resp.hashes)
    }

    async fn get_trytes(&self, hashes: &[String]) -> Result<Vec<Transaction>> {
        let resp: TrytesResponse = self.call("getTrytes", &HashesRequest { hashes }).await?;
        parse_transactions(&resp.trytes)
    }

    async fn get_transactions_to_approve(&self, depth: u32) -> Result<TipHashes> {
        self.call("getTransactionsToApprove", &DepthRequest { depth })
            .await
    }

    async fn get_node_info(&self) -> Result<NodeInfo> {
        self.call("getNodeInfo", &Empty {}).await
    }

    async fn attach_to_tangle(
        &self,
        trunk: &str,
        branch: &str,
        mwm: u32,
        transactions: &[Transaction],
    ) -> Result<Vec<Transaction>> {
        // The node chains in list order, so the last index goes first.
        let request = AttachRequest {
            trunk_transaction: trunk,
            branch_transaction: branch,
            min_weight_magnitude: mwm,
            trytes: transactions.iter().rev().map(|tx| tx.to_trytes()).collect(),
        };
        let resp: TrytesResponse = self.call("attachToTangle", &request).await?;
        let mut sealed = parse_transactions(&resp.trytes)?;
        sealed.sort_by_key(|tx| tx.current_index);
        Ok(sealed)
    }

    async fn broadcast_transactions(&self, transactions: &[Transaction]) -> Result<()> {
        let request = TrytesRequest {
            trytes: transactions.iter().map(|tx| tx.to_trytes()).collect(),
        };
        let _: Value = self.call("broadcastTransactions", &request).await?;
        Ok(())
    }

    async fn get_latest_inclusion(&self, hashes: &[String]) -> Result<Vec<bool>> {
        let info = self.get_node_info().await?;
        let request = InclusionRequest {
            transactions: hashes,
            tips: vec![info.latest_solid_subtangle_milestone],
        };
        let resp: StatesResponse = self.call("getInclusionStates", &request).await?;
        Ok(resp.states)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_payload_merges_name() {
        let payload = command_payload("getTransactionsToApprove", &DepthRequest { depth: 3 }).unwrap();
        assert_eq!(payload["command"], "getTransactionsToApprove");
        assert_eq!(payload["depth"], 3);

        let attach = AttachRequest {
            trunk_transaction: "T",
            branch_transaction: "B",
            min_weight_magnitude: 14,
            trytes: vec![],
        };
        let payload = command_payload("attachToTangle", &attach).unwrap();
        assert_eq!(payload["minWeightMagnitude"], 14);
        assert_eq!(payload["trunkTransaction"], "T");
    }

    #[test]
    fn test_response_shapes() {
        let tips: TipHashes = serde_json::from_str(
            r#"{"trunkTransaction":"AAA","branchTransaction":"BBB","duration":4}"#,
        )
        .unwrap();
        assert_eq!(tips.trunk_transaction, "AAA");

        let info: NodeInfo = serde_json::from_str(
            r#"{"latestMilestone":"M","latestSolidSubtangleMilestone":"S","appName":"IRI"}"#,
        )
        .unwrap();
        assert_eq!(info.latest_solid_subtangle_milestone, "S");
        assert_eq!(info.app_version, "");
    }

    #[test]
    fn test_rejects_invalid_url() {
        let err = HttpNodeApi::new("not a url", DEFAULT_REQUEST_TIMEOUT).unwrap_err();
        assert!(err.to_string().contains("Invalid node URL"));
    }

    #[tokio::test]
    async fn test_default_prepare_transfers_is_local() {
        let api = HttpNodeApi::new("http://127.0.0.1:14265", DEFAULT_REQUEST_TIMEOUT).unwrap();
        let transfers = [Transfer::zero_value(&"A".repeat(81), "TAG", "")];
        let bundle = api
            .prepare_transfers("SEED", &transfers, SecurityLevel::Medium)
            .await
            .unwrap();
        assert_eq!(bundle.len(), 1);
        assert_eq!(bundle[0].address, "A".repeat(81));
    }
}
