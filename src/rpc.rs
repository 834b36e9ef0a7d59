use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use solana_sdk::hash::Hash;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Signature;
use std::str::FromStr;
use std::time::Duration;
use tracing::trace;

use crate::error::{NodeError, Result};

/// Thin JSON-RPC wrapper over a Solana HTTP endpoint. Carries no state
/// beyond the endpoint URL and the shared HTTP client; retries are the
/// caller's concern.
#[derive(Clone)]
pub struct RpcClient {
    url: String,
    http: Client,
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: &'static str,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// `{context, value}` wrapper most read methods return.
#[derive(Debug, Deserialize)]
struct WithContext<T> {
    value: T,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenAmount {
    pub amount: String,
    pub decimals: u8,
    pub ui_amount: Option<f64>,
}

impl TokenAmount {
    pub fn raw(&self) -> u64 {
        self.amount.parse().unwrap_or(0)
    }
}

#[derive(Debug, Deserialize)]
struct AccountInfoValue {
    data: (String, String),
    #[allow(dead_code)]
    owner: String,
    #[allow(dead_code)]
    lamports: u64,
}

#[derive(Debug, Deserialize)]
struct KeyedAccount {
    pubkey: String,
    account: AccountInfoValue,
}

#[derive(Debug, Deserialize)]
struct BlockhashValue {
    blockhash: String,
}

pub fn default_http_client() -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .map_err(NodeError::from)
}

impl RpcClient {
    pub fn new(url: impl Into<String>, http: Client) -> Self {
        Self { url: url.into(), http }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        trace!(method, %params, "rpc call");
        let request = RpcRequest { jsonrpc: "2.0", id: "1", method, params };
        let response = self.http.post(&self.url).json(&request).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NodeError::HttpStatus(status));
        }
        let body: RpcResponse<T> = response.json().await?;
        if let Some(err) = body.error {
            return Err(NodeError::Rpc { code: err.code, message: err.message });
        }
        body.result.ok_or(NodeError::Rpc {
            code: -1,
            message: "empty rpc result".to_string(),
        })
    }

    /// Lamport balance of an account.
    pub async fn get_balance(&self, address: &Pubkey) -> Result<u64> {
        let res: WithContext<u64> = self
            .call("getBalance", json!([address.to_string()]))
            .await?;
        Ok(res.value)
    }

    /// SPL token balance of a token account. A missing account reads as a
    /// zero balance.
    pub async fn get_token_account_balance(&self, address: &Pubkey) -> Result<u64> {
        let res: Result<WithContext<TokenAmount>> = self
            .call("getTokenAccountBalance", json!([address.to_string()]))
            .await;
        match res {
            Ok(v) => Ok(v.value.raw()),
            Err(NodeError::Rpc { .. }) => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Raw account data, or `None` when the account does not exist.
    pub async fn get_account_info(&self, address: &Pubkey) -> Result<Option<Vec<u8>>> {
        let res: WithContext<Option<AccountInfoValue>> = self
            .call(
                "getAccountInfo",
                json!([address.to_string(), {"encoding": "base64"}]),
            )
            .await?;
        match res.value {
            None => Ok(None),
            Some(info) => {
                let bytes = base64::decode(&info.data.0).map_err(|e| {
                    NodeError::InvalidAccountData(format!("account data not base64: {e}"))
                })?;
                Ok(Some(bytes))
            }
        }
    }

    /// All accounts owned by `program` matching the given memcmp filters.
    /// Filters are `(offset, base58 bytes)` pairs.
    pub async fn get_program_accounts(
        &self,
        program: &Pubkey,
        filters: &[(usize, String)],
    ) -> Result<Vec<(Pubkey, Vec<u8>)>> {
        let filter_json: Vec<Value> = filters
            .iter()
            .map(|(offset, bytes)| json!({"memcmp": {"offset": offset, "bytes": bytes}}))
            .collect();
        let res: Vec<KeyedAccount> = self
            .call(
                "getProgramAccounts",
                json!([
                    program.to_string(),
                    {"encoding": "base64", "filters": filter_json}
                ]),
            )
            .await?;
        res.into_iter()
            .map(|entry| {
                let pubkey = Pubkey::from_str(&entry.pubkey).map_err(|e| {
                    NodeError::InvalidAccountData(format!("bad pubkey in scan: {e}"))
                })?;
                let bytes = base64::decode(&entry.account.data.0).map_err(|e| {
                    NodeError::InvalidAccountData(format!("account data not base64: {e}"))
                })?;
                Ok((pubkey, bytes))
            })
            .collect()
    }

    /// Submit a base64-encoded signed transaction, returning its signature.
    pub async fn send_transaction(&self, wire_base64: &str) -> Result<Signature> {
        let sig: String = self
            .call(
                "sendTransaction",
                json!([wire_base64, {"encoding": "base64"}]),
            )
            .await?;
        Signature::from_str(&sig)
            .map_err(|e| NodeError::InvalidAccountData(format!("bad signature: {e}")))
    }

    /// Confirmed transaction record, or `None` while still pending.
    pub async fn get_transaction(&self, signature: &Signature) -> Result<Option<Value>> {
        self.call(
            "getTransaction",
            json!([
                signature.to_string(),
                {"encoding": "json", "commitment": "confirmed"}
            ]),
        )
        .await
    }

    pub async fn get_latest_blockhash(&self) -> Result<Hash> {
        let res: WithContext<BlockhashValue> = self
            .call("getLatestBlockhash", json!([{"commitment": "finalized"}]))
            .await?;
        Hash::from_str(&res.value.blockhash)
            .map_err(|e| NodeError::InvalidAccountData(format!("bad blockhash: {e}")))
    }
}
