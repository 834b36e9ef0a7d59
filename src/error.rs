use solana_sdk::pubkey::Pubkey;
use thiserror::Error;

/// Errors surfaced by the node library. The work loop treats `Rpc` and
/// `Timeout` as transient; the rest indicate bad configuration or
/// corrupted on-chain data and are logged with context before the
/// iteration is retried.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("rpc transport: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("rpc http status {0}")]
    HttpStatus(reqwest::StatusCode),

    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error("no idl published for program {0}")]
    IdlUnavailable(Pubkey),

    #[error("instruction account `{0}` not resolvable")]
    MissingAccount(String),

    #[error("unknown idl type: {0}")]
    UnknownIdlType(String),

    #[error("account data malformed: {0}")]
    InvalidAccountData(String),

    #[error("no valid bump seed for program derived address")]
    NoValidBump,

    #[error("transaction signing failed: {0}")]
    Signing(String),

    #[error("transaction {signature} failed on chain: {err}")]
    TxFailed { signature: String, err: String },

    #[error("secret `{0}` not found")]
    SecretMissing(String),

    #[error("flow {flow_id} failed: {reason}")]
    FlowFailed { flow_id: String, reason: String },

    #[error("health gate: {0}")]
    HealthGate(String),

    #[error("json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Config(String),
}

impl NodeError {
    /// Transient faults the loop retries on the next tick without
    /// dropping its active flow.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NodeError::Transport(_)
                | NodeError::HttpStatus(_)
                | NodeError::Rpc { .. }
                | NodeError::Timeout(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, NodeError>;
