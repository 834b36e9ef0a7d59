use tracing::{info, warn};

use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::rpc::RpcClient;
use crate::secrets::SecretsClient;

/// Minimum lamport balance required to pay for transactions.
pub const MINIMUM_SOL: u64 = 100_000_000;

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub sol: u64,
    pub nos: u64,
    pub nft: u64,
    pub secrets_ok: bool,
}

impl HealthReport {
    /// Advisory gate: a failure keeps the work loop from starting but
    /// does not crash the process.
    pub fn gate(&self) -> Result<()> {
        let mut failures = Vec::new();
        if self.sol < MINIMUM_SOL {
            failures.push(format!("sol balance {} below minimum {MINIMUM_SOL}", self.sol));
        }
        if self.nft < 1 {
            failures.push("access nft not held".to_string());
        }
        if !self.secrets_ok {
            failures.push("secrets login failed".to_string());
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(NodeError::HealthGate(failures.join("; ")))
        }
    }
}

/// Read SOL, NOS and access-NFT balances and probe the secrets endpoint.
pub async fn check(
    rpc: &RpcClient,
    config: &NodeConfig,
    secrets: &SecretsClient,
) -> Result<HealthReport> {
    let sol = rpc.get_balance(&config.address).await?;
    let nos = rpc.get_token_account_balance(&config.nos_ata).await?;
    let nft = rpc.get_token_account_balance(&config.nft_ata).await?;
    let secrets_ok = match secrets.login(&config.signer, &config.address, None).await {
        Ok(_) => true,
        Err(e) => {
            warn!(error = %e, "secrets login probe failed");
            false
        }
    };
    Ok(HealthReport { sol, nos, nft, secrets_ok })
}

/// Startup banner summarizing the node's on-chain standing.
pub fn banner(report: &HealthReport, config: &NodeConfig) {
    info!("nosana node {}", config.address);
    info!("  network : {}", config.programs.cluster.name());
    info!("  market  : {}", config.market);
    info!("  sol     : {:.9}", report.sol as f64 / 1e9);
    info!("  nos     : {:.6}", report.nos as f64 / 1e6);
    info!("  nft     : {}", report.nft);
    info!(
        "  secrets : {}",
        if report.secrets_ok { "ok" } else { "unavailable" }
    );
}
