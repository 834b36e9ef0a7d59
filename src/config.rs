use serde::Deserialize;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::Keypair;
use solana_sdk::signer::Signer;
use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{NodeError, Result};
use crate::keys;

// Nosana program ids; Anchor deployments share ids across clusters.
pub const NOS_TOKEN_MINT: &str = "nosXBVoaCTtYdLvKY6Csb4AC8JCdQKKAaWYtx2ZMoo7";
pub const STAKE_PROGRAM: &str = "nosScmHY2uR24Zh751PmGj9ww9QRNHewh9H59AfrTJE";
pub const JOBS_PROGRAM: &str = "nosJhNRqr2bc9g1nfGDcXXTXvYUmxD4cVwy2pMWhrYM";
pub const REWARDS_PROGRAM: &str = "nosRB8DUV67oLNrL45bo2pFLrmsWPiewe2Lk2DRNYCp";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Cluster {
    Mainnet,
    Devnet,
}

impl Cluster {
    pub fn name(&self) -> &'static str {
        match self {
            Cluster::Mainnet => "mainnet",
            Cluster::Devnet => "devnet",
        }
    }

    pub fn default_rpc(&self) -> &'static str {
        match self {
            Cluster::Mainnet => "https://api.mainnet-beta.solana.com",
            Cluster::Devnet => "https://api.devnet.solana.com",
        }
    }
}

/// Operator-supplied settings, loaded from a TOML file with environment
/// overrides for the deployment-varying fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Settings {
    pub solana_network: Cluster,
    #[serde(default)]
    pub rpc_url: Option<String>,
    /// 64-byte ed25519 keypair as a byte-array literal.
    pub solana_private_key: Vec<u8>,
    #[serde(default)]
    pub dummy_private_key: Option<Vec<u8>>,
    pub nosana_market: String,
    /// Mint of the operator's access NFT.
    pub nft: String,
    #[serde(default)]
    pub nft_collection: Option<String>,
    #[serde(default)]
    pub rewards_pool: Option<String>,
    #[serde(default = "default_ipfs_url")]
    pub ipfs_url: String,
    #[serde(default)]
    pub pinata_jwt: Option<String>,
    #[serde(default = "default_poll_delay_ms")]
    pub poll_delay_ms: u64,
    #[serde(default = "default_true")]
    pub start_job_loop: bool,
    #[serde(default = "default_secrets_endpoint")]
    pub secrets_endpoint: String,
    #[serde(default = "default_flow_dir")]
    pub flow_dir: String,
}

fn default_ipfs_url() -> String {
    "https://nosana.mypinata.cloud/ipfs".to_string()
}

fn default_poll_delay_ms() -> u64 {
    5000
}

fn default_true() -> bool {
    true
}

fn default_secrets_endpoint() -> String {
    "https://secrets.k8s.prd.nos.ci".to_string()
}

fn default_flow_dir() -> String {
    "flows".to_string()
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Settings> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let mut settings: Settings = toml::from_str(&raw)
            .map_err(|e| NodeError::Config(format!("settings: {e}")))?;
        settings.apply_env();
        Ok(settings)
    }

    fn apply_env(&mut self) {
        if let Ok(url) = std::env::var("NOSANA_RPC_URL") {
            self.rpc_url = Some(url);
        }
        if let Ok(market) = std::env::var("NOSANA_MARKET") {
            self.nosana_market = market;
        }
        if let Ok(jwt) = std::env::var("PINATA_JWT") {
            self.pinata_jwt = Some(jwt);
        }
        if let Ok(endpoint) = std::env::var("NOSANA_SECRETS_ENDPOINT") {
            self.secrets_endpoint = endpoint;
        }
    }

    pub fn rpc_url(&self) -> String {
        self.rpc_url
            .clone()
            .unwrap_or_else(|| self.solana_network.default_rpc().to_string())
    }
}

/// Program ids and well-known keys of the selected cluster.
#[derive(Debug, Clone)]
pub struct NetworkProfile {
    pub cluster: Cluster,
    pub token_mint: Pubkey,
    pub stake_program: Pubkey,
    pub jobs_program: Pubkey,
    pub rewards_program: Pubkey,
    pub rewards_pool: Pubkey,
    pub collection: Pubkey,
    /// Null-placeholder for optional account slots.
    pub dummy: Pubkey,
}

impl NetworkProfile {
    fn resolve(settings: &Settings, dummy: Pubkey) -> Result<NetworkProfile> {
        let parse = |label: &str, s: &str| {
            Pubkey::from_str(s).map_err(|e| NodeError::Config(format!("{label}: {e}")))
        };
        let collection = match &settings.nft_collection {
            Some(s) => parse("nft-collection", s)?,
            None => dummy,
        };
        let rewards_pool = match &settings.rewards_pool {
            Some(s) => parse("rewards-pool", s)?,
            None => dummy,
        };
        Ok(NetworkProfile {
            cluster: settings.solana_network,
            token_mint: parse("token mint", NOS_TOKEN_MINT)?,
            stake_program: parse("stake program", STAKE_PROGRAM)?,
            jobs_program: parse("jobs program", JOBS_PROGRAM)?,
            rewards_program: parse("rewards program", REWARDS_PROGRAM)?,
            rewards_pool,
            collection,
            dummy,
        })
    }
}

/// Everything derived once at startup: the signer, the market, every PDA
/// the node needs, and the name to pubkey table consumed by IDL-built
/// instructions. Pure over its inputs; no RPC.
pub struct NodeConfig {
    pub signer: Keypair,
    pub address: Pubkey,
    pub market: Pubkey,
    pub programs: NetworkProfile,
    pub nft_mint: Pubkey,
    pub nos_ata: Pubkey,
    pub nft_ata: Pubkey,
    pub stake: Pubkey,
    pub market_vault: Pubkey,
    pub rewards_vault: Pubkey,
    pub rewards_reflection: Pubkey,
    pub accounts: HashMap<String, Pubkey>,
    pub rpc_url: String,
    pub ipfs_url: String,
    pub pinata_jwt: Option<String>,
    pub secrets_endpoint: String,
    pub poll_delay: Duration,
    pub start_job_loop: bool,
    pub flow_dir: String,
}

impl NodeConfig {
    pub fn derive(settings: &Settings) -> Result<NodeConfig> {
        let signer = Keypair::from_bytes(&settings.solana_private_key)
            .map_err(|e| NodeError::Config(format!("solana-private-key: {e}")))?;
        let address = signer.pubkey();
        let dummy = match &settings.dummy_private_key {
            Some(bytes) => Keypair::from_bytes(bytes)
                .map_err(|e| NodeError::Config(format!("dummy-private-key: {e}")))?
                .pubkey(),
            None => Keypair::new().pubkey(),
        };
        let programs = NetworkProfile::resolve(settings, dummy)?;
        let market = Pubkey::from_str(&settings.nosana_market)
            .map_err(|e| NodeError::Config(format!("nosana-market: {e}")))?;
        let nft_mint = Pubkey::from_str(&settings.nft)
            .map_err(|e| NodeError::Config(format!("nft: {e}")))?;

        let nos_ata = keys::associated_token_address(&address, &programs.token_mint);
        let nft_ata = keys::associated_token_address(&address, &nft_mint);
        let (stake, _) = keys::find_pda(
            &[b"stake", programs.token_mint.as_ref(), address.as_ref()],
            &programs.stake_program,
        )?;
        let (market_vault, _) = keys::find_pda(
            &[market.as_ref(), programs.token_mint.as_ref()],
            &programs.jobs_program,
        )?;
        let (rewards_vault, _) = keys::find_pda(
            &[programs.token_mint.as_ref()],
            &programs.rewards_program,
        )?;
        let (rewards_reflection, _) =
            keys::find_pda(&[b"reflection"], &programs.rewards_program)?;
        let metadata = keys::metadata_address(&nft_mint)?;

        let accounts: HashMap<String, Pubkey> = [
            ("authority", address),
            ("payer", address),
            ("market", market),
            ("mint", programs.token_mint),
            ("vault", market_vault),
            ("stake", stake),
            ("nft", nft_ata),
            ("metadata", metadata),
            ("user", nos_ata),
            ("rewardsVault", rewards_vault),
            ("rewardsReflection", rewards_reflection),
            ("rewardsProgram", programs.rewards_program),
            ("accessKey", programs.collection),
            ("systemProgram", solana_sdk::system_program::id()),
            ("tokenProgram", spl_token::id()),
            ("rent", solana_sdk::sysvar::rent::id()),
        ]
        .into_iter()
        .map(|(name, key)| (name.to_string(), key))
        .collect();

        Ok(NodeConfig {
            signer,
            address,
            market,
            programs,
            nft_mint,
            nos_ata,
            nft_ata,
            stake,
            market_vault,
            rewards_vault,
            rewards_reflection,
            accounts,
            rpc_url: settings.rpc_url(),
            ipfs_url: settings.ipfs_url.trim_end_matches('/').to_string(),
            pinata_jwt: settings.pinata_jwt.clone(),
            secrets_endpoint: settings.secrets_endpoint.trim_end_matches('/').to_string(),
            poll_delay: Duration::from_millis(settings.poll_delay_ms),
            start_job_loop: settings.start_job_loop,
            flow_dir: settings.flow_dir.clone(),
        })
    }

    /// The base account table with per-call overrides applied, e.g. the
    /// fresh `run` keypair for `work` or the `job`/`run`/`payer` trio for
    /// `finish`.
    pub fn accounts_with(&self, overrides: &[(&str, Pubkey)]) -> HashMap<String, Pubkey> {
        let mut table = self.accounts.clone();
        for (name, key) in overrides {
            table.insert(name.to_string(), *key);
        }
        table
    }
}
