use anyhow::{Context, Result};
use nosana_node::config::{NodeConfig, Settings};
use nosana_node::flow::FileFlowEngine;
use nosana_node::health;
use nosana_node::idl::IdlCodec;
use nosana_node::ipfs::{self, IpfsClient};
use nosana_node::rpc::{default_http_client, RpcClient};
use nosana_node::secrets::{SecretResolver, SecretsClient};
use nosana_node::worker::{SolanaChain, Worker};
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "nosana_node=info".into()))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config_path =
        std::env::var("NOSANA_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let settings = Settings::load(&config_path)
        .with_context(|| format!("loading settings from {config_path}"))?;
    let config = Arc::new(NodeConfig::derive(&settings).context("deriving node configuration")?);

    let http = default_http_client().context("building http client")?;
    let rpc = RpcClient::new(config.rpc_url.clone(), http.clone());
    let codec = Arc::new(IdlCodec::new(config.programs.cluster.name()));
    let secrets = SecretsClient::new(config.secrets_endpoint.clone(), http.clone());
    let ipfs = IpfsClient::new(
        config.ipfs_url.clone(),
        config.pinata_jwt.clone(),
        http.clone(),
    );

    let chain = Arc::new(SolanaChain::new(rpc.clone(), codec, config.clone()));
    admin_actions(&chain).await?;

    let report = health::check(&rpc, &config, &secrets)
        .await
        .context("health check")?;
    health::banner(&report, &config);

    let healthy = match report.gate() {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "health gate failed, work loop disabled");
            false
        }
    };

    let (exit_tx, exit_rx) = mpsc::channel::<()>(1);
    let loop_handle = if healthy && config.start_job_loop {
        let engine = Arc::new(FileFlowEngine::new(&config.flow_dir, ipfs.clone()));
        let resolver = SecretResolver::new(config.clone(), http.clone());
        let worker = Worker::new(chain.clone(), engine, ipfs, Some(resolver), config.poll_delay);
        Some(tokio::spawn(async move { worker.run(exit_rx).await }))
    } else {
        info!("work loop not started; process stays up for diagnostics");
        None
    };

    shutdown_signal().await;
    info!("shutdown requested");
    let _ = exit_tx.send(()).await;
    if let Some(handle) = loop_handle {
        if let Err(e) = handle.await {
            error!(error = %e, "work loop task failed");
        }
    }
    info!("node stopped");
    Ok(())
}

/// One-shot operator actions taken before the loop starts: post an
/// uploaded job to the market, or abandon a claimed run.
async fn admin_actions(chain: &SolanaChain) -> Result<()> {
    if let Ok(cid) = std::env::var("NOSANA_POST_JOB") {
        let hash = ipfs::hash_from_cid(&cid).context("NOSANA_POST_JOB")?;
        let signature = chain.post_job(hash).await.context("posting job")?;
        info!(%signature, %cid, "job posted to market");
    }
    if let Ok(run) = std::env::var("NOSANA_QUIT_RUN") {
        let run: Pubkey = run.parse().context("NOSANA_QUIT_RUN")?;
        let signature = chain.quit_run(&run).await.context("quitting run")?;
        info!(%signature, %run, "run abandoned");
    }
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(e) => {
                error!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("received ctrl-c"),
            _ = sigterm.recv() => info!("received SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("received ctrl-c");
    }
}
