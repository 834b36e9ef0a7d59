use async_trait::async_trait;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::signer::Signer;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{error, info, trace, warn};

use crate::accounts::{JobAccount, MarketAccount, RunAccount};
use crate::config::NodeConfig;
use crate::error::{NodeError, Result};
use crate::flow::{Flow, FlowEngine, FlowResults, EFFECT_COMPLETE_JOB};
use crate::idl::{decode_account, IdlCodec, Value};
use crate::ipfs::{self, IpfsClient};
use crate::rpc::RpcClient;
use crate::secrets::SecretResolver;
use crate::tx::{await_tx, build_idl_tx, send_tx, AWAIT_MAX_TRIES, AWAIT_POLL_MS};

/// On-chain side of the work loop, abstracted so the controller can be
/// driven against a mock in tests.
#[async_trait]
pub trait Chain: Send + Sync {
    /// Runs currently claimed by this node.
    async fn find_runs(&self) -> Result<Vec<(Pubkey, RunAccount)>>;
    async fn load_job(&self, job: &Pubkey) -> Result<JobAccount>;
    async fn is_queued(&self) -> Result<bool>;
    /// Claim an available job or enqueue the worker.
    async fn enter_market(&self) -> Result<Signature>;
    /// Submit `finish` for a run and await it. Must be idempotent: a run
    /// account that is already closed counts as success.
    async fn finish_run(&self, run: &Pubkey, result_hash: [u8; 32]) -> Result<()>;
}

/// Production `Chain` over the RPC client, the IDL codec and the derived
/// node configuration.
pub struct SolanaChain {
    rpc: RpcClient,
    codec: Arc<IdlCodec>,
    config: Arc<NodeConfig>,
}

impl SolanaChain {
    pub fn new(rpc: RpcClient, codec: Arc<IdlCodec>, config: Arc<NodeConfig>) -> Self {
        Self { rpc, codec, config }
    }

    async fn jobs_idl(&self) -> Result<Arc<crate::idl::Idl>> {
        self.codec
            .fetch(&self.rpc, &self.config.programs.jobs_program)
            .await
    }

    async fn market(&self) -> Result<MarketAccount> {
        let idl = self.jobs_idl().await?;
        let data = self
            .rpc
            .get_account_info(&self.config.market)
            .await?
            .ok_or_else(|| NodeError::MissingAccount(format!("market {}", self.config.market)))?;
        let decoded = decode_account(&idl, "MarketAccount", &data)?;
        MarketAccount::try_from(&decoded)
    }

    async fn load_run(&self, run: &Pubkey) -> Result<Option<RunAccount>> {
        let idl = self.jobs_idl().await?;
        match self.rpc.get_account_info(run).await? {
            None => Ok(None),
            Some(data) => {
                let decoded = decode_account(&idl, "RunAccount", &data)?;
                Ok(Some(RunAccount::try_from(&decoded)?))
            }
        }
    }

    async fn submit(
        &self,
        instruction: &str,
        args: &[Value],
        overrides: &[(&str, Pubkey)],
        extra_signers: &[&Keypair],
    ) -> Result<Signature> {
        let idl = self.jobs_idl().await?;
        let accounts = self.config.accounts_with(overrides);
        let tx = build_idl_tx(
            &idl,
            &self.config.programs.jobs_program,
            instruction,
            args,
            &accounts,
            &self.config.address,
        )?;
        let mut signers: Vec<&Keypair> = vec![&self.config.signer];
        signers.extend_from_slice(extra_signers);
        let signature = send_tx(&self.rpc, tx, &signers).await?;
        await_tx(&self.rpc, &signature, AWAIT_POLL_MS, AWAIT_MAX_TRIES).await?;
        Ok(signature)
    }

    /// Post a job: upload hash in, fresh job and run accounts created.
    pub async fn post_job(&self, ipfs_hash: [u8; 32]) -> Result<Signature> {
        let job = Keypair::new();
        let run = Keypair::new();
        self.submit(
            "list",
            &[Value::from_bytes(&ipfs_hash)],
            &[("job", job.pubkey()), ("run", run.pubkey())],
            &[&job, &run],
        )
        .await
    }

    /// Abandon a claimed run without a result, refunding the payer: the
    /// same finalizing instruction, submitted with no args.
    pub async fn quit_run(&self, run: &Pubkey) -> Result<Signature> {
        let run_account = self
            .load_run(run)
            .await?
            .ok_or_else(|| NodeError::MissingAccount(format!("run {run}")))?;
        self.submit(
            "finish",
            &[],
            &[
                ("job", run_account.job),
                ("run", *run),
                ("payer", run_account.payer),
            ],
            &[],
        )
        .await
    }
}

#[async_trait]
impl Chain for SolanaChain {
    async fn find_runs(&self) -> Result<Vec<(Pubkey, RunAccount)>> {
        let accounts = self
            .codec
            .program_accounts(
                &self.rpc,
                &self.config.programs.jobs_program,
                "RunAccount",
                &[("node", Value::Pubkey(self.config.address))],
            )
            .await?;
        accounts
            .iter()
            .map(|(pubkey, decoded)| Ok((*pubkey, RunAccount::try_from(decoded)?)))
            .collect()
    }

    async fn load_job(&self, job: &Pubkey) -> Result<JobAccount> {
        let idl = self.jobs_idl().await?;
        let data = self
            .rpc
            .get_account_info(job)
            .await?
            .ok_or_else(|| NodeError::MissingAccount(format!("job {job}")))?;
        let decoded = decode_account(&idl, "JobAccount", &data)?;
        JobAccount::try_from(&decoded)
    }

    async fn is_queued(&self) -> Result<bool> {
        Ok(self.market().await?.is_queued(&self.config.address))
    }

    async fn enter_market(&self) -> Result<Signature> {
        let run = Keypair::new();
        self.submit("work", &[], &[("run", run.pubkey())], &[&run]).await
    }

    async fn finish_run(&self, run: &Pubkey, result_hash: [u8; 32]) -> Result<()> {
        let run_account = match self.load_run(run).await? {
            // Already closed: a previous finish landed.
            None => return Ok(()),
            Some(account) => account,
        };
        let submitted = self
            .submit(
                "finish",
                &[Value::from_bytes(&result_hash)],
                &[
                    ("job", run_account.job),
                    ("run", *run),
                    ("payer", run_account.payer),
                ],
                &[],
            )
            .await;
        match submitted {
            Ok(_) => Ok(()),
            Err(e @ NodeError::Timeout(_)) => Err(e),
            Err(e) => {
                // A deterministic failure against a closed run means the
                // job was finalized by an earlier attempt.
                if self.load_run(run).await?.is_none() {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }
}

/// The job lifecycle controller: one long-lived task that claims work,
/// drives flows to completion and finalizes them on chain.
pub struct Worker<C: Chain, E: FlowEngine> {
    chain: Arc<C>,
    engine: Arc<E>,
    ipfs: IpfsClient,
    resolver: Option<SecretResolver>,
    poll_delay: Duration,
}

impl<C: Chain, E: FlowEngine> Worker<C, E> {
    pub fn new(
        chain: Arc<C>,
        engine: Arc<E>,
        ipfs: IpfsClient,
        resolver: Option<SecretResolver>,
        poll_delay: Duration,
    ) -> Self {
        Self { chain, engine, ipfs, resolver, poll_delay }
    }

    /// Run until a value arrives on the exit channel. In-flight RPCs are
    /// not interrupted; shutdown takes effect at the next suspension
    /// point.
    pub async fn run(&self, mut exit: mpsc::Receiver<()>) {
        let mut active_flow: Option<String> = None;
        loop {
            active_flow = self.tick(active_flow).await;
            tokio::select! {
                _ = exit.recv() => {
                    info!("work loop stopping");
                    break;
                }
                _ = sleep(self.poll_delay) => {}
            }
        }
    }

    /// One iteration of the state machine. Errors are logged and the
    /// current flow is retained so the next tick retries it.
    pub async fn tick(&self, active_flow: Option<String>) -> Option<String> {
        match self.step(active_flow.clone()).await {
            Ok(next) => next,
            Err(e) if e.is_transient() => {
                warn!(error = %e, "transient fault, retrying next tick");
                active_flow
            }
            Err(e) => {
                error!(error = %e, "iteration failed, retrying next tick");
                active_flow
            }
        }
    }

    async fn step(&self, active_flow: Option<String>) -> Result<Option<String>> {
        if let Some(flow_id) = active_flow {
            return self.process_flow(flow_id).await;
        }
        let runs = self.chain.find_runs().await?;
        if let Some((run, run_account)) = runs.first() {
            let flow_id = self.start_flow(run, run_account).await?;
            return Ok(Some(flow_id));
        }
        if self.chain.is_queued().await? {
            trace!("queued in market, idling");
            return Ok(None);
        }
        let signature = self.chain.enter_market().await?;
        info!(%signature, "entered market queue");
        Ok(None)
    }

    /// Poll an active flow: finalize when finished, compensate when a git
    /// stage failed, keep it otherwise.
    async fn process_flow(&self, flow_id: String) -> Result<Option<String>> {
        let mut flow = match self.engine.load(&flow_id).await? {
            Some(flow) => flow,
            None => {
                warn!(%flow_id, "active flow vanished from store, dropping");
                return Ok(None);
            }
        };
        if flow.git_failed() && !flow.finished() {
            flow = self.engine.handle_effect(EFFECT_COMPLETE_JOB, &flow_id).await?;
        }
        if !flow.finished() {
            trace!(%flow_id, "flow still running");
            return Ok(Some(flow_id));
        }
        let result_cid = flow.results.result_ipfs.as_deref().unwrap_or_default();
        let result_hash = ipfs::hash_from_cid(result_cid)?;
        let run = Pubkey::from_str(&flow.results.run_addr).map_err(|e| {
            NodeError::FlowFailed {
                flow_id: flow_id.clone(),
                reason: format!("bad run address: {e}"),
            }
        })?;
        self.chain.finish_run(&run, result_hash).await?;
        info!(%flow_id, result = %result_cid, "job finalized");
        Ok(None)
    }

    /// Download the run's job pipeline and hand it to the flow engine.
    /// Flow ids are the run address, so a restarted node resumes instead
    /// of re-triggering.
    async fn start_flow(&self, run: &Pubkey, run_account: &RunAccount) -> Result<String> {
        let flow_id = run.to_string();
        if self.engine.load(&flow_id).await?.is_some() {
            info!(%flow_id, "resuming existing flow");
            return Ok(flow_id);
        }
        let job = self.chain.load_job(&run_account.job).await?;
        let cid = ipfs::cid_from_hash(&job.ipfs_job);
        let definition = self.ipfs.fetch_job(&cid).await?;
        let mut pipeline = definition.pipeline;
        if let Some(resolver) = &self.resolver {
            resolver.resolve(&mut pipeline, Some(&run_account.job)).await?;
        }
        let flow = Flow {
            id: flow_id.clone(),
            pipeline,
            results: FlowResults {
                job_addr: run_account.job.to_string(),
                run_addr: flow_id.clone(),
                ..FlowResults::default()
            },
        };
        self.engine.save(&flow).await?;
        self.engine.trigger(&flow_id).await?;
        info!(%flow_id, job = %cid, "flow started");
        Ok(flow_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::StepStatus;
    use httpmock::prelude::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct MockChain {
        runs: Mutex<Vec<(Pubkey, RunAccount)>>,
        jobs: Mutex<HashMap<Pubkey, JobAccount>>,
        queued: AtomicBool,
        enter_calls: AtomicU32,
        finish_calls: Mutex<Vec<(Pubkey, [u8; 32])>>,
        finish_errors: Mutex<Vec<NodeError>>,
    }

    #[async_trait]
    impl Chain for MockChain {
        async fn find_runs(&self) -> Result<Vec<(Pubkey, RunAccount)>> {
            Ok(self.runs.lock().unwrap().clone())
        }

        async fn load_job(&self, job: &Pubkey) -> Result<JobAccount> {
            self.jobs
                .lock()
                .unwrap()
                .get(job)
                .cloned()
                .ok_or_else(|| NodeError::MissingAccount(format!("job {job}")))
        }

        async fn is_queued(&self) -> Result<bool> {
            Ok(self.queued.load(Ordering::SeqCst))
        }

        async fn enter_market(&self) -> Result<Signature> {
            self.enter_calls.fetch_add(1, Ordering::SeqCst);
            self.queued.store(true, Ordering::SeqCst);
            Ok(Signature::default())
        }

        async fn finish_run(&self, run: &Pubkey, result_hash: [u8; 32]) -> Result<()> {
            self.finish_calls.lock().unwrap().push((*run, result_hash));
            if let Some(err) = self.finish_errors.lock().unwrap().pop() {
                return Err(err);
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct MockEngine {
        flows: Mutex<HashMap<String, Flow>>,
        triggered: Mutex<Vec<String>>,
        effects: Mutex<Vec<String>>,
        effect_result: Mutex<Option<String>>,
    }

    impl MockEngine {
        fn set_result(&self, flow_id: &str, cid: &str) {
            let mut flows = self.flows.lock().unwrap();
            flows.get_mut(flow_id).unwrap().results.result_ipfs = Some(cid.to_string());
        }
    }

    #[async_trait]
    impl FlowEngine for MockEngine {
        async fn trigger(&self, flow_id: &str) -> Result<()> {
            self.triggered.lock().unwrap().push(flow_id.to_string());
            Ok(())
        }

        async fn load(&self, flow_id: &str) -> Result<Option<Flow>> {
            Ok(self.flows.lock().unwrap().get(flow_id).cloned())
        }

        async fn save(&self, flow: &Flow) -> Result<()> {
            self.flows
                .lock()
                .unwrap()
                .insert(flow.id.clone(), flow.clone());
            Ok(())
        }

        async fn handle_effect(&self, name: &str, flow_id: &str) -> Result<Flow> {
            assert_eq!(name, EFFECT_COMPLETE_JOB);
            self.effects.lock().unwrap().push(flow_id.to_string());
            let cid = self.effect_result.lock().unwrap().clone().unwrap();
            let mut flows = self.flows.lock().unwrap();
            let flow = flows.get_mut(flow_id).unwrap();
            flow.results.result_ipfs = Some(cid);
            Ok(flow.clone())
        }
    }

    fn worker_with(
        chain: Arc<MockChain>,
        engine: Arc<MockEngine>,
        server: &MockServer,
    ) -> Worker<MockChain, MockEngine> {
        let ipfs = IpfsClient::new(
            server.url("/ipfs"),
            None,
            crate::rpc::default_http_client().unwrap(),
        );
        Worker::new(chain, engine, ipfs, None, Duration::from_millis(1))
    }

    fn claimed_run(chain: &MockChain, server: &MockServer) -> (Pubkey, [u8; 32]) {
        let run = Pubkey::new_unique();
        let job = Pubkey::new_unique();
        let job_hash = [9u8; 32];
        chain.runs.lock().unwrap().push((
            run,
            RunAccount {
                job,
                node: Pubkey::new_unique(),
                payer: Pubkey::new_unique(),
                time: 0,
            },
        ));
        chain.jobs.lock().unwrap().insert(
            job,
            JobAccount {
                ipfs_job: job_hash,
                market: Pubkey::new_unique(),
                payer: Pubkey::new_unique(),
                project: Pubkey::new_unique(),
                price: 1,
                state: 0,
                time_start: 0,
                time_end: 0,
            },
        );
        server.mock(|when, then| {
            when.method(GET)
                .path(format!("/ipfs/{}", ipfs::cid_from_hash(&job_hash)));
            then.status(200).json_body(serde_json::json!({
                "pipeline": {"jobs": [{"name": "noop"}]}
            }));
        });
        (run, job_hash)
    }

    #[tokio::test]
    async fn cold_start_enters_market_once_then_idles() {
        let server = MockServer::start();
        let chain = Arc::new(MockChain::default());
        let engine = Arc::new(MockEngine::default());
        let worker = worker_with(chain.clone(), engine, &server);

        let state = worker.tick(None).await;
        assert_eq!(state, None);
        assert_eq!(chain.enter_calls.load(Ordering::SeqCst), 1);

        // Second iteration: queued now, no further submissions.
        let state = worker.tick(state).await;
        assert_eq!(state, None);
        assert_eq!(chain.enter_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn claimed_run_starts_flow_then_finalizes() {
        let server = MockServer::start();
        let chain = Arc::new(MockChain::default());
        let engine = Arc::new(MockEngine::default());
        let (run, _) = claimed_run(&chain, &server);
        let worker = worker_with(chain.clone(), engine.clone(), &server);

        let state = worker.tick(None).await;
        assert_eq!(state.as_deref(), Some(run.to_string().as_str()));
        assert_eq!(engine.triggered.lock().unwrap().len(), 1);
        assert_eq!(chain.enter_calls.load(Ordering::SeqCst), 0);

        // Flow still running: state is retained, nothing submitted.
        let state = worker.tick(state).await;
        assert_eq!(state.as_deref(), Some(run.to_string().as_str()));
        assert!(chain.finish_calls.lock().unwrap().is_empty());

        // Engine completes the flow; next tick finalizes and clears.
        let result_hash = [3u8; 32];
        engine.set_result(&run.to_string(), &ipfs::cid_from_hash(&result_hash));
        let state = worker.tick(state).await;
        assert_eq!(state, None);
        let finishes = chain.finish_calls.lock().unwrap();
        assert_eq!(finishes.as_slice(), &[(run, result_hash)]);
    }

    #[tokio::test]
    async fn git_failure_dispatches_compensation_then_finalizes() {
        let server = MockServer::start();
        let chain = Arc::new(MockChain::default());
        let engine = Arc::new(MockEngine::default());
        let (run, _) = claimed_run(&chain, &server);
        let worker = worker_with(chain.clone(), engine.clone(), &server);

        let state = worker.tick(None).await;
        let flow_id = state.clone().unwrap();
        {
            let mut flows = engine.flows.lock().unwrap();
            flows.get_mut(&flow_id).unwrap().results.clone =
                StepStatus::Error("remote unreachable".to_string());
        }
        let failure_hash = [4u8; 32];
        *engine.effect_result.lock().unwrap() = Some(ipfs::cid_from_hash(&failure_hash));

        let state = worker.tick(state).await;
        assert_eq!(state, None);
        assert_eq!(engine.effects.lock().unwrap().as_slice(), &[flow_id]);
        assert_eq!(
            chain.finish_calls.lock().unwrap().as_slice(),
            &[(run, failure_hash)]
        );
    }

    #[tokio::test]
    async fn finish_timeout_retains_flow_and_retries() {
        let server = MockServer::start();
        let chain = Arc::new(MockChain::default());
        let engine = Arc::new(MockEngine::default());
        let (run, _) = claimed_run(&chain, &server);
        let worker = worker_with(chain.clone(), engine.clone(), &server);

        let state = worker.tick(None).await;
        let result_hash = [5u8; 32];
        engine.set_result(&run.to_string(), &ipfs::cid_from_hash(&result_hash));
        chain
            .finish_errors
            .lock()
            .unwrap()
            .push(NodeError::Timeout("transaction".to_string()));

        // Timeout: flow retained, one attempt made.
        let state = worker.tick(state).await;
        assert_eq!(state.as_deref(), Some(run.to_string().as_str()));
        assert_eq!(chain.finish_calls.lock().unwrap().len(), 1);

        // Retry succeeds and clears the flow.
        let state = worker.tick(state).await;
        assert_eq!(state, None);
        assert_eq!(chain.finish_calls.lock().unwrap().len(), 2);
    }

    mod solana_chain {
        use super::*;
        use crate::config::{Cluster, Settings};
        use crate::idl::{encode_account, DecodedAccount, Idl};

        fn jobs_idl() -> Idl {
            serde_json::from_value(serde_json::json!({
                "name": "nosana_jobs",
                "instructions": [
                    {
                        "name": "work",
                        "accounts": [
                            {"name": "run", "isMut": true, "isSigner": true},
                            {"name": "market", "isMut": true, "isSigner": false},
                            {"name": "authority", "isMut": true, "isSigner": true}
                        ],
                        "args": []
                    },
                    {
                        "name": "list",
                        "accounts": [
                            {"name": "job", "isMut": true, "isSigner": true},
                            {"name": "run", "isMut": true, "isSigner": true},
                            {"name": "market", "isMut": true, "isSigner": false},
                            {"name": "user", "isMut": true, "isSigner": false},
                            {"name": "vault", "isMut": true, "isSigner": false},
                            {"name": "authority", "isMut": true, "isSigner": true},
                            {"name": "rewardsReflection", "isMut": true, "isSigner": false},
                            {"name": "rewardsVault", "isMut": true, "isSigner": false},
                            {"name": "rewardsProgram", "isMut": false, "isSigner": false},
                            {"name": "systemProgram", "isMut": false, "isSigner": false},
                            {"name": "tokenProgram", "isMut": false, "isSigner": false},
                            {"name": "rent", "isMut": false, "isSigner": false}
                        ],
                        "args": [{"name": "ipfsJob", "type": {"array": ["u8", 32]}}]
                    },
                    {
                        "name": "finish",
                        "accounts": [
                            {"name": "job", "isMut": true, "isSigner": false},
                            {"name": "run", "isMut": true, "isSigner": false},
                            {"name": "payer", "isMut": true, "isSigner": false},
                            {"name": "authority", "isMut": true, "isSigner": true}
                        ],
                        "args": [{"name": "ipfsResult", "type": {"array": ["u8", 32]}}]
                    }
                ],
                "accounts": [
                    {
                        "name": "MarketAccount",
                        "type": {"kind": "struct", "fields": [
                            {"name": "authority", "type": "publicKey"},
                            {"name": "queue", "type": {"vec": "publicKey"}},
                            {"name": "queueType", "type": "u8"},
                            {"name": "jobPrice", "type": "u64"},
                            {"name": "jobTimeout", "type": "i64"},
                            {"name": "nodeAccessKey", "type": "publicKey"},
                            {"name": "nodeXnosMinimum", "type": "u64"}
                        ]}
                    },
                    {
                        "name": "RunAccount",
                        "type": {"kind": "struct", "fields": [
                            {"name": "job", "type": "publicKey"},
                            {"name": "node", "type": "publicKey"},
                            {"name": "payer", "type": "publicKey"},
                            {"name": "time", "type": "i64"}
                        ]}
                    }
                ]
            }))
            .unwrap()
        }

        fn chain_with(server: &MockServer) -> SolanaChain {
            let signer = Keypair::new();
            let settings = Settings {
                solana_network: Cluster::Devnet,
                rpc_url: Some(server.url("/")),
                solana_private_key: signer.to_bytes().to_vec(),
                dummy_private_key: None,
                nosana_market: Pubkey::new_unique().to_string(),
                nft: Pubkey::new_unique().to_string(),
                nft_collection: None,
                rewards_pool: None,
                ipfs_url: server.url("/ipfs"),
                pinata_jwt: None,
                poll_delay_ms: 1,
                start_job_loop: true,
                secrets_endpoint: server.url(""),
                flow_dir: "flows".to_string(),
            };
            let config = Arc::new(NodeConfig::derive(&settings).unwrap());
            let codec = Arc::new(IdlCodec::new("devnet"));
            codec.preload(&config.programs.jobs_program, jobs_idl());
            let rpc = RpcClient::new(server.url("/"), crate::rpc::default_http_client().unwrap());
            SolanaChain::new(rpc, codec, config)
        }

        #[tokio::test]
        async fn enter_market_signs_and_submits_work() {
            let server = MockServer::start();
            let chain = chain_with(&server);
            let blockhash = server.mock(|when, then| {
                when.method(POST).path("/").body_contains("getLatestBlockhash");
                then.status(200).json_body(serde_json::json!({
                    "jsonrpc": "2.0", "id": "1",
                    "result": {"context": {"slot": 1}, "value": {
                        "blockhash": solana_sdk::hash::Hash::new_unique().to_string(),
                        "lastValidBlockHeight": 100u64
                    }}
                }));
            });
            let send = server.mock(|when, then| {
                when.method(POST).path("/").body_contains("sendTransaction");
                then.status(200).json_body(serde_json::json!({
                    "jsonrpc": "2.0", "id": "1",
                    "result": Signature::default().to_string()
                }));
            });
            let confirm = server.mock(|when, then| {
                when.method(POST).path("/").body_contains("getTransaction");
                then.status(200).json_body(serde_json::json!({
                    "jsonrpc": "2.0", "id": "1",
                    "result": {"slot": 7, "meta": {"err": null}}
                }));
            });
            let signature = chain.enter_market().await.unwrap();
            assert_eq!(signature, Signature::default());
            blockhash.assert();
            send.assert();
            confirm.assert();
        }

        #[tokio::test]
        async fn queued_state_reads_market_queue() {
            let server = MockServer::start();
            let chain = chain_with(&server);
            let market = DecodedAccount {
                name: "MarketAccount".to_string(),
                fields: vec![
                    ("authority".to_string(), Value::Pubkey(Pubkey::new_unique())),
                    (
                        "queue".to_string(),
                        Value::Vec(vec![Value::Pubkey(chain.config.address)]),
                    ),
                    ("queueType".to_string(), Value::U8(MarketAccount::QUEUE_TYPE_NODE)),
                    ("jobPrice".to_string(), Value::U64(100)),
                    ("jobTimeout".to_string(), Value::I64(3600)),
                    ("nodeAccessKey".to_string(), Value::Pubkey(Pubkey::new_unique())),
                    ("nodeXnosMinimum".to_string(), Value::U64(0)),
                ],
            };
            let blob = encode_account(&jobs_idl(), &market).unwrap();
            server.mock(|when, then| {
                when.method(POST).path("/").body_contains("getAccountInfo");
                then.status(200).json_body(serde_json::json!({
                    "jsonrpc": "2.0", "id": "1",
                    "result": {"context": {"slot": 1}, "value": {
                        "data": [base64::encode(&blob), "base64"],
                        "owner": Pubkey::new_unique().to_string(),
                        "lamports": 1u64
                    }}
                }));
            });
            assert!(chain.is_queued().await.unwrap());
        }

        fn mock_submission(server: &MockServer) {
            server.mock(|when, then| {
                when.method(POST).path("/").body_contains("getLatestBlockhash");
                then.status(200).json_body(serde_json::json!({
                    "jsonrpc": "2.0", "id": "1",
                    "result": {"context": {"slot": 1}, "value": {
                        "blockhash": solana_sdk::hash::Hash::new_unique().to_string(),
                        "lastValidBlockHeight": 100u64
                    }}
                }));
            });
            server.mock(|when, then| {
                when.method(POST).path("/").body_contains("sendTransaction");
                then.status(200).json_body(serde_json::json!({
                    "jsonrpc": "2.0", "id": "1",
                    "result": Signature::default().to_string()
                }));
            });
            server.mock(|when, then| {
                when.method(POST).path("/").body_contains("getTransaction");
                then.status(200).json_body(serde_json::json!({
                    "jsonrpc": "2.0", "id": "1",
                    "result": {"slot": 7, "meta": {"err": null}}
                }));
            });
        }

        #[tokio::test]
        async fn post_job_lists_with_fresh_job_and_run_signers() {
            let server = MockServer::start();
            let chain = chain_with(&server);
            mock_submission(&server);
            let signature = chain.post_job([8u8; 32]).await.unwrap();
            assert_eq!(signature, Signature::default());
        }

        #[tokio::test]
        async fn quit_reuses_finish_without_args() {
            let server = MockServer::start();
            let chain = chain_with(&server);
            let run_account = DecodedAccount {
                name: "RunAccount".to_string(),
                fields: vec![
                    ("job".to_string(), Value::Pubkey(Pubkey::new_unique())),
                    ("node".to_string(), Value::Pubkey(chain.config.address)),
                    ("payer".to_string(), Value::Pubkey(Pubkey::new_unique())),
                    ("time".to_string(), Value::I64(0)),
                ],
            };
            let blob = encode_account(&jobs_idl(), &run_account).unwrap();
            server.mock(|when, then| {
                when.method(POST).path("/").body_contains("getAccountInfo");
                then.status(200).json_body(serde_json::json!({
                    "jsonrpc": "2.0", "id": "1",
                    "result": {"context": {"slot": 1}, "value": {
                        "data": [base64::encode(&blob), "base64"],
                        "owner": Pubkey::new_unique().to_string(),
                        "lamports": 1u64
                    }}
                }));
            });
            mock_submission(&server);
            let signature = chain.quit_run(&Pubkey::new_unique()).await.unwrap();
            assert_eq!(signature, Signature::default());
        }

        #[tokio::test]
        async fn finish_on_closed_run_is_success_without_submission() {
            let server = MockServer::start();
            let chain = chain_with(&server);
            server.mock(|when, then| {
                when.method(POST).path("/").body_contains("getAccountInfo");
                then.status(200).json_body(serde_json::json!({
                    "jsonrpc": "2.0", "id": "1",
                    "result": {"context": {"slot": 1}, "value": null}
                }));
            });
            let send = server.mock(|when, then| {
                when.method(POST).path("/").body_contains("sendTransaction");
                then.status(200).json_body(serde_json::json!({
                    "jsonrpc": "2.0", "id": "1", "result": Signature::default().to_string()
                }));
            });
            chain
                .finish_run(&Pubkey::new_unique(), [1u8; 32])
                .await
                .unwrap();
            assert_eq!(send.hits(), 0);
        }
    }

    #[tokio::test]
    async fn exit_channel_stops_the_loop() {
        let server = MockServer::start();
        let chain = Arc::new(MockChain::default());
        chain.queued.store(true, Ordering::SeqCst);
        let engine = Arc::new(MockEngine::default());
        let worker = worker_with(chain, engine, &server);

        let (exit_tx, exit_rx) = mpsc::channel(1);
        exit_tx.send(()).await.unwrap();
        // Returns instead of looping forever.
        tokio::time::timeout(Duration::from_secs(5), worker.run(exit_rx))
            .await
            .expect("loop did not stop on exit signal");
    }
}
