use solana_sdk::instruction::Instruction;
use solana_sdk::pubkey::Pubkey;
use solana_sdk::signature::{Keypair, Signature};
use solana_sdk::transaction::Transaction;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, trace};

use crate::error::{NodeError, Result};
use crate::idl::{encode_instruction, Idl, Value};
use crate::rpc::RpcClient;

pub const AWAIT_POLL_MS: u64 = 1000;
pub const AWAIT_MAX_TRIES: u32 = 30;

/// Build an unsigned single-instruction transaction from an IDL
/// instruction and a name to pubkey account table; `payer` lands in the
/// fee-payer slot.
pub fn build_idl_tx(
    idl: &Idl,
    program: &Pubkey,
    instruction_name: &str,
    args: &[Value],
    accounts: &HashMap<String, Pubkey>,
    payer: &Pubkey,
) -> Result<Transaction> {
    let (data, metas) = encode_instruction(idl, instruction_name, args, accounts)?;
    let instruction = Instruction {
        program_id: *program,
        accounts: metas,
        data,
    };
    Ok(Transaction::new_with_payer(&[instruction], Some(payer)))
}

/// Sign with every provided keypair and submit. Returns the signature
/// without waiting for confirmation.
pub async fn send_tx(
    rpc: &RpcClient,
    mut tx: Transaction,
    signers: &[&Keypair],
) -> Result<Signature> {
    let blockhash = rpc.get_latest_blockhash().await?;
    tx.try_sign(&signers.to_vec(), blockhash)
        .map_err(|e| NodeError::Signing(e.to_string()))?;
    let wire = bincode::serialize(&tx)
        .map_err(|e| NodeError::Signing(format!("serialize: {e}")))?;
    let signature = rpc.send_transaction(&base64::encode(wire)).await?;
    info!(%signature, "transaction submitted");
    Ok(signature)
}

/// Poll `getTransaction` until the record appears or tries are exhausted.
/// `max_tries == 0` returns `Timeout` without touching the network. A
/// confirmed record with a non-null `meta.err` is a failure.
pub async fn await_tx(
    rpc: &RpcClient,
    signature: &Signature,
    poll_ms: u64,
    max_tries: u32,
) -> Result<serde_json::Value> {
    for attempt in 0..max_tries {
        trace!(%signature, attempt, "awaiting confirmation");
        if let Some(record) = rpc.get_transaction(signature).await? {
            let err = record.pointer("/meta/err").cloned();
            if let Some(err) = err.filter(|e| !e.is_null()) {
                return Err(NodeError::TxFailed {
                    signature: signature.to_string(),
                    err: err.to_string(),
                });
            }
            return Ok(record);
        }
        if attempt + 1 < max_tries {
            sleep(Duration::from_millis(poll_ms)).await;
        }
    }
    Err(NodeError::Timeout(format!("transaction {signature}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use solana_sdk::signer::Signer;

    fn jobs_idl() -> Idl {
        serde_json::from_value(serde_json::json!({
            "name": "jobs",
            "instructions": [{
                "name": "work",
                "accounts": [
                    {"name": "run", "isMut": true, "isSigner": true},
                    {"name": "authority", "isMut": true, "isSigner": true}
                ],
                "args": []
            }],
            "accounts": []
        }))
        .unwrap()
    }

    #[test]
    fn built_tx_contains_single_instruction_with_discriminator() {
        let idl = jobs_idl();
        let program = Pubkey::new_unique();
        let run = Keypair::new();
        let authority = Keypair::new();
        let accounts: HashMap<String, Pubkey> = [
            ("run".to_string(), run.pubkey()),
            ("authority".to_string(), authority.pubkey()),
        ]
        .into();
        let tx = build_idl_tx(&idl, &program, "work", &[], &accounts, &authority.pubkey()).unwrap();
        assert_eq!(tx.message.instructions.len(), 1);
        assert_eq!(
            tx.message.instructions[0].data,
            crate::idl::method_discriminator("work").to_vec()
        );
        // Fee payer occupies slot zero.
        assert_eq!(tx.message.account_keys[0], authority.pubkey());
    }

    #[tokio::test]
    async fn await_with_zero_tries_times_out_without_io() {
        // Unroutable endpoint: any network attempt would error, not time out.
        let rpc = RpcClient::new(
            "http://127.0.0.1:1".to_string(),
            crate::rpc::default_http_client().unwrap(),
        );
        let signature = Signature::default();
        let err = await_tx(&rpc, &signature, 1, 0).await.unwrap_err();
        assert!(matches!(err, NodeError::Timeout(_)));
    }

    #[tokio::test]
    async fn await_surfaces_meta_err_as_failure() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/");
            then.status(200).json_body(serde_json::json!({
                "jsonrpc": "2.0", "id": "1",
                "result": {"slot": 5, "meta": {"err": {"InstructionError": [0, "Custom"]}}}
            }));
        });
        let rpc = RpcClient::new(server.url("/"), crate::rpc::default_http_client().unwrap());
        let err = await_tx(&rpc, &Signature::default(), 1, 3).await.unwrap_err();
        assert!(matches!(err, NodeError::TxFailed { .. }));
    }

    #[tokio::test]
    async fn await_returns_record_on_success() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/");
            then.status(200).json_body(serde_json::json!({
                "jsonrpc": "2.0", "id": "1",
                "result": {"slot": 5, "meta": {"err": null}}
            }));
        });
        let rpc = RpcClient::new(server.url("/"), crate::rpc::default_http_client().unwrap());
        let record = await_tx(&rpc, &Signature::default(), 1, 3).await.unwrap();
        assert_eq!(record.pointer("/slot").and_then(|v| v.as_u64()), Some(5));
    }
}
