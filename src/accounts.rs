use solana_sdk::pubkey::Pubkey;

use crate::error::{NodeError, Result};
use crate::idl::{DecodedAccount, Value};

fn pubkey_field(account: &DecodedAccount, field: &str) -> Result<Pubkey> {
    account.expect(field)?.as_pubkey().ok_or_else(|| {
        NodeError::UnknownIdlType(format!("`{field}` on `{}` is not a publicKey", account.name))
    })
}

fn u64_field(account: &DecodedAccount, field: &str) -> Result<u64> {
    account.expect(field)?.as_u64().ok_or_else(|| {
        NodeError::UnknownIdlType(format!("`{field}` on `{}` is not an integer", account.name))
    })
}

fn i64_field(account: &DecodedAccount, field: &str) -> Result<i64> {
    account.expect(field)?.as_i64().ok_or_else(|| {
        NodeError::UnknownIdlType(format!("`{field}` on `{}` is not an integer", account.name))
    })
}

/// On-chain market state: the queue of pending workers or jobs plus the
/// market's pricing and access parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketAccount {
    pub authority: Pubkey,
    pub queue: Vec<Pubkey>,
    pub queue_type: u8,
    pub job_price: u64,
    pub job_timeout: i64,
    pub node_access_key: Pubkey,
    pub node_stake_minimum: u64,
}

impl MarketAccount {
    pub const QUEUE_TYPE_JOB: u8 = 0;
    pub const QUEUE_TYPE_NODE: u8 = 1;

    /// The worker considers itself queued when its address appears in the
    /// market queue.
    pub fn is_queued(&self, address: &Pubkey) -> bool {
        self.queue.contains(address)
    }
}

impl TryFrom<&DecodedAccount> for MarketAccount {
    type Error = NodeError;

    fn try_from(account: &DecodedAccount) -> Result<MarketAccount> {
        let queue = account
            .expect("queue")?
            .elements()
            .ok_or_else(|| NodeError::UnknownIdlType("market queue is not a vec".into()))?
            .iter()
            .map(|v| {
                v.as_pubkey()
                    .ok_or_else(|| NodeError::UnknownIdlType("queue entry not a publicKey".into()))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(MarketAccount {
            authority: pubkey_field(account, "authority")?,
            queue,
            queue_type: u64_field(account, "queueType")? as u8,
            job_price: u64_field(account, "jobPrice")?,
            job_timeout: i64_field(account, "jobTimeout")?,
            node_access_key: pubkey_field(account, "nodeAccessKey")?,
            node_stake_minimum: u64_field(account, "nodeXnosMinimum")?,
        })
    }
}

/// A posted job: the IPFS hash of its pipeline plus ownership, pricing and
/// lifecycle timestamps.
#[derive(Debug, Clone, PartialEq)]
pub struct JobAccount {
    pub ipfs_job: [u8; 32],
    pub market: Pubkey,
    pub payer: Pubkey,
    pub project: Pubkey,
    pub price: u64,
    pub state: u8,
    pub time_start: i64,
    pub time_end: i64,
}

impl TryFrom<&DecodedAccount> for JobAccount {
    type Error = NodeError;

    fn try_from(account: &DecodedAccount) -> Result<JobAccount> {
        let ipfs_job: [u8; 32] = account
            .expect("ipfsJob")?
            .as_bytes()
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| NodeError::UnknownIdlType("ipfsJob is not 32 bytes".into()))?;
        Ok(JobAccount {
            ipfs_job,
            market: pubkey_field(account, "market")?,
            payer: pubkey_field(account, "payer")?,
            project: pubkey_field(account, "project")?,
            price: u64_field(account, "price")?,
            state: u64_field(account, "state")? as u8,
            time_start: i64_field(account, "timeStart")?,
            time_end: i64_field(account, "timeEnd")?,
        })
    }
}

/// The short-lived record linking a worker's claim to a job; closed by the
/// finalizing instruction, refunding `payer`.
#[derive(Debug, Clone, PartialEq)]
pub struct RunAccount {
    pub job: Pubkey,
    pub node: Pubkey,
    pub payer: Pubkey,
    pub time: i64,
}

impl TryFrom<&DecodedAccount> for RunAccount {
    type Error = NodeError;

    fn try_from(account: &DecodedAccount) -> Result<RunAccount> {
        Ok(RunAccount {
            job: pubkey_field(account, "job")?,
            node: pubkey_field(account, "node")?,
            payer: pubkey_field(account, "payer")?,
            time: i64_field(account, "time")?,
        })
    }
}
