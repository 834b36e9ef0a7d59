//! Worker node for the Nosana compute market: holds a stake and an access
//! NFT, queues in an on-chain market, executes claimed jobs through an
//! external flow engine and finalizes results on chain.

pub mod accounts;
pub mod config;
pub mod error;
pub mod flow;
pub mod health;
pub mod idl;
pub mod ipfs;
pub mod keys;
pub mod rpc;
pub mod secrets;
pub mod tx;
pub mod worker;

pub use config::{NodeConfig, Settings};
pub use error::{NodeError, Result};
pub use worker::{Chain, SolanaChain, Worker};
