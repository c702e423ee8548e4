pub mod fees;
pub mod funding;
pub mod htlc;
pub mod sweep;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::{Address, FeeRate, OutPoint, PublicKey, Transaction, Txid};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Where the node finds the private half of an escrow key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyLocator {
    pub family: u32,
    pub index: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignRequest {
    pub key: KeyLocator,
    pub sighash: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deposit {
    pub transaction_id: Txid,
    pub output_index: u32,
    pub output_tokens: u64,
    /// `None` while the deposit sits in the mempool.
    pub confirmed_height: Option<u32>,
}

impl Deposit {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint {
            txid: self.transaction_id,
            vout: self.output_index,
        }
    }

    pub fn confirmations(&self, tip_height: u32) -> u32 {
        confirmations_at(self.confirmed_height, tip_height)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepositQuery {
    pub address: Address,
    pub tokens: u64,
    pub after_height: u32,
    pub confirmations: u32,
}

/// A transaction spending the escrow output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Spend {
    pub transaction_id: Txid,
    pub confirmed_height: Option<u32>,
}

impl Spend {
    pub fn confirmations(&self, tip_height: u32) -> u32 {
        confirmations_at(self.confirmed_height, tip_height)
    }
}

fn confirmations_at(confirmed_height: Option<u32>, tip_height: u32) -> u32 {
    match confirmed_height {
        Some(height) if height <= tip_height => tip_height - height + 1,
        _ => 0,
    }
}

/// On-chain side of the node: chain tip, fee estimates, wallet keys and
/// broadcasting.
#[async_trait]
pub trait ChainNode: Send + Sync {
    async fn get_chain_height(&self) -> Result<u32>;

    /// Emits the height of every new block. Dropping the receiver ends the
    /// subscription.
    async fn subscribe_to_blocks(&self) -> Result<mpsc::Receiver<u32>>;

    async fn get_chain_fee_estimate(&self, target_blocks: u32) -> Result<FeeRate>;

    async fn broadcast_transaction(&self, tx: &Transaction) -> Result<Txid>;

    async fn create_address(&self) -> Result<Address>;

    async fn derive_key(&self, locator: KeyLocator) -> Result<PublicKey>;

    async fn sign_output(&self, request: &SignRequest) -> Result<Signature>;
}

/// Read-only chain index used to observe the escrow output.
#[async_trait]
pub trait ChainScanner: Send + Sync {
    /// Returns the first output paying `query.address` at least
    /// `query.confirmations` deep, or `None` when nothing qualifies yet.
    async fn find_deposit(&self, query: &DepositQuery) -> Result<Option<Deposit>>;

    async fn find_spend(&self, outpoint: OutPoint, after_height: u32) -> Result<Option<Spend>>;
}
