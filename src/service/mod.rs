pub mod quote;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::{PublicKey, ScriptBuf};

use crate::swap::SwapDirection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Terms {
    pub min_tokens: u64,
    pub max_tokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quote {
    /// Service fee in satoshis.
    pub fee: u64,
    /// Blocks the service wants between escrow creation and timeout.
    pub cltv_delta: u32,
    /// swap-out only: part of the fee paid up front as the execution prepay.
    pub prepay_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiateSwap {
    pub direction: SwapDirection,
    pub tokens: u64,
    pub payment_hash: [u8; 32],
    /// Our escrow key: refund key for swap-in, claim key for swap-out.
    pub local_public_key: PublicKey,
    /// swap-in only: the invoice the service pays after the deposit confirms.
    pub invoice: Option<String>,
    pub funding_confirmations: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiatedSwap {
    pub address: String,
    pub script: ScriptBuf,
    pub claim_public_key: PublicKey,
    pub refund_public_key: PublicKey,
    pub timeout_height: u32,
    /// swap-out only.
    pub execution_request: Option<String>,
    /// swap-out only.
    pub funding_request: Option<String>,
}

/// Client of the remote swap service.
#[async_trait]
pub trait SwapService: Send + Sync {
    async fn get_terms(&self, direction: SwapDirection) -> Result<Terms>;

    async fn get_quote(&self, direction: SwapDirection, tokens: u64) -> Result<Quote>;

    async fn initiate_swap(&self, request: &InitiateSwap) -> Result<InitiatedSwap>;
}
