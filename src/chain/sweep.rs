use std::ops::RangeInclusive;
use std::sync::Arc;

use bitcoin::{Address, FeeRate, Transaction, Txid};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::fees::FeeBumper;
use super::htlc::{self, EscrowScript, SpendPath};
use super::{ChainNode, ChainScanner, Deposit, KeyLocator, SignRequest};
use crate::error::SwapError;

const DUST_LIMIT_SATS: u64 = 546;

#[derive(Debug, Clone)]
pub struct SweepParams {
    pub escrow: EscrowScript,
    pub key: KeyLocator,
    pub deposit: Deposit,
    pub destination: Address,
    pub path: SpendPath,
    pub confirmations: u32,
    pub safety_buffer_blocks: u32,
    pub conf_target: u32,
    /// Height the escrow was created at, spends are only searched above it.
    pub after_height: u32,
    /// Sweeps broadcast by earlier runs of the engine, oldest first. Any of
    /// them may be the one that confirms.
    pub previous: Vec<SweepRecord>,
}

/// A sweep broadcast for a swap, kept across restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepRecord {
    pub transaction_id: Txid,
    pub fee_rate_sat_kwu: u64,
    pub output_tokens: u64,
}

impl SweepRecord {
    pub fn fee_rate(&self) -> FeeRate {
        FeeRate::from_sat_per_kwu(self.fee_rate_sat_kwu)
    }
}

#[derive(Debug, Clone)]
pub struct SweepAttempt {
    pub height: u32,
    pub fee_rate: FeeRate,
    pub chain_fee: u64,
    pub output_tokens: u64,
    pub transaction_id: Txid,
    pub transaction: Transaction,
    pub broadcast: bool,
}

impl SweepAttempt {
    pub fn record(&self) -> SweepRecord {
        SweepRecord {
            transaction_id: self.transaction_id,
            fee_rate_sat_kwu: self.fee_rate.to_sat_per_kwu(),
            output_tokens: self.output_tokens,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SweepOutcome {
    pub transaction_id: Txid,
    pub output_tokens: u64,
    pub chain_fee: u64,
    pub attempts: Vec<SweepAttempt>,
}

enum SpendCheck {
    Done(SweepOutcome),
    Waiting,
    Bump,
}

/// Claims or refunds the escrow output, once per block, until a spend of
/// ours is buried deep enough.
pub struct Sweeper {
    node: Arc<dyn ChainNode>,
    scanner: Arc<dyn ChainScanner>,
    fees: FeeBumper,
    cancel: CancellationToken,
}

impl Sweeper {
    pub fn new(
        node: Arc<dyn ChainNode>,
        scanner: Arc<dyn ChainScanner>,
        fees: FeeBumper,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            node,
            scanner,
            fees,
            cancel,
        }
    }

    pub async fn run(
        &mut self,
        params: &SweepParams,
        on_attempt: &mut (dyn FnMut(&SweepAttempt) + Send),
    ) -> Result<SweepOutcome, SwapError> {
        let mut blocks = self
            .node
            .subscribe_to_blocks()
            .await
            .map_err(|e| SwapError::service("subscribe to blocks", e))?;
        let mut attempts: Vec<SweepAttempt> = Vec::new();

        loop {
            let height = tokio::select! {
                _ = self.cancel.cancelled() => return Err(SwapError::Aborted),
                height = blocks.recv() => match height {
                    Some(height) => height,
                    None => {
                        return Err(SwapError::service(
                            "sweep escrow",
                            anyhow::anyhow!("block subscription closed"),
                        ));
                    }
                },
            };

            match self.check_spend(params, height, &attempts).await {
                Ok(SpendCheck::Done(outcome)) => return Ok(outcome),
                Ok(SpendCheck::Waiting) => continue,
                Ok(SpendCheck::Bump) => {}
                Err(err) if err.is_retryable() => {
                    tracing::warn!(height, error = %err, "escrow spend lookup failed");
                }
                Err(err) => return Err(err),
            }

            match self.candidate(params, height).await {
                Ok(Some(mut attempt)) => {
                    match self.node.broadcast_transaction(&attempt.transaction).await {
                        Ok(txid) => {
                            attempt.broadcast = true;
                            tracing::info!(
                                height,
                                %txid,
                                fee_rate_sat_vb = attempt.fee_rate.to_sat_per_vb_ceil(),
                                output_tokens = attempt.output_tokens,
                                "broadcast escrow sweep"
                            );
                        }
                        Err(err) => {
                            tracing::warn!(
                                height,
                                error = %format!("{err:#}"),
                                "sweep broadcast failed, retrying next block"
                            );
                        }
                    }
                    on_attempt(&attempt);
                    attempts.push(attempt);
                }
                Ok(None) => {}
                Err(err) if err.is_retryable() => {
                    tracing::warn!(height, error = %err, "sweep attempt failed, retrying next block");
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Produces the candidate sweep each of `heights` would get, without
    /// waiting for blocks or broadcasting anything. A claim stops at the
    /// first height too close to the timeout to confirm.
    pub async fn dry_run(
        &mut self,
        params: &SweepParams,
        heights: RangeInclusive<u32>,
    ) -> Result<Vec<SweepAttempt>, SwapError> {
        let mut attempts = Vec::new();

        for height in heights {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.candidate(params, height).await {
                Ok(Some(attempt)) => {
                    tracing::info!(
                        height,
                        txid = %attempt.transaction_id,
                        fee_rate_sat_vb = attempt.fee_rate.to_sat_per_vb_ceil(),
                        raw = %bitcoin::consensus::encode::serialize_hex(&attempt.transaction),
                        "dry-run sweep candidate"
                    );
                    attempts.push(attempt);
                }
                Ok(None) => {}
                Err(SwapError::FailedToReceiveSwapFundingConfirmationInTime) => break,
                Err(err) if err.is_retryable() => {
                    tracing::warn!(height, error = %err, "dry-run candidate failed");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(attempts)
    }

    async fn check_spend(
        &self,
        params: &SweepParams,
        height: u32,
        attempts: &[SweepAttempt],
    ) -> Result<SpendCheck, SwapError> {
        let spend = self
            .scanner
            .find_spend(params.deposit.outpoint(), params.after_height)
            .await
            .map_err(|e| SwapError::service("look up escrow spend", e))?;
        let Some(spend) = spend else {
            return Ok(SpendCheck::Bump);
        };

        let ours = attempts
            .iter()
            .rev()
            .find(|a| a.transaction_id == spend.transaction_id)
            .map(|a| (a.output_tokens, params.deposit.output_tokens - a.output_tokens))
            .or_else(|| {
                params
                    .previous
                    .iter()
                    .find(|p| p.transaction_id == spend.transaction_id)
                    .map(|p| (p.output_tokens, params.deposit.output_tokens - p.output_tokens))
            });

        let confirmations = spend.confirmations(height);
        match ours {
            Some((output_tokens, chain_fee)) if confirmations >= params.confirmations => {
                tracing::info!(
                    txid = %spend.transaction_id,
                    confirmations,
                    output_tokens,
                    "escrow sweep confirmed"
                );
                Ok(SpendCheck::Done(SweepOutcome {
                    transaction_id: spend.transaction_id,
                    output_tokens,
                    chain_fee,
                    attempts: attempts.to_vec(),
                }))
            }
            Some(_) if confirmations > 0 => {
                tracing::debug!(
                    txid = %spend.transaction_id,
                    confirmations,
                    required = params.confirmations,
                    "waiting for escrow sweep depth"
                );
                Ok(SpendCheck::Waiting)
            }
            Some(_) => Ok(SpendCheck::Bump),
            None if confirmations > 0 => Err(SwapError::EscrowSpentByCounterparty {
                transaction_id: spend.transaction_id.to_string(),
            }),
            None => {
                tracing::warn!(
                    txid = %spend.transaction_id,
                    "unknown escrow spend in mempool, outbidding"
                );
                Ok(SpendCheck::Bump)
            }
        }
    }

    async fn candidate(
        &mut self,
        params: &SweepParams,
        height: u32,
    ) -> Result<Option<SweepAttempt>, SwapError> {
        let timeout_height = params.escrow.timeout_height;

        let (is_last_chance, target) = match params.path {
            SpendPath::Claim { .. } => {
                let blocks_until_timeout = timeout_height.saturating_sub(height);
                if blocks_until_timeout < params.confirmations {
                    tracing::error!(
                        height,
                        timeout_height,
                        blocks_until_timeout,
                        confirmations = params.confirmations,
                        "not enough blocks left to confirm a claim"
                    );
                    return Err(SwapError::FailedToReceiveSwapFundingConfirmationInTime);
                }
                let is_last_chance = blocks_until_timeout
                    <= params
                        .confirmations
                        .saturating_add(params.safety_buffer_blocks);
                (
                    is_last_chance,
                    params.conf_target.min(blocks_until_timeout).max(1),
                )
            }
            SpendPath::Refund => {
                if height < timeout_height {
                    tracing::debug!(
                        height,
                        timeout_height,
                        blocks_remaining = timeout_height - height,
                        "escrow refund not yet spendable"
                    );
                    return Ok(None);
                }
                (false, params.conf_target.max(1))
            }
        };

        let estimate = match self.node.get_chain_fee_estimate(target).await {
            Ok(rate) => rate,
            Err(err) => {
                tracing::warn!(error = %format!("{err:#}"), "fee estimate failed, using floor");
                FeeRate::ZERO
            }
        };
        let fee_rate = self.fees.next(estimate, is_last_chance);
        if is_last_chance {
            tracing::warn!(
                height,
                timeout_height,
                fee_rate_sat_vb = self.fees.max().to_sat_per_vb_ceil(),
                "last safe block before the escrow times out, sweeping at the fee cap"
            );
        }

        let outpoint = params.deposit.outpoint();
        let vsize = htlc::estimated_spend_vsize(
            &params.escrow,
            outpoint,
            &params.destination,
            params.path,
        )
        .map_err(|e| SwapError::service("estimate sweep size", e))?;
        let chain_fee = fee_rate
            .fee_vb(vsize)
            .map(|fee| fee.to_sat())
            .unwrap_or(u64::MAX);

        let output_tokens = match params.deposit.output_tokens.checked_sub(chain_fee) {
            Some(tokens) if tokens > DUST_LIMIT_SATS => tokens,
            _ => {
                tracing::warn!(
                    height,
                    chain_fee,
                    deposit_tokens = params.deposit.output_tokens,
                    "sweep fee leaves a dust output, skipping block"
                );
                return Ok(None);
            }
        };

        let witness_script = params.escrow.witness_script();
        let unsigned = htlc::unsigned_spend(
            &params.escrow,
            outpoint,
            &params.destination,
            output_tokens,
            params.path,
        )
        .map_err(|e| SwapError::service("build sweep", e))?;
        let sighash =
            htlc::spend_sighash(&unsigned, &witness_script, params.deposit.output_tokens)
                .map_err(|e| SwapError::service("sighash sweep", e))?;
        let signature = self
            .node
            .sign_output(&SignRequest {
                key: params.key,
                sighash,
            })
            .await
            .map_err(|e| SwapError::service("sign sweep", e))?;
        let transaction = htlc::apply_witness(unsigned, &witness_script, signature, params.path)
            .map_err(|e| SwapError::service("finalize sweep", e))?;

        Ok(Some(SweepAttempt {
            height,
            fee_rate,
            chain_fee,
            output_tokens,
            transaction_id: transaction.compute_txid(),
            transaction,
            broadcast: false,
        }))
    }
}
