use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::{ChainScanner, Deposit, DepositQuery};
use crate::error::SwapError;

#[derive(Debug, Clone, Copy)]
pub struct FundingPolicy {
    pub mempool_check_attempts: u32,
    pub poll_interval: Duration,
    pub poll_attempts: u32,
    pub timeout: Duration,
}

/// Why a deposit wait ended without a confirmed deposit.
#[derive(Debug)]
pub struct FundingFailure {
    pub error: SwapError,
    /// Deposit seen before the wait gave up, confirmed or not.
    pub seen: Option<Deposit>,
}

impl From<SwapError> for FundingFailure {
    fn from(error: SwapError) -> Self {
        Self { error, seen: None }
    }
}

pub struct FundingMonitor {
    scanner: Arc<dyn ChainScanner>,
    policy: FundingPolicy,
    cancel: CancellationToken,
}

impl FundingMonitor {
    pub fn new(
        scanner: Arc<dyn ChainScanner>,
        policy: FundingPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            scanner,
            policy,
            cancel,
        }
    }

    /// Waits for the escrow deposit to reach `query.confirmations`.
    pub async fn wait_for_deposit(
        &self,
        query: &DepositQuery,
    ) -> std::result::Result<Deposit, FundingFailure> {
        let mut seen = None;

        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => Err(SwapError::Aborted),
            res = tokio::time::timeout(self.policy.timeout, self.poll(query, &mut seen)) => {
                match res {
                    Ok(res) => res,
                    Err(_) => {
                        tracing::warn!(
                            address = %query.address,
                            timeout_secs = self.policy.timeout.as_secs(),
                            "timed out waiting for swap funding confirmation"
                        );
                        Err(SwapError::FailedToReceiveSwapFundingConfirmationInTime)
                    }
                }
            }
        };

        match outcome {
            Ok(deposit) => Ok(deposit),
            Err(error) => Err(FundingFailure { error, seen }),
        }
    }

    async fn poll(
        &self,
        query: &DepositQuery,
        seen: &mut Option<Deposit>,
    ) -> Result<Deposit, SwapError> {
        let unconfirmed = DepositQuery {
            confirmations: 0,
            ..query.clone()
        };

        for _ in 0..self.policy.mempool_check_attempts {
            match self.scanner.find_deposit(&unconfirmed).await {
                Ok(Some(deposit)) => {
                    tracing::info!(
                        address = %query.address,
                        txid = %deposit.transaction_id,
                        vout = deposit.output_index,
                        output_tokens = deposit.output_tokens,
                        "swap deposit seen"
                    );
                    if deposit.output_tokens < query.tokens {
                        tracing::warn!(
                            output_tokens = deposit.output_tokens,
                            tokens = query.tokens,
                            "unconfirmed swap deposit is below the requested amount"
                        );
                    }
                    *seen = Some(deposit);
                    break;
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::debug!(error = %format!("{err:#}"), "mempool deposit check failed");
                }
            }
            tokio::time::sleep(self.policy.poll_interval).await;
        }

        for attempt in 1..=self.policy.poll_attempts {
            match self.scanner.find_deposit(query).await {
                Ok(Some(deposit)) => {
                    *seen = Some(deposit.clone());
                    if deposit.output_tokens < query.tokens {
                        return Err(SwapError::DepositUnderfunded {
                            output_tokens: deposit.output_tokens,
                            tokens: query.tokens,
                        });
                    }
                    tracing::info!(
                        txid = %deposit.transaction_id,
                        confirmed_height = ?deposit.confirmed_height,
                        confirmations = query.confirmations,
                        "swap deposit confirmed"
                    );
                    return Ok(deposit);
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(
                        attempt,
                        error = %format!("{err:#}"),
                        "deposit lookup failed, retrying"
                    );
                }
            }
            tokio::time::sleep(self.policy.poll_interval).await;
        }

        Err(SwapError::FailedToReceiveSwapFundingConfirmationInTime)
    }
}
