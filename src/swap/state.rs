use serde::{Deserialize, Serialize};

use super::SwapDirection;
use crate::error::SwapError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapStatus {
    Quoting,
    EscrowCreated,
    AwaitingDeposit,
    SettlingOffchain,
    AwaitingConfirmation,
    Sweeping,
    Refunding,
    Complete,
    Failed,
}

impl SwapStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SwapStatus::Quoting => "quoting",
            SwapStatus::EscrowCreated => "escrow_created",
            SwapStatus::AwaitingDeposit => "awaiting_deposit",
            SwapStatus::SettlingOffchain => "settling_offchain",
            SwapStatus::AwaitingConfirmation => "awaiting_confirmation",
            SwapStatus::Sweeping => "sweeping",
            SwapStatus::Refunding => "refunding",
            SwapStatus::Complete => "complete",
            SwapStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SwapStatus::Complete | SwapStatus::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    QuoteAccepted,
    EscrowReady,
    /// A recovered swap jumps from `EscrowCreated` to the progress marker
    /// stored in its token.
    Resumed { to: SwapStatus },
    DepositConfirmed,
    OffchainSettled,
    SweepStarted,
    SweepConfirmed,
    FundingTimedOut {
        blocks_remaining: u32,
        confirmations_required: u32,
        deposit_seen: bool,
    },
    SettlementTimedOut,
    Fault,
    Abort,
}

impl Event {
    pub fn as_str(&self) -> &'static str {
        match self {
            Event::QuoteAccepted => "quote_accepted",
            Event::EscrowReady => "escrow_ready",
            Event::Resumed { .. } => "resumed",
            Event::DepositConfirmed => "deposit_confirmed",
            Event::OffchainSettled => "offchain_settled",
            Event::SweepStarted => "sweep_started",
            Event::SweepConfirmed => "sweep_confirmed",
            Event::FundingTimedOut { .. } => "funding_timed_out",
            Event::SettlementTimedOut => "settlement_timed_out",
            Event::Fault => "fault",
            Event::Abort => "abort",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Re-encode the recovery token for the new status.
    WriteRecovery,
    /// Stop block and payment subscriptions.
    ReleaseSubscriptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub next: SwapStatus,
    pub effects: Vec<Effect>,
}

/// Statuses a swap passes through on its happy path, in order.
pub fn happy_path(direction: SwapDirection) -> &'static [SwapStatus] {
    use SwapStatus::*;
    match direction {
        SwapDirection::In => &[
            Quoting,
            EscrowCreated,
            AwaitingDeposit,
            SettlingOffchain,
            Complete,
        ],
        SwapDirection::Out => &[
            Quoting,
            EscrowCreated,
            SettlingOffchain,
            AwaitingDeposit,
            AwaitingConfirmation,
            Sweeping,
            Complete,
        ],
    }
}

/// Computes the status following `status` on `event`. Never moves a swap
/// backwards.
pub fn transition(
    direction: SwapDirection,
    status: SwapStatus,
    event: Event,
) -> Result<Transition, SwapError> {
    use SwapStatus::*;

    let invalid = || SwapError::InvalidTransition {
        from: status.as_str(),
        event: event.as_str(),
    };

    if status.is_terminal() {
        return Err(invalid());
    }

    let next = match (direction, status, event) {
        (_, _, Event::Abort | Event::Fault) => Failed,

        (_, Quoting, Event::QuoteAccepted) => EscrowCreated,
        (SwapDirection::In, EscrowCreated, Event::EscrowReady) => AwaitingDeposit,
        (SwapDirection::Out, EscrowCreated, Event::EscrowReady) => SettlingOffchain,
        (_, EscrowCreated, Event::Resumed { to }) => {
            let resumable = to == Refunding
                || happy_path(direction)
                    .iter()
                    .skip_while(|s| **s != EscrowCreated)
                    .skip(1)
                    .any(|s| *s == to && !s.is_terminal());
            if !resumable {
                return Err(invalid());
            }
            to
        }

        (SwapDirection::In, AwaitingDeposit, Event::DepositConfirmed) => SettlingOffchain,
        (SwapDirection::In, SettlingOffchain, Event::OffchainSettled) => Complete,
        (SwapDirection::In, SettlingOffchain, Event::SettlementTimedOut) => Refunding,
        (SwapDirection::In, AwaitingDeposit, Event::FundingTimedOut { deposit_seen, .. }) => {
            if deposit_seen {
                Refunding
            } else {
                Failed
            }
        }

        (SwapDirection::Out, SettlingOffchain, Event::OffchainSettled) => AwaitingDeposit,
        (SwapDirection::Out, SettlingOffchain, Event::SettlementTimedOut) => Failed,
        (SwapDirection::Out, AwaitingDeposit, Event::DepositConfirmed) => AwaitingConfirmation,
        (
            SwapDirection::Out,
            AwaitingDeposit,
            Event::FundingTimedOut {
                blocks_remaining,
                confirmations_required,
                deposit_seen,
            },
        ) => {
            if deposit_seen && blocks_remaining > confirmations_required {
                Refunding
            } else {
                Failed
            }
        }
        (SwapDirection::Out, AwaitingConfirmation, Event::SweepStarted) => Sweeping,
        (SwapDirection::Out, Sweeping, Event::SweepConfirmed) => Complete,

        (_, Refunding, Event::SweepConfirmed) => Complete,
        // The invoice settled late and the service claimed the escrow with
        // the preimage it learned.
        (SwapDirection::In, Refunding, Event::OffchainSettled) => Complete,

        _ => return Err(invalid()),
    };

    let mut effects = vec![Effect::WriteRecovery];
    if next.is_terminal() {
        effects.push(Effect::ReleaseSubscriptions);
    }
    Ok(Transition { next, effects })
}
