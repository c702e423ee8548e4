use std::time::Duration;

/// Coarse classification the orchestrator uses to decide between retrying,
/// refunding and aborting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or conflicting caller input. Never retried.
    Parameter,
    /// A collaborator was unavailable or timed out. Retryable.
    Service,
    /// Protocol violation or corrupt state. Aborts the swap.
    Fatal,
    /// Not enough blocks left to finish a confirmation-bound step.
    Timing,
}

#[derive(Debug, thiserror::Error)]
pub enum SwapError {
    #[error("tokens and recovery are mutually exclusive")]
    ConflictingOptions,
    #[error("tokens are required when no recovery token is given")]
    MissingTokens,
    #[error("recovery token is for a {found} swap, expected {expected}")]
    RecoveryDirectionMismatch {
        expected: &'static str,
        found: &'static str,
    },
    #[error("invalid {field}: {reason}")]
    InvalidParameter { field: &'static str, reason: String },

    #[error("amount {tokens} is below the service minimum {min_tokens}")]
    AmountBelowMinimum { tokens: u64, min_tokens: u64 },
    #[error("amount {tokens} exceeds the service maximum {max_tokens}")]
    AmountExceedsMaximum { tokens: u64, max_tokens: u64 },
    #[error("quoted fee {fee} exceeds the maximum fee {max_fee}")]
    FeeExceedsUserLimit { fee: u64, max_fee: u64 },
    #[error("quoted fee {fee} exceeds the fee ceiling {max_fee} for {tokens} tokens")]
    ServiceFeeTooHigh { fee: u64, max_fee: u64, tokens: u64 },
    #[error("swap would time out in {available:?}, at least {required:?} is needed")]
    InsufficientTimeAvailable {
        available: Duration,
        required: Duration,
    },

    #[error("failed to derive swap address: {0}")]
    FailedToDeriveSwapAddress(String),
    #[error("failed to decode swap recovery: {0}")]
    FailedToDecodeSwapRecovery(String),
    #[error("deposit of {output_tokens} is below the requested {tokens}")]
    DepositUnderfunded { output_tokens: u64, tokens: u64 },
    #[error("execution prepay of {actual} does not match the quoted {expected}")]
    UnexpectedUnilateralDepositTokensAmount { expected: u64, actual: u64 },
    #[error("funding payment of {actual} does not match the quoted {expected}")]
    UnexpectedServiceCostForSwap { expected: u64, actual: u64 },
    #[error("funding payment request does not pay the swap hash")]
    UnexpectedSwapPaymentHash,
    #[error("route fee {fee_mtokens} msat exceeds the limit {max_fee_mtokens} msat")]
    RoutingFeeExceedsLimit {
        fee_mtokens: u64,
        max_fee_mtokens: u64,
    },
    #[error("off-chain payment {payment_id} failed")]
    PaymentFailed { payment_id: String },
    #[error("invoice was canceled before settlement")]
    InvoiceCanceled,
    #[error("escrow was spent by transaction {transaction_id} which is not ours")]
    EscrowSpentByCounterparty { transaction_id: String },
    #[error("invalid transition from {from} on {event}")]
    InvalidTransition {
        from: &'static str,
        event: &'static str,
    },
    #[error("swap aborted")]
    Aborted,

    #[error("failed to receive swap funding confirmation in time")]
    FailedToReceiveSwapFundingConfirmationInTime,

    #[error("no route found for payment {payment_id}: {reason}")]
    PathfindingFailed { payment_id: String, reason: String },
    #[error("timed out waiting for {0}")]
    TimedOut(&'static str),
    #[error("{context}: {source:#}")]
    Service {
        context: &'static str,
        source: anyhow::Error,
    },
}

impl SwapError {
    pub fn service(context: &'static str, source: anyhow::Error) -> Self {
        Self::Service { context, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ConflictingOptions
            | Self::MissingTokens
            | Self::RecoveryDirectionMismatch { .. }
            | Self::InvalidParameter { .. }
            | Self::AmountBelowMinimum { .. }
            | Self::AmountExceedsMaximum { .. }
            | Self::FeeExceedsUserLimit { .. }
            | Self::ServiceFeeTooHigh { .. } => ErrorKind::Parameter,

            Self::InsufficientTimeAvailable { .. }
            | Self::FailedToReceiveSwapFundingConfirmationInTime => ErrorKind::Timing,

            Self::PathfindingFailed { .. } | Self::TimedOut(_) | Self::Service { .. } => {
                ErrorKind::Service
            }

            Self::FailedToDeriveSwapAddress(_)
            | Self::FailedToDecodeSwapRecovery(_)
            | Self::DepositUnderfunded { .. }
            | Self::UnexpectedUnilateralDepositTokensAmount { .. }
            | Self::UnexpectedServiceCostForSwap { .. }
            | Self::UnexpectedSwapPaymentHash
            | Self::RoutingFeeExceedsLimit { .. }
            | Self::PaymentFailed { .. }
            | Self::InvoiceCanceled
            | Self::EscrowSpentByCounterparty { .. }
            | Self::InvalidTransition { .. }
            | Self::Aborted => ErrorKind::Fatal,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Service
    }
}
