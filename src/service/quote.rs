use super::{SwapService, Terms};
use crate::config::EngineConfig;
use crate::error::SwapError;
use crate::swap::SwapDirection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuoteRequest {
    pub direction: SwapDirection,
    pub tokens: u64,
    pub max_fee: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptedQuote {
    pub tokens: u64,
    pub fee: u64,
    pub prepay_tokens: u64,
    pub cltv_delta: u32,
}

impl AcceptedQuote {
    /// Amount of the swap-out funding payment.
    pub fn funding_tokens(&self) -> u64 {
        self.tokens
            .saturating_add(self.fee)
            .saturating_sub(self.prepay_tokens)
    }
}

/// Fetches terms and a quote from the service and checks them against the
/// request and the engine's limits. Read-only.
pub async fn validate_quote(
    service: &dyn SwapService,
    config: &EngineConfig,
    req: &QuoteRequest,
) -> Result<AcceptedQuote, SwapError> {
    if req.tokens == 0 {
        return Err(SwapError::InvalidParameter {
            field: "tokens",
            reason: "must be > 0".to_owned(),
        });
    }

    let Terms {
        min_tokens,
        max_tokens,
    } = service
        .get_terms(req.direction)
        .await
        .map_err(|e| SwapError::service("get swap terms", e))?;

    if req.tokens < min_tokens {
        return Err(SwapError::AmountBelowMinimum {
            tokens: req.tokens,
            min_tokens,
        });
    }
    if req.tokens > max_tokens {
        return Err(SwapError::AmountExceedsMaximum {
            tokens: req.tokens,
            max_tokens,
        });
    }

    let quote = service
        .get_quote(req.direction, req.tokens)
        .await
        .map_err(|e| SwapError::service("get swap quote", e))?;

    if let Some(max_fee) = req.max_fee
        && quote.fee > max_fee
    {
        return Err(SwapError::FeeExceedsUserLimit {
            fee: quote.fee,
            max_fee,
        });
    }

    let fee_ceiling =
        (u128::from(req.tokens) * u128::from(config.max_service_fee_ppm) / 1_000_000) as u64;
    if quote.fee > fee_ceiling {
        return Err(SwapError::ServiceFeeTooHigh {
            fee: quote.fee,
            max_fee: fee_ceiling,
            tokens: req.tokens,
        });
    }

    if req.direction == SwapDirection::In && quote.fee >= req.tokens {
        return Err(SwapError::AmountBelowMinimum {
            tokens: req.tokens,
            min_tokens: quote.fee.saturating_add(1),
        });
    }

    if req.direction == SwapDirection::Out
        && quote.prepay_tokens > quote.fee.saturating_add(req.tokens)
    {
        return Err(SwapError::InvalidParameter {
            field: "prepay_tokens",
            reason: format!("prepay {} exceeds tokens plus fee", quote.prepay_tokens),
        });
    }

    let available = config.blocks_duration(quote.cltv_delta);
    if available < config.min_swap_duration() {
        return Err(SwapError::InsufficientTimeAvailable {
            available,
            required: config.min_swap_duration(),
        });
    }

    tracing::info!(
        direction = req.direction.as_str(),
        tokens = req.tokens,
        fee = quote.fee,
        prepay_tokens = quote.prepay_tokens,
        cltv_delta = quote.cltv_delta,
        "accepted swap quote"
    );

    Ok(AcceptedQuote {
        tokens: req.tokens,
        fee: quote.fee,
        prepay_tokens: if req.direction == SwapDirection::Out {
            quote.prepay_tokens
        } else {
            0
        },
        cltv_delta: quote.cltv_delta,
    })
}
