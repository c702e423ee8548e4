use anyhow::Context as _;
use bitcoin::hashes::Hash as _;
use bitcoin::{Address, FeeRate, OutPoint, PublicKey, Transaction, Txid};
use rand::Rng as _;

use super::recovery::Recovery;
use super::{Escrow, SwapDirection};
use crate::chain::htlc::{self, EscrowScript, SpendPath};
use crate::chain::{ChainNode, KeyLocator};
use crate::config::EngineConfig;
use crate::error::SwapError;
use crate::service::{InitiateSwap, InitiatedSwap, SwapService};

/// Highest non-hardened child index.
const MAX_KEY_INDEX: u32 = (1 << 31) - 1;

#[derive(Debug, Clone)]
pub struct NewEscrow {
    pub direction: SwapDirection,
    pub tokens: u64,
    pub payment_hash: [u8; 32],
    /// swap-out only.
    pub secret: Option<[u8; 32]>,
    /// swap-in only.
    pub invoice: Option<String>,
    pub funding_confirmations: u32,
}

#[derive(Debug, Clone)]
pub struct NegotiatedEscrow {
    pub escrow: Escrow,
    pub execution_request: Option<String>,
    pub funding_request: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SpendPreview {
    pub transaction: Transaction,
    pub chain_fee: u64,
}

pub struct EscrowNegotiator<'a> {
    node: &'a dyn ChainNode,
    service: &'a dyn SwapService,
    config: &'a EngineConfig,
}

impl<'a> EscrowNegotiator<'a> {
    pub fn new(
        node: &'a dyn ChainNode,
        service: &'a dyn SwapService,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            node,
            service,
            config,
        }
    }

    /// Asks the service for an escrow and checks it pays exactly the script
    /// we would build ourselves.
    pub async fn create(
        &self,
        req: &NewEscrow,
        refund_address: Option<&Address>,
    ) -> Result<NegotiatedEscrow, SwapError> {
        let start_height = self
            .node
            .get_chain_height()
            .await
            .map_err(|e| SwapError::service("get chain height", e))?;

        let key = KeyLocator {
            family: self.config.key_family,
            index: rand::thread_rng().gen_range(0..=MAX_KEY_INDEX),
        };
        let local_public_key = self
            .node
            .derive_key(key)
            .await
            .map_err(|e| SwapError::service("derive escrow key", e))?;

        let initiated = self
            .service
            .initiate_swap(&InitiateSwap {
                direction: req.direction,
                tokens: req.tokens,
                payment_hash: req.payment_hash,
                local_public_key,
                invoice: req.invoice.clone(),
                funding_confirmations: req.funding_confirmations,
            })
            .await
            .map_err(|e| SwapError::service("initiate swap", e))?;

        if req.direction == SwapDirection::Out && initiated.funding_request.is_none() {
            return Err(SwapError::service(
                "initiate swap",
                anyhow::anyhow!("service returned no funding request"),
            ));
        }

        let escrow = self.verify(req, local_public_key, &initiated, key, start_height)?;

        let available_blocks = escrow.timeout_height.saturating_sub(start_height);
        let required_blocks = self.config.required_escrow_blocks(req.funding_confirmations);
        if available_blocks < required_blocks {
            return Err(SwapError::InsufficientTimeAvailable {
                available: self.config.blocks_duration(available_blocks),
                required: self.config.blocks_duration(required_blocks),
            });
        }

        tracing::info!(
            address = %escrow.address,
            start_height,
            timeout_height = escrow.timeout_height,
            "escrow created"
        );
        log_refund_preview(&escrow, req.payment_hash, req.tokens, refund_address, self.config);

        Ok(NegotiatedEscrow {
            escrow,
            execution_request: initiated.execution_request,
            funding_request: initiated.funding_request,
        })
    }

    /// Rebuilds the escrow of a recovered swap without deriving any key.
    pub fn recover(&self, recovery: &Recovery) -> Result<Escrow, SwapError> {
        if recovery.network != self.config.network {
            return Err(SwapError::FailedToDeriveSwapAddress(format!(
                "recovery is for {}, engine runs on {}",
                recovery.network, self.config.network
            )));
        }

        let swap = &recovery.swap;
        let escrow = swap.escrow()?;
        let rebuilt = escrow.script_for(swap.id);
        if rebuilt.witness_script() != escrow.script {
            return Err(SwapError::FailedToDeriveSwapAddress(
                "recovered script does not match its escrow fields".to_owned(),
            ));
        }
        if rebuilt.address(self.config.network) != escrow.address {
            return Err(SwapError::FailedToDeriveSwapAddress(
                "recovered address does not match its script".to_owned(),
            ));
        }

        tracing::info!(
            address = %escrow.address,
            timeout_height = escrow.timeout_height,
            status = swap.status.as_str(),
            "escrow recovered"
        );
        log_refund_preview(
            escrow,
            swap.id,
            swap.tokens,
            swap.refund_address.as_ref(),
            self.config,
        );

        Ok(escrow.clone())
    }

    fn verify(
        &self,
        req: &NewEscrow,
        local_public_key: PublicKey,
        initiated: &InitiatedSwap,
        key: KeyLocator,
        start_height: u32,
    ) -> Result<Escrow, SwapError> {
        let fail = SwapError::FailedToDeriveSwapAddress;

        let parsed = EscrowScript::parse(&initiated.script, req.payment_hash)
            .map_err(|e| fail(format!("{e:#}")))?;

        let expected = EscrowScript {
            payment_hash: req.payment_hash,
            claim_public_key: initiated.claim_public_key,
            refund_public_key: initiated.refund_public_key,
            timeout_height: initiated.timeout_height,
        };
        if parsed != expected || expected.witness_script() != initiated.script {
            return Err(fail("service script does not match the escrow terms".to_owned()));
        }

        let our_key = match req.direction {
            SwapDirection::In => expected.refund_public_key,
            SwapDirection::Out => expected.claim_public_key,
        };
        if our_key != local_public_key {
            return Err(fail(format!(
                "our key is not on the {} branch",
                match req.direction {
                    SwapDirection::In => "refund",
                    SwapDirection::Out => "claim",
                }
            )));
        }

        if initiated.timeout_height <= start_height {
            return Err(fail(format!(
                "timeout height {} is not above the current height {start_height}",
                initiated.timeout_height
            )));
        }

        let address = expected.address(self.config.network);
        if address.to_string() != initiated.address {
            return Err(fail(format!(
                "service address {} does not match {address} on {}",
                initiated.address, self.config.network
            )));
        }

        Ok(Escrow {
            version: super::recovery::RECOVERY_VERSION,
            script: initiated.script.clone(),
            claim_public_key: expected.claim_public_key,
            refund_public_key: expected.refund_public_key,
            address,
            secret: req.secret,
            timeout_height: expected.timeout_height,
            start_height,
            key,
        })
    }
}

/// Path our side can always take: the claim branch when we hold the secret,
/// the timeout branch otherwise.
pub fn fallback_path(escrow: &Escrow) -> SpendPath {
    match escrow.secret {
        Some(preimage) => SpendPath::Claim { preimage },
        None => SpendPath::Refund,
    }
}

/// Unsigned fallback spend of the escrow, paying `deposit_tokens` minus the
/// fee at `fee_rate` to `destination`.
pub fn spend_preview(
    escrow: &Escrow,
    payment_hash: [u8; 32],
    outpoint: OutPoint,
    deposit_tokens: u64,
    destination: &Address,
    fee_rate: FeeRate,
) -> anyhow::Result<SpendPreview> {
    let script = escrow.script_for(payment_hash);
    let path = fallback_path(escrow);
    let vsize = htlc::estimated_spend_vsize(&script, outpoint, destination, path)?;
    let chain_fee = fee_rate
        .fee_vb(vsize)
        .context("fee overflow")?
        .to_sat();
    let output_tokens = deposit_tokens
        .checked_sub(chain_fee)
        .with_context(|| format!("deposit {deposit_tokens} does not cover fee {chain_fee}"))?;
    let transaction = htlc::unsigned_spend(&script, outpoint, destination, output_tokens, path)?;
    Ok(SpendPreview {
        transaction,
        chain_fee,
    })
}

fn log_refund_preview(
    escrow: &Escrow,
    payment_hash: [u8; 32],
    tokens: u64,
    destination: Option<&Address>,
    config: &EngineConfig,
) {
    let witness_script = hex::encode(escrow.script.as_bytes());
    let Some(destination) = destination else {
        tracing::info!(
            %witness_script,
            timeout_height = escrow.timeout_height,
            "refund preview: no refund address, keep the escrow script"
        );
        return;
    };

    let placeholder = OutPoint {
        txid: Txid::all_zeros(),
        vout: 0,
    };
    match spend_preview(
        escrow,
        payment_hash,
        placeholder,
        tokens,
        destination,
        config.min_sweep_fee_rate(),
    ) {
        Ok(preview) => tracing::info!(
            %witness_script,
            timeout_height = escrow.timeout_height,
            raw = %bitcoin::consensus::encode::serialize_hex(&preview.transaction),
            "refund preview, replace the input with the deposit outpoint"
        ),
        Err(err) => tracing::warn!(error = %format!("{err:#}"), "failed to build refund preview"),
    }
}

