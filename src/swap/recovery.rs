//! Opaque recovery token.
//!
//! A token is the lowercase hex encoding of a versioned JSON document holding
//! everything needed to resume a swap: the escrow script and the locator of
//! our escrow key, the progress marker, the accepted quote, the off-chain
//! legs and every sweep broadcast so far. Private keys never leave the node; the swap-out
//! secret is stored because it is our own.

use std::str::FromStr as _;

use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::{Address, Network, PublicKey, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};

use super::{Escrow, SettlementLeg, Swap, SwapDirection, SwapStatus};
use crate::chain::htlc::EscrowScript;
use crate::chain::sweep::SweepRecord;
use crate::chain::{Deposit, KeyLocator};
use crate::error::SwapError;

pub const RECOVERY_VERSION: u8 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recovery {
    pub network: Network,
    pub swap: Swap,
}

#[derive(Deserialize)]
struct VersionHeader {
    version: u8,
}

#[derive(Debug, Serialize, Deserialize)]
struct Document {
    version: u8,
    network: Network,
    direction: SwapDirection,
    id: String,
    tokens: u64,
    fee_budget: Option<u64>,
    service_fee: u64,
    prepay_tokens: u64,
    funding_confirmations: u32,
    status: SwapStatus,
    script: String,
    claim_public_key: PublicKey,
    refund_public_key: PublicKey,
    timeout_height: u32,
    start_height: u32,
    key: KeyLocator,
    secret: Option<String>,
    refund_address: Option<String>,
    deposit: Option<Deposit>,
    settlement: Vec<SettlementLeg>,
    #[serde(default)]
    sweeps: Vec<SweepRecord>,
    #[serde(default)]
    swept: Option<Txid>,
}

pub fn encode(swap: &Swap, network: Network) -> Result<String, SwapError> {
    let escrow = swap.escrow()?;
    let doc = Document {
        version: RECOVERY_VERSION,
        network,
        direction: swap.direction,
        id: hex::encode(swap.id),
        tokens: swap.tokens,
        fee_budget: swap.fee_budget,
        service_fee: swap.service_fee,
        prepay_tokens: swap.prepay_tokens,
        funding_confirmations: swap.funding_confirmations,
        status: swap.status,
        script: hex::encode(escrow.script.as_bytes()),
        claim_public_key: escrow.claim_public_key,
        refund_public_key: escrow.refund_public_key,
        timeout_height: escrow.timeout_height,
        start_height: escrow.start_height,
        key: escrow.key,
        secret: escrow.secret.map(hex::encode),
        refund_address: swap.refund_address.as_ref().map(ToString::to_string),
        deposit: swap.deposit.clone(),
        settlement: swap.settlement.clone(),
        sweeps: swap.sweeps.clone(),
        swept: swap.swept,
    };

    let json = serde_json::to_vec(&doc)
        .map_err(|e| SwapError::service("encode swap recovery", e.into()))?;
    Ok(hex::encode(json))
}

pub fn decode(token: &str) -> Result<Recovery, SwapError> {
    let fail = SwapError::FailedToDecodeSwapRecovery;

    let raw = hex::decode(token.trim()).map_err(|e| fail(format!("invalid hex: {e}")))?;

    let VersionHeader { version } =
        serde_json::from_slice(&raw).map_err(|e| fail(format!("invalid document: {e}")))?;
    if version != RECOVERY_VERSION {
        return Err(fail(format!("unsupported version {version}")));
    }

    let doc: Document =
        serde_json::from_slice(&raw).map_err(|e| fail(format!("invalid document: {e}")))?;

    let id = decode_32(&doc.id).map_err(|e| fail(format!("invalid id: {e}")))?;
    let script = hex::decode(&doc.script)
        .map(ScriptBuf::from_bytes)
        .map_err(|e| fail(format!("invalid script: {e}")))?;

    let parsed =
        EscrowScript::parse(&script, id).map_err(|e| fail(format!("invalid script: {e:#}")))?;
    if parsed.claim_public_key != doc.claim_public_key
        || parsed.refund_public_key != doc.refund_public_key
        || parsed.timeout_height != doc.timeout_height
    {
        return Err(fail("script does not match the escrow fields".to_owned()));
    }
    if doc.start_height > doc.timeout_height {
        return Err(fail("start height is above the timeout height".to_owned()));
    }

    let secret = match (&doc.secret, doc.direction) {
        (Some(secret), SwapDirection::Out) => {
            let secret = decode_32(secret).map_err(|e| fail(format!("invalid secret: {e}")))?;
            if sha256::Hash::hash(&secret).to_byte_array() != id {
                return Err(fail("secret does not hash to the swap id".to_owned()));
            }
            Some(secret)
        }
        (None, SwapDirection::Out) => return Err(fail("swap-out token without secret".to_owned())),
        (Some(_), SwapDirection::In) => return Err(fail("swap-in token with a secret".to_owned())),
        (None, SwapDirection::In) => None,
    };

    let refund_address = doc
        .refund_address
        .as_deref()
        .map(|address| {
            Address::from_str(address)
                .map_err(|e| e.to_string())
                .and_then(|a| a.require_network(doc.network).map_err(|e| e.to_string()))
        })
        .transpose()
        .map_err(|e| fail(format!("invalid refund address: {e}")))?;

    let escrow = Escrow {
        version: doc.version,
        address: parsed.address(doc.network),
        script,
        claim_public_key: doc.claim_public_key,
        refund_public_key: doc.refund_public_key,
        secret,
        timeout_height: doc.timeout_height,
        start_height: doc.start_height,
        key: doc.key,
    };

    Ok(Recovery {
        network: doc.network,
        swap: Swap {
            id,
            direction: doc.direction,
            tokens: doc.tokens,
            fee_budget: doc.fee_budget,
            service_fee: doc.service_fee,
            prepay_tokens: doc.prepay_tokens,
            funding_confirmations: doc.funding_confirmations,
            escrow: Some(escrow),
            status: doc.status,
            deposit: doc.deposit,
            settlement: doc.settlement,
            refund_address,
            sweeps: doc.sweeps,
            swept: doc.swept,
            recovery_token: Some(token.trim().to_owned()),
        },
    })
}

fn decode_32(s: &str) -> Result<[u8; 32], String> {
    let bytes = hex::decode(s).map_err(|e| e.to_string())?;
    bytes
        .try_into()
        .map_err(|b: Vec<u8>| format!("expected 32 bytes, got {}", b.len()))
}
