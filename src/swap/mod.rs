pub mod engine;
pub mod escrow;
pub mod recovery;
pub mod state;

use bitcoin::{Address, PublicKey, ScriptBuf, Txid};
use serde::{Deserialize, Serialize};

use crate::chain::htlc::EscrowScript;
use crate::chain::sweep::SweepRecord;
use crate::chain::{Deposit, KeyLocator};
use crate::error::SwapError;

pub use state::SwapStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwapDirection {
    In,
    Out,
}

impl SwapDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            SwapDirection::In => "swap-in",
            SwapDirection::Out => "swap-out",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Escrow {
    pub version: u8,
    pub script: ScriptBuf,
    pub claim_public_key: PublicKey,
    pub refund_public_key: PublicKey,
    pub address: Address,
    /// Preimage of the swap hash. Only present for swap-out.
    pub secret: Option<[u8; 32]>,
    pub timeout_height: u32,
    pub start_height: u32,
    /// Locator of our own escrow key.
    pub key: KeyLocator,
}

impl Escrow {
    pub fn script_for(&self, payment_hash: [u8; 32]) -> EscrowScript {
        EscrowScript {
            payment_hash,
            claim_public_key: self.claim_public_key,
            refund_public_key: self.refund_public_key,
            timeout_height: self.timeout_height,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LegKind {
    /// Invoice we receive on in swap-in.
    Invoice,
    /// Prepay for the service's on-chain costs in swap-out.
    Execution,
    /// Payment of the swapped amount plus fee in swap-out.
    Funding,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementLeg {
    pub kind: LegKind,
    pub request: String,
    pub payment_id: String,
    pub is_confirmed: bool,
    pub mtokens: u64,
    pub fee_mtokens: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Swap {
    /// Payment hash identifying the swap.
    pub id: [u8; 32],
    pub direction: SwapDirection,
    pub tokens: u64,
    pub fee_budget: Option<u64>,
    pub service_fee: u64,
    pub prepay_tokens: u64,
    pub funding_confirmations: u32,
    pub escrow: Option<Escrow>,
    pub status: SwapStatus,
    pub deposit: Option<Deposit>,
    pub settlement: Vec<SettlementLeg>,
    pub refund_address: Option<Address>,
    /// Every sweep broadcast so far, oldest first.
    pub sweeps: Vec<SweepRecord>,
    /// The sweep that confirmed.
    pub swept: Option<Txid>,
    pub recovery_token: Option<String>,
}

impl Swap {
    pub fn id_hex(&self) -> String {
        hex::encode(self.id)
    }

    pub fn escrow(&self) -> Result<&Escrow, SwapError> {
        self.escrow.as_ref().ok_or(SwapError::InvalidTransition {
            from: self.status.as_str(),
            event: "escrow required",
        })
    }

    pub fn leg(&self, kind: LegKind) -> Option<&SettlementLeg> {
        self.settlement.iter().find(|leg| leg.kind == kind)
    }

    pub fn upsert_leg(&mut self, leg: SettlementLeg) {
        match self.settlement.iter_mut().find(|l| l.kind == leg.kind) {
            Some(existing) => *existing = leg,
            None => self.settlement.push(leg),
        }
    }

    /// Records a broadcast sweep. Rebroadcasts of a known transaction are
    /// ignored.
    pub fn record_sweep(&mut self, record: SweepRecord) {
        if !self
            .sweeps
            .iter()
            .any(|s| s.transaction_id == record.transaction_id)
        {
            self.sweeps.push(record);
        }
    }

    pub fn confirmed_sweep(&self) -> Option<&SweepRecord> {
        let txid = self.swept?;
        self.sweeps.iter().find(|s| s.transaction_id == txid)
    }

    pub fn routing_fee(&self) -> u64 {
        let fee_mtokens: u64 = self
            .settlement
            .iter()
            .filter(|leg| leg.kind != LegKind::Invoice)
            .map(|leg| leg.fee_mtokens)
            .sum();
        fee_mtokens.div_ceil(1_000)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwapSummary {
    pub id: String,
    pub direction: SwapDirection,
    pub is_complete: bool,
    pub is_refunded: bool,
    pub tokens: u64,
    pub service_fee: u64,
    pub routing_fee: u64,
    pub chain_fee_paid: u64,
    pub received_offchain: u64,
    pub received_onchain: u64,
    pub sweep_transaction_id: Option<Txid>,
}

#[derive(Debug, Clone)]
pub enum SwapEvent {
    Timing {
        id: String,
        earliest_completion_secs: u64,
        forfeiture_height: u32,
        forfeiture_secs: u64,
    },
    StatusChanged {
        id: String,
        from: SwapStatus,
        to: SwapStatus,
    },
    RecoveryUpdated {
        id: String,
        token: String,
    },
    DepositSeen {
        id: String,
        transaction_id: Txid,
        output_tokens: u64,
    },
    DepositConfirmed {
        id: String,
        transaction_id: Txid,
        output_tokens: u64,
        confirmed_height: Option<u32>,
    },
    PaymentSettled {
        id: String,
        kind: LegKind,
        mtokens: u64,
        fee_mtokens: u64,
    },
    SweepAttempt {
        id: String,
        height: u32,
        transaction_id: Txid,
        fee_rate_sat_vb: u64,
        output_tokens: u64,
        broadcast: bool,
    },
    Completed(SwapSummary),
    Failed {
        id: String,
        error: String,
    },
}
