//! In-memory node, swap service and chain index shared by the swap tests.
//!
//! The harness keeps a single chain tip that only moves on `mine_block`.
//! Mining confirms pending deposits and escrow spends, then notifies block
//! subscribers. The swap service side builds escrows with its own fixed key
//! and, for swap-out, deposits into the escrow once the funding payment
//! arrives.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{All, Message, PublicKey as NodeId, Secp256k1, SecretKey};
use bitcoin::{Address, FeeRate, Network, OutPoint, PublicKey, Transaction, Txid};
use tokio::sync::{broadcast, mpsc};

use ln_chain_swap::chain::htlc::EscrowScript;
use ln_chain_swap::chain::{
    ChainNode, ChainScanner, Deposit, DepositQuery, KeyLocator, SignRequest, Spend,
};
use ln_chain_swap::lightning::{
    CreatedInvoice, DecodedRequest, InvoiceRequest, InvoiceStatus, PaymentNode, PaymentResult,
    PaymentStatus, Route, RouteQuery,
};
use ln_chain_swap::service::{InitiateSwap, InitiatedSwap, Quote, SwapService, Terms};
use ln_chain_swap::swap::recovery;
use ln_chain_swap::{EngineConfig, SwapDirection, SwapEngine, SwapEvent};

pub const START_HEIGHT: u32 = 100;
const CHANNEL_CAPACITY: usize = 64;
const SERVICE_KEY: [u8; 32] = [7u8; 32];
const WALLET_KEY: [u8; 32] = [8u8; 32];
const ROUTE_CLTV_DELTA: u32 = 40;

/// Engine settings scaled down for an in-memory chain.
pub fn test_config() -> EngineConfig {
    EngineConfig {
        network: Network::Regtest,
        block_time_secs: 600,
        min_swap_duration_secs: 0,
        funding_confirmations: 1,
        sweep_confirmations: 2,
        safety_buffer_blocks: 6,
        mempool_check_attempts: 1,
        funding_poll_interval_ms: 10,
        funding_poll_attempts: 10_000,
        funding_timeout_secs: 10,
        settlement_timeout_secs: 10,
        ..EngineConfig::default()
    }
}

#[derive(Debug, Clone)]
pub struct InitiatedEscrow {
    pub direction: SwapDirection,
    pub payment_hash: [u8; 32],
    pub address: Address,
    pub tokens: u64,
}

struct Invoice {
    tokens: u64,
    status: InvoiceStatus,
    subscribers: Vec<mpsc::Sender<InvoiceStatus>>,
}

struct State {
    height: u32,
    block_subscribers: Vec<mpsc::Sender<u32>>,
    fee_estimate: FeeRate,
    broadcasts: Vec<Transaction>,
    spends: HashMap<OutPoint, Spend>,
    mine_spends: bool,
    deposits: Vec<(Address, Deposit)>,
    confirm_deposits: bool,
    nonce: u64,
    derive_key_calls: usize,

    terms: Terms,
    quote: Quote,
    escrows: Vec<InitiatedEscrow>,
    deposit_on_funding: bool,
    wrong_escrow_address: bool,

    requests: HashMap<String, DecodedRequest>,
    preimages: HashMap<[u8; 32], [u8; 32]>,
    invoices: HashMap<[u8; 32], Invoice>,
    cancel_requests: Vec<[u8; 32]>,
    cancel_fails: bool,
    payments: HashMap<[u8; 32], PaymentStatus>,
    pay_route_calls: usize,
    route_fee_mtokens: u64,
    pathfinding_fails: bool,
}

pub struct Harness {
    network: Network,
    secp: Secp256k1<All>,
    state: Mutex<State>,
}

impl Harness {
    pub fn new(network: Network) -> Arc<Self> {
        Arc::new(Self {
            network,
            secp: Secp256k1::new(),
            state: Mutex::new(State {
                height: START_HEIGHT,
                block_subscribers: Vec::new(),
                fee_estimate: FeeRate::from_sat_per_vb_unchecked(5),
                broadcasts: Vec::new(),
                spends: HashMap::new(),
                mine_spends: true,
                deposits: Vec::new(),
                confirm_deposits: true,
                nonce: 0,
                derive_key_calls: 0,
                terms: Terms {
                    min_tokens: 10_000,
                    max_tokens: 10_000_000,
                },
                quote: Quote {
                    fee: 5_000,
                    cltv_delta: 500,
                    prepay_tokens: 0,
                },
                escrows: Vec::new(),
                deposit_on_funding: true,
                wrong_escrow_address: false,
                requests: HashMap::new(),
                preimages: HashMap::new(),
                invoices: HashMap::new(),
                cancel_requests: Vec::new(),
                cancel_fails: false,
                payments: HashMap::new(),
                pay_route_calls: 0,
                route_fee_mtokens: 1_000,
                pathfinding_fails: false,
            }),
        })
    }

    pub fn engine(self: &Arc<Self>, config: EngineConfig) -> SwapEngine {
        SwapEngine::new(
            self.clone(),
            self.clone(),
            self.clone(),
            self.clone(),
            config,
        )
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("harness state poisoned")
    }

    pub fn height(&self) -> u32 {
        self.lock().height
    }

    /// Advances the tip by one block and returns the new height.
    pub fn mine_block(&self) -> u32 {
        let mut state = self.lock();
        state.height += 1;
        let height = state.height;

        if state.mine_spends {
            let mut mined = Vec::new();
            for (outpoint, spend) in state.spends.iter_mut() {
                if spend.confirmed_height.is_none() {
                    spend.confirmed_height = Some(height);
                    mined.push(*outpoint);
                }
            }
            // A mined spend pulls its parent into the same block.
            for (_, deposit) in state.deposits.iter_mut() {
                if deposit.confirmed_height.is_none() && mined.contains(&deposit.outpoint()) {
                    deposit.confirmed_height = Some(height);
                }
            }
        }
        if state.confirm_deposits {
            for (_, deposit) in state.deposits.iter_mut() {
                if deposit.confirmed_height.is_none() {
                    deposit.confirmed_height = Some(height);
                }
            }
        }

        state
            .block_subscribers
            .retain(|tx| !matches!(tx.try_send(height), Err(mpsc::error::TrySendError::Closed(_))));
        height
    }

    pub fn block_subscribers(&self) -> usize {
        self.lock()
            .block_subscribers
            .iter()
            .filter(|tx| !tx.is_closed())
            .count()
    }

    /// Ends every block subscription once queued heights are drained.
    pub fn close_block_streams(&self) {
        self.lock().block_subscribers.clear();
    }

    pub fn set_fee_estimate(&self, sat_per_vb: u64) {
        self.lock().fee_estimate = FeeRate::from_sat_per_vb_unchecked(sat_per_vb);
    }

    pub fn set_mine_spends(&self, enabled: bool) {
        self.lock().mine_spends = enabled;
    }

    pub fn set_confirm_deposits(&self, enabled: bool) {
        self.lock().confirm_deposits = enabled;
    }

    /// Puts a deposit to `address` in the mempool.
    pub fn deposit(&self, address: &Address, tokens: u64) -> Deposit {
        let mut state = self.lock();
        state.nonce += 1;
        let deposit = Deposit {
            transaction_id: Txid::hash(&state.nonce.to_le_bytes()),
            output_index: 0,
            output_tokens: tokens,
            confirmed_height: None,
        };
        state.deposits.push((address.clone(), deposit.clone()));
        deposit
    }

    /// Records a spend of `outpoint` nobody in the test broadcast.
    pub fn inject_spend(&self, outpoint: OutPoint, confirmed: bool) -> Txid {
        let mut state = self.lock();
        state.nonce += 1;
        let transaction_id = Txid::hash(&state.nonce.to_be_bytes());
        let confirmed_height = confirmed.then_some(state.height);
        state.spends.insert(
            outpoint,
            Spend {
                transaction_id,
                confirmed_height,
            },
        );
        transaction_id
    }

    /// Mines `tx` in place of whatever spend of its input is pending, the way
    /// an earlier replacement can still win.
    pub fn confirm_spend(&self, tx: &Transaction) -> Result<()> {
        let input = tx.input.first().context("transaction has no input")?;
        let mut state = self.lock();
        let confirmed_height = Some(state.height);
        state.spends.insert(
            input.previous_output,
            Spend {
                transaction_id: tx.compute_txid(),
                confirmed_height,
            },
        );
        Ok(())
    }

    pub fn broadcasts(&self) -> Vec<Transaction> {
        self.lock().broadcasts.clone()
    }

    pub fn derive_key_calls(&self) -> usize {
        self.lock().derive_key_calls
    }

    pub fn wallet_address(&self) -> Address {
        let secret = SecretKey::from_slice(&WALLET_KEY).expect("valid wallet key");
        Address::p2wpkh(
            &CompressedPublicKey(secret.public_key(&self.secp)),
            self.network,
        )
    }

    pub fn set_terms(&self, min_tokens: u64, max_tokens: u64) {
        self.lock().terms = Terms {
            min_tokens,
            max_tokens,
        };
    }

    pub fn set_quote(&self, fee: u64, cltv_delta: u32, prepay_tokens: u64) {
        self.lock().quote = Quote {
            fee,
            cltv_delta,
            prepay_tokens,
        };
    }

    pub fn set_deposit_on_funding(&self, enabled: bool) {
        self.lock().deposit_on_funding = enabled;
    }

    pub fn set_wrong_escrow_address(&self, enabled: bool) {
        self.lock().wrong_escrow_address = enabled;
    }

    pub fn escrows(&self) -> Vec<InitiatedEscrow> {
        self.lock().escrows.clone()
    }

    pub fn service_node_id(&self) -> NodeId {
        SecretKey::from_slice(&SERVICE_KEY)
            .expect("valid service key")
            .public_key(&self.secp)
    }

    /// Registers a payment request the node can decode and the service can
    /// settle with `preimage`.
    pub fn register_request(&self, tokens: u64, id: [u8; 32], preimage: Option<[u8; 32]>) -> String {
        let request = format!("lnbcrt{tokens}n1{}", hex::encode(id));
        let decoded = DecodedRequest {
            id,
            destination: self.service_node_id(),
            tokens,
            mtokens: tokens * 1_000,
            cltv_delta: ROUTE_CLTV_DELTA,
        };
        let mut state = self.lock();
        state.requests.insert(request.clone(), decoded);
        if let Some(preimage) = preimage {
            state.preimages.insert(id, preimage);
        }
        request
    }

    pub fn record_payment(&self, id: [u8; 32], status: PaymentStatus) {
        self.lock().payments.insert(id, status);
    }

    pub fn pay_route_calls(&self) -> usize {
        self.lock().pay_route_calls
    }

    pub fn set_route_fee_mtokens(&self, fee_mtokens: u64) {
        self.lock().route_fee_mtokens = fee_mtokens;
    }

    pub fn set_pathfinding_fails(&self, fails: bool) {
        self.lock().pathfinding_fails = fails;
    }

    /// Pays an open invoice the way the service would.
    pub fn settle_invoice(&self, id: [u8; 32]) -> Result<u64> {
        let mut state = self.lock();
        let invoice = state.invoices.get_mut(&id).context("unknown invoice")?;
        anyhow::ensure!(invoice.status == InvoiceStatus::Open, "invoice is not open");
        let received_mtokens = invoice.tokens * 1_000;
        set_invoice_status(invoice, InvoiceStatus::Settled { received_mtokens });
        Ok(received_mtokens)
    }

    /// Cancels an invoice on the node side, as expiry would.
    pub fn expire_invoice(&self, id: [u8; 32]) -> Result<()> {
        let mut state = self.lock();
        let invoice = state.invoices.get_mut(&id).context("unknown invoice")?;
        set_invoice_status(invoice, InvoiceStatus::Canceled);
        Ok(())
    }

    pub fn invoice_status(&self, id: [u8; 32]) -> Option<InvoiceStatus> {
        self.lock().invoices.get(&id).map(|invoice| invoice.status)
    }

    /// Payment hashes the engine asked to cancel, in order.
    pub fn cancel_requests(&self) -> Vec<[u8; 32]> {
        self.lock().cancel_requests.clone()
    }

    pub fn set_cancel_fails(&self, fails: bool) {
        self.lock().cancel_fails = fails;
    }

    /// Lets the service learn swap-out secrets from the recovery tokens the
    /// engine publishes, the way it would learn them from the claim.
    pub fn follow(self: &Arc<Self>, mut events: broadcast::Receiver<SwapEvent>) {
        let harness = self.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SwapEvent::RecoveryUpdated { token, .. }) => {
                        let Ok(recovery) = recovery::decode(&token) else {
                            continue;
                        };
                        if let Some(secret) =
                            recovery.swap.escrow.as_ref().and_then(|escrow| escrow.secret)
                        {
                            harness.lock().preimages.insert(recovery.swap.id, secret);
                        }
                    }
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    fn secret_for(&self, locator: KeyLocator) -> Result<SecretKey> {
        let mut seed = Vec::with_capacity(8);
        seed.extend_from_slice(&locator.family.to_le_bytes());
        seed.extend_from_slice(&locator.index.to_le_bytes());
        let digest = sha256::Hash::hash(&seed).to_byte_array();
        SecretKey::from_slice(&digest).context("derive secret key")
    }
}

fn set_invoice_status(invoice: &mut Invoice, status: InvoiceStatus) {
    invoice.status = status;
    invoice
        .subscribers
        .retain(|tx| tx.try_send(status).is_ok());
}

#[async_trait]
impl ChainNode for Harness {
    async fn get_chain_height(&self) -> Result<u32> {
        Ok(self.height())
    }

    async fn subscribe_to_blocks(&self) -> Result<mpsc::Receiver<u32>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        self.lock().block_subscribers.push(tx);
        Ok(rx)
    }

    async fn get_chain_fee_estimate(&self, _target_blocks: u32) -> Result<FeeRate> {
        Ok(self.lock().fee_estimate)
    }

    async fn broadcast_transaction(&self, tx: &Transaction) -> Result<Txid> {
        let mut state = self.lock();
        let input = tx.input.first().context("transaction has no input")?;

        if tx.lock_time.is_block_height() && tx.lock_time.to_consensus_u32() > state.height {
            anyhow::bail!("non-final transaction");
        }
        if let Some(existing) = state.spends.get(&input.previous_output)
            && existing.confirmed_height.is_some()
        {
            anyhow::bail!("missing inputs");
        }

        let transaction_id = tx.compute_txid();
        state.spends.insert(
            input.previous_output,
            Spend {
                transaction_id,
                confirmed_height: None,
            },
        );
        state.broadcasts.push(tx.clone());
        Ok(transaction_id)
    }

    async fn create_address(&self) -> Result<Address> {
        Ok(self.wallet_address())
    }

    async fn derive_key(&self, locator: KeyLocator) -> Result<PublicKey> {
        self.lock().derive_key_calls += 1;
        let secret = self.secret_for(locator)?;
        Ok(PublicKey::new(secret.public_key(&self.secp)))
    }

    async fn sign_output(&self, request: &SignRequest) -> Result<Signature> {
        let secret = self.secret_for(request.key)?;
        let message = Message::from_digest(request.sighash);
        Ok(self.secp.sign_ecdsa(&message, &secret))
    }
}

#[async_trait]
impl ChainScanner for Harness {
    async fn find_deposit(&self, query: &DepositQuery) -> Result<Option<Deposit>> {
        let state = self.lock();
        Ok(state
            .deposits
            .iter()
            .find(|(address, deposit)| {
                *address == query.address
                    && deposit.confirmed_height.is_none_or(|h| h > query.after_height)
                    && deposit.confirmations(state.height) >= query.confirmations
            })
            .map(|(_, deposit)| deposit.clone()))
    }

    async fn find_spend(&self, outpoint: OutPoint, _after_height: u32) -> Result<Option<Spend>> {
        Ok(self.lock().spends.get(&outpoint).cloned())
    }
}

#[async_trait]
impl PaymentNode for Harness {
    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<CreatedInvoice> {
        let mut state = self.lock();
        state.nonce += 1;
        let preimage = sha256::Hash::hash(&state.nonce.to_le_bytes()).to_byte_array();
        let id = sha256::Hash::hash(&preimage).to_byte_array();
        state.invoices.insert(
            id,
            Invoice {
                tokens: request.tokens,
                status: InvoiceStatus::Open,
                subscribers: Vec::new(),
            },
        );
        state.preimages.insert(id, preimage);
        Ok(CreatedInvoice {
            id,
            request: format!("lnbcrt{}n1{}", request.tokens, hex::encode(id)),
        })
    }

    async fn subscribe_to_invoice(&self, id: [u8; 32]) -> Result<mpsc::Receiver<InvoiceStatus>> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let mut state = self.lock();
        let invoice = state.invoices.get_mut(&id).context("unknown invoice")?;
        tx.try_send(invoice.status).context("send current invoice status")?;
        invoice.subscribers.push(tx);
        Ok(rx)
    }

    async fn cancel_invoice(&self, id: [u8; 32]) -> Result<()> {
        let mut state = self.lock();
        state.cancel_requests.push(id);
        if state.cancel_fails {
            anyhow::bail!("node refused to cancel invoice");
        }
        let invoice = state.invoices.get_mut(&id).context("unknown invoice")?;
        match invoice.status {
            InvoiceStatus::Settled { .. } => anyhow::bail!("invoice already settled"),
            InvoiceStatus::Canceled => {}
            InvoiceStatus::Open => set_invoice_status(invoice, InvoiceStatus::Canceled),
        }
        Ok(())
    }

    async fn decode_payment_request(&self, request: &str) -> Result<DecodedRequest> {
        self.lock()
            .requests
            .get(request)
            .cloned()
            .with_context(|| format!("cannot decode {request}"))
    }

    async fn find_route(&self, query: &RouteQuery) -> Result<Route> {
        let state = self.lock();
        if state.pathfinding_fails {
            anyhow::bail!("no route to {}", query.destination);
        }
        Ok(Route {
            mtokens: query.mtokens,
            fee_mtokens: state.route_fee_mtokens,
            hops: vec![query.destination],
        })
    }

    async fn pay_route(&self, id: [u8; 32], route: &Route) -> Result<PaymentResult> {
        self.lock().pay_route_calls += 1;

        // The swap-out secret reaches the service through `follow`.
        let mut preimage = None;
        for _ in 0..300 {
            preimage = self.lock().preimages.get(&id).copied();
            if preimage.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let preimage = preimage.context("payee does not know the preimage")?;

        let mut state = self.lock();
        state.payments.insert(
            id,
            PaymentStatus::Succeeded {
                mtokens: route.mtokens,
                fee_mtokens: route.fee_mtokens,
            },
        );

        let funded = state
            .escrows
            .iter()
            .find(|e| e.direction == SwapDirection::Out && e.payment_hash == id)
            .cloned();
        if let Some(escrow) = funded
            && state.deposit_on_funding
        {
            drop(state);
            self.deposit(&escrow.address, escrow.tokens);
        }

        Ok(PaymentResult {
            preimage,
            mtokens: route.mtokens,
            fee_mtokens: route.fee_mtokens,
        })
    }

    async fn lookup_payment(&self, id: [u8; 32]) -> Result<Option<PaymentStatus>> {
        Ok(self.lock().payments.get(&id).copied())
    }
}

#[async_trait]
impl SwapService for Harness {
    async fn get_terms(&self, _direction: SwapDirection) -> Result<Terms> {
        Ok(self.lock().terms)
    }

    async fn get_quote(&self, direction: SwapDirection, _tokens: u64) -> Result<Quote> {
        let quote = self.lock().quote;
        Ok(match direction {
            SwapDirection::In => Quote {
                prepay_tokens: 0,
                ..quote
            },
            SwapDirection::Out => quote,
        })
    }

    async fn initiate_swap(&self, request: &InitiateSwap) -> Result<InitiatedSwap> {
        let service_key = PublicKey::new(self.service_node_id());
        let (quote, height, wrong_address) = {
            let state = self.lock();
            (state.quote, state.height, state.wrong_escrow_address)
        };

        let (claim_public_key, refund_public_key) = match request.direction {
            SwapDirection::In => (service_key, request.local_public_key),
            SwapDirection::Out => (request.local_public_key, service_key),
        };
        let escrow = EscrowScript {
            payment_hash: request.payment_hash,
            claim_public_key,
            refund_public_key,
            timeout_height: height + quote.cltv_delta,
        };
        let address = escrow.address(self.network);
        let advertised = if wrong_address {
            self.wallet_address()
        } else {
            address.clone()
        };

        let (execution_request, funding_request) = match request.direction {
            SwapDirection::In => (None, None),
            SwapDirection::Out => {
                let execution = (quote.prepay_tokens > 0).then(|| {
                    let preimage = sha256::Hash::hash(&request.payment_hash).to_byte_array();
                    let id = sha256::Hash::hash(&preimage).to_byte_array();
                    self.register_request(quote.prepay_tokens, id, Some(preimage))
                });
                let funding = self.register_request(
                    request.tokens + quote.fee - quote.prepay_tokens,
                    request.payment_hash,
                    None,
                );
                (execution, Some(funding))
            }
        };

        self.lock().escrows.push(InitiatedEscrow {
            direction: request.direction,
            payment_hash: request.payment_hash,
            address,
            tokens: request.tokens,
        });

        Ok(InitiatedSwap {
            address: advertised.to_string(),
            script: escrow.witness_script(),
            claim_public_key,
            refund_public_key,
            timeout_height: escrow.timeout_height,
            execution_request,
            funding_request,
        })
    }
}
