use std::ops::RangeInclusive;
use std::sync::Arc;

use bitcoin::hashes::{Hash as _, sha256};
use bitcoin::secp256k1::PublicKey as NodeId;
use bitcoin::{Address, Amount};
use rand::RngCore as _;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::Instrument as _;
use uuid::Uuid;

use super::escrow::{EscrowNegotiator, NewEscrow};
use super::recovery;
use super::state::{self, Effect, Event, Transition};
use super::{LegKind, Swap, SwapDirection, SwapEvent, SwapStatus, SwapSummary};
use crate::chain::fees::FeeBumper;
use crate::chain::funding::{FundingFailure, FundingMonitor, FundingPolicy};
use crate::chain::htlc::SpendPath;
use crate::chain::sweep::{SweepAttempt, SweepParams, SweepRecord, Sweeper};
use crate::chain::{ChainNode, ChainScanner, DepositQuery};
use crate::config::EngineConfig;
use crate::error::SwapError;
use crate::lightning::PaymentNode;
use crate::lightning::settlement::{
    InvoiceWatch, SettlementCoordinator, SettlementPolicy, SwapOutPayments,
};
use crate::service::SwapService;
use crate::service::quote::{self, QuoteRequest};

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Default)]
pub struct SwapInRequest {
    pub tokens: Option<u64>,
    pub max_fee: Option<u64>,
    pub refund_address: Option<Address>,
    pub recovery: Option<String>,
}

pub struct SwapInHandle {
    pub id: String,
    pub address: Address,
    pub recovery_token: String,
    /// BIP21 URI paying the requested amount to the escrow.
    pub payable_uri: String,
    pub completion: JoinHandle<Result<SwapSummary, SwapError>>,
}

#[derive(Debug, Clone, Default)]
pub struct SwapOutRequest {
    pub tokens: Option<u64>,
    /// Deposit confirmations to wait for. Defaults to the configured value.
    pub confirmations: Option<u32>,
    pub max_fee: Option<u64>,
    /// Routing fee cap per payment, in satoshis.
    pub max_routing_fee: Option<u64>,
    /// Peer to route the payments out through.
    pub peer: Option<NodeId>,
    pub refund_address: Option<Address>,
    pub recovery: Option<String>,
    /// Validate everything and print sweep candidates without paying or
    /// broadcasting.
    pub dry_run: bool,
}

enum Start {
    Fresh(u64),
    Recover(String),
}

fn start_mode(tokens: Option<u64>, recovery: Option<String>) -> Result<Start, SwapError> {
    match (tokens, recovery) {
        (Some(_), Some(_)) => Err(SwapError::ConflictingOptions),
        (None, None) => Err(SwapError::MissingTokens),
        (Some(tokens), None) => Ok(Start::Fresh(tokens)),
        (None, Some(token)) => Ok(Start::Recover(token)),
    }
}

/// Runs one swap against the node, the swap service and the chain index.
///
/// Collaborators are shared read-only; everything specific to the swap lives
/// in the engine's runner. `abort` stops the swap and every subscription it
/// holds.
#[derive(Clone)]
pub struct SwapEngine {
    node: Arc<dyn ChainNode>,
    payments: Arc<dyn PaymentNode>,
    service: Arc<dyn SwapService>,
    scanner: Arc<dyn ChainScanner>,
    config: Arc<EngineConfig>,
    cancel: CancellationToken,
    events: broadcast::Sender<SwapEvent>,
}

impl SwapEngine {
    pub fn new(
        node: Arc<dyn ChainNode>,
        payments: Arc<dyn PaymentNode>,
        service: Arc<dyn SwapService>,
        scanner: Arc<dyn ChainScanner>,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            node,
            payments,
            service,
            scanner,
            config: Arc::new(config),
            cancel: CancellationToken::new(),
            events,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwapEvent> {
        self.events.subscribe()
    }

    /// Stops scheduling new work. Transactions already broadcast stay valid.
    pub fn abort(&self) {
        tracing::warn!("swap aborted");
        self.cancel.cancel();
    }

    /// Starts a swap-in and returns once the escrow address is known. The
    /// rest of the swap runs in the background behind `completion`.
    pub async fn swap_in(&self, req: SwapInRequest) -> Result<SwapInHandle, SwapError> {
        let span = tracing::info_span!("swap", session = %Uuid::new_v4(), direction = "swap-in");

        let runner = async {
            let mut runner = match start_mode(req.tokens, req.recovery.clone())? {
                Start::Fresh(tokens) => self.start_swap_in(tokens, &req).await?,
                Start::Recover(token) => self.resume(&token, SwapDirection::In, None, None)?,
            };
            runner.begin()?;
            Ok::<_, SwapError>(runner)
        }
        .instrument(span.clone())
        .await?;

        let escrow = runner.swap.escrow()?;
        let address = escrow.address.clone();
        let recovery_token = runner.token()?;
        let payable_uri = format!(
            "bitcoin:{address}?amount={}",
            Amount::from_sat(runner.swap.tokens).to_btc()
        );
        let id = runner.swap.id_hex();

        span.in_scope(|| {
            tracing::info!(
                swap_id = %id,
                %address,
                %payable_uri,
                "waiting for swap-in deposit"
            );
        });

        let completion = tokio::spawn(async move { runner.run().await }.instrument(span));

        Ok(SwapInHandle {
            id,
            address,
            recovery_token,
            payable_uri,
            completion,
        })
    }

    /// Runs a swap-out to completion.
    pub async fn swap_out(&self, req: SwapOutRequest) -> Result<SwapSummary, SwapError> {
        let span = tracing::info_span!("swap", session = %Uuid::new_v4(), direction = "swap-out");
        self.swap_out_inner(req).instrument(span).await
    }

    async fn swap_out_inner(&self, req: SwapOutRequest) -> Result<SwapSummary, SwapError> {
        let start = start_mode(req.tokens, req.recovery.clone())?;
        let confirmations = req
            .confirmations
            .unwrap_or(self.config.funding_confirmations);
        if confirmations == 0 {
            return Err(SwapError::InvalidParameter {
                field: "confirmations",
                reason: "must be > 0".to_owned(),
            });
        }

        let mut runner = match start {
            Start::Fresh(tokens) => self.start_swap_out(tokens, confirmations, &req).await?,
            Start::Recover(token) => {
                self.resume(&token, SwapDirection::Out, req.max_routing_fee, req.peer)?
            }
        };

        if req.dry_run {
            return runner.dry_run().await;
        }
        runner.begin()?;
        runner.run().await
    }

    async fn start_swap_in(&self, tokens: u64, req: &SwapInRequest) -> Result<Runner, SwapError> {
        let accepted = quote::validate_quote(
            self.service.as_ref(),
            &self.config,
            &QuoteRequest {
                direction: SwapDirection::In,
                tokens,
                max_fee: req.max_fee,
            },
        )
        .await?;

        let coordinator = self.coordinator(self.cancel.clone());
        let (invoice, leg) = coordinator
            .create_swap_in_invoice(tokens, accepted.fee)
            .await?;

        let negotiated = EscrowNegotiator::new(
            self.node.as_ref(),
            self.service.as_ref(),
            &self.config,
        )
        .create(
            &NewEscrow {
                direction: SwapDirection::In,
                tokens,
                payment_hash: invoice.id,
                secret: None,
                invoice: Some(invoice.request.clone()),
                funding_confirmations: self.config.funding_confirmations,
            },
            req.refund_address.as_ref(),
        )
        .await;
        let negotiated = match negotiated {
            Ok(negotiated) => negotiated,
            Err(err) => {
                if let Err(cancel_err) = coordinator.discard_invoice(invoice.id).await {
                    tracing::warn!(error = %cancel_err, "unused swap-in invoice left open");
                }
                return Err(err);
            }
        };

        let swap = Swap {
            id: invoice.id,
            direction: SwapDirection::In,
            tokens,
            fee_budget: req.max_fee,
            service_fee: accepted.fee,
            prepay_tokens: 0,
            funding_confirmations: self.config.funding_confirmations,
            escrow: Some(negotiated.escrow),
            status: SwapStatus::Quoting,
            deposit: None,
            settlement: vec![leg],
            refund_address: req.refund_address.clone(),
            sweeps: Vec::new(),
            swept: None,
            recovery_token: None,
        };

        let mut runner = Runner::new(self.clone(), swap, None, None);
        runner.advance(Event::QuoteAccepted)?;
        Ok(runner)
    }

    async fn start_swap_out(
        &self,
        tokens: u64,
        confirmations: u32,
        req: &SwapOutRequest,
    ) -> Result<Runner, SwapError> {
        let accepted = quote::validate_quote(
            self.service.as_ref(),
            &self.config,
            &QuoteRequest {
                direction: SwapDirection::Out,
                tokens,
                max_fee: req.max_fee,
            },
        )
        .await?;

        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let id = sha256::Hash::hash(&secret).to_byte_array();

        let negotiated = EscrowNegotiator::new(
            self.node.as_ref(),
            self.service.as_ref(),
            &self.config,
        )
        .create(
            &NewEscrow {
                direction: SwapDirection::Out,
                tokens,
                payment_hash: id,
                secret: Some(secret),
                invoice: None,
                funding_confirmations: confirmations,
            },
            req.refund_address.as_ref(),
        )
        .await?;

        let funding_request = negotiated.funding_request.ok_or_else(|| {
            SwapError::service(
                "initiate swap",
                anyhow::anyhow!("service returned no funding request"),
            )
        })?;

        let swap = Swap {
            id,
            direction: SwapDirection::Out,
            tokens,
            fee_budget: req.max_fee,
            service_fee: accepted.fee,
            prepay_tokens: accepted.prepay_tokens,
            funding_confirmations: confirmations,
            escrow: Some(negotiated.escrow),
            status: SwapStatus::Quoting,
            deposit: None,
            settlement: Vec::new(),
            refund_address: req.refund_address.clone(),
            sweeps: Vec::new(),
            swept: None,
            recovery_token: None,
        };
        let mut runner = Runner::new(self.clone(), swap, req.max_routing_fee, req.peer);

        let prepared = runner
            .settlement()
            .prepare_swap_out(&SwapOutPayments {
                swap_id: id,
                execution_request: negotiated.execution_request.as_deref(),
                funding_request: &funding_request,
                prepay_tokens: accepted.prepay_tokens,
                funding_tokens: accepted.funding_tokens(),
                max_fee_mtokens: runner.max_routing_fee_mtokens(),
                outgoing_peer: req.peer,
            })
            .await?;
        runner.swap.settlement = prepared.legs();

        runner.advance(Event::QuoteAccepted)?;
        Ok(runner)
    }

    /// Rebuilds a swap from its recovery token. The swap restarts from
    /// `EscrowCreated`; `Runner::begin` then moves it to its stored marker.
    fn resume(
        &self,
        token: &str,
        direction: SwapDirection,
        max_routing_fee: Option<u64>,
        peer: Option<NodeId>,
    ) -> Result<Runner, SwapError> {
        let recovery = recovery::decode(token)?;
        if recovery.swap.direction != direction {
            return Err(SwapError::RecoveryDirectionMismatch {
                expected: direction.as_str(),
                found: recovery.swap.direction.as_str(),
            });
        }

        let escrow = EscrowNegotiator::new(
            self.node.as_ref(),
            self.service.as_ref(),
            &self.config,
        )
        .recover(&recovery)?;

        let mut swap = recovery.swap;
        let marker = swap.status;
        swap.escrow = Some(escrow);
        swap.status = SwapStatus::EscrowCreated;

        tracing::info!(
            swap_id = %swap.id_hex(),
            marker = marker.as_str(),
            "resuming swap from recovery"
        );

        let mut runner = Runner::new(self.clone(), swap, max_routing_fee, peer);
        runner.marker = Some(marker);
        runner.refunded = marker == SwapStatus::Refunding;
        Ok(runner)
    }

    fn coordinator(&self, cancel: CancellationToken) -> SettlementCoordinator {
        SettlementCoordinator::new(
            self.payments.clone(),
            SettlementPolicy {
                poll_interval: self.config.funding_poll_interval(),
                timeout: self.config.settlement_timeout(),
                invoice_expiry_secs: self.config.invoice_expiry_secs,
            },
            cancel,
        )
    }
}

/// Drives a single swap through its states.
struct Runner {
    engine: SwapEngine,
    swap: Swap,
    /// Cancelled on abort and when the swap reaches a terminal state.
    listeners: CancellationToken,
    invoice_watch: Option<InvoiceWatch>,
    max_routing_fee: Option<u64>,
    outgoing_peer: Option<NodeId>,
    /// Progress marker of a recovered swap, consumed by `begin`.
    marker: Option<SwapStatus>,
    refunded: bool,
}

impl Runner {
    fn new(
        engine: SwapEngine,
        swap: Swap,
        max_routing_fee: Option<u64>,
        outgoing_peer: Option<NodeId>,
    ) -> Self {
        let listeners = engine.cancel.child_token();
        Self {
            engine,
            swap,
            listeners,
            invoice_watch: None,
            max_routing_fee,
            outgoing_peer,
            marker: None,
            refunded: false,
        }
    }

    fn config(&self) -> &EngineConfig {
        &self.engine.config
    }

    fn settlement(&self) -> SettlementCoordinator {
        self.engine.coordinator(self.listeners.clone())
    }

    fn max_routing_fee_mtokens(&self) -> u64 {
        self.max_routing_fee
            .unwrap_or_else(|| self.config().max_routing_fee(self.swap.tokens))
            .saturating_mul(1_000)
    }

    fn emit(&self, event: SwapEvent) {
        // No subscriber is fine.
        let _ = self.engine.events.send(event);
    }

    fn token(&self) -> Result<String, SwapError> {
        match &self.swap.recovery_token {
            Some(token) => Ok(token.clone()),
            None => recovery::encode(&self.swap, self.config().network),
        }
    }

    /// Leaves `EscrowCreated`, either for the first stage of the direction
    /// or for the marker of a recovered swap.
    fn begin(&mut self) -> Result<(), SwapError> {
        self.emit_timing();
        let event = match self.marker.take() {
            None | Some(SwapStatus::Quoting | SwapStatus::EscrowCreated) => Event::EscrowReady,
            Some(
                SwapStatus::AwaitingConfirmation | SwapStatus::Sweeping | SwapStatus::Refunding,
            ) if self.swap.deposit.is_none() => Event::Resumed {
                to: SwapStatus::AwaitingDeposit,
            },
            Some(marker) => Event::Resumed { to: marker },
        };
        self.advance(event)
    }

    fn advance(&mut self, event: Event) -> Result<(), SwapError> {
        let from = self.swap.status;
        let Transition { next, effects } = state::transition(self.swap.direction, from, event)?;
        self.swap.status = next;
        if next == SwapStatus::Refunding {
            self.refunded = true;
        }

        tracing::info!(
            swap_id = %self.swap.id_hex(),
            from = from.as_str(),
            to = next.as_str(),
            event = event.as_str(),
            "swap status changed"
        );
        self.emit(SwapEvent::StatusChanged {
            id: self.swap.id_hex(),
            from,
            to: next,
        });

        for effect in effects {
            match effect {
                Effect::WriteRecovery => self.write_recovery()?,
                Effect::ReleaseSubscriptions => {
                    self.invoice_watch = None;
                    self.listeners.cancel();
                }
            }
        }
        Ok(())
    }

    fn write_recovery(&mut self) -> Result<(), SwapError> {
        let token = recovery::encode(&self.swap, self.config().network)?;
        self.swap.recovery_token = Some(token.clone());
        self.emit(SwapEvent::RecoveryUpdated {
            id: self.swap.id_hex(),
            token,
        });
        Ok(())
    }

    fn emit_timing(&self) {
        let Ok(escrow) = self.swap.escrow() else {
            return;
        };
        let config = self.config();
        let blocks_to_complete = match self.swap.direction {
            SwapDirection::In => self.swap.funding_confirmations,
            SwapDirection::Out => self
                .swap
                .funding_confirmations
                .saturating_add(config.sweep_confirmations),
        };
        let earliest_completion_secs =
            u64::from(blocks_to_complete).saturating_mul(config.block_time_secs);
        let forfeiture_secs = u64::from(escrow.timeout_height.saturating_sub(escrow.start_height))
            .saturating_mul(config.block_time_secs);

        tracing::info!(
            swap_id = %self.swap.id_hex(),
            earliest_completion_secs,
            forfeiture_height = escrow.timeout_height,
            forfeiture_secs,
            "swap timing estimate"
        );
        self.emit(SwapEvent::Timing {
            id: self.swap.id_hex(),
            earliest_completion_secs,
            forfeiture_height: escrow.timeout_height,
            forfeiture_secs,
        });
    }

    async fn run(mut self) -> Result<SwapSummary, SwapError> {
        loop {
            let step = match self.swap.status {
                SwapStatus::Complete => {
                    let summary = self.summary();
                    tracing::info!(
                        swap_id = %summary.id,
                        is_refunded = summary.is_refunded,
                        service_fee = summary.service_fee,
                        routing_fee = summary.routing_fee,
                        chain_fee_paid = summary.chain_fee_paid,
                        received_offchain = summary.received_offchain,
                        received_onchain = summary.received_onchain,
                        "swap complete"
                    );
                    self.emit(SwapEvent::Completed(summary.clone()));
                    return Ok(summary);
                }
                SwapStatus::Failed => {
                    return Err(SwapError::InvalidTransition {
                        from: SwapStatus::Failed.as_str(),
                        event: "run",
                    });
                }
                SwapStatus::Quoting => Err(SwapError::InvalidTransition {
                    from: SwapStatus::Quoting.as_str(),
                    event: "run",
                }),
                SwapStatus::EscrowCreated => Ok(Event::EscrowReady),
                SwapStatus::AwaitingDeposit => self.await_deposit().await,
                SwapStatus::SettlingOffchain => match self.swap.direction {
                    SwapDirection::In => self.settle_invoice().await,
                    SwapDirection::Out => self.pay_offchain().await,
                },
                SwapStatus::AwaitingConfirmation => Ok(Event::SweepStarted),
                SwapStatus::Sweeping | SwapStatus::Refunding => self.sweep().await,
            };

            let event = match step {
                Ok(event) => event,
                Err(err) => return Err(self.fail(err)),
            };
            if let Err(err) = self.advance(event) {
                return Err(self.fail(err));
            }

            if self.swap.status == SwapStatus::Failed {
                let err = match event {
                    Event::FundingTimedOut { .. } => {
                        SwapError::FailedToReceiveSwapFundingConfirmationInTime
                    }
                    Event::SettlementTimedOut => SwapError::TimedOut("off-chain settlement"),
                    _ => SwapError::InvalidTransition {
                        from: SwapStatus::Failed.as_str(),
                        event: event.as_str(),
                    },
                };
                tracing::error!(swap_id = %self.swap.id_hex(), error = %err, "swap failed");
                self.emit(SwapEvent::Failed {
                    id: self.swap.id_hex(),
                    error: err.to_string(),
                });
                return Err(err);
            }
        }
    }

    fn fail(&mut self, err: SwapError) -> SwapError {
        tracing::error!(
            swap_id = %self.swap.id_hex(),
            status = self.swap.status.as_str(),
            kind = ?err.kind(),
            error = %err,
            "swap failed"
        );

        if !self.swap.status.is_terminal() {
            let event = match err {
                SwapError::Aborted => Event::Abort,
                _ => Event::Fault,
            };
            if let Err(advance_err) = self.advance(event) {
                tracing::warn!(error = %advance_err, "failed to record swap failure");
            }
        }

        self.emit(SwapEvent::Failed {
            id: self.swap.id_hex(),
            error: err.to_string(),
        });
        err
    }

    async fn await_deposit(&mut self) -> Result<Event, SwapError> {
        if self.swap.direction == SwapDirection::In && self.invoice_watch.is_none() {
            let watch = self.settlement().watch_invoice(self.swap.id).await?;
            self.invoice_watch = Some(watch);
        }

        let escrow = self.swap.escrow()?;
        let timeout_height = escrow.timeout_height;
        let query = DepositQuery {
            address: escrow.address.clone(),
            tokens: self.swap.tokens,
            after_height: escrow.start_height,
            confirmations: self.swap.funding_confirmations,
        };

        let config = self.config();
        let monitor = FundingMonitor::new(
            self.engine.scanner.clone(),
            FundingPolicy {
                mempool_check_attempts: config.mempool_check_attempts,
                poll_interval: config.funding_poll_interval(),
                poll_attempts: config.funding_poll_attempts,
                timeout: config.funding_timeout(),
            },
            self.listeners.clone(),
        );

        match monitor.wait_for_deposit(&query).await {
            Ok(deposit) => {
                self.emit(SwapEvent::DepositConfirmed {
                    id: self.swap.id_hex(),
                    transaction_id: deposit.transaction_id,
                    output_tokens: deposit.output_tokens,
                    confirmed_height: deposit.confirmed_height,
                });
                self.swap.deposit = Some(deposit);
                Ok(Event::DepositConfirmed)
            }
            Err(FundingFailure {
                error: SwapError::FailedToReceiveSwapFundingConfirmationInTime,
                seen,
            }) => {
                let height = self
                    .engine
                    .node
                    .get_chain_height()
                    .await
                    .map_err(|e| SwapError::service("get chain height", e))?;
                let blocks_remaining = timeout_height.saturating_sub(height);
                let deposit_seen = seen.is_some();

                if let Some(deposit) = seen {
                    self.emit(SwapEvent::DepositSeen {
                        id: self.swap.id_hex(),
                        transaction_id: deposit.transaction_id,
                        output_tokens: deposit.output_tokens,
                    });
                    self.swap.deposit = Some(deposit);
                }

                tracing::warn!(
                    swap_id = %self.swap.id_hex(),
                    height,
                    timeout_height,
                    blocks_remaining,
                    deposit_seen,
                    "swap deposit not confirmed in time"
                );
                Ok(Event::FundingTimedOut {
                    blocks_remaining,
                    confirmations_required: self.config().sweep_confirmations,
                    deposit_seen,
                })
            }
            Err(FundingFailure { error, .. }) => Err(error),
        }
    }

    async fn settle_invoice(&mut self) -> Result<Event, SwapError> {
        let coordinator = self.settlement();
        let mut watch = match self.invoice_watch.take() {
            Some(watch) => watch,
            None => coordinator.watch_invoice(self.swap.id).await?,
        };
        let settled = match coordinator.wait_for_settlement(&mut watch).await {
            // A refunding swap-in must not stay payable.
            Err(SwapError::TimedOut(what)) => match coordinator.cancel_invoice(&mut watch).await {
                Ok(Some(received_mtokens)) => Ok(received_mtokens),
                Ok(None) => Err(SwapError::InvoiceCanceled),
                Err(err) => {
                    tracing::warn!(
                        swap_id = %self.swap.id_hex(),
                        error = %err,
                        "swap-in invoice still open while refunding"
                    );
                    Err(SwapError::TimedOut(what))
                }
            },
            settled => settled,
        };
        self.invoice_watch = Some(watch);

        match settled {
            Ok(received_mtokens) => {
                self.invoice_settled(received_mtokens);
                Ok(Event::OffchainSettled)
            }
            Err(err @ (SwapError::TimedOut(_) | SwapError::InvoiceCanceled)) => {
                tracing::warn!(
                    swap_id = %self.swap.id_hex(),
                    error = %err,
                    "swap-in invoice not settled, refunding"
                );
                Ok(Event::SettlementTimedOut)
            }
            Err(err) => Err(err),
        }
    }

    fn invoice_settled(&mut self, received_mtokens: u64) {
        if let Some(leg) = self
            .swap
            .settlement
            .iter_mut()
            .find(|leg| leg.kind == LegKind::Invoice)
        {
            leg.is_confirmed = true;
            leg.mtokens = received_mtokens;
        }
        tracing::info!(
            swap_id = %self.swap.id_hex(),
            received_mtokens,
            "swap-in invoice settled"
        );
        self.emit(SwapEvent::PaymentSettled {
            id: self.swap.id_hex(),
            kind: LegKind::Invoice,
            mtokens: received_mtokens,
            fee_mtokens: 0,
        });
    }

    /// Keeps the invoice of a refunding swap-in from being paid while the
    /// refund is pending.
    async fn close_invoice(&mut self) -> Result<(), SwapError> {
        let coordinator = self.settlement();
        let mut watch = match self.invoice_watch.take() {
            Some(watch) => watch,
            None => coordinator.watch_invoice(self.swap.id).await?,
        };
        if watch.is_open() {
            match coordinator.cancel_invoice(&mut watch).await {
                Ok(None) => {}
                Ok(Some(received_mtokens)) => tracing::warn!(
                    swap_id = %self.swap.id_hex(),
                    received_mtokens,
                    "invoice settled while refunding, expecting the service to claim"
                ),
                Err(err) => tracing::warn!(
                    swap_id = %self.swap.id_hex(),
                    error = %err,
                    "swap-in invoice still open while refunding"
                ),
            }
        }
        self.invoice_watch = Some(watch);
        Ok(())
    }

    /// A refunding swap-in lost its escrow. That is only expected when the
    /// invoice settled late and the service claimed with the preimage.
    async fn claimed_after_settlement(&mut self, transaction_id: String) -> Result<Event, SwapError> {
        let coordinator = self.settlement();
        let mut watch = match self.invoice_watch.take() {
            Some(watch) => watch,
            None => coordinator.watch_invoice(self.swap.id).await?,
        };
        let settled = coordinator.settled_amount(&mut watch).await;
        self.invoice_watch = Some(watch);

        let Some(received_mtokens) = settled else {
            return Err(SwapError::EscrowSpentByCounterparty { transaction_id });
        };
        tracing::warn!(
            swap_id = %self.swap.id_hex(),
            txid = %transaction_id,
            "invoice settled while refunding, service claimed the escrow"
        );
        self.invoice_settled(received_mtokens);
        self.refunded = false;
        Ok(Event::OffchainSettled)
    }

    async fn pay_offchain(&mut self) -> Result<Event, SwapError> {
        let funding_request = self
            .swap
            .leg(LegKind::Funding)
            .map(|leg| leg.request.clone())
            .ok_or_else(|| {
                SwapError::FailedToDecodeSwapRecovery("no funding payment request".to_owned())
            })?;
        let execution_request = self
            .swap
            .leg(LegKind::Execution)
            .map(|leg| leg.request.clone());

        let coordinator = self.settlement();
        let prepared = coordinator
            .prepare_swap_out(&SwapOutPayments {
                swap_id: self.swap.id,
                execution_request: execution_request.as_deref(),
                funding_request: &funding_request,
                prepay_tokens: self.swap.prepay_tokens,
                funding_tokens: self
                    .swap
                    .tokens
                    .saturating_add(self.swap.service_fee)
                    .saturating_sub(self.swap.prepay_tokens),
                max_fee_mtokens: self.max_routing_fee_mtokens(),
                outgoing_peer: self.outgoing_peer,
            })
            .await?;

        match coordinator.pay_swap_out(&prepared).await {
            Ok(legs) => {
                for leg in legs.execution.into_iter().chain(std::iter::once(legs.funding)) {
                    self.emit(SwapEvent::PaymentSettled {
                        id: self.swap.id_hex(),
                        kind: leg.kind,
                        mtokens: leg.mtokens,
                        fee_mtokens: leg.fee_mtokens,
                    });
                    self.swap.upsert_leg(leg);
                }
                Ok(Event::OffchainSettled)
            }
            Err(SwapError::TimedOut(what)) => {
                tracing::warn!(swap_id = %self.swap.id_hex(), what, "swap-out payment timed out");
                Ok(Event::SettlementTimedOut)
            }
            Err(err) => Err(err),
        }
    }

    async fn sweep(&mut self) -> Result<Event, SwapError> {
        if self.swap.direction == SwapDirection::In {
            self.close_invoice().await?;
        }
        let path = self.sweep_path()?;
        let destination = match (self.swap.direction, self.swap.status) {
            (SwapDirection::Out, SwapStatus::Sweeping) => self.wallet_address().await?,
            _ => match &self.swap.refund_address {
                Some(address) => address.clone(),
                None => self.wallet_address().await?,
            },
        };
        let params = self.sweep_params(path, destination)?;
        let mut sweeper = self.sweeper();

        let network = self.config().network;
        let direction = self.swap.direction;
        let id = self.swap.id_hex();
        let events = &self.engine.events;
        let swap = &mut self.swap;
        let mut on_attempt = |attempt: &SweepAttempt| {
            let _ = events.send(SwapEvent::SweepAttempt {
                id: id.clone(),
                height: attempt.height,
                transaction_id: attempt.transaction_id,
                fee_rate_sat_vb: attempt.fee_rate.to_sat_per_vb_ceil(),
                output_tokens: attempt.output_tokens,
                broadcast: attempt.broadcast,
            });
            if !attempt.broadcast {
                return;
            }
            swap.record_sweep(attempt.record());
            match recovery::encode(swap, network) {
                Ok(token) => {
                    swap.recovery_token = Some(token.clone());
                    let _ = events.send(SwapEvent::RecoveryUpdated {
                        id: id.clone(),
                        token,
                    });
                }
                Err(err) => tracing::warn!(error = %err, "failed to update recovery after sweep"),
            }
        };

        let outcome = match sweeper.run(&params, &mut on_attempt).await {
            Ok(outcome) => outcome,
            Err(SwapError::EscrowSpentByCounterparty { transaction_id })
                if direction == SwapDirection::In =>
            {
                return self.claimed_after_settlement(transaction_id).await;
            }
            Err(err) => return Err(err),
        };

        if let Some(attempt) = outcome
            .attempts
            .iter()
            .find(|a| a.transaction_id == outcome.transaction_id)
        {
            self.swap.record_sweep(attempt.record());
        }
        self.swap.swept = Some(outcome.transaction_id);

        tracing::info!(
            swap_id = %self.swap.id_hex(),
            txid = %outcome.transaction_id,
            output_tokens = outcome.output_tokens,
            chain_fee = outcome.chain_fee,
            attempts = outcome.attempts.len(),
            "escrow swept"
        );
        Ok(Event::SweepConfirmed)
    }

    /// Replays the sweep candidates of a confirmed deposit without paying or
    /// broadcasting anything.
    async fn dry_run(mut self) -> Result<SwapSummary, SwapError> {
        tracing::info!(swap_id = %self.swap.id_hex(), "dry run, nothing is paid or broadcast");

        if self.swap.deposit.is_none() {
            let escrow = self.swap.escrow()?;
            let query = DepositQuery {
                address: escrow.address.clone(),
                tokens: self.swap.tokens,
                after_height: escrow.start_height,
                confirmations: self.swap.funding_confirmations,
            };
            self.swap.deposit = self
                .engine
                .scanner
                .find_deposit(&query)
                .await
                .map_err(|e| SwapError::service("find deposit", e))?;
        }

        if self.swap.deposit.is_some() {
            let path = self.sweep_path()?;
            let destination = match &self.swap.refund_address {
                Some(address) => address.clone(),
                None => self.wallet_address().await?,
            };
            let params = self.sweep_params(path, destination)?;
            let tip = self
                .engine
                .node
                .get_chain_height()
                .await
                .map_err(|e| SwapError::service("get chain height", e))?;
            let heights = self.dry_run_heights(path, tip)?;
            tracing::info!(
                swap_id = %self.swap.id_hex(),
                first = *heights.start(),
                last = *heights.end(),
                "simulating sweep heights"
            );
            let attempts = self.sweeper().dry_run(&params, heights).await?;
            for attempt in &attempts {
                self.emit(SwapEvent::SweepAttempt {
                    id: self.swap.id_hex(),
                    height: attempt.height,
                    transaction_id: attempt.transaction_id,
                    fee_rate_sat_vb: attempt.fee_rate.to_sat_per_vb_ceil(),
                    output_tokens: attempt.output_tokens,
                    broadcast: false,
                });
            }
        } else {
            tracing::info!(swap_id = %self.swap.id_hex(), "no confirmed deposit, nothing to sweep");
        }

        Ok(self.summary())
    }

    /// A claim is simulated from the tip towards the timeout, a refund from
    /// the first height it becomes valid at.
    fn dry_run_heights(&self, path: SpendPath, tip: u32) -> Result<RangeInclusive<u32>, SwapError> {
        let timeout_height = self.swap.escrow()?.timeout_height;
        let extra = self.config().dry_run_blocks.saturating_sub(1);
        Ok(match path {
            SpendPath::Claim { .. } => tip..=tip.saturating_add(extra).min(timeout_height),
            SpendPath::Refund => {
                let first = tip.max(timeout_height);
                first..=first.saturating_add(extra)
            }
        })
    }

    fn sweep_path(&self) -> Result<SpendPath, SwapError> {
        match self.swap.direction {
            SwapDirection::In => Ok(SpendPath::Refund),
            SwapDirection::Out => self
                .swap
                .escrow()?
                .secret
                .map(|preimage| SpendPath::Claim { preimage })
                .ok_or_else(|| {
                    SwapError::FailedToDecodeSwapRecovery("swap-out escrow without secret".to_owned())
                }),
        }
    }

    fn sweep_params(
        &self,
        path: SpendPath,
        destination: Address,
    ) -> Result<SweepParams, SwapError> {
        let escrow = self.swap.escrow()?;
        let deposit = self
            .swap
            .deposit
            .clone()
            .ok_or(SwapError::InvalidTransition {
                from: self.swap.status.as_str(),
                event: "sweep without deposit",
            })?;
        let config = self.config();

        Ok(SweepParams {
            escrow: escrow.script_for(self.swap.id),
            key: escrow.key,
            deposit,
            destination,
            path,
            confirmations: config.sweep_confirmations,
            safety_buffer_blocks: config.safety_buffer_blocks,
            conf_target: config.sweep_conf_target,
            after_height: escrow.start_height,
            previous: self.swap.sweeps.clone(),
        })
    }

    fn sweeper(&self) -> Sweeper {
        let config = self.config();
        let fees = FeeBumper::new(config.min_sweep_fee_rate(), config.max_fee_multiplier)
            .with_last(self.swap.sweeps.iter().map(SweepRecord::fee_rate).max());
        Sweeper::new(
            self.engine.node.clone(),
            self.engine.scanner.clone(),
            fees,
            self.listeners.clone(),
        )
    }

    async fn wallet_address(&self) -> Result<Address, SwapError> {
        self.engine
            .node
            .create_address()
            .await
            .map_err(|e| SwapError::service("create sweep address", e))
    }

    fn summary(&self) -> SwapSummary {
        let swap = &self.swap;
        let swept = swap
            .confirmed_sweep()
            .filter(|_| swap.status == SwapStatus::Complete);
        let chain_fee_paid = match (swept, &swap.deposit) {
            (Some(sweep), Some(deposit)) => deposit.output_tokens.saturating_sub(sweep.output_tokens),
            _ => 0,
        };
        let received_offchain = match swap.direction {
            SwapDirection::In => swap
                .leg(LegKind::Invoice)
                .filter(|leg| leg.is_confirmed)
                .map(|leg| leg.mtokens / 1_000)
                .unwrap_or(0),
            SwapDirection::Out => 0,
        };

        SwapSummary {
            id: swap.id_hex(),
            direction: swap.direction,
            is_complete: swap.status == SwapStatus::Complete,
            is_refunded: self.refunded,
            tokens: swap.tokens,
            service_fee: swap.service_fee,
            routing_fee: swap.routing_fee(),
            chain_fee_paid,
            received_offchain,
            received_onchain: swept.map(|sweep| sweep.output_tokens).unwrap_or(0),
            sweep_transaction_id: swept.map(|sweep| sweep.transaction_id),
        }
    }
}
