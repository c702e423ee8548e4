use std::sync::Arc;
use std::time::Duration;

use bitcoin::secp256k1::PublicKey as NodeId;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::{
    CreatedInvoice, DecodedRequest, InvoiceRequest, InvoiceStatus, PaymentNode, PaymentStatus,
    RouteQuery,
};
use crate::chain::htlc::sha256_preimage;
use crate::error::SwapError;
use crate::swap::{LegKind, SettlementLeg};

#[derive(Debug, Clone, Copy)]
pub struct SettlementPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub invoice_expiry_secs: u32,
}

/// Live view of a swap-in invoice, fed by a listener task.
pub struct InvoiceWatch {
    id: [u8; 32],
    rx: watch::Receiver<InvoiceStatus>,
    listener: JoinHandle<()>,
}

impl InvoiceWatch {
    pub fn id(&self) -> [u8; 32] {
        self.id
    }

    pub fn is_open(&self) -> bool {
        *self.rx.borrow() == InvoiceStatus::Open
    }

    /// Waits for the first status other than open.
    async fn resolved(&mut self) -> Result<InvoiceStatus, SwapError> {
        loop {
            let status = *self.rx.borrow_and_update();
            if status != InvoiceStatus::Open {
                return Ok(status);
            }
            if self.rx.changed().await.is_err() {
                return match *self.rx.borrow() {
                    InvoiceStatus::Open => Err(SwapError::service(
                        "wait for invoice settlement",
                        anyhow::anyhow!("invoice subscription closed"),
                    )),
                    status => Ok(status),
                };
            }
        }
    }
}

impl Drop for InvoiceWatch {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// The two payment requests a swap-out pays, with the amounts agreed in the
/// quote.
#[derive(Debug, Clone)]
pub struct SwapOutPayments<'a> {
    pub swap_id: [u8; 32],
    pub execution_request: Option<&'a str>,
    pub funding_request: &'a str,
    pub prepay_tokens: u64,
    pub funding_tokens: u64,
    /// Routing fee cap applied to each leg.
    pub max_fee_mtokens: u64,
    pub outgoing_peer: Option<NodeId>,
}

#[derive(Debug, Clone)]
pub struct PendingLeg {
    pub leg: SettlementLeg,
    pub decoded: DecodedRequest,
}

impl PendingLeg {
    fn new(kind: LegKind, request: &str, decoded: DecodedRequest) -> Self {
        Self {
            leg: SettlementLeg {
                kind,
                request: request.to_owned(),
                payment_id: hex::encode(decoded.id),
                is_confirmed: false,
                mtokens: decoded.mtokens,
                fee_mtokens: 0,
            },
            decoded,
        }
    }
}

/// Validated swap-out payment requests, ready to be paid.
#[derive(Debug, Clone)]
pub struct PreparedSwapOut {
    pub execution: Option<PendingLeg>,
    pub funding: PendingLeg,
    pub max_fee_mtokens: u64,
    pub outgoing_peer: Option<NodeId>,
}

impl PreparedSwapOut {
    pub fn legs(&self) -> Vec<SettlementLeg> {
        self.execution
            .iter()
            .chain(std::iter::once(&self.funding))
            .map(|pending| pending.leg.clone())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct SwapOutLegs {
    pub execution: Option<SettlementLeg>,
    pub funding: SettlementLeg,
}

pub struct SettlementCoordinator {
    payments: Arc<dyn PaymentNode>,
    policy: SettlementPolicy,
    cancel: CancellationToken,
}

impl SettlementCoordinator {
    pub fn new(
        payments: Arc<dyn PaymentNode>,
        policy: SettlementPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            payments,
            policy,
            cancel,
        }
    }

    /// Creates the invoice the service pays once the deposit confirms. The
    /// node generates the preimage, so its hash becomes the swap id.
    pub async fn create_swap_in_invoice(
        &self,
        tokens: u64,
        service_fee: u64,
    ) -> Result<(CreatedInvoice, SettlementLeg), SwapError> {
        let receive = tokens
            .checked_sub(service_fee)
            .filter(|tokens| *tokens > 0)
            .ok_or(SwapError::AmountBelowMinimum {
                tokens,
                min_tokens: service_fee.saturating_add(1),
            })?;

        let invoice = self
            .payments
            .create_invoice(&InvoiceRequest {
                tokens: receive,
                expiry_secs: self.policy.invoice_expiry_secs,
                description: format!("swap-in {tokens}"),
            })
            .await
            .map_err(|e| SwapError::service("create swap-in invoice", e))?;

        tracing::info!(
            payment_hash = %hex::encode(invoice.id),
            tokens = receive,
            "created swap-in invoice"
        );

        let leg = SettlementLeg {
            kind: LegKind::Invoice,
            request: invoice.request.clone(),
            payment_id: hex::encode(invoice.id),
            is_confirmed: false,
            mtokens: receive.saturating_mul(1_000),
            fee_mtokens: 0,
        };
        Ok((invoice, leg))
    }

    pub async fn watch_invoice(&self, id: [u8; 32]) -> Result<InvoiceWatch, SwapError> {
        let mut stream = self
            .payments
            .subscribe_to_invoice(id)
            .await
            .map_err(|e| SwapError::service("subscribe to invoice", e))?;

        let (tx, rx) = watch::channel(InvoiceStatus::Open);
        let cancel = self.cancel.clone();
        let listener = tokio::spawn(async move {
            loop {
                let status = tokio::select! {
                    _ = cancel.cancelled() => break,
                    status = stream.recv() => match status {
                        Some(status) => status,
                        None => break,
                    },
                };
                if tx.send(status).is_err() {
                    break;
                }
                if status != InvoiceStatus::Open {
                    break;
                }
            }
        });

        Ok(InvoiceWatch { id, rx, listener })
    }

    /// Waits until the watched invoice settles and returns the received
    /// amount in millisatoshis.
    pub async fn wait_for_settlement(&self, watch: &mut InvoiceWatch) -> Result<u64, SwapError> {
        let wait = async {
            match watch.resolved().await {
                Ok(InvoiceStatus::Settled { received_mtokens }) => Ok(received_mtokens),
                Ok(_) => Err(SwapError::InvoiceCanceled),
                Err(err) => Err(err),
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(SwapError::Aborted),
            res = tokio::time::timeout(self.policy.timeout, wait) => {
                res.unwrap_or(Err(SwapError::TimedOut("invoice settlement")))
            }
        }
    }

    /// Amount received by the watched invoice, if it settled. Waits at most
    /// one poll interval for the invoice to leave the open state.
    pub async fn settled_amount(&self, watch: &mut InvoiceWatch) -> Option<u64> {
        match tokio::time::timeout(self.policy.poll_interval, watch.resolved()).await {
            Ok(Ok(InvoiceStatus::Settled { received_mtokens })) => Some(received_mtokens),
            _ => None,
        }
    }

    /// Cancels the watched invoice so a late payment can no longer settle
    /// it. Returns the received amount instead when a payment got there
    /// first.
    pub async fn cancel_invoice(
        &self,
        watch: &mut InvoiceWatch,
    ) -> Result<Option<u64>, SwapError> {
        let payment_hash = hex::encode(watch.id());
        let canceled = self.payments.cancel_invoice(watch.id()).await;

        if let Some(received_mtokens) = self.settled_amount(watch).await {
            tracing::warn!(%payment_hash, received_mtokens, "swap-in invoice settled before cancel");
            return Ok(Some(received_mtokens));
        }
        canceled.map_err(|e| SwapError::service("cancel swap-in invoice", e))?;

        tracing::info!(%payment_hash, "canceled swap-in invoice");
        Ok(None)
    }

    /// Cancels an invoice that has no watch yet, e.g. when the swap it was
    /// created for never got an escrow.
    pub async fn discard_invoice(&self, id: [u8; 32]) -> Result<(), SwapError> {
        self.payments
            .cancel_invoice(id)
            .await
            .map_err(|e| SwapError::service("cancel swap-in invoice", e))?;
        tracing::info!(payment_hash = %hex::encode(id), "canceled unused swap-in invoice");
        Ok(())
    }

    /// Decodes and checks the swap-out payment requests against the accepted
    /// quote without paying anything.
    pub async fn prepare_swap_out(
        &self,
        req: &SwapOutPayments<'_>,
    ) -> Result<PreparedSwapOut, SwapError> {
        let execution = match req.execution_request {
            Some(request) => {
                let decoded = self.decode(request).await?;
                if decoded.tokens != req.prepay_tokens {
                    return Err(SwapError::UnexpectedUnilateralDepositTokensAmount {
                        expected: req.prepay_tokens,
                        actual: decoded.tokens,
                    });
                }
                Some(PendingLeg::new(LegKind::Execution, request, decoded))
            }
            None if req.prepay_tokens > 0 => {
                return Err(SwapError::UnexpectedUnilateralDepositTokensAmount {
                    expected: req.prepay_tokens,
                    actual: 0,
                });
            }
            None => None,
        };

        let decoded = self.decode(req.funding_request).await?;
        if decoded.tokens != req.funding_tokens {
            return Err(SwapError::UnexpectedServiceCostForSwap {
                expected: req.funding_tokens,
                actual: decoded.tokens,
            });
        }
        if decoded.id != req.swap_id {
            return Err(SwapError::UnexpectedSwapPaymentHash);
        }

        Ok(PreparedSwapOut {
            execution,
            funding: PendingLeg::new(LegKind::Funding, req.funding_request, decoded),
            max_fee_mtokens: req.max_fee_mtokens,
            outgoing_peer: req.outgoing_peer,
        })
    }

    /// Pays both legs of a prepared swap-out concurrently. Legs already paid
    /// by an earlier run are looked up, never paid twice.
    pub async fn pay_swap_out(&self, prepared: &PreparedSwapOut) -> Result<SwapOutLegs, SwapError> {
        let pay_execution = async {
            match &prepared.execution {
                Some(leg) => self.pay_leg(leg, prepared).await.map(Some),
                None => Ok(None),
            }
        };
        let pay_funding = self.pay_leg(&prepared.funding, prepared);

        let (execution, funding) = tokio::join!(pay_execution, pay_funding);
        Ok(SwapOutLegs {
            execution: execution?,
            funding: funding?,
        })
    }

    async fn decode(&self, request: &str) -> Result<DecodedRequest, SwapError> {
        self.payments
            .decode_payment_request(request)
            .await
            .map_err(|e| SwapError::service("decode payment request", e))
    }

    async fn pay_leg(
        &self,
        pending: &PendingLeg,
        prepared: &PreparedSwapOut,
    ) -> Result<SettlementLeg, SwapError> {
        let PendingLeg { leg, decoded } = pending;
        let kind = leg.kind;
        let payment_id = leg.payment_id.clone();
        let settled = |mtokens: u64, fee_mtokens: u64| SettlementLeg {
            is_confirmed: true,
            mtokens,
            fee_mtokens,
            ..leg.clone()
        };

        let existing = self
            .payments
            .lookup_payment(decoded.id)
            .await
            .map_err(|e| SwapError::service("look up payment", e))?;
        match existing {
            Some(PaymentStatus::Succeeded {
                mtokens,
                fee_mtokens,
            }) => {
                tracing::info!(?kind, %payment_id, "payment already settled, not paying again");
                return Ok(settled(mtokens, fee_mtokens));
            }
            Some(PaymentStatus::InFlight) => {
                tracing::info!(?kind, %payment_id, "payment in flight, waiting for it");
                let (mtokens, fee_mtokens) = self.wait_in_flight(decoded.id, &payment_id).await?;
                return Ok(settled(mtokens, fee_mtokens));
            }
            Some(PaymentStatus::Failed) | None => {}
        }

        let route = self
            .payments
            .find_route(&RouteQuery {
                destination: decoded.destination,
                mtokens: decoded.mtokens,
                max_fee_mtokens: prepared.max_fee_mtokens,
                cltv_delta: decoded.cltv_delta,
                outgoing_peer: prepared.outgoing_peer,
            })
            .await
            .map_err(|e| SwapError::PathfindingFailed {
                payment_id: payment_id.clone(),
                reason: format!("{e:#}"),
            })?;
        if route.fee_mtokens > prepared.max_fee_mtokens {
            return Err(SwapError::RoutingFeeExceedsLimit {
                fee_mtokens: route.fee_mtokens,
                max_fee_mtokens: prepared.max_fee_mtokens,
            });
        }

        tracing::info!(
            ?kind,
            %payment_id,
            mtokens = route.mtokens,
            fee_mtokens = route.fee_mtokens,
            hops = route.hops.len(),
            "paying swap-out leg"
        );

        let paid = tokio::select! {
            _ = self.cancel.cancelled() => return Err(SwapError::Aborted),
            res = tokio::time::timeout(self.policy.timeout, self.payments.pay_route(decoded.id, &route)) => {
                match res {
                    Ok(Ok(paid)) => paid,
                    Ok(Err(err)) => return Err(SwapError::service("pay route", err)),
                    Err(_) => return Err(SwapError::TimedOut("off-chain payment")),
                }
            }
        };

        if sha256_preimage(&paid.preimage) != decoded.id {
            tracing::error!(%payment_id, "payment preimage does not match the payment hash");
            return Err(SwapError::PaymentFailed { payment_id });
        }

        Ok(settled(paid.mtokens, paid.fee_mtokens))
    }

    async fn wait_in_flight(
        &self,
        id: [u8; 32],
        payment_id: &str,
    ) -> Result<(u64, u64), SwapError> {
        let poll = async {
            loop {
                let status = self
                    .payments
                    .lookup_payment(id)
                    .await
                    .map_err(|e| SwapError::service("look up payment", e))?;
                match status {
                    Some(PaymentStatus::Succeeded {
                        mtokens,
                        fee_mtokens,
                    }) => return Ok((mtokens, fee_mtokens)),
                    Some(PaymentStatus::InFlight) => {}
                    Some(PaymentStatus::Failed) | None => {
                        return Err(SwapError::PaymentFailed {
                            payment_id: payment_id.to_owned(),
                        });
                    }
                }
                tokio::time::sleep(self.policy.poll_interval).await;
            }
        };

        tokio::select! {
            _ = self.cancel.cancelled() => Err(SwapError::Aborted),
            res = tokio::time::timeout(self.policy.timeout, poll) => {
                res.unwrap_or(Err(SwapError::TimedOut("in-flight payment")))
            }
        }
    }
}
