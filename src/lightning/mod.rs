pub mod settlement;

use anyhow::Result;
use async_trait::async_trait;
use bitcoin::secp256k1::PublicKey as NodeId;
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceRequest {
    pub tokens: u64,
    pub expiry_secs: u32,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreatedInvoice {
    /// Payment hash of the invoice.
    pub id: [u8; 32],
    pub request: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvoiceStatus {
    Open,
    Settled { received_mtokens: u64 },
    Canceled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRequest {
    pub id: [u8; 32],
    pub destination: NodeId,
    pub tokens: u64,
    pub mtokens: u64,
    pub cltv_delta: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteQuery {
    pub destination: NodeId,
    pub mtokens: u64,
    pub max_fee_mtokens: u64,
    pub cltv_delta: u32,
    pub outgoing_peer: Option<NodeId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub mtokens: u64,
    pub fee_mtokens: u64,
    pub hops: Vec<NodeId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaymentResult {
    pub preimage: [u8; 32],
    pub mtokens: u64,
    pub fee_mtokens: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatus {
    InFlight,
    Succeeded { mtokens: u64, fee_mtokens: u64 },
    Failed,
}

/// Off-chain side of the node.
#[async_trait]
pub trait PaymentNode: Send + Sync {
    async fn create_invoice(&self, request: &InvoiceRequest) -> Result<CreatedInvoice>;

    /// Emits every status change of the invoice, starting with its current
    /// status. Dropping the receiver ends the subscription.
    async fn subscribe_to_invoice(&self, id: [u8; 32]) -> Result<mpsc::Receiver<InvoiceStatus>>;

    /// Fails when the invoice already settled.
    async fn cancel_invoice(&self, id: [u8; 32]) -> Result<()>;

    async fn decode_payment_request(&self, request: &str) -> Result<DecodedRequest>;

    async fn find_route(&self, query: &RouteQuery) -> Result<Route>;

    async fn pay_route(&self, id: [u8; 32], route: &Route) -> Result<PaymentResult>;

    /// `None` when no payment to `id` was ever attempted.
    async fn lookup_payment(&self, id: [u8; 32]) -> Result<Option<PaymentStatus>>;
}
