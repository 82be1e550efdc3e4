//! Data Transfer Objects (or structs)
//!
//! These structs serialise and deserialize messages exchanged with the intents
//! relay. They should be very simple and ideally not contain any business
//! logic.
//!
//! The relay speaks JSON-RPC 2.0 over a websocket: the solver sends correlated
//! requests (`subscribe`, `quote_response`) and receives either responses to
//! those requests or `event` notifications fanned out for one of its
//! subscriptions.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use strum_macros::{Display, EnumString};

pub const JSONRPC_VERSION: &str = "2.0";

/// Methods the solver may invoke on the relay.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RelayMethod {
    Subscribe,
    QuoteResponse,
}

/// Event feeds a solver can subscribe to.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    /// Incoming quote requests from takers.
    Quote,
    /// Fill notifications for previously published quotes.
    QuoteStatus,
}

/// An outbound correlated JSON-RPC request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub id: u64,
    pub jsonrpc: String,
    pub method: RelayMethod,
    pub params: Vec<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: RelayMethod, params: Vec<Value>) -> Self {
        Self { id, jsonrpc: JSONRPC_VERSION.to_string(), method, params }
    }
}

/// A response correlated to one of our requests by `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub id: u64,
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

/// Tag for the only server initiated method the relay uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventMethod {
    #[serde(rename = "event")]
    Event,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventParams {
    pub subscription: String,
    pub data: Value,
}

/// A notification for an active subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventNotification {
    pub jsonrpc: String,
    pub method: EventMethod,
    pub params: EventParams,
}

/// Any message the relay may push to us.
///
/// Parsing into this enum is the only place inbound message shapes are
/// inspected; anything that does not match one of the two variants is
/// dropped by the client without closing the connection.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum RelayMessage {
    Response(JsonRpcResponse),
    Event(EventNotification),
}

/// A quote request fanned out by the relay to all solvers.
///
/// Exactly one of `exact_amount_in` and `exact_amount_out` is expected to be
/// set; the orchestrator enforces the XOR. Amounts are decimal strings in the
/// asset's smallest unit to avoid JSON number precision loss.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteRequest {
    pub quote_id: String,
    pub asset_in: String,
    pub asset_out: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact_amount_in: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exact_amount_out: Option<String>,
    /// How long the taker needs the quote to remain valid.
    pub min_deadline_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QuoteOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_in: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_out: Option<String>,
}

/// The payload that was hashed and signed for this quote.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedPayload {
    /// The serialized intent message.
    pub message: String,
    /// Reserve state derived nonce, base64 encoded.
    pub nonce: String,
    pub recipient: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignedData {
    /// Signing standard discriminator, e.g. "nep413".
    pub standard: String,
    pub payload: SignedPayload,
    pub signature: String,
    pub public_key: String,
}

/// The solver's signed answer to a [`QuoteRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuoteResponse {
    pub quote_id: String,
    pub quote_output: QuoteOutput,
    pub signed_data: SignedData,
}

/// Notification that a previously issued quote was executed on-ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FillNotification {
    pub quote_hash: String,
    pub intent_hash: String,
    pub tx_hash: String,
}
