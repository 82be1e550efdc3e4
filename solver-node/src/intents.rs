//! # Intent Encoding
//!
//! Builds the signed payload behind every published quote: the token diff
//! intent message as canonical JSON, and its NEP-413 digest. The digest is
//! what the ledger verifies, and its base58 form doubles as the quote hash
//! the relay uses to reference the quote later.
use borsh::BorshSerialize;
use chrono::{DateTime, SecondsFormat};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Signing standard announced alongside every published quote.
pub const SIGN_STANDARD: &str = "nep413";

/// NEP-413 domain separator, 2^31 + 413.
const NEP413_PREFIX: u32 = (1u32 << 31) + 413;

#[derive(Error, Debug)]
pub enum IntentError {
    #[error("Failed to encode intent: {0}")]
    Encoding(String),

    /// The deadline does not map to a representable timestamp.
    #[error("Invalid deadline: {0}ms")]
    InvalidDeadline(i64),
}

/// Borsh layout mandated by NEP-413 for off-chain message signing.
#[derive(BorshSerialize)]
struct Nep413Payload {
    message: String,
    nonce: [u8; 32],
    recipient: String,
    callback_url: Option<String>,
}

/// SHA-256 digest of the borsh encoded prefix and payload. This is the exact
/// preimage the solver signs and verifiers recompute.
pub fn hash_intent(
    message: &str,
    recipient: &str,
    nonce: [u8; 32],
) -> Result<[u8; 32], IntentError> {
    let payload = Nep413Payload {
        message: message.to_string(),
        nonce,
        recipient: recipient.to_string(),
        callback_url: None,
    };
    let mut preimage =
        borsh::to_vec(&NEP413_PREFIX).map_err(|e| IntentError::Encoding(e.to_string()))?;
    payload
        .serialize(&mut preimage)
        .map_err(|e| IntentError::Encoding(e.to_string()))?;
    Ok(Sha256::digest(&preimage).into())
}

/// Base58 rendering of an intent digest, used as the quote hash on the wire.
pub fn quote_hash(digest: &[u8; 32]) -> String {
    bs58::encode(digest).into_string()
}

/// One atomic state change proposed by the solver.
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum Intent {
    /// Balance deltas from the solver's perspective. Gained assets carry a
    /// plain amount, paid assets a `-` prefixed one.
    TokenDiff { diff: Map<String, Value> },
}

/// The message a taker countersigns to execute the trade. Field order is part
/// of the wire format since the digest is computed over the JSON text.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct IntentMessage {
    pub signer_id: String,
    pub deadline: String,
    pub intents: Vec<Intent>,
}

impl IntentMessage {
    pub fn to_json(&self) -> Result<String, IntentError> {
        serde_json::to_string(self).map_err(|e| IntentError::Encoding(e.to_string()))
    }
}

/// Builds a single token diff message: the solver takes `amount_in` of
/// `asset_in` and gives `amount_out` of `asset_out`.
pub fn token_diff_message(
    signer_id: &str,
    deadline_ms: i64,
    asset_in: &str,
    amount_in: &str,
    asset_out: &str,
    amount_out: &str,
) -> Result<IntentMessage, IntentError> {
    let mut diff = Map::new();
    diff.insert(asset_in.to_string(), Value::String(amount_in.to_string()));
    diff.insert(asset_out.to_string(), Value::String(format!("-{amount_out}")));
    Ok(IntentMessage {
        signer_id: signer_id.to_string(),
        deadline: deadline_rfc3339(deadline_ms)?,
        intents: vec![Intent::TokenDiff { diff }],
    })
}

/// Millisecond precision RFC 3339 timestamp in UTC, e.g.
/// `2024-01-01T00:01:00.000Z`.
pub fn deadline_rfc3339(deadline_ms: i64) -> Result<String, IntentError> {
    let deadline = DateTime::from_timestamp_millis(deadline_ms)
        .ok_or(IntentError::InvalidDeadline(deadline_ms))?;
    Ok(deadline.to_rfc3339_opts(SecondsFormat::Millis, true))
}
