//! # Quote Orchestrator
//!
//! Consumes quote request and fill events from the relay, prices requests
//! against the reserve snapshot, signs the resulting intent and publishes
//! the quote back. Requests the solver cannot or should not serve are
//! dropped silently; only the reason is logged, never an error reply.
use std::{sync::Arc, time::Duration};

use chrono::Utc;
use num_bigint::BigUint;
use serde_json::Value;
use solver_relay::{
    dto::{
        FillNotification, QuoteOutput, QuoteRequest, QuoteResponse, RelayMethod, SignedData,
        SignedPayload,
    },
    RelayClient,
};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    cache::QuoteCache,
    intents::{self, SIGN_STANDARD},
    ledger::Ledger,
    pricing,
    reserves::{ReserveStore, StateError},
};

/// Longest deadline a taker may demand; protects against open ended
/// signing commitments.
pub const DEFAULT_MAX_DEADLINE_MS: u64 = 60_000;
/// Slack added on top of the requested deadline, covering settlement lag.
pub const DEFAULT_GRACE_MS: u64 = 10_000;

/// Why a quote request was not answered.
#[derive(Error, Debug)]
pub enum QuoteDrop {
    #[error("Same asset on both sides")]
    SamePair,

    #[error("Untracked asset: {0}")]
    UntrackedAsset(String),

    #[error("Reserves not initialized")]
    Uninitialized,

    #[error("Requested deadline {0}ms exceeds the maximum offered")]
    DeadlineTooLong(u64),

    #[error("Exactly one of exact_amount_in and exact_amount_out must be set")]
    AmbiguousAmount,

    #[error("Unparseable amount: {0}")]
    BadAmount(String),

    #[error("Quote amount rounds to zero")]
    ZeroQuote,

    #[error("Insufficient liquidity for the requested trade")]
    InsufficientLiquidity,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl QuoteDrop {
    /// Whether the drop indicates the solver itself is unhealthy rather
    /// than the request being unservable. These log at error severity.
    pub fn is_operator_actionable(&self) -> bool {
        matches!(self, QuoteDrop::Uninitialized | QuoteDrop::Internal(_))
    }
}

impl From<StateError> for QuoteDrop {
    fn from(_: StateError) -> Self {
        QuoteDrop::Uninitialized
    }
}

#[derive(Clone)]
pub struct QuoterConfig {
    pub margin_bps: u32,
    /// Requests demanding a longer deadline than this are dropped.
    pub max_deadline_ms: u64,
    /// Slack added past the requested deadline, on both the signed intent
    /// and the cache entry.
    pub grace_ms: u64,
    /// Verifier contract the signed intents are addressed to.
    pub recipient: String,
}

pub struct Quoter {
    config: QuoterConfig,
    store: ReserveStore,
    /// Published responses by quote hash, kept until their deadline so fill
    /// notifications can be matched back to our own quotes.
    cache: QuoteCache<QuoteResponse>,
    ledger: Arc<dyn Ledger>,
    relay: Arc<dyn RelayClient>,
}

impl Quoter {
    pub fn new(
        config: QuoterConfig,
        store: ReserveStore,
        ledger: Arc<dyn Ledger>,
        relay: Arc<dyn RelayClient>,
    ) -> Self {
        Self { config, store, cache: QuoteCache::new(), ledger, relay }
    }

    /// Prices, signs and caches a single quote request.
    pub async fn quote(&self, request: QuoteRequest) -> Result<QuoteResponse, QuoteDrop> {
        if request.asset_in == request.asset_out {
            return Err(QuoteDrop::SamePair);
        }
        if request.min_deadline_ms > self.config.max_deadline_ms {
            return Err(QuoteDrop::DeadlineTooLong(request.min_deadline_ms));
        }
        let snapshot = self.store.current().await?;
        let reserve_in = snapshot
            .balance(&request.asset_in)
            .ok_or_else(|| QuoteDrop::UntrackedAsset(request.asset_in.clone()))?;
        let reserve_out = snapshot
            .balance(&request.asset_out)
            .ok_or_else(|| QuoteDrop::UntrackedAsset(request.asset_out.clone()))?;

        let (amount_in, amount_out, output) =
            match (&request.exact_amount_in, &request.exact_amount_out) {
                (Some(exact_in), None) => {
                    let amount_in = parse_amount(exact_in)?;
                    let amount_out = price(
                        pricing::quote_out(
                            &amount_in,
                            reserve_in,
                            reserve_out,
                            self.config.margin_bps,
                        ),
                        exact_in,
                    )?;
                    if amount_out >= *reserve_out {
                        return Err(QuoteDrop::InsufficientLiquidity);
                    }
                    let output =
                        QuoteOutput { amount_out: Some(amount_out.to_string()), ..Default::default() };
                    (amount_in, amount_out, output)
                }
                (None, Some(exact_out)) => {
                    let amount_out = parse_amount(exact_out)?;
                    let amount_in = price(
                        pricing::quote_in(
                            &amount_out,
                            reserve_in,
                            reserve_out,
                            self.config.margin_bps,
                        ),
                        exact_out,
                    )?;
                    let output =
                        QuoteOutput { amount_in: Some(amount_in.to_string()), ..Default::default() };
                    (amount_in, amount_out, output)
                }
                _ => return Err(QuoteDrop::AmbiguousAmount),
            };

        let validity_ms = request.min_deadline_ms + self.config.grace_ms;
        let deadline_ms = Utc::now().timestamp_millis() + validity_ms as i64;
        let message = intents::token_diff_message(
            &self.ledger.account_id(),
            deadline_ms,
            &request.asset_in,
            &amount_in.to_string(),
            &request.asset_out,
            &amount_out.to_string(),
        )
        .and_then(|m| m.to_json())
        .map_err(|e| QuoteDrop::Internal(e.to_string()))?;

        let digest = intents::hash_intent(&message, &self.config.recipient, snapshot.nonce())
            .map_err(|e| QuoteDrop::Internal(e.to_string()))?;
        let quote_hash = intents::quote_hash(&digest);
        let signed = self
            .ledger
            .sign(digest)
            .await
            .map_err(|e| QuoteDrop::Internal(e.to_string()))?;

        let response = QuoteResponse {
            quote_id: request.quote_id,
            quote_output: output,
            signed_data: SignedData {
                standard: SIGN_STANDARD.to_string(),
                payload: SignedPayload {
                    message,
                    nonce: snapshot.nonce_b64(),
                    recipient: self.config.recipient.clone(),
                },
                signature: signed.signature,
                public_key: signed.public_key,
            },
        };
        self.cache
            .insert(quote_hash.clone(), response.clone(), Duration::from_millis(validity_ms));
        debug!(quote_id = response.quote_id, quote_hash, "Quote signed and cached");
        Ok(response)
    }

    /// Reacts to a fill notification. Returns whether the filled quote was
    /// one of ours.
    pub async fn handle_fill(&self, fill: FillNotification) -> bool {
        let Some(quote) = self.cache.get(&fill.quote_hash) else {
            debug!(quote_hash = fill.quote_hash, "Fill for a quote we did not issue");
            return false;
        };
        info!(
            quote_id = quote.quote_id,
            quote_hash = fill.quote_hash,
            tx_hash = fill.tx_hash,
            "Quote filled, refreshing reserves"
        );
        if let Err(e) = self.store.refresh().await {
            warn!(error = %e, "Post-fill reserve refresh failed");
        }
        true
    }

    /// Drains quote request events until the channel closes.
    pub async fn run_quote_loop(self: Arc<Self>, mut events: mpsc::Receiver<Value>) {
        while let Some(data) = events.recv().await {
            let request: QuoteRequest = match serde_json::from_value(data) {
                Ok(request) => request,
                Err(e) => {
                    debug!(error = %e, "Discarding malformed quote request");
                    continue;
                }
            };
            let quote_id = request.quote_id.clone();
            match self.quote(request).await {
                Ok(response) => self.publish(response).await,
                Err(reason) if reason.is_operator_actionable() => {
                    error!(quote_id, %reason, "Dropping quote request")
                }
                Err(reason) => debug!(quote_id, %reason, "Dropping quote request"),
            }
        }
        debug!("Quote event stream closed");
    }

    /// Drains fill events until the channel closes.
    pub async fn run_fill_loop(self: Arc<Self>, mut events: mpsc::Receiver<Value>) {
        while let Some(data) = events.recv().await {
            match serde_json::from_value::<FillNotification>(data) {
                Ok(fill) => {
                    self.handle_fill(fill).await;
                }
                Err(e) => debug!(error = %e, "Discarding malformed fill notification"),
            }
        }
        debug!("Fill event stream closed");
    }

    async fn publish(&self, response: QuoteResponse) {
        let quote_id = response.quote_id.clone();
        let params = match serde_json::to_value(&response) {
            Ok(params) => params,
            Err(e) => {
                warn!(quote_id, error = %e, "Failed to encode quote response");
                return;
            }
        };
        match self.relay.call(RelayMethod::QuoteResponse, vec![params]).await {
            Ok(_) => info!(quote_id, "Published quote"),
            Err(e) => warn!(quote_id, error = %e, "Failed to publish quote"),
        }
    }

    #[cfg(test)]
    fn cached(&self, quote_hash: &str) -> Option<QuoteResponse> {
        self.cache.get(quote_hash)
    }
}

fn parse_amount(raw: &str) -> Result<BigUint, QuoteDrop> {
    raw.parse::<BigUint>()
        .map_err(|_| QuoteDrop::BadAmount(raw.to_string()))
}

fn price(
    result: Result<BigUint, pricing::PricingError>,
    raw_amount: &str,
) -> Result<BigUint, QuoteDrop> {
    use num_traits::Zero;
    let amount = result.map_err(|e| match e {
        pricing::PricingError::InvalidInput => QuoteDrop::BadAmount(raw_amount.to_string()),
        pricing::PricingError::InsufficientLiquidity => QuoteDrop::InsufficientLiquidity,
    })?;
    if amount.is_zero() {
        return Err(QuoteDrop::ZeroQuote);
    }
    Ok(amount)
}
