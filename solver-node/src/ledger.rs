//! # Ledger Gateway
//!
//! Access to the blockchain ledger holding the solver's authoritative
//! reserves: view calls for balances and local signing with the solver's
//! account key. The rest of the node only sees the [`Ledger`] trait; the
//! concrete implementation speaks JSON-RPC over HTTP.
//!
//! When configured with more than one RPC endpoint, view calls are fanned
//! out to all of them and accepted only if every endpoint returned a byte
//! identical result. A mismatch is surfaced as [`LedgerError::Inconsistent`]
//! and never resolved to a majority.
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ed25519_dalek::{Signer, SigningKey};
use futures::future::try_join_all;
#[cfg(test)]
use mockall::automock;
use num_bigint::BigUint;
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{instrument, trace};

#[derive(Error, Debug)]
pub enum LedgerError {
    /// The passed ledger url failed to parse.
    #[error("Failed to parse URL: {0}. Error: {1}")]
    UrlParsing(String, String),

    /// At least one RPC endpoint must be configured.
    #[error("At least one ledger rpc endpoint is required")]
    NoEndpoints,

    /// Errors forwarded from the HTTP protocol.
    #[error("Unexpected HTTP client error: {0}")]
    Http(String, #[source] reqwest::Error),

    /// The ledger node answered with an error object.
    #[error("The ledger node replied with an error: {0}")]
    Rpc(String),

    /// The response from the node could not be parsed correctly.
    #[error("Failed to parse response: {0}")]
    ParseResponse(String),

    /// A balance query returned the wrong number of entries.
    #[error("Expected {expected} balances but got {got}")]
    ShapeMismatch { expected: usize, got: usize },

    /// Quorum endpoints disagreed on a view call result.
    #[error("Quorum endpoints returned inconsistent results")]
    Inconsistent,

    /// The configured signing key could not be decoded.
    #[error("Invalid signing key: {0}")]
    InvalidKey(String),
}

/// A detached signature over a quote hash, in the ledger's text encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedMessage {
    pub signature: String,
    pub public_key: String,
}

/// The ledger surface the solver core depends on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Ledger: Send + Sync {
    /// The ledger account this solver quotes and signs as.
    fn account_id(&self) -> String;

    /// Signs a 32 byte digest with the solver's account key.
    async fn sign(&self, digest: [u8; 32]) -> Result<SignedMessage, LedgerError>;

    /// Reads the authoritative balances for the given asset ids.
    ///
    /// Returns exactly one balance per requested id, in request order, or
    /// fails; callers never have to guess at partial results.
    async fn get_reserves(&self, asset_ids: &[String]) -> Result<Vec<BigUint>, LedgerError>;
}

#[derive(Deserialize)]
struct RpcEnvelope {
    #[serde(default)]
    result: Option<CallResult>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Deserialize)]
struct CallResult {
    /// Raw bytes of the view function's return value (JSON encoded).
    result: Vec<u8>,
}

/// JSON-RPC implementation of [`Ledger`] for a NEAR style ledger.
#[derive(Clone)]
pub struct NearLedger {
    http: Client,
    /// One endpoint means plain reads; two or more enable quorum reads.
    endpoints: Vec<Url>,
    account_id: String,
    /// The multi-token contract holding the solver's reserves.
    contract_id: String,
    signing_key: SigningKey,
}

impl NearLedger {
    pub fn new(
        endpoints: &[String],
        account_id: &str,
        contract_id: &str,
        private_key: &str,
    ) -> Result<Self, LedgerError> {
        if endpoints.is_empty() {
            return Err(LedgerError::NoEndpoints);
        }
        let endpoints = endpoints
            .iter()
            .map(|raw| {
                Url::parse(raw).map_err(|e| LedgerError::UrlParsing(raw.clone(), e.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            http: Client::new(),
            endpoints,
            account_id: account_id.to_string(),
            contract_id: contract_id.to_string(),
            signing_key: parse_secret_key(private_key)?,
        })
    }

    async fn view_call(
        &self,
        url: &Url,
        method_name: &str,
        args: &Value,
    ) -> Result<Vec<u8>, LedgerError> {
        let args_bytes = serde_json::to_vec(args)
            .map_err(|e| LedgerError::ParseResponse(format!("Failed to encode args: {e}")))?;
        let body = json!({
            "jsonrpc": "2.0",
            "id": "solver-node",
            "method": "query",
            "params": {
                "request_type": "call_function",
                "finality": "final",
                "account_id": self.contract_id,
                "method_name": method_name,
                "args_base64": BASE64.encode(args_bytes),
            }
        });
        trace!(%url, method_name, "Issuing view call");
        let response = self
            .http
            .post(url.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| LedgerError::Http(format!("Failed to reach ledger node {url}"), e))?;
        let envelope: RpcEnvelope = response
            .json()
            .await
            .map_err(|e| LedgerError::Http("Failed to read ledger response".to_string(), e))?;
        if let Some(error) = envelope.error {
            return Err(LedgerError::Rpc(error.to_string()));
        }
        envelope
            .result
            .map(|r| r.result)
            .ok_or_else(|| {
                LedgerError::ParseResponse(
                    "Response carried neither result nor error".to_string(),
                )
            })
    }

    /// Runs a view call against all configured endpoints and requires byte
    /// identical results.
    async fn view_call_quorum(
        &self,
        method_name: &str,
        args: &Value,
    ) -> Result<Vec<u8>, LedgerError> {
        if self.endpoints.len() == 1 {
            return self
                .view_call(&self.endpoints[0], method_name, args)
                .await;
        }
        let results = try_join_all(
            self.endpoints
                .iter()
                .map(|url| self.view_call(url, method_name, args)),
        )
        .await?;
        quorum(results)
    }
}

/// Accepts a quorum result only if every endpoint agreed exactly.
fn quorum(results: Vec<Vec<u8>>) -> Result<Vec<u8>, LedgerError> {
    let mut results = results.into_iter();
    let first = results
        .next()
        .ok_or(LedgerError::NoEndpoints)?;
    for other in results {
        if other != first {
            return Err(LedgerError::Inconsistent);
        }
    }
    Ok(first)
}

/// Decodes a `ed25519:<base58>` secret key, accepting both the 64 byte
/// keypair form and a bare 32 byte seed.
fn parse_secret_key(encoded: &str) -> Result<SigningKey, LedgerError> {
    let encoded = encoded
        .strip_prefix("ed25519:")
        .unwrap_or(encoded);
    let bytes = bs58::decode(encoded)
        .into_vec()
        .map_err(|e| LedgerError::InvalidKey(e.to_string()))?;
    let seed: [u8; 32] = match bytes.len() {
        32 | 64 => bytes[..32]
            .try_into()
            .map_err(|_| LedgerError::InvalidKey("Malformed key bytes".to_string()))?,
        n => return Err(LedgerError::InvalidKey(format!("Unexpected key length: {n}"))),
    };
    Ok(SigningKey::from_bytes(&seed))
}

#[async_trait]
impl Ledger for NearLedger {
    fn account_id(&self) -> String {
        self.account_id.clone()
    }

    async fn sign(&self, digest: [u8; 32]) -> Result<SignedMessage, LedgerError> {
        let signature = self.signing_key.sign(&digest);
        let public_key = self.signing_key.verifying_key();
        Ok(SignedMessage {
            signature: format!("ed25519:{}", bs58::encode(signature.to_bytes()).into_string()),
            public_key: format!("ed25519:{}", bs58::encode(public_key.to_bytes()).into_string()),
        })
    }

    #[instrument(skip(self))]
    async fn get_reserves(&self, asset_ids: &[String]) -> Result<Vec<BigUint>, LedgerError> {
        let args = json!({
            "account_id": self.account_id,
            "token_ids": asset_ids,
        });
        let raw = self
            .view_call_quorum("mt_batch_balance_of", &args)
            .await?;
        let balances: Vec<String> = serde_json::from_slice(&raw)
            .map_err(|e| LedgerError::ParseResponse(format!("Invalid balance payload: {e}")))?;
        if balances.len() != asset_ids.len() {
            return Err(LedgerError::ShapeMismatch {
                expected: asset_ids.len(),
                got: balances.len(),
            });
        }
        balances
            .iter()
            .map(|balance| {
                balance
                    .parse::<BigUint>()
                    .map_err(|e| {
                        LedgerError::ParseResponse(format!("Invalid balance '{balance}': {e}"))
                    })
            })
            .collect()
    }
}
