//! # Reserve State Store
//!
//! In-memory snapshot of the solver's on-ledger reserves. Quotes are always
//! priced against the latest complete snapshot; refreshes replace it
//! atomically and concurrent refresh calls coalesce into a single ledger
//! read, so a burst of fills cannot stampede the RPC nodes.
use std::{collections::BTreeMap, sync::Arc};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use futures::{
    future::{BoxFuture, Shared},
    FutureExt,
};
use num_bigint::BigUint;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error};

use crate::ledger::Ledger;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// No snapshot has been loaded yet.
    #[error("Reserve state not initialized")]
    Uninitialized,

    /// The ledger read behind a refresh failed.
    #[error("Failed to refresh reserves: {0}")]
    RefreshFailed(String),
}

/// One complete, immutable snapshot of the solver's reserves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReserveState {
    balances: BTreeMap<String, BigUint>,
    /// SHA-256 over the canonical balance listing. Identical reserves always
    /// produce identical nonces, which makes repeated quotes against an
    /// unchanged snapshot replay-safe duplicates instead of distinct intents.
    nonce: [u8; 32],
}

impl ReserveState {
    pub fn new(balances: BTreeMap<String, BigUint>) -> Self {
        let canonical = balances
            .iter()
            .map(|(asset, balance)| format!("{asset}:{balance}"))
            .collect::<Vec<_>>()
            .join(",");
        let nonce = Sha256::digest(canonical.as_bytes()).into();
        Self { balances, nonce }
    }

    pub fn balance(&self, asset_id: &str) -> Option<&BigUint> {
        self.balances.get(asset_id)
    }

    pub fn nonce(&self) -> [u8; 32] {
        self.nonce
    }

    pub fn nonce_b64(&self) -> String {
        BASE64.encode(self.nonce)
    }
}

type RefreshFuture = Shared<BoxFuture<'static, Result<(), StateError>>>;

struct StoreInner {
    ledger: Arc<dyn Ledger>,
    /// Asset ids queried on every refresh, in a fixed order.
    assets: Vec<String>,
    state: RwLock<Option<Arc<ReserveState>>>,
    inflight: Mutex<Option<RefreshFuture>>,
}

impl StoreInner {
    async fn fetch(&self) -> Result<(), StateError> {
        let balances = self
            .ledger
            .get_reserves(&self.assets)
            .await
            .map_err(|e| {
                error!(error = %e, "Reserve refresh failed, keeping previous snapshot");
                StateError::RefreshFailed(e.to_string())
            })?;
        let state = ReserveState::new(
            self.assets
                .iter()
                .cloned()
                .zip(balances)
                .collect(),
        );
        debug!(nonce = state.nonce_b64(), "Reserve snapshot updated");
        *self.state.write().await = Some(Arc::new(state));
        Ok(())
    }
}

/// Shared handle to the reserve snapshot. Cheap to clone.
#[derive(Clone)]
pub struct ReserveStore {
    inner: Arc<StoreInner>,
}

impl ReserveStore {
    pub fn new(ledger: Arc<dyn Ledger>, mut assets: Vec<String>) -> Self {
        assets.sort();
        assets.dedup();
        Self {
            inner: Arc::new(StoreInner {
                ledger,
                assets,
                state: RwLock::new(None),
                inflight: Mutex::new(None),
            }),
        }
    }

    /// The latest snapshot, or [`StateError::Uninitialized`] before the first
    /// successful refresh.
    pub async fn current(&self) -> Result<Arc<ReserveState>, StateError> {
        self.inner
            .state
            .read()
            .await
            .clone()
            .ok_or(StateError::Uninitialized)
    }

    pub async fn initialized(&self) -> bool {
        self.inner.state.read().await.is_some()
    }

    /// Reloads the snapshot from the ledger. Calls arriving while a refresh
    /// is already in flight await that refresh instead of issuing another
    /// ledger read. A failed refresh leaves the previous snapshot in place.
    pub async fn refresh(&self) -> Result<(), StateError> {
        let refresh = {
            let mut inflight = self.inner.inflight.lock().await;
            match inflight.as_ref() {
                Some(pending) => pending.clone(),
                None => {
                    let inner = self.inner.clone();
                    let fresh: RefreshFuture = async move {
                        let result = inner.fetch().await;
                        inner.inflight.lock().await.take();
                        result
                    }
                    .boxed()
                    .shared();
                    *inflight = Some(fresh.clone());
                    fresh
                }
            }
        };
        refresh.await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::ledger::{LedgerError, SignedMessage};

    fn big(value: u128) -> BigUint {
        BigUint::from(value)
    }

    fn state(entries: &[(&str, u128)]) -> ReserveState {
        ReserveState::new(
            entries
                .iter()
                .map(|(asset, balance)| (asset.to_string(), big(*balance)))
                .collect(),
        )
    }

    /// Ledger double that counts reads and holds each one open briefly, so
    /// tests can overlap refreshes deterministically.
    struct CountingLedger {
        calls: AtomicUsize,
        balances: Vec<BigUint>,
        fail: bool,
    }

    impl CountingLedger {
        fn new(balances: Vec<BigUint>) -> Self {
            Self { calls: AtomicUsize::new(0), balances, fail: false }
        }

        fn failing() -> Self {
            Self { calls: AtomicUsize::new(0), balances: vec![], fail: true }
        }
    }

    #[async_trait]
    impl Ledger for CountingLedger {
        fn account_id(&self) -> String {
            "solver.near".to_string()
        }

        async fn sign(&self, _digest: [u8; 32]) -> Result<SignedMessage, LedgerError> {
            unreachable!("reserve tests never sign")
        }

        async fn get_reserves(&self, _asset_ids: &[String]) -> Result<Vec<BigUint>, LedgerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail {
                return Err(LedgerError::Rpc("node unavailable".to_string()));
            }
            Ok(self.balances.clone())
        }
    }

    #[test]
    fn test_nonce_is_deterministic() {
        let first = state(&[("a.near", 100), ("b.near", 200)]);
        let second = state(&[("b.near", 200), ("a.near", 100)]);

        assert_eq!(first.nonce(), second.nonce());
        assert_eq!(first.nonce_b64(), second.nonce_b64());
    }

    #[test]
    fn test_nonce_changes_with_any_balance() {
        let base = state(&[("a.near", 100), ("b.near", 200)]);
        let changed = state(&[("a.near", 100), ("b.near", 201)]);

        assert_ne!(base.nonce(), changed.nonce());
    }

    #[test]
    fn test_nonce_separates_asset_and_balance() {
        // "ab:1" vs "a:b1" style collisions must not produce equal nonces.
        let first = state(&[("a", 11)]);
        let second = state(&[("a1", 1)]);

        assert_ne!(first.nonce(), second.nonce());
    }

    #[tokio::test]
    async fn test_current_before_refresh_is_uninitialized() {
        let store = ReserveStore::new(
            Arc::new(CountingLedger::new(vec![big(1)])),
            vec!["a.near".to_string()],
        );

        assert_eq!(store.current().await, Err(StateError::Uninitialized));
        assert!(!store.initialized().await);
    }

    #[tokio::test]
    async fn test_refresh_publishes_snapshot() {
        let store = ReserveStore::new(
            Arc::new(CountingLedger::new(vec![big(100), big(200)])),
            vec!["b.near".to_string(), "a.near".to_string()],
        );

        store.refresh().await.unwrap();

        let snapshot = store.current().await.unwrap();
        // Assets are queried in sorted order.
        assert_eq!(snapshot.balance("a.near"), Some(&big(100)));
        assert_eq!(snapshot.balance("b.near"), Some(&big(200)));
        assert!(store.initialized().await);
    }

    #[test_log::test(tokio::test)]
    async fn test_concurrent_refreshes_coalesce_into_one_read() {
        let ledger = Arc::new(CountingLedger::new(vec![big(1)]));
        let store = ReserveStore::new(ledger.clone(), vec!["a.near".to_string()]);

        let (first, second, third) =
            tokio::join!(store.refresh(), store.refresh(), store.refresh());

        assert_eq!(first, Ok(()));
        assert_eq!(second, Ok(()));
        assert_eq!(third, Ok(()));
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 1);

        // A refresh after the burst settles issues a new read.
        store.refresh().await.unwrap();
        assert_eq!(ledger.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_previous_snapshot() {
        let good = Arc::new(CountingLedger::new(vec![big(42)]));
        let store = ReserveStore::new(good, vec!["a.near".to_string()]);
        store.refresh().await.unwrap();
        let before = store.current().await.unwrap();

        let failing_store = ReserveStore {
            inner: Arc::new(StoreInner {
                ledger: Arc::new(CountingLedger::failing()),
                assets: store.inner.assets.clone(),
                state: RwLock::new(Some(before.clone())),
                inflight: Mutex::new(None),
            }),
        };

        let res = failing_store.refresh().await;
        assert!(matches!(res, Err(StateError::RefreshFailed(_))));
        assert_eq!(failing_store.current().await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_joined_refresh_sees_the_shared_error() {
        let store = ReserveStore::new(
            Arc::new(CountingLedger::failing()),
            vec!["a.near".to_string()],
        );

        let (first, second) = tokio::join!(store.refresh(), store.refresh());

        assert!(matches!(first, Err(StateError::RefreshFailed(_))));
        assert_eq!(first, second);
    }
}
