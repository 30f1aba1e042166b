//! Policy store access for the hot path.
//!
//! [`PolicyBackend`] is the read seam onto wherever the reasoning layer keeps
//! its committed state. [`InMemoryPolicyCache`] is the in-process backend fed
//! by update notifications. [`PolicyStoreClient`] wraps a backend with the
//! lookup budget, symbol→global fallback and the fail-closed staleness check.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use nurse_types::{NurseError, PolicyDocument, PolicyScope, PolicyUpdate, RegimeStatus};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("policy store unavailable: {0}")]
    Unavailable(String),
    #[error("lookup exceeded budget of {0:?}")]
    Timeout(Duration),
    #[error("stale version for {key}: offered {offered}, current {current}")]
    StaleVersion {
        key: String,
        offered: u64,
        current: u64,
    },
    #[error("invalid document: {0}")]
    Invalid(String),
}

impl From<StoreError> for NurseError {
    fn from(e: StoreError) -> Self {
        NurseError::Store(e.to_string())
    }
}

/// Read interface onto committed policy state.
#[async_trait]
pub trait PolicyBackend: Send + Sync {
    /// The document stored for exactly `scope`, if any.
    async fn fetch_policy(
        &self,
        scope: &PolicyScope,
    ) -> Result<Option<Arc<PolicyDocument>>, StoreError>;

    async fn fetch_regime(&self) -> Result<Option<Arc<RegimeStatus>>, StoreError>;

    /// Cheap liveness check used by the heartbeat.
    async fn ping(&self) -> Result<(), StoreError>;
}

// ─────────────────────────────────────────────────────────────────────────────
// InMemoryPolicyCache
// ─────────────────────────────────────────────────────────────────────────────

/// In-process policy backend.
///
/// Documents are never mutated in place: a write swaps in a new `Arc`, so a
/// reader holds either the old or the new document, never a mix. Writes must
/// carry a strictly greater version than what is stored for the scope.
pub struct InMemoryPolicyCache {
    policies: RwLock<HashMap<PolicyScope, Arc<PolicyDocument>>>,
    regime: RwLock<Option<Arc<RegimeStatus>>>,
    available: AtomicBool,
    latency: RwLock<Duration>,
}

impl InMemoryPolicyCache {
    pub fn new() -> Self {
        Self {
            policies: RwLock::default(),
            regime: RwLock::default(),
            available: AtomicBool::new(true),
            latency: RwLock::new(Duration::ZERO),
        }
    }

    /// Store `doc` if it is newer than what the scope currently holds.
    ///
    /// # Errors
    ///
    /// - [`StoreError::Invalid`] – the document fails validation.
    /// - [`StoreError::StaleVersion`] – version not strictly greater.
    pub fn put_policy(&self, doc: PolicyDocument) -> Result<(), StoreError> {
        doc.validate().map_err(|e| StoreError::Invalid(e.to_string()))?;
        let mut policies = self.policies.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = policies.get(&doc.scope)
            && doc.version <= current.version
        {
            return Err(StoreError::StaleVersion {
                key: doc.scope.to_string(),
                offered: doc.version,
                current: current.version,
            });
        }
        debug!(scope = %doc.scope, version = doc.version, "policy document stored");
        policies.insert(doc.scope.clone(), Arc::new(doc));
        Ok(())
    }

    /// Store `status` if it is newer than the current regime.
    ///
    /// # Errors
    ///
    /// Same as [`put_policy`][Self::put_policy].
    pub fn put_regime(&self, status: RegimeStatus) -> Result<(), StoreError> {
        status
            .validate()
            .map_err(|e| StoreError::Invalid(e.to_string()))?;
        let mut regime = self.regime.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = regime.as_ref()
            && status.version <= current.version
        {
            return Err(StoreError::StaleVersion {
                key: "regime".into(),
                offered: status.version,
                current: current.version,
            });
        }
        debug!(version = status.version, phase = %status.phase, "regime status stored");
        *regime = Some(Arc::new(status));
        Ok(())
    }

    /// Apply one update notification. Returns the key and version stored.
    pub fn apply(&self, update: PolicyUpdate) -> Result<(VersionKey, u64), StoreError> {
        match update {
            PolicyUpdate::Policy(doc) => {
                let key = VersionKey::Policy(doc.scope.clone());
                let version = doc.version;
                self.put_policy(doc)?;
                Ok((key, version))
            }
            PolicyUpdate::Regime(status) => {
                let version = status.version;
                self.put_regime(status)?;
                Ok((VersionKey::Regime, version))
            }
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::Release);
    }

    /// Artificial delay added to every read.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.write().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    async fn gate(&self) -> Result<(), StoreError> {
        let latency = *self.latency.read().unwrap_or_else(PoisonError::into_inner);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.available.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("cache offline".into()))
        }
    }
}

impl Default for InMemoryPolicyCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PolicyBackend for InMemoryPolicyCache {
    async fn fetch_policy(
        &self,
        scope: &PolicyScope,
    ) -> Result<Option<Arc<PolicyDocument>>, StoreError> {
        self.gate().await?;
        Ok(self
            .policies
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(scope)
            .cloned())
    }

    async fn fetch_regime(&self) -> Result<Option<Arc<RegimeStatus>>, StoreError> {
        self.gate().await?;
        Ok(self
            .regime
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.gate().await
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// PolicyStoreClient
// ─────────────────────────────────────────────────────────────────────────────

/// What an announced version applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum VersionKey {
    Policy(PolicyScope),
    Regime,
}

/// Hot-path lookups with a hard time budget.
///
/// Every failure (timeout, outage, missing document, version older than one
/// already announced) comes back as an error; callers must fail closed.
/// Nothing is retried here.
pub struct PolicyStoreClient {
    backend: Arc<dyn PolicyBackend>,
    lookup_budget: Duration,
    announced: RwLock<HashMap<VersionKey, u64>>,
}

impl PolicyStoreClient {
    pub fn new(backend: Arc<dyn PolicyBackend>, lookup_budget: Duration) -> Self {
        Self {
            backend,
            lookup_budget,
            announced: RwLock::default(),
        }
    }

    pub fn lookup_budget(&self) -> Duration {
        self.lookup_budget
    }

    /// Remember that `version` was committed for `key`.
    pub fn acknowledge_update(&self, key: VersionKey, version: u64) {
        let mut announced = self.announced.write().unwrap_or_else(PoisonError::into_inner);
        let entry = announced.entry(key).or_insert(0);
        *entry = (*entry).max(version);
    }

    fn announced(&self, key: &VersionKey) -> Option<u64> {
        self.announced
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
    }

    fn ensure_fresh(&self, key: &VersionKey, served: u64) -> Result<(), StoreError> {
        match self.announced(key) {
            Some(expected) if served < expected => {
                warn!(?key, served, expected, "store served a version older than announced");
                Err(StoreError::Unavailable(format!(
                    "stale read for {key:?}: served {served}, announced {expected}"
                )))
            }
            _ => Ok(()),
        }
    }

    /// The document governing `symbol`: its override if present, else global.
    ///
    /// # Errors
    ///
    /// [`StoreError::Timeout`] past the lookup budget, otherwise
    /// [`StoreError::Unavailable`].
    pub async fn active_policy(&self, symbol: &str) -> Result<Arc<PolicyDocument>, StoreError> {
        tokio::time::timeout(self.lookup_budget, self.resolve_policy(symbol))
            .await
            .map_err(|_| StoreError::Timeout(self.lookup_budget))?
    }

    async fn resolve_policy(&self, symbol: &str) -> Result<Arc<PolicyDocument>, StoreError> {
        let symbol_key = VersionKey::Policy(PolicyScope::Symbol(symbol.to_string()));
        let symbol_scope = PolicyScope::Symbol(symbol.to_string());
        if let Some(doc) = self.backend.fetch_policy(&symbol_scope).await? {
            self.ensure_fresh(&symbol_key, doc.version)?;
            return Ok(doc);
        }
        // An announced override the store no longer returns is a stale read.
        if self.announced(&symbol_key).is_some() {
            return Err(StoreError::Unavailable(format!(
                "announced override for {symbol} missing"
            )));
        }
        let global = self
            .backend
            .fetch_policy(&PolicyScope::Global)
            .await?
            .ok_or_else(|| StoreError::Unavailable("no global policy".into()))?;
        self.ensure_fresh(&VersionKey::Policy(PolicyScope::Global), global.version)?;
        Ok(global)
    }

    /// # Errors
    ///
    /// As for [`active_policy`][Self::active_policy].
    pub async fn regime_status(&self) -> Result<Arc<RegimeStatus>, StoreError> {
        let lookup = async {
            let status = self
                .backend
                .fetch_regime()
                .await?
                .ok_or_else(|| StoreError::Unavailable("no regime status".into()))?;
            self.ensure_fresh(&VersionKey::Regime, status.version)?;
            Ok::<_, StoreError>(status)
        };
        tokio::time::timeout(self.lookup_budget, lookup)
            .await
            .map_err(|_| StoreError::Timeout(self.lookup_budget))?
    }

    /// Liveness probe bounded by `budget`.
    pub async fn ping(&self, budget: Duration) -> Result<(), StoreError> {
        tokio::time::timeout(budget, self.backend.ping())
            .await
            .map_err(|_| StoreError::Timeout(budget))?
    }
}
