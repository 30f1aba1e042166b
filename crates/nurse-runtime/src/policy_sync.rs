//! [`PolicySync`] – applies policy and regime updates pushed by the
//! reasoning layer.
//!
//! Each update on the update subject is a JSON [`PolicyUpdate`]. It is written
//! to the cache (monotonic, whole-document swap) and its version announced to
//! the [`PolicyStoreClient`] so that a later read of an older version fails
//! closed. If the sender asked for a reply it gets a [`PolicyAck`].

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use nurse_middleware::{BusError, Headers, Message, SubjectBus};
use nurse_store::{InMemoryPolicyCache, PolicyStoreClient, StoreError, VersionKey};
use nurse_types::{NurseError, PolicyUpdate};

pub const DEFAULT_UPDATE_SUBJECT: &str = "cio.policy.updated";

/// Reply to an update request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyAck {
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PolicyAck {
    fn refused(e: impl std::fmt::Display) -> Self {
        Self {
            applied: false,
            version: None,
            error: Some(e.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct PolicySync {
    subject: String,
    bus: SubjectBus,
    cache: Arc<InMemoryPolicyCache>,
    client: Arc<PolicyStoreClient>,
}

impl PolicySync {
    pub fn new(
        subject: impl Into<String>,
        bus: SubjectBus,
        cache: Arc<InMemoryPolicyCache>,
        client: Arc<PolicyStoreClient>,
    ) -> Self {
        Self {
            subject: subject.into(),
            bus,
            cache,
            client,
        }
    }

    /// Apply one update and announce its version.
    ///
    /// # Errors
    ///
    /// Whatever the cache refuses: [`StoreError::StaleVersion`] or
    /// [`StoreError::Invalid`].
    pub fn apply(&self, update: PolicyUpdate) -> Result<(VersionKey, u64), StoreError> {
        let (key, version) = self.cache.apply(update)?;
        self.client.acknowledge_update(key.clone(), version);
        info!(?key, version, "policy update applied");
        Ok((key, version))
    }

    fn handle(&self, message: &Message) {
        let ack = match serde_json::from_slice::<PolicyUpdate>(&message.payload) {
            Err(e) => {
                error!(error = %e, "unreadable policy update");
                PolicyAck::refused(e)
            }
            Ok(update) => match self.apply(update) {
                Ok((_, version)) => PolicyAck {
                    applied: true,
                    version: Some(version),
                    error: None,
                },
                Err(e @ StoreError::StaleVersion { .. }) => {
                    warn!(error = %e, "policy update ignored");
                    PolicyAck::refused(e)
                }
                Err(e) => {
                    error!(error = %e, "policy update rejected");
                    PolicyAck::refused(e)
                }
            },
        };
        if message.reply_to.is_none() {
            return;
        }
        match serde_json::to_vec(&ack) {
            Ok(body) => {
                if let Err(e) = self.bus.respond(message, Headers::new(), body) {
                    warn!(error = %e, "policy ack not delivered");
                }
            }
            Err(e) => error!(error = %e, "policy ack serialisation failed"),
        }
    }

    /// Subscribe and apply updates in arrival order.
    pub fn start(&self) -> Result<JoinHandle<()>, BusError> {
        let mut subscription = self.bus.subscribe(&self.subject)?;
        let sync = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(message) = subscription.recv().await {
                sync.handle(&message);
            }
        }))
    }
}

/// Load a seed file: a JSON array of [`PolicyUpdate`]s.
///
/// Stale entries are skipped with a warning; anything else aborts the load.
///
/// # Errors
///
/// [`NurseError::Serialization`] for unreadable JSON, [`NurseError::Store`]
/// for a document the cache refuses as invalid.
pub fn seed_from_json(sync: &PolicySync, json: &str) -> Result<usize, NurseError> {
    let updates: Vec<PolicyUpdate> = serde_json::from_str(json)?;
    let mut applied = 0;
    for update in updates {
        match sync.apply(update) {
            Ok(_) => applied += 1,
            Err(e @ StoreError::StaleVersion { .. }) => warn!(error = %e, "seed entry skipped"),
            Err(e) => return Err(e.into()),
        }
    }
    Ok(applied)
}
