//! Ownership oracle seam and the classifier the ledger consults

use crate::status::{OutpointStatus, StatusFlag};
use crate::types::ByteString;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;

/// How the wallet relates to one script
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Classification {
    /// Ownership bits (`OURS` plus a kind), empty when not ours
    pub status: OutpointStatus,
    /// Derivation path of the owning key
    pub path: Option<String>,
}

impl Classification {
    pub fn not_ours() -> Self {
        Self::default()
    }

    pub fn basic(path: impl Into<String>) -> Self {
        Self {
            status: StatusFlag::Ours | StatusFlag::Basic,
            path: Some(path.into()),
        }
    }

    pub fn cold_stake(path: impl Into<String>) -> Self {
        Self {
            status: StatusFlag::Ours | StatusFlag::ColdStake,
            path: Some(path.into()),
        }
    }

    pub fn is_ours(&self) -> bool {
        self.status.contains(StatusFlag::Ours)
    }
}

/// Decides whether a script belongs to the wallet.
///
/// Must be deterministic for a fixed key set.
pub trait OwnershipOracle: Send + Sync {
    fn classify(&self, script: &[u8]) -> Classification;
}

/// Oracle backed by an explicit set of owned scripts
#[derive(Debug, Default)]
pub struct ScriptSetOracle {
    scripts: RwLock<HashMap<ByteString, Classification>>,
}

impl ScriptSetOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, script: impl Into<ByteString>, classification: Classification) {
        self.scripts.write().insert(script.into(), classification);
    }

    pub fn remove(&self, script: &[u8]) {
        self.scripts.write().remove(script);
    }
}

impl OwnershipOracle for ScriptSetOracle {
    fn classify(&self, script: &[u8]) -> Classification {
        self.scripts
            .read()
            .get(script)
            .cloned()
            .unwrap_or_default()
    }
}

/// Front of the oracle used by the ledger.
///
/// Without a cache every call reaches the oracle. With one, answers are kept
/// per sha256 of the script until [`Classifier::invalidate`].
pub struct Classifier {
    oracle: Arc<dyn OwnershipOracle>,
    cache: Option<Mutex<HashMap<[u8; 32], Classification>>>,
}

impl Classifier {
    pub fn new(oracle: Arc<dyn OwnershipOracle>, cached: bool) -> Self {
        Self {
            oracle,
            cache: cached.then(|| Mutex::new(HashMap::new())),
        }
    }

    pub fn classify(&self, script: &[u8]) -> Classification {
        let Some(cache) = &self.cache else {
            return self.oracle.classify(script);
        };

        let key: [u8; 32] = Sha256::digest(script).into();
        if let Some(hit) = cache.lock().get(&key) {
            return hit.clone();
        }
        let classification = self.oracle.classify(script);
        cache.lock().insert(key, classification.clone());
        classification
    }

    /// Forget cached answers, e.g. after the wallet's keys changed
    pub fn invalidate(&self) {
        if let Some(cache) = &self.cache {
            cache.lock().clear();
        }
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.as_ref().map(|c| c.lock().len()).unwrap_or(0)
    }
}
