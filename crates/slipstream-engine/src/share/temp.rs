//! Temp shares
//!
//! One-shot sharing of files outside the index. A temp share is addressable
//! by TTH and optionally locked to a key: the peer's CID string or a hub
//! URL. Temp shares are process-lifetime only; nothing here persists.

use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::debug;

use slipstream_core::TthValue;

/// One temp-shared file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TempShareInfo {
    pub tth: TthValue,
    pub path: PathBuf,
    pub size: i64,
    /// CID (base32) or hub URL this share is restricted to; None = anyone
    pub key: Option<String>,
}

/// The live set of temp shares
pub struct TempShareSet {
    items: Mutex<Vec<TempShareInfo>>,
}

impl TempShareSet {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(Vec::new()),
        }
    }

    /// Register a temp share; duplicates (same TTH and key) collapse
    pub fn add(&self, info: TempShareInfo) -> bool {
        let mut items = self.items.lock();
        if items.iter().any(|i| i.tth == info.tth && i.key == info.key) {
            return false;
        }
        debug!("Temp share added: {:?} ({})", info.path, info.tth);
        items.push(info);
        true
    }

    /// Find a temp share for a TTH that one of the requester's keys unlocks
    pub fn find(&self, tth: &TthValue, keys: &[String]) -> Option<TempShareInfo> {
        let items = self.items.lock();
        items
            .iter()
            .find(|item| {
                item.tth == *tth
                    && match &item.key {
                        None => true,
                        Some(key) => keys.iter().any(|k| k == key),
                    }
            })
            .cloned()
    }

    /// Remove every share of a TTH; returns how many went
    pub fn remove(&self, tth: &TthValue) -> usize {
        let mut items = self.items.lock();
        let before = items.len();
        items.retain(|item| item.tth != *tth);
        before - items.len()
    }

    pub fn list(&self) -> Vec<TempShareInfo> {
        self.items.lock().clone()
    }

    pub fn clear(&self) {
        self.items.lock().clear();
    }
}

impl Default for TempShareSet {
    fn default() -> Self {
        Self::new()
    }
}
