//! External collaborator interfaces
//!
//! The hub protocol layer and the download queue stay outside the core;
//! these traits are the whole surface the engine sees of them. Trait
//! objects are handed in at construction, so tests run against in-memory
//! fakes and the real client wires its managers in.

use std::collections::HashSet;
use std::path::PathBuf;

use slipstream_core::{Cid, HintedUser, ProfileToken, TthValue};

/// What the engine needs to know about hubs and users
pub trait HubContext: Send + Sync {
    /// Share profile for a request arriving through `hub_url`, optionally
    /// narrowed by the user's session id on that hub
    fn resolve_profile(&self, hub_url: &str, user_sid: Option<&str>) -> Option<ProfileToken>;

    /// Every profile the user can currently see the local share through
    fn user_profiles(&self, user: &Cid) -> HashSet<ProfileToken>;

    fn is_favorite(&self, user: &Cid) -> bool;

    fn is_online(&self, user: &Cid) -> bool;

    /// Connected hub count; scales the hub-slots minimum
    fn total_hub_count(&self) -> usize;

    /// Ask the hub layer to open a transfer connection to a waiting user
    fn connect_user(&self, user: &HintedUser, token: &str);
}

/// Download-side callbacks used for partial sharing
pub trait QueueCallbacks: Send + Sync {
    /// If the given range of an in-progress download is already on disk,
    /// return the target path and the full file size
    fn is_chunk_downloaded(&self, tth: &TthValue, start: i64, bytes: i64)
        -> Option<(PathBuf, i64)>;

    /// Local target paths of an in-progress download
    fn targets(&self, tth: &TthValue) -> Vec<PathBuf>;

    /// TTH list for a queued bundle (partial-list requests outside the share)
    fn generate_tth_list(&self, bundle_path: &str) -> Option<Vec<u8>>;
}

/// A hub context for setups without hubs (tests, tooling): one profile,
/// nobody online, no favorites
pub struct StandaloneHub {
    pub profile: ProfileToken,
}

impl HubContext for StandaloneHub {
    fn resolve_profile(&self, _hub_url: &str, _user_sid: Option<&str>) -> Option<ProfileToken> {
        Some(self.profile)
    }

    fn user_profiles(&self, _user: &Cid) -> HashSet<ProfileToken> {
        HashSet::from([self.profile])
    }

    fn is_favorite(&self, _user: &Cid) -> bool {
        false
    }

    fn is_online(&self, _user: &Cid) -> bool {
        false
    }

    fn total_hub_count(&self) -> usize {
        0
    }

    fn connect_user(&self, _user: &HintedUser, _token: &str) {}
}

/// Queue callbacks for a client without a download queue: nothing is ever
/// partially available
pub struct NoQueue;

impl QueueCallbacks for NoQueue {
    fn is_chunk_downloaded(
        &self,
        _tth: &TthValue,
        _start: i64,
        _bytes: i64,
    ) -> Option<(PathBuf, i64)> {
        None
    }

    fn targets(&self, _tth: &TthValue) -> Vec<PathBuf> {
        Vec::new()
    }

    fn generate_tth_list(&self, _bundle_path: &str) -> Option<Vec<u8>> {
        None
    }
}
