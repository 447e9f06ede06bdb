//! Core data model shared by the share index, hasher, and upload dispatcher

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::text;
use crate::tth::{Cid, TthValue};

/// Visibility tag attached to share roots; hubs are configured for one
pub type ProfileToken = u32;

/// The platform default profile
pub const SP_DEFAULT: ProfileToken = 0;

/// Non-listable profile used for temp shares
pub const SP_HIDDEN: ProfileToken = 1;

/// A named visibility profile
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShareProfile {
    pub token: ProfileToken,
    pub name: String,
    pub default: bool,
}

impl ShareProfile {
    pub fn new(token: ProfileToken, name: impl Into<String>) -> Self {
        Self {
            token,
            name: name.into(),
            default: token == SP_DEFAULT,
        }
    }

    /// Hidden profiles are never advertised to hubs
    pub fn is_hidden(&self) -> bool {
        self.token == SP_HIDDEN
    }
}

/// Authoritative per-file hash record kept in the file-info store
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HashedFile {
    pub root: TthValue,
    pub mtime: u64,
    pub size: i64,
}

impl HashedFile {
    pub fn new(root: TthValue, mtime: u64, size: i64) -> Self {
        Self { root, mtime, size }
    }

    /// True when the on-disk file still matches this record
    pub fn matches(&self, mtime: u64, size: i64) -> bool {
        self.mtime == mtime && self.size == size
    }
}

/// A name stored together with its precomputed lowercase form.
///
/// Children lookups, index keys, and ordering all use the lowercase form;
/// the original spelling is kept only for display and list generation.
#[derive(Clone, Debug)]
pub struct DualName {
    name: Box<str>,
    lower: Box<str>,
}

impl DualName {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let lower = text::to_lower(&name);
        Self {
            name: name.into_boxed_str(),
            lower: lower.into_boxed_str(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn lower(&self) -> &str {
        &self.lower
    }
}

impl PartialEq for DualName {
    fn eq(&self, other: &Self) -> bool {
        self.lower == other.lower
    }
}

impl Eq for DualName {}

impl PartialOrd for DualName {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DualName {
    fn cmp(&self, other: &Self) -> Ordering {
        self.lower.cmp(&other.lower)
    }
}

impl fmt::Display for DualName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Half-open byte range of an upload
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct Segment {
    start: i64,
    size: i64,
}

impl Segment {
    pub fn new(start: i64, size: i64) -> Self {
        debug_assert!(start >= 0 && size >= 0);
        Self { start, size }
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn size(&self) -> i64 {
        self.size
    }

    pub fn end(&self) -> i64 {
        self.start + self.size
    }
}

/// A user together with the hub the request arrived through
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct HintedUser {
    pub cid: Cid,
    pub hub_url: String,
}

impl HintedUser {
    pub fn new(cid: Cid, hub_url: impl Into<String>) -> Self {
        Self {
            cid,
            hub_url: hub_url.into(),
        }
    }
}

impl fmt::Display for HintedUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.cid, self.hub_url)
    }
}

/// How a refresh task entered the queue
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefreshKind {
    Manual,
    Scheduled,
    Startup,
    StartupDelayed,
    Monitoring,
    Bundle,
}

/// Per-root refresh progress
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum RefreshState {
    #[default]
    Normal,
    Pending,
    Running,
}
