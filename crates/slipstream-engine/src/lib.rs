//! Slipstream Engine - share index, hasher pool, search, and uploads
//!
//! This crate owns every thread and lock of the core:
//!
//! ```text
//! filesystem events ──► monitor ──► refresh scheduler ──► share worker
//!                                                            │
//!                       hasher pool ◄── unknown files ◄──────┤
//!                            │                               │
//!                            └── FileHashed ──► hash store ──┴─► share index
//!                                                                 │   │
//!                                              search matcher ◄───┘   └──► upload dispatcher
//! ```
//!
//! # Locking
//!
//! One shared/exclusive lock per subsystem, never nested in reverse order:
//! upload dispatcher → share index → hasher pool. Timer callbacks take only
//! the lock they need. Refresh workers build shadow subtrees off-lock and
//! swap them in under a short exclusive section.

pub mod db;
pub mod file_reader;
pub mod hash_pool;
pub mod hasher;
pub mod hub;
pub mod monitor;
pub mod search;
pub mod sfv;
pub mod share;
pub mod store;
pub mod timer;
pub mod upload;

pub use db::{DbError, DbHandler, RedbHandler};
pub use hash_pool::{HashEvent, HasherPool, HasherPoolStats};
pub use hub::{HubContext, QueueCallbacks};
pub use monitor::{MonitorError, MonitorEvent, ShareMonitor};
pub use search::{SearchMatcher, SearchQuery, SearchResult};
pub use share::refresh::{RefreshError, ShareRefresher};
pub use share::{RootSettings, ShareIndex, ShareRootInfo};
pub use store::HashStore;
pub use timer::Ticker;
pub use upload::{
    ConnFlags, ConnectionId, PreparedUpload, SlotType, TransferKind, UploadDispatcher,
    UploadError, UploadEvent, UploadRequest,
};

/// Seconds a finished upload lingers for same-connection resume
pub const UPLOAD_GRACE_SECS: u64 = 10;

/// Concurrent small-file slot cap
pub const MAX_SMALL_SLOTS: u32 = 8;

/// Seconds between auto-granted slots
pub const AUTO_GRANT_INTERVAL_SECS: u64 = 30;

/// Seconds a notified queued user stays reserved before expiring
pub const NOTIFY_EXPIRY_SECS: u64 = 90;
