//! Upload dispatching: slots, streams, bundles, and the waiting queue

pub mod bundle;
pub mod dispatcher;
pub mod handle_cache;
pub mod queue;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use thiserror::Error;

use slipstream_core::{HintedUser, Segment, ShareError, TthValue, WireCode};

use handle_cache::SharedFileHandle;

pub use bundle::{parse_ubd, parse_ubn, BundleCommand, BundleProgress, UploadBundle};
pub use dispatcher::{PreparedUpload, UploadDispatcher};
pub use queue::{UploadQueue, UploadQueueItem, WaitingUser};

/// Identifier the hub layer assigns each user connection
pub type ConnectionId = u64;

/// Slot class held by a connection
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SlotType {
    #[default]
    None,
    Std,
    Mcn,
    Extra,
    Partial,
    Small,
}

/// What a peer asked for
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    File,
    FullList,
    PartialList,
    Tree,
}

impl TransferKind {
    /// Wire name used in GET/SND commands
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::File => "file",
            TransferKind::FullList => "file",
            TransferKind::PartialList => "list",
            TransferKind::Tree => "tthl",
        }
    }
}

/// Per-connection capability flags, set at registration
#[derive(Clone, Copy, Debug, Default)]
pub struct ConnFlags {
    /// Peer negotiated the MCN extension
    pub mcn1: bool,
    /// Peer is an operator on the hub
    pub op: bool,
    /// Peer understands mini-slots
    pub supports_minislots: bool,
}

/// An inbound transfer request, already split out of the wire command
#[derive(Clone, Debug)]
pub struct UploadRequest {
    pub kind: TransferKind,
    pub adc_path: String,
    pub start: i64,
    /// -1 means "to the end of the file"
    pub bytes: i64,
    pub user_sid: Option<String>,
    /// RE flag: recursive partial list
    pub recursive: bool,
    /// TL flag: emit a TTH list instead of XML
    pub tth_list: bool,
    /// ZL flag: peer asked for zlib compression
    pub zlib: bool,
}

/// Upload state flags
#[derive(Clone, Copy, Debug, Default)]
pub struct UploadFlags {
    pub resumed: bool,
    pub chunked: bool,
    pub partial: bool,
    pub zlib_filtered: bool,
    pub pending_kick: bool,
}

/// Bytes served to the peer: a shared file handle or an in-memory document
#[derive(Clone)]
pub enum UploadContent {
    SharedFile(Arc<SharedFileHandle>),
    Memory(Arc<Vec<u8>>),
}

/// One live upload, owned by the dispatcher and keyed by connection
pub struct Upload {
    pub conn: ConnectionId,
    pub user: HintedUser,
    /// Connection token, used to attach bundles
    pub token: String,
    /// Real path for files, virtual identifier for generated content
    pub path: PathBuf,
    pub tth: Option<TthValue>,
    pub kind: TransferKind,
    pub file_size: i64,
    pub segment: Segment,
    pub flags: UploadFlags,
    pub content: UploadContent,
    pub start_tick: Option<Instant>,
    /// Bytes of payload delivered
    pub pos: i64,
    /// Bytes on the wire (differs under compression)
    pub actual: i64,
    /// Rolling speed estimate in bytes/s
    pub speed: u64,
    last_measure: Option<(Instant, i64)>,
    /// Seconds spent in the delay list
    pub delay_ticks: u32,
    pub bundle: Option<String>,
}

impl Upload {
    /// Remaining payload in the requested segment
    pub fn remaining(&self) -> i64 {
        (self.segment.size() - self.pos).max(0)
    }

    pub fn is_finished(&self) -> bool {
        self.remaining() == 0
    }

    /// Update the rolling speed estimate
    pub fn tick(&mut self) {
        let now = Instant::now();
        match self.last_measure {
            Some((at, pos)) => {
                let dt = now.duration_since(at).as_millis() as u64;
                if dt >= 1000 {
                    let moved = (self.pos - pos).max(0) as u64;
                    self.speed = moved * 1000 / dt;
                    self.last_measure = Some((now, self.pos));
                }
            }
            None => self.last_measure = Some((now, self.pos)),
        }
    }

    /// Continue the same file on the same connection with a new segment
    pub fn resume(&mut self, start: i64, size: i64) {
        self.segment = Segment::new(start, size);
        self.pos = 0;
        self.actual = 0;
        self.delay_ticks = 0;
        self.flags.resumed = true;
        self.flags.chunked = self.segment.end() != self.file_size;
        self.last_measure = None;
    }
}

/// Progress snapshot published with `Tick`
#[derive(Clone, Debug)]
pub struct UploadSnapshot {
    pub conn: ConnectionId,
    pub user: HintedUser,
    pub path: PathBuf,
    pub pos: i64,
    pub size: i64,
    pub speed: u64,
}

/// Aggregate bundle snapshot published with `Tick`
#[derive(Clone, Debug)]
pub struct BundleSnapshot {
    pub token: String,
    pub name: String,
    pub size: i64,
    pub uploaded: i64,
    pub speed: u64,
    pub seconds_left: u64,
}

/// Dispatcher notifications
#[derive(Clone, Debug)]
pub enum UploadEvent {
    Starting {
        conn: ConnectionId,
        user: HintedUser,
        path: PathBuf,
        size: i64,
    },
    Tick {
        uploads: Vec<UploadSnapshot>,
        bundles: Vec<BundleSnapshot>,
    },
    Complete {
        conn: ConnectionId,
        path: PathBuf,
    },
    Failed {
        conn: ConnectionId,
        path: PathBuf,
        error: String,
    },
    QueueAdd {
        user: HintedUser,
        file: String,
    },
    QueueRemove {
        user: HintedUser,
    },
    SlotsUpdated {
        user: HintedUser,
    },
    BundleComplete {
        token: String,
        name: String,
    },
    /// The engine wants this connection closed (slot rebalancing, kicks)
    RequestDisconnect {
        conn: ConnectionId,
    },
}

/// Why a request was refused
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UploadError {
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),

    #[error("unknown user")]
    UnknownUser,

    #[error(transparent)]
    Share(ShareError),

    /// No slot class applied; the optional position is the place in the
    /// waiting queue
    #[error("all upload slots are full")]
    SlotsFull { queue_position: Option<usize> },

    #[error("unknown connection")]
    UnknownConnection,

    #[error("upload I/O failed: {0}")]
    Io(String),
}

impl UploadError {
    pub fn wire_code(&self) -> WireCode {
        match self {
            UploadError::InvalidRequest(_) => WireCode::ProtocolGeneric,
            UploadError::UnknownUser => WireCode::UnknownUser,
            UploadError::Share(e) => e.wire_code(),
            UploadError::SlotsFull { .. } => WireCode::SlotsFull,
            UploadError::UnknownConnection => WireCode::ProtocolGeneric,
            UploadError::Io(_) => WireCode::TransferGeneric,
        }
    }
}

impl From<ShareError> for UploadError {
    fn from(e: ShareError) -> Self {
        UploadError::Share(e)
    }
}
