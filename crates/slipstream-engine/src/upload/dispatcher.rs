//! The upload dispatcher
//!
//! Resolves inbound requests to byte streams and enforces the slot policy.
//! All accounting lives behind one mutex: slot counters, active and
//! delayed uploads, bundles, reserved and notified users, and the waiting
//! queue. Share and store lookups happen before the mutex is taken; the
//! lock order is dispatcher → share index, never the reverse.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use regex::Regex;
use tracing::{debug, info, warn};

use slipstream_core::{
    Cid, HintedUser, ProfileToken, Segment, ShareError, TthValue, UploadConfig, SMALL_FILE_SIZE,
};

use crate::hub::{HubContext, QueueCallbacks};
use crate::share::ShareIndex;
use crate::store::HashStore;
use crate::{AUTO_GRANT_INTERVAL_SECS, MAX_SMALL_SLOTS, NOTIFY_EXPIRY_SECS, UPLOAD_GRACE_SECS};

use super::bundle::{parse_ubd, parse_ubn, BundleCommand, UploadBundle};
use super::handle_cache::HandleCache;
use super::queue::UploadQueue;
use super::{
    BundleSnapshot, ConnFlags, ConnectionId, SlotType, TransferKind, Upload, UploadContent,
    UploadError, UploadEvent, UploadFlags, UploadRequest, UploadSnapshot,
};

/// Full file list names a peer may request
const USER_LIST_NAMES: &[&str] = &["files.xml.bz2", "/files.xml.bz2"];

/// Response to a granted request, used to build the SND reply
#[derive(Clone, Debug)]
pub struct PreparedUpload {
    pub kind: TransferKind,
    pub start: i64,
    pub size: i64,
    pub file_size: i64,
    pub zlib: bool,
}

/// Per-connection dispatcher state
struct ConnState {
    user: HintedUser,
    token: String,
    flags: ConnFlags,
    slot: SlotType,
    last_bundle: Option<String>,
}

#[derive(Default)]
struct Accounting {
    running: i32,
    extra: i32,
    extra_partial: i32,
    small_slots: i32,
    mcn_slots: i32,
    mcn_uploads: HashMap<Cid, u32>,
}

struct DispatchState {
    connections: HashMap<ConnectionId, ConnState>,
    uploads: HashMap<ConnectionId, Upload>,
    delay_uploads: Vec<Upload>,
    bundles: HashMap<String, UploadBundle>,
    counts: Accounting,
    reserved: HashMap<Cid, Option<Instant>>,
    notified: HashMap<Cid, Instant>,
    queue: UploadQueue,
    last_grant: Option<Instant>,
}

struct DispatcherInner {
    config: UploadConfig,
    minislot_bytes: i64,
    free_slot_matcher: Option<Regex>,
    share: Arc<ShareIndex>,
    store: Arc<HashStore>,
    hub: Arc<dyn HubContext>,
    queue_cb: Arc<dyn QueueCallbacks>,
    handles: HandleCache,
    state: Mutex<DispatchState>,
    subscribers: Mutex<Vec<Sender<UploadEvent>>>,
}

/// The upload dispatcher; cheap to clone into the hub layer
#[derive(Clone)]
pub struct UploadDispatcher {
    inner: Arc<DispatcherInner>,
}

impl UploadDispatcher {
    pub fn new(
        config: UploadConfig,
        share: Arc<ShareIndex>,
        store: Arc<HashStore>,
        hub: Arc<dyn HubContext>,
        queue_cb: Arc<dyn QueueCallbacks>,
    ) -> Self {
        let minislot_bytes = (config.minislot_size_kb * 1024) as i64;
        let free_slot_matcher = build_name_matcher(&config.free_slot_extensions);

        Self {
            inner: Arc::new(DispatcherInner {
                config,
                minislot_bytes,
                free_slot_matcher,
                share,
                store,
                hub,
                queue_cb,
                handles: HandleCache::new(),
                state: Mutex::new(DispatchState {
                    connections: HashMap::new(),
                    uploads: HashMap::new(),
                    delay_uploads: Vec::new(),
                    bundles: HashMap::new(),
                    counts: Accounting::default(),
                    reserved: HashMap::new(),
                    notified: HashMap::new(),
                    queue: UploadQueue::new(),
                    last_grant: None,
                }),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn subscribe(&self) -> Receiver<UploadEvent> {
        let (tx, rx) = unbounded();
        self.inner.subscribers.lock().push(tx);
        rx
    }

    fn emit(&self, event: UploadEvent) {
        let mut subs = self.inner.subscribers.lock();
        subs.retain(|tx| tx.send(event.clone()).is_ok());
    }

    // === connection lifecycle ===

    pub fn add_connection(
        &self,
        conn: ConnectionId,
        user: HintedUser,
        token: impl Into<String>,
        flags: ConnFlags,
    ) {
        let mut st = self.inner.state.lock();
        st.connections.insert(
            conn,
            ConnState {
                user,
                token: token.into(),
                flags,
                slot: SlotType::None,
                last_bundle: None,
            },
        );
    }

    /// Drop a connection and release whatever slot it held
    pub fn remove_connection(&self, conn: ConnectionId) {
        let mut st = self.inner.state.lock();
        if let Some(state) = st.connections.remove(&conn) {
            let user = state.user.cid;
            release_slot(&mut st.counts, state.slot, &user);
        }
    }

    // === request resolution ===

    /// Resolve a request to a stream and grant a slot.
    ///
    /// On `SlotsFull` the user is recorded in the waiting queue (unless it
    /// is an MCN request from a user we already upload to) and the caller
    /// should report `MAXED_OUT` with the returned queue position.
    pub fn prepare_file(
        &self,
        conn: ConnectionId,
        req: &UploadRequest,
    ) -> Result<PreparedUpload, UploadError> {
        if req.adc_path.is_empty() || req.start < 0 || req.bytes < -1 || req.bytes == 0 {
            return Err(UploadError::InvalidRequest("bad path or range"));
        }

        let (user, flags, conn_token) = {
            let st = self.inner.state.lock();
            let state = st
                .connections
                .get(&conn)
                .ok_or(UploadError::UnknownConnection)?;
            (state.user.clone(), state.flags, state.token.clone())
        };

        let profile = self
            .inner
            .hub
            .resolve_profile(&user.hub_url, req.user_sid.as_deref())
            .ok_or(UploadError::UnknownUser)?;

        let source = self.resolve_source(req, &user, profile)?;

        let prepared = self.grant_and_attach(conn, req, &user, flags, &conn_token, source)?;

        self.emit(UploadEvent::Starting {
            conn,
            user,
            path: prepared_path(&self.inner, conn),
            size: prepared.size,
        });
        Ok(prepared)
    }

    fn resolve_source(
        &self,
        req: &UploadRequest,
        user: &HintedUser,
        profile: ProfileToken,
    ) -> Result<ResolvedSource, UploadError> {
        let share = &self.inner.share;
        let temp_keys = [user.cid.to_base32(), user.hub_url.clone()];

        match req.kind {
            TransferKind::FullList => Ok(ResolvedSource::full_list(
                share.full_list(profile, false),
            )),
            TransferKind::File if USER_LIST_NAMES.contains(&req.adc_path.as_str()) => Ok(
                ResolvedSource::full_list(share.full_list(profile, false)),
            ),
            TransferKind::File => {
                let mut profiles = self.inner.hub.user_profiles(&user.cid);
                if profiles.is_empty() {
                    // the user managed to go offline already?
                    profiles.insert(profile);
                }

                match share.to_real_with_size(&req.adc_path, &profiles, &temp_keys) {
                    Ok(resolved) => {
                        let name = resolved
                            .real_path
                            .file_name()
                            .map(|n| n.to_string_lossy().into_owned())
                            .unwrap_or_default();
                        let mini = self.name_earns_minislot(&name)
                            || resolved.size <= self.inner.minislot_bytes;
                        Ok(ResolvedSource {
                            kind: TransferKind::File,
                            content: SourceContent::File(resolved.real_path),
                            file_size: resolved.size,
                            tth: Some(resolved.tth),
                            mini,
                            partial: false,
                        })
                    }
                    Err(share_err) => self.try_partial_file(req, share_err),
                }
            }
            TransferKind::Tree => {
                let mut profiles = self.inner.hub.user_profiles(&user.cid);
                profiles.insert(profile);
                let tth = match share.to_real_with_size(&req.adc_path, &profiles, &temp_keys) {
                    Ok(resolved) => Ok(resolved.tth),
                    Err(err) => {
                        // partial sharing serves trees for queued downloads
                        match parse_tth_path(&req.adc_path) {
                            Some(tth) if !self.inner.queue_cb.targets(&tth).is_empty() => Ok(tth),
                            _ => Err(UploadError::Share(err)),
                        }
                    }
                }?;

                let tree = self
                    .inner
                    .store
                    .get_tree(&tth)
                    .map_err(|e| UploadError::Io(e.to_string()))?
                    .ok_or(UploadError::Share(ShareError::NotFound))?;

                let mut bytes = Vec::with_capacity(tree.leaves().len() * 24);
                for leaf in tree.leaves() {
                    bytes.extend_from_slice(leaf.as_bytes());
                }
                let size = bytes.len() as i64;
                Ok(ResolvedSource {
                    kind: TransferKind::Tree,
                    content: SourceContent::Memory(Arc::new(bytes)),
                    file_size: size,
                    tth: Some(tth),
                    mini: true,
                    partial: false,
                })
            }
            TransferKind::PartialList => {
                let bytes = if req.tth_list {
                    if !req.adc_path.starts_with('/') {
                        self.inner
                            .queue_cb
                            .generate_tth_list(&req.adc_path)
                            .ok_or(UploadError::Share(ShareError::NotFound))?
                    } else {
                        share.generate_tth_list(&req.adc_path, profile)?
                    }
                } else {
                    share.generate_partial_list(&req.adc_path, req.recursive, profile)?
                };
                let size = bytes.len() as i64;
                Ok(ResolvedSource {
                    kind: TransferKind::PartialList,
                    content: SourceContent::Memory(Arc::new(bytes)),
                    file_size: size,
                    tth: None,
                    mini: true,
                    partial: false,
                })
            }
        }
    }

    /// Share lookup failed; maybe the peer wants a chunk we are currently
    /// downloading ourselves
    fn try_partial_file(
        &self,
        req: &UploadRequest,
        share_err: ShareError,
    ) -> Result<ResolvedSource, UploadError> {
        let Some(tth) = parse_tth_path(&req.adc_path) else {
            return Err(UploadError::Share(share_err));
        };
        let Some((path, file_size)) =
            self.inner
                .queue_cb
                .is_chunk_downloaded(&tth, req.start, req.bytes)
        else {
            return Err(UploadError::Share(share_err));
        };

        Ok(ResolvedSource {
            kind: TransferKind::File,
            content: SourceContent::File(path),
            file_size,
            tth: Some(tth),
            mini: false,
            partial: true,
        })
    }

    fn name_earns_minislot(&self, name: &str) -> bool {
        self.inner
            .free_slot_matcher
            .as_ref()
            .is_some_and(|re| re.is_match(name))
    }

    /// Pick a slot class, create the upload, and settle accounting
    fn grant_and_attach(
        &self,
        conn: ConnectionId,
        req: &UploadRequest,
        user: &HintedUser,
        flags: ConnFlags,
        conn_token: &str,
        source: ResolvedSource,
    ) -> Result<PreparedUpload, UploadError> {
        let is_favorite = self.inner.hub.is_favorite(&user.cid);
        let mut queue_event = None;
        let mut slots_event = false;

        let result = {
            let mut st = self.inner.state.lock();
            let current_slot = st
                .connections
                .get(&conn)
                .ok_or(UploadError::UnknownConnection)?
                .slot;

            let slot = if matches!(current_slot, SlotType::Std | SlotType::Mcn) {
                current_slot
            } else {
                match self.pick_slot(&st, user, flags, is_favorite, &source, current_slot) {
                    Ok(slot) => {
                        st.last_grant = Some(Instant::now());
                        slot
                    }
                    Err(refusal) => {
                        let position = match refusal {
                            SlotRefusal::Queue => {
                                let pos = st.queue.add(
                                    user.clone(),
                                    conn_token.to_string(),
                                    req.adc_path.clone(),
                                    req.start,
                                    source.file_size,
                                );
                                queue_event = Some(UploadEvent::QueueAdd {
                                    user: user.clone(),
                                    file: req.adc_path.clone(),
                                });
                                Some(pos)
                            }
                            // MCN requests from a user we already serve are
                            // refused without queueing
                            SlotRefusal::NoQueue => None,
                        };
                        drop(st);
                        if let Some(event) = queue_event.take() {
                            self.emit(event);
                        }
                        return Err(UploadError::SlotsFull {
                            queue_position: position,
                        });
                    }
                }
            };

            // resuming the same file on the same connection?
            if let Some(resumed) = self.try_resume(&mut st, conn, req, &source)? {
                self.apply_slot(&mut st, conn, slot);
                return Ok(resumed);
            }

            let (start, size) = segment_of(req, source.file_size)?;

            let content = match &source.content {
                SourceContent::File(path) => {
                    let handle = self
                        .inner
                        .handles
                        .open_shared(path)
                        .map_err(|e| UploadError::Io(e.to_string()))?;
                    UploadContent::SharedFile(handle)
                }
                SourceContent::Memory(bytes) => UploadContent::Memory(Arc::clone(bytes)),
            };

            // the request is going through: forget the user's queue entry
            if st.queue.remove_user(&user.cid) {
                queue_event = Some(UploadEvent::QueueRemove { user: user.clone() });
            }
            st.notified.remove(&user.cid);

            let path = match &source.content {
                SourceContent::File(path) => path.clone(),
                SourceContent::Memory(_) => PathBuf::from(&req.adc_path),
            };

            let mut upload = Upload {
                conn,
                user: user.clone(),
                token: conn_token.to_string(),
                path,
                tth: source.tth,
                kind: source.kind,
                file_size: source.file_size,
                segment: Segment::new(start, size),
                flags: UploadFlags {
                    chunked: start + size != source.file_size,
                    partial: source.partial,
                    zlib_filtered: req.zlib,
                    ..UploadFlags::default()
                },
                content,
                start_tick: None,
                pos: 0,
                actual: 0,
                speed: 0,
                last_measure: None,
                delay_ticks: 0,
                bundle: None,
            };

            let bundle_token = st
                .connections
                .get(&conn)
                .and_then(|c| c.last_bundle.clone());
            if let Some(token) = bundle_token {
                if let Some(bundle) = st.bundles.get_mut(&token) {
                    bundle.add_upload(conn);
                    upload.bundle = Some(token);
                }
            }

            st.uploads.insert(conn, upload);
            self.apply_slot(&mut st, conn, slot);
            slots_event = true;

            Ok(PreparedUpload {
                kind: source.kind,
                start,
                size,
                file_size: source.file_size,
                zlib: req.zlib,
            })
        };

        if let Some(event) = queue_event {
            self.emit(event);
        }
        if slots_event {
            self.check_multi_conn();
        }
        result
    }

    /// Slot policy for a connection not already holding std/mcn
    fn pick_slot(
        &self,
        st: &DispatchState,
        user: &HintedUser,
        flags: ConnFlags,
        is_favorite: bool,
        source: &ResolvedSource,
        current_slot: SlotType,
    ) -> Result<SlotType, SlotRefusal> {
        let has_reserved = st.reserved.contains_key(&user.cid);
        let queue_clear = st.queue.is_empty() && st.notified.is_empty();
        let has_free = self.free_slots(st) > 0
            && (queue_clear || st.notified.contains_key(&user.cid));

        // file lists and tiny files bypass the standard slot classes
        let small_eligible = matches!(
            source.kind,
            TransferKind::PartialList | TransferKind::FullList
        ) || source.file_size <= SMALL_FILE_SIZE;
        if small_eligible && st.counts.small_slots < MAX_SMALL_SLOTS as i32 {
            return Ok(SlotType::Small);
        }

        if flags.mcn1 {
            let grant = self.allow_mcn(st, &user.cid)
                || ((has_reserved || is_favorite || self.auto_slot(st))
                    && !is_uploading(st, &user.cid));
            if grant {
                return Ok(SlotType::Mcn);
            }
        } else if has_reserved || is_favorite || has_free || self.auto_slot(st) {
            return Ok(SlotType::Std);
        }

        // no standard slot: extra and partial classes remain
        let allowed_free = current_slot == SlotType::Extra
            || flags.op
            || self.free_extra_slots(st) > 0;
        if source.mini && flags.supports_minislots && allowed_free {
            return Ok(SlotType::Extra);
        }

        let partial_free = source.partial
            && (current_slot == SlotType::Partial
                || st.counts.extra_partial < self.inner.config.extra_partial_slots as i32);
        if partial_free {
            return Ok(SlotType::Partial);
        }

        if flags.mcn1 && is_uploading(st, &user.cid) {
            Err(SlotRefusal::NoQueue)
        } else {
            Err(SlotRefusal::Queue)
        }
    }

    /// MCN grant rule: reuse capacity while the per-user cap and the global
    /// balance allow another connection
    fn allow_mcn(&self, st: &DispatchState, user: &Cid) -> bool {
        let queue_clear = st.queue.is_empty() && st.notified.is_empty();
        let user_notified = st.notified.contains_key(user);

        let balance = self.slots_total() as i32 - st.counts.running - st.counts.mcn_slots
            + st.counts.mcn_uploads.len() as i32;
        let has_free_slot = balance > 0 && (queue_clear || user_notified);

        if !st.counts.mcn_uploads.is_empty() {
            let highest_other = st
                .counts
                .mcn_uploads
                .iter()
                .filter(|(u, _)| *u != user)
                .map(|(_, count)| *count)
                .max()
                .unwrap_or(0);

            if let Some(&own) = st.counts.mcn_uploads.get(user) {
                let per_user = self.inner.config.slots_per_user;
                let under_cap = per_user == 0 || own + 1 <= per_user;
                return (highest_other > own + 1 || has_free_slot) && under_cap;
            }
        }

        // first MCN upload to this user
        self.free_slots(st) > 0 && (queue_clear || user_notified)
    }

    /// Disconnect the heaviest MCN user's extra connection when the balance
    /// goes negative
    fn check_multi_conn(&self) {
        let doomed = {
            let st = self.inner.state.lock();
            let balance = self.slots_total() as i32 - st.counts.running - st.counts.mcn_slots
                + st.counts.mcn_uploads.len() as i32;
            if balance >= 0 || self.auto_slot(&st) || st.counts.mcn_uploads.is_empty() {
                None
            } else {
                st.counts
                    .mcn_uploads
                    .iter()
                    .max_by_key(|(_, count)| **count)
                    .filter(|(_, count)| **count > 1)
                    .and_then(|(user, _)| {
                        st.uploads
                            .values()
                            .filter(|u| u.user.cid == *user)
                            .filter(|u| {
                                st.connections
                                    .get(&u.conn)
                                    .is_some_and(|c| c.slot == SlotType::Mcn)
                            })
                            .map(|u| u.conn)
                            .last()
                    })
            }
        };

        if let Some(conn) = doomed {
            debug!("MCN rebalancing disconnects connection {conn}");
            self.emit(UploadEvent::RequestDisconnect { conn });
        }
    }

    fn try_resume(
        &self,
        st: &mut DispatchState,
        conn: ConnectionId,
        req: &UploadRequest,
        source: &ResolvedSource,
    ) -> Result<Option<PreparedUpload>, UploadError> {
        let Some(index) = st.delay_uploads.iter().position(|u| u.conn == conn) else {
            return Ok(None);
        };
        let mut upload = st.delay_uploads.remove(index);

        let same_file = matches!(&source.content, SourceContent::File(path) if *path == upload.path);
        if same_file
            && upload.kind == TransferKind::File
            && req.kind == TransferKind::File
            && upload.segment.end() != source.file_size
        {
            let (start, size) = segment_of(req, source.file_size)?;
            upload.resume(start, size);
            debug!("Resuming {:?} on connection {conn}", upload.path);
            let prepared = PreparedUpload {
                kind: TransferKind::File,
                start,
                size,
                file_size: source.file_size,
                zlib: req.zlib,
            };
            st.uploads.insert(conn, upload);
            Ok(Some(prepared))
        } else {
            // different file: the delayed upload is finished for good
            finish_delay_upload(&upload);
            Ok(None)
        }
    }

    fn apply_slot(&self, st: &mut DispatchState, conn: ConnectionId, slot: SlotType) {
        let Some(state) = st.connections.get_mut(&conn) else {
            return;
        };
        if state.slot == slot {
            return;
        }
        let user = state.user.cid;
        let old = state.slot;
        state.slot = slot;

        release_slot(&mut st.counts, old, &user);
        match slot {
            SlotType::Std => st.counts.running += 1,
            SlotType::Extra => st.counts.extra += 1,
            SlotType::Partial => st.counts.extra_partial += 1,
            SlotType::Small => st.counts.small_slots += 1,
            SlotType::Mcn => change_mcn_slot(&mut st.counts, &user, false),
            SlotType::None => {}
        }
    }

    // === transfer pumping ===

    /// Read the next chunk of an upload's payload into `buf`; 0 means the
    /// segment is complete
    pub fn read_chunk(&self, conn: ConnectionId, buf: &mut [u8]) -> Result<usize, UploadError> {
        let mut st = self.inner.state.lock();
        let upload = st
            .uploads
            .get_mut(&conn)
            .ok_or(UploadError::UnknownConnection)?;

        if upload.start_tick.is_none() {
            upload.start_tick = Some(Instant::now());
        }

        let remaining = upload.remaining();
        if remaining == 0 {
            return Ok(0);
        }
        let want = buf.len().min(remaining as usize);
        let offset = (upload.segment.start() + upload.pos) as u64;

        let read = match &upload.content {
            UploadContent::SharedFile(handle) => handle
                .read_at(&mut buf[..want], offset)
                .map_err(|e| UploadError::Io(e.to_string()))?,
            UploadContent::Memory(bytes) => {
                let from = offset as usize;
                let to = (from + want).min(bytes.len());
                let n = to.saturating_sub(from);
                buf[..n].copy_from_slice(&bytes[from..to]);
                n
            }
        };

        upload.pos += read as i64;
        upload.actual += read as i64;
        upload.tick();
        Ok(read)
    }

    /// The hub layer reports wire-level bytes (compression changes the
    /// actual count)
    pub fn bytes_sent(&self, conn: ConnectionId, payload: usize, actual: usize) {
        let mut st = self.inner.state.lock();
        if let Some(upload) = st.uploads.get_mut(&conn) {
            upload.actual += actual as i64 - payload as i64;
            upload.tick();
        }
    }

    /// Transfer finished cleanly; chunked segments and bundle members linger
    /// in the delay list for quick resume
    pub fn transfer_done(&self, conn: ConnectionId) {
        let completion = {
            let mut st = self.inner.state.lock();
            let Some(upload) = st.uploads.remove(&conn) else {
                return;
            };

            let partial_segment =
                upload.flags.chunked && upload.segment.end() != upload.file_size;
            let keep = partial_segment || upload.bundle.is_some();

            let completion = if partial_segment {
                None
            } else {
                Some(UploadEvent::Complete {
                    conn,
                    path: upload.path.clone(),
                })
            };

            if keep {
                st.delay_uploads.push(upload);
            }
            completion
        };

        if let Some(event) = completion {
            self.emit(event);
        }
    }

    /// Connection died; the upload is destroyed and the slot released
    pub fn connection_failed(&self, conn: ConnectionId, error: &str) {
        let failed = {
            let mut st = self.inner.state.lock();
            let upload = st.uploads.remove(&conn);
            if let Some(upload) = &upload {
                detach_from_bundle(&mut st, upload);
            }
            st.delay_uploads.retain(|u| u.conn != conn);
            if let Some(state) = st.connections.get_mut(&conn) {
                let user = state.user.cid;
                let slot = state.slot;
                state.slot = SlotType::None;
                release_slot(&mut st.counts, slot, &user);
            }
            upload.map(|u| u.path)
        };

        if let Some(path) = failed {
            self.emit(UploadEvent::Failed {
                conn,
                path,
                error: error.to_string(),
            });
        }
    }

    // === slot bookkeeping and advertising ===

    /// Configured slots, scaled up by per-hub minimums
    pub fn slots_total(&self) -> u32 {
        let hub_based =
            self.inner.config.hub_slots * self.inner.hub.total_hub_count() as u32;
        self.inner.config.slots.max(hub_based)
    }

    fn free_slots(&self, st: &DispatchState) -> i32 {
        (self.slots_total() as i32 - st.counts.running).max(0)
    }

    fn free_extra_slots(&self, st: &DispatchState) -> i32 {
        (self.inner.config.extra_slots as i32 - st.counts.extra).max(0)
    }

    /// Public getters the hub layer advertises
    pub fn get_slots(&self) -> u32 {
        self.slots_total()
    }

    pub fn get_free_slots(&self) -> u32 {
        let st = self.inner.state.lock();
        self.free_slots(&st) as u32
    }

    pub fn get_running_average_speed(&self) -> u64 {
        let st = self.inner.state.lock();
        st.uploads.values().map(|u| u.speed).sum()
    }

    pub fn upload_count(&self) -> usize {
        self.inner.state.lock().uploads.len()
    }

    pub fn waiting_users(&self) -> Vec<super::WaitingUser> {
        self.inner.state.lock().queue.snapshot()
    }

    pub fn has_reserved_slot(&self, user: &Cid) -> bool {
        self.inner.state.lock().reserved.contains_key(user)
    }

    /// One auto-granted slot per interval while the measured upload rate
    /// stays under the configured limit
    fn auto_slot(&self, st: &DispatchState) -> bool {
        let limit_kbps = self.inner.config.auto_grant_speed_kbps;
        if limit_kbps == 0 {
            return false;
        }
        if (self.slots_total() + self.inner.config.auto_slots) < st.counts.running as u32 {
            return false;
        }
        if let Some(last) = st.last_grant {
            if last.elapsed() < Duration::from_secs(AUTO_GRANT_INTERVAL_SECS) {
                return false;
            }
        }
        let average: u64 = st.uploads.values().map(|u| u.speed).sum();
        average < limit_kbps * 1024
    }

    // === reservations and the waiting queue ===

    /// Grant a user a slot for `seconds` (0 = until revoked), reconnecting
    /// them immediately if they are waiting
    pub fn reserve_slot(&self, user: HintedUser, seconds: u64) {
        let reconnect = {
            let mut st = self.inner.state.lock();
            let expiry = (seconds > 0).then(|| Instant::now() + Duration::from_secs(seconds));
            st.reserved.insert(user.cid, expiry);

            if self.inner.hub.is_online(&user.cid) {
                st.queue
                    .position_of(&user.cid)
                    .map(|i| st.queue.snapshot()[i].token.clone())
            } else {
                None
            }
        };

        if let Some(token) = reconnect {
            self.inner.hub.connect_user(&user, &token);
        }
        self.emit(UploadEvent::SlotsUpdated { user });
    }

    pub fn unreserve_slot(&self, user: &HintedUser) {
        let removed = self.inner.state.lock().reserved.remove(&user.cid).is_some();
        if removed {
            self.emit(UploadEvent::SlotsUpdated { user: user.clone() });
        }
    }

    /// Pop waiting users into the notified set while slots are free, and
    /// ask the hub layer to call them back
    fn notify_queued_users(&self) {
        let mut notify = Vec::new();
        {
            let mut st = self.inner.state.lock();
            if st.queue.is_empty() {
                return;
            }
            let mut free = self.free_slots(&st) - st.notified.len() as i32;
            while free > 0 {
                let Some(waiting) = st.queue.pop_front() else {
                    break;
                };
                if self.inner.hub.is_online(&waiting.user.cid) {
                    st.notified.insert(waiting.user.cid, Instant::now());
                    notify.push(waiting);
                    free -= 1;
                }
            }
        }

        for waiting in notify {
            self.inner.hub.connect_user(&waiting.user, &waiting.token);
            self.emit(UploadEvent::QueueRemove {
                user: waiting.user,
            });
        }
    }

    // === bundles ===

    /// Handle a `UBD` command from a peer
    pub fn on_ubd(&self, params: &[String]) {
        let Some(command) = parse_ubd(params) else {
            debug!("Malformed UBD command ignored");
            return;
        };

        match command {
            BundleCommand::Add {
                bundle,
                conn_token,
                name,
                size,
                downloaded,
                single_user,
            } => {
                let mut st = self.inner.state.lock();
                if st.bundles.contains_key(&bundle) {
                    // duplicate add behaves like a connection change
                    attach_bundle_to_token(&mut st, &bundle, &conn_token);
                    return;
                }
                let mut new_bundle =
                    UploadBundle::new(&name, bundle.clone(), size, single_user, downloaded);
                if let Some(conn) = conn_by_token(&st, &conn_token) {
                    new_bundle.add_upload(conn);
                    if let Some(upload) = st.uploads.get_mut(&conn) {
                        upload.bundle = Some(bundle.clone());
                    }
                    if let Some(state) = st.connections.get_mut(&conn) {
                        state.last_bundle = Some(bundle.clone());
                    }
                }
                st.bundles.insert(bundle, new_bundle);
            }
            BundleCommand::Change { bundle, conn_token } => {
                let mut st = self.inner.state.lock();
                if st.bundles.contains_key(&bundle) {
                    attach_bundle_to_token(&mut st, &bundle, &conn_token);
                }
            }
            BundleCommand::Update {
                bundle,
                name,
                size,
                downloaded,
                single_user,
                multi_user,
            } => {
                let mut st = self.inner.state.lock();
                let Some(entry) = st.bundles.get_mut(&bundle) else {
                    return;
                };
                if multi_user {
                    entry.set_single_user(false, 0);
                } else if single_user {
                    entry.set_single_user(true, downloaded);
                } else {
                    if let Some(size) = size {
                        if size > 0 {
                            entry.size = size;
                        }
                    }
                    if let Some(name) = name {
                        entry.set_target(&name);
                    }
                }
            }
            BundleCommand::Finish { bundle } => {
                let finished = {
                    let mut st = self.inner.state.lock();
                    st.bundles.remove(&bundle)
                };
                if let Some(finished) = finished {
                    info!("Upload bundle {} complete", finished.name());
                    self.emit(UploadEvent::BundleComplete {
                        token: finished.token,
                        name: finished.target,
                    });
                }
            }
            BundleCommand::Remove { conn_token } => {
                let mut st = self.inner.state.lock();
                let Some(conn) = conn_by_token(&st, &conn_token) else {
                    return;
                };
                let bundle_token = st.uploads.get(&conn).and_then(|u| u.bundle.clone());
                if let Some(token) = bundle_token {
                    let segment = st.uploads.get(&conn).map(|u| u.segment).unwrap_or_default();
                    if let Some(bundle) = st.bundles.get_mut(&token) {
                        bundle.remove_upload(conn, &segment);
                    }
                    if let Some(upload) = st.uploads.get_mut(&conn) {
                        upload.bundle = None;
                    }
                }
                if let Some(state) = st.connections.get_mut(&conn) {
                    state.last_bundle = None;
                }
            }
        }
    }

    /// Handle a `UBN` progress report
    pub fn on_ubn(&self, params: &[String]) {
        let Some(progress) = parse_ubn(params) else {
            return;
        };

        let mut st = self.inner.state.lock();
        let Some(bundle) = st.bundles.get_mut(&progress.bundle) else {
            return;
        };
        if bundle.single_user {
            return;
        }
        if let Some(speed) = progress.speed {
            bundle.total_speed = speed;
        }
        if let Some(percent) = progress.percent {
            bundle.uploaded_segments = (bundle.size as f64 * percent / 100.0) as i64;
        }
    }

    // === timers ===

    /// Once per second: expire delayed uploads and idle bundles, refresh
    /// speed estimates, publish progress, and call back waiting users
    pub fn second_tick(&self) {
        let (tick_event, completions) = {
            let mut st = self.inner.state.lock();

            // age out the delay list
            let mut completions = Vec::new();
            let mut kept = Vec::new();
            for mut upload in std::mem::take(&mut st.delay_uploads) {
                upload.delay_ticks += 1;
                if upload.delay_ticks as u64 > UPLOAD_GRACE_SECS {
                    finish_delay_upload(&upload);
                    completions.push(UploadEvent::Complete {
                        conn: upload.conn,
                        path: upload.path.clone(),
                    });
                    detach_from_bundle(&mut st, &upload);
                } else {
                    kept.push(upload);
                }
            }
            st.delay_uploads = kept;

            // prune bundles with no uploads attached
            let empty: Vec<String> = st
                .bundles
                .iter_mut()
                .filter_map(|(token, bundle)| {
                    if bundle.uploads.is_empty() {
                        bundle.delay_ticks += 1;
                        (bundle.delay_ticks as u64 > UPLOAD_GRACE_SECS).then(|| token.clone())
                    } else {
                        bundle.delay_ticks = 0;
                        None
                    }
                })
                .collect();
            for token in empty {
                st.bundles.remove(&token);
            }

            // refresh speeds and snapshot progress
            let mut upload_snapshots = Vec::new();
            for upload in st.uploads.values_mut() {
                if upload.pos > 0 {
                    upload.tick();
                    upload_snapshots.push(UploadSnapshot {
                        conn: upload.conn,
                        user: upload.user.clone(),
                        path: upload.path.clone(),
                        pos: upload.segment.start() + upload.pos,
                        size: upload.file_size,
                        speed: upload.speed,
                    });
                }
            }

            let mut bundle_speeds: HashMap<String, u64> = HashMap::new();
            for upload in st.uploads.values() {
                if let Some(token) = &upload.bundle {
                    *bundle_speeds.entry(token.clone()).or_default() += upload.speed;
                }
            }
            let mut bundle_snapshots = Vec::new();
            for (token, bundle) in st.bundles.iter_mut() {
                bundle.speed = bundle_speeds.get(token).copied().unwrap_or(0);
                if bundle.speed > 0 || bundle.total_speed > 0 {
                    bundle_snapshots.push(BundleSnapshot {
                        token: bundle.token.clone(),
                        name: bundle.name().to_string(),
                        size: bundle.size,
                        uploaded: bundle.total_uploaded(),
                        speed: bundle.speed.max(bundle.total_speed),
                        seconds_left: bundle.seconds_left(),
                    });
                }
            }

            let tick_event = (!upload_snapshots.is_empty() || !bundle_snapshots.is_empty())
                .then_some(UploadEvent::Tick {
                    uploads: upload_snapshots,
                    bundles: bundle_snapshots,
                });
            (tick_event, completions)
        };

        for event in completions {
            self.emit(event);
        }
        if let Some(event) = tick_event {
            self.emit(event);
        }
        self.notify_queued_users();
    }

    /// Once per minute: expire reservations and notifications, run the
    /// auto-kick pass
    pub fn minute_tick(&self) {
        let mut slot_events = Vec::new();
        let mut disconnects = Vec::new();
        {
            let mut st = self.inner.state.lock();
            let now = Instant::now();

            let expired: Vec<Cid> = st
                .reserved
                .iter()
                .filter_map(|(user, expiry)| match expiry {
                    Some(at) if *at <= now => Some(*user),
                    _ => None,
                })
                .collect();
            for user in expired {
                st.reserved.remove(&user);
                if let Some(state) = st.connections.values().find(|c| c.user.cid == user) {
                    slot_events.push(state.user.clone());
                } else {
                    slot_events.push(HintedUser::new(user, ""));
                }
            }

            let stale: Vec<Cid> = st
                .notified
                .iter()
                .filter(|(_, at)| at.elapsed() >= Duration::from_secs(NOTIFY_EXPIRY_SECS))
                .map(|(user, _)| *user)
                .collect();
            for user in stale {
                st.notified.remove(&user);
                st.queue.remove_user(&user);
            }

            if self.inner.config.auto_kick {
                let mut pending: Vec<(ConnectionId, bool)> = Vec::new();
                for upload in st.uploads.values() {
                    if self.inner.hub.is_online(&upload.user.cid) {
                        pending.push((upload.conn, false));
                        continue;
                    }
                    if upload.flags.pending_kick {
                        disconnects.push(upload.conn);
                        continue;
                    }
                    if self.inner.config.auto_kick_no_favs
                        && self.inner.hub.is_favorite(&upload.user.cid)
                    {
                        continue;
                    }
                    pending.push((upload.conn, true));
                }
                for (conn, kick) in pending {
                    if let Some(upload) = st.uploads.get_mut(&conn) {
                        upload.flags.pending_kick = kick;
                    }
                }
            }
        }

        for user in slot_events {
            self.emit(UploadEvent::SlotsUpdated { user });
        }
        for conn in disconnects {
            warn!("Auto-kicking offline user on connection {conn}");
            self.emit(UploadEvent::RequestDisconnect { conn });
        }
    }
}

enum SlotRefusal {
    Queue,
    NoQueue,
}

enum SourceContent {
    File(PathBuf),
    Memory(Arc<Vec<u8>>),
}

struct ResolvedSource {
    kind: TransferKind,
    content: SourceContent,
    file_size: i64,
    tth: Option<TthValue>,
    mini: bool,
    partial: bool,
}

impl ResolvedSource {
    fn full_list(bytes: Arc<Vec<u8>>) -> Self {
        let size = bytes.len() as i64;
        Self {
            kind: TransferKind::FullList,
            content: SourceContent::Memory(bytes),
            file_size: size,
            tth: None,
            mini: true,
            partial: false,
        }
    }
}

fn parse_tth_path(adc_path: &str) -> Option<TthValue> {
    adc_path.strip_prefix("TTH/")?.parse().ok()
}

fn segment_of(req: &UploadRequest, file_size: i64) -> Result<(i64, i64), UploadError> {
    let start = req.start;
    let size = if req.bytes == -1 {
        file_size - start
    } else {
        req.bytes
    };
    if size < 0 || start + size > file_size {
        return Err(UploadError::InvalidRequest(
            "bytes were requested beyond the end of the file",
        ));
    }
    Ok((start, size))
}

fn is_uploading(st: &DispatchState, user: &Cid) -> bool {
    st.uploads.values().any(|u| u.user.cid == *user)
}

fn release_slot(counts: &mut Accounting, slot: SlotType, user: &Cid) {
    match slot {
        SlotType::Std => counts.running -= 1,
        SlotType::Extra => counts.extra -= 1,
        SlotType::Partial => counts.extra_partial -= 1,
        SlotType::Small => counts.small_slots -= 1,
        SlotType::Mcn => change_mcn_slot(counts, user, true),
        SlotType::None => {}
    }
}

/// MCN accounting: the first connection to a user also takes a running
/// slot; later ones only bump the per-user count
fn change_mcn_slot(counts: &mut Accounting, user: &Cid, remove: bool) {
    if let Some(count) = counts.mcn_uploads.get_mut(user) {
        if remove {
            *count -= 1;
            counts.mcn_slots -= 1;
            if *count == 0 {
                counts.mcn_uploads.remove(user);
                counts.running -= 1;
            }
        } else {
            *count += 1;
            counts.mcn_slots += 1;
        }
    } else if !remove {
        counts.mcn_uploads.insert(*user, 1);
        counts.running += 1;
        counts.mcn_slots += 1;
    }
}

fn conn_by_token(st: &DispatchState, token: &str) -> Option<ConnectionId> {
    st.connections
        .iter()
        .find(|(_, state)| state.token == token)
        .map(|(&conn, _)| conn)
}

fn attach_bundle_to_token(st: &mut DispatchState, bundle: &str, conn_token: &str) {
    let Some(conn) = conn_by_token(st, conn_token) else {
        return;
    };
    if let Some(entry) = st.bundles.get_mut(bundle) {
        entry.add_upload(conn);
    }
    if let Some(upload) = st.uploads.get_mut(&conn) {
        upload.bundle = Some(bundle.to_string());
    }
    if let Some(state) = st.connections.get_mut(&conn) {
        state.last_bundle = Some(bundle.to_string());
    }
}

fn detach_from_bundle(st: &mut DispatchState, upload: &Upload) {
    if let Some(token) = &upload.bundle {
        if let Some(bundle) = st.bundles.get_mut(token) {
            bundle.remove_upload(upload.conn, &upload.segment);
        }
    }
}

fn finish_delay_upload(upload: &Upload) {
    if upload.flags.chunked && upload.segment.end() != upload.file_size {
        debug!(
            "Chunked upload {:?} expired at {}/{}",
            upload.path,
            upload.segment.end(),
            upload.file_size
        );
    }
}

fn prepared_path(inner: &DispatcherInner, conn: ConnectionId) -> PathBuf {
    inner
        .state
        .lock()
        .uploads
        .get(&conn)
        .map(|u| u.path.clone())
        .unwrap_or_default()
}

fn build_name_matcher(globs: &[String]) -> Option<Regex> {
    if globs.is_empty() {
        return None;
    }
    let mut alternatives = Vec::new();
    for glob in globs {
        let mut pattern = String::new();
        for c in glob.chars() {
            match c {
                '*' => pattern.push_str(".*"),
                '?' => pattern.push('.'),
                c => pattern.push_str(&regex::escape(&c.to_string())),
            }
        }
        alternatives.push(format!("(?:{pattern})"));
    }
    let combined = format!("(?i)^(?:{})$", alternatives.join("|"));
    match Regex::new(&combined) {
        Ok(re) => Some(re),
        Err(e) => {
            warn!("Bad free-slot extension list: {e}");
            None
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::temp::TempShareInfo;
    use crate::share::test_support as share_fixture;
    use crate::share::ShareIndex;
    use parking_lot::Mutex as PlMutex;
    use slipstream_core::{HashedFile, TigerTree};
    use std::collections::HashSet;
    use tempfile::tempdir;

    struct TestHub {
        profile: ProfileToken,
        favorites: PlMutex<HashSet<Cid>>,
        online: PlMutex<HashSet<Cid>>,
        connects: PlMutex<Vec<(Cid, String)>>,
    }

    impl TestHub {
        fn new(profile: ProfileToken) -> Self {
            Self {
                profile,
                favorites: PlMutex::new(HashSet::new()),
                online: PlMutex::new(HashSet::new()),
                connects: PlMutex::new(Vec::new()),
            }
        }
    }

    impl HubContext for TestHub {
        fn resolve_profile(&self, _hub: &str, _sid: Option<&str>) -> Option<ProfileToken> {
            Some(self.profile)
        }
        fn user_profiles(&self, _user: &Cid) -> HashSet<ProfileToken> {
            HashSet::from([self.profile])
        }
        fn is_favorite(&self, user: &Cid) -> bool {
            self.favorites.lock().contains(user)
        }
        fn is_online(&self, user: &Cid) -> bool {
            self.online.lock().contains(user)
        }
        fn total_hub_count(&self) -> usize {
            1
        }
        fn connect_user(&self, user: &HintedUser, token: &str) {
            self.connects.lock().push((user.cid, token.to_string()));
        }
    }

    struct Fixture {
        dispatcher: UploadDispatcher,
        hub: Arc<TestHub>,
        share: Arc<ShareIndex>,
        store: Arc<HashStore>,
        _share_dir: tempfile::TempDir,
        _db_dir: tempfile::TempDir,
        file_tth: TthValue,
        file_size: i64,
    }

    const PROFILE: ProfileToken = 0;
    const BIG: usize = 70_000; // above the small-file threshold

    fn fixture(config: UploadConfig) -> Fixture {
        let share_dir = tempdir().unwrap();
        let db_dir = tempdir().unwrap();

        let data = vec![0x42u8; BIG];
        std::fs::write(share_dir.path().join("big.bin"), &data).unwrap();
        let tree = TigerTree::hash_buffer(&data);

        let store = Arc::new(HashStore::open(db_dir.path()).unwrap());
        store
            .add_hashed_file(
                &share_dir.path().join("big.bin").to_string_lossy().to_lowercase(),
                &tree,
                &HashedFile::new(tree.root(), 1, BIG as i64),
            )
            .unwrap();

        let (index, _) = share_fixture::index_with_root(
            "share",
            &share_dir.path().to_string_lossy(),
            PROFILE,
            &[("", &[("big.bin", BIG as i64, tree.root())])],
        );
        let share = Arc::new(index);
        let hub = Arc::new(TestHub::new(PROFILE));

        let dispatcher = UploadDispatcher::new(
            config,
            Arc::clone(&share),
            Arc::clone(&store),
            Arc::clone(&hub) as Arc<dyn HubContext>,
            Arc::new(crate::hub::NoQueue),
        );

        Fixture {
            dispatcher,
            hub,
            share,
            store,
            _share_dir: share_dir,
            _db_dir: db_dir,
            file_tth: tree.root(),
            file_size: BIG as i64,
        }
    }

    fn tight_config() -> UploadConfig {
        UploadConfig {
            slots: 1,
            minislot_size_kb: 1,
            extra_slots: 0,
            extra_partial_slots: 0,
            ..UploadConfig::default()
        }
    }

    fn user(seed: u8) -> HintedUser {
        let mut cid = [0u8; 24];
        cid[0] = seed;
        HintedUser::new(Cid(cid), "adc://hub:411")
    }

    fn file_request(path: &str) -> UploadRequest {
        UploadRequest {
            kind: TransferKind::File,
            adc_path: path.into(),
            start: 0,
            bytes: -1,
            user_sid: None,
            recursive: false,
            tth_list: false,
            zlib: false,
        }
    }

    #[test]
    fn test_grant_and_stream_whole_file() {
        let fx = fixture(tight_config());
        fx.dispatcher
            .add_connection(1, user(1), "t1", ConnFlags::default());

        let prepared = fx
            .dispatcher
            .prepare_file(1, &file_request("/share/big.bin"))
            .unwrap();
        assert_eq!(prepared.start, 0);
        assert_eq!(prepared.size, fx.file_size);
        assert_eq!(prepared.file_size, fx.file_size);
        assert_eq!(fx.dispatcher.get_free_slots(), 0);

        // pump the whole segment
        let mut buf = [0u8; 8192];
        let mut total = 0i64;
        loop {
            let n = fx.dispatcher.read_chunk(1, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            assert!(buf[..n].iter().all(|&b| b == 0x42));
            total += n as i64;
        }
        assert_eq!(total, fx.file_size);

        fx.dispatcher.transfer_done(1);
        assert_eq!(fx.dispatcher.upload_count(), 0);
    }

    #[test]
    fn test_invalid_requests_rejected() {
        let fx = fixture(tight_config());
        fx.dispatcher
            .add_connection(1, user(1), "t1", ConnFlags::default());

        let mut bad = file_request("/share/big.bin");
        bad.bytes = 0;
        assert!(matches!(
            fx.dispatcher.prepare_file(1, &bad),
            Err(UploadError::InvalidRequest(_))
        ));

        let mut beyond = file_request("/share/big.bin");
        beyond.start = fx.file_size - 10;
        beyond.bytes = 100;
        assert!(matches!(
            fx.dispatcher.prepare_file(1, &beyond),
            Err(UploadError::InvalidRequest(_))
        ));

        assert!(matches!(
            fx.dispatcher.prepare_file(1, &file_request("/share/missing.bin")),
            Err(UploadError::Share(ShareError::NotFound))
        ));

        assert!(matches!(
            fx.dispatcher.prepare_file(99, &file_request("/share/big.bin")),
            Err(UploadError::UnknownConnection)
        ));
    }

    #[test]
    fn test_slots_full_queues_then_small_slot_for_list() {
        let fx = fixture(tight_config());
        fx.dispatcher
            .add_connection(1, user(1), "t1", ConnFlags::default());
        fx.dispatcher
            .add_connection(2, user(2), "t2", ConnFlags::default());

        // U1 takes the only slot
        fx.dispatcher
            .prepare_file(1, &file_request("/share/big.bin"))
            .unwrap();

        // U2 is refused and lands in the queue at position 1
        let err = fx
            .dispatcher
            .prepare_file(2, &file_request("/share/big.bin"))
            .unwrap_err();
        assert_eq!(err, UploadError::SlotsFull { queue_position: Some(1) });
        assert_eq!(fx.dispatcher.waiting_users().len(), 1);

        // but the full list goes out on a small slot immediately
        let list_req = UploadRequest {
            kind: TransferKind::FullList,
            adc_path: "files.xml.bz2".into(),
            ..file_request("")
        };
        let prepared = fx.dispatcher.prepare_file(2, &list_req).unwrap();
        assert!(prepared.size > 0);
        // the served request cleared the queue entry
        assert!(fx.dispatcher.waiting_users().is_empty());
    }

    #[test]
    fn test_reserved_slot_overrides_full_slots() {
        let fx = fixture(tight_config());
        fx.dispatcher
            .add_connection(1, user(1), "t1", ConnFlags::default());
        fx.dispatcher
            .add_connection(2, user(2), "t2", ConnFlags::default());

        fx.dispatcher
            .prepare_file(1, &file_request("/share/big.bin"))
            .unwrap();
        fx.dispatcher.reserve_slot(user(2), 600);
        assert!(fx.dispatcher.has_reserved_slot(&user(2).cid));

        // reserved users get a standard slot even though slots are full
        fx.dispatcher
            .prepare_file(2, &file_request("/share/big.bin"))
            .unwrap();
        assert_eq!(fx.dispatcher.upload_count(), 2);
    }

    #[test]
    fn test_mcn_accounting() {
        let config = UploadConfig {
            slots: 3,
            slots_per_user: 0,
            minislot_size_kb: 1,
            ..UploadConfig::default()
        };
        let fx = fixture(config);
        let mcn = ConnFlags { mcn1: true, ..ConnFlags::default() };

        for conn in 1..=3u64 {
            fx.dispatcher
                .add_connection(conn, user(1), format!("t{conn}"), mcn);
        }

        // first MCN upload takes a running slot
        fx.dispatcher
            .prepare_file(1, &file_request("/share/big.bin"))
            .unwrap();
        assert_eq!(fx.dispatcher.get_free_slots(), 2);

        // further MCN uploads from the same user do not
        fx.dispatcher
            .prepare_file(2, &file_request("/share/big.bin"))
            .unwrap();
        fx.dispatcher
            .prepare_file(3, &file_request("/share/big.bin"))
            .unwrap();
        assert_eq!(fx.dispatcher.get_free_slots(), 2);
        assert_eq!(fx.dispatcher.upload_count(), 3);

        // closing all but the last keeps the running slot
        fx.dispatcher.connection_failed(1, "closed");
        fx.dispatcher.remove_connection(1);
        assert_eq!(fx.dispatcher.get_free_slots(), 2);
        fx.dispatcher.connection_failed(2, "closed");
        fx.dispatcher.remove_connection(2);
        assert_eq!(fx.dispatcher.get_free_slots(), 2);

        // the last one releases it
        fx.dispatcher.connection_failed(3, "closed");
        fx.dispatcher.remove_connection(3);
        assert_eq!(fx.dispatcher.get_free_slots(), 3);
    }

    #[test]
    fn test_partial_segment_resume() {
        let fx = fixture(tight_config());
        fx.dispatcher
            .add_connection(1, user(1), "t1", ConnFlags::default());

        let half = fx.file_size / 2;
        let mut first = file_request("/share/big.bin");
        first.bytes = half;
        let prepared = fx.dispatcher.prepare_file(1, &first).unwrap();
        assert_eq!(prepared.size, half);

        // drain and finish the first chunk; it lingers for resume
        let mut buf = [0u8; 16384];
        while fx.dispatcher.read_chunk(1, &mut buf).unwrap() > 0 {}
        fx.dispatcher.transfer_done(1);
        assert_eq!(fx.dispatcher.upload_count(), 0);

        // continuation on the same connection reuses the upload
        let mut second = file_request("/share/big.bin");
        second.start = half;
        second.bytes = -1;
        let resumed = fx.dispatcher.prepare_file(1, &second).unwrap();
        assert_eq!(resumed.start, half);
        assert_eq!(resumed.size, fx.file_size - half);

        let mut total = 0i64;
        loop {
            let n = fx.dispatcher.read_chunk(1, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            total += n as i64;
        }
        assert_eq!(total, fx.file_size - half);
    }

    #[test]
    fn test_tree_request_serves_leaves() {
        let fx = fixture(tight_config());
        fx.dispatcher
            .add_connection(1, user(1), "t1", ConnFlags::default());

        let req = UploadRequest {
            kind: TransferKind::Tree,
            adc_path: format!("TTH/{}", fx.file_tth),
            ..file_request("")
        };
        let prepared = fx.dispatcher.prepare_file(1, &req).unwrap();

        let tree = fx.store.get_tree(&fx.file_tth).unwrap().unwrap();
        assert_eq!(prepared.size as usize, tree.leaves().len() * 24);

        let mut buf = vec![0u8; prepared.size as usize];
        let n = fx.dispatcher.read_chunk(1, &mut buf).unwrap();
        assert_eq!(&buf[..24.min(n)], &tree.leaves()[0].as_bytes()[..24.min(n)]);
    }

    #[test]
    fn test_partial_list_request() {
        let fx = fixture(tight_config());
        fx.dispatcher
            .add_connection(1, user(1), "t1", ConnFlags::default());

        let req = UploadRequest {
            kind: TransferKind::PartialList,
            adc_path: "/share/".into(),
            ..file_request("")
        };
        let prepared = fx.dispatcher.prepare_file(1, &req).unwrap();

        let mut buf = vec![0u8; prepared.size as usize];
        let mut collected = Vec::new();
        loop {
            let n = fx.dispatcher.read_chunk(1, &mut buf).unwrap();
            if n == 0 {
                break;
            }
            collected.extend_from_slice(&buf[..n]);
        }
        let xml = String::from_utf8(collected).unwrap();
        assert!(xml.contains("big.bin"));
        assert!(xml.contains("FileListing"));
    }

    #[test]
    fn test_temp_share_keyed_access() {
        let fx = fixture(tight_config());
        let requester = user(5);
        fx.dispatcher
            .add_connection(1, requester.clone(), "t1", ConnFlags::default());

        // a file outside the share, temp-shared to this CID only
        let outside = fx._db_dir.path().join("secret.bin");
        std::fs::write(&outside, vec![9u8; 1000]).unwrap();
        let tree = TigerTree::hash_buffer(&vec![9u8; 1000]);
        fx.share.temp_shares.add(TempShareInfo {
            tth: tree.root(),
            path: outside,
            size: 1000,
            key: Some(requester.cid.to_base32()),
        });

        let req = file_request(&format!("TTH/{}", tree.root()));
        let prepared = fx.dispatcher.prepare_file(1, &req).unwrap();
        assert_eq!(prepared.size, 1000);

        // a different user is refused
        fx.dispatcher
            .add_connection(2, user(6), "t2", ConnFlags::default());
        assert!(matches!(
            fx.dispatcher.prepare_file(2, &req),
            Err(UploadError::Share(ShareError::NotFound))
        ));
    }

    #[test]
    fn test_bundle_lifecycle() {
        let fx = fixture(tight_config());
        let events = fx.dispatcher.subscribe();
        fx.dispatcher
            .add_connection(1, user(1), "conn-token-1", ConnFlags::default());
        fx.dispatcher
            .prepare_file(1, &file_request("/share/big.bin"))
            .unwrap();

        let params = |list: &[&str]| -> Vec<String> { list.iter().map(|s| s.to_string()).collect() };

        fx.dispatcher.on_ubd(&params(&[
            "AD",
            "BUbundle-1",
            "TOconn-token-1",
            "NAAlbum/",
            "SI1000000",
        ]));

        // progress for a multi-user bundle
        fx.dispatcher
            .on_ubd(&params(&["UD", "BUbundle-1", "MU1"]));
        fx.dispatcher.on_ubn(&params(&["BUbundle-1", "PE25", "DS10k"]));

        fx.dispatcher.on_ubd(&params(&["FI", "BUbundle-1"]));

        let mut saw_complete = false;
        while let Ok(event) = events.try_recv() {
            if let UploadEvent::BundleComplete { token, .. } = event {
                assert_eq!(token, "bundle-1");
                saw_complete = true;
            }
        }
        assert!(saw_complete);
    }

    #[test]
    fn test_second_tick_expires_delayed_uploads() {
        let fx = fixture(tight_config());
        fx.dispatcher
            .add_connection(1, user(1), "t1", ConnFlags::default());

        let mut first = file_request("/share/big.bin");
        first.bytes = 1000;
        fx.dispatcher.prepare_file(1, &first).unwrap();
        let mut buf = [0u8; 4096];
        while fx.dispatcher.read_chunk(1, &mut buf).unwrap() > 0 {}
        fx.dispatcher.transfer_done(1);

        // the grace period is UPLOAD_GRACE_SECS ticks
        for _ in 0..=UPLOAD_GRACE_SECS {
            fx.dispatcher.second_tick();
        }
        // afterwards the continuation resolves the file afresh
        let mut second = file_request("/share/big.bin");
        second.start = 1000;
        let prepared = fx.dispatcher.prepare_file(1, &second).unwrap();
        assert_eq!(prepared.start, 1000);
    }

    #[test]
    fn test_queued_user_notified_when_slot_frees() {
        let fx = fixture(tight_config());
        fx.dispatcher
            .add_connection(1, user(1), "t1", ConnFlags::default());
        fx.dispatcher
            .add_connection(2, user(2), "t2", ConnFlags::default());

        fx.dispatcher
            .prepare_file(1, &file_request("/share/big.bin"))
            .unwrap();
        let _ = fx.dispatcher.prepare_file(2, &file_request("/share/big.bin"));
        assert_eq!(fx.dispatcher.waiting_users().len(), 1);

        // U2 comes online; U1 finishes and releases the slot
        fx.hub.online.lock().insert(user(2).cid);
        fx.dispatcher.transfer_done(1);
        fx.dispatcher.connection_failed(1, "done");
        fx.dispatcher.remove_connection(1);

        fx.dispatcher.second_tick();
        let connects = fx.hub.connects.lock();
        assert_eq!(connects.len(), 1);
        assert_eq!(connects[0].0, user(2).cid);
        assert_eq!(connects[0].1, "t2");
    }

    #[test]
    fn test_slot_getters() {
        let fx = fixture(UploadConfig {
            slots: 2,
            hub_slots: 5,
            ..UploadConfig::default()
        });
        // hub_slots × hub count outweighs the configured slots
        assert_eq!(fx.dispatcher.get_slots(), 5);
        assert_eq!(fx.dispatcher.get_free_slots(), 5);
        assert_eq!(fx.dispatcher.get_running_average_speed(), 0);
    }
}
