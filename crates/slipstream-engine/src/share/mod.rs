//! Share index
//!
//! A forest of per-root subtrees plus three global side-indices: TTH → file
//! references, lowercase directory name → directory references, and a bloom
//! filter over every name token. Subtrees are arenas of directory and file
//! nodes addressed by stable indices, so a refresh can build a replacement
//! off-lock and swap it in with one exclusive acquisition; readers see the
//! old forest or the new one, never a torn state.

pub mod cache;
pub mod filelist;
pub mod refresh;
pub mod temp;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info};

use slipstream_core::{
    path as pathutil, text, Cid, DualName, HashedFile, NameBloom, ProfileToken, RefreshState,
    ShareError, ShareProfile, ShareValidationError, TthValue, SP_DEFAULT, SP_HIDDEN,
};

use crate::hasher::now_secs;
use filelist::FileListCache;
use temp::TempShareSet;

/// Identifier of a configured share root
pub type RootId = u32;

/// Stable reference to a file node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileRef {
    pub root: RootId,
    pub file: u32,
}

/// Stable reference to a directory node
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct DirRef {
    pub root: RootId,
    pub dir: u32,
}

/// A shared file inside a subtree arena
#[derive(Clone, Debug)]
pub struct FileNode {
    pub name: DualName,
    pub parent: u32,
    pub size: i64,
    pub mtime: u64,
    pub tth: TthValue,
}

/// A shared directory inside a subtree arena; index 0 is the root directory
#[derive(Clone, Debug)]
pub struct DirNode {
    pub name: DualName,
    pub parent: Option<u32>,
    pub dirs: Vec<u32>,
    pub files: Vec<u32>,
    pub mtime: u64,
}

/// Arena of one root's directory and file nodes
#[derive(Clone, Debug)]
pub struct Subtree {
    pub dirs: Vec<DirNode>,
    pub files: Vec<FileNode>,
}

impl Subtree {
    /// A subtree containing only its root directory
    pub fn new(root_name: DualName, mtime: u64) -> Self {
        Self {
            dirs: vec![DirNode {
                name: root_name,
                parent: None,
                dirs: Vec::new(),
                files: Vec::new(),
                mtime,
            }],
            files: Vec::new(),
        }
    }

    pub const ROOT: u32 = 0;

    /// Add a child directory, keeping the parent's children sorted by
    /// lowercase name
    pub fn add_dir(&mut self, parent: u32, name: DualName, mtime: u64) -> u32 {
        let id = self.dirs.len() as u32;
        let pos = self.dirs[parent as usize]
            .dirs
            .binary_search_by(|&d| {
                self.dirs[d as usize].name.lower().cmp(name.lower())
            })
            .unwrap_or_else(|p| p);
        self.dirs.push(DirNode {
            name,
            parent: Some(parent),
            dirs: Vec::new(),
            files: Vec::new(),
            mtime,
        });
        self.dirs[parent as usize].dirs.insert(pos, id);
        id
    }

    /// Add a file, keeping the parent's files sorted by lowercase name
    pub fn add_file(
        &mut self,
        parent: u32,
        name: DualName,
        size: i64,
        mtime: u64,
        tth: TthValue,
    ) -> u32 {
        let id = self.files.len() as u32;
        let pos = self.dirs[parent as usize]
            .files
            .binary_search_by(|&f| {
                self.files[f as usize].name.lower().cmp(name.lower())
            })
            .unwrap_or_else(|p| p);
        self.files.push(FileNode {
            name,
            parent,
            size,
            mtime,
            tth,
        });
        self.dirs[parent as usize].files.insert(pos, id);
        id
    }

    pub fn find_child_dir(&self, dir: u32, name_lower: &str) -> Option<u32> {
        let children = &self.dirs[dir as usize].dirs;
        children
            .binary_search_by(|&d| self.dirs[d as usize].name.lower().cmp(name_lower))
            .ok()
            .map(|pos| children[pos])
    }

    pub fn find_child_file(&self, dir: u32, name_lower: &str) -> Option<u32> {
        let children = &self.dirs[dir as usize].files;
        children
            .binary_search_by(|&f| self.files[f as usize].name.lower().cmp(name_lower))
            .ok()
            .map(|pos| children[pos])
    }

    /// Resolve a directory by path components (lowercase comparison)
    pub fn resolve_dir(&self, parts: &[&str]) -> Option<u32> {
        let mut current = Self::ROOT;
        for part in parts {
            let lower = text::to_lower(part);
            current = self.find_child_dir(current, &lower)?;
        }
        Some(current)
    }

    /// Path components from the root directory (exclusive) down to `dir`
    pub fn dir_parts(&self, dir: u32) -> Vec<String> {
        let mut parts = Vec::new();
        let mut current = Some(dir);
        while let Some(d) = current {
            let node = &self.dirs[d as usize];
            if node.parent.is_some() {
                parts.push(node.name.name().to_string());
            }
            current = node.parent;
        }
        parts.reverse();
        parts
    }

    /// Total shared size and file count below a directory
    pub fn totals_under(&self, dir: u32) -> (i64, usize) {
        let mut size = 0;
        let mut count = 0;
        let mut stack = vec![dir];
        while let Some(d) = stack.pop() {
            let node = &self.dirs[d as usize];
            for &f in &node.files {
                size += self.files[f as usize].size;
                count += 1;
            }
            stack.extend_from_slice(&node.dirs);
        }
        (size, count)
    }
}

/// Settings for one configured root
#[derive(Clone, Debug)]
pub struct RootSettings {
    pub path: PathBuf,
    pub virtual_name: String,
    pub profiles: HashSet<ProfileToken>,
    pub incoming: bool,
}

/// One share root: settings plus the live subtree
pub struct ShareRoot {
    pub id: RootId,
    pub path: PathBuf,
    pub virtual_name: DualName,
    pub profiles: HashSet<ProfileToken>,
    pub incoming: bool,
    pub refresh_state: RefreshState,
    pub last_refresh: u64,
    pub cache_dirty: bool,
    pub tree: Subtree,
}

/// Public summary of a root
#[derive(Clone, Debug)]
pub struct ShareRootInfo {
    pub id: RootId,
    pub path: PathBuf,
    pub virtual_name: String,
    pub profiles: HashSet<ProfileToken>,
    pub incoming: bool,
    pub refresh_state: RefreshState,
    pub last_refresh: u64,
    pub size: i64,
    pub files: usize,
}

/// A resolved file request
#[derive(Clone, Debug)]
pub struct ResolvedFile {
    pub real_path: PathBuf,
    pub size: i64,
    pub tth: TthValue,
}

pub(crate) struct IndexInner {
    pub roots: BTreeMap<RootId, ShareRoot>,
    next_root: RootId,
    pub tth_index: HashMap<TthValue, Vec<FileRef>>,
    pub dirname_index: HashMap<String, Vec<DirRef>>,
    pub bloom: NameBloom,
    pub profiles: BTreeMap<ProfileToken, ShareProfile>,
}

impl IndexInner {
    pub fn file(&self, fref: FileRef) -> &FileNode {
        &self.roots[&fref.root].tree.files[fref.file as usize]
    }

    /// ADC path of a file, starting with the root's virtual name
    pub fn file_adc_path(&self, fref: FileRef) -> String {
        let root = &self.roots[&fref.root];
        let file = self.file(fref);
        let mut parts = root.tree.dir_parts(file.parent);
        parts.insert(0, root.virtual_name.name().to_string());
        format!("/{}/{}", parts.join("/"), file.name.name())
    }

    /// Real filesystem path of a file
    pub fn file_real_path(&self, fref: FileRef) -> PathBuf {
        let root = &self.roots[&fref.root];
        let file = self.file(fref);
        let mut path = root.path.clone();
        for part in root.tree.dir_parts(file.parent) {
            path.push(part);
        }
        path.push(file.name.name());
        path
    }

    /// True when any of the profiles can see the root
    pub fn root_visible(&self, root: &ShareRoot, profiles: &HashSet<ProfileToken>) -> bool {
        !root.profiles.is_disjoint(profiles)
    }

    fn purge_root_from_indices(&mut self, root_id: RootId) {
        self.tth_index.retain(|_, refs| {
            refs.retain(|r| r.root != root_id);
            !refs.is_empty()
        });
        self.dirname_index.retain(|_, refs| {
            refs.retain(|r| r.root != root_id);
            !refs.is_empty()
        });
    }

    fn add_root_to_indices(&mut self, root_id: RootId) {
        let tree = &self.roots[&root_id].tree;

        let mut file_entries = Vec::with_capacity(tree.files.len());
        for (idx, file) in tree.files.iter().enumerate() {
            file_entries.push((file.tth, FileRef { root: root_id, file: idx as u32 }));
        }
        let mut dir_entries = Vec::with_capacity(tree.dirs.len());
        for (idx, dir) in tree.dirs.iter().enumerate() {
            dir_entries.push((
                dir.name.lower().to_string(),
                DirRef { root: root_id, dir: idx as u32 },
            ));
        }

        for (tth, fref) in file_entries {
            self.tth_index.entry(tth).or_default().push(fref);
        }
        for (lower, dref) in dir_entries {
            self.dirname_index.entry(lower).or_default().push(dref);
        }
    }

    /// Rebuild the bloom filter from every name in the forest
    fn rebuild_bloom(&mut self) {
        let mut token_count = 0usize;
        for root in self.roots.values() {
            token_count += root.tree.dirs.len() + root.tree.files.len() * 2;
        }

        let mut bloom = NameBloom::for_tokens(token_count.max(1) * 2);
        for root in self.roots.values() {
            for dir in &root.tree.dirs {
                for token in text::name_tokens(dir.name.lower()) {
                    bloom.insert(token);
                }
            }
            for file in &root.tree.files {
                for token in text::name_tokens(file.name.lower()) {
                    bloom.insert(token);
                }
                if let Some(ext) = text::file_extension(file.name.lower()) {
                    bloom.insert(ext);
                }
            }
        }
        self.bloom = bloom;
    }
}

/// The share index; every read takes the shared lock, every structural
/// change the exclusive one
pub struct ShareIndex {
    pub(crate) inner: RwLock<IndexInner>,
    cid: Cid,
    pub(crate) list_cache: FileListCache,
    pub(crate) temp_shares: TempShareSet,
    refresh_generation: std::sync::atomic::AtomicU64,
}

impl ShareIndex {
    pub fn new(cid: Cid) -> Self {
        let mut profiles = BTreeMap::new();
        profiles.insert(SP_DEFAULT, ShareProfile::new(SP_DEFAULT, "Default"));
        profiles.insert(SP_HIDDEN, ShareProfile::new(SP_HIDDEN, "Hidden"));

        Self {
            inner: RwLock::new(IndexInner {
                roots: BTreeMap::new(),
                next_root: 0,
                tth_index: HashMap::new(),
                dirname_index: HashMap::new(),
                bloom: NameBloom::for_tokens(0),
                profiles,
            }),
            cid,
            list_cache: FileListCache::new(),
            temp_shares: TempShareSet::new(),
            refresh_generation: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn cid(&self) -> Cid {
        self.cid
    }

    /// Monotonic counter bumped on every share mutation
    pub fn generation(&self) -> u64 {
        self.refresh_generation
            .load(std::sync::atomic::Ordering::Relaxed)
    }

    fn touch(&self) {
        self.refresh_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    // === profiles ===

    pub fn add_profile(&self, profile: ShareProfile) {
        self.inner.write().profiles.insert(profile.token, profile);
    }

    /// Remove a profile; roots lose the token, and roots left without any
    /// profile disappear from the share
    pub fn remove_profile(&self, token: ProfileToken) {
        let mut inner = self.inner.write();
        inner.profiles.remove(&token);

        let orphaned: Vec<RootId> = inner
            .roots
            .iter_mut()
            .filter_map(|(&id, root)| {
                root.profiles.remove(&token);
                root.profiles.is_empty().then_some(id)
            })
            .collect();

        let any_orphaned = !orphaned.is_empty();
        for id in orphaned {
            inner.roots.remove(&id);
            inner.purge_root_from_indices(id);
        }
        if any_orphaned {
            inner.rebuild_bloom();
        }
    }

    pub fn profiles(&self) -> Vec<ShareProfile> {
        self.inner.read().profiles.values().cloned().collect()
    }

    // === root configuration ===

    /// Validate and register a new root. The subtree starts empty; a refresh
    /// populates it.
    pub fn add_root(&self, settings: RootSettings) -> Result<RootId, ShareValidationError> {
        let mut inner = self.inner.write();
        validate_root(&inner, &settings, None)?;

        let id = inner.next_root;
        inner.next_root += 1;

        let virtual_name = DualName::new(settings.virtual_name);
        info!(
            "Added share root {:?} as {:?} (profiles {:?})",
            settings.path,
            virtual_name.name(),
            settings.profiles
        );
        inner.roots.insert(
            id,
            ShareRoot {
                id,
                path: settings.path,
                virtual_name: virtual_name.clone(),
                profiles: settings.profiles,
                incoming: settings.incoming,
                refresh_state: RefreshState::Normal,
                last_refresh: 0,
                cache_dirty: true,
                tree: Subtree::new(virtual_name, 0),
            },
        );
        Ok(id)
    }

    /// Update a root's settings. The subtree survives when the real path is
    /// unchanged; a moved root is handled by the caller as remove + add.
    pub fn update_root(&self, settings: RootSettings) -> Result<(), ShareValidationError> {
        let mut inner = self.inner.write();

        let id = find_root_by_path(&inner, &settings.path)
            .ok_or_else(|| ShareValidationError::UnknownRoot(settings.path.clone()))?;
        validate_root(&inner, &settings, Some(id))?;

        let root = inner.roots.get_mut(&id).expect("root exists");
        root.virtual_name = DualName::new(settings.virtual_name);
        root.profiles = settings.profiles;
        root.incoming = settings.incoming;
        root.cache_dirty = true;
        let new_name = root.virtual_name.clone();
        root.tree.dirs[Subtree::ROOT as usize].name = new_name;
        drop(inner);

        self.touch();
        Ok(())
    }

    /// Drop a root and every index entry under it
    pub fn remove_root(&self, path: &Path) -> Result<(), ShareValidationError> {
        let mut inner = self.inner.write();
        let id = find_root_by_path(&inner, path)
            .ok_or_else(|| ShareValidationError::UnknownRoot(path.to_path_buf()))?;

        inner.roots.remove(&id);
        inner.purge_root_from_indices(id);
        inner.rebuild_bloom();
        drop(inner);

        self.touch();
        info!("Removed share root {:?}", path);
        Ok(())
    }

    pub fn roots(&self) -> Vec<ShareRootInfo> {
        let inner = self.inner.read();
        inner
            .roots
            .values()
            .map(|root| {
                let (size, files) = root.tree.totals_under(Subtree::ROOT);
                ShareRootInfo {
                    id: root.id,
                    path: root.path.clone(),
                    virtual_name: root.virtual_name.name().to_string(),
                    profiles: root.profiles.clone(),
                    incoming: root.incoming,
                    refresh_state: root.refresh_state,
                    last_refresh: root.last_refresh,
                    size,
                    files,
                }
            })
            .collect()
    }

    /// The root owning a path, if any
    pub fn root_for_path(&self, path: &Path) -> Option<(RootId, PathBuf)> {
        let inner = self.inner.read();
        inner
            .roots
            .values()
            .find(|root| pathutil::is_parent_or_exact(&root.path, path))
            .map(|root| (root.id, root.path.clone()))
    }

    pub(crate) fn set_refresh_state(&self, root_id: RootId, state: RefreshState) {
        let mut inner = self.inner.write();
        if let Some(root) = inner.roots.get_mut(&root_id) {
            root.refresh_state = state;
        }
    }

    // === subtree swap ===

    /// Swap in a freshly built subtree for a root and update every side
    /// index. This is the only structural mutation the refresh path does
    /// under the exclusive lock.
    pub fn install_subtree(&self, root_id: RootId, tree: Subtree) {
        let mut inner = self.inner.write();
        let Some(root) = inner.roots.get_mut(&root_id) else {
            debug!("Dropping subtree for removed root {root_id}");
            return;
        };

        root.tree = tree;
        root.refresh_state = RefreshState::Normal;
        root.last_refresh = now_secs();
        root.cache_dirty = true;

        inner.purge_root_from_indices(root_id);
        inner.add_root_to_indices(root_id);
        inner.rebuild_bloom();
        drop(inner);

        self.touch();
    }

    /// Insert a single hashed file into its parent directory, if that
    /// directory is shared. Used when the hasher finishes a file after the
    /// surrounding refresh already swapped.
    pub fn add_hashed_file(&self, real_path: &Path, file: &HashedFile) -> bool {
        let Some(name) = real_path.file_name().map(|n| n.to_string_lossy().into_owned())
        else {
            return false;
        };
        let Some(parent) = real_path.parent() else {
            return false;
        };

        let mut inner = self.inner.write();
        let Some((root_id, dir)) = locate_dir(&inner, parent) else {
            return false;
        };

        let name = DualName::new(name);
        let tree = &mut inner.roots.get_mut(&root_id).expect("root exists").tree;
        if tree.find_child_file(dir, name.lower()).is_some() {
            return false;
        }

        for token in text::name_tokens(name.lower()) {
            inner.bloom.insert(token);
        }
        if let Some(ext) = text::file_extension(name.lower()) {
            inner.bloom.insert(ext);
        }

        let tree = &mut inner.roots.get_mut(&root_id).expect("root exists").tree;
        let file_idx = tree.add_file(dir, name, file.size, file.mtime, file.root);
        inner
            .tth_index
            .entry(file.root)
            .or_default()
            .push(FileRef { root: root_id, file: file_idx });
        inner.roots.get_mut(&root_id).expect("root exists").cache_dirty = true;
        drop(inner);

        self.touch();
        true
    }

    // === lookups ===

    /// Files with a given TTH visible to any of the profiles
    pub fn files_by_tth(
        &self,
        tth: &TthValue,
        profiles: &HashSet<ProfileToken>,
    ) -> Vec<ResolvedFile> {
        let inner = self.inner.read();
        let Some(refs) = inner.tth_index.get(tth) else {
            return Vec::new();
        };
        refs.iter()
            .filter(|fref| {
                let root = &inner.roots[&fref.root];
                inner.root_visible(root, profiles)
            })
            .map(|&fref| ResolvedFile {
                real_path: inner.file_real_path(fref),
                size: inner.file(fref).size,
                tth: *tth,
            })
            .collect()
    }

    /// Resolve an ADC file path for a set of profiles.
    ///
    /// `TTH/<base32>` requests search the TTH index and then the temp-share
    /// set (keyed to the requesting user). Distinguishes "exists but not for
    /// you" from "does not exist".
    pub fn to_real_with_size(
        &self,
        adc_path: &str,
        profiles: &HashSet<ProfileToken>,
        temp_keys: &[String],
    ) -> Result<ResolvedFile, ShareError> {
        if let Some(tth_str) = adc_path.strip_prefix("TTH/") {
            let tth: TthValue = tth_str.parse().map_err(|_| ShareError::NotFound)?;

            let found = self.files_by_tth(&tth, profiles);
            if let Some(first) = found.into_iter().next() {
                return Ok(first);
            }
            if let Some(temp) = self.temp_shares.find(&tth, temp_keys) {
                return Ok(ResolvedFile {
                    real_path: temp.path,
                    size: temp.size,
                    tth,
                });
            }
            // hidden by profile?
            let inner = self.inner.read();
            if inner.tth_index.contains_key(&tth) {
                return Err(ShareError::AccessDenied);
            }
            return Err(ShareError::NotFound);
        }

        let segments =
            pathutil::adc_segments(adc_path).ok_or(ShareError::NotFound)?;
        let Some((vname, rest)) = segments.split_first() else {
            return Err(ShareError::NotFound);
        };
        let Some((file_name, dirs)) = rest.split_last() else {
            return Err(ShareError::NotFound);
        };

        let inner = self.inner.read();
        let vname_lower = text::to_lower(vname);
        let mut denied = false;

        for root in inner.roots.values() {
            if root.virtual_name.lower() != vname_lower {
                continue;
            }
            let Some(dir) = root.tree.resolve_dir(dirs) else {
                continue;
            };
            let Some(file) = root
                .tree
                .find_child_file(dir, &text::to_lower(file_name))
            else {
                continue;
            };

            if !inner.root_visible(root, profiles) {
                denied = true;
                continue;
            }

            let fref = FileRef { root: root.id, file };
            return Ok(ResolvedFile {
                real_path: inner.file_real_path(fref),
                size: inner.file(fref).size,
                tth: inner.file(fref).tth,
            });
        }

        Err(if denied {
            ShareError::AccessDenied
        } else {
            ShareError::NotFound
        })
    }

    /// ADC path of a real file for a profile, walking ancestry visibility
    pub fn real_to_virtual(
        &self,
        real_path: &Path,
        profiles: &HashSet<ProfileToken>,
    ) -> Option<String> {
        let inner = self.inner.read();
        for root in inner.roots.values() {
            if !inner.root_visible(root, profiles) {
                continue;
            }
            let Ok(rel) = real_path.strip_prefix(&root.path) else {
                continue;
            };
            let parts: Vec<String> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            let Some((file_name, dirs)) = parts.split_last() else {
                continue;
            };

            let dir_refs: Vec<&str> = dirs.iter().map(String::as_str).collect();
            let Some(dir) = root.tree.resolve_dir(&dir_refs) else {
                continue;
            };
            if root
                .tree
                .find_child_file(dir, &text::to_lower(file_name))
                .is_none()
            {
                continue;
            }

            let mut out = format!("/{}", root.virtual_name.name());
            for part in dirs {
                out.push('/');
                out.push_str(part);
            }
            out.push('/');
            out.push_str(file_name);
            return Some(out);
        }
        None
    }

    /// Stored TTH for a real path, if the file is shared
    pub fn tth_for_real_path(&self, real_path: &Path) -> Option<TthValue> {
        let inner = self.inner.read();
        let parent = real_path.parent()?;
        let name_lower = text::to_lower(&real_path.file_name()?.to_string_lossy());

        let (root_id, dir) = locate_dir(&inner, parent)?;
        let tree = &inner.roots[&root_id].tree;
        let file = tree.find_child_file(dir, &name_lower)?;
        Some(tree.files[file as usize].tth)
    }

    /// Lowercase real paths of every shared file; used by store GC
    pub fn all_real_paths_lower(&self) -> HashSet<String> {
        let inner = self.inner.read();
        let mut out = HashSet::new();
        for root in inner.roots.values() {
            for idx in 0..root.tree.files.len() {
                let fref = FileRef { root: root.id, file: idx as u32 };
                out.insert(text::to_lower(&inner.file_real_path(fref).to_string_lossy()));
            }
        }
        out
    }

    /// ADC paths of every visible directory with the given name
    pub fn directories_by_name(
        &self,
        name: &str,
        profiles: &HashSet<ProfileToken>,
    ) -> Vec<String> {
        let inner = self.inner.read();
        let Some(refs) = inner.dirname_index.get(&text::to_lower(name)) else {
            return Vec::new();
        };

        refs.iter()
            .filter(|dref| inner.root_visible(&inner.roots[&dref.root], profiles))
            .map(|&dref| {
                let root = &inner.roots[&dref.root];
                let mut out = format!("/{}", root.virtual_name.name());
                for part in root.tree.dir_parts(dref.dir) {
                    out.push('/');
                    out.push_str(&part);
                }
                out.push('/');
                out
            })
            .collect()
    }

    /// Total (size, file count) visible to a profile
    pub fn share_totals(&self, profile: ProfileToken) -> (i64, usize) {
        let inner = self.inner.read();
        let profiles = HashSet::from([profile]);
        inner
            .roots
            .values()
            .filter(|root| inner.root_visible(root, &profiles))
            .map(|root| root.tree.totals_under(Subtree::ROOT))
            .fold((0, 0), |acc, (size, files)| (acc.0 + size, acc.1 + files))
    }
}

/// Find the directory node for a real path, searching all roots
pub(crate) fn locate_dir(inner: &IndexInner, dir_path: &Path) -> Option<(RootId, u32)> {
    for root in inner.roots.values() {
        let Ok(rel) = dir_path.strip_prefix(&root.path) else {
            continue;
        };
        let parts: Vec<String> = rel
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        let part_refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        if let Some(dir) = root.tree.resolve_dir(&part_refs) {
            return Some((root.id, dir));
        }
    }
    None
}

fn find_root_by_path(inner: &IndexInner, path: &Path) -> Option<RootId> {
    inner
        .roots
        .values()
        .find(|root| root.path == path)
        .map(|root| root.id)
}

fn validate_root(
    inner: &IndexInner,
    settings: &RootSettings,
    updating: Option<RootId>,
) -> Result<(), ShareValidationError> {
    if settings.profiles.is_empty() {
        return Err(ShareValidationError::NoProfiles);
    }
    if !settings.path.is_absolute() {
        return Err(ShareValidationError::NotAbsolute(settings.path.clone()));
    }
    if updating.is_none() && !settings.path.is_dir() {
        return Err(ShareValidationError::PathMissing(settings.path.clone()));
    }

    let vname_lower = text::to_lower(&settings.virtual_name);

    for root in inner.roots.values() {
        if Some(root.id) == updating {
            continue;
        }
        let shares_profile = !root.profiles.is_disjoint(&settings.profiles);

        if root.path == settings.path {
            return Err(ShareValidationError::AlreadyShared(settings.path.clone()));
        }
        if shares_profile {
            if pathutil::is_parent(&root.path, &settings.path) {
                return Err(ShareValidationError::NestedUnderExistingRoot(
                    root.path.clone(),
                ));
            }
            if pathutil::is_parent(&settings.path, &root.path) {
                return Err(ShareValidationError::ContainsExistingRoot(
                    root.path.clone(),
                ));
            }
            if root.virtual_name.lower() == vname_lower {
                return Err(ShareValidationError::DuplicateVirtualName(
                    settings.virtual_name.clone(),
                ));
            }
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn profile_set(token: ProfileToken) -> HashSet<ProfileToken> {
        HashSet::from([token])
    }

    #[test]
    fn test_subtree_sorted_children() {
        let tree = subtree_with(
            "music",
            &[
                ("b", &[]),
                ("a", &[("Zed.mp3", 1, tth(1)), ("alpha.mp3", 2, tth(2))]),
            ],
        );
        let root = &tree.dirs[Subtree::ROOT as usize];
        let names: Vec<&str> = root
            .dirs
            .iter()
            .map(|&d| tree.dirs[d as usize].name.name())
            .collect();
        assert_eq!(names, vec!["a", "b"]);

        let a = tree.find_child_dir(Subtree::ROOT, "a").unwrap();
        let files: Vec<&str> = tree.dirs[a as usize]
            .files
            .iter()
            .map(|&f| tree.files[f as usize].name.name())
            .collect();
        assert_eq!(files, vec!["alpha.mp3", "Zed.mp3"]);
    }

    #[test]
    fn test_tth_index_and_paths() {
        let song = tth(9);
        let (index, _) = index_with_root(
            "music",
            "/data/music",
            SP_DEFAULT,
            &[("a", &[("song.mp3", 4096, song)])],
        );

        let found = index.files_by_tth(&song, &profile_set(SP_DEFAULT));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].real_path, PathBuf::from("/data/music/a/song.mp3"));
        assert_eq!(found[0].size, 4096);

        let adc = index
            .real_to_virtual(Path::new("/data/music/a/song.mp3"), &profile_set(SP_DEFAULT))
            .unwrap();
        assert_eq!(adc, "/music/a/song.mp3");

        // invisible to other profiles
        assert!(index.files_by_tth(&song, &profile_set(7)).is_empty());
    }

    #[test]
    fn test_to_real_with_size() {
        let song = tth(3);
        let (index, _) = index_with_root(
            "shared",
            "/srv/share",
            SP_DEFAULT,
            &[("docs", &[("Report 2024 Final.pdf", 1234, song)])],
        );

        let resolved = index
            .to_real_with_size(
                "/shared/docs/Report 2024 Final.pdf",
                &profile_set(SP_DEFAULT),
                &[],
            )
            .unwrap();
        assert_eq!(
            resolved.real_path,
            PathBuf::from("/srv/share/docs/Report 2024 Final.pdf")
        );
        assert_eq!(resolved.tth, song);

        // case-insensitive resolution
        assert!(index
            .to_real_with_size(
                "/SHARED/DOCS/report 2024 final.PDF",
                &profile_set(SP_DEFAULT),
                &[]
            )
            .is_ok());

        // wrong profile sees access denied via TTH, not-found via path probes
        assert_eq!(
            index
                .to_real_with_size(&format!("TTH/{song}"), &profile_set(9), &[])
                .unwrap_err(),
            ShareError::AccessDenied
        );
        assert_eq!(
            index
                .to_real_with_size("/shared/docs/missing.pdf", &profile_set(SP_DEFAULT), &[])
                .unwrap_err(),
            ShareError::NotFound
        );
    }

    #[test]
    fn test_validation_rules() {
        let dir = tempfile::tempdir().unwrap();
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();

        let index = ShareIndex::new(Cid::default());
        index
            .add_root(RootSettings {
                path: dir.path().to_path_buf(),
                virtual_name: "shared".into(),
                profiles: HashSet::from([1u32]),
                incoming: false,
            })
            .unwrap();

        // nested root within the same profile is refused
        let err = index
            .add_root(RootSettings {
                path: sub.clone(),
                virtual_name: "inner".into(),
                profiles: HashSet::from([1u32]),
                incoming: false,
            })
            .unwrap_err();
        assert!(matches!(err, ShareValidationError::NestedUnderExistingRoot(_)));

        // but fine under a different profile
        assert!(index
            .add_root(RootSettings {
                path: sub,
                virtual_name: "inner".into(),
                profiles: HashSet::from([2u32]),
                incoming: false,
            })
            .is_ok());

        // duplicate virtual name inside one profile
        let other = tempfile::tempdir().unwrap();
        let err = index
            .add_root(RootSettings {
                path: other.path().to_path_buf(),
                virtual_name: "SHARED".into(),
                profiles: HashSet::from([1u32]),
                incoming: false,
            })
            .unwrap_err();
        assert!(matches!(err, ShareValidationError::DuplicateVirtualName(_)));

        // relative paths and empty profile sets never validate
        assert!(matches!(
            index.add_root(RootSettings {
                path: PathBuf::from("relative/path"),
                virtual_name: "x".into(),
                profiles: HashSet::from([1u32]),
                incoming: false,
            }),
            Err(ShareValidationError::NotAbsolute(_))
        ));
        assert!(matches!(
            index.add_root(RootSettings {
                path: other.path().to_path_buf(),
                virtual_name: "x".into(),
                profiles: HashSet::new(),
                incoming: false,
            }),
            Err(ShareValidationError::NoProfiles)
        ));
    }

    #[test]
    fn test_remove_root_purges_indices() {
        let song = tth(5);
        let (index, _) = index_with_root(
            "music",
            "/data/music",
            SP_DEFAULT,
            &[("", &[("track.mp3", 10, song)])],
        );

        assert_eq!(index.files_by_tth(&song, &profile_set(SP_DEFAULT)).len(), 1);
        index.remove_root(Path::new("/data/music")).unwrap();
        assert!(index.files_by_tth(&song, &profile_set(SP_DEFAULT)).is_empty());
        assert!(index.roots().is_empty());
    }

    #[test]
    fn test_install_subtree_swaps_atomically() {
        let old = tth(1);
        let new = tth(2);
        let (index, id) = index_with_root(
            "music",
            "/data/music",
            SP_DEFAULT,
            &[("", &[("old.mp3", 10, old)])],
        );

        let replacement = subtree_with("music", &[("", &[("new.mp3", 20, new)])]);
        let generation = index.generation();
        index.install_subtree(id, replacement);

        assert!(index.files_by_tth(&old, &profile_set(SP_DEFAULT)).is_empty());
        assert_eq!(index.files_by_tth(&new, &profile_set(SP_DEFAULT)).len(), 1);
        assert_eq!(index.generation(), generation + 1);
    }

    #[test]
    fn test_add_hashed_file_after_swap() {
        let (index, _) = index_with_root("music", "/data/music", SP_DEFAULT, &[("a", &[])]);

        let file = HashedFile::new(tth(8), 100, 2048);
        assert!(index.add_hashed_file(Path::new("/data/music/a/late.mp3"), &file));
        // unknown parent directory is refused
        assert!(!index.add_hashed_file(Path::new("/data/music/b/nope.mp3"), &file));
        // duplicate insert is refused
        assert!(!index.add_hashed_file(Path::new("/data/music/a/late.mp3"), &file));

        let found = index.files_by_tth(&tth(8), &profile_set(SP_DEFAULT));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].size, 2048);
    }

    #[test]
    fn test_directories_by_name() {
        let (index, _) = index_with_root(
            "music",
            "/data/music",
            SP_DEFAULT,
            &[("albums/Best Of", &[]), ("singles/best of", &[])],
        );

        let mut found = index.directories_by_name("BEST OF", &profile_set(SP_DEFAULT));
        found.sort();
        assert_eq!(
            found,
            vec!["/music/albums/Best Of/", "/music/singles/best of/"]
        );
        assert!(index
            .directories_by_name("best of", &profile_set(9))
            .is_empty());
    }

    #[test]
    fn test_share_totals_per_profile() {
        let (index, _) = index_with_root(
            "music",
            "/data/music",
            5,
            &[("", &[("a.mp3", 100, tth(1)), ("b.mp3", 200, tth(2))])],
        );

        assert_eq!(index.share_totals(5), (300, 2));
        assert_eq!(index.share_totals(SP_DEFAULT), (0, 0));
    }
}
