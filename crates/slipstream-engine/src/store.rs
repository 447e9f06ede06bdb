//! Persistent hashed-file store
//!
//! Two logical stores under the configuration directory: `HashData.redb`
//! maps a raw 24-byte TTH to its serialized Tiger tree, `FileIndex.redb`
//! maps a lowercase real path to its [`HashedFile`] record. Every record
//! starts with a one-byte version discriminator; a record that fails to
//! parse is treated as missing and swept by the next optimize pass.
//!
//! Consistency rule: a file-info record must never be visible without its
//! tree record, so `add_hashed_file` inserts the tree first.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use slipstream_core::tth::TTH_BYTES;
use slipstream_core::{HashedFile, TigerTree, TthValue, STORE_VERSION};

use crate::db::{with_retry, DbError, DbHandler, RedbHandler};

const TREE_DB_FILE: &str = "HashData.redb";
const FILE_DB_FILE: &str = "FileIndex.redb";
const REPAIR_FLAG_FILE: &str = "REPAIR";

/// Persistent TTH tree and file-info storage
pub struct HashStore {
    trees: RedbHandler,
    files: RedbHandler,
    repair_flag: PathBuf,
}

impl HashStore {
    /// Open both stores under `dir`, running a repair pass first if the
    /// previous session scheduled one
    pub fn open(dir: &Path) -> Result<Self, DbError> {
        std::fs::create_dir_all(dir).map_err(|e| DbError::Io(e.to_string()))?;

        let store = Self {
            trees: RedbHandler::open(&dir.join(TREE_DB_FILE), "tree store")?,
            files: RedbHandler::open(&dir.join(FILE_DB_FILE), "file index")?,
            repair_flag: dir.join(REPAIR_FLAG_FILE),
        };

        if store.is_repair_scheduled() {
            info!("Repair flag present, repairing hash stores");
            store.trees.repair()?;
            store.files.repair()?;
            store.schedule_repair(false);
        }

        Ok(store)
    }

    /// Record a completed hash: tree first, then the file-info record
    pub fn add_hashed_file(
        &self,
        path_lower: &str,
        tree: &TigerTree,
        file_info: &HashedFile,
    ) -> Result<(), DbError> {
        self.add_tree(tree)?;

        let value = encode_file_info(file_info);
        with_retry(|| {
            // file records are replaced on rehash
            self.files.remove(path_lower.as_bytes())?;
            self.files.put(path_lower.as_bytes(), &value)
        })
    }

    /// Store a tree; an identical root already present is not an error
    pub fn add_tree(&self, tree: &TigerTree) -> Result<(), DbError> {
        let key = tree.root();
        let value = encode_tree(tree);
        match with_retry(|| self.trees.put(key.as_bytes(), &value)) {
            Err(DbError::KeyExists) => Ok(()),
            other => other,
        }
    }

    /// Load and verify a tree by its root
    pub fn get_tree(&self, root: &TthValue) -> Result<Option<TigerTree>, DbError> {
        let mut buf = Vec::new();
        if !with_retry(|| self.trees.get_into(root.as_bytes(), &mut buf))? {
            return Ok(None);
        }

        match decode_tree(&buf) {
            Some(tree) if tree.root() == *root => Ok(Some(tree)),
            Some(_) => {
                warn!("Tree record for {} fails root verification, dropping", root);
                self.trees.remove(root.as_bytes())?;
                Ok(None)
            }
            None => {
                debug!("Corrupt tree record for {}, treating as missing", root);
                Ok(None)
            }
        }
    }

    pub fn has_tree(&self, root: &TthValue) -> Result<bool, DbError> {
        with_retry(|| self.trees.exists(root.as_bytes()))
    }

    /// Fetch the stored record for a lowercase path
    pub fn get_file_info(&self, path_lower: &str) -> Result<Option<HashedFile>, DbError> {
        let mut buf = Vec::new();
        if !with_retry(|| self.files.get_into(path_lower.as_bytes(), &mut buf))? {
            return Ok(None);
        }
        Ok(decode_file_info(&buf))
    }

    /// True when a stored record matches the live size and mtime, meaning
    /// the file does not need rehashing
    pub fn check_tth(&self, path_lower: &str, size: i64, mtime: u64) -> Option<HashedFile> {
        match self.get_file_info(path_lower) {
            Ok(Some(fi)) if fi.matches(mtime, size) => Some(fi),
            Ok(_) => None,
            Err(e) => {
                warn!("File-info lookup failed for {path_lower}: {e}");
                None
            }
        }
    }

    pub fn remove_file(&self, path_lower: &str) -> Result<bool, DbError> {
        with_retry(|| self.files.remove(path_lower.as_bytes()))
    }

    /// Move a record to a new path without rehashing
    pub fn rename_file(&self, old_lower: &str, new_lower: &str) -> Result<(), DbError> {
        let mut buf = Vec::new();
        if with_retry(|| self.files.get_into(old_lower.as_bytes(), &mut buf))? {
            self.files.remove(old_lower.as_bytes())?;
            self.files.remove(new_lower.as_bytes())?;
            self.files.put(new_lower.as_bytes(), &buf)?;
        }
        Ok(())
    }

    /// Garbage-collect records: file-info entries whose path the keep
    /// predicate rejects or whose record no longer parses are dropped, and
    /// with `verify_trees` the trees unreferenced by any kept record follow.
    /// Returns (file records dropped, tree records dropped).
    pub fn optimize(
        &self,
        keep_path: impl Fn(&str) -> bool,
        verify_trees: bool,
    ) -> Result<(usize, usize), DbError> {
        let mut kept_roots = std::collections::HashSet::new();

        let files_removed = self.files.remove_if(&mut |key, value| {
            let Ok(path) = std::str::from_utf8(key) else {
                return true;
            };
            match decode_file_info(value) {
                Some(fi) if keep_path(path) => {
                    kept_roots.insert(fi.root);
                    false
                }
                _ => true,
            }
        })?;

        let trees_removed = if verify_trees {
            self.trees.remove_if(&mut |key, value| {
                if key.len() != TTH_BYTES {
                    return true;
                }
                let mut root = [0u8; TTH_BYTES];
                root.copy_from_slice(key);
                let root = TthValue::from_bytes(root);
                if !kept_roots.contains(&root) {
                    return true;
                }
                // drop trees that no longer verify
                !matches!(decode_tree(value), Some(tree) if tree.root() == root)
            })?
        } else {
            0
        };

        if files_removed > 0 || trees_removed > 0 {
            info!(
                "Hash store optimized: {} file records and {} trees removed",
                files_removed, trees_removed
            );
        }
        Ok((files_removed, trees_removed))
    }

    /// Schedule (or cancel) a repair pass for the next startup
    pub fn schedule_repair(&self, schedule: bool) {
        let result = if schedule {
            std::fs::write(&self.repair_flag, b"1")
        } else {
            match std::fs::remove_file(&self.repair_flag) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            }
        };
        if let Err(e) = result {
            warn!("Could not update repair flag: {e}");
        }
    }

    pub fn is_repair_scheduled(&self) -> bool {
        self.repair_flag.exists()
    }

    pub fn compact(&self) -> Result<(), DbError> {
        self.trees.compact()?;
        self.files.compact()
    }

    /// (tree count, file count)
    pub fn record_counts(&self) -> Result<(u64, u64), DbError> {
        Ok((self.trees.size(false)?, self.files.size(false)?))
    }

    /// (tree bytes, file bytes) on disk
    pub fn sizes_on_disk(&self) -> Result<(u64, u64), DbError> {
        Ok((self.trees.size_on_disk()?, self.files.size_on_disk()?))
    }
}

fn encode_tree(tree: &TigerTree) -> Vec<u8> {
    let leaves = tree.leaves();
    let mut out = Vec::with_capacity(1 + 8 + 4 + 4 + leaves.len() * TTH_BYTES);
    out.push(STORE_VERSION);
    out.extend_from_slice(&tree.file_size().to_le_bytes());
    out.extend_from_slice(&(tree.block_size() as u32).to_le_bytes());
    out.extend_from_slice(&(leaves.len() as u32).to_le_bytes());
    for leaf in leaves {
        out.extend_from_slice(leaf.as_bytes());
    }
    out
}

fn decode_tree(data: &[u8]) -> Option<TigerTree> {
    if data.len() < 17 || data[0] != STORE_VERSION {
        return None;
    }
    let file_size = u64::from_le_bytes(data[1..9].try_into().ok()?);
    let block_size = u32::from_le_bytes(data[9..13].try_into().ok()?) as u64;
    let leaf_count = u32::from_le_bytes(data[13..17].try_into().ok()?) as usize;

    let leaves_bytes = &data[17..];
    if leaf_count == 0 || leaves_bytes.len() != leaf_count * TTH_BYTES {
        return None;
    }
    if !block_size.is_power_of_two() || block_size < slipstream_core::MIN_BLOCK_SIZE {
        return None;
    }

    let leaves = leaves_bytes
        .chunks_exact(TTH_BYTES)
        .map(|chunk| {
            let mut bytes = [0u8; TTH_BYTES];
            bytes.copy_from_slice(chunk);
            TthValue::from_bytes(bytes)
        })
        .collect();

    Some(TigerTree::from_leaves(file_size, block_size, leaves))
}

fn encode_file_info(fi: &HashedFile) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 8 + 8 + TTH_BYTES);
    out.push(STORE_VERSION);
    out.extend_from_slice(&fi.mtime.to_le_bytes());
    out.extend_from_slice(&fi.size.to_le_bytes());
    out.extend_from_slice(fi.root.as_bytes());
    out
}

fn decode_file_info(data: &[u8]) -> Option<HashedFile> {
    if data.len() != 1 + 8 + 8 + TTH_BYTES || data[0] != STORE_VERSION {
        return None;
    }
    let mtime = u64::from_le_bytes(data[1..9].try_into().ok()?);
    let size = i64::from_le_bytes(data[9..17].try_into().ok()?);
    let mut root = [0u8; TTH_BYTES];
    root.copy_from_slice(&data[17..]);
    Some(HashedFile::new(TthValue::from_bytes(root), mtime, size))
}
