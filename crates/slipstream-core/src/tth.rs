//! Tiger tree hashing
//!
//! A TTH identifies file content by the root of a Merkle tree of Tiger
//! hashes. Leaf hashes are computed over storage blocks with a `0x00` domain
//! prefix; internal nodes combine two children with a `0x01` prefix. The
//! block size is the smallest power of two that is at least [`MIN_BLOCK_SIZE`]
//! and keeps the leaf count at or below [`MAX_TREE_LEAVES`].

use std::fmt;
use std::str::FromStr;

use digest::Digest;
use tiger::Tiger;

use crate::{MAX_TREE_LEAVES, MIN_BLOCK_SIZE};

/// Width of a Tiger digest in bytes
pub const TTH_BYTES: usize = 24;

/// Length of a base32-encoded digest (no padding)
pub const TTH_BASE32_LEN: usize = 39;

const LEAF_PREFIX: u8 = 0x00;
const NODE_PREFIX: u8 = 0x01;

const BASE32: base32::Alphabet = base32::Alphabet::Rfc4648 { padding: false };

/// 24-byte Tiger tree root; equality and ordering by byte sequence
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TthValue(pub [u8; TTH_BYTES]);

impl TthValue {
    pub const fn from_bytes(bytes: [u8; TTH_BYTES]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; TTH_BYTES] {
        &self.0
    }

    /// Base32 string form used on the wire (39 characters)
    pub fn to_base32(&self) -> String {
        base32::encode(BASE32, &self.0)
    }

    /// True if any byte is set; a zero digest never occurs for real content
    pub fn is_set(&self) -> bool {
        self.0.iter().any(|b| *b != 0)
    }
}

impl fmt::Display for TthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

impl fmt::Debug for TthValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TthValue({})", self.to_base32())
    }
}

/// Error parsing a base32 digest string
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid base32 digest: {0}")]
pub struct InvalidDigest(pub String);

impl FromStr for TthValue {
    type Err = InvalidDigest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let decoded = base32::decode(BASE32, s).ok_or_else(|| InvalidDigest(s.to_string()))?;
        // 39 base32 chars decode to 24 bytes plus 3 spare bits
        if s.len() != TTH_BASE32_LEN || decoded.len() < TTH_BYTES {
            return Err(InvalidDigest(s.to_string()));
        }
        let mut bytes = [0u8; TTH_BYTES];
        bytes.copy_from_slice(&decoded[..TTH_BYTES]);
        Ok(Self(bytes))
    }
}

/// 24-byte client identifier, derived from a private identifier by Tiger.
///
/// Shares the wire encoding with [`TthValue`] but is a distinct type; mixing
/// the two up is a bug the compiler should catch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Cid(pub [u8; TTH_BYTES]);

impl Cid {
    /// Derive the public client id from a private identifier
    pub fn from_pid(pid: &[u8; TTH_BYTES]) -> Self {
        let mut hasher = Tiger::new();
        hasher.update(pid);
        Self(hasher.finalize().into())
    }

    pub fn to_base32(&self) -> String {
        base32::encode(BASE32, &self.0)
    }
}

impl fmt::Display for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_base32())
    }
}

impl fmt::Debug for Cid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Cid({})", self.to_base32())
    }
}

impl FromStr for Cid {
    type Err = InvalidDigest;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TthValue::from_str(s).map(|v| Self(v.0))
    }
}

/// Smallest power-of-two block size that keeps the leaf count at or below
/// [`MAX_TREE_LEAVES`], never below [`MIN_BLOCK_SIZE`]
pub fn calc_block_size(file_size: u64) -> u64 {
    let mut block_size = MIN_BLOCK_SIZE;
    while file_size.div_ceil(block_size) > MAX_TREE_LEAVES {
        block_size *= 2;
    }
    block_size
}

fn hash_leaf(data: &[u8]) -> TthValue {
    let mut h = Tiger::new_with_prefix([LEAF_PREFIX]);
    h.update(data);
    TthValue(h.finalize().into())
}

fn combine(left: &TthValue, right: &TthValue) -> TthValue {
    let mut h = Tiger::new_with_prefix([NODE_PREFIX]);
    h.update(left.0);
    h.update(right.0);
    TthValue(h.finalize().into())
}

/// Compute the root over a leaf level; odd nodes carry up unchanged
fn root_of(leaves: &[TthValue]) -> TthValue {
    debug_assert!(!leaves.is_empty());
    let mut level = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| {
                if pair.len() == 2 {
                    combine(&pair[0], &pair[1])
                } else {
                    pair[0]
                }
            })
            .collect();
    }
    level[0]
}

/// An immutable Tiger tree over a byte range
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TigerTree {
    file_size: u64,
    block_size: u64,
    leaves: Vec<TthValue>,
    root: TthValue,
}

impl TigerTree {
    /// Rebuild a tree from stored leaves, recomputing the root
    pub fn from_leaves(file_size: u64, block_size: u64, leaves: Vec<TthValue>) -> Self {
        debug_assert!(block_size >= MIN_BLOCK_SIZE && block_size.is_power_of_two());
        let root = root_of(&leaves);
        Self {
            file_size,
            block_size,
            leaves,
            root,
        }
    }

    /// Hash a complete in-memory buffer
    pub fn hash_buffer(data: &[u8]) -> Self {
        let mut hasher = TigerTreeHasher::new(calc_block_size(data.len() as u64));
        hasher.update(data);
        hasher.finalize()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn leaves(&self) -> &[TthValue] {
        &self.leaves
    }

    pub fn root(&self) -> TthValue {
        self.root
    }

    /// Verify that the stored leaves still produce the stored root
    pub fn verify_root(&self) -> bool {
        !self.leaves.is_empty() && root_of(&self.leaves) == self.root
    }
}

/// Incremental tree construction for streamed input
pub struct TigerTreeHasher {
    block_size: u64,
    leaves: Vec<TthValue>,
    current: Tiger,
    current_len: u64,
    total: u64,
}

impl TigerTreeHasher {
    pub fn new(block_size: u64) -> Self {
        debug_assert!(block_size >= MIN_BLOCK_SIZE && block_size.is_power_of_two());
        Self {
            block_size,
            leaves: Vec::new(),
            current: Tiger::new_with_prefix([LEAF_PREFIX]),
            current_len: 0,
            total: 0,
        }
    }

    pub fn update(&mut self, mut data: &[u8]) {
        self.total += data.len() as u64;
        while !data.is_empty() {
            let room = (self.block_size - self.current_len) as usize;
            let take = room.min(data.len());
            self.current.update(&data[..take]);
            self.current_len += take as u64;
            data = &data[take..];

            if self.current_len == self.block_size {
                self.flush_leaf();
            }
        }
    }

    fn flush_leaf(&mut self) {
        let full = std::mem::replace(&mut self.current, Tiger::new_with_prefix([LEAF_PREFIX]));
        self.leaves.push(TthValue(full.finalize().into()));
        self.current_len = 0;
    }

    /// Finish the stream. An empty input produces the single-leaf tree over
    /// zero bytes, so every file has a well-defined root.
    pub fn finalize(mut self) -> TigerTree {
        if self.current_len > 0 || self.leaves.is_empty() {
            self.flush_leaf();
        }
        let root = root_of(&self.leaves);
        TigerTree {
            file_size: self.total,
            block_size: self.block_size,
            leaves: self.leaves,
            root,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Root of the empty file, as advertised by every DC client
    const EMPTY_ROOT: &str = "LWPNACQDBZRYXW3VHJVCJ64QBZNGHOHHHZWCLNQ";

    #[test]
    fn test_block_size_selection() {
        assert_eq!(calc_block_size(0), MIN_BLOCK_SIZE);
        assert_eq!(calc_block_size(MIN_BLOCK_SIZE), MIN_BLOCK_SIZE);
        assert_eq!(calc_block_size(MIN_BLOCK_SIZE * 1024), MIN_BLOCK_SIZE);
        assert_eq!(calc_block_size(MIN_BLOCK_SIZE * 1024 + 1), MIN_BLOCK_SIZE * 2);
        // 4 MiB fits exactly in 64 leaves of 64 KiB
        assert_eq!(calc_block_size(4 * 1024 * 1024), MIN_BLOCK_SIZE);
    }

    #[test]
    fn test_empty_root() {
        let tree = TigerTree::hash_buffer(&[]);
        assert_eq!(tree.leaves().len(), 1);
        assert_eq!(tree.root().to_base32(), EMPTY_ROOT);
        assert_eq!(tree.root(), tree.leaves()[0]);
    }

    #[test]
    fn test_single_block_root_equals_leaf() {
        let data = vec![0x42u8; 1000];
        let tree = TigerTree::hash_buffer(&data);
        assert_eq!(tree.leaves().len(), 1);
        assert_eq!(tree.root(), tree.leaves()[0]);
        assert_eq!(tree.file_size(), 1000);
    }

    #[test]
    fn test_multi_block_tree() {
        let data = vec![0xA5u8; (MIN_BLOCK_SIZE * 2 + 17) as usize];
        let tree = TigerTree::hash_buffer(&data);
        assert_eq!(tree.leaves().len(), 3);
        assert_ne!(tree.root(), tree.leaves()[0]);
        assert!(tree.verify_root());
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let data: Vec<u8> = (0..(MIN_BLOCK_SIZE as usize * 3 + 5))
            .map(|i| (i % 251) as u8)
            .collect();

        let oneshot = TigerTree::hash_buffer(&data);

        let mut hasher = TigerTreeHasher::new(calc_block_size(data.len() as u64));
        for chunk in data.chunks(4096) {
            hasher.update(chunk);
        }
        let streamed = hasher.finalize();

        assert_eq!(oneshot.root(), streamed.root());
        assert_eq!(oneshot.leaves(), streamed.leaves());
    }

    #[test]
    fn test_base32_round_trip() {
        let tree = TigerTree::hash_buffer(b"round trip");
        let encoded = tree.root().to_base32();
        assert_eq!(encoded.len(), TTH_BASE32_LEN);
        let parsed: TthValue = encoded.parse().unwrap();
        assert_eq!(parsed, tree.root());
    }

    #[test]
    fn test_base32_rejects_garbage() {
        assert!("not base32!".parse::<TthValue>().is_err());
        assert!("".parse::<TthValue>().is_err());
        // valid alphabet, wrong length
        assert!("ABCDEF".parse::<TthValue>().is_err());
    }

    #[test]
    fn test_from_leaves_round_trip() {
        let data = vec![7u8; (MIN_BLOCK_SIZE * 4) as usize];
        let tree = TigerTree::hash_buffer(&data);

        let rebuilt = TigerTree::from_leaves(
            tree.file_size(),
            tree.block_size(),
            tree.leaves().to_vec(),
        );
        assert_eq!(rebuilt.root(), tree.root());
    }

    #[test]
    fn test_distinct_content_distinct_roots() {
        let a = TigerTree::hash_buffer(b"alpha");
        let b = TigerTree::hash_buffer(b"alphb");
        assert_ne!(a.root(), b.root());
    }

    #[test]
    fn test_cid_derivation() {
        let pid = [0x11u8; TTH_BYTES];
        let cid = Cid::from_pid(&pid);
        assert_ne!(cid.0, pid, "the CID is a digest, not the PID itself");
        assert_eq!(cid, Cid::from_pid(&pid));
        assert_eq!(cid.to_base32().len(), TTH_BASE32_LEN);
    }
}
