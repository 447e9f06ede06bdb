//! File list generation
//!
//! Partial lists are directory-scoped XML documents generated on demand;
//! the full list is the same document over the whole profile-visible share,
//! bzip2-compressed and cached per profile. A cached full list is reused
//! until the share changes underneath it, and even then regeneration is
//! rate-limited unless forced.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bzip2::write::BzEncoder;
use bzip2::Compression;
use parking_lot::Mutex;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, Event};
use quick_xml::Writer;
use std::io::Write as _;
use tracing::debug;

use slipstream_core::{path as pathutil, ProfileToken, ShareError, LIST_GENERATOR};

use super::{IndexInner, ShareIndex, Subtree};

/// Default minimum age before a stale full list is rebuilt
const DEFAULT_LIST_INTERVAL_SECS: u64 = 15 * 60;

struct CachedList {
    generation: u64,
    built: Instant,
    bytes: Arc<Vec<u8>>,
}

/// Per-profile cache of compressed full lists
pub struct FileListCache {
    entries: Mutex<HashMap<ProfileToken, CachedList>>,
    interval_secs: AtomicU64,
}

impl FileListCache {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval_secs: AtomicU64::new(DEFAULT_LIST_INTERVAL_SECS),
        }
    }

    pub fn set_interval(&self, interval: Duration) {
        self.interval_secs.store(interval.as_secs(), Ordering::Relaxed);
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.load(Ordering::Relaxed))
    }

}

impl Default for FileListCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ShareIndex {
    /// Generate the partial file list for an ADC directory path.
    ///
    /// Non-recursive listings mark child directories `Incomplete="1"` so the
    /// peer knows to ask again for their contents.
    pub fn generate_partial_list(
        &self,
        adc_path: &str,
        recursive: bool,
        profile: ProfileToken,
    ) -> Result<Vec<u8>, ShareError> {
        let inner = self.inner.read();
        let profiles = HashSet::from([profile]);

        let mut writer = Writer::new(Vec::new());
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), Some("yes"))))
            .map_err(|_| ShareError::NotFound)?;

        let base = normalized_base(adc_path);
        let mut listing = BytesStart::new("FileListing");
        listing.push_attribute(("Version", "1"));
        listing.push_attribute(("CID", self.cid().to_base32().as_str()));
        listing.push_attribute(("Base", base.as_str()));
        listing.push_attribute(("Generator", LIST_GENERATOR));
        writer
            .write_event(Event::Start(listing))
            .map_err(|_| ShareError::NotFound)?;

        if pathutil::is_adc_root(&base) {
            for root in inner.roots.values() {
                if inner.root_visible(root, &profiles) {
                    write_directory(&mut writer, &root.tree, Subtree::ROOT, recursive)
                        .map_err(|_| ShareError::NotFound)?;
                }
            }
        } else {
            let segments = pathutil::adc_segments(&base).ok_or(ShareError::NotFound)?;
            let (dir_tree, dir) = resolve_visible_dir(&inner, &segments, &profiles)?;
            write_children(&mut writer, dir_tree, dir, recursive)
                .map_err(|_| ShareError::NotFound)?;
        }

        writer
            .write_event(Event::End(BytesEnd::new("FileListing")))
            .map_err(|_| ShareError::NotFound)?;
        Ok(writer.into_inner())
    }

    /// One TTH per line for every file below an ADC directory path
    pub fn generate_tth_list(
        &self,
        adc_path: &str,
        profile: ProfileToken,
    ) -> Result<Vec<u8>, ShareError> {
        let inner = self.inner.read();
        let profiles = HashSet::from([profile]);
        let base = normalized_base(adc_path);

        let mut out = Vec::new();
        let mut emit_tree = |tree: &Subtree, start: u32| {
            let mut stack = vec![start];
            while let Some(d) = stack.pop() {
                let node = &tree.dirs[d as usize];
                for &f in &node.files {
                    out.extend_from_slice(tree.files[f as usize].tth.to_base32().as_bytes());
                    out.push(b'\n');
                }
                stack.extend_from_slice(&node.dirs);
            }
        };

        if pathutil::is_adc_root(&base) {
            for root in inner.roots.values() {
                if inner.root_visible(root, &profiles) {
                    emit_tree(&root.tree, Subtree::ROOT);
                }
            }
        } else {
            let segments = pathutil::adc_segments(&base).ok_or(ShareError::NotFound)?;
            let (tree, dir) = resolve_visible_dir(&inner, &segments, &profiles)?;
            emit_tree(tree, dir);
        }
        Ok(out)
    }

    /// The profile's full list as a bzip2 stream, cached per profile.
    ///
    /// A stale cached list is served until it is older than the refresh
    /// interval; `force` rebuilds unconditionally.
    pub fn full_list(&self, profile: ProfileToken, force: bool) -> Arc<Vec<u8>> {
        let generation = self.generation();
        {
            let entries = self.list_cache.entries.lock();
            if let Some(entry) = entries.get(&profile) {
                let fresh = entry.generation == generation;
                let young = entry.built.elapsed() < self.list_cache.interval();
                if !force && (fresh || young) {
                    return Arc::clone(&entry.bytes);
                }
            }
        }

        let xml = self
            .generate_partial_list("/", true, profile)
            .unwrap_or_default();

        let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
        let _ = encoder.write_all(&xml);
        let bytes = Arc::new(encoder.finish().unwrap_or_default());

        debug!(
            "Built full list for profile {} ({} -> {} bytes)",
            profile,
            xml.len(),
            bytes.len()
        );

        let mut entries = self.list_cache.entries.lock();
        entries.insert(
            profile,
            CachedList {
                generation,
                built: Instant::now(),
                bytes: Arc::clone(&bytes),
            },
        );
        bytes
    }
}

fn normalized_base(adc_path: &str) -> String {
    let mut base = adc_path.to_string();
    if !base.starts_with('/') {
        base.insert(0, '/');
    }
    if !base.ends_with('/') {
        base.push('/');
    }
    base
}

/// Resolve a directory by path segments among roots visible to the profiles
fn resolve_visible_dir<'a>(
    inner: &'a IndexInner,
    segments: &[&str],
    profiles: &HashSet<ProfileToken>,
) -> Result<(&'a Subtree, u32), ShareError> {
    let Some((vname, rest)) = segments.split_first() else {
        return Err(ShareError::NotFound);
    };
    let vname_lower = slipstream_core::text::to_lower(vname);
    let mut denied = false;

    for root in inner.roots.values() {
        if root.virtual_name.lower() != vname_lower {
            continue;
        }
        let Some(dir) = root.tree.resolve_dir(rest) else {
            continue;
        };
        if !inner.root_visible(root, profiles) {
            denied = true;
            continue;
        }
        return Ok((&root.tree, dir));
    }

    Err(if denied {
        ShareError::AccessDenied
    } else {
        ShareError::NotFound
    })
}

type XmlResult = Result<(), quick_xml::Error>;

/// Write a directory element, recursing or marking incomplete
fn write_directory(
    writer: &mut Writer<Vec<u8>>,
    tree: &Subtree,
    dir: u32,
    recursive: bool,
) -> XmlResult {
    let node = &tree.dirs[dir as usize];
    let mut elem = BytesStart::new("Directory");
    elem.push_attribute(("Name", node.name.name()));

    if recursive {
        writer.write_event(Event::Start(elem))?;
        write_children(writer, tree, dir, true)?;
        writer.write_event(Event::End(BytesEnd::new("Directory")))?;
    } else {
        elem.push_attribute(("Incomplete", "1"));
        writer.write_event(Event::Empty(elem))?;
    }
    Ok(())
}

/// Write the children (directories then files) of a directory
fn write_children(
    writer: &mut Writer<Vec<u8>>,
    tree: &Subtree,
    dir: u32,
    recursive: bool,
) -> XmlResult {
    let node = &tree.dirs[dir as usize];
    for &d in &node.dirs {
        write_directory(writer, tree, d, recursive)?;
    }
    for &f in &node.files {
        let file = &tree.files[f as usize];
        let mut elem = BytesStart::new("File");
        elem.push_attribute(("Name", file.name.name()));
        elem.push_attribute(("Size", file.size.to_string().as_str()));
        elem.push_attribute(("TTH", file.tth.to_base32().as_str()));
        writer.write_event(Event::Empty(elem))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::test_support::*;
    use bzip2::read::BzDecoder;
    use slipstream_core::SP_DEFAULT;
    use std::io::Read;

    #[test]
    fn test_partial_list_root() {
        let (index, _) = index_with_root(
            "music",
            "/data/music",
            SP_DEFAULT,
            &[("a", &[("song.mp3", 4096, tth(1))])],
        );

        let xml = index.generate_partial_list("/", false, SP_DEFAULT).unwrap();
        let text = String::from_utf8(xml).unwrap();

        assert!(text.contains(r#"<FileListing Version="1""#));
        assert!(text.contains(r#"Base="/""#));
        assert!(text.contains(r#"<Directory Name="music" Incomplete="1"/>"#));
        assert!(!text.contains("song.mp3"), "the root listing stops at the roots");
        assert!(!text.contains('\n'), "list output is newline-free");

        // one level down, the subdirectory shows up incomplete
        let xml = index.generate_partial_list("/music/", false, SP_DEFAULT).unwrap();
        let text = String::from_utf8(xml).unwrap();
        assert!(text.contains(r#"Base="/music/""#));
        assert!(text.contains(r#"<Directory Name="a" Incomplete="1"/>"#));
        assert!(!text.contains("song.mp3"));
    }

    #[test]
    fn test_partial_list_recursive() {
        let song = tth(2);
        let (index, _) = index_with_root(
            "music",
            "/data/music",
            SP_DEFAULT,
            &[("a", &[("song.mp3", 4096, song)])],
        );

        let xml = index.generate_partial_list("/music/", true, SP_DEFAULT).unwrap();
        let text = String::from_utf8(xml).unwrap();

        assert!(text.contains(r#"Base="/music/""#));
        assert!(text.contains(&format!(
            r#"<File Name="song.mp3" Size="4096" TTH="{}"/>"#,
            song.to_base32()
        )));
    }

    #[test]
    fn test_partial_list_escapes_names() {
        let (index, _) = index_with_root(
            "stuff",
            "/data/stuff",
            SP_DEFAULT,
            &[("", &[("a&b<c>.txt", 1, tth(3))])],
        );

        let xml = index.generate_partial_list("/stuff/", false, SP_DEFAULT).unwrap();
        let text = String::from_utf8(xml).unwrap();
        assert!(text.contains("a&amp;b&lt;c&gt;.txt"));
        assert!(!text.contains("a&b<c>.txt"));
    }

    #[test]
    fn test_partial_list_invisible_profile() {
        let (index, _) = index_with_root(
            "music",
            "/data/music",
            5,
            &[("", &[("x.mp3", 1, tth(4))])],
        );

        assert_eq!(
            index.generate_partial_list("/music/", false, SP_DEFAULT),
            Err(ShareError::AccessDenied)
        );
        // the root listing just comes back empty
        let xml = index.generate_partial_list("/", false, SP_DEFAULT).unwrap();
        assert!(!String::from_utf8(xml).unwrap().contains("music"));
    }

    #[test]
    fn test_full_list_round_trip() {
        let song = tth(5);
        let (index, _) = index_with_root(
            "music",
            "/data/music",
            SP_DEFAULT,
            &[("a", &[("song.mp3", 10, song)])],
        );

        let compressed = index.full_list(SP_DEFAULT, false);
        let mut decoder = BzDecoder::new(compressed.as_slice());
        let mut xml = String::new();
        decoder.read_to_string(&mut xml).unwrap();

        assert!(xml.contains("song.mp3"));
        assert!(xml.contains(&song.to_base32()));
    }

    #[test]
    fn test_full_list_cached_until_change() {
        let (index, id) = index_with_root(
            "music",
            "/data/music",
            SP_DEFAULT,
            &[("", &[("a.mp3", 1, tth(6))])],
        );

        let first = index.full_list(SP_DEFAULT, false);
        let second = index.full_list(SP_DEFAULT, false);
        assert!(Arc::ptr_eq(&first, &second), "unchanged share reuses the cache");

        index.install_subtree(id, subtree_with("music", &[("", &[("b.mp3", 2, tth(7))])]));
        let third = index.full_list(SP_DEFAULT, true);
        assert!(!Arc::ptr_eq(&second, &third));
    }

    #[test]
    fn test_tth_list() {
        let t1 = tth(8);
        let t2 = tth(9);
        let (index, _) = index_with_root(
            "music",
            "/data/music",
            SP_DEFAULT,
            &[("a", &[("x.mp3", 1, t1)]), ("a/b", &[("y.mp3", 2, t2)])],
        );

        let list = index.generate_tth_list("/music/", SP_DEFAULT).unwrap();
        let text = String::from_utf8(list).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines.contains(&t1.to_base32().as_str()));
        assert!(lines.contains(&t2.to_base32().as_str()));
    }
}
