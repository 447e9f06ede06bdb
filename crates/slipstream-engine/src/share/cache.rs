//! On-disk share cache
//!
//! Each root's last-successful subtree is serialized to
//! `<config>/ShareCache/<root-id>.xml`. At startup a cached subtree whose
//! recorded root mtime still matches the filesystem is loaded directly,
//! skipping the initial walk and rehash; anything else falls through to a
//! normal refresh. Writes are atomic (tmp file + rename).

use std::io::Write as _;
use std::path::{Path, PathBuf};

use quick_xml::events::{BytesEnd, BytesStart, Event};
use quick_xml::{Reader, Writer};
use tracing::{debug, warn};

use slipstream_core::{DualName, TthValue};

use super::{RootId, ShareRoot, Subtree};

const CACHE_DIR_NAME: &str = "ShareCache";
const CACHE_VERSION: &str = "1";

/// A deserialized cache file, pending validation against the live root
pub struct CachedRoot {
    pub path: PathBuf,
    pub root_mtime: u64,
    pub tree: Subtree,
}

/// Reads and writes per-root cache files
pub struct ShareCache {
    dir: PathBuf,
}

impl ShareCache {
    pub fn new(config_dir: &Path) -> Self {
        Self {
            dir: config_dir.join(CACHE_DIR_NAME),
        }
    }

    fn file_for(&self, root_id: RootId) -> PathBuf {
        self.dir.join(format!("{root_id}.xml"))
    }

    /// Serialize a root's subtree; failures are logged, not fatal
    pub fn save_root(&self, root: &ShareRoot) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;

        let mut writer = Writer::new(Vec::new());
        let root_dir = &root.tree.dirs[Subtree::ROOT as usize];

        let mut elem = BytesStart::new("ShareCache");
        elem.push_attribute(("Version", CACHE_VERSION));
        elem.push_attribute(("Path", root.path.to_string_lossy().as_ref()));
        elem.push_attribute(("Name", root.virtual_name.name()));
        elem.push_attribute(("Date", root_dir.mtime.to_string().as_str()));
        write_xml(&mut writer, Event::Start(elem))?;
        write_dir_contents(&mut writer, &root.tree, Subtree::ROOT)?;
        write_xml(&mut writer, Event::End(BytesEnd::new("ShareCache")))?;

        let target = self.file_for(root.id);
        let tmp = target.with_extension("xml.tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&writer.into_inner())?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &target)?;
        debug!("Share cache written for root {} ({:?})", root.id, root.path);
        Ok(())
    }

    /// Parse a cache file; a malformed file is discarded
    pub fn load_root(&self, root_id: RootId) -> Option<CachedRoot> {
        let path = self.file_for(root_id);
        let content = std::fs::read_to_string(&path).ok()?;
        match parse_cache(&content) {
            Some(cached) => Some(cached),
            None => {
                warn!("Discarding unreadable share cache {:?}", path);
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    pub fn remove_root(&self, root_id: RootId) {
        let _ = std::fs::remove_file(self.file_for(root_id));
    }
}

fn write_xml(writer: &mut Writer<Vec<u8>>, event: Event<'_>) -> std::io::Result<()> {
    writer
        .write_event(event)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
}

fn write_dir_contents(
    writer: &mut Writer<Vec<u8>>,
    tree: &Subtree,
    dir: u32,
) -> std::io::Result<()> {
    let node = &tree.dirs[dir as usize];
    for &d in &node.dirs {
        let child = &tree.dirs[d as usize];
        let mut elem = BytesStart::new("Directory");
        elem.push_attribute(("Name", child.name.name()));
        elem.push_attribute(("Date", child.mtime.to_string().as_str()));
        write_xml(writer, Event::Start(elem))?;
        write_dir_contents(writer, tree, d)?;
        write_xml(writer, Event::End(BytesEnd::new("Directory")))?;
    }
    for &f in &node.files {
        let file = &tree.files[f as usize];
        let mut elem = BytesStart::new("File");
        elem.push_attribute(("Name", file.name.name()));
        elem.push_attribute(("Size", file.size.to_string().as_str()));
        elem.push_attribute(("TTH", file.tth.to_base32().as_str()));
        elem.push_attribute(("Date", file.mtime.to_string().as_str()));
        write_xml(writer, Event::Empty(elem))?;
    }
    Ok(())
}

fn parse_cache(content: &str) -> Option<CachedRoot> {
    let mut reader = Reader::from_str(content);
    reader.trim_text(true);

    let mut out: Option<CachedRoot> = None;
    let mut dir_stack: Vec<u32> = Vec::new();
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf).ok()? {
            Event::Start(e) if e.name().as_ref() == b"ShareCache" => {
                let attrs = read_attrs(&e)?;
                let path = PathBuf::from(attrs_get(&attrs, "Path")?);
                let name = attrs_get(&attrs, "Name")?;
                let root_mtime: u64 = attrs_get(&attrs, "Date")?.parse().ok()?;
                out = Some(CachedRoot {
                    path,
                    root_mtime,
                    tree: Subtree::new(DualName::new(name), root_mtime),
                });
                dir_stack.push(Subtree::ROOT);
            }
            Event::Start(e) if e.name().as_ref() == b"Directory" => {
                let cached = out.as_mut()?;
                let attrs = read_attrs(&e)?;
                let name = attrs_get(&attrs, "Name")?;
                let mtime: u64 = attrs_get(&attrs, "Date")?.parse().ok()?;
                let parent = *dir_stack.last()?;
                let id = cached.tree.add_dir(parent, DualName::new(name), mtime);
                dir_stack.push(id);
            }
            Event::End(e) if e.name().as_ref() == b"Directory" => {
                dir_stack.pop()?;
            }
            Event::Empty(e) if e.name().as_ref() == b"File" => {
                let cached = out.as_mut()?;
                let attrs = read_attrs(&e)?;
                let name = attrs_get(&attrs, "Name")?;
                let size: i64 = attrs_get(&attrs, "Size")?.parse().ok()?;
                let tth: TthValue = attrs_get(&attrs, "TTH")?.parse().ok()?;
                let mtime: u64 = attrs_get(&attrs, "Date")?.parse().ok()?;
                let parent = *dir_stack.last()?;
                cached.tree.add_file(parent, DualName::new(name), size, mtime, tth);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    out
}

fn read_attrs(elem: &BytesStart<'_>) -> Option<Vec<(String, String)>> {
    let mut out = Vec::new();
    for attr in elem.attributes() {
        let attr = attr.ok()?;
        let key = String::from_utf8(attr.key.as_ref().to_vec()).ok()?;
        let value = attr.unescape_value().ok()?.into_owned();
        out.push((key, value));
    }
    Some(out)
}

fn attrs_get(attrs: &[(String, String)], key: &str) -> Option<String> {
    attrs
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::share::test_support::*;
    use slipstream_core::RefreshState;
    use std::collections::HashSet;
    use tempfile::tempdir;

    fn make_root(id: RootId, tree: Subtree) -> ShareRoot {
        ShareRoot {
            id,
            path: PathBuf::from("/data/music"),
            virtual_name: DualName::new("music"),
            profiles: HashSet::from([0u32]),
            incoming: false,
            refresh_state: RefreshState::Normal,
            last_refresh: 0,
            cache_dirty: true,
            tree,
        }
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempdir().unwrap();
        let cache = ShareCache::new(dir.path());

        let t1 = tth(1);
        let t2 = tth(2);
        let tree = subtree_with(
            "music",
            &[
                ("a", &[("song.mp3", 4096, t1)]),
                ("a/b", &[("Nested & Co.flac", 99, t2)]),
            ],
        );
        let root = make_root(3, tree);
        cache.save_root(&root).unwrap();

        let loaded = cache.load_root(3).unwrap();
        assert_eq!(loaded.path, PathBuf::from("/data/music"));

        let a = loaded.tree.find_child_dir(Subtree::ROOT, "a").unwrap();
        let song = loaded.tree.find_child_file(a, "song.mp3").unwrap();
        assert_eq!(loaded.tree.files[song as usize].size, 4096);
        assert_eq!(loaded.tree.files[song as usize].tth, t1);

        let b = loaded.tree.find_child_dir(a, "b").unwrap();
        let nested = loaded.tree.find_child_file(b, "nested & co.flac").unwrap();
        assert_eq!(loaded.tree.files[nested as usize].name.name(), "Nested & Co.flac");
        assert_eq!(loaded.tree.files[nested as usize].tth, t2);
    }

    #[test]
    fn test_load_missing() {
        let dir = tempdir().unwrap();
        let cache = ShareCache::new(dir.path());
        assert!(cache.load_root(42).is_none());
    }

    #[test]
    fn test_load_garbage_discards_file() {
        let dir = tempdir().unwrap();
        let cache = ShareCache::new(dir.path());
        std::fs::create_dir_all(dir.path().join(CACHE_DIR_NAME)).unwrap();
        let path = dir.path().join(CACHE_DIR_NAME).join("7.xml");
        std::fs::write(&path, "<ShareCache Version=\"1\"").unwrap();

        assert!(cache.load_root(7).is_none());
        assert!(!path.exists(), "garbage cache file is removed");
    }

    #[test]
    fn test_remove_root() {
        let dir = tempdir().unwrap();
        let cache = ShareCache::new(dir.path());
        let root = make_root(1, subtree_with("music", &[("", &[])]));
        cache.save_root(&root).unwrap();
        assert!(cache.load_root(1).is_some());

        cache.remove_root(1);
        assert!(cache.load_root(1).is_none());
    }
}
