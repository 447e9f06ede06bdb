//! SFV sidecar files
//!
//! An `.sfv` file lists `<filename> <crc32-hex>` pairs for its sibling
//! files. When present, the hasher verifies the computed CRC32 against the
//! listed value and fails the file on mismatch. Lines starting with `;` are
//! comments; the checksum is the last whitespace-separated token so names
//! with spaces parse correctly.

use std::collections::HashMap;
use std::path::Path;

use tracing::debug;

use slipstream_core::text;

/// CRC expectations for one directory, keyed by lowercase file name
#[derive(Default)]
pub struct SfvReader {
    entries: HashMap<String, u32>,
}

impl SfvReader {
    /// Load every `.sfv` file in a directory; unreadable or malformed
    /// content is skipped, never fatal
    pub fn load(dir: &Path) -> Self {
        let mut entries = HashMap::new();

        let Ok(listing) = std::fs::read_dir(dir) else {
            return Self { entries };
        };

        for entry in listing.flatten() {
            let path = entry.path();
            let is_sfv = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case("sfv"));
            if !is_sfv {
                continue;
            }

            match std::fs::read_to_string(&path) {
                Ok(content) => parse_sfv(&content, &mut entries),
                Err(e) => debug!("Could not read SFV file {:?}: {}", path, e),
            }
        }

        if !entries.is_empty() {
            debug!("Loaded {} SFV entries from {:?}", entries.len(), dir);
        }
        Self { entries }
    }

    /// Expected CRC32 for a file name, if listed
    pub fn crc_for(&self, file_name: &str) -> Option<u32> {
        self.entries.get(&text::to_lower(file_name)).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_sfv(content: &str, entries: &mut HashMap<String, u32>) {
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') {
            continue;
        }

        let Some(split) = line.rfind(char::is_whitespace) else {
            continue;
        };
        let (name, crc_hex) = line.split_at(split);
        let Ok(crc) = u32::from_str_radix(crc_hex.trim(), 16) else {
            continue;
        };

        entries.insert(text::to_lower(name.trim()), crc);
    }
}
