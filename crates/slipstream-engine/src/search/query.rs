//! Search query parsing
//!
//! Queries arrive in two shapes: free-text quick searches (whitespace
//! tokens, `-` prefix excludes, optional size/type filters) and pre-split
//! ADC parameter lists. Both compile to the same [`SearchQuery`] the
//! matcher executes.

use slipstream_core::{text, TthValue};

use super::pattern::StringSearch;

/// What kind of items a query targets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ItemType {
    #[default]
    Any,
    File,
    Directory,
    Audio,
    Compressed,
    Document,
    Executable,
    Picture,
    Video,
}

impl ItemType {
    /// Extension class for NMDC-style type filters
    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            ItemType::Audio => &[
                "aac", "ac3", "aif", "ape", "au", "flac", "it", "m4a", "mid", "mka", "mod",
                "mp1", "mp2", "mp3", "mpc", "ogg", "opus", "ra", "s3m", "sid", "wav", "wma",
                "xm",
            ],
            ItemType::Compressed => &[
                "7z", "ace", "arj", "bz2", "gz", "lha", "lzh", "rar", "tar", "z", "zip",
            ],
            ItemType::Document => &[
                "doc", "docx", "htm", "html", "nfo", "odf", "odp", "ods", "odt", "pdf",
                "ppt", "pptx", "rtf", "txt", "xls", "xlsx", "xml",
            ],
            ItemType::Executable => &[
                "app", "bat", "cmd", "com", "dll", "exe", "jar", "msi", "ps1", "vbs", "wsf",
            ],
            ItemType::Picture => &[
                "bmp", "gif", "ico", "jpeg", "jpg", "png", "psd", "raw", "tif", "tiff",
                "webp",
            ],
            ItemType::Video => &[
                "3gp", "asf", "avi", "divx", "flv", "mkv", "mov", "mp4", "mpeg", "mpg",
                "ogm", "vob", "webm", "wmv",
            ],
            _ => &[],
        }
    }

    pub fn directories_allowed(&self) -> bool {
        matches!(self, ItemType::Any | ItemType::Directory)
    }

    pub fn files_allowed(&self) -> bool {
        !matches!(self, ItemType::Directory)
    }
}

/// NMDC size bound direction
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SizeMode {
    #[default]
    Any,
    AtLeast,
    AtMost,
}

/// Default cap on returned results
pub const DEFAULT_MAX_RESULTS: usize = 10;

/// A compiled search
#[derive(Clone, Debug, Default)]
pub struct SearchQuery {
    pub include: StringSearch,
    pub exclude: StringSearch,
    /// Acceptable extensions (lowercase, no dot); empty = all
    pub ext: Vec<String>,
    /// Refused extensions
    pub no_ext: Vec<String>,
    /// Minimum size (inclusive)
    pub gt: i64,
    /// Maximum size (inclusive)
    pub lt: i64,
    pub min_date: u64,
    pub max_date: u64,
    /// Exact content lookup; bypasses string matching entirely
    pub root: Option<TthValue>,
    pub item_type: ItemType,
    pub max_results: usize,
    pub add_parents: bool,
}

impl SearchQuery {
    fn empty() -> Self {
        Self {
            lt: i64::MAX,
            max_date: u64::MAX,
            max_results: DEFAULT_MAX_RESULTS,
            ..Self::default()
        }
    }

    /// Exact TTH lookup
    pub fn from_tth(root: TthValue) -> Self {
        Self {
            root: Some(root),
            ..Self::empty()
        }
    }

    /// Tokenize a free-text search string, honoring double quotes
    pub fn parse_search_string(input: &str) -> Vec<String> {
        let mut tokens = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;

        for c in input.chars() {
            match c {
                '"' => {
                    if in_quotes && !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                    in_quotes = !in_quotes;
                }
                c if c.is_whitespace() && !in_quotes => {
                    if !current.is_empty() {
                        tokens.push(std::mem::take(&mut current));
                    }
                }
                c => current.push(c),
            }
        }
        if !current.is_empty() {
            tokens.push(current);
        }
        tokens
    }

    /// Build from an NMDC-style quick search
    pub fn from_quick_search(
        input: &str,
        size_mode: SizeMode,
        size: i64,
        item_type: ItemType,
        max_results: usize,
    ) -> Self {
        let mut query = Self::empty();
        query.item_type = item_type;
        query.max_results = max_results.max(1);

        match size_mode {
            SizeMode::AtLeast if size > 0 => query.gt = size,
            SizeMode::AtMost if size > 0 => query.lt = size,
            _ => {}
        }

        for token in Self::parse_search_string(input) {
            if let Some(excluded) = token.strip_prefix('-') {
                if !excluded.is_empty() {
                    query.exclude.add(excluded);
                }
            } else {
                query.include.add(&token);
            }
        }

        for ext in item_type.extensions() {
            query.ext.push((*ext).to_string());
        }
        query
    }

    /// Build from pre-split ADC search parameters (`ANfoo`, `GE1024`, ...)
    pub fn from_adc_params(params: &[String], max_results_cap: usize) -> Self {
        let mut query = Self::empty();
        query.max_results = max_results_cap.max(1);

        for param in params {
            if param.len() < 2 {
                continue;
            }
            let (key, value) = param.split_at(2);
            match key {
                "AN" => query.include.add(value),
                "NO" => query.exclude.add(value),
                "EX" => query.ext.push(text::to_lower(value)),
                "GR" => {
                    // grouped extension classes, comma-separated
                    for group in value.split(',') {
                        let item_type = adc_group_type(group);
                        for ext in item_type.extensions() {
                            query.ext.push((*ext).to_string());
                        }
                    }
                }
                "RX" => query.no_ext.push(text::to_lower(value)),
                "GE" => query.gt = value.parse().unwrap_or(0),
                "LE" => query.lt = value.parse().unwrap_or(i64::MAX),
                "DG" => query.min_date = value.parse().unwrap_or(0),
                "DL" => query.max_date = value.parse().unwrap_or(u64::MAX),
                "TR" => query.root = value.parse().ok(),
                "TY" => {
                    query.item_type = match value {
                        "1" => ItemType::File,
                        "2" => ItemType::Directory,
                        _ => ItemType::Any,
                    }
                }
                "MR" => {
                    let wanted: usize = value.parse().unwrap_or(query.max_results);
                    query.max_results = wanted.clamp(1, max_results_cap.max(1));
                }
                "PA" => query.add_parents = value == "1",
                _ => {}
            }
        }
        query
    }

    /// Serialize back to ADC parameters; `parse(serialize(q))` round-trips
    pub fn to_adc_params(&self) -> Vec<String> {
        let mut out = Vec::new();
        for pattern in self.include.patterns() {
            out.push(format!("AN{}", pattern.as_str()));
        }
        for pattern in self.exclude.patterns() {
            out.push(format!("NO{}", pattern.as_str()));
        }
        for ext in &self.ext {
            out.push(format!("EX{ext}"));
        }
        for ext in &self.no_ext {
            out.push(format!("RX{ext}"));
        }
        if self.gt > 0 {
            out.push(format!("GE{}", self.gt));
        }
        if self.lt != i64::MAX {
            out.push(format!("LE{}", self.lt));
        }
        if self.min_date > 0 {
            out.push(format!("DG{}", self.min_date));
        }
        if self.max_date != u64::MAX {
            out.push(format!("DL{}", self.max_date));
        }
        if let Some(root) = &self.root {
            out.push(format!("TR{root}"));
        }
        match self.item_type {
            ItemType::File => out.push("TY1".into()),
            ItemType::Directory => out.push("TY2".into()),
            _ => {}
        }
        if self.add_parents {
            out.push("PA1".into());
        }
        out
    }

    pub fn matches_size(&self, size: i64) -> bool {
        size >= self.gt && size <= self.lt
    }

    pub fn matches_date(&self, date: u64) -> bool {
        date == 0 || (date >= self.min_date && date <= self.max_date)
    }

    /// Extension filters against a lowercase file name
    pub fn matches_ext(&self, name_lower: &str) -> bool {
        let ext = text::file_extension(name_lower);
        if let Some(ext) = ext {
            if self.no_ext.iter().any(|e| e == ext) {
                return false;
            }
            if self.ext.is_empty() {
                return true;
            }
            self.ext.iter().any(|e| e == ext)
        } else {
            self.ext.is_empty()
        }
    }

    pub fn is_excluded_lower(&self, name_lower: &str) -> bool {
        self.exclude.match_any_lower(name_lower)
    }
}

fn adc_group_type(group: &str) -> ItemType {
    match group {
        "audio" => ItemType::Audio,
        "compressed" => ItemType::Compressed,
        "document" => ItemType::Document,
        "executable" => ItemType::Executable,
        "picture" => ItemType::Picture,
        "video" => ItemType::Video,
        _ => ItemType::Any,
    }
}
