//! ADC and local path handling
//!
//! ADC paths use `/` separators with a leading `/`; directory paths carry a
//! trailing `/`. NMDC uses `\` without the leading separator. Local paths are
//! handled as [`Path`]s and never leak into wire strings unconverted.

use std::path::Path;

use crate::ADC_SEPARATOR;

/// True for the ADC root path `/`
pub fn is_adc_root(adc_path: &str) -> bool {
    adc_path == "/"
}

/// True if the ADC path denotes a directory (trailing separator)
pub fn is_adc_directory(adc_path: &str) -> bool {
    adc_path.ends_with(ADC_SEPARATOR)
}

/// Split an ADC path into its components, rejecting malformed input.
///
/// Empty interior segments and `.`/`..` are refused; the wire side never has
/// a legitimate use for them and they must not reach the filesystem.
pub fn adc_segments(adc_path: &str) -> Option<Vec<&str>> {
    let trimmed = adc_path.strip_prefix(ADC_SEPARATOR)?;
    let trimmed = trimmed.strip_suffix(ADC_SEPARATOR).unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Some(Vec::new());
    }

    let mut segments = Vec::new();
    for segment in trimmed.split(ADC_SEPARATOR) {
        if segment.is_empty() || segment == "." || segment == ".." {
            return None;
        }
        segments.push(segment);
    }
    Some(segments)
}

/// File name component of an ADC file path
pub fn adc_file_name(adc_path: &str) -> &str {
    match adc_path.rfind(ADC_SEPARATOR) {
        Some(pos) => &adc_path[pos + 1..],
        None => adc_path,
    }
}

/// Convert an NMDC path (`dir\file`) to ADC form (`/dir/file`)
pub fn nmdc_to_adc(nmdc_path: &str) -> String {
    let mut out = String::with_capacity(nmdc_path.len() + 1);
    out.push(ADC_SEPARATOR);
    for (i, part) in nmdc_path.split('\\').enumerate() {
        if i > 0 {
            out.push(ADC_SEPARATOR);
        }
        out.push_str(part);
    }
    out
}

/// Convert an ADC path back to NMDC form
pub fn adc_to_nmdc(adc_path: &str) -> String {
    adc_path
        .trim_start_matches(ADC_SEPARATOR)
        .replace(ADC_SEPARATOR, "\\")
}

/// True if `parent` equals `child` or is one of its ancestors
pub fn is_parent_or_exact(parent: &Path, child: &Path) -> bool {
    child.starts_with(parent)
}

/// True if `parent` is a proper ancestor of `child`
pub fn is_parent(parent: &Path, child: &Path) -> bool {
    parent != child && child.starts_with(parent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_adc_segments() {
        assert_eq!(adc_segments("/"), Some(vec![]));
        assert_eq!(adc_segments("/music/a/song.mp3"), Some(vec!["music", "a", "song.mp3"]));
        assert_eq!(adc_segments("/music/a/"), Some(vec!["music", "a"]));
        assert_eq!(adc_segments("relative"), None);
        assert_eq!(adc_segments("/music//a"), None);
        assert_eq!(adc_segments("/music/../a"), None);
    }

    #[test]
    fn test_directory_detection() {
        assert!(is_adc_directory("/music/"));
        assert!(!is_adc_directory("/music/song.mp3"));
        assert!(is_adc_root("/"));
    }

    #[test]
    fn test_adc_file_name() {
        assert_eq!(adc_file_name("/music/a/song.mp3"), "song.mp3");
        assert_eq!(adc_file_name("song.mp3"), "song.mp3");
    }

    #[test]
    fn test_nmdc_conversion() {
        assert_eq!(nmdc_to_adc("music\\a\\song.mp3"), "/music/a/song.mp3");
        assert_eq!(adc_to_nmdc("/music/a/song.mp3"), "music\\a\\song.mp3");
    }

    #[test]
    fn test_ancestry() {
        let root = PathBuf::from("/data/music");
        assert!(is_parent_or_exact(&root, &root));
        assert!(is_parent_or_exact(&root, &root.join("a/b")));
        assert!(!is_parent(&root, &root));
        assert!(is_parent(&root, &root.join("a")));
        assert!(!is_parent_or_exact(&root, Path::new("/data/musical")));
    }
}
