//! Query execution against the share index
//!
//! TTH queries go straight to the multi-index. Everything else walks the
//! profile-visible forest recursively: include tokens may match anywhere
//! along the path from a root to a candidate, so a directory that matches
//! "2024" makes every file below it a candidate for the remaining tokens.
//! The bloom filter rejects queries whose tokens occur nowhere in the index
//! before any walking happens.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use slipstream_core::{text, ProfileToken, TthValue};

use crate::share::{FileRef, IndexInner, ShareIndex, ShareRoot, Subtree};

use super::query::SearchQuery;

/// Relevance of a token matched exactly between separators
const QUALITY_BOUNDARY: f64 = 1.0;
/// Token at the start of a segment but running into other characters
const QUALITY_SEGMENT_START: f64 = 0.6;
/// Token matched mid-word
const QUALITY_INTERIOR: f64 = 0.3;
/// Relevance lost per ancestry level that contributed a token
const DEPTH_PENALTY: f64 = 0.05;
/// Directories score slightly below files of equal fit
const DIRECTORY_BIAS: f64 = 0.98;

/// One search hit
#[derive(Clone, Debug)]
pub struct SearchResult {
    pub adc_path: String,
    pub name: String,
    pub size: i64,
    pub tth: Option<TthValue>,
    pub is_directory: bool,
    pub date: u64,
    pub relevance: f64,
}

#[derive(Default)]
struct Counters {
    total: AtomicU64,
    tth_direct: AtomicU64,
    recursive: AtomicU64,
    filtered: AtomicU64,
    elapsed_us: AtomicU64,
}

/// Executes queries against a share index
pub struct SearchMatcher {
    index: Arc<ShareIndex>,
    counters: Counters,
}

/// Per-token match bookkeeping carried down the recursion
#[derive(Clone, Copy, Debug)]
struct TokenState {
    matched: bool,
    quality: f64,
    /// recursion level the token matched at
    level: usize,
}

struct Candidate {
    adc_path: String,
    path_lower: String,
    name: String,
    size: i64,
    tth: Option<TthValue>,
    is_directory: bool,
    date: u64,
    relevance: f64,
}

impl SearchMatcher {
    pub fn new(index: Arc<ShareIndex>) -> Self {
        Self {
            index,
            counters: Counters::default(),
        }
    }

    /// Run a query for a set of profiles; results are ordered by relevance,
    /// ties broken by lowercase path
    pub fn search(
        &self,
        query: &SearchQuery,
        profiles: &HashSet<ProfileToken>,
    ) -> Vec<SearchResult> {
        let started = Instant::now();
        self.counters.total.fetch_add(1, Ordering::Relaxed);

        let results = if let Some(root) = &query.root {
            self.counters.tth_direct.fetch_add(1, Ordering::Relaxed);
            self.search_tth(root, profiles)
        } else if query.include.is_empty() {
            // zero include tokens can never complete a match
            Vec::new()
        } else {
            self.search_patterns(query, profiles)
        };

        self.counters
            .elapsed_us
            .fetch_add(started.elapsed().as_micros() as u64, Ordering::Relaxed);
        results
    }

    fn search_tth(
        &self,
        root: &TthValue,
        profiles: &HashSet<ProfileToken>,
    ) -> Vec<SearchResult> {
        let inner = self.index.inner.read();
        let Some(refs) = inner.tth_index.get(root) else {
            return Vec::new();
        };

        refs.iter()
            .filter(|fref| inner.root_visible(&inner.roots[&fref.root], profiles))
            .map(|&fref| {
                let file = inner.file(fref);
                SearchResult {
                    adc_path: inner.file_adc_path(fref),
                    name: file.name.name().to_string(),
                    size: file.size,
                    tth: Some(*root),
                    is_directory: false,
                    date: file.mtime,
                    relevance: 1.0,
                }
            })
            .collect()
    }

    fn search_patterns(
        &self,
        query: &SearchQuery,
        profiles: &HashSet<ProfileToken>,
    ) -> Vec<SearchResult> {
        let inner = self.index.inner.read();

        // bloom gate: every alphanumeric run of every include token must
        // occur somewhere in the index
        let pruned = query.include.patterns().iter().any(|pattern| {
            text::name_tokens(pattern.as_str()).any(|token| !inner.bloom.maybe_contains(token))
        });
        if pruned {
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            debug!("Search rejected by bloom filter");
            return Vec::new();
        }

        let blank = vec![
            TokenState {
                matched: false,
                quality: 0.0,
                level: 0,
            };
            query.include.len()
        ];

        let mut candidates = Vec::new();
        for root in inner.roots.values() {
            if candidates.len() >= query.max_results {
                break;
            }
            if !inner.root_visible(root, profiles) {
                continue;
            }
            self.match_directory(
                &inner,
                root,
                &root.tree,
                Subtree::ROOT,
                &blank,
                0,
                query,
                &mut candidates,
            );
        }
        drop(inner);

        if query.add_parents {
            candidates = parents_of(candidates);
        }

        candidates.sort_by(|a, b| {
            b.relevance
                .partial_cmp(&a.relevance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.path_lower.cmp(&b.path_lower))
        });
        candidates.truncate(query.max_results);
        candidates
            .into_iter()
            .map(|c| SearchResult {
                adc_path: c.adc_path,
                name: c.name,
                size: c.size,
                tth: c.tth,
                is_directory: c.is_directory,
                date: c.date,
                relevance: c.relevance,
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    fn match_directory(
        &self,
        inner: &IndexInner,
        root: &ShareRoot,
        tree: &Subtree,
        dir: u32,
        parent_state: &[TokenState],
        level: usize,
        query: &SearchQuery,
        out: &mut Vec<Candidate>,
    ) {
        if out.len() >= query.max_results {
            return;
        }

        let node = &tree.dirs[dir as usize];
        let name_lower = node.name.lower();

        // advance token state with this directory's name; a match here
        // replaces one inherited from an ancestor
        let mut state = parent_state.to_vec();
        for (i, pattern) in query.include.patterns().iter().enumerate() {
            if let Some(pos) = pattern.match_lower(name_lower, 0) {
                state[i] = TokenState {
                    matched: true,
                    quality: position_quality(name_lower, pos, pattern.len()),
                    level,
                };
            }
        }

        // the directory itself as a result
        if query.item_type.directories_allowed()
            && state.iter().all(|t| t.matched)
            && !query.is_excluded_lower(name_lower)
            && query.matches_date(node.mtime)
        {
            let (relevance, used_ancestors) = relevance_of(&state, level, true);
            if used_ancestors {
                self.counters.recursive.fetch_add(1, Ordering::Relaxed);
            }
            let parts = tree.dir_parts(dir);
            let mut adc_path = format!("/{}", root.virtual_name.name());
            for part in &parts {
                adc_path.push('/');
                adc_path.push_str(part);
            }
            adc_path.push('/');
            let (size, _) = tree.totals_under(dir);
            out.push(Candidate {
                path_lower: text::to_lower(&adc_path),
                adc_path,
                name: node.name.name().to_string(),
                size,
                tth: None,
                is_directory: true,
                date: node.mtime,
                relevance,
            });
            if out.len() >= query.max_results {
                return;
            }
        }

        // files at this level
        if query.item_type.files_allowed() {
            for &f in &node.files {
                if out.len() >= query.max_results {
                    return;
                }
                let file = &tree.files[f as usize];
                let fname_lower = file.name.lower();

                let mut file_state = state.clone();
                let mut complete = true;
                for (i, pattern) in query.include.patterns().iter().enumerate() {
                    match pattern.match_lower(fname_lower, 0) {
                        // a hit in the file name wins over an inherited one
                        Some(pos) => {
                            file_state[i] = TokenState {
                                matched: true,
                                quality: position_quality(fname_lower, pos, pattern.len()),
                                level: level + 1,
                            };
                        }
                        None if file_state[i].matched => {}
                        None => {
                            complete = false;
                            break;
                        }
                    }
                }
                if !complete
                    || query.is_excluded_lower(fname_lower)
                    || !query.matches_size(file.size)
                    || !query.matches_date(file.mtime)
                    || !query.matches_ext(fname_lower)
                {
                    continue;
                }

                let (relevance, used_ancestors) = relevance_of(&file_state, level + 1, false);
                if used_ancestors {
                    self.counters.recursive.fetch_add(1, Ordering::Relaxed);
                }

                let fref = FileRef {
                    root: root.id,
                    file: f,
                };
                let adc_path = inner.file_adc_path(fref);
                out.push(Candidate {
                    path_lower: text::to_lower(&adc_path),
                    adc_path,
                    name: file.name.name().to_string(),
                    size: file.size,
                    tth: Some(file.tth),
                    is_directory: false,
                    date: file.mtime,
                    relevance,
                });
            }
        }

        // descend
        for &d in &node.dirs {
            if out.len() >= query.max_results {
                return;
            }
            self.match_directory(inner, root, tree, d, &state, level + 1, query, out);
        }
    }

    /// Counters for `print_stats`-style reporting
    pub fn stats_report(&self) -> String {
        format!(
            "searches: {} total, {} tth-direct, {} recursive, {} bloom-filtered, {} ms matching",
            self.counters.total.load(Ordering::Relaxed),
            self.counters.tth_direct.load(Ordering::Relaxed),
            self.counters.recursive.load(Ordering::Relaxed),
            self.counters.filtered.load(Ordering::Relaxed),
            self.counters.elapsed_us.load(Ordering::Relaxed) / 1000,
        )
    }
}

/// Replace file hits by their parent directories, keeping the best
/// relevance per directory (`PA1` searches)
fn parents_of(candidates: Vec<Candidate>) -> Vec<Candidate> {
    let mut by_dir: std::collections::HashMap<String, Candidate> = std::collections::HashMap::new();

    for candidate in candidates {
        let entry = if candidate.is_directory {
            candidate
        } else {
            let parent_path = match candidate.adc_path.rfind('/') {
                Some(pos) => candidate.adc_path[..pos + 1].to_string(),
                None => continue,
            };
            let name = parent_path
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .unwrap_or_default()
                .to_string();
            Candidate {
                path_lower: text::to_lower(&parent_path),
                adc_path: parent_path,
                name,
                size: 0,
                tth: None,
                is_directory: true,
                date: candidate.date,
                relevance: candidate.relevance,
            }
        };

        match by_dir.entry(entry.path_lower.clone()) {
            std::collections::hash_map::Entry::Occupied(mut existing) => {
                if entry.relevance > existing.get().relevance {
                    existing.insert(entry);
                }
            }
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(entry);
            }
        }
    }

    by_dir.into_values().collect()
}

/// Quality of a match position within a name
fn position_quality(name_lower: &str, pos: usize, len: usize) -> f64 {
    let bytes = name_lower.as_bytes();
    let left_boundary = pos == 0 || !bytes[pos - 1].is_ascii_alphanumeric();
    let end = pos + len;
    let right_boundary = end >= bytes.len() || !bytes[end].is_ascii_alphanumeric();

    if left_boundary && right_boundary {
        QUALITY_BOUNDARY
    } else if left_boundary {
        QUALITY_SEGMENT_START
    } else {
        QUALITY_INTERIOR
    }
}

/// Combined relevance of a complete token state; also reports whether
/// ancestors contributed
fn relevance_of(state: &[TokenState], candidate_level: usize, is_directory: bool) -> (f64, bool) {
    debug_assert!(state.iter().all(|t| t.matched));
    if state.is_empty() {
        return (0.0, false);
    }

    let quality_sum: f64 = state.iter().map(|t| t.quality).sum();
    let mut score = quality_sum / state.len() as f64;

    let min_level = state.iter().map(|t| t.level).min().unwrap_or(candidate_level);
    let depth = candidate_level.saturating_sub(min_level);
    let used_ancestors = depth > 0;
    score -= depth as f64 * DEPTH_PENALTY;

    if is_directory {
        score *= DIRECTORY_BIAS;
    }
    (score.clamp(0.0, 1.0), used_ancestors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::query::{ItemType, SizeMode};
    use crate::share::test_support::*;
    use slipstream_core::SP_DEFAULT;

    fn profile_set() -> HashSet<ProfileToken> {
        HashSet::from([SP_DEFAULT])
    }

    fn quick(input: &str) -> SearchQuery {
        SearchQuery::from_quick_search(input, SizeMode::Any, 0, ItemType::Any, 10)
    }

    #[test]
    fn test_simple_file_match_scores_full() {
        let (index, _) = index_with_root(
            "docs",
            "/srv/docs",
            SP_DEFAULT,
            &[("", &[("Report 2024 Final.pdf", 1234, tth(1))])],
        );
        let matcher = SearchMatcher::new(Arc::new(index));

        let results = matcher.search(&quick("2024 pdf"), &profile_set());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "Report 2024 Final.pdf");
        assert_eq!(results[0].adc_path, "/docs/Report 2024 Final.pdf");
        assert!((results[0].relevance - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_exclusion_empties_results() {
        let (index, _) = index_with_root(
            "docs",
            "/srv/docs",
            SP_DEFAULT,
            &[("", &[("Report 2024 Final.pdf", 1234, tth(1))])],
        );
        let matcher = SearchMatcher::new(Arc::new(index));

        assert!(matcher.search(&quick("2024 -Final pdf"), &profile_set()).is_empty());
    }

    #[test]
    fn test_tokens_compose_across_path() {
        let (index, _) = index_with_root(
            "music",
            "/srv/music",
            SP_DEFAULT,
            &[("Albums 2024", &[("track01.mp3", 9000, tth(2))])],
        );
        let matcher = SearchMatcher::new(Arc::new(index));

        // "2024" matches the directory, "mp3" the file
        let results = matcher.search(&quick("2024 mp3"), &profile_set());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].adc_path, "/music/Albums 2024/track01.mp3");
        // ancestor contribution costs relevance
        assert!(results[0].relevance < 1.0);
        assert!(results[0].relevance >= 0.9);
    }

    #[test]
    fn test_zero_include_tokens_yield_nothing() {
        let (index, _) = index_with_root(
            "docs",
            "/srv/docs",
            SP_DEFAULT,
            &[("", &[("file.txt", 1, tth(3))])],
        );
        let matcher = SearchMatcher::new(Arc::new(index));
        assert!(matcher.search(&quick(""), &profile_set()).is_empty());
    }

    #[test]
    fn test_tth_direct_lookup() {
        let wanted = tth(4);
        let (index, _) = index_with_root(
            "docs",
            "/srv/docs",
            SP_DEFAULT,
            &[("", &[("a.bin", 10, wanted), ("b.bin", 20, tth(5))])],
        );
        let matcher = SearchMatcher::new(Arc::new(index));

        let results = matcher.search(&SearchQuery::from_tth(wanted), &profile_set());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "a.bin");
        assert_eq!(results[0].tth, Some(wanted));
    }

    #[test]
    fn test_bloom_prunes_absent_tokens() {
        let (index, _) = index_with_root(
            "docs",
            "/srv/docs",
            SP_DEFAULT,
            &[("", &[("report.pdf", 10, tth(6))])],
        );
        let matcher = SearchMatcher::new(Arc::new(index));

        assert!(matcher.search(&quick("zzqqxxyy"), &profile_set()).is_empty());
        assert!(matcher.stats_report().contains("1 bloom-filtered"));
    }

    #[test]
    fn test_size_filter() {
        let (index, _) = index_with_root(
            "docs",
            "/srv/docs",
            SP_DEFAULT,
            &[("", &[("big.iso", 5000, tth(7)), ("small.iso", 100, tth(8))])],
        );
        let matcher = SearchMatcher::new(Arc::new(index));

        let query =
            SearchQuery::from_quick_search("iso", SizeMode::AtLeast, 1000, ItemType::Any, 10);
        let results = matcher.search(&query, &profile_set());
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].name, "big.iso");
    }

    #[test]
    fn test_directory_results_and_bias() {
        let (index, _) = index_with_root(
            "stuff",
            "/srv/stuff",
            SP_DEFAULT,
            &[("backup", &[("backup.zip", 10, tth(9))])],
        );
        let matcher = SearchMatcher::new(Arc::new(index));

        let results = matcher.search(&quick("backup"), &profile_set());
        assert_eq!(results.len(), 2);
        // the file outranks the equally-matching directory
        assert!(!results[0].is_directory);
        assert!(results[1].is_directory);
        assert!(results[1].adc_path.ends_with('/'));
        assert!(results[0].relevance > results[1].relevance);
    }

    #[test]
    fn test_max_results_bound() {
        let files: Vec<(String, i64, TthValue)> = (0..30)
            .map(|i| (format!("match{i:02}.bin"), 10i64, tth(i as u8)))
            .collect();
        let file_refs: Vec<(&str, i64, TthValue)> =
            files.iter().map(|(n, s, t)| (n.as_str(), *s, *t)).collect();
        let (index, _) =
            index_with_root("docs", "/srv/docs", SP_DEFAULT, &[("", &file_refs)]);
        let matcher = SearchMatcher::new(Arc::new(index));

        let mut query = quick("match");
        query.max_results = 5;
        assert_eq!(matcher.search(&query, &profile_set()).len(), 5);
    }

    #[test]
    fn test_add_parents_collapses_to_directories() {
        let (index, _) = index_with_root(
            "music",
            "/srv/music",
            SP_DEFAULT,
            &[("album", &[("one.mp3", 1, tth(12)), ("two.mp3", 2, tth(13))])],
        );
        let matcher = SearchMatcher::new(Arc::new(index));

        let mut query = quick("mp3");
        query.add_parents = true;
        let results = matcher.search(&query, &profile_set());

        assert_eq!(results.len(), 1);
        assert!(results[0].is_directory);
        assert_eq!(results[0].adc_path, "/music/album/");
    }

    #[test]
    fn test_profile_visibility_respected() {
        let (index, _) = index_with_root(
            "private",
            "/srv/private",
            7,
            &[("", &[("secret.doc", 10, tth(11))])],
        );
        let matcher = SearchMatcher::new(Arc::new(index));

        assert!(matcher.search(&quick("secret"), &profile_set()).is_empty());
        let visible = matcher.search(&quick("secret"), &HashSet::from([7u32]));
        assert_eq!(visible.len(), 1);
    }
}
