//! Quick-search string patterns
//!
//! A shift-table substring search tuned for the matcher's access pattern:
//! patterns are compiled once per query and matched against many lowercase
//! names. The shift table is indexed by the byte just past the current
//! window, so mismatches skip ahead by up to `len + 1` positions.

/// One compiled search pattern; always lowercase
#[derive(Clone)]
pub struct QuickSearchPattern {
    pattern: String,
    delta1: [u16; 256],
}

impl QuickSearchPattern {
    pub fn new(pattern: &str) -> Self {
        let pattern = slipstream_core::text::to_lower(pattern);
        let mut delta1 = [0u16; 256];
        let len = pattern.len().min(u16::MAX as usize - 1);

        let shift = (len + 1) as u16;
        for entry in delta1.iter_mut() {
            *entry = shift;
        }
        for (i, &b) in pattern.as_bytes()[..len].iter().enumerate() {
            delta1[b as usize] = (len - i) as u16;
        }

        Self { pattern, delta1 }
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn len(&self) -> usize {
        self.pattern.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pattern.is_empty()
    }

    /// First occurrence at or after `start` in an already-lowercase haystack
    pub fn match_lower(&self, text: &str, start: usize) -> Option<usize> {
        let t = text.as_bytes();
        let p = self.pattern.as_bytes();
        let plen = p.len();

        if plen == 0 || start + plen > t.len() {
            return None;
        }

        let mut pos = start;
        while pos + plen <= t.len() {
            if &t[pos..pos + plen] == p {
                return Some(pos);
            }
            match t.get(pos + plen) {
                Some(&next) => pos += self.delta1[next as usize] as usize,
                None => return None,
            }
        }
        None
    }
}

impl std::fmt::Debug for QuickSearchPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "QuickSearchPattern({:?})", self.pattern)
    }
}

/// An ordered list of patterns matched together
#[derive(Clone, Debug, Default)]
pub struct StringSearch {
    patterns: Vec<QuickSearchPattern>,
}

impl StringSearch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pattern; empty strings are ignored
    pub fn add(&mut self, pattern: &str) {
        if !pattern.is_empty() {
            self.patterns.push(QuickSearchPattern::new(pattern));
        }
    }

    pub fn patterns(&self) -> &[QuickSearchPattern] {
        &self.patterns
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn clear(&mut self) {
        self.patterns.clear();
    }

    /// True when every pattern occurs in the lowercase text
    pub fn match_all_lower(&self, text: &str) -> bool {
        self.patterns.iter().all(|p| p.match_lower(text, 0).is_some())
    }

    /// True when any pattern occurs in the lowercase text
    pub fn match_any_lower(&self, text: &str) -> bool {
        self.patterns.iter().any(|p| p.match_lower(text, 0).is_some())
    }

    /// Match all patterns, recording the position each one matched at.
    ///
    /// Later patterns prefer positions after the previous pattern's match so
    /// hits read in query order where possible. With `resume_on_no_match`
    /// unset, the first failed pattern clears earlier positions and returns
    /// zero; otherwise matching continues and the match count is returned.
    pub fn match_positions_lower(
        &self,
        text: &str,
        resume_on_no_match: bool,
        results: &mut Vec<Option<usize>>,
    ) -> usize {
        results.resize(self.patterns.len(), None);
        let mut matches = 0;

        for (list_pos, pattern) in self.patterns.iter().enumerate() {
            let mut add_pos: Option<usize> = None;
            loop {
                let from = add_pos.map(|p| p + 1).unwrap_or(0);
                if let Some(cur) = pattern.match_lower(text, from) {
                    if list_pos > 0 {
                        if let Some(prev) = results[list_pos - 1] {
                            if prev > cur {
                                // keep searching for a hit after the
                                // previous pattern's position
                                add_pos = Some(cur);
                                continue;
                            }
                        }
                    }
                    add_pos = Some(cur);
                }

                if let Some(found) = add_pos {
                    matches += 1;
                    results[list_pos] = Some(found);
                } else if !resume_on_no_match {
                    for slot in results.iter_mut().take(list_pos) {
                        *slot = None;
                    }
                    return 0;
                } else {
                    results[list_pos] = None;
                }
                break;
            }
        }
        matches
    }
}
