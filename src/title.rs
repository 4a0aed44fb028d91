//! Title normalization and fuzzy duplicate detection.
//!
//! Journals regularly re-publish a preprint under a slightly edited title
//! (`"[PREPRINT] Foo bar"` → `"Foo Bar: Article"`). Titles are normalized and
//! compared with a character-level sequence-matching ratio so the second
//! appearance can be suppressed before it reaches a channel twice.

use regex::Regex;
use similar::TextDiff;
use std::sync::OnceLock;
use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Default similarity above which two titles are the same paper.
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.85;

/// Default number of prior matches at which a title counts as boilerplate.
pub const DEFAULT_BOILERPLATE_MATCH_LIMIT: usize = 6;

fn leading_annotations() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*(?:[\[(][^\])]*[\])]\s*)+").expect("leading annotation pattern")
    })
}

fn trailing_type_suffix() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?:[\s\-:|,.]*[\[(]?\s*\b(?:preprint|article|letter|review|editorial|erratum|correction|commentary|perspective|communication|report)s?\s*[\])]?)+[\s\-:|,.]*$",
        )
        .expect("trailing suffix pattern")
    })
}

/// Normalize a title for comparison.
///
/// ```rust
/// use paper_relay::title::normalize_title;
///
/// assert_eq!(
///     normalize_title("[PREPRINT] Deep  Learning for Protein Folding (Article)"),
///     "deep learning for protein folding"
/// );
/// ```
pub fn normalize_title(title: &str) -> String {
    let lowered = title.to_lowercase();
    let decomposed: String = lowered.nfkd().filter(|c| !is_combining_mark(*c)).collect();

    let without_prefix = leading_annotations().replace(&decomposed, "");
    let without_suffix = trailing_type_suffix().replace(&without_prefix, "");

    let kept: String = without_suffix
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || matches!(c, '-' | ':' | '.' | ','))
        .collect();

    kept.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Character-level sequence-matching ratio (`2·M / T`) of two strings.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    f64::from(TextDiff::from_chars(a, b).ratio())
}

/// Whether two titles name the same paper.
///
/// Both sides are normalized first. Identical normalized titles match
/// without computing a ratio; empty normalized titles never match.
pub fn similar_titles(a: &str, b: &str, threshold: f64) -> bool {
    similar_normalized(&normalize_title(a), &normalize_title(b), threshold)
}

fn similar_normalized(a: &str, b: &str, threshold: f64) -> bool {
    if a.is_empty() || b.is_empty() {
        return false;
    }
    if a == b {
        return true;
    }
    similarity_ratio(a, b) >= threshold
}

/// Outcome of checking one title against previously delivered titles.
#[derive(Debug, Clone, PartialEq)]
pub enum DuplicateVerdict {
    Unique,
    /// Matches an earlier item; carries that item's id.
    Duplicate { matched_id: i64 },
    /// Matches so many earlier items that it is a generic title
    /// ("Table of Contents", "Editorial Board") and must not be suppressed.
    Boilerplate { matches: usize },
}

/// Compares titles against a set of reference titles.
#[derive(Debug, Clone)]
pub struct DuplicateDetector {
    threshold: f64,
    boilerplate_limit: usize,
    reference: Vec<(i64, String)>,
}

impl DuplicateDetector {
    pub fn new(threshold: f64, boilerplate_limit: usize) -> Self {
        Self {
            threshold,
            boilerplate_limit,
            reference: Vec::new(),
        }
    }

    /// Add a previously delivered item.
    pub fn add_reference(&mut self, id: i64, title: &str) {
        let normalized = normalize_title(title);
        if !normalized.is_empty() {
            self.reference.push((id, normalized));
        }
    }

    pub fn reference_len(&self) -> usize {
        self.reference.len()
    }

    pub fn check(&self, title: &str) -> DuplicateVerdict {
        let normalized = normalize_title(title);
        let mut first_match = None;
        let mut matches = 0usize;

        for (id, reference) in &self.reference {
            if similar_normalized(&normalized, reference, self.threshold) {
                matches += 1;
                first_match.get_or_insert(*id);
                if matches >= self.boilerplate_limit {
                    return DuplicateVerdict::Boilerplate { matches };
                }
            }
        }

        match first_match {
            Some(matched_id) => DuplicateVerdict::Duplicate { matched_id },
            None => DuplicateVerdict::Unique,
        }
    }
}

impl Default for DuplicateDetector {
    fn default() -> Self {
        Self::new(DEFAULT_SIMILARITY_THRESHOLD, DEFAULT_BOILERPLATE_MATCH_LIMIT)
    }
}
