use std::sync::Arc;

use itertools::{EitherOrBoth, Itertools};
use serde::Deserialize;
use similar::{ChangeTag, TextDiff};

use crate::core::traits::comparator::Comparator;

/// Ignores trailing whitespace on each line and trailing blank lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrailingWhitespace;

impl Comparator for TrailingWhitespace {
    fn matches(&self, expected: &str, actual: &str) -> bool {
        self.normalized_lines(expected)
            .into_iter()
            .zip_longest(self.normalized_lines(actual))
            .all(|pair| matches!(pair, EitherOrBoth::Both(e, a) if e == a))
    }

    fn normalized_lines<'a>(&self, text: &'a str) -> Vec<&'a str> {
        text.trim_end().lines().map(str::trim_end).collect()
    }
}

/// Byte-exact comparison.
#[derive(Debug, Clone, Copy, Default)]
pub struct Exact;

impl Comparator for Exact {
    fn matches(&self, expected: &str, actual: &str) -> bool {
        expected == actual
    }
}

/// Compares whitespace-separated token sequences; line structure is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tokens;

impl Comparator for Tokens {
    fn matches(&self, expected: &str, actual: &str) -> bool {
        expected.split_whitespace().eq(actual.split_whitespace())
    }

    fn normalized_lines<'a>(&self, text: &'a str) -> Vec<&'a str> {
        text.lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ComparatorKind {
    #[default]
    TrailingWhitespace,
    Exact,
    Tokens,
}

impl ComparatorKind {
    pub fn build(self) -> Arc<dyn Comparator> {
        match self {
            Self::TrailingWhitespace => Arc::new(TrailingWhitespace),
            Self::Exact => Arc::new(Exact),
            Self::Tokens => Arc::new(Tokens),
        }
    }
}

const DIFF_EXCERPT_LINES: usize = 20;

/// Unified-style excerpt of how `actual` departs from `expected`, limited to
/// the first few changed or context lines.
pub fn diff_excerpt(comparator: &dyn Comparator, expected: &str, actual: &str) -> String {
    let expected = comparator.normalized_lines(expected);
    let actual = comparator.normalized_lines(actual);
    let diff = TextDiff::from_slices(&expected, &actual);

    let mut lines = Vec::new();
    let mut truncated = false;
    for group in diff.grouped_ops(1) {
        for op in group {
            for change in diff.iter_changes(&op) {
                if lines.len() == DIFF_EXCERPT_LINES {
                    truncated = true;
                    break;
                }
                let sign = match change.tag() {
                    ChangeTag::Delete => '-',
                    ChangeTag::Insert => '+',
                    ChangeTag::Equal => ' ',
                };
                lines.push(format!("{sign}{}", change.value()));
            }
        }
    }
    if truncated {
        lines.push("...".to_string());
    }
    lines.join("\n")
}
