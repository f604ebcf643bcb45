//! Static analysis of data-condition regexes
//!
//! Before a regex is run against stream bytes the matcher wants three
//! cheap facts about it: the literal prefix every match starts with, the
//! literal suffix every match ends with, and the accepted match lengths.
//! All three come from the parsed HIR of the pattern; anchors and other
//! zero-width assertions stop literal collection so the prefix/suffix scan
//! optimizations never change match semantics.

use regex_syntax::hir::{Hir, HirKind};
use regex_syntax::ParserBuilder;

/// Match-length bounds of a pattern; `max` is `None` when unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcceptedLengths {
    pub min: usize,
    pub max: Option<usize>,
}

impl AcceptedLengths {
    /// True when every match has the same length.
    pub fn is_exact(&self) -> bool {
        self.max == Some(self.min)
    }
}

/// Pre-computed scan facts of one pattern.
#[derive(Debug, Clone, Default)]
pub struct RegexProfile {
    pub prefix: Vec<u8>,
    pub suffix: Vec<u8>,
    pub accepted_length: AcceptedLengths,
}

/// Analyze a pattern with the same syntax options the matcher compiles
/// with (byte-oriented, non-unicode).
pub fn profile(pattern: &str) -> Result<RegexProfile, regex_syntax::Error> {
    let hir = ParserBuilder::new()
        .unicode(false)
        .utf8(false)
        .build()
        .parse(pattern)?;
    let accepted_length = AcceptedLengths {
        min: hir.properties().minimum_len().unwrap_or(0),
        max: hir.properties().maximum_len(),
    };
    let (prefix, complete) = literal_prefix(&hir);
    let profile = if complete {
        // the pattern is one fixed literal
        RegexProfile {
            suffix: prefix.clone(),
            prefix,
            accepted_length: AcceptedLengths {
                min: accepted_length.min,
                max: Some(accepted_length.min),
            },
        }
    } else {
        RegexProfile {
            prefix,
            suffix: literal_suffix(&hir),
            accepted_length,
        }
    };
    Ok(profile)
}

/// Literal bytes every match must start with, plus whether the literal is
/// the entire pattern.
fn literal_prefix(hir: &Hir) -> (Vec<u8>, bool) {
    match hir.kind() {
        HirKind::Empty => (Vec::new(), true),
        HirKind::Literal(lit) => (lit.0.to_vec(), true),
        HirKind::Capture(capture) => literal_prefix(&capture.sub),
        HirKind::Concat(parts) => {
            let mut out = Vec::new();
            for part in parts {
                let (bytes, complete) = literal_prefix(part);
                out.extend(bytes);
                if !complete {
                    return (out, false);
                }
            }
            (out, true)
        }
        _ => (Vec::new(), false),
    }
}

/// Literal bytes every match must end with.
fn literal_suffix(hir: &Hir) -> Vec<u8> {
    match hir.kind() {
        HirKind::Literal(lit) => lit.0.to_vec(),
        HirKind::Capture(capture) => literal_suffix(&capture.sub),
        HirKind::Concat(parts) => {
            let mut out = Vec::new();
            for part in parts.iter().rev() {
                let (bytes, complete) = literal_prefix(part);
                if complete {
                    let mut prefixed = bytes;
                    prefixed.extend(out);
                    out = prefixed;
                    continue;
                }
                let mut suffixed = literal_suffix(part);
                suffixed.extend(out);
                return suffixed;
            }
            out
        }
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pure_literal() {
        let p = profile("abc").unwrap();
        assert_eq!(p.prefix, b"abc");
        assert_eq!(p.suffix, b"abc");
        assert_eq!(p.accepted_length, AcceptedLengths { min: 3, max: Some(3) });
        assert!(p.accepted_length.is_exact());
    }

    #[test]
    fn test_prefix_and_suffix_around_class() {
        let p = profile("user=\\w+;end").unwrap();
        assert_eq!(p.prefix, b"user=");
        assert_eq!(p.suffix, b";end");
        assert_eq!(p.accepted_length.min, 10);
        assert!(p.accepted_length.max.is_none());
    }

    #[test]
    fn test_anchored_pattern_has_no_prefix() {
        // prefix scanning would move the anchor past skipped bytes, so a
        // leading anchor yields no prefix; the trailing literal is still a
        // valid suffix (truncation keeps offset zero intact)
        let p = profile("^ERROR").unwrap();
        assert!(p.prefix.is_empty());
        assert_eq!(p.suffix, b"ERROR");
        assert_eq!(p.accepted_length.min, 5);
    }

    #[test]
    fn test_alternation_has_no_literals() {
        let p = profile("foo|longer").unwrap();
        assert!(p.prefix.is_empty());
        assert!(p.suffix.is_empty());
        assert_eq!(p.accepted_length.min, 3);
        assert_eq!(p.accepted_length.max, Some(6));
    }

    #[test]
    fn test_capture_is_transparent() {
        let p = profile("(abc)def").unwrap();
        assert_eq!(p.prefix, b"abcdef");
        assert!(p.accepted_length.is_exact());
    }

    #[test]
    fn test_fixed_length_with_suffix_only() {
        let p = profile("..=end").unwrap();
        assert!(p.prefix.is_empty());
        assert_eq!(p.suffix, b"=end");
        assert_eq!(p.accepted_length, AcceptedLengths { min: 6, max: Some(6) });
    }
}
