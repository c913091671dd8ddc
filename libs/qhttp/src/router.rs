use std::collections::HashMap;

use crate::Error;

/// One element of a route pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `:name` capture.
    Param(String),
}

/// A parsed route pattern: literal segments, `:name` captures and an
/// optional trailing `/*` wildcard.
#[derive(Debug, Clone)]
pub struct Pattern {
    segments: Vec<Segment>,
    wildcard: bool,
}

impl Pattern {
    pub fn parse(pattern: &str) -> Result<Self, Error> {
        if !pattern.starts_with('/') {
            return Err(Error::Pattern(pattern.to_owned()));
        }
        let mut segments = Vec::new();
        let mut wildcard = false;
        for seg in pattern[1..].split('/') {
            if wildcard {
                // Nothing may follow the wildcard.
                return Err(Error::Pattern(pattern.to_owned()));
            }
            if seg.is_empty() {
                // Matching normalizes empty segments away; patterns
                // treat them the same, so "/a/" matches "/a".
                continue;
            }
            if seg == "*" {
                wildcard = true;
            } else if let Some(name) = seg.strip_prefix(':') {
                if name.is_empty() {
                    return Err(Error::Pattern(pattern.to_owned()));
                }
                segments.push(Segment::Param(name.to_owned()));
            } else {
                segments.push(Segment::Literal(seg.to_owned()));
            }
        }
        Ok(Self { segments, wildcard })
    }

    /// Match normalized path segments against the pattern, returning the
    /// captured parameters. A wildcard pattern also captures the remainder
    /// of the path under the `*` key.
    pub fn matches(&self, path: &[String]) -> Option<HashMap<String, String>> {
        if self.wildcard {
            if path.len() < self.segments.len() {
                return None;
            }
        } else if path.len() != self.segments.len() {
            return None;
        }
        let mut params = HashMap::new();
        for (segment, value) in self.segments.iter().zip(path.iter()) {
            match segment {
                Segment::Literal(lit) => {
                    if lit != value {
                        return None;
                    }
                }
                Segment::Param(name) => {
                    params.insert(name.clone(), value.clone());
                }
            }
        }
        if self.wildcard {
            params.insert("*".to_owned(), path[self.segments.len()..].join("/"));
        }
        Some(params)
    }
}

/// Outcome of [`normalize_path`].
pub enum NormalizedPath {
    Segments(Vec<String>),
    /// A `..` sequence tried to climb above the root.
    EscapesRoot,
    /// The decoded path carries a NUL byte.
    Malformed,
}

/// Percent-decode the raw target path and remove `.` and `..` segments.
/// Decoding happens per segment so an encoded slash cannot introduce new
/// separators.
pub fn normalize_path(raw_path: &str) -> NormalizedPath {
    let mut segments: Vec<String> = Vec::new();
    for seg in raw_path.split('/') {
        if seg.is_empty() || seg == "." {
            continue;
        }
        let decoded = match urlencoding::decode(seg) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => return NormalizedPath::Malformed,
        };
        if decoded.contains('\0') {
            return NormalizedPath::Malformed;
        }
        if decoded == ".." {
            if segments.pop().is_none() {
                return NormalizedPath::EscapesRoot;
            }
        } else if decoded == "." {
            continue;
        } else {
            segments.push(decoded);
        }
    }
    NormalizedPath::Segments(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segs(path: &str) -> Vec<String> {
        match normalize_path(path) {
            NormalizedPath::Segments(s) => s,
            _ => panic!("path '{path}' did not normalize"),
        }
    }

    #[test]
    fn literal_and_param_patterns() {
        let pattern = Pattern::parse("/ingest/table/:database/:table").unwrap();
        let params = pattern
            .matches(&segs("/ingest/table/user_demo/t1"))
            .unwrap();
        assert_eq!(params["database"], "user_demo");
        assert_eq!(params["table"], "t1");
        assert!(pattern.matches(&segs("/ingest/table/user_demo")).is_none());
        assert!(pattern
            .matches(&segs("/ingest/chunk/user_demo/t1"))
            .is_none());
    }

    #[test]
    fn wildcard_patterns() {
        let pattern = Pattern::parse("/www/*").unwrap();
        let params = pattern.matches(&segs("/www/css/style.css")).unwrap();
        assert_eq!(params["*"], "css/style.css");
        assert_eq!(pattern.matches(&segs("/www")).unwrap()["*"], "");
        assert!(pattern.matches(&segs("/api/css")).is_none());
    }

    #[test]
    fn invalid_patterns_are_rejected() {
        assert!(Pattern::parse("no-leading-slash").is_err());
        assert!(Pattern::parse("/a/*/b").is_err());
        assert!(Pattern::parse("/a/:").is_err());
    }

    #[test]
    fn normalization_removes_dot_segments() {
        assert_eq!(segs("/a/./b//c"), ["a", "b", "c"]);
        assert_eq!(segs("/a/b/../c"), ["a", "c"]);
        assert!(matches!(
            normalize_path("/a/../../b"),
            NormalizedPath::EscapesRoot
        ));
        assert!(matches!(
            normalize_path("/%2e%2e/etc/passwd"),
            NormalizedPath::EscapesRoot
        ));
        assert!(matches!(
            normalize_path("/a/%00"),
            NormalizedPath::Malformed
        ));
    }

    #[test]
    fn percent_decoding_is_applied_before_matching() {
        let pattern = Pattern::parse("/export/:database/:table").unwrap();
        let params = pattern
            .matches(&segs("/export/user%5Fdemo/t%31"))
            .unwrap();
        assert_eq!(params["database"], "user_demo");
        assert_eq!(params["table"], "t1");
    }
}
