//! Constrained glob patterns.
//!
//! Both [`PathFilter`] and [`Cache::find_file`](crate::cache::Cache::find_file)
//! understand the same small pattern language:
//!
//! ```text
//! [^]<substring>[*<substring>][$]
//! ```
//!
//! - a leading `^` anchors the match at the start of the name
//! - a trailing `$` anchors the match at the end of the name
//! - at most one `*` splits the pattern into a head and a tail
//! - without anchors the pattern is a free substring search
//!
//! Patterns with more than one `*`, or with nothing to match, are rejected.

/// A parsed pattern borrowing from its source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pattern<'a> {
    anchor_start: bool,
    anchor_end: bool,
    head: &'a str,
    tail: Option<&'a str>,
}

impl<'a> Pattern<'a> {
    /// Parse a pattern, returning `None` when it is malformed.
    pub fn parse(pattern: &'a str) -> Option<Self> {
        let mut body = pattern;
        let anchor_start = body.starts_with('^');
        if anchor_start {
            body = &body[1..];
        }

        let anchor_end = body.ends_with('$');
        if anchor_end {
            body = &body[..body.len() - 1];
        }

        let (head, tail) = match body.find('*') {
            Some(pos) => (&body[..pos], Some(&body[pos + 1..])),
            None => (body, None),
        };

        if tail.is_some_and(|t| t.contains('*')) {
            return None;
        }

        if head.is_empty() && tail.is_none_or(str::is_empty) {
            return None;
        }

        Some(Self {
            anchor_start,
            anchor_end,
            head,
            tail,
        })
    }

    /// The literal prefix every match must start with, if the pattern is
    /// anchored at the start.
    ///
    /// Sorted searches use this to jump to the first candidate.
    pub fn anchored_prefix(&self) -> Option<&'a str> {
        self.anchor_start.then_some(self.head)
    }

    /// True when the pattern describes exactly one name.
    pub fn is_exact(&self) -> bool {
        self.anchor_start && self.anchor_end && self.tail.is_none()
    }

    pub fn matches(&self, name: &str) -> bool {
        let head = self.head;

        let Some(tail) = self.tail else {
            return match (self.anchor_start, self.anchor_end) {
                (true, true) => name == head,
                (true, false) => name.starts_with(head),
                (false, true) => name.ends_with(head),
                (false, false) => name.contains(head),
            };
        };

        if self.anchor_start {
            let Some(rest) = name.strip_prefix(head) else {
                return false;
            };

            if self.anchor_end {
                rest.ends_with(tail)
            } else {
                rest.contains(tail)
            }
        } else if self.anchor_end {
            name.strip_suffix(tail)
                .is_some_and(|rest| rest.contains(head))
        } else {
            name.find(head)
                .is_some_and(|pos| name[pos + head.len()..].contains(tail))
        }
    }
}

/// A set of patterns; a name passes when any pattern matches it.
///
/// An empty filter lets everything through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathFilter {
    filters: Vec<String>,
}

impl PathFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pattern. Empty strings are ignored.
    pub fn add_filter(&mut self, pattern: impl Into<String>) {
        let pattern = pattern.into();
        if !pattern.is_empty() {
            self.filters.push(pattern);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn is_filtered(&self, name: &str) -> bool {
        if self.filters.is_empty() {
            return true;
        }

        self.filters
            .iter()
            .filter_map(|f| Pattern::parse(f))
            .any(|p| p.matches(name))
    }
}

impl<S: Into<String>> FromIterator<S> for PathFilter {
    fn from_iter<T: IntoIterator<Item = S>>(iter: T) -> Self {
        let mut filter = Self::new();
        for item in iter {
            filter.add_filter(item);
        }
        filter
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_free_substring() {
        let p = Pattern::parse("foo").unwrap();
        assert!(p.matches("a/b/foo.txt"));
        assert!(!p.matches("a/c/bar.txt"));
    }

    #[test]
    fn test_anchors() {
        let p = Pattern::parse("^a/b/foo.txt$").unwrap();
        assert!(p.is_exact());
        assert!(p.matches("a/b/foo.txt"));
        assert!(!p.matches("a/b/foo.txt.bak"));

        let p = Pattern::parse("txt$").unwrap();
        assert!(p.matches("a/c/bar.txt"));
        assert!(!p.matches("a/c/bar.txt2"));

        let p = Pattern::parse("^a/").unwrap();
        assert_eq!(p.anchored_prefix(), Some("a/"));
        assert!(p.matches("a/c/bar.txt"));
        assert!(!p.matches("b/a/bar.txt"));
    }

    #[test]
    fn test_wildcard() {
        let p = Pattern::parse("foo*").unwrap();
        assert!(p.matches("a/b/foo.txt"));

        let p = Pattern::parse("*txt$").unwrap();
        assert!(p.matches("a/b/foo.txt"));
        assert!(p.matches("a/c/bar.txt"));

        let p = Pattern::parse("^a/*.txt$").unwrap();
        assert!(p.matches("a/c/bar.txt"));
        assert!(!p.matches("b/c/bar.txt"));

        let p = Pattern::parse("b*r").unwrap();
        assert!(p.matches("a/c/bar.txt"));
        assert!(!p.matches("rab"));
    }

    #[test]
    fn test_malformed() {
        assert!(Pattern::parse("").is_none());
        assert!(Pattern::parse("*").is_none());
        assert!(Pattern::parse("^$").is_none());
        assert!(Pattern::parse("a*b*c").is_none());
    }

    #[test]
    fn test_path_filter() {
        let mut filter = PathFilter::new();
        assert!(filter.is_filtered("anything"));

        filter.add_filter("");
        assert!(filter.is_empty());

        filter.add_filter(".txt$");
        filter.add_filter("^model");
        assert!(filter.is_filtered("notes.txt"));
        assert!(filter.is_filtered("model.bin"));
        assert!(!filter.is_filtered("texture.dds"));
    }
}
