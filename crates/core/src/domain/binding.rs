// Binding Domain Model - topic-exchange tag routing

use std::fmt;

/// Filter used when a binding does not specify one
pub const MATCH_ALL: &str = "#";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `*`: exactly one segment
    One,
    /// `#`: zero or more segments
    Many,
}

/// Compiled wildcard tag filter
///
/// Tags and filters are `.`-delimited. `*` matches exactly one segment and
/// `#` matches zero or more. The empty string has zero segments, so the empty
/// tag matches `#` (and the empty filter) but not `*`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagFilter {
    pattern: String,
    segments: Vec<Segment>,
}

impl TagFilter {
    pub fn new(pattern: impl Into<String>) -> Self {
        let pattern = pattern.into();
        let mut segments: Vec<Segment> = Vec::new();
        for word in split_segments(&pattern) {
            let segment = match word {
                "*" => Segment::One,
                "#" => Segment::Many,
                literal => Segment::Literal(literal.to_string()),
            };
            // `#.#` matches exactly what `#` matches
            if segment == Segment::Many && segments.last() == Some(&Segment::Many) {
                continue;
            }
            segments.push(segment);
        }
        Self { pattern, segments }
    }

    /// Absent filter defaults to `#`
    pub fn or_match_all(pattern: Option<&str>) -> Self {
        Self::new(pattern.unwrap_or(MATCH_ALL))
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Check whether `tag` is routed through this filter
    pub fn matches(&self, tag: &str) -> bool {
        let words: Vec<&str> = split_segments(tag).collect();
        let m = words.len();

        // reachable[j]: the first i filter segments can consume the first j words
        let mut reachable = vec![false; m + 1];
        reachable[0] = true;

        for segment in &self.segments {
            let mut next = vec![false; m + 1];
            match segment {
                Segment::Many => {
                    let mut seen = false;
                    for j in 0..=m {
                        seen |= reachable[j];
                        next[j] = seen;
                    }
                }
                Segment::One => {
                    for j in 1..=m {
                        next[j] = reachable[j - 1];
                    }
                }
                Segment::Literal(literal) => {
                    for j in 1..=m {
                        next[j] = reachable[j - 1] && words[j - 1] == literal.as_str();
                    }
                }
            }
            reachable = next;
        }

        reachable[m]
    }
}

impl Default for TagFilter {
    fn default() -> Self {
        Self::new(MATCH_ALL)
    }
}

impl fmt::Display for TagFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

fn split_segments(s: &str) -> impl Iterator<Item = &str> {
    // "" is zero segments, "a." is ["a", ""]
    let words = if s.is_empty() { None } else { Some(s.split('.')) };
    words.into_iter().flatten()
}

/// Binding of a queue to a source through a tag filter
#[derive(Debug, Clone)]
pub struct Binding {
    pub source: String,
    pub filter: TagFilter,
    pub worker_group: Option<String>,
}

impl Binding {
    pub fn new(
        source: impl Into<String>,
        filter: Option<&str>,
        worker_group: Option<String>,
    ) -> Self {
        Self {
            source: source.into(),
            filter: TagFilter::or_match_all(filter),
            worker_group,
        }
    }

    /// Work queues (worker group present) require acknowledgment
    pub fn requires_ack(&self) -> bool {
        self.worker_group.is_some()
    }

    pub fn binds(&self, source: &str, tag: &str) -> bool {
        self.source == source && self.filter.matches(tag)
    }

    /// Queue identity: `source^filter^worker`
    ///
    /// Listener bindings pass a freshly generated id as `worker` so that every
    /// listener gets its own broadcast queue.
    pub fn queue_id(&self, worker: &str) -> String {
        [self.source.as_str(), self.filter.pattern(), worker].join("^")
    }
}
