//! Destination wildcard patterns
//!
//! Destination names are `.`-separated segments. In a pattern, `*` matches
//! exactly one segment and `>` matches one or more trailing segments, so
//! `Orders.>` matches `Orders.EU` and `Orders.EU.Retail` but not `Orders`.

use std::{cmp::Ordering, fmt, str::FromStr};

use ahash::AHashMap;

use crate::error::PatternError;

const SEPARATOR: char = '.';
const ANY: &str = "*";
const REST: &str = ">";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    Literal(String),
    /// `*`
    Any,
    /// `>`
    Rest,
}

/// A parsed destination pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DestinationPattern {
    raw: String,
    segments: Vec<Segment>,
}

/// How specific a pattern is; greater is more specific.
///
/// More literal segments win, then fewer `>`, then fewer `*`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Specificity {
    literals: usize,
    rests: usize,
    anys: usize,
}

impl Ord for Specificity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.literals
            .cmp(&other.literals)
            .then(other.rests.cmp(&self.rests))
            .then(other.anys.cmp(&self.anys))
    }
}

impl PartialOrd for Specificity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl DestinationPattern {
    /// # Errors
    /// If the pattern is empty, has an empty segment, or has `>` anywhere but last
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        if pattern.is_empty() {
            return Err(PatternError::Empty);
        }

        let parts: Vec<&str> = pattern.split(SEPARATOR).collect();
        let last = parts.len() - 1;

        let segments = parts
            .iter()
            .enumerate()
            .map(|(position, part)| match *part {
                "" => Err(PatternError::EmptySegment(pattern.to_string())),
                REST if position != last => Err(PatternError::RestNotLast(pattern.to_string())),
                REST => Ok(Segment::Rest),
                ANY => Ok(Segment::Any),
                literal => Ok(Segment::Literal(literal.to_string())),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            raw: pattern.to_string(),
            segments,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    #[must_use]
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    #[must_use]
    pub fn is_literal(&self) -> bool {
        self.segments
            .iter()
            .all(|segment| matches!(segment, Segment::Literal(_)))
    }

    #[must_use]
    pub fn specificity(&self) -> Specificity {
        self.segments.iter().fold(
            Specificity {
                literals: 0,
                rests: 0,
                anys: 0,
            },
            |mut acc, segment| {
                match segment {
                    Segment::Literal(_) => acc.literals += 1,
                    Segment::Any => acc.anys += 1,
                    Segment::Rest => acc.rests += 1,
                }
                acc
            },
        )
    }

    /// Match a single destination name without going through a trie.
    #[must_use]
    pub fn matches(&self, name: &str) -> bool {
        let parts: Vec<&str> = name.split(SEPARATOR).collect();
        let mut parts = parts.as_slice();

        for segment in &self.segments {
            match segment {
                Segment::Rest => return !parts.is_empty(),
                Segment::Any => {}
                Segment::Literal(literal) => {
                    if parts.first() != Some(&literal.as_str()) {
                        return false;
                    }
                }
            }

            let Some((_, rest)) = parts.split_first() else {
                return false;
            };
            parts = rest;
        }

        parts.is_empty()
    }
}

impl FromStr for DestinationPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for DestinationPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Segment trie over registered patterns.
///
/// Values are indices into the owner's entry list; the owner picks the most
/// specific candidate.
#[derive(Debug, Clone, Default)]
pub(crate) struct PatternTrie {
    root: Node,
}

#[derive(Debug, Clone, Default)]
struct Node {
    literal: AHashMap<String, Node>,
    any: Option<Box<Node>>,
    /// Patterns ending exactly here.
    terminal: Vec<usize>,
    /// Patterns ending in `>` here.
    rest: Vec<usize>,
}

impl PatternTrie {
    pub(crate) fn insert(&mut self, pattern: &DestinationPattern, index: usize) {
        let mut node = &mut self.root;

        for segment in pattern.segments() {
            node = match segment {
                Segment::Literal(literal) => node.literal.entry(literal.clone()).or_default(),
                Segment::Any => node.any.get_or_insert_with(Box::default).as_mut(),
                Segment::Rest => {
                    node.rest.push(index);
                    return;
                }
            };
        }

        node.terminal.push(index);
    }

    /// Indices of every pattern matching `name`, in no particular order.
    pub(crate) fn candidates(&self, name: &str) -> Vec<usize> {
        let parts: Vec<&str> = name.split(SEPARATOR).collect();
        let mut found = Vec::new();
        Self::collect(&self.root, &parts, &mut found);
        found
    }

    fn collect(node: &Node, parts: &[&str], found: &mut Vec<usize>) {
        let Some((head, tail)) = parts.split_first() else {
            found.extend_from_slice(&node.terminal);
            return;
        };

        found.extend_from_slice(&node.rest);

        if let Some(child) = node.literal.get(*head) {
            Self::collect(child, tail, found);
        }

        if let Some(child) = &node.any {
            Self::collect(child, tail, found);
        }
    }
}
