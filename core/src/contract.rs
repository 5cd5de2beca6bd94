//! Declarative effect contracts.
//!
//! A contract states what a capability *might* do; enforcement lives inside
//! the capability itself. Contracts are used for display, composition, and
//! the derivation subset check.
//!
//! Resource patterns have the form `"<class>:<glob>"` where the glob is
//! matched per path segment: `*` matches exactly one segment (and any run
//! of characters inside a segment), `**` matches any number of segments.
//! Matching is case-sensitive.

use std::collections::BTreeSet;
use std::fmt;

use serde::Deserialize;
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EffectKind {
    Reads,
    Writes,
    Executes,
    Network,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contract {
    #[serde(default)]
    pub reads: BTreeSet<String>,
    #[serde(default)]
    pub writes: BTreeSet<String>,
    #[serde(default)]
    pub executes: BTreeSet<String>,
    #[serde(default)]
    pub network: BTreeSet<String>,
    #[serde(default)]
    pub spawns: bool,
}

impl Contract {
    pub fn new() -> Self {
        Self::default()
    }

    fn patterns(&self, kind: EffectKind) -> &BTreeSet<String> {
        match kind {
            EffectKind::Reads => &self.reads,
            EffectKind::Writes => &self.writes,
            EffectKind::Executes => &self.executes,
            EffectKind::Network => &self.network,
        }
    }

    /// Whether this contract covers access to a concrete resource.
    pub fn covers(&self, kind: EffectKind, resource: &str) -> bool {
        self.patterns(kind)
            .iter()
            .any(|pattern| pattern_matches(pattern, resource))
    }

    /// Union of both contracts' permissions.
    pub fn merge(&self, other: &Contract) -> Contract {
        Contract {
            reads: self.reads.union(&other.reads).cloned().collect(),
            writes: self.writes.union(&other.writes).cloned().collect(),
            executes: self.executes.union(&other.executes).cloned().collect(),
            network: self.network.union(&other.network).cloned().collect(),
            spawns: self.spawns || other.spawns,
        }
    }

    /// Pattern-aware subset check: every pattern of `self` must be subsumed
    /// by some pattern of `other`, and spawning implies the other spawns.
    pub fn is_subset_of(&self, other: &Contract) -> bool {
        let covered = |ours: &BTreeSet<String>, theirs: &BTreeSet<String>| {
            ours.iter()
                .all(|child| theirs.iter().any(|parent| pattern_subsumes(parent, child)))
        };
        (!self.spawns || other.spawns)
            && covered(&self.reads, &other.reads)
            && covered(&self.writes, &other.writes)
            && covered(&self.executes, &other.executes)
            && covered(&self.network, &other.network)
    }
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let render = |set: &BTreeSet<String>| {
            let items: Vec<&str> = set.iter().map(String::as_str).collect();
            format!("[{}]", items.join(", "))
        };
        let mut parts = Vec::new();
        if !self.reads.is_empty() {
            parts.push(format!("reads: {}", render(&self.reads)));
        }
        if !self.writes.is_empty() {
            parts.push(format!("writes: {}", render(&self.writes)));
        }
        if !self.executes.is_empty() {
            parts.push(format!("executes: {}", render(&self.executes)));
        }
        if !self.network.is_empty() {
            parts.push(format!("network: {}", render(&self.network)));
        }
        if self.spawns {
            parts.push("spawns: true".to_string());
        }
        if parts.is_empty() {
            write!(f, "(no effects declared)")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

fn split_class(pattern: &str) -> (&str, &str) {
    match pattern.split_once(':') {
        Some((class, body)) => (class, body),
        None => ("", pattern),
    }
}

fn segments(body: &str) -> Vec<&str> {
    body.split('/').filter(|s| !s.is_empty()).collect()
}

/// Does a concrete resource match a pattern?
pub fn pattern_matches(pattern: &str, resource: &str) -> bool {
    let (pattern_class, pattern_body) = split_class(pattern);
    let (resource_class, resource_body) = split_class(resource);
    if pattern_class != resource_class {
        return false;
    }
    match_segments(&segments(pattern_body), &segments(resource_body))
}

fn match_segments(pattern: &[&str], resource: &[&str]) -> bool {
    match pattern.first() {
        None => resource.is_empty(),
        Some(&"**") => {
            // Any descent: consume zero or more resource segments.
            match_segments(&pattern[1..], resource)
                || (!resource.is_empty() && match_segments(pattern, &resource[1..]))
        }
        Some(head) => match resource.first() {
            Some(first) => {
                segment_matches(head, first) && match_segments(&pattern[1..], &resource[1..])
            }
            None => false,
        },
    }
}

fn segment_matches(pattern: &str, segment: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = segment.chars().collect();
    match_chars(&p, &s)
}

fn match_chars(pattern: &[char], text: &[char]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some('*') => {
            match_chars(&pattern[1..], text)
                || (!text.is_empty() && match_chars(pattern, &text[1..]))
        }
        Some(c) => text.first() == Some(c) && match_chars(&pattern[1..], &text[1..]),
    }
}

/// Does `parent` subsume `child`: is every string matched by `child` also
/// matched by `parent`?
pub fn pattern_subsumes(parent: &str, child: &str) -> bool {
    let (parent_class, parent_body) = split_class(parent);
    let (child_class, child_body) = split_class(child);
    if parent_class != child_class {
        return false;
    }
    subsume_segments(&segments(parent_body), &segments(child_body))
}

fn subsume_segments(parent: &[&str], child: &[&str]) -> bool {
    match parent.first() {
        None => child.is_empty(),
        Some(&"**") => {
            subsume_segments(&parent[1..], child)
                || (!child.is_empty() && subsume_segments(parent, &child[1..]))
        }
        Some(head) => match child.first() {
            // A child descent can only be absorbed by a parent descent.
            Some(&"**") => false,
            Some(first) => {
                segment_subsumes(head, first) && subsume_segments(&parent[1..], &child[1..])
            }
            None => false,
        },
    }
}

fn segment_subsumes(parent: &str, child: &str) -> bool {
    let p: Vec<char> = parent.chars().collect();
    let c: Vec<char> = child.chars().collect();
    subsume_chars(&p, &c)
}

fn subsume_chars(parent: &[char], child: &[char]) -> bool {
    match parent.first() {
        None => child.is_empty(),
        Some('*') => {
            subsume_chars(&parent[1..], child)
                || (!child.is_empty() && subsume_chars(parent, &child[1..]))
        }
        Some(c) => match child.first() {
            // A literal parent char cannot absorb a child wildcard.
            Some('*') => false,
            Some(first) => first == c && subsume_chars(&parent[1..], &child[1..]),
            None => false,
        },
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn double_star_matches_any_descent() {
        assert!(pattern_matches("file:/tmp/root/**", "file:/tmp/root/a"));
        assert!(pattern_matches("file:/tmp/root/**", "file:/tmp/root/a/b/c"));
        assert!(!pattern_matches("file:/tmp/root/**", "file:/tmp/other/a"));
        assert!(pattern_matches("file:**", "file:/anything/at/all"));
    }

    #[test]
    fn single_star_matches_one_segment() {
        assert!(pattern_matches("file:/tmp/*/log", "file:/tmp/a/log"));
        assert!(!pattern_matches("file:/tmp/*/log", "file:/tmp/a/b/log"));
        assert!(pattern_matches("file:/tmp/*.py", "file:/tmp/main.py"));
    }

    #[test]
    fn shell_patterns_match_within_one_segment() {
        assert!(pattern_matches("shell:echo *", "shell:echo hi"));
        assert!(pattern_matches("shell:*", "shell:rm -rf x"));
        assert!(!pattern_matches("shell:git *", "shell:npm install"));
    }

    #[test]
    fn class_prefix_is_literal() {
        assert!(!pattern_matches("file:**", "shell:ls"));
    }

    #[test]
    fn covers_consults_the_right_field() {
        let contract = Contract {
            reads: set(&["file:/tmp/root/**"]),
            executes: set(&["shell:git *"]),
            ..Default::default()
        };
        assert!(contract.covers(EffectKind::Reads, "file:/tmp/root/x"));
        assert!(!contract.covers(EffectKind::Writes, "file:/tmp/root/x"));
        assert!(contract.covers(EffectKind::Executes, "shell:git status"));
    }

    #[test]
    fn merge_unions_and_ors_spawns() {
        let a = Contract {
            reads: set(&["file:/a/**"]),
            spawns: false,
            ..Default::default()
        };
        let b = Contract {
            reads: set(&["file:/b/**"]),
            spawns: true,
            ..Default::default()
        };
        let merged = a.merge(&b);
        assert_eq!(merged.reads, set(&["file:/a/**", "file:/b/**"]));
        assert!(merged.spawns);
    }

    #[test]
    fn subsumption_is_pattern_aware() {
        assert!(pattern_subsumes("file:**", "file:/tmp/root/**"));
        assert!(pattern_subsumes("file:/tmp/**", "file:/tmp/root/**"));
        assert!(pattern_subsumes("file:/tmp/root/**", "file:/tmp/root/sub/**"));
        assert!(!pattern_subsumes("file:/tmp/root/**", "file:/tmp/**"));
        assert!(!pattern_subsumes("file:/tmp/root/**", "file:**"));
        assert!(pattern_subsumes("shell:*", "shell:git *"));
        assert!(!pattern_subsumes("shell:git *", "shell:*"));
    }

    #[test]
    fn subset_requires_every_pattern_covered() {
        let parent = Contract {
            reads: set(&["file:/tmp/root/**"]),
            writes: set(&["file:/tmp/root/**"]),
            ..Default::default()
        };
        let child = Contract {
            reads: set(&["file:/tmp/root/sub/**"]),
            ..Default::default()
        };
        assert!(child.is_subset_of(&parent));
        assert!(!parent.is_subset_of(&child));

        let spawning = Contract {
            spawns: true,
            ..Default::default()
        };
        assert!(!spawning.is_subset_of(&parent));
    }

    #[test]
    fn display_lists_declared_effects() {
        let contract = Contract {
            reads: set(&["file:/a/**"]),
            spawns: true,
            ..Default::default()
        };
        assert_eq!(contract.to_string(), "reads: [file:/a/**], spawns: true");
        assert_eq!(Contract::new().to_string(), "(no effects declared)");
    }
}
