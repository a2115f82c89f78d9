//! Placement policy: which backend a named tensor should live on

use serde::{Deserialize, Serialize};

/// Pin tensors whose name matches `pattern` to `backend`.
///
/// Patterns are matched against the whole name; `*` matches any run of
/// characters, including an empty one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementRule {
    pub pattern: String,
    pub backend: String,
}

impl PlacementRule {
    pub fn new(pattern: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            backend: backend.into(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        wildcard_match(self.pattern.as_bytes(), name.as_bytes())
    }
}

/// How a vote between equally represented input backends is settled
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TieBreak {
    /// Backend of the first input in definition order
    #[default]
    FirstInput,
    /// The default backend if it is among the tied candidates
    Default,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementPolicy {
    /// Backend for unmatched leaves; the registry default when absent
    pub default_backend: Option<String>,
    /// Rules checked in order, the first match wins
    pub rules: Vec<PlacementRule>,
}

impl PlacementPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default(mut self, backend: impl Into<String>) -> Self {
        self.default_backend = Some(backend.into());
        self
    }

    pub fn rule(mut self, pattern: impl Into<String>, backend: impl Into<String>) -> Self {
        self.rules.push(PlacementRule::new(pattern, backend));
        self
    }

    /// Backend name the first matching rule assigns to `name`
    pub fn backend_for(&self, name: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|r| r.matches(name))
            .map(|r| r.backend.as_str())
    }

    /// Copy of this policy where exact-name `overrides` take precedence
    pub fn with_overrides<'a>(&self, overrides: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        let mut rules: Vec<PlacementRule> = overrides
            .into_iter()
            .map(|(name, backend)| PlacementRule::new(name.clone(), backend.clone()))
            .collect();
        // Overrides may come from an unordered map
        rules.sort_by(|a, b| a.pattern.cmp(&b.pattern));
        rules.extend(self.rules.iter().cloned());
        Self {
            default_backend: self.default_backend.clone(),
            rules,
        }
    }
}

fn wildcard_match(pattern: &[u8], name: &[u8]) -> bool {
    let (mut p, mut n) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while n < name.len() {
        if p < pattern.len() && pattern[p] == b'*' {
            backtrack = Some((p, n));
            p += 1;
        } else if p < pattern.len() && pattern[p] == name[n] {
            p += 1;
            n += 1;
        } else if let Some((star, matched)) = backtrack {
            p = star + 1;
            n = matched + 1;
            backtrack = Some((star, matched + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|&c| c == b'*')
}
