//! Host selectors
//!
//! A selector is a typed predicate over a node's group tags. Plays carry one
//! to decide which nodes their roles apply to. Patterns:
//! - `all` (or `*`) matches every node
//! - `web` matches members of group `web`
//! - `!edge` excludes members of `edge`
//! - `web:edge` (or `web,edge`) is a union
//!
//! Exclusions are applied after the union. A selector made only of
//! exclusions starts from `all`.

use serde::{Deserialize, Serialize};

use super::inventory::{ALL_GROUP, Node};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    include: Vec<String>,
    exclude: Vec<String>,
}

impl Selector {
    /// Selector matching every node
    pub fn all() -> Self {
        Self {
            include: vec![ALL_GROUP.to_string()],
            exclude: Vec::new(),
        }
    }

    /// Parses a single pattern string
    pub fn parse(pattern: &str) -> Result<Self, String> {
        Self::from_patterns([pattern])
    }

    /// Parses several pattern strings into one union
    pub fn from_patterns<I, S>(patterns: I) -> Result<Self, String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut selector = Selector::default();

        for pattern in patterns {
            for term in pattern.as_ref().split([':', ',']) {
                let term = term.trim();
                if term.is_empty() {
                    continue;
                }

                if let Some(group) = term.strip_prefix('!') {
                    let group = group.trim();
                    if group.is_empty() {
                        return Err(format!("empty exclusion in host pattern '{}'", term));
                    }
                    selector.exclude.push(group.to_string());
                } else if term == "*" {
                    selector.include.push(ALL_GROUP.to_string());
                } else {
                    selector.include.push(term.to_string());
                }
            }
        }

        if selector.include.is_empty() {
            if selector.exclude.is_empty() {
                return Err("host pattern is empty".to_string());
            }
            selector.include.push(ALL_GROUP.to_string());
        }

        Ok(selector)
    }

    /// Evaluates the predicate against a node's group tags
    pub fn matches(&self, node: &Node) -> bool {
        self.include.iter().any(|g| node.is_member(g))
            && !self.exclude.iter().any(|g| node.is_member(g))
    }

    /// Every group named by the selector, included or excluded
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.include
            .iter()
            .chain(self.exclude.iter())
            .map(String::as_str)
    }
}

impl std::fmt::Display for Selector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut terms: Vec<String> = self.include.clone();
        terms.extend(self.exclude.iter().map(|g| format!("!{}", g)));
        write!(f, "{}", terms.join(":"))
    }
}
