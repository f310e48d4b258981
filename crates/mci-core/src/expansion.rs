//! Named-string expansions.
//!
//! Commands declare expandable fields whose `${name}` and `${name|default}`
//! tokens are substituted from the task's expansion map at command time.
//! Substitution is applied repeatedly so expansion values may themselves
//! contain tokens, bounded by a fixed depth to reject cycles.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Maximum substitution passes before a cycle is assumed.
const MAX_EXPANSION_DEPTH: usize = 10;

/// Error types for expansion.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExpansionError {
    /// A `${name}` token without a default had no value in the map.
    #[error("unresolved expansion '{0}'")]
    Unresolved(String),

    /// A `${` was never closed.
    #[error("unterminated expansion token in '{0}'")]
    Unterminated(String),

    /// Substitution did not settle within the depth bound.
    #[error("expansion exceeded depth {MAX_EXPANSION_DEPTH}; cycle suspected")]
    TooDeep,
}

/// Mapping from expansion name to value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expansions(HashMap<String, String>);

impl Expansions {
    /// Create an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a value.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    /// Set a value.
    pub fn put(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.insert(name.into(), value.into());
    }

    /// Remove a value.
    pub fn remove(&mut self, name: &str) {
        self.0.remove(name);
    }

    /// Merge another set of values over this one.
    pub fn update(&mut self, other: impl IntoIterator<Item = (String, String)>) {
        self.0.extend(other);
    }

    /// Number of defined expansions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` when no expansions are defined.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over the defined (name, value) pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    /// Substitute all tokens in `input`.
    ///
    /// Applied repeatedly until the result is token-free, so
    /// `expand(expand(s)) == expand(s)` for any cycle-free `s`.
    ///
    /// # Errors
    ///
    /// Returns an error for an unresolved non-defaulted token, an
    /// unterminated token, or a substitution cycle.
    pub fn expand(&self, input: &str) -> Result<String, ExpansionError> {
        let mut current = input.to_string();
        for _ in 0..MAX_EXPANSION_DEPTH {
            let (next, substituted) = self.expand_once(&current)?;
            if !substituted {
                return Ok(next);
            }
            current = next;
        }
        Err(ExpansionError::TooDeep)
    }

    /// One substitution pass. Returns the result and whether any token was
    /// replaced.
    fn expand_once(&self, input: &str) -> Result<(String, bool), ExpansionError> {
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        let mut substituted = false;

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let token_rest = &rest[start + 2..];
            let Some(end) = token_rest.find('}') else {
                return Err(ExpansionError::Unterminated(input.to_string()));
            };
            let token = &token_rest[..end];

            let (name, default) = match token.split_once('|') {
                Some((name, default)) => (name, Some(default)),
                None => (token, None),
            };

            match (self.get(name), default) {
                (Some(value), _) => out.push_str(value),
                (None, Some(default)) => out.push_str(default),
                (None, None) => return Err(ExpansionError::Unresolved(name.to_string())),
            }
            substituted = true;
            rest = &token_rest[end + 1..];
        }
        out.push_str(rest);
        Ok((out, substituted))
    }
}

impl FromIterator<(String, String)> for Expansions {
    fn from_iter<T: IntoIterator<Item = (String, String)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<HashMap<String, String>> for Expansions {
    fn from(map: HashMap<String, String>) -> Self {
        Self(map)
    }
}

impl From<Expansions> for HashMap<String, String> {
    fn from(expansions: Expansions) -> Self {
        expansions.0
    }
}
