//! Identity resolution.
//!
//! Maps an opaque identity token to a display label. The lookup is injected into the
//! dashboard; there is no process-wide table.

use std::collections::HashMap;

use crate::recognize::Identity;

pub const UNKNOWN_LABEL: &str = "Unknown";
const TOKEN_SUFFIX_CHARS: usize = 6;

pub trait IdentityResolver: Send {
    fn resolve(&self, identity: &Identity) -> String;
}

/// Map-backed resolver.
#[derive(Clone, Debug, Default)]
pub struct Directory {
    names: HashMap<String, String>,
}

impl Directory {
    pub fn new(names: HashMap<String, String>) -> Self {
        Self { names }
    }

    pub fn insert(&mut self, token: impl Into<String>, name: impl Into<String>) {
        self.names.insert(token.into(), name.into());
    }

    pub fn contains(&self, token: &str) -> bool {
        self.names.contains_key(token)
    }

    pub fn tokens(&self) -> Vec<String> {
        let mut tokens: Vec<String> = self.names.keys().cloned().collect();
        tokens.sort();
        tokens
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl IdentityResolver for Directory {
    fn resolve(&self, identity: &Identity) -> String {
        match identity {
            Identity::Unrecognized => UNKNOWN_LABEL.to_string(),
            Identity::Known(token) => self
                .names
                .get(token)
                .cloned()
                .unwrap_or_else(|| format!("User {}", token_suffix(token))),
            Identity::Visitor(token) => self
                .names
                .get(token)
                .cloned()
                .unwrap_or_else(|| format!("Visitor {}", token_suffix(token))),
        }
    }
}

/// Last six characters of a token.
fn token_suffix(token: &str) -> &str {
    let skip = token.chars().count().saturating_sub(TOKEN_SUFFIX_CHARS);
    match token.char_indices().nth(skip) {
        Some((index, _)) => &token[index..],
        None => token,
    }
}
