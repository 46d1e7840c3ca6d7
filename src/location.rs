//! Source locations attached to AST nodes and errors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A position in a source file.
///
/// Locations are carried by every term and expression but never participate
/// in equality or ordering of AST nodes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// Source file name (empty for synthesized nodes)
    pub file: String,
    /// 1-based row
    pub row: usize,
    /// 1-based column
    pub col: usize,
}

impl Location {
    /// Create a new location.
    pub fn new(file: impl Into<String>, row: usize, col: usize) -> Self {
        Location {
            file: file.into(),
            row,
            col,
        }
    }

    /// Check whether this location points at real source text.
    pub fn is_set(&self) -> bool {
        self.row > 0
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.file.is_empty() {
            write!(f, "{}:{}", self.row, self.col)
        } else {
            write!(f, "{}:{}:{}", self.file, self.row, self.col)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_with_file() {
        let loc = Location::new("policy.rego", 3, 7);
        assert_eq!(loc.to_string(), "policy.rego:3:7");
    }

    #[test]
    fn test_display_without_file() {
        let loc = Location::new("", 3, 7);
        assert_eq!(loc.to_string(), "3:7");
    }

    #[test]
    fn test_default_is_unset() {
        assert!(!Location::default().is_set());
        assert!(Location::new("f", 1, 1).is_set());
    }
}
