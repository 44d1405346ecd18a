//! Permission grammar provider contract.
//!
//! The engine treats permission tokens as opaque strings; everything it
//! needs to know about their structure comes through [`PermissionGrammar`].
//! Implementations must be pure and total - a grammar that fails is a bug
//! surfaced to the caller, never swallowed.

use crate::pattern::{self, Pattern, PatternError};

/// Classifies permission tokens and produces the patterns the engine
/// hands to the substrate.
pub trait PermissionGrammar: Send + Sync {
    /// Derive the permission's type token.
    ///
    /// Types select which backprop edges a permission flows through: a
    /// permission propagates along an edge exactly when its token matches
    /// the edge's type pattern.
    fn type_of(&self, permission: &str) -> String;

    /// Build a context filter: a pattern selecting the permissions
    /// relevant to a collection described by `kind` and `arguments`.
    fn context_filter_for(&self, kind: &str, arguments: &[&str]) -> String;

    /// Host-side twin of the filter-permissions script: keep the tokens
    /// matching `filter`. For use when the substrate's scripting dialect
    /// cannot express the predicate.
    fn filter_to_context(
        &self,
        filter: &str,
        tokens: &[String],
    ) -> Result<Vec<String>, PatternError>;

    /// The universal type pattern, matching every permission token. Used
    /// by `set_permission_union` to wire edges that propagate everything.
    fn every_type_pattern(&self) -> String;
}

/// The default grammar: permissions are delimiter-separated segment lists
/// where odd-indexed segments are scope values and even-indexed segments
/// are the schema.
///
/// `domain;X;course;7;user;42` has type `domain;course;user`.
#[derive(Debug, Clone)]
pub struct SegmentGrammar {
    delimiter: char,
}

impl SegmentGrammar {
    /// Grammar over `;`-delimited tokens.
    pub fn new() -> Self {
        Self { delimiter: ';' }
    }

    /// Grammar over tokens segmented on a different delimiter.
    pub fn with_delimiter(delimiter: char) -> Self {
        Self { delimiter }
    }
}

impl Default for SegmentGrammar {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionGrammar for SegmentGrammar {
    fn type_of(&self, permission: &str) -> String {
        let segments: Vec<&str> = permission.split(self.delimiter).collect();
        let schema: Vec<&str> = segments.iter().copied().step_by(2).collect();
        schema.join(&self.delimiter.to_string())
    }

    fn context_filter_for(&self, kind: &str, arguments: &[&str]) -> String {
        let mut filter = pattern::escape(kind);
        for argument in arguments {
            filter.push_str(&pattern::escape(&self.delimiter.to_string()));
            filter.push_str(&pattern::escape(argument));
        }
        filter.push_str(&pattern::escape(&self.delimiter.to_string()));
        filter.push_str(".*");
        filter
    }

    fn filter_to_context(
        &self,
        filter: &str,
        tokens: &[String],
    ) -> Result<Vec<String>, PatternError> {
        let compiled = Pattern::compile(filter)?;
        Ok(tokens
            .iter()
            .filter(|token| compiled.matches(token))
            .cloned()
            .collect())
    }

    fn every_type_pattern(&self) -> String {
        ".*".to_string()
    }
}
