//! Subscription tag filtering.

use std::collections::HashSet;

use crate::codec::tags_string_to_tags_code;

/// The subscription expression which matches every message.
pub const SUB_ALL: &str = "*";

/// A tag based subscription filter, matched against the tags code of stored records.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TagFilter {
    /// The accepted tags codes, `None` accepts everything.
    codes: Option<HashSet<i64>>,
}

impl TagFilter {
    /// A filter accepting every message.
    pub fn all() -> Self {
        Self { codes: None }
    }

    /// Build a filter from a subscription expression such as `TagA || TagB`.
    ///
    /// An empty expression or `*` matches every message.
    pub fn from_expression(expression: Option<&str>) -> Self {
        let expression = match expression.map(str::trim) {
            None => return Self::all(),
            Some(expr) if expr.is_empty() || expr == SUB_ALL => return Self::all(),
            Some(expr) => expr,
        };
        let codes: HashSet<i64> = expression
            .split("||")
            .map(str::trim)
            .filter(|tag| !tag.is_empty())
            .map(tags_string_to_tags_code)
            .collect();
        if codes.is_empty() {
            return Self::all();
        }
        Self { codes: Some(codes) }
    }

    /// Check if a record with the given tags code passes this filter.
    pub fn is_matched(&self, tags_code: i64) -> bool {
        match &self.codes {
            None => true,
            Some(codes) => codes.contains(&tags_code),
        }
    }
}
