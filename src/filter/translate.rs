//! Ordered substring rewrites
//!
//! `TranslateSequences` lets a transport rewrite awkward input before
//! execution, e.g. doubled quotes produced by a phone keyboard. Rewrites are
//! applied to the command argument in declaration order, one pass each.

use serde::{Deserialize, Serialize};

/// Ordered list of `(from, to)` substring rewrites
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TranslateSequences {
    /// Pairs in declaration order
    #[serde(rename = "Sequences", default)]
    pub sequences: Vec<(String, String)>,
}

impl TranslateSequences {
    /// Apply every rewrite once, in order.
    #[must_use]
    pub fn translate(&self, input: &str) -> String {
        let mut text = input.to_string();
        for (from, to) in &self.sequences {
            if from.is_empty() {
                continue;
            }
            text = text.replace(from.as_str(), to);
        }
        text
    }
}
