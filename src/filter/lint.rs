//! Text sanitiser
//!
//! [`LintText`] is the deterministic sanitiser applied to command arguments
//! before execution and to responses after execution. Stages run in a fixed
//! order, each individually toggled by configuration; a disabled stage is
//! the identity:
//!
//! 1. trim outer whitespace
//! 2. compress runs of horizontal whitespace into a single space
//! 3. drop bytes outside the printable 7-bit range (line separators are left
//!    for the next stage)
//! 4. collapse line separators into a single space
//! 5. truncate to `MaxLength` bytes
//!
//! Truncation is last so that no earlier stage can re-introduce a length
//! overflow. For a fixed configuration the whole pipeline is idempotent.

use serde::{Deserialize, Serialize};

/// Configuration and implementation of the text sanitiser
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct LintText {
    /// Trim leading and trailing whitespace
    #[serde(rename = "TrimSpaces", default)]
    pub trim_spaces: bool,

    /// Compress runs of spaces and tabs into a single space
    #[serde(rename = "CompressSpaces", default)]
    pub compress_spaces: bool,

    /// Keep only visible 7-bit characters (plus line separators, which the
    /// single-line stage owns)
    #[serde(rename = "KeepVisible7BitCharOnly", default)]
    pub keep_visible_7bit_char_only: bool,

    /// Replace line separators with a single space
    #[serde(rename = "CompressToSingleLine", default)]
    pub compress_to_single_line: bool,

    /// Maximum output length in bytes; 0 disables truncation
    #[serde(rename = "MaxLength", default)]
    pub max_length: usize,
}

impl LintText {
    /// Run the sanitiser over `input`.
    #[must_use]
    pub fn lint(&self, input: &str) -> String {
        let mut text = input.to_string();

        if self.trim_spaces {
            text = text.trim().to_string();
        }
        if self.compress_spaces {
            text = compress_horizontal(&text);
        }
        if self.keep_visible_7bit_char_only {
            text.retain(|c| (' '..='~').contains(&c) || c == '\r' || c == '\n');
        }
        if self.compress_to_single_line {
            text = collapse_lines(&text);
        }
        // Dropping characters or collapsing lines can leave doubled spaces
        // behind; compress once more so the pipeline stays idempotent.
        if self.compress_spaces {
            text = compress_horizontal(&text);
        }
        if self.max_length > 0 && text.len() > self.max_length {
            let mut cut = self.max_length;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text.truncate(cut);
            if self.trim_spaces {
                text = text.trim_end().to_string();
            }
        }
        text
    }
}

/// Collapse runs of spaces and tabs into a single space
fn compress_horizontal(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_run = false;
    for c in text.chars() {
        if c == ' ' || c == '\t' {
            if !in_run {
                out.push(' ');
            }
            in_run = true;
        } else {
            in_run = false;
            out.push(c);
        }
    }
    out
}

/// Replace runs of CR/LF with a single space
fn collapse_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut in_run = false;
    for c in text.chars() {
        if c == '\r' || c == '\n' {
            if !in_run {
                out.push(' ');
            }
            in_run = true;
        } else {
            in_run = false;
            out.push(c);
        }
    }
    out
}
