//! Output buffer
//!
//! Canonicalizes raw pane captures: strips terminal escape sequences,
//! trims trailing cursor artifacts, and emits each distinct line at most
//! once. A line that flickers in and out of visibility (alternate-screen
//! toggles, redraws) is never re-emitted. Deduplication only — emission
//! order is the order lines first appear in a capture.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Default rolling window size, overridable via `monitor.output_buffer_max_lines`.
pub const DEFAULT_MAX_LINES: usize = 5000;
/// Cap on the seen-hash set; on overflow the most recent half is retained.
const MAX_SEEN_HASHES: usize = 10_000;

/// CSI, OSC (ST and BEL terminated), and single-character ESC sequences.
static ANSI_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\x1B(?:\[[0-?]*[ -/]*[@-~]|\][^\x07\x1B]*(?:\x07|\x1B\\)|[@-Z\\-_])").unwrap()
});

/// Remove escape sequences plus bare backspace/carriage-return artifacts.
pub fn strip_ansi(text: &str) -> String {
    let stripped = ANSI_PATTERN.replace_all(text, "");
    stripped.replace(['\r', '\x08'], "")
}

fn line_digest(line: &str) -> u128 {
    let hash = Sha256::digest(line.as_bytes());
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash[..16]);
    u128::from_be_bytes(bytes)
}

/// Deduplicated capture state for one pane. Owned exclusively by that
/// pane's monitor; never shared.
pub struct OutputBuffer {
    seen_hashes: HashSet<u128>,
    /// Insertion order of hashes, for the retain-most-recent-half cap
    seen_order: Vec<u128>,
    rolling: Vec<String>,
    max_lines: usize,
}

impl OutputBuffer {
    pub fn new(max_lines: usize) -> Self {
        Self {
            seen_hashes: HashSet::new(),
            seen_order: Vec::new(),
            rolling: Vec::new(),
            max_lines,
        }
    }

    /// Feed one raw capture; returns only lines never emitted before.
    /// Trailing whitespace is not content, so it never defeats the dedup.
    pub fn ingest(&mut self, raw_lines: &[String]) -> Vec<String> {
        let mut cleaned: Vec<String> = raw_lines
            .iter()
            .map(|l| strip_ansi(l).trim_end().to_string())
            .collect();

        // Trailing empty lines are cursor artifacts, not content.
        while cleaned.last().is_some_and(|l| l.trim().is_empty()) {
            cleaned.pop();
        }

        let mut fresh = Vec::new();
        for line in cleaned {
            let digest = line_digest(&line);
            if self.seen_hashes.insert(digest) {
                self.seen_order.push(digest);
                fresh.push(line);
            }
        }

        if self.seen_hashes.len() > MAX_SEEN_HASHES {
            let keep_from = self.seen_order.len() / 2;
            let dropped: Vec<u128> = self.seen_order.drain(..keep_from).collect();
            for digest in dropped {
                self.seen_hashes.remove(&digest);
            }
        }

        self.rolling.extend(fresh.iter().cloned());
        if self.rolling.len() > self.max_lines {
            let overflow = self.rolling.len() - self.max_lines;
            self.rolling.drain(..overflow);
        }

        fresh
    }

    /// Most recent `n` lines of the rolling window, oldest first.
    pub fn tail(&self, n: usize) -> &[String] {
        let start = self.rolling.len().saturating_sub(n);
        &self.rolling[start..]
    }

    pub fn len(&self) -> usize {
        self.rolling.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rolling.is_empty()
    }

    /// Drop all state, e.g. after a session restart.
    pub fn reset(&mut self) {
        self.seen_hashes.clear();
        self.seen_order.clear();
        self.rolling.clear();
    }
}

impl Default for OutputBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_LINES)
    }
}
