//! Terminal output classifier
//!
//! Pure pattern matching over captured pane text. Five tiers are tested in
//! strict priority order and the first match wins:
//!
//! 1. permission prompt — the CLI asks for authorization; never auto-answerable
//! 2. input prompt — numbered choices, open questions, bare prompt glyphs
//! 3. rate limit
//! 4. error
//! 5. completion
//!
//! The ordering matters: a permission prompt usually *contains* a question
//! mark and a `(y/n)` triad, so testing it first is what keeps the
//! auto-responder from ever answering "yes" to one.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Event category produced by [`Classifier::classify`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionKind {
    PermissionPrompt,
    InputPrompt,
    RateLimit,
    Error,
    Completion,
    None,
}

/// Result of classifying a block of terminal output.
#[derive(Debug, Clone, PartialEq)]
pub struct DetectionResult {
    pub kind: DetectionKind,
    /// Substring that triggered the match, empty when `kind` is `None`
    pub matched_text: String,
    /// Pattern string that fired, empty when `kind` is `None`
    pub pattern: String,
    pub confidence: f64,
}

impl DetectionResult {
    fn hit(kind: DetectionKind, matched_text: &str, pattern: &str) -> Self {
        Self {
            kind,
            matched_text: matched_text.to_string(),
            pattern: pattern.to_string(),
            confidence: 1.0,
        }
    }

    pub fn none() -> Self {
        Self {
            kind: DetectionKind::None,
            matched_text: String::new(),
            pattern: String::new(),
            confidence: 1.0,
        }
    }
}

// ============ Pattern tables ============

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns
        .iter()
        .map(|p| Regex::new(&format!("(?m){p}")).expect("invalid built-in pattern"))
        .collect()
}

/// Authorization requests. Never auto-answered.
static PERMISSION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"Claude wants to (?:run|edit|use|write|read|delete)",
        r"Do you want to allow Claude to use",
        r"Allow Claude to use",
        r"Allow\?\s*\(?[yna]",
        r"\(y\)es\s*/\s*\(n\)o",
        r"\[y/n(?:/a)?\]",
        r"\(y/n/a\)",
        r"Yes \(y\)\s*\|\s*No \(n\)",
        r"Do you want to proceed",
        r"Would you like to continue",
        r"Press Enter to continue",
        r"Continue\?\s*\[",
    ])
});

static INPUT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?:Choose|Select|Pick)\s+(?:one|an option|from)",
        r"\([Yy]/[Nn]\)",
        r"^\s*\d+[\.\)]\s+\w+",
        r"\(\d+\)\s+\w+",
        r"\?\s*$",
        r"(?:Enter|Type|Provide|Input|Specify)\s+(?:a|the|your)",
        r">\s*$",
        r"❯\s*$",
    ])
});

static RATE_LIMIT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)rate\s*limit(?:ed)?",
        r"(?i)usage\s*limit\s*(?:reached|exceeded|hit)",
        r"(?i)too\s*many\s*requests",
        r"(?i)(?:please\s+)?wait\s+(?:\d+\s*(?:second|minute|hour)|\w+\s+before)",
        r"(?i)try\s*again\s*(?:in|after)\s*\d+",
        r"(?i)429\s*(?:error)?",
        r"(?i)capacity\s*(?:limit|exceeded)",
        r"(?i)cooldown",
        r"(?i)quota\s*(?:exceeded|reached)",
        r"(?i)you(?:'ve| have)\s+(?:reached|hit|exceeded)\s+(?:your|the)\s+(?:usage|message|token)\s+limit",
        r"(?i)limit\s+will\s+reset",
    ])
});

static ERROR_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)(?:error|err!|fatal|panic|exception|traceback|segfault)",
        r"(?i)process\s+exited\s+with\s+(?:code|status)\s+[^0]",
        r"(?i)command\s+(?:failed|not found)",
        r"(?i)killed|terminated|aborted",
        r"SIGTERM|SIGKILL|SIGSEGV",
        r"npm\s+ERR!",
        r"(?i)unhandled\s+(?:promise\s+)?rejection",
        r"(?i)cannot\s+find\s+module",
        r"Traceback \(most recent call last\)",
        r"(?:ModuleNotFoundError|ImportError|SyntaxError|TypeError|ValueError)",
        r"(?i)connection\s+(?:lost|reset|refused|timed?\s*out)",
        r"(?i)authentication\s+(?:failed|error|expired)",
        r"(?i)api\s+(?:error|unavailable)",
    ])
});

static COMPLETION_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile(&[
        r"(?i)(?:task|job|build|test|deployment?)\s+(?:complete[d]?|finish(?:ed)?|done|success(?:ful)?)",
        r"(?i)all\s+(?:\d+\s+)?(?:tests?\s+)?pass(?:ed|ing)?",
        r"✓|✅|☑",
        r"(?i)successfully\s+(?:built|compiled|deployed|installed|created|updated)",
        r"(?i)compiled?\s+(?:successfully|with\s+\d+\s+warning)",
        r"(?i)build\s+succeeded",
        r"Done in \d+",
        r"\d+\s+passing",
    ])
});

/// Reserved tokens whose mere presence disables autonomous replies.
/// Matched case-insensitively as substrings.
pub const DESTRUCTIVE_KEYWORDS: [&str; 18] = [
    "delete",
    "remove",
    "drop",
    "truncate",
    "destroy",
    "overwrite",
    "wipe",
    "purge",
    "force push",
    "hard reset",
    "rm -rf",
    "uninstall",
    "migrate",
    "rollback",
    "production",
    "deploy",
    "reset",
    "replace all",
];

/// Check whether any destructive keyword appears in `text`.
///
/// Hard safety gate consumed by the auto-responder; intentionally broad.
pub fn has_destructive_keyword(text: &str) -> bool {
    let lower = text.to_lowercase();
    DESTRUCTIVE_KEYWORDS.iter().any(|kw| lower.contains(kw))
}

fn match_any<'a>(text: &'a str, patterns: &[Regex]) -> Option<(&'a str, String)> {
    for re in patterns {
        if let Some(m) = re.find(text) {
            return Some((m.as_str(), re.as_str().to_string()));
        }
    }
    None
}

// ============ Classifier ============

/// Priority-ordered pattern classifier. Stateless; all tables are
/// pre-compiled on first use.
#[derive(Debug, Default, Clone, Copy)]
pub struct Classifier;

impl Classifier {
    pub fn new() -> Self {
        Self
    }

    /// Classify terminal output into an event category.
    pub fn classify(&self, text: &str) -> DetectionResult {
        if let Some((m, p)) = match_any(text, &PERMISSION_PATTERNS) {
            return DetectionResult::hit(DetectionKind::PermissionPrompt, m, &p);
        }
        if let Some((m, p)) = match_any(text, &INPUT_PATTERNS) {
            return DetectionResult::hit(DetectionKind::InputPrompt, m, &p);
        }
        if let Some((m, p)) = match_any(text, &RATE_LIMIT_PATTERNS) {
            return DetectionResult::hit(DetectionKind::RateLimit, m, &p);
        }
        if let Some((m, p)) = match_any(text, &ERROR_PATTERNS) {
            return DetectionResult::hit(DetectionKind::Error, m, &p);
        }
        if let Some((m, p)) = match_any(text, &COMPLETION_PATTERNS) {
            return DetectionResult::hit(DetectionKind::Completion, m, &p);
        }
        DetectionResult::none()
    }

    /// Does any permission-prompt pattern match? Used by the
    /// auto-responder as its first guard.
    pub fn is_permission_prompt(&self, text: &str) -> bool {
        match_any(text, &PERMISSION_PATTERNS).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_beats_input_prompt() {
        let classifier = Classifier::new();
        // Contains a '?' and a y/n triad, but the "wants to run" phrasing
        // must win the tier ordering.
        let text = "Claude wants to run:\n  rm -rf node_modules\nAllow? (y/n/a)\n";
        let result = classifier.classify(text);
        assert_eq!(result.kind, DetectionKind::PermissionPrompt);
    }

    #[test]
    fn test_input_prompt_variants() {
        let classifier = Classifier::new();
        for text in [
            "Choose one of the following:",
            "1. Start the server",
            "What should the module be called?",
            "Enter a name for the project",
            "Continue? (Y/n)",
            "> ",
            "❯ ",
        ] {
            assert_eq!(
                classifier.classify(text).kind,
                DetectionKind::InputPrompt,
                "failed for {text:?}"
            );
        }
    }

    #[test]
    fn test_rate_limit() {
        let classifier = Classifier::new();
        for text in [
            "Rate limit reached",
            "HTTP 429 error from upstream",
            "Too many requests, try again in 30 seconds",
            "Your usage limit will reset at 5pm",
            "quota exceeded for this billing cycle",
        ] {
            assert_eq!(
                classifier.classify(text).kind,
                DetectionKind::RateLimit,
                "failed for {text:?}"
            );
        }
    }

    #[test]
    fn test_error() {
        let classifier = Classifier::new();
        for text in [
            "npm ERR! missing script: build",
            "Traceback (most recent call last):",
            "ModuleNotFoundError: No module named 'yaml'",
            "process exited with code 1",
            "connection refused",
            "authentication failed for user",
        ] {
            assert_eq!(
                classifier.classify(text).kind,
                DetectionKind::Error,
                "failed for {text:?}"
            );
        }
    }

    #[test]
    fn test_completion() {
        let classifier = Classifier::new();
        for text in [
            "Build succeeded",
            "All 42 tests passed",
            "✓ compiled successfully",
            "Done in 3.2s",
            "successfully deployed to staging",
        ] {
            assert_eq!(
                classifier.classify(text).kind,
                DetectionKind::Completion,
                "failed for {text:?}"
            );
        }
    }

    #[test]
    fn test_bare_triad_is_permission_tier() {
        let classifier = Classifier::new();
        // y/n/always triads are authorization prompts even without the
        // "wants to" phrasing; a plain y/n pair is an ordinary input
        // prompt.
        assert_eq!(
            classifier.classify("Apply this change? (y/n/a)").kind,
            DetectionKind::PermissionPrompt
        );
        assert_eq!(
            classifier.classify("Delete all records? (y/n)").kind,
            DetectionKind::InputPrompt
        );
    }

    #[test]
    fn test_no_match() {
        let classifier = Classifier::new();
        let result = classifier.classify("compiling crate foo v0.1.0");
        assert_eq!(result.kind, DetectionKind::None);
        assert!(result.matched_text.is_empty());
    }

    #[test]
    fn test_matched_text_and_pattern_populated() {
        let classifier = Classifier::new();
        let result = classifier.classify("Do you want to proceed with the install?");
        assert_eq!(result.kind, DetectionKind::PermissionPrompt);
        assert_eq!(result.matched_text, "Do you want to proceed");
        assert!(!result.pattern.is_empty());
    }

    #[test]
    fn test_destructive_keywords_case_insensitive() {
        assert!(has_destructive_keyword("about to DELETE all records"));
        assert!(has_destructive_keyword("git push --force push to main"));
        assert!(has_destructive_keyword("Deploy to Production?"));
        assert!(has_destructive_keyword("run rm -rf /tmp/cache"));
        assert!(!has_destructive_keyword("list the files in src"));
    }

    #[test]
    fn test_error_tier_beats_completion() {
        let classifier = Classifier::new();
        // Both "error" and "build succeeded" appear; error ranks higher.
        let text = "error: linker failed\nbuild succeeded (cached)";
        assert_eq!(classifier.classify(text).kind, DetectionKind::Error);
    }
}
