//! Approval-prompt detection over raw terminal output.
//!
//! Given the ANSI-stripped tail of an agent's terminal (at most 16 KiB),
//! decide whether the assistant is currently waiting on a human, which UI it
//! is showing, and what command it wants to run.
//!
//! The assistant's UI changes between releases, so everything here is
//! best-effort: the menu and y/n shapes are matched structurally, anything
//! else that still reads like a permission question is reported as
//! `unknown`, and the supervisor's fallback timer covers the rest.

use std::sync::OnceLock;

use regex::Regex;

use convoy_types::ApprovalUi;

/// Maximum bytes of surrounding output attached to an approval request.
pub const CONTEXT_LIMIT: usize = 4 * 1024;

/// A detected approval prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptDetection {
    pub ui: ApprovalUi,
    /// The proposed command, when one could be extracted.
    pub command: Option<String>,
    /// Up to [`CONTEXT_LIMIT`] bytes of the surrounding terminal output.
    pub context: String,
}

struct PromptPatterns {
    question: Regex,
    menu_option: Regex,
    menu_arrow: Regex,
    yn: Regex,
    allow_marker: Regex,
    dollar_line: Regex,
}

fn prompt_patterns() -> &'static PromptPatterns {
    static PATTERNS: OnceLock<PromptPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |s: &str| Regex::new(s).expect("static pattern");
        PromptPatterns {
            question: re(
                r"(?im)^.*(do you want to (proceed|run|allow|make this edit)|allow (this )?(command|tool|bash)|waiting for (your )?approval|needs? your (approval|permission)).*$",
            ),
            // A numbered option line: `1. Yes`, `2) No, tell it differently`.
            menu_option: re(r"(?m)^\s*[❯›>]?\s*\d+[.)]\s+\S"),
            // The arrow marker that makes a numbered list an active menu.
            menu_arrow: re(r"(?m)^\s*[❯›>]\s*\d+[.)]"),
            yn: re(r"(?i)[\[(](y/n|yes/no)[\])]"),
            allow_marker: re(r"(?m)^\s*Allow (Bash|command):\s*(?P<cmd>.+?)\s*$"),
            dollar_line: re(r"(?m)^\s*\$\s+(?P<cmd>.+?)\s*$"),
        }
    })
}

/// Stateless scanner over terminal tails.
///
/// A `PromptScanner` owns nothing but the compiled patterns; construct one
/// per supervisor and reuse it for every chunk.
#[derive(Clone, Copy, Default)]
pub struct PromptScanner;

impl PromptScanner {
    pub fn new() -> Self {
        Self
    }

    /// Whether the tail currently shows any approval prompt.
    pub fn is_prompting(&self, tail: &str) -> bool {
        self.detect(tail).is_some()
    }

    /// Recognize an approval prompt in the tail, if one is showing.
    pub fn detect(&self, tail: &str) -> Option<PromptDetection> {
        let p = prompt_patterns();

        let question_at = p.question.find_iter(tail).last().map(|m| m.start());
        let menu_at = self.menu_position(tail);
        let yn_at = p.yn.find_iter(tail).last().map(|m| m.start());

        // The prompt must still be the most recent thing on screen: markers
        // buried under pages of later output are stale.
        let anchor = [question_at, menu_at, yn_at]
            .into_iter()
            .flatten()
            .max()?;
        if tail.len() - anchor > CONTEXT_LIMIT {
            return None;
        }

        let ui = match (menu_at, yn_at) {
            (Some(m), Some(y)) => {
                if m >= y {
                    ApprovalUi::Menu
                } else {
                    ApprovalUi::Yn
                }
            }
            (Some(_), None) => ApprovalUi::Menu,
            (None, Some(_)) => ApprovalUi::Yn,
            (None, None) => {
                question_at?;
                ApprovalUi::Unknown
            }
        };

        let command = self.extract_command(tail, question_at);
        let context_start = tail.len().saturating_sub(CONTEXT_LIMIT);
        let context = tail[floor_char_boundary(tail, context_start)..].to_string();

        Some(PromptDetection {
            ui,
            command,
            context,
        })
    }

    /// A menu needs both a numbered option list and an arrow marker.
    fn menu_position(&self, tail: &str) -> Option<usize> {
        let p = prompt_patterns();
        let arrow = p.menu_arrow.find_iter(tail).last()?;
        p.menu_option.is_match(tail).then_some(arrow.start())
    }

    /// Extract the proposed command: explicit `Allow Bash:` / `Allow
    /// command:` markers first, then the last `$ ...` line, then the
    /// question line itself.
    fn extract_command(&self, tail: &str, question_at: Option<usize>) -> Option<String> {
        let p = prompt_patterns();

        if let Some(caps) = p.allow_marker.captures_iter(tail).last() {
            return Some(caps["cmd"].to_string());
        }
        if let Some(caps) = p.dollar_line.captures_iter(tail).last() {
            return Some(caps["cmd"].to_string());
        }
        let at = question_at?;
        let line_start = tail[..at].rfind('\n').map(|i| i + 1).unwrap_or(0);
        let line_end = tail[at..]
            .find('\n')
            .map(|i| at + i)
            .unwrap_or(tail.len());
        let line = tail[line_start..line_end].trim();
        (!line.is_empty()).then(|| line.to_string())
    }
}

/// Largest char boundary at or below `index`.
fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
