//! Best-effort detection of agent sessions that can no longer be resumed.
//!
//! Agents surface a corrupted conversation (duplicated tool-use ids, dangling
//! tool results, protocol format errors) only as text, so detection is a set
//! of regex matchers over the combined output. Any failure while resuming a
//! session is treated as corruption as well; a failure on a fresh run with no
//! matching pattern is an ordinary failure and keeps the session.

use anyhow::{Context, Result};
use regex::Regex;

use crate::core::types::AgentResult;

const DEFAULT_PATTERNS: &[&str] = &[
    r"tool_use.{0,40}ids? must be unique",
    r"duplicate\s+tool[_ ]use",
    r"unexpected\s+`?tool_use_id`?",
    r"tool_use.{0,80}without.{0,40}tool_result",
    r"tool_result.{0,80}(no|missing) corresponding\s+`?tool_use`?",
    r"invalid\s+(message|request)\s+format",
    r"protocol\s+(format\s+)?error",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureKind {
    /// Drop the stored session id; the next attempt starts fresh.
    SessionCorrupted { reason: String },
    /// Keep the session; a later resume may still succeed.
    Ordinary,
}

#[derive(Debug, Clone)]
pub struct CorruptionDetector {
    patterns: Vec<Regex>,
}

impl CorruptionDetector {
    /// Detector with the built-in patterns plus `extra` (case-insensitive).
    pub fn new(extra: &[String]) -> Result<Self> {
        let mut patterns = Vec::with_capacity(DEFAULT_PATTERNS.len() + extra.len());
        for raw in DEFAULT_PATTERNS
            .iter()
            .copied()
            .chain(extra.iter().map(String::as_str))
        {
            let regex = Regex::new(&format!("(?i){raw}"))
                .with_context(|| format!("compile corruption pattern '{raw}'"))?;
            patterns.push(regex);
        }
        Ok(Self { patterns })
    }

    /// Return the first pattern matching `text`, if any.
    pub fn find_marker(&self, text: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|pattern| pattern.is_match(text))
            .map(Regex::as_str)
    }

    /// Classify a failed agent run.
    pub fn classify_failure(&self, result: &AgentResult, resumed: bool) -> FailureKind {
        let combined = match &result.error {
            Some(error) => format!("{}\n{}", result.output, error),
            None => result.output.clone(),
        };
        if let Some(marker) = self.find_marker(&combined) {
            return FailureKind::SessionCorrupted {
                reason: format!("output matched '{marker}'"),
            };
        }
        if resumed {
            return FailureKind::SessionCorrupted {
                reason: "resume attempt failed".to_string(),
            };
        }
        FailureKind::Ordinary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed(output: &str, error: Option<&str>) -> AgentResult {
        AgentResult {
            success: false,
            output: output.to_string(),
            error: error.map(str::to_string),
            session_id: None,
        }
    }

    fn detector() -> CorruptionDetector {
        CorruptionDetector::new(&[]).expect("detector")
    }

    #[test]
    fn marker_on_fresh_run_is_corruption() {
        let result = failed(
            "API Error: 400 messages.3: `tool_use` ids must be unique",
            None,
        );
        assert!(matches!(
            detector().classify_failure(&result, false),
            FailureKind::SessionCorrupted { .. }
        ));
    }

    #[test]
    fn bare_timeout_depends_on_resume() {
        let result = failed("", Some("agent timed out after 1800s"));
        assert_eq!(detector().classify_failure(&result, false), FailureKind::Ordinary);
        assert_eq!(
            detector().classify_failure(&result, true),
            FailureKind::SessionCorrupted {
                reason: "resume attempt failed".to_string()
            }
        );
    }

    #[test]
    fn markers_in_error_text_and_extra_patterns_match() {
        let result = failed("", Some("Unexpected `tool_use_id` found in tool_result blocks"));
        assert!(matches!(
            detector().classify_failure(&result, false),
            FailureKind::SessionCorrupted { .. }
        ));

        let custom = CorruptionDetector::new(&["session .* not found".to_string()])
            .expect("custom detector");
        assert!(custom.find_marker("Error: Session abc not found").is_some());
        assert!(detector().find_marker("Error: Session abc not found").is_none());
    }

    #[test]
    fn invalid_extra_pattern_is_an_error() {
        let err = CorruptionDetector::new(&["(".to_string()]).expect_err("bad regex");
        assert!(err.to_string().contains("compile corruption pattern"));
    }
}
