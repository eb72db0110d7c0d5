//! Rate-limit classification for agent output.
//!
//! Each agent family carries a pattern set; a nonzero exit alone is never a
//! rate limit, but it lowers the bar to a single phrase match in either
//! stream. `retry_after` is extracted in seconds when the message names one.

use regex::Regex;

use crate::capability::AgentId;

/// One sampled execution to classify.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionSample<'a> {
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub exit_code: i32,
    pub agent_id: &'a AgentId,
}

/// Classification result. Callers must prefer `retry_after` over their own
/// exponential backoff when it is present.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Detection {
    pub is_rate_limit: bool,
    pub message: Option<String>,
    pub retry_after: Option<u64>,
}

/// Phrases that indicate rate limiting regardless of agent family.
const GENERIC_PHRASES: &[&str] = &[
    "rate limit",
    "rate-limit",
    "rate limited",
    "too many requests",
    "quota exceeded",
    "quota has been exhausted",
    "usage limit",
    "overloaded_error",
];

/// Weaker signals only trusted when the process also exited nonzero.
const NONZERO_EXIT_PHRASES: &[&str] = &["429", "throttle", "capacity constraints"];

/// Extra phrases per family, matched case-insensitively.
fn family_phrases(agent_id: &AgentId) -> &'static [&'static str] {
    match agent_id {
        AgentId::Claude => &["5-hour limit", "claude usage limit reached"],
        AgentId::Opencode => &["provider rate limit", "insufficient_quota"],
        AgentId::Droid => &["throttled"],
        AgentId::Custom(_) => &[],
    }
}

pub struct RateLimitDetector {
    retry_after_re: Regex,
}

impl Default for RateLimitDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitDetector {
    pub fn new() -> Self {
        // "try again in 30 seconds", "retry in 2 minutes", "retry after 15s"
        let retry_after_re = Regex::new(
            r"(?i)(?:try again|retry)(?:\s+(?:in|after))?\s+(\d+)\s*(seconds?|secs?|s|minutes?|mins?|m)\b",
        )
        .expect("static regex");
        Self { retry_after_re }
    }

    /// Classify one execution sample.
    pub fn detect(&self, sample: ExecutionSample<'_>) -> Detection {
        let haystacks = [sample.stdout, sample.stderr];

        for haystack in haystacks {
            if haystack.is_empty() {
                continue;
            }
            let lower = haystack.to_lowercase();
            let mut matched = GENERIC_PHRASES
                .iter()
                .chain(family_phrases(sample.agent_id).iter())
                .find(|phrase| lower.contains(&phrase.to_lowercase()));
            if matched.is_none() && sample.exit_code != 0 {
                matched = NONZERO_EXIT_PHRASES
                    .iter()
                    .find(|phrase| lower.contains(&phrase.to_lowercase()));
            }

            if let Some(phrase) = matched {
                return Detection {
                    is_rate_limit: true,
                    message: Some(matched_line(haystack, phrase)),
                    retry_after: self.retry_after(haystack),
                };
            }
        }

        Detection::default()
    }

    /// Parse a retry-after hint in seconds from free-form output.
    pub fn retry_after(&self, text: &str) -> Option<u64> {
        let caps = self.retry_after_re.captures(text)?;
        let amount: u64 = caps.get(1)?.as_str().parse().ok()?;
        let unit = caps.get(2)?.as_str().to_lowercase();
        if unit.starts_with('m') {
            Some(amount * 60)
        } else {
            Some(amount)
        }
    }
}

/// First line containing the matched phrase, for diagnostics.
fn matched_line(haystack: &str, phrase: &str) -> String {
    let lower_phrase = phrase.to_lowercase();
    haystack
        .lines()
        .find(|line| line.to_lowercase().contains(&lower_phrase))
        .unwrap_or(phrase)
        .trim()
        .to_string()
}
