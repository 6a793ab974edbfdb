//! Verdict summarization and redaction
//!
//! The scoring model only ever sees a [`Summary`]: source counts, the
//! verifier's own score and a redacted, length-capped response. Links,
//! e-mail addresses and phone-like numbers are replaced with placeholders
//! so the scorer cannot be steered by URLs or personal data embedded in a
//! verifier's text.

use serde::{Deserialize, Serialize};
use url::Url;

use super::verdict::Verdict;

/// Score assumed for verifiers that did not submit a structured verdict
pub const NEUTRAL_SCORE: u8 = 50;

/// Links kept per side for the on-chain payload
pub const MAX_LINKS_PER_SIDE: usize = 5;

pub const DEFAULT_MAX_RESPONSE_CHARS: usize = 600;

const LINK_PLACEHOLDER: &str = "[link]";
const EMAIL_PLACEHOLDER: &str = "[email]";
const NUMBER_PLACEHOLDER: &str = "[number]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub confirming_count: usize,
    pub refuting_count: usize,
    pub correctness_score: u8,
    pub redacted_response: String,
    /// Not shown to the scorer
    pub supporting_links: Vec<String>,
    /// Not shown to the scorer
    pub opposing_links: Vec<String>,
}

impl Summary {
    /// Text block sent to the scoring service for one verifier
    pub fn describe(&self) -> String {
        format!(
            "Confirming sources: {}\nRefuting sources: {}\nVerifier correctness score: {}\nResponse: {}",
            self.confirming_count,
            self.refuting_count,
            self.correctness_score,
            self.redacted_response
        )
    }
}

#[derive(Debug, Clone)]
pub struct Summarizer {
    max_response_chars: usize,
}

impl Default for Summarizer {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RESPONSE_CHARS)
    }
}

impl Summarizer {
    pub fn new(max_response_chars: usize) -> Self {
        Self { max_response_chars }
    }

    pub fn summarize(&self, verdict: &Verdict) -> Summary {
        match verdict {
            Verdict::Structured {
                confirming,
                refuting,
                correctness_score,
                response,
            } => Summary {
                confirming_count: confirming.len(),
                refuting_count: refuting.len(),
                correctness_score: (*correctness_score).clamp(0, 100) as u8,
                redacted_response: self.truncate(redact(response)),
                supporting_links: keep_links(confirming),
                opposing_links: keep_links(refuting),
            },
            Verdict::RawText { text } => Summary {
                confirming_count: 0,
                refuting_count: 0,
                correctness_score: NEUTRAL_SCORE,
                redacted_response: self.truncate(redact(text)),
                supporting_links: Vec::new(),
                opposing_links: Vec::new(),
            },
        }
    }

    fn truncate(&self, text: String) -> String {
        if text.chars().count() <= self.max_response_chars {
            return text;
        }
        let mut cut: String = text.chars().take(self.max_response_chars).collect();
        cut.push_str("...");
        cut
    }
}

/// Replace links, e-mail addresses and phone-like numbers with placeholders.
///
/// Whitespace is normalized to single spaces.
pub fn redact(text: &str) -> String {
    text.split_whitespace()
        .map(redact_token)
        .collect::<Vec<_>>()
        .join(" ")
}

fn redact_token(token: &str) -> String {
    let leading: String = token.chars().take_while(|c| is_wrapping(*c)).collect();
    let rest = &token[leading.len()..];
    let core = rest.trim_end_matches(is_wrapping);
    let trailing = &rest[core.len()..];

    if core.is_empty() {
        return token.to_string();
    }

    let placeholder = if is_email(core) {
        Some(EMAIL_PLACEHOLDER)
    } else if is_link(core) {
        Some(LINK_PLACEHOLDER)
    } else if is_phone_number(core) {
        Some(NUMBER_PLACEHOLDER)
    } else {
        None
    };

    match placeholder {
        Some(placeholder) => format!("{}{}{}", leading, placeholder, trailing),
        None => token.to_string(),
    }
}

fn is_wrapping(c: char) -> bool {
    matches!(
        c,
        '(' | ')' | '[' | ']' | '{' | '}' | '<' | '>' | '"' | '\'' | ',' | '.' | ';' | ':' | '!' | '?'
    )
}

fn is_email(token: &str) -> bool {
    match token.split_once('@') {
        Some((local, domain)) => !local.is_empty() && looks_like_domain(domain),
        None => false,
    }
}

fn is_link(token: &str) -> bool {
    let lower = token.to_ascii_lowercase();
    if lower.contains("://") || lower.starts_with("www.") {
        return true;
    }
    // Bare domains such as `example.com/path`
    let host = lower.split(['/', '?', '#']).next().unwrap_or_default();
    looks_like_domain(host)
}

fn looks_like_domain(candidate: &str) -> bool {
    let Ok(parsed) = Url::parse(&format!("http://{}", candidate)) else {
        return false;
    };
    let Some(host) = parsed.host_str() else {
        return false;
    };
    let labels: Vec<&str> = host.split('.').collect();
    if labels.len() < 2 || labels.iter().any(|label| label.is_empty()) {
        return false;
    }
    labels
        .last()
        .is_some_and(|tld| tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic()))
}

fn is_phone_number(token: &str) -> bool {
    let digits = token.chars().filter(|c| c.is_ascii_digit()).count();
    digits >= 7
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '(' | ')' | '.'))
}

/// Keep up to [`MAX_LINKS_PER_SIDE`] distinct http(s) links, in submission order
fn keep_links(links: &[String]) -> Vec<String> {
    let mut kept: Vec<String> = Vec::new();
    for link in links {
        let valid = Url::parse(link)
            .map(|url| matches!(url.scheme(), "http" | "https"))
            .unwrap_or(false);
        if valid && !kept.contains(link) {
            kept.push(link.clone());
            if kept.len() == MAX_LINKS_PER_SIDE {
                break;
            }
        }
    }
    kept
}
