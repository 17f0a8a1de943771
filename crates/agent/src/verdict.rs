//! Terminal verdicts and how they are read out of the model's final message.

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub reached: bool,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub reason: String,
}

/// What the model claimed, before the live page is consulted.
#[derive(Debug, Clone, PartialEq)]
pub struct Claim {
    pub reached: bool,
    pub reason: String,
}

/// Find a verdict in free text: a JSON object with a boolean `reached`
/// (bare or fenced), else a line starting with an upper-case `REACHED` or
/// `NOT REACHED`.
pub fn parse_verdict(text: &str) -> Option<Claim> {
    json_claim(text).or_else(|| line_claim(text))
}

fn json_claim(text: &str) -> Option<Claim> {
    text.char_indices()
        .filter(|(_, c)| *c == '{')
        .find_map(|(start, _)| {
            let mut values = serde_json::Deserializer::from_str(&text[start..]).into_iter::<Value>();
            let value = values.next()?.ok()?;
            let reached = value.get("reached")?.as_bool()?;
            let reason = value
                .get("reason")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            Some(Claim { reached, reason })
        })
}

fn line_claim(text: &str) -> Option<Claim> {
    text.lines().find_map(|line| {
        let trimmed = line.trim().trim_start_matches(['*', '#', '-', ' ']);
        let (reached, rest) = if let Some(rest) = trimmed.strip_prefix("NOT REACHED") {
            (false, rest)
        } else if let Some(rest) = trimmed.strip_prefix("REACHED") {
            (true, rest)
        } else {
            return None;
        };
        let reason = rest.trim_start_matches(['*', ':', '-', ' ']).trim().to_string();
        Some(Claim { reached, reason })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bare_json_verdict() {
        let claim = parse_verdict(r#"Done. {"reached": true, "reason": "guest payment form is shown"}"#).unwrap();
        assert!(claim.reached);
        assert_eq!(claim.reason, "guest payment form is shown");
    }

    #[test]
    fn test_fenced_json_verdict() {
        let text = "Result:\n```json\n{\n  \"reached\": false,\n  \"reason\": \"site requires login\"\n}\n```";
        let claim = parse_verdict(text).unwrap();
        assert!(!claim.reached);
        assert_eq!(claim.reason, "site requires login");
    }

    #[test]
    fn test_skips_unrelated_json() {
        let text = r#"Clicked {"target":"Pay"} then {"reached": true}"#;
        assert!(parse_verdict(text).unwrap().reached);
    }

    #[test]
    fn test_line_verdicts() {
        let claim = parse_verdict("I looked around.\nNOT REACHED: only an account login exists").unwrap();
        assert!(!claim.reached);
        assert_eq!(claim.reason, "only an account login exists");

        let claim = parse_verdict("**REACHED** - the one-time payment page").unwrap();
        assert!(claim.reached);
        assert_eq!(claim.reason, "the one-time payment page");
    }

    #[test]
    fn test_prose_is_not_a_verdict() {
        assert!(parse_verdict("Reached a dead end on the outage map.").is_none());
    }

    #[test]
    fn test_no_verdict() {
        assert!(parse_verdict("Let me take a snapshot first.").is_none());
        assert!(parse_verdict(r#"{"reached": "maybe"}"#).is_none());
        assert!(parse_verdict("").is_none());
    }
}
