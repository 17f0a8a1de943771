//! Click target resolution.
//!
//! Scores every element of a fresh snapshot against a target phrase and a list
//! of synonyms, then clicks the winner. Scoring is an ordered list of pure
//! rules: the first matching [`ScoringRule`] supplies the base score, then
//! every [`BonusRule`] that applies adds to it.

use paynav_core::{Error, ResolverWeights, Result, SnapshotConfig};
use serde::Serialize;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use super::page::Page;
use super::snapshot::{self, ElementRecord, TagKind};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", rename_all = "kebab-case")]
pub enum MatchReason {
    ExactText,
    TargetContainsText,
    TextContainsTarget,
    SynonymExact { synonym: String },
    SynonymPartial { synonym: String },
}

impl MatchReason {
    pub fn is_exact(&self) -> bool {
        matches!(self, Self::ExactText)
    }
}

/// Base-score rules, in evaluation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoringRule {
    ExactText,
    TargetContainsText,
    TextContainsTarget,
    Synonym,
}

impl ScoringRule {
    pub const ORDER: [ScoringRule; 4] = [
        Self::ExactText,
        Self::TargetContainsText,
        Self::TextContainsTarget,
        Self::Synonym,
    ];

    /// `text`, `target` and `synonyms` are already lowercased.
    pub fn apply(
        &self,
        text: &str,
        target: &str,
        synonyms: &[String],
        weights: &ResolverWeights,
    ) -> Option<(u32, MatchReason)> {
        match self {
            Self::ExactText => (!target.is_empty() && text == target)
                .then(|| (weights.exact_score, MatchReason::ExactText)),
            Self::TargetContainsText => (!target.is_empty()
                && text.chars().count() >= weights.min_contained_len
                && target.contains(text))
            .then(|| (weights.target_contains_score, MatchReason::TargetContainsText)),
            Self::TextContainsTarget => (!target.is_empty() && text.contains(target))
                .then(|| (weights.text_contains_score, MatchReason::TextContainsTarget)),
            Self::Synonym => {
                let synonyms = || synonyms.iter().filter(|s| !s.is_empty());
                if let Some(s) = synonyms().find(|s| text == s.as_str()) {
                    return Some((
                        weights.synonym_exact_score,
                        MatchReason::SynonymExact { synonym: s.clone() },
                    ));
                }
                synonyms()
                    .find(|s| {
                        text.contains(s.as_str())
                            || (text.chars().count() >= weights.min_contained_len && s.contains(text))
                    })
                    .map(|s| {
                        (
                            weights.synonym_partial_score,
                            MatchReason::SynonymPartial { synonym: s.clone() },
                        )
                    })
            }
        }
    }
}

/// Additive bonuses applied after a base rule matched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BonusRule {
    AccountConcept,
    PaymentConcept,
    LinkWithHref,
}

impl BonusRule {
    pub const ALL: [BonusRule; 3] = [Self::AccountConcept, Self::PaymentConcept, Self::LinkWithHref];

    pub fn apply(&self, element: &ElementRecord, text: &str, target: &str, weights: &ResolverWeights) -> u32 {
        let both_mention = |keywords: &[String]| {
            let hit = |s: &str| keywords.iter().any(|k| s.contains(k.to_lowercase().as_str()));
            hit(text) && hit(target)
        };
        match self {
            Self::AccountConcept if both_mention(&weights.account_keywords) => weights.account_bonus,
            Self::PaymentConcept if both_mention(&weights.payment_keywords) => weights.payment_bonus,
            Self::LinkWithHref if element.is_link_with_href() => weights.link_bonus,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoredCandidate {
    pub element: ElementRecord,
    /// Base score from the matching rule.
    pub score: u32,
    pub bonus: u32,
    pub match_reason: MatchReason,
}

impl ScoredCandidate {
    /// Ranking score. A non-exact match never reaches the exact-match score,
    /// whatever its bonuses.
    pub fn total(&self, weights: &ResolverWeights) -> u32 {
        let raw = self.score + self.bonus;
        if self.match_reason.is_exact() {
            raw
        } else {
            raw.min(weights.exact_score.saturating_sub(1))
        }
    }
}

/// Score one element. `None` when no rule matches.
pub fn score_element(
    element: &ElementRecord,
    target: &str,
    synonyms: &[String],
    weights: &ResolverWeights,
) -> Option<ScoredCandidate> {
    let text = element.text.trim().to_lowercase();
    if text.is_empty() {
        return None;
    }
    let target = target.trim().to_lowercase();
    let synonyms: Vec<String> = synonyms.iter().map(|s| s.trim().to_lowercase()).collect();

    let (score, match_reason) = ScoringRule::ORDER
        .iter()
        .find_map(|rule| rule.apply(&text, &target, &synonyms, weights))?;
    if score == 0 {
        return None;
    }
    let bonus = BonusRule::ALL
        .iter()
        .map(|rule| rule.apply(element, &text, &target, weights))
        .sum();

    Some(ScoredCandidate {
        element: element.clone(),
        score,
        bonus,
        match_reason,
    })
}

/// All matching candidates, best first. Ties go to the element that comes
/// first in reading order.
pub fn rank_candidates(
    elements: &[ElementRecord],
    target: &str,
    synonyms: &[String],
    weights: &ResolverWeights,
) -> Vec<ScoredCandidate> {
    let mut ranked: Vec<ScoredCandidate> = elements
        .iter()
        .filter_map(|el| score_element(el, target, synonyms, weights))
        .collect();
    ranked.sort_by(|a, b| {
        b.total(weights)
            .cmp(&a.total(weights))
            .then(a.element.index.cmp(&b.element.index))
    });
    ranked
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateSummary {
    pub text: String,
    pub score: u32,
    pub bonus: u32,
    pub match_reason: MatchReason,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickOutcome {
    pub clicked_text: String,
    pub score: u32,
    pub bonus: u32,
    pub match_reason: MatchReason,
    pub tag_kind: TagKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
    pub candidates: Vec<CandidateSummary>,
}

/// Clicks the first visible clickable element whose normalized text matches,
/// preferring one with the same href. Re-queries the DOM on every call.
pub const CLICK_JS: &str = r#"(function (want) {
  const norm = (s) => (s || '').split(/\s+/).filter(Boolean).join(' ').toLowerCase();
  const selector = 'a[href],button,input[type=button],input[type=submit],[role=button],[role=link],[role=menuitem],[role=tab],[tabindex],[onclick]';
  const wanted = norm(want.text);
  const matches = [];
  for (const el of document.querySelectorAll(selector)) {
    const rect = el.getBoundingClientRect();
    if (rect.width <= 0 || rect.height <= 0) continue;
    const text = norm(el.innerText || el.value || el.getAttribute('aria-label') || el.title);
    if (text === wanted) matches.push(el);
  }
  const el = matches.find((m) => want.href && m.href === want.href) || matches[0];
  if (!el) return { clicked: false, stale: true };
  el.scrollIntoView({ block: 'center' });
  el.click();
  return { clicked: true, stale: false };
})"#;

pub fn click_script(text: &str, href: Option<&str>) -> String {
    format!("{}({})", CLICK_JS, json!({ "text": text, "href": href }))
}

const STALE_RETRY_DELAY: Duration = Duration::from_millis(150);

/// Click an element by its text, retrying while it is missing from the DOM.
pub async fn click_element(page: &dyn Page, element: &ElementRecord, timeout: Duration) -> Result<()> {
    let script = click_script(&element.text, element.href.as_deref());
    let deadline = Instant::now() + timeout;

    let attempt_loop = async {
        loop {
            let result: Value = page.evaluate(&script).await?;
            if result.get("clicked").and_then(|v| v.as_bool()) == Some(true) {
                return Ok(());
            }
            debug!(text = %element.text, "Click target went stale, retrying");
            if Instant::now() + STALE_RETRY_DELAY >= deadline {
                return Err(Error::Browser(format!(
                    "element '{}' is no longer on the page",
                    element.text
                )));
            }
            tokio::time::sleep(STALE_RETRY_DELAY).await;
        }
    };

    match tokio::time::timeout(timeout, attempt_loop).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!(
            "click on '{}' timed out after {}ms",
            element.text,
            timeout.as_millis()
        ))),
    }
}

/// Resolve `target` against a fresh snapshot and click the winner.
pub async fn click_target(
    page: &dyn Page,
    target: &str,
    synonyms: &[String],
    snapshot_config: &SnapshotConfig,
    weights: &ResolverWeights,
    click_timeout: Duration,
) -> Result<ClickOutcome> {
    let elements = snapshot::capture(page, snapshot_config).await?;
    let ranked = rank_candidates(&elements, target, synonyms, weights);

    let Some(winner) = ranked.first() else {
        info!(target = %target, synonyms = ?synonyms, elements = elements.len(), "No click target matched");
        return Err(Error::NoMatch {
            target: target.to_string(),
            synonyms: synonyms.to_vec(),
        });
    };

    info!(
        target = %target,
        text = %winner.element.text,
        score = winner.score,
        bonus = winner.bonus,
        "Resolved click target"
    );
    click_element(page, &winner.element, click_timeout).await?;

    Ok(ClickOutcome {
        clicked_text: winner.element.text.clone(),
        score: winner.score,
        bonus: winner.bonus,
        match_reason: winner.match_reason.clone(),
        tag_kind: winner.element.tag_kind,
        href: winner.element.href.clone(),
        candidates: ranked
            .iter()
            .take(5)
            .map(|c| CandidateSummary {
                text: c.element.text.clone(),
                score: c.score,
                bonus: c.bonus,
                match_reason: c.match_reason.clone(),
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::snapshot::BoundingBox;
    use crate::browser::testing::FakePage;

    fn element(index: usize, text: &str, tag_kind: TagKind, href: Option<&str>) -> ElementRecord {
        ElementRecord {
            index,
            text: text.to_string(),
            tag_kind,
            href: href.map(String::from),
            role: None,
            class_hint: None,
            bounding_box: BoundingBox {
                x: 0.0,
                y: index as f64 * 40.0,
                width: 100.0,
                height: 20.0,
            },
            visible: true,
        }
    }

    fn synonyms(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exact_match_wins_over_account_link() {
        let weights = ResolverWeights::default();
        let elements = vec![
            element(0, "My Account", TagKind::Link, Some("https://u.example.com/account")),
            element(1, "Pay Bill", TagKind::Link, Some("https://u.example.com/pay")),
            element(2, "Contact Us", TagKind::Link, Some("https://u.example.com/contact")),
        ];
        let ranked = rank_candidates(&elements, "Pay Bill", &synonyms(&["payment", "billing"]), &weights);
        let winner = &ranked[0];
        assert_eq!(winner.element.text, "Pay Bill");
        assert_eq!(winner.score, 100);
        assert_eq!(winner.match_reason, MatchReason::ExactText);
        assert!(ranked.iter().all(|c| c.element.text != "My Account"));
    }

    #[test]
    fn test_synonym_partial_fallback() {
        let weights = ResolverWeights::default();
        let elements = vec![element(0, "Make a One-Time Payment", TagKind::Button, None)];
        let ranked = rank_candidates(
            &elements,
            "Guest Pay",
            &synonyms(&["one-time payment", "pay as guest"]),
            &weights,
        );
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].score, 70);
        assert_eq!(
            ranked[0].match_reason,
            MatchReason::SynonymPartial {
                synonym: "one-time payment".to_string()
            }
        );
    }

    #[test]
    fn test_rules_apply_in_order() {
        let weights = ResolverWeights::default();
        let none: Vec<String> = Vec::new();
        let target_contains = score_element(&element(0, "Pay", TagKind::Button, None), "Pay Bill", &none, &weights).unwrap();
        assert_eq!(target_contains.match_reason, MatchReason::TargetContainsText);
        assert_eq!(target_contains.score, 85);

        let text_contains = score_element(&element(0, "Pay Bill Online", TagKind::Button, None), "Pay Bill", &none, &weights).unwrap();
        assert_eq!(text_contains.match_reason, MatchReason::TextContainsTarget);
        assert_eq!(text_contains.score, 80);

        let synonym = score_element(&element(0, "Billing", TagKind::Button, None), "Guest Pay", &synonyms(&["billing"]), &weights).unwrap();
        assert_eq!(synonym.score, 90);

        // Too short for the contained-text rule
        assert!(score_element(&element(0, "Pa", TagKind::Button, None), "Pay Bill", &none, &weights).is_none());
    }

    #[test]
    fn test_bonuses() {
        let weights = ResolverWeights::default();
        let none: Vec<String> = Vec::new();
        let login = score_element(
            &element(0, "Account Login", TagKind::Link, Some("https://u.example.com/login")),
            "Login",
            &none,
            &weights,
        )
        .unwrap();
        assert_eq!(login.bonus, 10 + 5);

        let pay = score_element(&element(0, "Pay Now", TagKind::Button, None), "Pay", &none, &weights).unwrap();
        assert_eq!(pay.bonus, 5);
    }

    #[test]
    fn test_exact_match_always_outranks_bonused_partials() {
        let weights = ResolverWeights {
            account_bonus: 50,
            link_bonus: 50,
            ..ResolverWeights::default()
        };
        let elements = vec![
            element(0, "Sign in to your account", TagKind::Link, Some("https://u.example.com/login")),
            element(1, "Sign in", TagKind::Button, None),
        ];
        let ranked = rank_candidates(&elements, "Sign in", &[], &weights);
        assert_eq!(ranked[0].element.text, "Sign in");
        assert!(ranked[0].total(&weights) > ranked[1].total(&weights));
    }

    #[test]
    fn test_ties_break_by_visual_order() {
        let weights = ResolverWeights::default();
        let elements = vec![
            element(0, "Pay Online", TagKind::Button, None),
            element(1, "Pay Today", TagKind::Button, None),
        ];
        for _ in 0..3 {
            let ranked = rank_candidates(&elements, "Pay", &[], &weights);
            assert_eq!(ranked[0].element.index, 0);
            assert_eq!(ranked[0].total(&weights), ranked[1].total(&weights));
        }
    }

    #[test]
    fn test_click_script_embeds_arguments() {
        let script = click_script("Pay \"Now\"", Some("https://u.example.com/pay"));
        assert!(script.starts_with(CLICK_JS));
        assert!(script.contains(r#""text":"Pay \"Now\"""#));
    }

    #[tokio::test]
    async fn test_click_target_clicks_winner() {
        let page = FakePage::new("https://u.example.com/home", "Home");
        page.add_element("My Account", "a", Some("https://u.example.com/account"), 10.0);
        page.add_element("Pay Bill", "a", Some("https://u.example.com/pay"), 50.0);
        page.on_click("Pay Bill", "https://u.example.com/pay", "Pay Your Bill");

        let outcome = click_target(
            &page,
            "Pay Bill",
            &synonyms(&["payment"]),
            &SnapshotConfig::default(),
            &ResolverWeights::default(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();
        assert_eq!(outcome.clicked_text, "Pay Bill");
        assert_eq!(outcome.tag_kind, TagKind::Link);
        assert_eq!(page.clicks(), vec!["Pay Bill".to_string()]);
    }

    #[tokio::test]
    async fn test_click_target_no_match() {
        let page = FakePage::new("https://u.example.com/home", "Home");
        page.add_element("Contact Us", "a", Some("https://u.example.com/contact"), 10.0);

        let err = click_target(
            &page,
            "Guest Pay",
            &synonyms(&["pay as guest"]),
            &SnapshotConfig::default(),
            &ResolverWeights::default(),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
        match err {
            Error::NoMatch { target, synonyms } => {
                assert_eq!(target, "Guest Pay");
                assert_eq!(synonyms, vec!["pay as guest".to_string()]);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(page.clicks().is_empty());
    }

    #[tokio::test]
    async fn test_click_retries_stale_element() {
        let page = FakePage::new("https://u.example.com/home", "Home");
        page.add_element("Pay Bill", "a", Some("https://u.example.com/pay"), 10.0);
        page.set_stale_clicks(2);

        let el = element(0, "Pay Bill", TagKind::Link, Some("https://u.example.com/pay"));
        click_element(&page, &el, Duration::from_secs(2)).await.unwrap();
        assert_eq!(page.clicks(), vec!["Pay Bill".to_string()]);
    }

    #[tokio::test]
    async fn test_click_gives_up_when_element_never_returns() {
        let page = FakePage::new("https://u.example.com/home", "Home");
        page.set_stale_clicks(u32::MAX);

        let el = element(0, "Pay Bill", TagKind::Link, None);
        let err = click_element(&page, &el, Duration::from_millis(400)).await.unwrap_err();
        assert!(matches!(err, Error::Browser(_) | Error::Timeout(_)));
    }
}
