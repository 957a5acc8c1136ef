//! Access Engine (spec.md §4.2): deterministic allow/deny decision over
//! global and per-instance phone-pattern rules.

use crate::error::Result;
use crate::storage::access::{AccessRule, AccessStore, RuleType};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub allowed: bool,
    pub matched_rule_id: Option<i64>,
}

pub struct AccessEngine {
    store: AccessStore,
}

/// A rule plus its precomputed specificity tier, used only for scoring.
struct Scored<'a> {
    rule: &'a AccessRule,
    instance_scoped: bool,
    exact: bool,
    prefix_len: usize,
}

impl AccessEngine {
    pub fn new(store: AccessStore) -> Self {
        Self { store }
    }

    /// spec.md §4.2: strip non-digits except a leading `+`; empty ⇒ allow.
    pub fn normalize_phone(phone: &str) -> String {
        let mut out = String::new();
        for (i, c) in phone.chars().enumerate() {
            if c == '+' && i == 0 {
                out.push(c);
            } else if c.is_ascii_digit() {
                out.push(c);
            }
        }
        out
    }

    pub async fn check(&self, phone: &str, instance_name: &str) -> Result<Decision> {
        let normalized = Self::normalize_phone(phone);
        if normalized.is_empty() {
            return Ok(Decision { allowed: true, matched_rule_id: None });
        }

        let candidates = self.store.candidates(instance_name).await?;

        // spec.md §4.2 step 4: allowlist posture holds when any allow rule
        // exists for this instance or globally, regardless of whether it
        // matched this particular phone.
        let allowlist_posture = candidates.iter().any(|r| r.rule_type == RuleType::Allow);

        let matches: Vec<Scored> = candidates
            .iter()
            .filter(|r| rule_matches(&r.phone_pattern, &normalized))
            .map(|r| Scored {
                rule: r,
                instance_scoped: r.instance_name.is_some(),
                exact: !r.phone_pattern.ends_with('*'),
                prefix_len: r.phone_pattern.trim_end_matches('*').len(),
            })
            .collect();

        if matches.is_empty() {
            return Ok(Decision { allowed: !allowlist_posture, matched_rule_id: None });
        }

        let winner = matches
            .iter()
            .max_by(|a, b| {
                // spec.md §4.2 step 3 + tie-break: instance-scoped beats
                // global; exact beats prefix; longer prefix beats shorter;
                // ties broken by lowest id.
                a.instance_scoped
                    .cmp(&b.instance_scoped)
                    .then(a.exact.cmp(&b.exact))
                    .then(a.prefix_len.cmp(&b.prefix_len))
                    .then(b.rule.id.cmp(&a.rule.id))
            })
            .expect("matches is non-empty");

        let top_tier = (winner.instance_scoped, winner.exact, winner.prefix_len);
        let top_tier_matches: Vec<&Scored> = matches
            .iter()
            .filter(|m| (m.instance_scoped, m.exact, m.prefix_len) == top_tier)
            .collect();

        if let Some(block) = top_tier_matches.iter().find(|m| m.rule.rule_type == RuleType::Block) {
            return Ok(Decision { allowed: false, matched_rule_id: Some(block.rule.id) });
        }
        if let Some(allow) = top_tier_matches.iter().find(|m| m.rule.rule_type == RuleType::Allow) {
            return Ok(Decision { allowed: true, matched_rule_id: Some(allow.rule.id) });
        }

        Ok(Decision { allowed: !allowlist_posture, matched_rule_id: None })
    }
}

/// `+*` matches any non-empty phone; exact patterns require full equality;
/// prefix patterns require the phone to start with the pattern's prefix.
fn rule_matches(pattern: &str, normalized_phone: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => normalized_phone.starts_with(prefix),
        None => normalized_phone == pattern,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_engine() -> AccessEngine {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        AccessEngine::new(AccessStore::new(pool))
    }

    #[test]
    fn normalize_strips_formatting_but_keeps_leading_plus() {
        assert_eq!(AccessEngine::normalize_phone("+1 (555) 123-4567"), "+15551234567");
    }

    #[tokio::test]
    async fn empty_phone_short_circuits_to_allow() {
        let engine = setup_engine().await;
        let decision = engine.check("", "acme").await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn wildcard_plus_star_matches_any_nonempty_phone() {
        let engine = setup_engine().await;
        engine.store.insert("+*", RuleType::Allow, None).await.unwrap();
        let decision = engine.check("+15551234567", "acme").await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn instance_scoped_block_beats_global_allow_at_same_specificity() {
        let engine = setup_engine().await;
        engine.store.insert("+1555*", RuleType::Allow, None).await.unwrap();
        engine.store.insert("+1555*", RuleType::Block, Some("acme")).await.unwrap();
        let decision = engine.check("+15551234567", "acme").await.unwrap();
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn longer_prefix_wins_within_same_tier() {
        let engine = setup_engine().await;
        engine.store.insert("+1555*", RuleType::Block, Some("acme")).await.unwrap();
        engine.store.insert("+15551234*", RuleType::Allow, Some("acme")).await.unwrap();
        let decision = engine.check("+15551234567", "acme").await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn allowlist_posture_denies_unmatched_phone_when_allow_rule_exists() {
        let engine = setup_engine().await;
        engine.store.insert("+44*", RuleType::Allow, None).await.unwrap();
        let decision = engine.check("+15551234567", "acme").await.unwrap();
        assert!(!decision.allowed);
    }

    #[tokio::test]
    async fn open_posture_allows_when_no_rules_exist_at_all() {
        let engine = setup_engine().await;
        let decision = engine.check("+15551234567", "acme").await.unwrap();
        assert!(decision.allowed);
    }

    #[tokio::test]
    async fn block_only_ruleset_is_not_allowlist_posture() {
        let engine = setup_engine().await;
        engine.store.insert("+1999*", RuleType::Block, None).await.unwrap();
        let decision = engine.check("+15551234567", "acme").await.unwrap();
        assert!(decision.allowed);
    }
}
