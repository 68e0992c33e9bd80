//! Admission control: allow/block rules with wildcard and scope
//! precedence.
//!
//! Evaluation is deterministic: instance-scoped rules are consulted
//! before globals; within a set an exact pattern beats any wildcard and a
//! longer wildcard prefix beats a shorter one; at equal specificity a
//! block beats an allow; with no matching rule the decision is allow.

use omnihub_schema::{AccessRule, RuleType};
use omnihub_store::ConfigStore;
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub allow: bool,
    pub matched_rule: Option<AccessRule>,
}

impl Decision {
    fn default_allow() -> Self {
        Self {
            allow: true,
            matched_rule: None,
        }
    }
}

/// Specificity of a pattern match: exact beats wildcard, longer beats
/// shorter. `None` means the pattern does not match the peer at all.
fn match_specificity(pattern: &str, peer: &str) -> Option<(u8, usize)> {
    match pattern.strip_suffix('*') {
        Some(prefix) => peer.starts_with(prefix).then_some((1, prefix.len())),
        None => (pattern == peer).then_some((2, pattern.len())),
    }
}

fn decide_within<'a>(candidates: &[(&'a AccessRule, (u8, usize))]) -> Option<Decision> {
    let best = candidates.iter().map(|(_, s)| *s).max()?;
    let winners: Vec<&AccessRule> = candidates
        .iter()
        .filter(|(_, s)| *s == best)
        .map(|(r, _)| *r)
        .collect();

    // Deny-wins at equal specificity; newest rule breaks remaining ties.
    let pick = |effect: RuleType| {
        winners
            .iter()
            .filter(|r| r.rule_type == effect)
            .max_by_key(|r| (r.created_at, r.id))
            .copied()
    };
    let matched = pick(RuleType::Block).or_else(|| pick(RuleType::Allow))?;
    Some(Decision {
        allow: matched.rule_type == RuleType::Allow,
        matched_rule: Some(matched.clone()),
    })
}

/// Evaluate the admission decision for `(instance, peer)` against a rule
/// set. Pure function; `peer` is a phone in E.164 for WhatsApp or the
/// channel-native id elsewhere.
pub fn evaluate(rules: &[AccessRule], instance: &str, peer: &str) -> Decision {
    let matching = |scoped: bool| -> Vec<(&AccessRule, (u8, usize))> {
        rules
            .iter()
            .filter(|r| match (&r.instance_name, scoped) {
                (Some(name), true) => name == instance,
                (None, false) => true,
                _ => false,
            })
            .filter_map(|r| match_specificity(&r.phone_number, peer).map(|s| (r, s)))
            .collect()
    };

    if let Some(decision) = decide_within(&matching(true)) {
        return decision;
    }
    if let Some(decision) = decide_within(&matching(false)) {
        return decision;
    }
    Decision::default_allow()
}

/// Store-backed admission service used by the router and the dry-run
/// admin endpoint.
#[derive(Clone)]
pub struct AccessControl {
    store: ConfigStore,
}

impl AccessControl {
    pub fn new(store: ConfigStore) -> Self {
        Self { store }
    }

    pub async fn check(&self, instance: &str, peer: &str) -> omnihub_store::Result<Decision> {
        let rules = self.store.rules_for_instance(instance).await?;
        Ok(evaluate(&rules, instance, peer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    fn rule(
        id: i64,
        instance: Option<&str>,
        pattern: &str,
        rule_type: RuleType,
    ) -> AccessRule {
        AccessRule {
            id,
            instance_name: instance.map(str::to_owned),
            phone_number: pattern.into(),
            rule_type,
            created_at: Utc::now() + Duration::seconds(id),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn no_rules_defaults_to_allow() {
        let decision = evaluate(&[], "prod-wa", "+5511990000101");
        assert!(decision.allow);
        assert!(decision.matched_rule.is_none());
    }

    #[test]
    fn global_wildcard_blocks() {
        let rules = [rule(1, None, "+5511*", RuleType::Block)];
        let decision = evaluate(&rules, "prod-wa", "+5511990000101");
        assert!(!decision.allow);
        assert_eq!(decision.matched_rule.unwrap().id, 1);
    }

    #[test]
    fn exact_match_beats_wildcard() {
        let rules = [
            rule(1, None, "+5511*", RuleType::Block),
            rule(2, None, "+5511990000101", RuleType::Allow),
        ];
        let decision = evaluate(&rules, "prod-wa", "+5511990000101");
        assert!(decision.allow);
        assert_eq!(decision.matched_rule.unwrap().id, 2);

        // Another number under the wildcard stays blocked.
        let other = evaluate(&rules, "prod-wa", "+5511990000999");
        assert!(!other.allow);
    }

    #[test]
    fn longer_wildcard_beats_shorter() {
        let rules = [
            rule(1, None, "+55*", RuleType::Block),
            rule(2, None, "+5511*", RuleType::Allow),
        ];
        assert!(evaluate(&rules, "prod-wa", "+5511990000101").allow);
        assert!(!evaluate(&rules, "prod-wa", "+5521990000101").allow);
    }

    #[test]
    fn block_wins_at_equal_specificity() {
        let rules = [
            rule(1, None, "+5511*", RuleType::Allow),
            rule(2, None, "+5511*", RuleType::Block),
        ];
        assert!(!evaluate(&rules, "prod-wa", "+5511990000101").allow);
    }

    #[test]
    fn instance_scoped_dominates_global() {
        let rules = [
            rule(1, None, "+5511990000101", RuleType::Block),
            rule(2, Some("prod-wa"), "+5511*", RuleType::Allow),
        ];
        // Scoped set matches, so the (more specific) global block is never
        // consulted for this instance.
        assert!(evaluate(&rules, "prod-wa", "+5511990000101").allow);
        // Another instance only sees the global rule.
        assert!(!evaluate(&rules, "other", "+5511990000101").allow);
    }

    #[test]
    fn rules_for_other_instances_are_ignored() {
        let rules = [rule(1, Some("other"), "+5511*", RuleType::Block)];
        assert!(evaluate(&rules, "prod-wa", "+5511990000101").allow);
    }

    #[test]
    fn non_phone_peer_exact_match() {
        let rules = [rule(1, None, "U123", RuleType::Block)];
        assert!(!evaluate(&rules, "dc", "U123").allow);
        assert!(evaluate(&rules, "dc", "U1234").allow);
    }

    #[test]
    fn wildcard_only_matches_everything() {
        let rules = [rule(1, None, "*", RuleType::Block)];
        assert!(!evaluate(&rules, "prod-wa", "+15551234567").allow);
        assert!(!evaluate(&rules, "prod-wa", "anything").allow);
    }

    #[tokio::test]
    async fn store_backed_check() {
        let store = ConfigStore::open_in_memory().unwrap();
        store
            .add_access_rule(None, "+5511*".into(), RuleType::Block)
            .await
            .unwrap();
        let access = AccessControl::new(store);
        let decision = access.check("prod-wa", "+5511990000101").await.unwrap();
        assert!(!decision.allow);
        let decision = access.check("prod-wa", "+15551234567").await.unwrap();
        assert!(decision.allow);
    }
}
