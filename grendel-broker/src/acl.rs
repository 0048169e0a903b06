//! In-memory ACL cache.
//!
//! Holds users, each user's rules sorted by descending priority, and two
//! topic trees indexing the subscribe-allowing and publish-allowing rules.
//! Decisions are memoized in a bounded map that stops accepting inserts
//! when full and is wiped on every user or rule mutation, so no decision
//! ever outlives the rules it was computed from.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::debug;

use grendel_storage::types::{AclRule, User};
use grendel_storage::UserStore;

use crate::topic_tree::TopicTree;
use crate::Result;

/// Operation being authorized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AclOp {
    Subscribe,
    Publish,
}

impl AclOp {
    fn as_str(self) -> &'static str {
        match self {
            AclOp::Subscribe => "subscribe",
            AclOp::Publish => "publish",
        }
    }
}

/// Outcome of an authorization check, with the rule that granted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclDecision {
    pub allowed: bool,
    /// Id of the highest-priority matching rule, when one decided.
    pub matched_rule: Option<i64>,
}

impl AclDecision {
    fn deny() -> Self {
        AclDecision {
            allowed: false,
            matched_rule: None,
        }
    }

    fn allow() -> Self {
        AclDecision {
            allowed: true,
            matched_rule: None,
        }
    }
}

#[derive(Default)]
struct AclState {
    users: HashMap<String, User>,
    /// Per-user rules, descending priority, stable by id.
    user_acls: HashMap<String, Vec<Arc<AclRule>>>,
    /// Rules that grant subscribe, keyed by (username, rule id).
    subscribe_tree: TopicTree<(String, i64), Arc<AclRule>>,
    /// Rules that grant publish, keyed by (username, rule id).
    publish_tree: TopicTree<(String, i64), Arc<AclRule>>,
}

impl AclState {
    fn build(users: Vec<User>, mut rules: Vec<AclRule>) -> Self {
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.id.cmp(&b.id)));

        let mut state = AclState {
            users: users.into_iter().map(|u| (u.username.clone(), u)).collect(),
            ..Default::default()
        };

        for rule in rules {
            let rule = Arc::new(rule);
            let key = (rule.username.clone(), rule.id);
            if rule.can_subscribe {
                state
                    .subscribe_tree
                    .insert(&rule.topic_pattern, key.clone(), Arc::clone(&rule));
            }
            if rule.can_publish {
                state
                    .publish_tree
                    .insert(&rule.topic_pattern, key, Arc::clone(&rule));
            }
            state
                .user_acls
                .entry(rule.username.clone())
                .or_default()
                .push(rule);
        }

        state
    }
}

/// Process-wide authorization cache, filled from the user store and
/// refreshed on an interval or after admin mutations.
pub struct AclCache {
    state: RwLock<AclState>,
    decisions: RwLock<HashMap<(AclOp, String, String), AclDecision>>,
    max_decisions: usize,
}

impl AclCache {
    pub fn new(max_decisions: usize) -> Self {
        AclCache {
            state: RwLock::new(AclState::default()),
            decisions: RwLock::new(HashMap::new()),
            max_decisions,
        }
    }

    /// Replace the cached users and rules; clears the decision cache
    /// before returning, so callers observe linearizable mutations.
    pub fn load(&self, users: Vec<User>, rules: Vec<AclRule>) {
        let fresh = AclState::build(users, rules);
        {
            let mut state = self.state.write().expect("acl state lock poisoned");
            *state = fresh;
        }
        self.clear_decisions();
    }

    /// Re-read everything from the store and swap it in.
    pub async fn refresh(&self, store: &dyn UserStore) -> Result<()> {
        let (users, rules) = store.load_all_users_and_acls().await?;
        debug!(users = users.len(), rules = rules.len(), "acl cache refreshed");
        self.load(users, rules);
        Ok(())
    }

    /// Drop all memoized decisions. Called by every mutation path.
    pub fn clear_decisions(&self) {
        self.decisions
            .write()
            .expect("acl decision lock poisoned")
            .clear();
    }

    pub fn user(&self, username: &str) -> Option<User> {
        let state = self.state.read().expect("acl state lock poisoned");
        state.users.get(username).cloned()
    }

    /// The user's rules in evaluation order (descending priority).
    pub fn rules_for(&self, username: &str) -> Vec<AclRule> {
        let state = self.state.read().expect("acl state lock poisoned");
        state
            .user_acls
            .get(username)
            .map(|rules| rules.iter().map(|r| (**r).clone()).collect())
            .unwrap_or_default()
    }

    pub fn can_subscribe(&self, username: &str, filter: &str) -> bool {
        self.decide(AclOp::Subscribe, username, filter).allowed
    }

    pub fn can_publish(&self, username: &str, topic_name: &str) -> bool {
        self.decide(AclOp::Publish, username, topic_name).allowed
    }

    /// Full decision: disabled or unknown users deny, admins allow,
    /// the per-op capability flag gates, then the highest-priority
    /// matching rule that grants the operation decides.
    pub fn decide(&self, op: AclOp, username: &str, topic_name: &str) -> AclDecision {
        let cache_key = (op, username.to_string(), topic_name.to_string());
        if let Some(decision) = self
            .decisions
            .read()
            .expect("acl decision lock poisoned")
            .get(&cache_key)
        {
            return *decision;
        }

        let decision = self.decide_uncached(op, username, topic_name);

        let mut decisions = self.decisions.write().expect("acl decision lock poisoned");
        // A full cache silently refuses new entries.
        if decisions.len() < self.max_decisions {
            decisions.insert(cache_key, decision);
        }
        decision
    }

    fn decide_uncached(&self, op: AclOp, username: &str, topic_name: &str) -> AclDecision {
        let state = self.state.read().expect("acl state lock poisoned");

        let Some(user) = state.users.get(username) else {
            debug!(username, "acl deny: unknown user");
            return AclDecision::deny();
        };
        if !user.enabled {
            debug!(username, "acl deny: user disabled");
            return AclDecision::deny();
        }
        if user.is_admin {
            return AclDecision::allow();
        }

        let capability = match op {
            AclOp::Subscribe => user.can_subscribe,
            AclOp::Publish => user.can_publish,
        };
        if !capability {
            debug!(username, op = op.as_str(), "acl deny: capability flag off");
            return AclDecision::deny();
        }

        let tree = match op {
            AclOp::Subscribe => &state.subscribe_tree,
            AclOp::Publish => &state.publish_tree,
        };

        // The walk also resolves wildcard *filters* (subscribe): a `+` or
        // `#` level in the checked name hits the rule tree's own wildcard
        // children, so a filter is granted iff a rule pattern covers it.
        let matched = tree
            .matches(topic_name)
            .into_iter()
            .filter(|((rule_user, _), _)| rule_user.as_str() == username)
            .map(|(_, rule)| rule)
            .max_by(|a, b| a.priority.cmp(&b.priority).then(b.id.cmp(&a.id)));

        match matched {
            Some(rule) => AclDecision {
                allowed: true,
                matched_rule: Some(rule.id),
            },
            None => {
                debug!(
                    username,
                    topic = topic_name,
                    op = op.as_str(),
                    "acl deny: no matching rule"
                );
                AclDecision::deny()
            }
        }
    }

    #[cfg(test)]
    fn cached_decisions(&self) -> usize {
        self.decisions
            .read()
            .expect("acl decision lock poisoned")
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn user(name: &str) -> User {
        User::new(name, "$hash")
    }

    fn rule(id: i64, username: &str, pattern: &str, sub: bool, publ: bool, priority: i32) -> AclRule {
        AclRule {
            id,
            username: username.to_string(),
            topic_pattern: pattern.to_string(),
            can_subscribe: sub,
            can_publish: publ,
            priority,
            created_at: Utc::now(),
        }
    }

    fn cache_with(users: Vec<User>, rules: Vec<AclRule>) -> AclCache {
        let cache = AclCache::new(100);
        cache.load(users, rules);
        cache
    }

    #[test]
    fn test_unknown_and_disabled_users_deny() {
        let mut disabled = user("off");
        disabled.enabled = false;
        let cache = cache_with(vec![disabled], vec![]);

        assert!(!cache.can_publish("ghost", "a"));
        assert!(!cache.can_publish("off", "a"));
    }

    #[test]
    fn test_admin_allows_everything() {
        let mut admin = user("root");
        admin.is_admin = true;
        let cache = cache_with(vec![admin], vec![]);

        assert!(cache.can_publish("root", "any/topic"));
        assert!(cache.can_subscribe("root", "any/#"));
    }

    #[test]
    fn test_capability_flag_gates() {
        let mut u = user("pubonly");
        u.can_subscribe = false;
        let cache = cache_with(
            vec![u],
            vec![rule(1, "pubonly", "#", true, true, 1)],
        );

        assert!(cache.can_publish("pubonly", "a"));
        assert!(!cache.can_subscribe("pubonly", "a"));
    }

    #[test]
    fn test_rule_matching() {
        let cache = cache_with(
            vec![user("u")],
            vec![
                rule(1, "u", "sensors/#", false, true, 10),
                rule(2, "u", "control/+/cmd", true, false, 5),
            ],
        );

        assert!(cache.can_publish("u", "sensors/1/temp"));
        assert!(!cache.can_subscribe("u", "sensors/1/temp"));
        assert!(cache.can_subscribe("u", "control/a/cmd"));
        assert!(!cache.can_publish("u", "control/a/cmd"));
        assert!(!cache.can_publish("u", "other"));
    }

    #[test]
    fn test_highest_priority_rule_decides() {
        let cache = cache_with(
            vec![user("u")],
            vec![
                rule(1, "u", "a/#", false, true, 10),
                rule(2, "u", "a/b", false, true, 20),
            ],
        );

        let decision = cache.decide(AclOp::Publish, "u", "a/b");
        assert!(decision.allowed);
        assert_eq!(decision.matched_rule, Some(2));

        // Only the broad rule matches elsewhere.
        let decision = cache.decide(AclOp::Publish, "u", "a/c");
        assert_eq!(decision.matched_rule, Some(1));
    }

    #[test]
    fn test_rules_do_not_leak_between_users() {
        let cache = cache_with(
            vec![user("a"), user("b")],
            vec![rule(1, "a", "#", true, true, 1)],
        );

        assert!(cache.can_publish("a", "t"));
        assert!(!cache.can_publish("b", "t"));
    }

    #[test]
    fn test_wildcard_filter_authorization() {
        // Subscribing with a wildcard filter is allowed iff a rule
        // pattern covers the filter.
        let cache = cache_with(
            vec![user("u")],
            vec![rule(1, "u", "sensors/#", true, false, 1)],
        );

        assert!(cache.can_subscribe("u", "sensors/#"));
        assert!(cache.can_subscribe("u", "sensors/+/temp"));
        assert!(cache.can_subscribe("u", "sensors/1/temp"));
        assert!(!cache.can_subscribe("u", "other/#"));
        // A filter broader than the grant is not covered.
        assert!(!cache.can_subscribe("u", "#"));
    }

    #[test]
    fn test_narrow_rule_does_not_grant_broad_filter() {
        let cache = cache_with(
            vec![user("u")],
            vec![rule(1, "u", "a/+/c", true, false, 1)],
        );

        assert!(cache.can_subscribe("u", "a/b/c"));
        assert!(cache.can_subscribe("u", "a/+/c"));
        assert!(!cache.can_subscribe("u", "a/#"));
        assert!(!cache.can_subscribe("u", "a/b"));
    }

    #[test]
    fn test_decisions_are_cached_and_cleared_on_load() {
        let cache = cache_with(
            vec![user("u")],
            vec![rule(1, "u", "a/#", true, true, 1)],
        );

        assert!(cache.can_publish("u", "a/b"));
        assert_eq!(cache.cached_decisions(), 1);

        // Mutation: the rule disappears; the stale allow must not survive.
        cache.load(vec![user("u")], vec![]);
        assert_eq!(cache.cached_decisions(), 0);
        assert!(!cache.can_publish("u", "a/b"));
    }

    #[test]
    fn test_cache_bound_refuses_silently() {
        let cache = AclCache::new(2);
        cache.load(vec![user("u")], vec![rule(1, "u", "#", true, true, 1)]);

        assert!(cache.can_publish("u", "t/1"));
        assert!(cache.can_publish("u", "t/2"));
        assert!(cache.can_publish("u", "t/3"));
        // Third decision was computed but not stored.
        assert_eq!(cache.cached_decisions(), 2);
    }

    #[test]
    fn test_rules_for_is_priority_sorted() {
        let cache = cache_with(
            vec![user("u")],
            vec![
                rule(1, "u", "a", true, true, 5),
                rule(2, "u", "b", true, true, 50),
                rule(3, "u", "c", true, true, 20),
            ],
        );

        let priorities: Vec<i32> = cache.rules_for("u").iter().map(|r| r.priority).collect();
        assert_eq!(priorities, vec![50, 20, 5]);
    }
}
