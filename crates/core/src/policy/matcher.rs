use std::collections::BTreeSet;

use tracing::warn;

use crate::domain::leave_request::TriggerContext;
use crate::domain::policy::{Policy, TriggerAxis, TriggerPredicate};
use crate::policy::validation::validate_policy;

const WILDCARD_VALUES: [&str; 2] = ["any", "*"];

/// Selects every active policy whose trigger accepts a request. Matches carry no
/// precedence: each one instantiates its own approval chain.
#[derive(Clone, Debug, Default)]
pub struct PolicyMatcher;

impl PolicyMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Returns the matching policies ordered by id. Inactive policies and policies
    /// whose stored definition no longer validates are skipped.
    pub fn match_policies(&self, trigger: &TriggerContext, policies: &[Policy]) -> Vec<Policy> {
        let mut seen = BTreeSet::new();
        let mut matched: Vec<Policy> = policies
            .iter()
            .filter(|policy| policy.is_active)
            .filter(|policy| match validate_policy(policy) {
                Ok(()) => true,
                Err(error) => {
                    warn!(
                        event_name = "policy.match.skipped_corrupt",
                        policy_id = %policy.id,
                        error = %error,
                        "skipping policy with invalid definition"
                    );
                    false
                }
            })
            .filter(|policy| trigger_matches(&policy.trigger, trigger))
            .filter(|policy| seen.insert(policy.id.clone()))
            .cloned()
            .collect();

        matched.sort_by(|left, right| left.id.cmp(&right.id));
        matched
    }
}

/// Every axis must pass; within an axis any listed value (or a wildcard) passes.
pub fn trigger_matches(predicate: &TriggerPredicate, trigger: &TriggerContext) -> bool {
    TriggerAxis::ALL
        .into_iter()
        .all(|axis| axis_passes(predicate.axis(axis), trigger_value(trigger, axis)))
}

fn trigger_value(trigger: &TriggerContext, axis: TriggerAxis) -> Option<&str> {
    match axis {
        TriggerAxis::RequestType => Some(trigger.request_type.as_str()),
        TriggerAxis::ContractType => trigger.contract_type_id.as_deref(),
        TriggerAxis::SubjectRole => trigger.subject_role_id.as_deref(),
        TriggerAxis::Department => trigger.department_id.as_deref(),
        TriggerAxis::ProjectType => trigger.project_type.as_deref(),
    }
}

fn axis_passes(allowed: &BTreeSet<String>, value: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }

    let allowed: BTreeSet<String> = allowed.iter().map(|candidate| normalize_key(candidate)).collect();
    if WILDCARD_VALUES.iter().any(|wildcard| allowed.contains(*wildcard)) {
        return true;
    }

    match value.map(normalize_key) {
        Some(value) if !value.is_empty() => allowed.contains(&value),
        _ => false,
    }
}

fn normalize_key(raw: &str) -> String {
    raw.trim().to_ascii_lowercase()
}
