use std::collections::BTreeSet;

use thiserror::Error;

use crate::domain::policy::{
    ApproverScope, Policy, TriggerAxis, TriggerPredicate, WatcherRule, WatcherSpec, WatcherTarget,
};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PolicyValidationError {
    #[error("policy id must not be empty")]
    MissingId,
    #[error("`{owner}` must have a non-empty name")]
    MissingName { owner: String },
    #[error("`{owner}` must belong to a company")]
    MissingCompany { owner: String },
    #[error("policy `{policy_id}` must define at least one approval step")]
    NoSteps { policy_id: String },
    #[error("policy `{policy_id}` has step with sequence order 0; orders start at 1")]
    ZeroSequenceOrder { policy_id: String },
    #[error("policy `{policy_id}` defines sequence order {sequence_order} more than once")]
    DuplicateSequenceOrder { policy_id: String, sequence_order: u32 },
    #[error("policy `{policy_id}` step {sequence_order} has no approver role")]
    MissingApproverRole { policy_id: String, sequence_order: u32 },
    #[error("`{owner}` references a specific user with an empty id")]
    MissingSpecificUser { owner: String },
    #[error("`{owner}` has a blank value on trigger axis `{axis}`")]
    BlankTriggerValue { owner: String, axis: TriggerAxis },
    #[error("`{owner}` has a watcher role target with no role")]
    MissingWatcherRole { owner: String },
}

/// Checks a policy aggregate before it is written. Stored policies are expected to
/// have passed this check; the matcher re-runs it and skips anything that fails.
pub fn validate_policy(policy: &Policy) -> Result<(), PolicyValidationError> {
    let policy_id = policy.id.0.trim();
    if policy_id.is_empty() {
        return Err(PolicyValidationError::MissingId);
    }
    let owner = policy_id.to_string();

    if policy.name.trim().is_empty() {
        return Err(PolicyValidationError::MissingName { owner });
    }
    if policy.company_id.0.trim().is_empty() {
        return Err(PolicyValidationError::MissingCompany { owner });
    }

    validate_trigger(&policy.trigger, &owner)?;

    if policy.steps.is_empty() {
        return Err(PolicyValidationError::NoSteps { policy_id: owner });
    }

    let mut seen = BTreeSet::new();
    for step in &policy.steps {
        if step.sequence_order == 0 {
            return Err(PolicyValidationError::ZeroSequenceOrder { policy_id: owner });
        }
        if !seen.insert(step.sequence_order) {
            return Err(PolicyValidationError::DuplicateSequenceOrder {
                policy_id: owner,
                sequence_order: step.sequence_order,
            });
        }
        if step.approver_role_id.0.trim().is_empty() {
            return Err(PolicyValidationError::MissingApproverRole {
                policy_id: owner,
                sequence_order: step.sequence_order,
            });
        }
        validate_scope(&step.scope, &owner)?;
    }

    validate_watchers(&policy.watchers, &owner)
}

pub fn validate_watcher_rule(rule: &WatcherRule) -> Result<(), PolicyValidationError> {
    let rule_id = rule.id.0.trim();
    if rule_id.is_empty() {
        return Err(PolicyValidationError::MissingId);
    }
    let owner = rule_id.to_string();

    if rule.name.trim().is_empty() {
        return Err(PolicyValidationError::MissingName { owner });
    }
    if rule.company_id.0.trim().is_empty() {
        return Err(PolicyValidationError::MissingCompany { owner });
    }

    validate_trigger(&rule.trigger, &owner)?;
    validate_watchers(&rule.watchers, &owner)
}

fn validate_trigger(trigger: &TriggerPredicate, owner: &str) -> Result<(), PolicyValidationError> {
    for axis in TriggerAxis::ALL {
        if trigger.axis(axis).iter().any(|value| value.trim().is_empty()) {
            return Err(PolicyValidationError::BlankTriggerValue { owner: owner.to_string(), axis });
        }
    }
    Ok(())
}

fn validate_scope(scope: &ApproverScope, owner: &str) -> Result<(), PolicyValidationError> {
    match scope {
        ApproverScope::SpecificUser { user_id } if user_id.0.trim().is_empty() => {
            Err(PolicyValidationError::MissingSpecificUser { owner: owner.to_string() })
        }
        _ => Ok(()),
    }
}

fn validate_watchers(watchers: &[WatcherSpec], owner: &str) -> Result<(), PolicyValidationError> {
    for watcher in watchers {
        match &watcher.target {
            WatcherTarget::User { user_id } if user_id.0.trim().is_empty() => {
                return Err(PolicyValidationError::MissingSpecificUser {
                    owner: owner.to_string(),
                });
            }
            WatcherTarget::Role { role_id, .. } if role_id.0.trim().is_empty() => {
                return Err(PolicyValidationError::MissingWatcherRole { owner: owner.to_string() });
            }
            WatcherTarget::Role { scope, .. } => validate_scope(scope, owner)?,
            WatcherTarget::User { .. } => {}
        }
    }
    Ok(())
}
