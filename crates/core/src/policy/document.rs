//! Authoring format for policies and watcher rules.
//!
//! Administrators write policy bundles as TOML or JSON. A bundle is decoded into the
//! typed aggregates and validated as a whole before anything is stored, so a store never
//! sees a half-valid policy.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::org::{CompanyId, RoleId, UserId};
use crate::domain::policy::{
    ApproverScope, Policy, PolicyId, RequestEvent, StepTemplate, TriggerPredicate, WatcherRule,
    WatcherRuleId, WatcherSpec, WatcherTarget,
};
use crate::policy::validation::{validate_policy, validate_watcher_rule, PolicyValidationError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DocumentFormat {
    Toml,
    Json,
}

impl DocumentFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|extension| extension.to_str()) {
            Some(extension) if extension.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Toml,
        }
    }
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("could not parse TOML policy document: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("could not parse JSON policy document: {0}")]
    Json(#[from] serde_json::Error),
    #[error("`{owner}` uses unknown or incomplete scope `{scope}`")]
    InvalidScope { owner: String, scope: String },
    #[error("`{owner}` lists unknown request event `{event}`")]
    InvalidEvent { owner: String, event: String },
    #[error("`{owner}` has a watcher that names neither a user nor a role")]
    InvalidWatcher { owner: String },
    #[error(transparent)]
    Validation(#[from] PolicyValidationError),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyBundleDocument {
    #[serde(default)]
    pub policies: Vec<PolicyDocument>,
    #[serde(default)]
    pub watcher_rules: Vec<WatcherRuleDocument>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub id: String,
    pub company_id: String,
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub trigger: TriggerPredicate,
    pub steps: Vec<StepDocument>,
    #[serde(default)]
    pub watchers: Vec<WatcherDocument>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepDocument {
    pub sequence_order: u32,
    pub role: String,
    pub scope: String,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherDocument {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub events: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherRuleDocument {
    pub id: String,
    pub company_id: String,
    pub name: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub trigger: TriggerPredicate,
    pub watchers: Vec<WatcherDocument>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PolicyBundle {
    pub policies: Vec<Policy>,
    pub watcher_rules: Vec<WatcherRule>,
}

fn default_active() -> bool {
    true
}

pub fn parse_bundle(raw: &str, format: DocumentFormat) -> Result<PolicyBundle, DocumentError> {
    let document: PolicyBundleDocument = match format {
        DocumentFormat::Toml => toml::from_str(raw)?,
        DocumentFormat::Json => serde_json::from_str(raw)?,
    };
    document.into_bundle()
}

impl PolicyBundleDocument {
    pub fn into_bundle(self) -> Result<PolicyBundle, DocumentError> {
        let policies = self
            .policies
            .into_iter()
            .map(PolicyDocument::into_policy)
            .collect::<Result<Vec<_>, _>>()?;
        let watcher_rules = self
            .watcher_rules
            .into_iter()
            .map(WatcherRuleDocument::into_rule)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(PolicyBundle { policies, watcher_rules })
    }
}

impl PolicyDocument {
    pub fn into_policy(self) -> Result<Policy, DocumentError> {
        let owner = self.id.clone();
        let steps = self
            .steps
            .into_iter()
            .map(|step| {
                let scope = ApproverScope::from_parts(&step.scope, step.user_id).ok_or_else(|| {
                    DocumentError::InvalidScope { owner: owner.clone(), scope: step.scope.clone() }
                })?;
                Ok(StepTemplate {
                    sequence_order: step.sequence_order,
                    approver_role_id: RoleId(step.role),
                    scope,
                })
            })
            .collect::<Result<Vec<_>, DocumentError>>()?;
        let watchers = convert_watchers(self.watchers, &owner)?;

        let policy = Policy {
            id: PolicyId(self.id),
            company_id: CompanyId(self.company_id),
            name: self.name,
            is_active: self.active,
            trigger: self.trigger,
            steps,
            watchers,
        };
        validate_policy(&policy)?;
        Ok(policy)
    }
}

impl WatcherRuleDocument {
    pub fn into_rule(self) -> Result<WatcherRule, DocumentError> {
        let watchers = convert_watchers(self.watchers, &self.id)?;
        let rule = WatcherRule {
            id: WatcherRuleId(self.id),
            company_id: CompanyId(self.company_id),
            name: self.name,
            is_active: self.active,
            trigger: self.trigger,
            watchers,
        };
        validate_watcher_rule(&rule)?;
        Ok(rule)
    }
}

fn convert_watchers(
    watchers: Vec<WatcherDocument>,
    owner: &str,
) -> Result<Vec<WatcherSpec>, DocumentError> {
    watchers.into_iter().map(|watcher| convert_watcher(watcher, owner)).collect()
}

fn convert_watcher(watcher: WatcherDocument, owner: &str) -> Result<WatcherSpec, DocumentError> {
    let events = watcher
        .events
        .iter()
        .map(|event| {
            RequestEvent::parse(event).ok_or_else(|| DocumentError::InvalidEvent {
                owner: owner.to_string(),
                event: event.clone(),
            })
        })
        .collect::<Result<BTreeSet<_>, _>>()?;

    let target = match (watcher.user_id, watcher.role) {
        (Some(user_id), None) => WatcherTarget::User { user_id: UserId(user_id) },
        (None, Some(role)) => {
            let scope_kind = watcher.scope.unwrap_or_else(|| "company_wide".to_string());
            let scope = ApproverScope::from_parts(&scope_kind, None).ok_or_else(|| {
                DocumentError::InvalidScope { owner: owner.to_string(), scope: scope_kind.clone() }
            })?;
            WatcherTarget::Role { role_id: RoleId(role), scope }
        }
        _ => return Err(DocumentError::InvalidWatcher { owner: owner.to_string() }),
    };

    Ok(WatcherSpec { target, events })
}

#[cfg(test)]
mod tests {
    use super::{parse_bundle, DocumentError, DocumentFormat};
    use crate::domain::policy::{ApproverScope, RequestEvent, TriggerAxis, WatcherTarget};
    use crate::policy::validation::PolicyValidationError;

    const BUNDLE: &str = r#"
[[policies]]
id = "pol-project-vacation"
company_id = "acme"
name = "Project vacation"

[policies.trigger]
request_types = ["vacation"]
project_types = ["client"]

[[policies.steps]]
sequence_order = 1
role = "tech_lead"
scope = "same_project"

[[policies.steps]]
sequence_order = 2
role = "ceo"
scope = "specific_user"
user_id = "u-ceo"

[[policies.watchers]]
role = "hr"
events = ["approved", "canceled"]

[[watcher_rules]]
id = "wr-payroll"
company_id = "acme"
name = "Payroll copy"

[[watcher_rules.watchers]]
user_id = "u-payroll"
"#;

    #[test]
    fn parses_toml_bundle_into_typed_aggregates() {
        let bundle = parse_bundle(BUNDLE, DocumentFormat::Toml).expect("bundle parses");

        assert_eq!(bundle.policies.len(), 1);
        let policy = &bundle.policies[0];
        assert!(policy.is_active);
        assert!(policy.trigger.axis(TriggerAxis::ProjectType).contains("client"));
        assert_eq!(policy.steps[0].scope, ApproverScope::SameProject);
        assert_eq!(policy.steps[1].scope.specific_user().map(|id| id.0.as_str()), Some("u-ceo"));
        assert!(matches!(
            policy.watchers[0].target,
            WatcherTarget::Role { scope: ApproverScope::CompanyWide, .. }
        ));
        assert!(policy.watchers[0].events.contains(&RequestEvent::Canceled));

        assert_eq!(bundle.watcher_rules.len(), 1);
        assert_eq!(bundle.watcher_rules[0].id.0, "wr-payroll");
    }

    #[test]
    fn parses_json_bundle() {
        let raw = r#"{
            "policies": [{
                "id": "pol-sick",
                "company_id": "acme",
                "name": "Sick leave",
                "steps": [{"sequence_order": 1, "role": "boss", "scope": "same_department"}]
            }]
        }"#;
        let bundle = parse_bundle(raw, DocumentFormat::Json).expect("json parses");
        assert_eq!(bundle.policies[0].steps[0].scope, ApproverScope::SameDepartment);
        assert!(bundle.watcher_rules.is_empty());
    }

    #[test]
    fn specific_user_scope_without_user_is_rejected() {
        let raw = BUNDLE.replace("user_id = \"u-ceo\"\n", "");
        let error = parse_bundle(&raw, DocumentFormat::Toml).expect_err("scope is incomplete");
        assert!(matches!(error, DocumentError::InvalidScope { ref scope, .. } if scope == "specific_user"));
    }

    #[test]
    fn duplicate_sequence_orders_fail_validation_at_write_time() {
        let raw = BUNDLE.replace("sequence_order = 2", "sequence_order = 1");
        let error = parse_bundle(&raw, DocumentFormat::Toml).expect_err("duplicate order");
        assert!(matches!(
            error,
            DocumentError::Validation(PolicyValidationError::DuplicateSequenceOrder { .. })
        ));
    }

    #[test]
    fn unknown_events_are_rejected() {
        let raw = BUNDLE.replace("\"canceled\"", "\"archived\"");
        let error = parse_bundle(&raw, DocumentFormat::Toml).expect_err("unknown event");
        assert!(matches!(error, DocumentError::InvalidEvent { ref event, .. } if event == "archived"));
    }

    #[test]
    fn format_follows_file_extension() {
        assert_eq!(
            DocumentFormat::from_path(std::path::Path::new("policies.JSON")),
            DocumentFormat::Json
        );
        assert_eq!(
            DocumentFormat::from_path(std::path::Path::new("policies.toml")),
            DocumentFormat::Toml
        );
    }
}
