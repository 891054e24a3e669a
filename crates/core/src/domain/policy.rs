use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::org::{CompanyId, RoleId, UserId};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PolicyId(pub String);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WatcherRuleId(pub String);

impl fmt::Display for PolicyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for WatcherRuleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerAxis {
    RequestType,
    ContractType,
    SubjectRole,
    Department,
    ProjectType,
}

impl TriggerAxis {
    pub const ALL: [TriggerAxis; 5] = [
        TriggerAxis::RequestType,
        TriggerAxis::ContractType,
        TriggerAxis::SubjectRole,
        TriggerAxis::Department,
        TriggerAxis::ProjectType,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RequestType => "request_type",
            Self::ContractType => "contract_type",
            Self::SubjectRole => "subject_role",
            Self::Department => "department",
            Self::ProjectType => "project_type",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|axis| axis.as_str() == raw.trim())
    }
}

impl fmt::Display for TriggerAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The five-axis matching predicate shared by policies and standalone watcher rules.
/// An empty axis places no constraint on requests.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPredicate {
    #[serde(default)]
    pub request_types: BTreeSet<String>,
    #[serde(default)]
    pub contract_types: BTreeSet<String>,
    #[serde(default)]
    pub subject_roles: BTreeSet<String>,
    #[serde(default)]
    pub departments: BTreeSet<String>,
    #[serde(default)]
    pub project_types: BTreeSet<String>,
}

impl TriggerPredicate {
    pub fn axis(&self, axis: TriggerAxis) -> &BTreeSet<String> {
        match axis {
            TriggerAxis::RequestType => &self.request_types,
            TriggerAxis::ContractType => &self.contract_types,
            TriggerAxis::SubjectRole => &self.subject_roles,
            TriggerAxis::Department => &self.departments,
            TriggerAxis::ProjectType => &self.project_types,
        }
    }

    pub fn axis_mut(&mut self, axis: TriggerAxis) -> &mut BTreeSet<String> {
        match axis {
            TriggerAxis::RequestType => &mut self.request_types,
            TriggerAxis::ContractType => &mut self.contract_types,
            TriggerAxis::SubjectRole => &mut self.subject_roles,
            TriggerAxis::Department => &mut self.departments,
            TriggerAxis::ProjectType => &mut self.project_types,
        }
    }

    pub fn with_values<I, S>(mut self, axis: TriggerAxis, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.axis_mut(axis).extend(values.into_iter().map(Into::into));
        self
    }
}

/// Where a step's approver role is looked up.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ApproverScope {
    SameProject,
    SameDepartment,
    CompanyWide,
    SpecificUser { user_id: UserId },
}

impl ApproverScope {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SameProject => "same_project",
            Self::SameDepartment => "same_department",
            Self::CompanyWide => "company_wide",
            Self::SpecificUser { .. } => "specific_user",
        }
    }

    pub fn specific_user(&self) -> Option<&UserId> {
        match self {
            Self::SpecificUser { user_id } => Some(user_id),
            _ => None,
        }
    }

    /// Rebuilds a scope from its stored kind and optional user column.
    pub fn from_parts(kind: &str, specific_user_id: Option<String>) -> Option<Self> {
        match (kind.trim(), specific_user_id) {
            ("same_project", None) => Some(Self::SameProject),
            ("same_department", None) => Some(Self::SameDepartment),
            ("company_wide", None) => Some(Self::CompanyWide),
            ("specific_user", Some(user_id)) => Some(Self::SpecificUser { user_id: UserId(user_id) }),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub sequence_order: u32,
    pub approver_role_id: RoleId,
    pub scope: ApproverScope,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestEvent {
    Submitted,
    Approved,
    Rejected,
    Canceled,
}

impl RequestEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Submitted => "submitted",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "submitted" => Some(Self::Submitted),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "canceled" | "cancelled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WatcherTarget {
    User { user_id: UserId },
    Role { role_id: RoleId, scope: ApproverScope },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherSpec {
    pub target: WatcherTarget,
    /// Empty means every event.
    #[serde(default)]
    pub events: BTreeSet<RequestEvent>,
}

impl WatcherSpec {
    pub fn applies_to(&self, event: RequestEvent) -> bool {
        self.events.is_empty() || self.events.contains(&event)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Policy {
    pub id: PolicyId,
    pub company_id: CompanyId,
    pub name: String,
    pub is_active: bool,
    pub trigger: TriggerPredicate,
    pub steps: Vec<StepTemplate>,
    pub watchers: Vec<WatcherSpec>,
}

impl Policy {
    /// Step templates in ascending sequence order.
    pub fn ordered_steps(&self) -> Vec<&StepTemplate> {
        let mut steps: Vec<&StepTemplate> = self.steps.iter().collect();
        steps.sort_by_key(|step| step.sequence_order);
        steps
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatcherRule {
    pub id: WatcherRuleId,
    pub company_id: CompanyId,
    pub name: String,
    pub is_active: bool,
    pub trigger: TriggerPredicate,
    pub watchers: Vec<WatcherSpec>,
}
