use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::org::{CompanyId, DepartmentId, ProjectId, RoleId, UserId};

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaveRequestId(pub String);

impl fmt::Display for LeaveRequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaveRequestStatus {
    Pending,
    Approved,
    Rejected,
    Canceled,
}

impl LeaveRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "pending" => Some(Self::Pending),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Whether cancellation moves a request in this status to `Canceled`.
    /// Approved requests are revoked; rejected and canceled ones stay put.
    pub fn is_cancelable(&self) -> bool {
        matches!(self, Self::Pending | Self::Approved)
    }

    /// Rejected and canceled requests take no further approval decisions.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Rejected | Self::Canceled)
    }
}

impl fmt::Display for LeaveRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaveRequest {
    pub id: LeaveRequestId,
    pub company_id: CompanyId,
    pub requester_id: UserId,
    pub request_type: String,
    pub project_id: Option<ProjectId>,
    pub project_type: Option<String>,
    pub department_id: Option<DepartmentId>,
    pub contract_type_id: Option<String>,
    pub subject_role_id: Option<RoleId>,
    pub status: LeaveRequestStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LeaveRequest {
    pub fn trigger_context(&self) -> TriggerContext {
        TriggerContext {
            request_type: self.request_type.clone(),
            project_type: self.project_type.clone(),
            subject_role_id: self.subject_role_id.as_ref().map(|role| role.0.clone()),
            department_id: self.department_id.as_ref().map(|department| department.0.clone()),
            contract_type_id: self.contract_type_id.clone(),
        }
    }

    pub fn resolution_context(&self) -> ResolutionContext {
        ResolutionContext {
            requester_id: self.requester_id.clone(),
            company_id: self.company_id.clone(),
            project_id: self.project_id.clone(),
            department_id: self.department_id.clone(),
        }
    }
}

/// The attributes of a request that policy triggers are evaluated against.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerContext {
    pub request_type: String,
    pub project_type: Option<String>,
    pub subject_role_id: Option<String>,
    pub department_id: Option<String>,
    pub contract_type_id: Option<String>,
}

/// The organizational coordinates used to turn role + scope into people.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolutionContext {
    pub requester_id: UserId,
    pub company_id: CompanyId,
    pub project_id: Option<ProjectId>,
    pub department_id: Option<DepartmentId>,
}
