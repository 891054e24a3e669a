use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::leave_request::{LeaveRequestId, LeaveRequestStatus};
use crate::domain::org::UserId;
use crate::domain::policy::{PolicyId, RequestEvent};
use crate::domain::step::StepId;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationEventType {
    /// A step is now waiting on the recipient.
    ApprovalRequested,
    /// Nobody could be resolved for a step; an administrator must act.
    EscalationRequired,
    RequestSubmitted,
    RequestApproved,
    RequestRejected,
    RequestCanceled,
}

impl NotificationEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApprovalRequested => "approval_requested",
            Self::EscalationRequired => "escalation_required",
            Self::RequestSubmitted => "request_submitted",
            Self::RequestApproved => "request_approved",
            Self::RequestRejected => "request_rejected",
            Self::RequestCanceled => "request_canceled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [
            Self::ApprovalRequested,
            Self::EscalationRequired,
            Self::RequestSubmitted,
            Self::RequestApproved,
            Self::RequestRejected,
            Self::RequestCanceled,
        ]
        .into_iter()
        .find(|event_type| event_type.as_str() == raw.trim())
    }
}

impl fmt::Display for NotificationEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RequestEvent> for NotificationEventType {
    fn from(event: RequestEvent) -> Self {
        match event {
            RequestEvent::Submitted => Self::RequestSubmitted,
            RequestEvent::Approved => Self::RequestApproved,
            RequestEvent::Rejected => Self::RequestRejected,
            RequestEvent::Canceled => Self::RequestCanceled,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub leave_request_id: LeaveRequestId,
    pub request_status: LeaveRequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_id: Option<PolicyId>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub step_ids: Vec<StepId>,
    pub correlation_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Notification {
    pub user_id: UserId,
    pub event_type: NotificationEventType,
    pub payload: NotificationPayload,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum NotificationError {
    #[error("notification to `{user_id}` could not be delivered: {reason}")]
    Delivery { user_id: UserId, reason: String },
    #[error("notification channel unavailable: {0}")]
    Unavailable(String),
}

/// Outbound delivery collaborator. The engine calls it after state has been committed and
/// never lets its failures reach the caller.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn notify(
        &self,
        user_id: &UserId,
        event_type: NotificationEventType,
        payload: &NotificationPayload,
    ) -> Result<(), NotificationError>;
}

#[derive(Clone, Default)]
pub struct InMemoryNotificationSink {
    delivered: Arc<Mutex<Vec<Notification>>>,
    failing_users: Arc<Mutex<HashSet<UserId>>>,
}

impl InMemoryNotificationSink {
    /// Makes every delivery to this user fail.
    pub fn fail_for(&self, user_id: impl Into<String>) {
        let user_id = UserId(user_id.into());
        match self.failing_users.lock() {
            Ok(mut users) => users.insert(user_id),
            Err(poisoned) => poisoned.into_inner().insert(user_id),
        };
    }

    pub fn delivered(&self) -> Vec<Notification> {
        match self.delivered.lock() {
            Ok(delivered) => delivered.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn recipients_of(&self, event_type: NotificationEventType) -> Vec<UserId> {
        self.delivered()
            .into_iter()
            .filter(|notification| notification.event_type == event_type)
            .map(|notification| notification.user_id)
            .collect()
    }

    pub fn clear(&self) {
        match self.delivered.lock() {
            Ok(mut delivered) => delivered.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    fn is_failing(&self, user_id: &UserId) -> bool {
        match self.failing_users.lock() {
            Ok(users) => users.contains(user_id),
            Err(poisoned) => poisoned.into_inner().contains(user_id),
        }
    }
}

#[async_trait]
impl NotificationSink for InMemoryNotificationSink {
    async fn notify(
        &self,
        user_id: &UserId,
        event_type: NotificationEventType,
        payload: &NotificationPayload,
    ) -> Result<(), NotificationError> {
        if self.is_failing(user_id) {
            return Err(NotificationError::Delivery {
                user_id: user_id.clone(),
                reason: "recipient mailbox rejected the message".to_string(),
            });
        }

        let notification =
            Notification { user_id: user_id.clone(), event_type, payload: payload.clone() };
        match self.delivered.lock() {
            Ok(mut delivered) => delivered.push(notification),
            Err(poisoned) => poisoned.into_inner().push(notification),
        }
        Ok(())
    }
}
