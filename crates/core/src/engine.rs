//! Orchestrates submission, approval and cancellation of leave requests over the
//! collaborator ports. State changes are committed through [`StepStore`] first; audit
//! events and notifications follow and never undo a committed change.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::approvals::chain::StepChainBuilder;
use crate::approvals::progression::{
    CancelOutcome, FanOutRule, ProgressionTracker, RequestChains, Transition, TransitionOutcome,
};
use crate::approvals::resolver::{ApproverResolver, UserDirectory};
use crate::approvals::store::StepStore;
use crate::audit::{
    AuditCategory, AuditContext, AuditOutcome, AuditSink, EVENT_CANCELED,
    EVENT_ESCALATION_REQUIRED, EVENT_NOTIFICATION_FAILED, EVENT_STEP_APPROVED,
    EVENT_STEP_REJECTED, EVENT_SUBMITTED, EVENT_TRANSITION_REJECTED,
};
use crate::config::AppConfig;
use crate::domain::leave_request::{
    LeaveRequest, LeaveRequestId, LeaveRequestStatus, ResolutionContext, TriggerContext,
};
use crate::domain::org::{Actor, CompanyId, UserId};
use crate::domain::policy::{Policy, PolicyId, RequestEvent};
use crate::domain::step::{ApprovalStep, Decision, StepId};
use crate::errors::{ApplicationError, DomainError};
use crate::notify::{NotificationEventType, NotificationPayload, NotificationSink};
use crate::policy::matcher::PolicyMatcher;
use crate::policy::store::PolicyStore;
use crate::watchers::WatcherNotifier;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineSettings {
    pub fan_out: FanOutRule,
    pub admin_override: bool,
    pub notifications_enabled: bool,
    pub watchers_enabled: bool,
    pub escalation_contacts: Vec<UserId>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            fan_out: FanOutRule::AnyOne,
            admin_override: true,
            notifications_enabled: true,
            watchers_enabled: true,
            escalation_contacts: Vec::new(),
        }
    }
}

impl From<&AppConfig> for EngineSettings {
    fn from(config: &AppConfig) -> Self {
        Self {
            fan_out: config.approvals.fan_out,
            admin_override: config.approvals.admin_override,
            notifications_enabled: config.notifications.enabled,
            watchers_enabled: config.notifications.watchers_enabled,
            escalation_contacts: config
                .approvals
                .escalation_contacts
                .iter()
                .map(|contact| UserId(contact.clone()))
                .collect(),
        }
    }
}

/// The collaborators an engine runs against.
#[derive(Clone)]
pub struct EnginePorts {
    pub directory: Arc<dyn UserDirectory>,
    pub policies: Arc<dyn PolicyStore>,
    pub steps: Arc<dyn StepStore>,
    pub notifications: Arc<dyn NotificationSink>,
    pub audit: Arc<dyn AuditSink>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionOutcome {
    pub leave_request_id: LeaveRequestId,
    pub matched_policy_ids: Vec<PolicyId>,
    pub steps: Vec<ApprovalStep>,
    /// First approvers across every chain, de-duplicated.
    pub notified_approver_ids: Vec<UserId>,
    pub escalated_step_ids: Vec<StepId>,
    pub request_status: LeaveRequestStatus,
    /// Set when no policy matched; the request waits on an administrator.
    pub needs_escalation: bool,
}

pub struct ApprovalEngine {
    policies: Arc<dyn PolicyStore>,
    steps: Arc<dyn StepStore>,
    notifications: Arc<dyn NotificationSink>,
    audit: Arc<dyn AuditSink>,
    matcher: PolicyMatcher,
    builder: StepChainBuilder,
    tracker: ProgressionTracker,
    watchers: WatcherNotifier,
    settings: EngineSettings,
}

impl ApprovalEngine {
    pub fn new(ports: EnginePorts, settings: EngineSettings) -> Self {
        let resolver = ApproverResolver::new(ports.directory);
        Self {
            policies: ports.policies,
            steps: ports.steps,
            notifications: ports.notifications,
            audit: ports.audit,
            matcher: PolicyMatcher::new(),
            builder: StepChainBuilder::new(resolver.clone()),
            tracker: ProgressionTracker::new(settings.fan_out)
                .with_admin_override(settings.admin_override),
            watchers: WatcherNotifier::new(resolver),
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub async fn match_policies(
        &self,
        company_id: &CompanyId,
        trigger: &TriggerContext,
    ) -> Result<Vec<Policy>, ApplicationError> {
        let policies = self.policies.active_policies_for_company(company_id).await?;
        Ok(self.matcher.match_policies(trigger, &policies))
    }

    pub async fn build_chains(
        &self,
        leave_request_id: &LeaveRequestId,
        policies: &[Policy],
        context: &ResolutionContext,
    ) -> Vec<ApprovalStep> {
        self.builder.build_chains(leave_request_id, policies, context, Utc::now()).await
    }

    pub async fn find_request(
        &self,
        leave_request_id: &LeaveRequestId,
    ) -> Result<LeaveRequest, ApplicationError> {
        self.steps.find_request(leave_request_id).await?.ok_or_else(|| {
            ApplicationError::NotFound { entity: "leave request", id: leave_request_id.0.clone() }
        })
    }

    pub async fn steps_for_request(
        &self,
        leave_request_id: &LeaveRequestId,
    ) -> Result<Vec<ApprovalStep>, ApplicationError> {
        self.find_request(leave_request_id).await?;
        self.steps.steps_for_request(leave_request_id).await
    }

    pub async fn actionable_steps(
        &self,
        actor: &Actor,
        leave_request_id: &LeaveRequestId,
    ) -> Result<Vec<ApprovalStep>, ApplicationError> {
        let request = self.find_request(leave_request_id).await?;
        let steps = self.steps.steps_for_request(leave_request_id).await?;
        let chains = RequestChains::from_steps(leave_request_id.clone(), steps);
        Ok(self.tracker.actionable_steps(actor, &chains, request.status))
    }

    /// Matches, builds and persists the chains for a new request, then tells the first
    /// approver of every chain and the submission watchers.
    pub async fn submit(
        &self,
        mut request: LeaveRequest,
        correlation_id: &str,
    ) -> Result<SubmissionOutcome, ApplicationError> {
        let audit = AuditContext::new(
            Some(request.id.clone()),
            correlation_id,
            request.requester_id.0.clone(),
        );

        if self.steps.find_request(&request.id).await?.is_some() {
            return Err(DomainError::DuplicateSubmission { leave_request_id: request.id }.into());
        }

        let policies = self.match_policies(&request.company_id, &request.trigger_context()).await?;
        let steps = self.build_chains(&request.id, &policies, &request.resolution_context()).await;

        let now = Utc::now();
        request.status = LeaveRequestStatus::Pending;
        request.created_at = now;
        request.updated_at = now;
        self.steps.create_request_with_steps(&request, &steps).await?;

        let chains = RequestChains::from_steps(request.id.clone(), steps.clone());
        let notified_approver_ids = chains.initial_approvers();
        let escalated_step_ids = chains.escalations();
        let needs_escalation = policies.is_empty();
        let matched_policy_ids: Vec<PolicyId> =
            policies.iter().map(|policy| policy.id.clone()).collect();

        info!(
            event_name = "approval.submitted",
            correlation_id,
            leave_request_id = %request.id,
            policy_count = policies.len(),
            step_count = steps.len(),
            "leave request submitted"
        );
        self.audit.emit(
            audit
                .event(EVENT_SUBMITTED, AuditCategory::Submission, AuditOutcome::Success)
                .with_metadata("matched_policies", join_ids(&matched_policy_ids))
                .with_metadata("step_count", steps.len().to_string()),
        );

        let payload = NotificationPayload {
            leave_request_id: request.id.clone(),
            request_status: request.status,
            policy_id: None,
            step_ids: Vec::new(),
            correlation_id: correlation_id.to_string(),
        };
        self.deliver(&notified_approver_ids, NotificationEventType::ApprovalRequested, &payload, &audit)
            .await;

        if needs_escalation {
            warn!(
                event_name = "approval.submit.no_policy",
                correlation_id,
                leave_request_id = %request.id,
                "no approval policy matched; request needs an administrator"
            );
            self.escalate(&request.id, &[], "no_policy_matched", &payload, &audit).await;
        } else if !escalated_step_ids.is_empty() {
            self.escalate(&request.id, &escalated_step_ids, "unresolved_approver", &payload, &audit)
                .await;
        }

        self.notify_watchers(&request, RequestEvent::Submitted, &policies, &payload, &audit).await;

        Ok(SubmissionOutcome {
            leave_request_id: request.id,
            matched_policy_ids,
            steps,
            notified_approver_ids,
            escalated_step_ids,
            request_status: request.status,
            needs_escalation,
        })
    }

    /// Approves or rejects one step. Only the chain owning the step is progressed and only
    /// its next approvers are notified.
    pub async fn apply_transition(
        &self,
        leave_request_id: &LeaveRequestId,
        step_id: &StepId,
        actor: &Actor,
        decision: Decision,
        correlation_id: &str,
    ) -> Result<TransitionOutcome, ApplicationError> {
        let audit =
            AuditContext::new(Some(leave_request_id.clone()), correlation_id, actor.user_id.0.clone());
        let request = self.find_request(leave_request_id).await?;
        let transition = Transition { step_id: step_id.clone(), actor: actor.clone(), decision };

        let outcome = match self.steps.apply_decision(leave_request_id, &transition, &self.tracker).await
        {
            Ok(outcome) => outcome,
            Err(error) => {
                if error.is_client_error() {
                    warn!(
                        event_name = "approval.transition.rejected",
                        correlation_id,
                        leave_request_id = %leave_request_id,
                        step_id = %step_id,
                        actor = %actor.user_id,
                        error = %error,
                        "approval action refused"
                    );
                    self.audit.emit(
                        audit
                            .event(
                                EVENT_TRANSITION_REJECTED,
                                AuditCategory::Approval,
                                AuditOutcome::Rejected,
                            )
                            .with_metadata("step_id", step_id.0.clone())
                            .with_metadata("decision", decision.as_str())
                            .with_metadata("error", error.to_string()),
                    );
                }
                return Err(error);
            }
        };

        let event_type = match decision {
            Decision::Approve => EVENT_STEP_APPROVED,
            Decision::Reject => EVENT_STEP_REJECTED,
        };
        info!(
            event_name = event_type,
            correlation_id,
            leave_request_id = %leave_request_id,
            policy_id = %outcome.policy_id,
            step_id = %step_id,
            actor = %actor.user_id,
            request_status = %outcome.request_status,
            "approval step decided"
        );
        self.audit.emit(
            audit
                .event(event_type, AuditCategory::Approval, AuditOutcome::Success)
                .with_metadata("policy_id", outcome.policy_id.0.clone())
                .with_metadata("step_id", step_id.0.clone())
                .with_metadata("updated_steps", outcome.updated_steps.len().to_string())
                .with_metadata("request_status", outcome.request_status.as_str()),
        );

        let payload = NotificationPayload {
            leave_request_id: leave_request_id.clone(),
            request_status: outcome.request_status,
            policy_id: Some(outcome.policy_id.clone()),
            step_ids: Vec::new(),
            correlation_id: correlation_id.to_string(),
        };
        self.deliver(
            &outcome.next_approver_ids,
            NotificationEventType::ApprovalRequested,
            &payload,
            &audit,
        )
        .await;
        if !outcome.escalated_step_ids.is_empty() {
            self.escalate(
                leave_request_id,
                &outcome.escalated_step_ids,
                "unresolved_approver",
                &payload,
                &audit,
            )
            .await;
        }

        if outcome.request_status_changed() {
            let event = match outcome.request_status {
                LeaveRequestStatus::Approved => Some(RequestEvent::Approved),
                LeaveRequestStatus::Rejected => Some(RequestEvent::Rejected),
                _ => None,
            };
            if let Some(event) = event {
                let mut request = request;
                request.status = outcome.request_status;
                self.deliver(
                    std::slice::from_ref(&request.requester_id),
                    NotificationEventType::from(event),
                    &payload,
                    &audit,
                )
                .await;
                let policies = self.policies_for_request(&request).await;
                self.notify_watchers(&request, event, &policies, &payload, &audit).await;
            }
        }

        Ok(outcome)
    }

    /// Voids every outstanding step across every chain in one atomic unit. Canceling a
    /// request with nothing outstanding succeeds without changes.
    pub async fn cancel_all(
        &self,
        leave_request_id: &LeaveRequestId,
        actor: &Actor,
        correlation_id: &str,
    ) -> Result<CancelOutcome, ApplicationError> {
        let audit =
            AuditContext::new(Some(leave_request_id.clone()), correlation_id, actor.user_id.0.clone());
        let request = self.find_request(leave_request_id).await?;
        let outcome = self.steps.void_outstanding(leave_request_id, &self.tracker).await?;

        info!(
            event_name = "approval.canceled",
            correlation_id,
            leave_request_id = %leave_request_id,
            voided = outcome.voided_step_ids.len(),
            request_status = %outcome.request_status,
            "leave request canceled"
        );
        self.audit.emit(
            audit
                .event(EVENT_CANCELED, AuditCategory::Approval, AuditOutcome::Success)
                .with_metadata("voided_steps", outcome.voided_step_ids.len().to_string())
                .with_metadata("previous_status", outcome.previous_request_status.as_str())
                .with_metadata("request_status", outcome.request_status.as_str()),
        );

        if outcome.request_status_changed() {
            let mut request = request;
            request.status = outcome.request_status;
            let payload = NotificationPayload {
                leave_request_id: leave_request_id.clone(),
                request_status: outcome.request_status,
                policy_id: None,
                step_ids: outcome.voided_step_ids.clone(),
                correlation_id: correlation_id.to_string(),
            };
            let policies = self.policies_for_request(&request).await;
            self.notify_watchers(&request, RequestEvent::Canceled, &policies, &payload, &audit)
                .await;
        } else {
            debug!(
                event_name = "approval.cancel.noop",
                leave_request_id = %leave_request_id,
                request_status = %outcome.request_status,
                "request status unchanged by cancel"
            );
        }

        Ok(outcome)
    }

    /// The active policies that contributed chains to this request.
    async fn policies_for_request(&self, request: &LeaveRequest) -> Vec<Policy> {
        let steps = match self.steps.steps_for_request(&request.id).await {
            Ok(steps) => steps,
            Err(error) => {
                warn!(
                    event_name = "watcher.policies.lookup_failed",
                    leave_request_id = %request.id,
                    error = %error,
                    "could not load steps for watcher fan-out"
                );
                return Vec::new();
            }
        };
        let policy_ids: BTreeSet<PolicyId> = steps.into_iter().map(|step| step.policy_id).collect();

        match self.policies.active_policies_for_company(&request.company_id).await {
            Ok(policies) => {
                policies.into_iter().filter(|policy| policy_ids.contains(&policy.id)).collect()
            }
            Err(error) => {
                warn!(
                    event_name = "watcher.policies.lookup_failed",
                    leave_request_id = %request.id,
                    error = %error,
                    "could not load policies for watcher fan-out"
                );
                Vec::new()
            }
        }
    }

    async fn notify_watchers(
        &self,
        request: &LeaveRequest,
        event: RequestEvent,
        policies: &[Policy],
        payload: &NotificationPayload,
        audit: &AuditContext,
    ) {
        if !self.settings.watchers_enabled {
            return;
        }

        let rules = match self.policies.active_watcher_rules_for_company(&request.company_id).await
        {
            Ok(rules) => rules,
            Err(error) => {
                warn!(
                    event_name = "watcher.rules.lookup_failed",
                    leave_request_id = %request.id,
                    error = %error,
                    "watcher rules unavailable; continuing with policy watchers"
                );
                Vec::new()
            }
        };

        let recipients = self.watchers.recipients(request, event, policies, &rules).await;
        self.deliver(&recipients, NotificationEventType::from(event), payload, audit).await;
    }

    async fn escalate(
        &self,
        leave_request_id: &LeaveRequestId,
        step_ids: &[StepId],
        reason: &str,
        payload: &NotificationPayload,
        audit: &AuditContext,
    ) {
        warn!(
            event_name = "approval.escalation_required",
            leave_request_id = %leave_request_id,
            reason,
            steps = step_ids.len(),
            "approval needs an administrator"
        );
        self.audit.emit(
            audit
                .event(EVENT_ESCALATION_REQUIRED, AuditCategory::Escalation, AuditOutcome::Success)
                .with_metadata("reason", reason)
                .with_metadata("step_ids", join_ids(step_ids)),
        );

        let payload = NotificationPayload { step_ids: step_ids.to_vec(), ..payload.clone() };
        let contacts = self.settings.escalation_contacts.clone();
        self.deliver(&contacts, NotificationEventType::EscalationRequired, &payload, audit).await;
    }

    async fn deliver(
        &self,
        recipients: &[UserId],
        event_type: NotificationEventType,
        payload: &NotificationPayload,
        audit: &AuditContext,
    ) {
        if recipients.is_empty() {
            return;
        }
        if !self.settings.notifications_enabled {
            debug!(
                event_name = "notification.skipped",
                event_type = %event_type,
                recipients = recipients.len(),
                "notifications disabled"
            );
            return;
        }

        for user_id in recipients {
            if let Err(error) = self.notifications.notify(user_id, event_type, payload).await {
                warn!(
                    event_name = EVENT_NOTIFICATION_FAILED,
                    correlation_id = %payload.correlation_id,
                    leave_request_id = %payload.leave_request_id,
                    user_id = %user_id,
                    event_type = %event_type,
                    error = %error,
                    "notification delivery failed"
                );
                self.audit.emit(
                    audit
                        .event(
                            EVENT_NOTIFICATION_FAILED,
                            AuditCategory::Notification,
                            AuditOutcome::Failed,
                        )
                        .with_metadata("user_id", user_id.0.clone())
                        .with_metadata("event_type", event_type.as_str())
                        .with_metadata("error", error.to_string()),
                );
            }
        }
    }
}

fn join_ids<T: std::fmt::Display>(ids: &[T]) -> String {
    ids.iter().map(ToString::to_string).collect::<Vec<_>>().join(",")
}
