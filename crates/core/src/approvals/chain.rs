use chrono::{DateTime, Utc};
use tracing::warn;

use crate::approvals::resolver::ApproverResolver;
use crate::domain::leave_request::{LeaveRequestId, ResolutionContext};
use crate::domain::org::UserId;
use crate::domain::policy::{Policy, StepTemplate};
use crate::domain::step::{ApprovalStep, StepId, StepStatus};

/// Materializes one pending chain of approval steps per matched policy.
#[derive(Clone)]
pub struct StepChainBuilder {
    resolver: ApproverResolver,
}

impl StepChainBuilder {
    pub fn new(resolver: ApproverResolver) -> Self {
        Self { resolver }
    }

    /// Steps for every policy, in policy order then sequence order. The same person may
    /// appear in several chains; each chain keeps its own rows.
    pub async fn build_chains(
        &self,
        leave_request_id: &LeaveRequestId,
        policies: &[Policy],
        context: &ResolutionContext,
        now: DateTime<Utc>,
    ) -> Vec<ApprovalStep> {
        let mut steps = Vec::new();
        for policy in policies {
            steps.extend(self.build_chain(leave_request_id, policy, context, now).await);
        }
        steps
    }

    pub async fn build_chain(
        &self,
        leave_request_id: &LeaveRequestId,
        policy: &Policy,
        context: &ResolutionContext,
        now: DateTime<Utc>,
    ) -> Vec<ApprovalStep> {
        let mut steps = Vec::new();
        for template in policy.ordered_steps() {
            let approvers = self.approvers_for(policy, template, context).await;
            if approvers.is_empty() {
                warn!(
                    event_name = "approval.chain.unresolved_step",
                    leave_request_id = %leave_request_id,
                    policy_id = %policy.id,
                    sequence_order = template.sequence_order,
                    role_id = %template.approver_role_id,
                    scope = template.scope.kind(),
                    "no approver resolved; step needs escalation"
                );
                steps.push(new_step(leave_request_id, policy, template, None, now));
                continue;
            }

            steps.extend(
                approvers
                    .into_iter()
                    .map(|approver| new_step(leave_request_id, policy, template, Some(approver), now)),
            );
        }
        steps
    }

    async fn approvers_for(
        &self,
        policy: &Policy,
        template: &StepTemplate,
        context: &ResolutionContext,
    ) -> Vec<UserId> {
        match self.resolver.resolve(template, context).await {
            Ok(approvers) => approvers,
            Err(error) => {
                warn!(
                    event_name = "approval.chain.resolution_failed",
                    policy_id = %policy.id,
                    sequence_order = template.sequence_order,
                    error = %error,
                    "approver lookup failed; treating step as unresolved"
                );
                Vec::new()
            }
        }
    }
}

fn new_step(
    leave_request_id: &LeaveRequestId,
    policy: &Policy,
    template: &StepTemplate,
    approver_id: Option<UserId>,
    now: DateTime<Utc>,
) -> ApprovalStep {
    ApprovalStep {
        id: StepId::generate(),
        leave_request_id: leave_request_id.clone(),
        policy_id: policy.id.clone(),
        sequence_order: template.sequence_order,
        needs_escalation: approver_id.is_none(),
        approver_id,
        role_id: template.approver_role_id.clone(),
        status: StepStatus::Pending,
        created_at: now,
        updated_at: now,
    }
}
