use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;

use leaveflow_core::approvals::progression::{
    CancelOutcome, ProgressionTracker, RequestChains, Transition, TransitionOutcome,
};
use leaveflow_core::approvals::store::StepStore;
use leaveflow_core::domain::leave_request::{LeaveRequest, LeaveRequestId};
use leaveflow_core::domain::org::CompanyId;
use leaveflow_core::domain::policy::{Policy, WatcherRule};
use leaveflow_core::domain::step::ApprovalStep;
use leaveflow_core::errors::{ApplicationError, DomainError};
use leaveflow_core::policy::{validate_policy, validate_watcher_rule, PolicyStore};

#[derive(Default)]
pub struct InMemoryPolicyRepository {
    policies: RwLock<HashMap<String, Policy>>,
    watcher_rules: RwLock<HashMap<String, WatcherRule>>,
}

#[async_trait]
impl PolicyStore for InMemoryPolicyRepository {
    async fn active_policies_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<Policy>, ApplicationError> {
        let policies = self.policies.read().await;
        let mut active: Vec<Policy> = policies
            .values()
            .filter(|policy| policy.is_active && &policy.company_id == company_id)
            .cloned()
            .collect();
        active.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(active)
    }

    async fn active_watcher_rules_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<WatcherRule>, ApplicationError> {
        let rules = self.watcher_rules.read().await;
        let mut active: Vec<WatcherRule> = rules
            .values()
            .filter(|rule| rule.is_active && &rule.company_id == company_id)
            .cloned()
            .collect();
        active.sort_by(|left, right| left.id.cmp(&right.id));
        Ok(active)
    }

    async fn save_policy(&self, policy: Policy) -> Result<(), ApplicationError> {
        validate_policy(&policy)?;
        let mut policies = self.policies.write().await;
        policies.insert(policy.id.0.clone(), policy);
        Ok(())
    }

    async fn save_watcher_rule(&self, rule: WatcherRule) -> Result<(), ApplicationError> {
        validate_watcher_rule(&rule)?;
        let mut rules = self.watcher_rules.write().await;
        rules.insert(rule.id.0.clone(), rule);
        Ok(())
    }
}

#[derive(Clone, Debug)]
struct StoredRequest {
    request: LeaveRequest,
    steps: Vec<ApprovalStep>,
}

/// Requests and steps held in one map so a single write guard covers every read-modify-write.
#[derive(Default)]
pub struct InMemoryStepRepository {
    requests: RwLock<HashMap<String, StoredRequest>>,
}

fn not_found(id: &LeaveRequestId) -> ApplicationError {
    ApplicationError::NotFound { entity: "leave request", id: id.0.clone() }
}

#[async_trait]
impl StepStore for InMemoryStepRepository {
    async fn create_request_with_steps(
        &self,
        request: &LeaveRequest,
        steps: &[ApprovalStep],
    ) -> Result<(), ApplicationError> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request.id.0) {
            return Err(DomainError::DuplicateSubmission { leave_request_id: request.id.clone() }
                .into());
        }
        requests.insert(
            request.id.0.clone(),
            StoredRequest { request: request.clone(), steps: steps.to_vec() },
        );
        Ok(())
    }

    async fn find_request(
        &self,
        id: &LeaveRequestId,
    ) -> Result<Option<LeaveRequest>, ApplicationError> {
        let requests = self.requests.read().await;
        Ok(requests.get(&id.0).map(|stored| stored.request.clone()))
    }

    async fn steps_for_request(
        &self,
        id: &LeaveRequestId,
    ) -> Result<Vec<ApprovalStep>, ApplicationError> {
        let requests = self.requests.read().await;
        let mut steps = requests.get(&id.0).map(|stored| stored.steps.clone()).unwrap_or_default();
        steps.sort_by(|left, right| {
            (&left.policy_id, left.sequence_order, &left.id).cmp(&(
                &right.policy_id,
                right.sequence_order,
                &right.id,
            ))
        });
        Ok(steps)
    }

    async fn apply_decision(
        &self,
        id: &LeaveRequestId,
        transition: &Transition,
        tracker: &ProgressionTracker,
    ) -> Result<TransitionOutcome, ApplicationError> {
        let mut requests = self.requests.write().await;
        let stored = requests.get_mut(&id.0).ok_or_else(|| not_found(id))?;

        let now = Utc::now();
        let mut chains = RequestChains::from_steps(id.clone(), stored.steps.clone());
        let outcome = tracker.apply(&mut chains, stored.request.status, transition, now)?;

        stored.steps = chains.into_steps();
        stored.request.status = outcome.request_status;
        stored.request.updated_at = now;
        Ok(outcome)
    }

    async fn void_outstanding(
        &self,
        id: &LeaveRequestId,
        tracker: &ProgressionTracker,
    ) -> Result<CancelOutcome, ApplicationError> {
        let mut requests = self.requests.write().await;
        let stored = requests.get_mut(&id.0).ok_or_else(|| not_found(id))?;

        let now = Utc::now();
        let mut chains = RequestChains::from_steps(id.clone(), stored.steps.clone());
        let outcome = tracker.cancel(&mut chains, stored.request.status, now);
        if outcome.voided_step_ids.is_empty() && !outcome.request_status_changed() {
            return Ok(outcome);
        }

        stored.steps = chains.into_steps();
        stored.request.status = outcome.request_status;
        stored.request.updated_at = now;
        Ok(outcome)
    }
}
