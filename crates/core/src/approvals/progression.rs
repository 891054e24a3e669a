//! Per-request, per-policy progression of persisted approval steps.
//!
//! Steps for one leave request are grouped into a [`RequestChains`] aggregate holding one
//! [`PolicyChain`] per policy. Chains advance independently; a transition only ever touches
//! the chain owning the acted-on step, and next-approver output is scoped to that chain.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::leave_request::{LeaveRequestId, LeaveRequestStatus};
use crate::domain::org::{Actor, UserId};
use crate::domain::policy::PolicyId;
use crate::domain::step::{ApprovalStep, Decision, StepId, StepStatus};

/// How a sequence position with several resolved approvers is satisfied.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FanOutRule {
    /// The first approval satisfies the position; remaining siblings become void.
    #[default]
    AnyOne,
    /// Every sibling at the position must approve before the chain advances.
    All,
}

impl FanOutRule {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnyOne => "any_one",
            Self::All => "all",
        }
    }
}

impl fmt::Display for FanOutRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FanOutRule {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "any_one" | "any" => Ok(Self::AnyOne),
            "all" => Ok(Self::All),
            other => Err(format!("unsupported fan-out rule `{other}` (expected any_one|all)")),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainState {
    InProgress,
    Satisfied,
    Terminated,
    /// Nothing pending and not every position approved, i.e. canceled mid-flight.
    Voided,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ProgressionError {
    #[error("approval step `{step_id}` does not belong to this leave request")]
    StepNotFound { step_id: StepId },
    #[error("approval step `{step_id}` is already {status}")]
    StepNotPending { step_id: StepId, status: StepStatus },
    #[error(
        "approval step `{step_id}` is at sequence {sequence_order} but its chain is waiting on sequence {current_sequence}"
    )]
    OutOfSequence { step_id: StepId, sequence_order: u32, current_sequence: u32 },
    #[error("`{actor}` is not the assigned approver for step `{step_id}`")]
    NotAssignedApprover { step_id: StepId, actor: UserId },
    #[error("leave request `{leave_request_id}` is already {status}")]
    RequestClosed { leave_request_id: LeaveRequestId, status: LeaveRequestStatus },
}

/// The steps one policy contributed to one leave request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PolicyChain {
    policy_id: PolicyId,
    steps: Vec<ApprovalStep>,
}

impl PolicyChain {
    fn new(policy_id: PolicyId, mut steps: Vec<ApprovalStep>) -> Self {
        steps.sort_by(|left, right| {
            left.sequence_order.cmp(&right.sequence_order).then_with(|| left.id.cmp(&right.id))
        });
        Self { policy_id, steps }
    }

    pub fn policy_id(&self) -> &PolicyId {
        &self.policy_id
    }

    pub fn steps(&self) -> &[ApprovalStep] {
        &self.steps
    }

    /// The lowest sequence order that still has a pending step.
    pub fn current_sequence(&self) -> Option<u32> {
        self.steps.iter().filter(|step| step.is_pending()).map(|step| step.sequence_order).min()
    }

    pub fn current_steps(&self) -> Vec<&ApprovalStep> {
        match self.current_sequence() {
            Some(sequence) => self
                .steps
                .iter()
                .filter(|step| step.is_pending() && step.sequence_order == sequence)
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn state(&self) -> ChainState {
        if self.steps.iter().any(|step| step.status == StepStatus::Rejected) {
            return ChainState::Terminated;
        }
        if self.steps.iter().any(ApprovalStep::is_pending) {
            return ChainState::InProgress;
        }

        let positions: BTreeSet<u32> = self.steps.iter().map(|step| step.sequence_order).collect();
        let approved: BTreeSet<u32> = self
            .steps
            .iter()
            .filter(|step| step.status == StepStatus::Approved)
            .map(|step| step.sequence_order)
            .collect();
        if !positions.is_empty() && positions == approved {
            ChainState::Satisfied
        } else {
            ChainState::Voided
        }
    }

    /// De-duplicated approvers waiting at the current position.
    pub fn next_approvers(&self) -> Vec<UserId> {
        self.current_steps()
            .into_iter()
            .filter_map(|step| step.approver_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Steps at the current position that nobody but an administrator can act on.
    pub fn escalations(&self) -> Vec<StepId> {
        self.current_steps()
            .into_iter()
            .filter(|step| step.approver_id.is_none())
            .map(|step| step.id.clone())
            .collect()
    }

    fn actionable_for<'a>(&'a self, actor: &Actor, admin_override: bool) -> Vec<&'a ApprovalStep> {
        self.current_steps()
            .into_iter()
            .filter(|step| may_act(step, actor, admin_override))
            .collect()
    }

    fn step_mut(&mut self, step_id: &StepId) -> Option<&mut ApprovalStep> {
        self.steps.iter_mut().find(|step| &step.id == step_id)
    }
}

/// Every chain instantiated for one leave request, keyed by policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RequestChains {
    leave_request_id: LeaveRequestId,
    chains: BTreeMap<PolicyId, PolicyChain>,
}

impl RequestChains {
    pub fn from_steps(leave_request_id: LeaveRequestId, steps: Vec<ApprovalStep>) -> Self {
        let mut grouped: BTreeMap<PolicyId, Vec<ApprovalStep>> = BTreeMap::new();
        for step in steps.into_iter().filter(|step| step.leave_request_id == leave_request_id) {
            grouped.entry(step.policy_id.clone()).or_default().push(step);
        }

        let chains = grouped
            .into_iter()
            .map(|(policy_id, steps)| (policy_id.clone(), PolicyChain::new(policy_id, steps)))
            .collect();
        Self { leave_request_id, chains }
    }

    pub fn leave_request_id(&self) -> &LeaveRequestId {
        &self.leave_request_id
    }

    pub fn is_empty(&self) -> bool {
        self.chains.is_empty()
    }

    pub fn chains(&self) -> impl Iterator<Item = &PolicyChain> {
        self.chains.values()
    }

    pub fn steps(&self) -> impl Iterator<Item = &ApprovalStep> {
        self.chains.values().flat_map(|chain| chain.steps.iter())
    }

    pub fn into_steps(self) -> Vec<ApprovalStep> {
        self.chains.into_values().flat_map(|chain| chain.steps).collect()
    }

    pub fn find_step(&self, step_id: &StepId) -> Option<&ApprovalStep> {
        self.steps().find(|step| &step.id == step_id)
    }

    pub fn pending_count(&self) -> usize {
        self.steps().filter(|step| step.is_pending()).count()
    }

    /// Approved once every chain is satisfied, rejected as soon as any chain terminates.
    /// A request without chains stays pending.
    pub fn overall_status(&self) -> LeaveRequestStatus {
        if self.chains.is_empty() {
            return LeaveRequestStatus::Pending;
        }
        let states: Vec<ChainState> = self.chains.values().map(PolicyChain::state).collect();
        if states.contains(&ChainState::Terminated) {
            LeaveRequestStatus::Rejected
        } else if states.iter().all(|state| *state == ChainState::Satisfied) {
            LeaveRequestStatus::Approved
        } else {
            LeaveRequestStatus::Pending
        }
    }

    /// Approvers at the head of every chain, de-duplicated across policies.
    pub fn initial_approvers(&self) -> Vec<UserId> {
        self.chains
            .values()
            .flat_map(PolicyChain::next_approvers)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn escalations(&self) -> Vec<StepId> {
        self.chains.values().flat_map(PolicyChain::escalations).collect()
    }

    fn chain_of_step_mut(&mut self, step_id: &StepId) -> Option<&mut PolicyChain> {
        self.chains.values_mut().find(|chain| chain.steps.iter().any(|step| &step.id == step_id))
    }
}

/// A single approve/reject request against a step.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub step_id: StepId,
    pub actor: Actor,
    pub decision: Decision,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOutcome {
    pub leave_request_id: LeaveRequestId,
    pub policy_id: PolicyId,
    pub step_id: StepId,
    pub decision: Decision,
    /// Every step whose status changed, the acted-on step first.
    pub updated_steps: Vec<ApprovalStep>,
    /// Approvers at the affected chain's new position; empty unless the position moved.
    pub next_approver_ids: Vec<UserId>,
    /// Unassigned steps reached by this transition.
    pub escalated_step_ids: Vec<StepId>,
    pub chain_state: ChainState,
    pub previous_request_status: LeaveRequestStatus,
    pub request_status: LeaveRequestStatus,
}

impl TransitionOutcome {
    pub fn request_status_changed(&self) -> bool {
        self.previous_request_status != self.request_status
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOutcome {
    pub leave_request_id: LeaveRequestId,
    pub voided_step_ids: Vec<StepId>,
    pub previous_request_status: LeaveRequestStatus,
    pub request_status: LeaveRequestStatus,
}

impl CancelOutcome {
    pub fn request_status_changed(&self) -> bool {
        self.previous_request_status != self.request_status
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProgressionTracker {
    fan_out: FanOutRule,
    admin_override: bool,
}

impl Default for ProgressionTracker {
    fn default() -> Self {
        Self::new(FanOutRule::default())
    }
}

impl ProgressionTracker {
    pub fn new(fan_out: FanOutRule) -> Self {
        Self { fan_out, admin_override: true }
    }

    pub fn with_admin_override(mut self, enabled: bool) -> Self {
        self.admin_override = enabled;
        self
    }

    pub fn fan_out(&self) -> FanOutRule {
        self.fan_out
    }

    /// Steps the actor may act on right now, ordered by policy then sequence. A closed
    /// request has none, even where other chains still hold pending steps.
    pub fn actionable_steps(
        &self,
        actor: &Actor,
        chains: &RequestChains,
        request_status: LeaveRequestStatus,
    ) -> Vec<ApprovalStep> {
        if request_status.is_closed() {
            return Vec::new();
        }
        chains
            .chains
            .values()
            .flat_map(|chain| chain.actionable_for(actor, self.admin_override))
            .cloned()
            .collect()
    }

    /// Applies one decision to the chain owning the step. Nothing is mutated when the
    /// transition is rejected, including every decision on a rejected or canceled request.
    pub fn apply(
        &self,
        chains: &mut RequestChains,
        current_status: LeaveRequestStatus,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, ProgressionError> {
        let step_id = &transition.step_id;
        let leave_request_id = chains.leave_request_id.clone();
        let admin_override = self.admin_override;
        let fan_out = self.fan_out;

        if current_status.is_closed() {
            return Err(ProgressionError::RequestClosed {
                leave_request_id,
                status: current_status,
            });
        }

        let chain = chains
            .chain_of_step_mut(step_id)
            .ok_or_else(|| ProgressionError::StepNotFound { step_id: step_id.clone() })?;
        let before_sequence = chain.current_sequence();

        let sequence_order = {
            let step = chain
                .steps
                .iter()
                .find(|step| &step.id == step_id)
                .ok_or_else(|| ProgressionError::StepNotFound { step_id: step_id.clone() })?;
            if !step.is_pending() {
                return Err(ProgressionError::StepNotPending {
                    step_id: step_id.clone(),
                    status: step.status,
                });
            }
            if !may_act(step, &transition.actor, admin_override) {
                return Err(ProgressionError::NotAssignedApprover {
                    step_id: step_id.clone(),
                    actor: transition.actor.user_id.clone(),
                });
            }
            step.sequence_order
        };

        if let Some(current_sequence) = before_sequence {
            if sequence_order != current_sequence {
                return Err(ProgressionError::OutOfSequence {
                    step_id: step_id.clone(),
                    sequence_order,
                    current_sequence,
                });
            }
        }

        let mut changed: Vec<StepId> = vec![step_id.clone()];
        let new_status = match transition.decision {
            Decision::Approve => StepStatus::Approved,
            Decision::Reject => StepStatus::Rejected,
        };
        if let Some(step) = chain.step_mut(step_id) {
            step.mark(new_status, now);
        }

        for step in chain.steps.iter_mut().filter(|step| step.is_pending()) {
            let void = match transition.decision {
                Decision::Reject => true,
                Decision::Approve => {
                    fan_out == FanOutRule::AnyOne && step.sequence_order == sequence_order
                }
            };
            if void {
                step.mark(StepStatus::Void, now);
                changed.push(step.id.clone());
            }
        }

        let after_sequence = chain.current_sequence();
        let advanced = after_sequence.is_some() && after_sequence != before_sequence;
        let (next_approver_ids, escalated_step_ids) = if advanced {
            (chain.next_approvers(), chain.escalations())
        } else {
            (Vec::new(), Vec::new())
        };

        let updated_steps = changed
            .iter()
            .filter_map(|id| chain.steps.iter().find(|step| &step.id == id).cloned())
            .collect();
        let policy_id = chain.policy_id.clone();
        let chain_state = chain.state();

        let request_status = chains.overall_status();

        Ok(TransitionOutcome {
            leave_request_id,
            policy_id,
            step_id: step_id.clone(),
            decision: transition.decision,
            updated_steps,
            next_approver_ids,
            escalated_step_ids,
            chain_state,
            previous_request_status: current_status,
            request_status,
        })
    }

    /// Voids every pending step across every chain. Requests that are already rejected
    /// or canceled keep their status.
    pub fn cancel(
        &self,
        chains: &mut RequestChains,
        current_status: LeaveRequestStatus,
        now: DateTime<Utc>,
    ) -> CancelOutcome {
        let mut voided_step_ids = Vec::new();
        for chain in chains.chains.values_mut() {
            for step in chain.steps.iter_mut().filter(|step| step.is_pending()) {
                step.mark(StepStatus::Void, now);
                voided_step_ids.push(step.id.clone());
            }
        }

        let request_status = if current_status.is_cancelable() {
            LeaveRequestStatus::Canceled
        } else {
            current_status
        };

        CancelOutcome {
            leave_request_id: chains.leave_request_id.clone(),
            voided_step_ids,
            previous_request_status: current_status,
            request_status,
        }
    }
}

fn may_act(step: &ApprovalStep, actor: &Actor, admin_override: bool) -> bool {
    let assigned = step.approver_id.as_ref() == Some(&actor.user_id);
    assigned || (admin_override && actor.is_administrator)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{
        ChainState, FanOutRule, ProgressionError, ProgressionTracker, RequestChains, Transition,
    };
    use crate::domain::leave_request::{LeaveRequestId, LeaveRequestStatus};
    use crate::domain::org::{Actor, RoleId, UserId};
    use crate::domain::policy::PolicyId;
    use crate::domain::step::{ApprovalStep, Decision, StepId, StepStatus};

    fn at() -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).single().expect("valid timestamp")
    }

    fn step(id: &str, policy: &str, sequence_order: u32, approver: Option<&str>) -> ApprovalStep {
        ApprovalStep {
            id: StepId(id.to_string()),
            leave_request_id: LeaveRequestId("LR-1".to_string()),
            policy_id: PolicyId(policy.to_string()),
            sequence_order,
            approver_id: approver.map(|approver| UserId(approver.to_string())),
            role_id: RoleId("role".to_string()),
            status: StepStatus::Pending,
            needs_escalation: approver.is_none(),
            created_at: at(),
            updated_at: at(),
        }
    }

    /// P1: tech lead then project manager. P2: department boss.
    fn two_policies() -> RequestChains {
        RequestChains::from_steps(
            LeaveRequestId("LR-1".to_string()),
            vec![
                step("p1-s1", "P1", 1, Some("u-lead")),
                step("p1-s2", "P1", 2, Some("u-pm")),
                step("p2-s1", "P2", 1, Some("u-boss")),
            ],
        )
    }

    fn transition(step_id: &str, actor: Actor, decision: Decision) -> Transition {
        Transition { step_id: StepId(step_id.to_string()), actor, decision }
    }

    fn ids(steps: &[ApprovalStep]) -> Vec<&str> {
        steps.iter().map(|step| step.id.0.as_str()).collect()
    }

    fn status_of(chains: &RequestChains, step_id: &str) -> StepStatus {
        chains.find_step(&StepId(step_id.to_string())).map(|step| step.status).expect("step exists")
    }

    #[test]
    fn approving_one_policy_leaves_other_policy_untouched() {
        let tracker = ProgressionTracker::default();
        let mut chains = two_policies();
        let boss = Actor::user("u-boss");
        let boss_before = tracker.actionable_steps(&boss, &chains, LeaveRequestStatus::Pending);

        let outcome = tracker
            .apply(
                &mut chains,
                LeaveRequestStatus::Pending,
                &transition("p1-s1", Actor::user("u-lead"), Decision::Approve),
                at(),
            )
            .expect("lead approves");

        assert_eq!(outcome.policy_id, PolicyId("P1".to_string()));
        assert_eq!(outcome.next_approver_ids, vec![UserId("u-pm".to_string())]);
        assert!(!outcome.next_approver_ids.contains(&UserId("u-boss".to_string())));
        assert_eq!(
            tracker.actionable_steps(&boss, &chains, LeaveRequestStatus::Pending),
            boss_before
        );
        assert_eq!(outcome.request_status, LeaveRequestStatus::Pending);
        assert!(!outcome.request_status_changed());
    }

    #[test]
    fn rejecting_first_step_voids_rest_of_that_chain_only() {
        let tracker = ProgressionTracker::default();
        let mut chains = RequestChains::from_steps(
            LeaveRequestId("LR-1".to_string()),
            vec![
                step("a1", "A", 1, Some("u-1")),
                step("a2", "A", 2, Some("u-2")),
                step("a3", "A", 3, Some("u-3")),
                step("b1", "B", 1, Some("u-4")),
            ],
        );

        let outcome = tracker
            .apply(
                &mut chains,
                LeaveRequestStatus::Pending,
                &transition("a1", Actor::user("u-1"), Decision::Reject),
                at(),
            )
            .expect("rejection applies");

        assert_eq!(ids(&outcome.updated_steps), vec!["a1", "a2", "a3"]);
        assert_eq!(status_of(&chains, "a1"), StepStatus::Rejected);
        assert_eq!(status_of(&chains, "a2"), StepStatus::Void);
        assert_eq!(status_of(&chains, "a3"), StepStatus::Void);
        assert_eq!(status_of(&chains, "b1"), StepStatus::Pending);
        assert!(outcome.next_approver_ids.is_empty());
        assert_eq!(outcome.chain_state, ChainState::Terminated);
        assert_eq!(outcome.request_status, LeaveRequestStatus::Rejected);
    }

    #[test]
    fn rejected_request_takes_no_further_decisions_from_other_chains() {
        let tracker = ProgressionTracker::default();
        let mut chains = RequestChains::from_steps(
            LeaveRequestId("LR-1".to_string()),
            vec![
                step("a1", "A", 1, Some("u-1")),
                step("b1", "B", 1, Some("u-2")),
                step("b2", "B", 2, Some("u-3")),
            ],
        );
        let rejected = tracker
            .apply(
                &mut chains,
                LeaveRequestStatus::Pending,
                &transition("a1", Actor::user("u-1"), Decision::Reject),
                at(),
            )
            .expect("rejection applies");
        assert_eq!(rejected.request_status, LeaveRequestStatus::Rejected);
        let snapshot = chains.clone();

        let u2 = Actor::user("u-2");
        assert!(tracker.actionable_steps(&u2, &chains, rejected.request_status).is_empty());
        assert!(tracker
            .actionable_steps(&Actor::administrator("u-admin"), &chains, rejected.request_status)
            .is_empty());

        let error = tracker
            .apply(
                &mut chains,
                rejected.request_status,
                &transition("b1", u2, Decision::Approve),
                at(),
            )
            .expect_err("request is already decided");
        assert_eq!(
            error,
            ProgressionError::RequestClosed {
                leave_request_id: LeaveRequestId("LR-1".to_string()),
                status: LeaveRequestStatus::Rejected,
            }
        );
        assert_eq!(chains, snapshot);
        assert_eq!(status_of(&chains, "b1"), StepStatus::Pending);
    }

    #[test]
    fn canceled_request_refuses_decisions() {
        let tracker = ProgressionTracker::default();
        let mut chains = two_policies();

        let error = tracker
            .apply(
                &mut chains,
                LeaveRequestStatus::Canceled,
                &transition("p1-s1", Actor::user("u-lead"), Decision::Approve),
                at(),
            )
            .expect_err("canceled request");
        assert!(matches!(
            error,
            ProgressionError::RequestClosed { status: LeaveRequestStatus::Canceled, .. }
        ));
        assert_eq!(chains, two_policies());
    }

    #[test]
    fn cancel_voids_every_in_flight_chain() {
        let tracker = ProgressionTracker::default();
        let mut chains = two_policies();
        tracker
            .apply(
                &mut chains,
                LeaveRequestStatus::Pending,
                &transition("p1-s1", Actor::user("u-lead"), Decision::Approve),
                at(),
            )
            .expect("lead approves");

        let outcome = tracker.cancel(&mut chains, LeaveRequestStatus::Pending, at());

        assert_eq!(outcome.voided_step_ids.len(), 2);
        assert_eq!(chains.pending_count(), 0);
        assert_eq!(status_of(&chains, "p1-s1"), StepStatus::Approved);
        assert_eq!(outcome.request_status, LeaveRequestStatus::Canceled);
        assert!(chains.chains().all(|chain| chain.state() == ChainState::Voided));
    }

    #[test]
    fn cancel_without_outstanding_steps_is_a_no_op() {
        let tracker = ProgressionTracker::default();
        let mut chains = two_policies();
        tracker.cancel(&mut chains, LeaveRequestStatus::Pending, at());

        let second = tracker.cancel(&mut chains, LeaveRequestStatus::Canceled, at());
        assert!(second.voided_step_ids.is_empty());
        assert_eq!(second.request_status, LeaveRequestStatus::Canceled);
        assert!(!second.request_status_changed());
    }

    #[test]
    fn cancel_keeps_rejected_status() {
        let tracker = ProgressionTracker::default();
        let mut chains = two_policies();
        let outcome = tracker.cancel(&mut chains, LeaveRequestStatus::Rejected, at());
        assert_eq!(outcome.request_status, LeaveRequestStatus::Rejected);
    }

    #[test]
    fn actionable_steps_is_idempotent_and_limited_to_head_position() {
        let tracker = ProgressionTracker::default();
        let chains = two_policies();
        let pm = Actor::user("u-pm");

        assert!(tracker.actionable_steps(&pm, &chains, LeaveRequestStatus::Pending).is_empty());
        let lead = Actor::user("u-lead");
        let first = tracker.actionable_steps(&lead, &chains, LeaveRequestStatus::Pending);
        let second = tracker.actionable_steps(&lead, &chains, LeaveRequestStatus::Pending);
        assert_eq!(first, second);
        assert_eq!(ids(&first), vec!["p1-s1"]);
    }

    #[test]
    fn at_most_one_position_per_chain_is_actionable() {
        let tracker = ProgressionTracker::default();
        let mut chains = two_policies();
        let admin = Actor::administrator("u-admin");

        loop {
            let actionable = tracker.actionable_steps(&admin, &chains, LeaveRequestStatus::Pending);
            for chain in chains.chains() {
                let positions: std::collections::BTreeSet<u32> = actionable
                    .iter()
                    .filter(|step| &step.policy_id == chain.policy_id())
                    .map(|step| step.sequence_order)
                    .collect();
                assert!(positions.len() <= 1);
            }
            let Some(next) = actionable.first() else { break };
            let next = next.id.0.clone();
            tracker
                .apply(
                    &mut chains,
                    LeaveRequestStatus::Pending,
                    &transition(&next, admin.clone(), Decision::Approve),
                    at(),
                )
                .expect("admin approves");
        }

        assert_eq!(chains.overall_status(), LeaveRequestStatus::Approved);
    }

    #[test]
    fn out_of_sequence_wrong_actor_and_terminal_steps_are_rejected_without_mutation() {
        let tracker = ProgressionTracker::new(FanOutRule::AnyOne).with_admin_override(false);
        let mut chains = two_policies();
        let snapshot = chains.clone();

        let error = tracker
            .apply(
                &mut chains,
                LeaveRequestStatus::Pending,
                &transition("p1-s2", Actor::user("u-pm"), Decision::Approve),
                at(),
            )
            .expect_err("second step is not yet actionable");
        assert_eq!(
            error,
            ProgressionError::OutOfSequence {
                step_id: StepId("p1-s2".to_string()),
                sequence_order: 2,
                current_sequence: 1,
            }
        );

        let error = tracker
            .apply(
                &mut chains,
                LeaveRequestStatus::Pending,
                &transition("p1-s1", Actor::administrator("u-admin"), Decision::Approve),
                at(),
            )
            .expect_err("override disabled");
        assert!(matches!(error, ProgressionError::NotAssignedApprover { .. }));
        assert_eq!(chains, snapshot);

        tracker
            .apply(
                &mut chains,
                LeaveRequestStatus::Pending,
                &transition("p1-s1", Actor::user("u-lead"), Decision::Approve),
                at(),
            )
            .expect("lead approves");
        let error = tracker
            .apply(
                &mut chains,
                LeaveRequestStatus::Pending,
                &transition("p1-s1", Actor::user("u-lead"), Decision::Approve),
                at(),
            )
            .expect_err("already approved");
        assert!(matches!(
            error,
            ProgressionError::StepNotPending { status: StepStatus::Approved, .. }
        ));

        let error = tracker
            .apply(
                &mut chains,
                LeaveRequestStatus::Pending,
                &transition("missing", Actor::user("u-lead"), Decision::Approve),
                at(),
            )
            .expect_err("unknown step");
        assert!(matches!(error, ProgressionError::StepNotFound { .. }));
    }

    #[test]
    fn any_one_fan_out_voids_siblings_on_first_approval() {
        let tracker = ProgressionTracker::new(FanOutRule::AnyOne);
        let mut chains = RequestChains::from_steps(
            LeaveRequestId("LR-1".to_string()),
            vec![
                step("s1-a", "P", 1, Some("u-a")),
                step("s1-b", "P", 1, Some("u-b")),
                step("s2", "P", 2, Some("u-c")),
            ],
        );

        let outcome = tracker
            .apply(
                &mut chains,
                LeaveRequestStatus::Pending,
                &transition("s1-b", Actor::user("u-b"), Decision::Approve),
                at(),
            )
            .expect("sibling approves");

        assert_eq!(status_of(&chains, "s1-a"), StepStatus::Void);
        assert_eq!(ids(&outcome.updated_steps), vec!["s1-b", "s1-a"]);
        assert_eq!(outcome.next_approver_ids, vec![UserId("u-c".to_string())]);
    }

    #[test]
    fn all_fan_out_waits_for_every_sibling_without_renotifying() {
        let tracker = ProgressionTracker::new(FanOutRule::All);
        let mut chains = RequestChains::from_steps(
            LeaveRequestId("LR-1".to_string()),
            vec![
                step("s1-a", "P", 1, Some("u-a")),
                step("s1-b", "P", 1, Some("u-b")),
                step("s2", "P", 2, Some("u-c")),
            ],
        );

        let first = tracker
            .apply(
                &mut chains,
                LeaveRequestStatus::Pending,
                &transition("s1-a", Actor::user("u-a"), Decision::Approve),
                at(),
            )
            .expect("first sibling approves");
        assert!(first.next_approver_ids.is_empty());
        assert_eq!(status_of(&chains, "s1-b"), StepStatus::Pending);

        let second = tracker
            .apply(
                &mut chains,
                LeaveRequestStatus::Pending,
                &transition("s1-b", Actor::user("u-b"), Decision::Approve),
                at(),
            )
            .expect("second sibling approves");
        assert_eq!(second.next_approver_ids, vec![UserId("u-c".to_string())]);

        let last = tracker
            .apply(
                &mut chains,
                LeaveRequestStatus::Pending,
                &transition("s2", Actor::user("u-c"), Decision::Approve),
                at(),
            )
            .expect("final approval");
        assert_eq!(last.chain_state, ChainState::Satisfied);
        assert_eq!(last.request_status, LeaveRequestStatus::Approved);
        assert!(last.request_status_changed());
    }

    #[test]
    fn advancing_onto_unassigned_step_reports_escalation() {
        let tracker = ProgressionTracker::default();
        let mut chains = RequestChains::from_steps(
            LeaveRequestId("LR-1".to_string()),
            vec![step("s1", "P", 1, Some("u-a")), step("s2", "P", 2, None)],
        );

        let outcome = tracker
            .apply(
                &mut chains,
                LeaveRequestStatus::Pending,
                &transition("s1", Actor::user("u-a"), Decision::Approve),
                at(),
            )
            .expect("approval applies");
        assert!(outcome.next_approver_ids.is_empty());
        assert_eq!(outcome.escalated_step_ids, vec![StepId("s2".to_string())]);

        let admin = Actor::administrator("u-admin");
        let actionable = tracker.actionable_steps(&admin, &chains, LeaveRequestStatus::Pending);
        assert_eq!(ids(&actionable), vec!["s2"]);
    }

    #[test]
    fn request_without_chains_stays_pending() {
        let chains = RequestChains::from_steps(LeaveRequestId("LR-1".to_string()), Vec::new());
        assert!(chains.is_empty());
        assert_eq!(chains.overall_status(), LeaveRequestStatus::Pending);
    }

    #[test]
    fn initial_approvers_are_deduplicated_across_policies() {
        let chains = RequestChains::from_steps(
            LeaveRequestId("LR-1".to_string()),
            vec![
                step("a1", "A", 1, Some("u-boss")),
                step("b1", "B", 1, Some("u-boss")),
                step("b2", "B", 2, Some("u-hr")),
            ],
        );
        assert_eq!(chains.initial_approvers(), vec![UserId("u-boss".to_string())]);
    }

    #[test]
    fn fan_out_rule_parses_config_values() {
        assert_eq!("any_one".parse::<FanOutRule>(), Ok(FanOutRule::AnyOne));
        assert_eq!(" ALL ".parse::<FanOutRule>(), Ok(FanOutRule::All));
        assert!("majority".parse::<FanOutRule>().is_err());
    }
}
