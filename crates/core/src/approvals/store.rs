use async_trait::async_trait;

use crate::approvals::progression::{CancelOutcome, ProgressionTracker, Transition, TransitionOutcome};
use crate::domain::leave_request::{LeaveRequest, LeaveRequestId};
use crate::domain::step::ApprovalStep;
use crate::errors::ApplicationError;

/// Persistence for leave requests and their approval steps.
///
/// `apply_decision` and `void_outstanding` are each one atomic unit: the steps are read,
/// progressed and written back without any other transition on the same request
/// interleaving. Implementations hold the request-level lock for the whole unit.
#[async_trait]
pub trait StepStore: Send + Sync {
    /// Stores a new request together with its freshly built steps. Fails with
    /// `DomainError::DuplicateSubmission` if the request already exists.
    async fn create_request_with_steps(
        &self,
        request: &LeaveRequest,
        steps: &[ApprovalStep],
    ) -> Result<(), ApplicationError>;

    async fn find_request(
        &self,
        id: &LeaveRequestId,
    ) -> Result<Option<LeaveRequest>, ApplicationError>;

    async fn steps_for_request(
        &self,
        id: &LeaveRequestId,
    ) -> Result<Vec<ApprovalStep>, ApplicationError>;

    async fn apply_decision(
        &self,
        id: &LeaveRequestId,
        transition: &Transition,
        tracker: &ProgressionTracker,
    ) -> Result<TransitionOutcome, ApplicationError>;

    async fn void_outstanding(
        &self,
        id: &LeaveRequestId,
        tracker: &ProgressionTracker,
    ) -> Result<CancelOutcome, ApplicationError>;
}
