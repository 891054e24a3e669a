use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::debug;

use leaveflow_core::approvals::progression::{
    CancelOutcome, ProgressionTracker, RequestChains, Transition, TransitionOutcome,
};
use leaveflow_core::approvals::store::StepStore;
use leaveflow_core::domain::leave_request::{LeaveRequest, LeaveRequestId, LeaveRequestStatus};
use leaveflow_core::domain::org::{CompanyId, DepartmentId, ProjectId, RoleId, UserId};
use leaveflow_core::domain::policy::PolicyId;
use leaveflow_core::domain::step::{ApprovalStep, StepId, StepStatus};
use leaveflow_core::errors::{ApplicationError, DomainError};

use super::{decode_error, flag, parse_timestamp, RepositoryError};
use crate::DbPool;

const REQUEST_COLUMNS: &str = "id, company_id, requester_id, request_type, project_id, project_type,
     department_id, contract_type_id, subject_role_id, status, created_at, updated_at";

const STEP_COLUMNS: &str = "id, leave_request_id, policy_id, sequence_order, approver_id, role_id,
     status, needs_escalation, created_at, updated_at";

/// Leave requests and their approval steps. Every progression runs inside a transaction
/// whose first statement writes the request row, so SQLite serializes concurrent
/// transitions on the same database before any step is read.
pub struct SqlStepRepository {
    pool: DbPool,
}

impl SqlStepRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Pending steps assigned to the user on requests still awaiting a decision, oldest
    /// first. Later positions of a chain are included.
    pub async fn pending_for_approver(
        &self,
        approver_id: &UserId,
    ) -> Result<Vec<ApprovalStep>, RepositoryError> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM approval_steps
             WHERE approver_id = ? AND status = 'pending'
               AND leave_request_id IN (SELECT id FROM leave_requests WHERE status = 'pending')
             ORDER BY created_at, leave_request_id, sequence_order, id"
        );
        let rows = sqlx::query(&sql).bind(&approver_id.0).fetch_all(&self.pool).await?;
        rows.iter().map(row_to_step).collect()
    }
}

/// Takes the request-level write lock and returns the stored status, or `None` when the
/// request does not exist. The lock write leaves the row's values as they are.
async fn lock_request(
    tx: &mut Transaction<'_, Sqlite>,
    id: &LeaveRequestId,
) -> Result<Option<LeaveRequestStatus>, RepositoryError> {
    let touched = sqlx::query("UPDATE leave_requests SET updated_at = updated_at WHERE id = ?")
        .bind(&id.0)
        .execute(&mut **tx)
        .await?;
    if touched.rows_affected() == 0 {
        return Ok(None);
    }

    let status: String = sqlx::query("SELECT status FROM leave_requests WHERE id = ?")
        .bind(&id.0)
        .fetch_one(&mut **tx)
        .await?
        .try_get("status")
        .map_err(decode_error)?;
    parse_request_status(&status).map(Some)
}

async fn load_steps(
    tx: &mut Transaction<'_, Sqlite>,
    id: &LeaveRequestId,
) -> Result<Vec<ApprovalStep>, RepositoryError> {
    let sql = format!(
        "SELECT {STEP_COLUMNS} FROM approval_steps
         WHERE leave_request_id = ?
         ORDER BY policy_id, sequence_order, id"
    );
    let rows = sqlx::query(&sql).bind(&id.0).fetch_all(&mut **tx).await?;
    rows.iter().map(row_to_step).collect()
}

async fn write_steps(
    tx: &mut Transaction<'_, Sqlite>,
    steps: &[ApprovalStep],
) -> Result<(), RepositoryError> {
    for step in steps {
        sqlx::query("UPDATE approval_steps SET status = ?, updated_at = ? WHERE id = ?")
            .bind(step.status.as_str())
            .bind(step.updated_at.to_rfc3339())
            .bind(&step.id.0)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

async fn write_request_status(
    tx: &mut Transaction<'_, Sqlite>,
    id: &LeaveRequestId,
    status: LeaveRequestStatus,
    now: &str,
) -> Result<(), RepositoryError> {
    sqlx::query("UPDATE leave_requests SET status = ?, updated_at = ? WHERE id = ?")
        .bind(status.as_str())
        .bind(now)
        .bind(&id.0)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

fn not_found(id: &LeaveRequestId) -> ApplicationError {
    ApplicationError::NotFound { entity: "leave request", id: id.0.clone() }
}

#[async_trait]
impl StepStore for SqlStepRepository {
    async fn create_request_with_steps(
        &self,
        request: &LeaveRequest,
        steps: &[ApprovalStep],
    ) -> Result<(), ApplicationError> {
        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;

        let inserted = sqlx::query(
            "INSERT INTO leave_requests (id, company_id, requester_id, request_type, project_id,
                                         project_type, department_id, contract_type_id,
                                         subject_role_id, status, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO NOTHING",
        )
        .bind(&request.id.0)
        .bind(&request.company_id.0)
        .bind(&request.requester_id.0)
        .bind(&request.request_type)
        .bind(request.project_id.as_ref().map(|project| project.0.as_str()))
        .bind(request.project_type.as_deref())
        .bind(request.department_id.as_ref().map(|department| department.0.as_str()))
        .bind(request.contract_type_id.as_deref())
        .bind(request.subject_role_id.as_ref().map(|role| role.0.as_str()))
        .bind(request.status.as_str())
        .bind(request.created_at.to_rfc3339())
        .bind(request.updated_at.to_rfc3339())
        .execute(&mut *tx)
        .await
        .map_err(RepositoryError::from)?;

        if inserted.rows_affected() == 0 {
            return Err(DomainError::DuplicateSubmission { leave_request_id: request.id.clone() }
                .into());
        }

        for step in steps {
            sqlx::query(
                "INSERT INTO approval_steps (id, leave_request_id, policy_id, sequence_order,
                                             approver_id, role_id, status, needs_escalation,
                                             created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&step.id.0)
            .bind(&step.leave_request_id.0)
            .bind(&step.policy_id.0)
            .bind(i64::from(step.sequence_order))
            .bind(step.approver_id.as_ref().map(|approver| approver.0.as_str()))
            .bind(&step.role_id.0)
            .bind(step.status.as_str())
            .bind(flag(step.needs_escalation))
            .bind(step.created_at.to_rfc3339())
            .bind(step.updated_at.to_rfc3339())
            .execute(&mut *tx)
            .await
            .map_err(RepositoryError::from)?;
        }

        tx.commit().await.map_err(RepositoryError::from)?;
        debug!(
            event_name = "persistence.request.created",
            leave_request_id = %request.id,
            step_count = steps.len(),
            "leave request stored"
        );
        Ok(())
    }

    async fn find_request(
        &self,
        id: &LeaveRequestId,
    ) -> Result<Option<LeaveRequest>, ApplicationError> {
        let sql = format!("SELECT {REQUEST_COLUMNS} FROM leave_requests WHERE id = ?");
        let row = sqlx::query(&sql)
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await
            .map_err(RepositoryError::from)?;

        match row {
            Some(ref row) => Ok(Some(row_to_request(row)?)),
            None => Ok(None),
        }
    }

    async fn steps_for_request(
        &self,
        id: &LeaveRequestId,
    ) -> Result<Vec<ApprovalStep>, ApplicationError> {
        let sql = format!(
            "SELECT {STEP_COLUMNS} FROM approval_steps
             WHERE leave_request_id = ?
             ORDER BY policy_id, sequence_order, id"
        );
        let rows = sqlx::query(&sql)
            .bind(&id.0)
            .fetch_all(&self.pool)
            .await
            .map_err(RepositoryError::from)?;
        Ok(rows.iter().map(row_to_step).collect::<Result<Vec<_>, _>>()?)
    }

    async fn apply_decision(
        &self,
        id: &LeaveRequestId,
        transition: &Transition,
        tracker: &ProgressionTracker,
    ) -> Result<TransitionOutcome, ApplicationError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;

        let status = lock_request(&mut tx, id).await?.ok_or_else(|| not_found(id))?;
        let steps = load_steps(&mut tx, id).await?;
        let mut chains = RequestChains::from_steps(id.clone(), steps);

        // An error here drops the transaction, which releases the lock.
        let outcome = tracker.apply(&mut chains, status, transition, now)?;

        write_steps(&mut tx, &outcome.updated_steps).await?;
        write_request_status(&mut tx, id, outcome.request_status, &now.to_rfc3339()).await?;
        tx.commit().await.map_err(RepositoryError::from)?;

        Ok(outcome)
    }

    async fn void_outstanding(
        &self,
        id: &LeaveRequestId,
        tracker: &ProgressionTracker,
    ) -> Result<CancelOutcome, ApplicationError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;

        let status = lock_request(&mut tx, id).await?.ok_or_else(|| not_found(id))?;
        let steps = load_steps(&mut tx, id).await?;
        let mut chains = RequestChains::from_steps(id.clone(), steps);

        let outcome = tracker.cancel(&mut chains, status, now);
        if outcome.voided_step_ids.is_empty() && !outcome.request_status_changed() {
            tx.rollback().await.map_err(RepositoryError::from)?;
            return Ok(outcome);
        }
        let voided: Vec<ApprovalStep> = chains
            .into_steps()
            .into_iter()
            .filter(|step| outcome.voided_step_ids.contains(&step.id))
            .collect();

        write_steps(&mut tx, &voided).await?;
        write_request_status(&mut tx, id, outcome.request_status, &now.to_rfc3339()).await?;
        tx.commit().await.map_err(RepositoryError::from)?;

        Ok(outcome)
    }
}

fn parse_request_status(raw: &str) -> Result<LeaveRequestStatus, RepositoryError> {
    LeaveRequestStatus::parse(raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown leave request status `{raw}`")))
}

fn row_to_request(row: &SqliteRow) -> Result<LeaveRequest, RepositoryError> {
    let id: String = row.try_get("id").map_err(decode_error)?;
    let company_id: String = row.try_get("company_id").map_err(decode_error)?;
    let requester_id: String = row.try_get("requester_id").map_err(decode_error)?;
    let request_type: String = row.try_get("request_type").map_err(decode_error)?;
    let project_id: Option<String> = row.try_get("project_id").map_err(decode_error)?;
    let project_type: Option<String> = row.try_get("project_type").map_err(decode_error)?;
    let department_id: Option<String> = row.try_get("department_id").map_err(decode_error)?;
    let contract_type_id: Option<String> = row.try_get("contract_type_id").map_err(decode_error)?;
    let subject_role_id: Option<String> = row.try_get("subject_role_id").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;
    let created_at: String = row.try_get("created_at").map_err(decode_error)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode_error)?;

    Ok(LeaveRequest {
        id: LeaveRequestId(id),
        company_id: CompanyId(company_id),
        requester_id: UserId(requester_id),
        request_type,
        project_id: project_id.map(ProjectId),
        project_type,
        department_id: department_id.map(DepartmentId),
        contract_type_id,
        subject_role_id: subject_role_id.map(RoleId),
        status: parse_request_status(&status)?,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

fn row_to_step(row: &SqliteRow) -> Result<ApprovalStep, RepositoryError> {
    let id: String = row.try_get("id").map_err(decode_error)?;
    let leave_request_id: String = row.try_get("leave_request_id").map_err(decode_error)?;
    let policy_id: String = row.try_get("policy_id").map_err(decode_error)?;
    let sequence_order: i64 = row.try_get("sequence_order").map_err(decode_error)?;
    let approver_id: Option<String> = row.try_get("approver_id").map_err(decode_error)?;
    let role_id: String = row.try_get("role_id").map_err(decode_error)?;
    let status: String = row.try_get("status").map_err(decode_error)?;
    let needs_escalation: i64 = row.try_get("needs_escalation").map_err(decode_error)?;
    let created_at: String = row.try_get("created_at").map_err(decode_error)?;
    let updated_at: String = row.try_get("updated_at").map_err(decode_error)?;

    Ok(ApprovalStep {
        id: StepId(id),
        leave_request_id: LeaveRequestId(leave_request_id),
        policy_id: PolicyId(policy_id),
        sequence_order: u32::try_from(sequence_order).map_err(decode_error)?,
        approver_id: approver_id.map(UserId),
        role_id: RoleId(role_id),
        status: StepStatus::parse(&status)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown step status `{status}`")))?,
        needs_escalation: needs_escalation != 0,
        created_at: parse_timestamp("created_at", &created_at)?,
        updated_at: parse_timestamp("updated_at", &updated_at)?,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use leaveflow_core::approvals::progression::{FanOutRule, ProgressionTracker, Transition};
    use leaveflow_core::approvals::store::StepStore;
    use leaveflow_core::domain::leave_request::{LeaveRequest, LeaveRequestId, LeaveRequestStatus};
    use leaveflow_core::domain::org::{Actor, CompanyId, RoleId, UserId};
    use leaveflow_core::domain::policy::PolicyId;
    use leaveflow_core::domain::step::{ApprovalStep, Decision, StepId, StepStatus};
    use leaveflow_core::errors::{ApplicationError, DomainError};

    use super::SqlStepRepository;
    use crate::{connect_with_settings, migrations};

    async fn setup() -> SqlStepRepository {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        SqlStepRepository::new(pool)
    }

    fn request(id: &str) -> LeaveRequest {
        LeaveRequest {
            id: LeaveRequestId(id.to_string()),
            company_id: CompanyId("acme".to_string()),
            requester_id: UserId("u-req".to_string()),
            request_type: "vacation".to_string(),
            project_id: None,
            project_type: Some("client".to_string()),
            department_id: None,
            contract_type_id: Some("full_time".to_string()),
            subject_role_id: None,
            status: LeaveRequestStatus::Pending,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn step(id: &str, request: &str, sequence_order: u32, approver: Option<&str>) -> ApprovalStep {
        ApprovalStep {
            id: StepId(id.to_string()),
            leave_request_id: LeaveRequestId(request.to_string()),
            policy_id: PolicyId("P1".to_string()),
            sequence_order,
            approver_id: approver.map(|approver| UserId(approver.to_string())),
            role_id: RoleId("lead".to_string()),
            status: StepStatus::Pending,
            needs_escalation: approver.is_none(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn request_and_steps_round_trip() {
        let repo = setup().await;
        let original = request("LR-1");
        let steps = vec![step("s-1", "LR-1", 1, Some("u-lead")), step("s-2", "LR-1", 2, None)];
        repo.create_request_with_steps(&original, &steps).await.expect("create");

        let loaded = repo.find_request(&original.id).await.expect("find").expect("present");
        assert_eq!(loaded.request_type, "vacation");
        assert_eq!(loaded.contract_type_id.as_deref(), Some("full_time"));
        assert_eq!(loaded.status, LeaveRequestStatus::Pending);

        let stored = repo.steps_for_request(&original.id).await.expect("steps");
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[1].approver_id, None);
        assert!(stored[1].needs_escalation);
    }

    #[tokio::test]
    async fn second_submission_of_the_same_request_is_refused() {
        let repo = setup().await;
        let original = request("LR-1");
        repo.create_request_with_steps(&original, &[step("s-1", "LR-1", 1, Some("u-lead"))])
            .await
            .expect("create");

        let error = repo
            .create_request_with_steps(&original, &[step("s-9", "LR-1", 1, Some("u-lead"))])
            .await
            .expect_err("duplicate refused");
        assert!(matches!(error, ApplicationError::Domain(DomainError::DuplicateSubmission { .. })));
        assert_eq!(repo.steps_for_request(&original.id).await.expect("steps").len(), 1);
    }

    #[tokio::test]
    async fn decision_persists_steps_and_request_status() {
        let repo = setup().await;
        repo.create_request_with_steps(
            &request("LR-1"),
            &[step("s-1", "LR-1", 1, Some("u-lead")), step("s-2", "LR-1", 2, Some("u-pm"))],
        )
        .await
        .expect("create");
        let tracker = ProgressionTracker::new(FanOutRule::AnyOne);
        let id = LeaveRequestId("LR-1".to_string());

        let first = repo
            .apply_decision(
                &id,
                &Transition {
                    step_id: StepId("s-1".to_string()),
                    actor: Actor::user("u-lead"),
                    decision: Decision::Approve,
                },
                &tracker,
            )
            .await
            .expect("approve first");
        assert_eq!(first.next_approver_ids, vec![UserId("u-pm".to_string())]);
        assert_eq!(first.request_status, LeaveRequestStatus::Pending);

        let second = repo
            .apply_decision(
                &id,
                &Transition {
                    step_id: StepId("s-2".to_string()),
                    actor: Actor::user("u-pm"),
                    decision: Decision::Approve,
                },
                &tracker,
            )
            .await
            .expect("approve second");
        assert_eq!(second.request_status, LeaveRequestStatus::Approved);

        let stored = repo.find_request(&id).await.expect("find").expect("present");
        assert_eq!(stored.status, LeaveRequestStatus::Approved);
        let statuses: Vec<StepStatus> = repo
            .steps_for_request(&id)
            .await
            .expect("steps")
            .into_iter()
            .map(|step| step.status)
            .collect();
        assert_eq!(statuses, vec![StepStatus::Approved, StepStatus::Approved]);
    }

    #[tokio::test]
    async fn refused_decision_leaves_storage_untouched() {
        let repo = setup().await;
        repo.create_request_with_steps(
            &request("LR-1"),
            &[step("s-1", "LR-1", 1, Some("u-lead")), step("s-2", "LR-1", 2, Some("u-pm"))],
        )
        .await
        .expect("create");
        let id = LeaveRequestId("LR-1".to_string());
        let before = repo.steps_for_request(&id).await.expect("steps");

        let error = repo
            .apply_decision(
                &id,
                &Transition {
                    step_id: StepId("s-2".to_string()),
                    actor: Actor::user("u-pm"),
                    decision: Decision::Approve,
                },
                &ProgressionTracker::default(),
            )
            .await
            .expect_err("out of sequence");
        assert!(error.is_client_error());
        assert_eq!(repo.steps_for_request(&id).await.expect("steps"), before);
    }

    #[tokio::test]
    async fn unknown_request_is_not_found() {
        let repo = setup().await;
        let error = repo
            .void_outstanding(&LeaveRequestId("LR-404".to_string()), &ProgressionTracker::default())
            .await
            .expect_err("missing request");
        assert!(matches!(error, ApplicationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn cancel_voids_pending_steps_only() {
        let repo = setup().await;
        repo.create_request_with_steps(
            &request("LR-1"),
            &[step("s-1", "LR-1", 1, Some("u-lead")), step("s-2", "LR-1", 2, Some("u-pm"))],
        )
        .await
        .expect("create");
        let id = LeaveRequestId("LR-1".to_string());
        let tracker = ProgressionTracker::default();
        repo.apply_decision(
            &id,
            &Transition {
                step_id: StepId("s-1".to_string()),
                actor: Actor::user("u-lead"),
                decision: Decision::Approve,
            },
            &tracker,
        )
        .await
        .expect("approve first");

        let outcome = repo.void_outstanding(&id, &tracker).await.expect("cancel");
        assert_eq!(outcome.voided_step_ids, vec![StepId("s-2".to_string())]);
        assert_eq!(outcome.request_status, LeaveRequestStatus::Canceled);

        let statuses: Vec<StepStatus> = repo
            .steps_for_request(&id)
            .await
            .expect("steps")
            .into_iter()
            .map(|step| step.status)
            .collect();
        assert_eq!(statuses, vec![StepStatus::Approved, StepStatus::Void]);

        let canceled = repo.find_request(&id).await.expect("find").expect("present");
        let again = repo.void_outstanding(&id, &tracker).await.expect("cancel again");
        assert!(again.voided_step_ids.is_empty());
        assert!(!again.request_status_changed());
        let after = repo.find_request(&id).await.expect("find").expect("present");
        assert_eq!(after.updated_at, canceled.updated_at);
        assert_eq!(after, canceled);
    }

    #[tokio::test]
    async fn refused_decision_keeps_request_timestamp() {
        let repo = setup().await;
        let original = request("LR-1");
        repo.create_request_with_steps(&original, &[step("s-1", "LR-1", 1, Some("u-lead"))])
            .await
            .expect("create");
        let before = repo.find_request(&original.id).await.expect("find").expect("present");

        repo.apply_decision(
            &original.id,
            &Transition {
                step_id: StepId("s-1".to_string()),
                actor: Actor::user("u-stranger"),
                decision: Decision::Approve,
            },
            &ProgressionTracker::new(FanOutRule::AnyOne).with_admin_override(false),
        )
        .await
        .expect_err("not the assigned approver");

        let after = repo.find_request(&original.id).await.expect("find").expect("present");
        assert_eq!(after.updated_at, before.updated_at);
    }

    #[tokio::test]
    async fn pending_steps_are_listed_per_approver() {
        let repo = setup().await;
        repo.create_request_with_steps(
            &request("LR-1"),
            &[step("s-1", "LR-1", 1, Some("u-lead")), step("s-2", "LR-1", 2, Some("u-pm"))],
        )
        .await
        .expect("create");

        let pending =
            repo.pending_for_approver(&UserId("u-pm".to_string())).await.expect("pending");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, StepId("s-2".to_string()));

        repo.void_outstanding(&LeaveRequestId("LR-1".to_string()), &ProgressionTracker::default())
            .await
            .expect("cancel");
        let pending =
            repo.pending_for_approver(&UserId("u-pm".to_string())).await.expect("pending");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn closed_requests_drop_out_of_the_approver_list() {
        let repo = setup().await;
        let mut rejected = request("LR-2");
        rejected.status = LeaveRequestStatus::Rejected;
        repo.create_request_with_steps(&rejected, &[step("s-9", "LR-2", 1, Some("u-pm"))])
            .await
            .expect("create");

        let pending =
            repo.pending_for_approver(&UserId("u-pm".to_string())).await.expect("pending");
        assert!(pending.is_empty());
    }
}
