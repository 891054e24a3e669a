use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use leaveflow_core::audit::TracingAuditSink;
use leaveflow_core::config::{AppConfig, LoadOptions};
use leaveflow_core::domain::leave_request::{LeaveRequest, LeaveRequestId, LeaveRequestStatus};
use leaveflow_core::domain::org::{Actor, CompanyId, DepartmentId, ProjectId, RoleId, UserId};
use leaveflow_core::domain::step::{ApprovalStep, Decision, StepId};
use leaveflow_core::engine::{ApprovalEngine, EnginePorts, EngineSettings};
use leaveflow_core::errors::ApplicationError;
use leaveflow_core::policy::DocumentFormat;
use leaveflow_db::{
    DbPool, SqlNotificationOutbox, SqlPolicyRepository, SqlStepRepository, SqlUserDirectory,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::commands::{
    application_failure, block_on, load_config, open_pool, CommandResult, Failure,
};

/// A leave request as written by hand for `request submit`.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct RequestDocument {
    pub id: String,
    pub company_id: String,
    pub requester_id: String,
    pub request_type: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub project_type: Option<String>,
    #[serde(default)]
    pub department_id: Option<String>,
    #[serde(default)]
    pub contract_type_id: Option<String>,
    #[serde(default)]
    pub subject_role_id: Option<String>,
}

impl RequestDocument {
    pub fn into_request(self) -> LeaveRequest {
        let now = Utc::now();
        LeaveRequest {
            id: LeaveRequestId(self.id),
            company_id: CompanyId(self.company_id),
            requester_id: UserId(self.requester_id),
            request_type: self.request_type,
            project_id: self.project_id.map(ProjectId),
            project_type: self.project_type,
            department_id: self.department_id.map(DepartmentId),
            contract_type_id: self.contract_type_id,
            subject_role_id: self.subject_role_id.map(RoleId),
            status: LeaveRequestStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Serialize)]
struct RequestView {
    request: LeaveRequest,
    steps: Vec<ApprovalStep>,
}

#[derive(Debug, Serialize)]
struct ApproverInbox {
    approver_id: UserId,
    steps: Vec<ApprovalStep>,
}

pub fn submit(options: &LoadOptions, path: &Path) -> CommandResult {
    let correlation_id = correlation_id();
    let result = read_request(path).and_then(|request| {
        with_engine(options, |engine| async move {
            engine
                .submit(request, &correlation_id)
                .await
                .map_err(|error| application_failure(error, &correlation_id))
        })
    });

    match result {
        Ok(outcome) => {
            let message = if outcome.needs_escalation {
                format!(
                    "leave request `{}` matched no policy and awaits an administrator",
                    outcome.leave_request_id
                )
            } else {
                format!(
                    "leave request `{}` submitted with {} approval step(s)",
                    outcome.leave_request_id,
                    outcome.steps.len()
                )
            };
            CommandResult::success_with_data("request.submit", message, &outcome)
        }
        Err(failure) => CommandResult::from_failure("request.submit", failure),
    }
}

pub fn steps(options: &LoadOptions, leave_request_id: &str) -> CommandResult {
    let correlation_id = correlation_id();
    let id = LeaveRequestId(leave_request_id.to_string());
    let result = with_engine(options, |engine| async move {
        let request = engine
            .find_request(&id)
            .await
            .map_err(|error| application_failure(error, &correlation_id))?;
        let steps = engine
            .steps_for_request(&id)
            .await
            .map_err(|error| application_failure(error, &correlation_id))?;
        Ok(RequestView { request, steps })
    });

    match result {
        Ok(view) => CommandResult::success_with_data(
            "request.steps",
            format!("leave request `{}` is {}", view.request.id, view.request.status),
            &view,
        ),
        Err(failure) => CommandResult::from_failure("request.steps", failure),
    }
}

pub fn act(
    options: &LoadOptions,
    leave_request_id: &str,
    step_id: &str,
    actor: Actor,
    decision: Decision,
) -> CommandResult {
    let correlation_id = correlation_id();
    let id = LeaveRequestId(leave_request_id.to_string());
    let step_id = StepId(step_id.to_string());
    let result = with_engine(options, |engine| async move {
        engine
            .apply_transition(&id, &step_id, &actor, decision, &correlation_id)
            .await
            .map_err(|error| application_failure(error, &correlation_id))
    });

    match result {
        Ok(outcome) => CommandResult::success_with_data(
            "request.act",
            format!(
                "step `{}` {}; leave request is {}",
                outcome.step_id,
                past_tense(decision),
                outcome.request_status
            ),
            &outcome,
        ),
        Err(failure) => CommandResult::from_failure("request.act", failure),
    }
}

pub fn cancel(options: &LoadOptions, leave_request_id: &str, actor: Actor) -> CommandResult {
    let correlation_id = correlation_id();
    let id = LeaveRequestId(leave_request_id.to_string());
    let result = with_engine(options, |engine| async move {
        engine
            .cancel_all(&id, &actor, &correlation_id)
            .await
            .map_err(|error| application_failure(error, &correlation_id))
    });

    match result {
        Ok(outcome) => CommandResult::success_with_data(
            "request.cancel",
            format!(
                "voided {} step(s); leave request is {}",
                outcome.voided_step_ids.len(),
                outcome.request_status
            ),
            &outcome,
        ),
        Err(failure) => CommandResult::from_failure("request.cancel", failure),
    }
}

/// Steps the approver can decide right now, across every open request.
pub fn pending(options: &LoadOptions, approver_id: &str) -> CommandResult {
    let correlation_id = correlation_id();
    let actor = Actor::user(approver_id);
    let result = load_config(options).and_then(|config| {
        block_on(async {
            let pool = open_pool(&config).await?;
            let assigned = SqlStepRepository::new(pool.clone())
                .pending_for_approver(&actor.user_id)
                .await
                .map_err(|error| {
                    application_failure(ApplicationError::from(error), &correlation_id)
                });
            let engine = build_engine(&config, pool.clone());
            let inbox = match assigned {
                Ok(assigned) => actionable_for(&engine, &actor, assigned)
                    .await
                    .map_err(|error| application_failure(error, &correlation_id)),
                Err(failure) => Err(failure),
            };
            pool.close().await;
            inbox
        })
    });

    match result {
        Ok(steps) => CommandResult::success_with_data(
            "request.pending",
            format!("{} step(s) await `{approver_id}`", steps.len()),
            &ApproverInbox { approver_id: actor.user_id, steps },
        ),
        Err(failure) => CommandResult::from_failure("request.pending", failure),
    }
}

/// Keeps the assigned steps that are at the head of their chain.
async fn actionable_for(
    engine: &ApprovalEngine,
    actor: &Actor,
    assigned: Vec<ApprovalStep>,
) -> Result<Vec<ApprovalStep>, ApplicationError> {
    let mut request_ids: Vec<LeaveRequestId> = Vec::new();
    for step in &assigned {
        if !request_ids.contains(&step.leave_request_id) {
            request_ids.push(step.leave_request_id.clone());
        }
    }

    let mut steps = Vec::new();
    for id in &request_ids {
        let actionable = engine.actionable_steps(actor, id).await?;
        steps.extend(
            actionable.into_iter().filter(|step| step.approver_id.as_ref() == Some(&actor.user_id)),
        );
    }
    Ok(steps)
}

/// Runs one engine operation against the configured database and closes the pool after.
fn with_engine<T, F, Fut>(options: &LoadOptions, operation: F) -> Result<T, Failure>
where
    F: FnOnce(ApprovalEngine) -> Fut,
    Fut: std::future::Future<Output = Result<T, Failure>>,
{
    let config = load_config(options)?;
    block_on(async {
        let pool = open_pool(&config).await?;
        let engine = build_engine(&config, pool.clone());
        let result = operation(engine).await;
        pool.close().await;
        result
    })
}

pub fn build_engine(config: &AppConfig, pool: DbPool) -> ApprovalEngine {
    ApprovalEngine::new(
        EnginePorts {
            directory: Arc::new(SqlUserDirectory::new(pool.clone())),
            policies: Arc::new(SqlPolicyRepository::new(pool.clone())),
            steps: Arc::new(SqlStepRepository::new(pool.clone())),
            notifications: Arc::new(SqlNotificationOutbox::new(pool)),
            audit: Arc::new(TracingAuditSink),
        },
        EngineSettings::from(config),
    )
}

fn read_request(path: &Path) -> Result<LeaveRequest, Failure> {
    let raw = fs::read_to_string(path).map_err(|error| {
        ("input_read", format!("could not read `{}`: {error}", path.display()), 6u8)
    })?;
    let document: RequestDocument = match DocumentFormat::from_path(path) {
        DocumentFormat::Toml => {
            toml::from_str(&raw).map_err(|error| ("request_invalid", error.to_string(), 6u8))?
        }
        DocumentFormat::Json => serde_json::from_str(&raw)
            .map_err(|error| ("request_invalid", error.to_string(), 6u8))?,
    };
    if document.id.trim().is_empty() || document.requester_id.trim().is_empty() {
        return Err(("request_invalid", "request id and requester_id are required".to_string(), 6));
    }
    Ok(document.into_request())
}

fn correlation_id() -> String {
    format!("cli-{}", Uuid::new_v4())
}

fn past_tense(decision: Decision) -> &'static str {
    match decision {
        Decision::Approve => "approved",
        Decision::Reject => "rejected",
    }
}

#[cfg(test)]
mod tests {
    use leaveflow_core::domain::leave_request::LeaveRequestStatus;
    use leaveflow_core::domain::org::ProjectId;

    use super::RequestDocument;

    #[test]
    fn example_request_document_decodes() {
        let raw = include_str!("../../../../config/requests/vacation.toml");
        let document: RequestDocument = toml::from_str(raw).expect("request document");
        let request = document.into_request();

        assert_eq!(request.id.0, "LR-2026-0001");
        assert_eq!(request.project_id, Some(ProjectId("proj-apollo".to_string())));
        assert_eq!(request.status, LeaveRequestStatus::Pending);
        assert_eq!(request.trigger_context().project_type.as_deref(), Some("client"));
    }

    #[test]
    fn optional_coordinates_default_to_none() {
        let document: RequestDocument = toml::from_str(
            "id = \"LR-9\"\ncompany_id = \"acme\"\nrequester_id = \"u-bob\"\nrequest_type = \"sick\"\n",
        )
        .expect("minimal document");
        let request = document.into_request();
        assert_eq!(request.department_id, None);
        assert_eq!(request.subject_role_id, None);
    }
}
