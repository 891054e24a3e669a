use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::domain::leave_request::ResolutionContext;
use crate::domain::org::{CompanyId, DepartmentId, ProjectId, RoleId, UserId};
use crate::domain::policy::{ApproverScope, StepTemplate};
use crate::errors::ApplicationError;

/// Live organizational data used to turn role + scope references into people.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Members of the project holding the role, either through a project-specific
    /// assignment or through their company default role. Both must be honoured.
    async fn users_with_role_in_project(
        &self,
        role_id: &RoleId,
        project_id: &ProjectId,
    ) -> Result<Vec<UserId>, ApplicationError>;

    /// Active users in the company whose default role is the given role.
    async fn users_with_role_company_wide(
        &self,
        role_id: &RoleId,
        company_id: &CompanyId,
    ) -> Result<Vec<UserId>, ApplicationError>;

    /// The department boss plus any additional designated supervisors.
    async fn department_supervisors(
        &self,
        department_id: &DepartmentId,
    ) -> Result<Vec<UserId>, ApplicationError>;
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub id: UserId,
    pub company_id: CompanyId,
    pub default_role_id: Option<RoleId>,
    pub is_active: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMembership {
    pub project_id: ProjectId,
    pub user_id: UserId,
    /// Project-specific role; `None` means the member acts in their default role.
    pub role_id: Option<RoleId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepartmentSupervision {
    pub department_id: DepartmentId,
    pub boss_id: Option<UserId>,
    pub supervisor_ids: Vec<UserId>,
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryUserDirectory {
    users: HashMap<UserId, DirectoryUser>,
    memberships: Vec<ProjectMembership>,
    departments: HashMap<DepartmentId, DepartmentSupervision>,
    unavailable: bool,
}

impl InMemoryUserDirectory {
    pub fn new(
        users: Vec<DirectoryUser>,
        memberships: Vec<ProjectMembership>,
        departments: Vec<DepartmentSupervision>,
    ) -> Self {
        Self {
            users: users.into_iter().map(|user| (user.id.clone(), user)).collect(),
            memberships,
            departments: departments
                .into_iter()
                .map(|department| (department.department_id.clone(), department))
                .collect(),
            unavailable: false,
        }
    }

    /// A directory whose every lookup fails, for exercising degraded resolution.
    pub fn unavailable() -> Self {
        Self { unavailable: true, ..Self::default() }
    }

    fn ensure_available(&self) -> Result<(), ApplicationError> {
        if self.unavailable {
            return Err(ApplicationError::Integration("user directory is unavailable".to_string()));
        }
        Ok(())
    }

    fn is_active(&self, user_id: &UserId) -> bool {
        self.users.get(user_id).map(|user| user.is_active).unwrap_or(false)
    }
}

#[async_trait]
impl UserDirectory for InMemoryUserDirectory {
    async fn users_with_role_in_project(
        &self,
        role_id: &RoleId,
        project_id: &ProjectId,
    ) -> Result<Vec<UserId>, ApplicationError> {
        self.ensure_available()?;
        let users = self
            .memberships
            .iter()
            .filter(|membership| &membership.project_id == project_id)
            .filter(|membership| self.is_active(&membership.user_id))
            .filter(|membership| {
                let project_role = membership.role_id.as_ref() == Some(role_id);
                let default_role = self
                    .users
                    .get(&membership.user_id)
                    .and_then(|user| user.default_role_id.as_ref())
                    == Some(role_id);
                project_role || default_role
            })
            .map(|membership| membership.user_id.clone())
            .collect::<BTreeSet<_>>();
        Ok(users.into_iter().collect())
    }

    async fn users_with_role_company_wide(
        &self,
        role_id: &RoleId,
        company_id: &CompanyId,
    ) -> Result<Vec<UserId>, ApplicationError> {
        self.ensure_available()?;
        let users = self
            .users
            .values()
            .filter(|user| user.is_active && &user.company_id == company_id)
            .filter(|user| user.default_role_id.as_ref() == Some(role_id))
            .map(|user| user.id.clone())
            .collect::<BTreeSet<_>>();
        Ok(users.into_iter().collect())
    }

    async fn department_supervisors(
        &self,
        department_id: &DepartmentId,
    ) -> Result<Vec<UserId>, ApplicationError> {
        self.ensure_available()?;
        let Some(department) = self.departments.get(department_id) else {
            return Ok(Vec::new());
        };
        let users = department
            .boss_id
            .iter()
            .chain(department.supervisor_ids.iter())
            .filter(|user_id| self.is_active(user_id))
            .cloned()
            .collect::<BTreeSet<_>>();
        Ok(users.into_iter().collect())
    }
}

/// Turns a step template's role + scope into the concrete people allowed to act.
#[derive(Clone)]
pub struct ApproverResolver {
    directory: Arc<dyn UserDirectory>,
}

impl ApproverResolver {
    pub fn new(directory: Arc<dyn UserDirectory>) -> Self {
        Self { directory }
    }

    /// Sorted, de-duplicated approvers for a step, never including the requester.
    pub async fn resolve(
        &self,
        template: &StepTemplate,
        context: &ResolutionContext,
    ) -> Result<Vec<UserId>, ApplicationError> {
        self.resolve_scope(&template.approver_role_id, &template.scope, context).await
    }

    pub async fn resolve_scope(
        &self,
        role_id: &RoleId,
        scope: &ApproverScope,
        context: &ResolutionContext,
    ) -> Result<Vec<UserId>, ApplicationError> {
        let candidates = match scope {
            ApproverScope::SameProject => self.resolve_same_project(role_id, context).await?,
            ApproverScope::SameDepartment => self.resolve_same_department(context).await?,
            ApproverScope::CompanyWide => self.resolve_company_wide(role_id, context).await?,
            ApproverScope::SpecificUser { user_id } => vec![user_id.clone()],
        };

        let excluded: HashSet<&UserId> = HashSet::from([&context.requester_id]);
        let approvers = candidates
            .into_iter()
            .filter(|user_id| !user_id.0.trim().is_empty())
            .filter(|user_id| !excluded.contains(user_id))
            .collect::<BTreeSet<_>>();
        Ok(approvers.into_iter().collect())
    }

    async fn resolve_same_project(
        &self,
        role_id: &RoleId,
        context: &ResolutionContext,
    ) -> Result<Vec<UserId>, ApplicationError> {
        let Some(project_id) = &context.project_id else {
            warn!(
                event_name = "approval.resolve.missing_project",
                role_id = %role_id,
                requester_id = %context.requester_id,
                "same-project scope used on a request without a project"
            );
            return Ok(Vec::new());
        };
        self.directory.users_with_role_in_project(role_id, project_id).await
    }

    async fn resolve_same_department(
        &self,
        context: &ResolutionContext,
    ) -> Result<Vec<UserId>, ApplicationError> {
        let Some(department_id) = &context.department_id else {
            warn!(
                event_name = "approval.resolve.missing_department",
                requester_id = %context.requester_id,
                "same-department scope used on a request without a department"
            );
            return Ok(Vec::new());
        };
        self.directory.department_supervisors(department_id).await
    }

    async fn resolve_company_wide(
        &self,
        role_id: &RoleId,
        context: &ResolutionContext,
    ) -> Result<Vec<UserId>, ApplicationError> {
        self.directory.users_with_role_company_wide(role_id, &context.company_id).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::{
        ApproverResolver, DepartmentSupervision, DirectoryUser, InMemoryUserDirectory,
        ProjectMembership,
    };
    use crate::domain::leave_request::ResolutionContext;
    use crate::domain::org::{CompanyId, DepartmentId, ProjectId, RoleId, UserId};
    use crate::domain::policy::{ApproverScope, StepTemplate};

    fn user(id: &str, role: Option<&str>) -> DirectoryUser {
        DirectoryUser {
            id: UserId(id.to_string()),
            company_id: CompanyId("acme".to_string()),
            default_role_id: role.map(|role| RoleId(role.to_string())),
            is_active: true,
        }
    }

    fn member(project: &str, user: &str, role: Option<&str>) -> ProjectMembership {
        ProjectMembership {
            project_id: ProjectId(project.to_string()),
            user_id: UserId(user.to_string()),
            role_id: role.map(|role| RoleId(role.to_string())),
        }
    }

    fn directory() -> InMemoryUserDirectory {
        let mut retired = user("u-retired", Some("team_lead"));
        retired.is_active = false;

        InMemoryUserDirectory::new(
            vec![
                user("u-requester", Some("developer")),
                user("u-default-lead", Some("team_lead")),
                user("u-project-lead", Some("developer")),
                user("u-outsider-lead", Some("team_lead")),
                user("u-boss", Some("manager")),
                user("u-deputy", Some("manager")),
                retired,
            ],
            vec![
                member("p-x", "u-requester", None),
                member("p-x", "u-default-lead", None),
                member("p-x", "u-project-lead", Some("team_lead")),
                member("p-x", "u-retired", None),
                member("p-y", "u-outsider-lead", None),
            ],
            vec![
                DepartmentSupervision {
                    department_id: DepartmentId("d-eng".to_string()),
                    boss_id: Some(UserId("u-boss".to_string())),
                    supervisor_ids: vec![UserId("u-deputy".to_string()), UserId("u-boss".to_string())],
                },
                DepartmentSupervision {
                    department_id: DepartmentId("d-empty".to_string()),
                    boss_id: None,
                    supervisor_ids: Vec::new(),
                },
            ],
        )
    }

    fn context() -> ResolutionContext {
        ResolutionContext {
            requester_id: UserId("u-requester".to_string()),
            company_id: CompanyId("acme".to_string()),
            project_id: Some(ProjectId("p-x".to_string())),
            department_id: Some(DepartmentId("d-eng".to_string())),
        }
    }

    fn template(role: &str, scope: ApproverScope) -> StepTemplate {
        StepTemplate { sequence_order: 1, approver_role_id: RoleId(role.to_string()), scope }
    }

    fn ids(users: Vec<UserId>) -> Vec<String> {
        users.into_iter().map(|user| user.0).collect()
    }

    #[tokio::test]
    async fn same_project_includes_default_role_members_and_project_assignments() {
        let resolver = ApproverResolver::new(Arc::new(directory()));
        let approvers = resolver
            .resolve(&template("team_lead", ApproverScope::SameProject), &context())
            .await
            .expect("resolution succeeds");

        assert_eq!(ids(approvers), vec!["u-default-lead", "u-project-lead"]);
    }

    #[tokio::test]
    async fn same_project_without_project_is_empty() {
        let resolver = ApproverResolver::new(Arc::new(directory()));
        let mut context = context();
        context.project_id = None;

        let approvers = resolver
            .resolve(&template("team_lead", ApproverScope::SameProject), &context)
            .await
            .expect("resolution succeeds");
        assert!(approvers.is_empty());
    }

    #[tokio::test]
    async fn same_department_returns_deduplicated_supervisors() {
        let resolver = ApproverResolver::new(Arc::new(directory()));
        let approvers = resolver
            .resolve(&template("manager", ApproverScope::SameDepartment), &context())
            .await
            .expect("resolution succeeds");

        assert_eq!(ids(approvers), vec!["u-boss", "u-deputy"]);
    }

    #[tokio::test]
    async fn department_without_supervisor_resolves_to_nobody() {
        let resolver = ApproverResolver::new(Arc::new(directory()));
        let mut context = context();
        context.department_id = Some(DepartmentId("d-empty".to_string()));

        let approvers = resolver
            .resolve(&template("manager", ApproverScope::SameDepartment), &context)
            .await
            .expect("resolution succeeds");
        assert!(approvers.is_empty());
    }

    #[tokio::test]
    async fn company_wide_ignores_project_and_inactive_users() {
        let resolver = ApproverResolver::new(Arc::new(directory()));
        let approvers = resolver
            .resolve(&template("team_lead", ApproverScope::CompanyWide), &context())
            .await
            .expect("resolution succeeds");

        assert_eq!(ids(approvers), vec!["u-default-lead", "u-outsider-lead"]);
    }

    #[tokio::test]
    async fn requester_never_approves_their_own_request() {
        let resolver = ApproverResolver::new(Arc::new(directory()));
        let approvers = resolver
            .resolve(
                &template(
                    "ceo",
                    ApproverScope::SpecificUser { user_id: UserId("u-requester".to_string()) },
                ),
                &context(),
            )
            .await
            .expect("resolution succeeds");
        assert!(approvers.is_empty());

        let developers = resolver
            .resolve(&template("developer", ApproverScope::CompanyWide), &context())
            .await
            .expect("resolution succeeds");
        assert_eq!(ids(developers), vec!["u-project-lead"]);
    }

    #[tokio::test]
    async fn unavailable_directory_surfaces_an_error() {
        let resolver = ApproverResolver::new(Arc::new(InMemoryUserDirectory::unavailable()));
        let result = resolver
            .resolve(&template("manager", ApproverScope::CompanyWide), &context())
            .await;
        assert!(result.is_err());
    }
}
