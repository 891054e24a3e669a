use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use leaveflow_core::approvals::resolver::{DirectoryUser, ProjectMembership, UserDirectory};
use leaveflow_core::domain::org::{CompanyId, DepartmentId, ProjectId, RoleId, UserId};
use leaveflow_core::errors::ApplicationError;

use super::{decode_error, flag, RepositoryError};
use crate::DbPool;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProjectRecord {
    pub id: ProjectId,
    pub company_id: CompanyId,
    pub name: String,
    pub project_type: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepartmentRecord {
    pub id: DepartmentId,
    pub company_id: CompanyId,
    pub name: String,
    pub boss_id: Option<UserId>,
    pub supervisor_ids: Vec<UserId>,
}

/// Organization directory backed by the `users`, `project_members` and `departments`
/// tables.
pub struct SqlUserDirectory {
    pool: DbPool,
}

impl SqlUserDirectory {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn save_user(
        &self,
        user: &DirectoryUser,
        display_name: &str,
    ) -> Result<(), RepositoryError> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO users (id, company_id, display_name, default_role_id, is_active,
                                created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 company_id = excluded.company_id,
                 display_name = excluded.display_name,
                 default_role_id = excluded.default_role_id,
                 is_active = excluded.is_active,
                 updated_at = excluded.updated_at",
        )
        .bind(&user.id.0)
        .bind(&user.company_id.0)
        .bind(display_name)
        .bind(user.default_role_id.as_ref().map(|role| role.0.as_str()))
        .bind(flag(user.is_active))
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn find_user(&self, id: &UserId) -> Result<Option<DirectoryUser>, RepositoryError> {
        let row = sqlx::query(
            "SELECT id, company_id, default_role_id, is_active FROM users WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let id: String = row.try_get("id").map_err(decode_error)?;
        let company_id: String = row.try_get("company_id").map_err(decode_error)?;
        let default_role_id: Option<String> =
            row.try_get("default_role_id").map_err(decode_error)?;
        let is_active: i64 = row.try_get("is_active").map_err(decode_error)?;

        Ok(Some(DirectoryUser {
            id: UserId(id),
            company_id: CompanyId(company_id),
            default_role_id: default_role_id.map(RoleId),
            is_active: is_active != 0,
        }))
    }

    pub async fn save_project(&self, project: &ProjectRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO projects (id, company_id, name, project_type)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 company_id = excluded.company_id,
                 name = excluded.name,
                 project_type = excluded.project_type",
        )
        .bind(&project.id.0)
        .bind(&project.company_id.0)
        .bind(&project.name)
        .bind(project.project_type.as_deref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn add_project_member(
        &self,
        membership: &ProjectMembership,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO project_members (project_id, user_id, role_id)
             VALUES (?, ?, ?)
             ON CONFLICT(project_id, user_id) DO UPDATE SET role_id = excluded.role_id",
        )
        .bind(&membership.project_id.0)
        .bind(&membership.user_id.0)
        .bind(membership.role_id.as_ref().map(|role| role.0.as_str()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upserts the department and replaces its supervisor list.
    pub async fn save_department(
        &self,
        department: &DepartmentRecord,
    ) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO departments (id, company_id, name, boss_id)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 company_id = excluded.company_id,
                 name = excluded.name,
                 boss_id = excluded.boss_id",
        )
        .bind(&department.id.0)
        .bind(&department.company_id.0)
        .bind(&department.name)
        .bind(department.boss_id.as_ref().map(|boss| boss.0.as_str()))
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM department_supervisors WHERE department_id = ?")
            .bind(&department.id.0)
            .execute(&mut *tx)
            .await?;
        for supervisor in &department.supervisor_ids {
            sqlx::query(
                "INSERT OR IGNORE INTO department_supervisors (department_id, user_id)
                 VALUES (?, ?)",
            )
            .bind(&department.id.0)
            .bind(&supervisor.0)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

fn user_ids(rows: Vec<SqliteRow>) -> Result<Vec<UserId>, ApplicationError> {
    rows.iter()
        .map(|row| {
            row.try_get::<String, _>("user_id")
                .map(UserId)
                .map_err(|error| ApplicationError::from(decode_error(error)))
        })
        .collect()
}

fn directory_unavailable(error: sqlx::Error) -> ApplicationError {
    ApplicationError::Integration(format!("user directory lookup failed: {error}"))
}

#[async_trait]
impl UserDirectory for SqlUserDirectory {
    async fn users_with_role_in_project(
        &self,
        role_id: &RoleId,
        project_id: &ProjectId,
    ) -> Result<Vec<UserId>, ApplicationError> {
        let rows = sqlx::query(
            "SELECT DISTINCT u.id AS user_id
             FROM project_members pm
             JOIN users u ON u.id = pm.user_id
             WHERE pm.project_id = ?
               AND u.is_active = 1
               AND (pm.role_id = ? OR u.default_role_id = ?)
             ORDER BY u.id",
        )
        .bind(&project_id.0)
        .bind(&role_id.0)
        .bind(&role_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(directory_unavailable)?;
        user_ids(rows)
    }

    async fn users_with_role_company_wide(
        &self,
        role_id: &RoleId,
        company_id: &CompanyId,
    ) -> Result<Vec<UserId>, ApplicationError> {
        let rows = sqlx::query(
            "SELECT id AS user_id
             FROM users
             WHERE company_id = ? AND default_role_id = ? AND is_active = 1
             ORDER BY id",
        )
        .bind(&company_id.0)
        .bind(&role_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(directory_unavailable)?;
        user_ids(rows)
    }

    async fn department_supervisors(
        &self,
        department_id: &DepartmentId,
    ) -> Result<Vec<UserId>, ApplicationError> {
        let rows = sqlx::query(
            "SELECT u.id AS user_id
             FROM users u
             WHERE u.is_active = 1
               AND u.id IN (
                   SELECT boss_id FROM departments WHERE id = ?
                   UNION
                   SELECT user_id FROM department_supervisors WHERE department_id = ?
               )
             ORDER BY u.id",
        )
        .bind(&department_id.0)
        .bind(&department_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(directory_unavailable)?;
        user_ids(rows)
    }
}

#[cfg(test)]
mod tests {
    use leaveflow_core::approvals::resolver::{DirectoryUser, ProjectMembership, UserDirectory};
    use leaveflow_core::domain::org::{CompanyId, DepartmentId, ProjectId, RoleId, UserId};

    use super::{DepartmentRecord, ProjectRecord, SqlUserDirectory};
    use crate::{connect_with_settings, migrations};

    fn user(id: &str, role: Option<&str>, active: bool) -> DirectoryUser {
        DirectoryUser {
            id: UserId(id.to_string()),
            company_id: CompanyId("acme".to_string()),
            default_role_id: role.map(|role| RoleId(role.to_string())),
            is_active: active,
        }
    }

    async fn setup() -> SqlUserDirectory {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("migrations");
        let directory = SqlUserDirectory::new(pool);

        for (id, role, active) in [
            ("u-dev", Some("developer"), true),
            ("u-lead", Some("developer"), true),
            ("u-pm", Some("pm"), true),
            ("u-pm-2", Some("pm"), false),
            ("u-boss", Some("director"), true),
            ("u-sup", None, true),
        ] {
            directory.save_user(&user(id, role, active), id).await.expect("save user");
        }

        directory
            .save_project(&ProjectRecord {
                id: ProjectId("proj-x".to_string()),
                company_id: CompanyId("acme".to_string()),
                name: "Project X".to_string(),
                project_type: Some("client".to_string()),
            })
            .await
            .expect("save project");
        for (member, role) in
            [("u-dev", None), ("u-lead", Some("tech_lead")), ("u-pm", None), ("u-pm-2", None)]
        {
            directory
                .add_project_member(&ProjectMembership {
                    project_id: ProjectId("proj-x".to_string()),
                    user_id: UserId(member.to_string()),
                    role_id: role.map(|role: &str| RoleId(role.to_string())),
                })
                .await
                .expect("add member");
        }

        directory
            .save_department(&DepartmentRecord {
                id: DepartmentId("dept-eng".to_string()),
                company_id: CompanyId("acme".to_string()),
                name: "Engineering".to_string(),
                boss_id: Some(UserId("u-boss".to_string())),
                supervisor_ids: vec![UserId("u-sup".to_string()), UserId("u-boss".to_string())],
            })
            .await
            .expect("save department");

        directory
    }

    fn ids(users: Vec<UserId>) -> Vec<String> {
        users.into_iter().map(|user| user.0).collect()
    }

    #[tokio::test]
    async fn project_role_honours_assignment_and_default_role() {
        let directory = setup().await;
        let project = ProjectId("proj-x".to_string());

        let leads = directory
            .users_with_role_in_project(&RoleId("tech_lead".to_string()), &project)
            .await
            .expect("leads");
        assert_eq!(ids(leads), vec!["u-lead"]);

        let pms = directory
            .users_with_role_in_project(&RoleId("pm".to_string()), &project)
            .await
            .expect("pms");
        assert_eq!(ids(pms), vec!["u-pm"]);
    }

    #[tokio::test]
    async fn company_wide_lists_active_holders_of_default_role() {
        let directory = setup().await;
        let developers = directory
            .users_with_role_company_wide(
                &RoleId("developer".to_string()),
                &CompanyId("acme".to_string()),
            )
            .await
            .expect("developers");
        assert_eq!(ids(developers), vec!["u-dev", "u-lead"]);
    }

    #[tokio::test]
    async fn department_supervisors_include_boss_once() {
        let directory = setup().await;
        let supervisors = directory
            .department_supervisors(&DepartmentId("dept-eng".to_string()))
            .await
            .expect("supervisors");
        assert_eq!(ids(supervisors), vec!["u-boss", "u-sup"]);

        let unknown = directory
            .department_supervisors(&DepartmentId("dept-none".to_string()))
            .await
            .expect("unknown department");
        assert!(unknown.is_empty());
    }

    #[tokio::test]
    async fn saved_user_reloads() {
        let directory = setup().await;
        let loaded = directory
            .find_user(&UserId("u-pm-2".to_string()))
            .await
            .expect("find")
            .expect("present");
        assert_eq!(loaded, user("u-pm-2", Some("pm"), false));
    }
}
