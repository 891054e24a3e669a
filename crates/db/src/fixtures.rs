use sqlx::Executor;
use thiserror::Error;
use tracing::info;

use leaveflow_core::errors::ApplicationError;
use leaveflow_core::policy::{parse_bundle, DocumentFormat, PolicyStore};

use crate::connection::DbPool;
use crate::repositories::{RepositoryError, SqlPolicyRepository};

const SEED_USER_IDS: &[&str] = &[
    "u-alice", "u-bob", "u-tess", "u-pete", "u-dana", "u-sam", "u-hana", "u-carl", "u-paula",
    "u-olga",
];
const SEED_PROJECT_IDS: &[&str] = &["proj-apollo", "proj-tools"];
const SEED_DEPARTMENT_IDS: &[&str] = &["dept-eng", "dept-ops"];
const SEED_POLICY_IDS: &[&str] =
    &["pol-client-vacation", "pol-department-leave", "pol-unpaid-finance"];
const SEED_WATCHER_RULE_IDS: &[&str] = &["wr-payroll"];

/// Demo organization and policy set for the `acme` company.
///
/// The directory comes from a SQL fixture; the policies are authored in the regular
/// bundle format and go through the same validation as `policy import`.
pub struct DemoSeedDataset;

#[derive(Debug, Error)]
pub enum SeedError {
    #[error(transparent)]
    Repository(#[from] RepositoryError),
    #[error("demo policy bundle is invalid: {0}")]
    Bundle(String),
    #[error(transparent)]
    Application(#[from] ApplicationError),
}

impl DemoSeedDataset {
    pub const SQL: &'static str = include_str!("../../../config/fixtures/leaveflow_seed.sql");
    pub const POLICIES: &'static str = include_str!("../../../config/policies/demo.toml");

    /// Loads the dataset. Loading twice leaves the same rows in place.
    pub async fn load(pool: &DbPool) -> Result<SeedResult, SeedError> {
        let mut tx = pool.begin().await.map_err(RepositoryError::from)?;
        tx.execute(sqlx::query(Self::SQL)).await.map_err(RepositoryError::from)?;
        tx.commit().await.map_err(RepositoryError::from)?;

        let bundle = parse_bundle(Self::POLICIES, DocumentFormat::Toml)
            .map_err(|error| SeedError::Bundle(error.to_string()))?;
        let repository = SqlPolicyRepository::new(pool.clone());
        let policies_seeded = bundle.policies.len();
        let watcher_rules_seeded = bundle.watcher_rules.len();
        for policy in bundle.policies {
            repository.save_policy(policy).await?;
        }
        for rule in bundle.watcher_rules {
            repository.save_watcher_rule(rule).await?;
        }

        info!(
            event_name = "persistence.seed.loaded",
            users = SEED_USER_IDS.len(),
            policies = policies_seeded,
            watcher_rules = watcher_rules_seeded,
            "demo dataset loaded"
        );
        Ok(SeedResult {
            users_seeded: SEED_USER_IDS.len(),
            projects_seeded: SEED_PROJECT_IDS.len(),
            departments_seeded: SEED_DEPARTMENT_IDS.len(),
            policies_seeded,
            watcher_rules_seeded,
        })
    }

    /// Checks that every seeded row is present.
    pub async fn verify(pool: &DbPool) -> Result<VerificationResult, RepositoryError> {
        let checks = vec![
            ("users", count_present(pool, "users", SEED_USER_IDS).await?),
            ("projects", count_present(pool, "projects", SEED_PROJECT_IDS).await?),
            ("departments", count_present(pool, "departments", SEED_DEPARTMENT_IDS).await?),
            ("policies", count_present(pool, "policies", SEED_POLICY_IDS).await?),
            ("watcher_rules", count_present(pool, "watcher_rules", SEED_WATCHER_RULE_IDS).await?),
        ];
        let all_present = checks.iter().all(|(_, present)| *present);
        Ok(VerificationResult { all_present, checks })
    }

    /// Removes the seeded rows. Child rows go with them through `ON DELETE CASCADE`.
    pub async fn clean(pool: &DbPool) -> Result<(), RepositoryError> {
        let mut tx = pool.begin().await?;
        for (table, ids) in [
            ("watcher_rules", SEED_WATCHER_RULE_IDS),
            ("policies", SEED_POLICY_IDS),
            ("departments", SEED_DEPARTMENT_IDS),
            ("projects", SEED_PROJECT_IDS),
            ("users", SEED_USER_IDS),
        ] {
            let sql = format!("DELETE FROM {table} WHERE id IN {}", sql_array_from_ids(ids));
            tx.execute(sqlx::query(&sql)).await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

async fn count_present(
    pool: &DbPool,
    table: &'static str,
    ids: &[&str],
) -> Result<bool, RepositoryError> {
    let sql = format!("SELECT COUNT(*) FROM {table} WHERE id IN {}", sql_array_from_ids(ids));
    let count: i64 = sqlx::query_scalar(&sql).fetch_one(pool).await?;
    Ok(usize::try_from(count).map(|count| count == ids.len()).unwrap_or(false))
}

fn sql_array_from_ids(ids: &[&str]) -> String {
    let quoted = ids.iter().map(|id| format!("'{id}'")).collect::<Vec<_>>().join(",");
    format!("({quoted})")
}

#[derive(Debug, PartialEq, Eq)]
pub struct SeedResult {
    pub users_seeded: usize,
    pub projects_seeded: usize,
    pub departments_seeded: usize,
    pub policies_seeded: usize,
    pub watcher_rules_seeded: usize,
}

#[derive(Debug)]
pub struct VerificationResult {
    pub all_present: bool,
    pub checks: Vec<(&'static str, bool)>,
}

#[cfg(test)]
mod tests {
    use leaveflow_core::approvals::resolver::UserDirectory;
    use leaveflow_core::domain::org::{CompanyId, DepartmentId, ProjectId, RoleId, UserId};
    use leaveflow_core::policy::{parse_bundle, DocumentFormat, PolicyStore};

    use super::DemoSeedDataset;
    use crate::repositories::{SqlPolicyRepository, SqlUserDirectory};
    use crate::{connect_with_settings, migrations};

    #[test]
    fn demo_policy_bundle_is_valid() {
        let bundle =
            parse_bundle(DemoSeedDataset::POLICIES, DocumentFormat::Toml).expect("bundle parses");
        assert_eq!(bundle.policies.len(), 3);
        assert_eq!(bundle.watcher_rules.len(), 1);
    }

    #[tokio::test]
    async fn seed_is_idempotent_and_verifiable() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");

        let first = DemoSeedDataset::load(&pool).await.expect("load seed");
        let first_verification = DemoSeedDataset::verify(&pool).await.expect("verify seed");
        assert!(first_verification.all_present);

        let second = DemoSeedDataset::load(&pool).await.expect("reload seed");
        let second_verification = DemoSeedDataset::verify(&pool).await.expect("re-verify");
        assert!(second_verification.all_present);
        assert_eq!(first, second);
        assert_eq!(first_verification.checks, second_verification.checks);

        let policies = SqlPolicyRepository::new(pool.clone())
            .active_policies_for_company(&CompanyId("acme".to_string()))
            .await
            .expect("policies");
        assert_eq!(policies.len(), 3);

        DemoSeedDataset::clean(&pool).await.expect("clean");
        assert!(!DemoSeedDataset::verify(&pool).await.expect("verify after clean").all_present);
    }

    #[tokio::test]
    async fn seeded_directory_resolves_demo_roles() {
        let pool = connect_with_settings("sqlite::memory:", 1, 30).await.expect("connect");
        migrations::run_pending(&pool).await.expect("run migrations");
        DemoSeedDataset::load(&pool).await.expect("load seed");
        let directory = SqlUserDirectory::new(pool);

        let leads = directory
            .users_with_role_in_project(
                &RoleId("tech_lead".to_string()),
                &ProjectId("proj-apollo".to_string()),
            )
            .await
            .expect("leads");
        assert_eq!(leads, vec![UserId("u-tess".to_string())]);

        let hr = directory
            .users_with_role_company_wide(&RoleId("hr".to_string()), &CompanyId("acme".to_string()))
            .await
            .expect("hr");
        assert_eq!(hr, vec![UserId("u-hana".to_string())]);

        let supervisors = directory
            .department_supervisors(&DepartmentId("dept-eng".to_string()))
            .await
            .expect("supervisors");
        assert_eq!(supervisors, vec![UserId("u-dana".to_string()), UserId("u-sam".to_string())]);
    }
}
