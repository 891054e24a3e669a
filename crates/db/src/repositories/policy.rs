use std::collections::BTreeSet;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};
use tracing::warn;

use leaveflow_core::domain::org::{CompanyId, RoleId, UserId};
use leaveflow_core::domain::policy::{
    ApproverScope, Policy, PolicyId, RequestEvent, StepTemplate, TriggerAxis, TriggerPredicate,
    WatcherRule, WatcherRuleId, WatcherSpec, WatcherTarget,
};
use leaveflow_core::errors::ApplicationError;
use leaveflow_core::policy::{validate_policy, validate_watcher_rule, PolicyStore};

use super::{decode_error, flag, RepositoryError};
use crate::DbPool;

/// Child tables shared by policies and watcher rules, keyed by the owning aggregate.
struct OwnerTables {
    owner_column: &'static str,
    trigger_table: &'static str,
    watcher_table: &'static str,
}

const POLICY_TABLES: OwnerTables = OwnerTables {
    owner_column: "policy_id",
    trigger_table: "policy_trigger_values",
    watcher_table: "policy_watchers",
};

const WATCHER_RULE_TABLES: OwnerTables = OwnerTables {
    owner_column: "watcher_rule_id",
    trigger_table: "watcher_rule_trigger_values",
    watcher_table: "watcher_rule_watchers",
};

pub struct SqlPolicyRepository {
    pool: DbPool,
}

impl SqlPolicyRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Loads a policy regardless of its active flag.
    pub async fn find_policy(&self, id: &PolicyId) -> Result<Option<Policy>, RepositoryError> {
        let row = sqlx::query("SELECT id, company_id, name, is_active FROM policies WHERE id = ?")
            .bind(&id.0)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref row) => Ok(Some(self.load_policy(row).await?)),
            None => Ok(None),
        }
    }

    pub async fn set_policy_active(
        &self,
        id: &PolicyId,
        is_active: bool,
    ) -> Result<bool, RepositoryError> {
        let result = sqlx::query("UPDATE policies SET is_active = ?, updated_at = ? WHERE id = ?")
            .bind(flag(is_active))
            .bind(Utc::now().to_rfc3339())
            .bind(&id.0)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn load_policy(&self, row: &SqliteRow) -> Result<Policy, RepositoryError> {
        let id: String = row.try_get("id").map_err(decode_error)?;
        let company_id: String = row.try_get("company_id").map_err(decode_error)?;
        let name: String = row.try_get("name").map_err(decode_error)?;
        let is_active: i64 = row.try_get("is_active").map_err(decode_error)?;

        let step_rows = sqlx::query(
            "SELECT sequence_order, approver_role_id, scope, specific_user_id
             FROM policy_step_templates
             WHERE policy_id = ?
             ORDER BY sequence_order",
        )
        .bind(&id)
        .fetch_all(&self.pool)
        .await?;
        let steps = step_rows.iter().map(row_to_step_template).collect::<Result<Vec<_>, _>>()?;

        Ok(Policy {
            trigger: load_trigger(&self.pool, &POLICY_TABLES, &id).await?,
            watchers: load_watchers(&self.pool, &POLICY_TABLES, &id).await?,
            id: PolicyId(id),
            company_id: CompanyId(company_id),
            name,
            is_active: is_active != 0,
            steps,
        })
    }

    async fn load_watcher_rule(&self, row: &SqliteRow) -> Result<WatcherRule, RepositoryError> {
        let id: String = row.try_get("id").map_err(decode_error)?;
        let company_id: String = row.try_get("company_id").map_err(decode_error)?;
        let name: String = row.try_get("name").map_err(decode_error)?;
        let is_active: i64 = row.try_get("is_active").map_err(decode_error)?;

        Ok(WatcherRule {
            trigger: load_trigger(&self.pool, &WATCHER_RULE_TABLES, &id).await?,
            watchers: load_watchers(&self.pool, &WATCHER_RULE_TABLES, &id).await?,
            id: WatcherRuleId(id),
            company_id: CompanyId(company_id),
            name,
            is_active: is_active != 0,
        })
    }
}

#[async_trait]
impl PolicyStore for SqlPolicyRepository {
    async fn active_policies_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<Policy>, ApplicationError> {
        let rows = sqlx::query(
            "SELECT id, company_id, name, is_active
             FROM policies
             WHERE company_id = ? AND is_active = 1
             ORDER BY id",
        )
        .bind(&company_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        let mut policies = Vec::with_capacity(rows.len());
        for row in &rows {
            let loaded = self.load_policy(row).await.and_then(|policy| {
                validate_policy(&policy).map_err(decode_error)?;
                Ok(policy)
            });
            match loaded {
                Ok(policy) => policies.push(policy),
                Err(RepositoryError::Database(error)) => {
                    return Err(RepositoryError::Database(error).into())
                }
                Err(error) => warn!(
                    event_name = "policy.load.skipped_corrupt",
                    company_id = %company_id,
                    policy_id = %row.try_get::<String, _>("id").unwrap_or_default(),
                    error = %error,
                    "skipping policy that failed to decode"
                ),
            }
        }
        Ok(policies)
    }

    async fn active_watcher_rules_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<WatcherRule>, ApplicationError> {
        let rows = sqlx::query(
            "SELECT id, company_id, name, is_active
             FROM watcher_rules
             WHERE company_id = ? AND is_active = 1
             ORDER BY id",
        )
        .bind(&company_id.0)
        .fetch_all(&self.pool)
        .await
        .map_err(RepositoryError::from)?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in &rows {
            match self.load_watcher_rule(row).await {
                Ok(rule) => rules.push(rule),
                Err(RepositoryError::Database(error)) => {
                    return Err(RepositoryError::Database(error).into())
                }
                Err(error) => warn!(
                    event_name = "watcher.rule.skipped_corrupt",
                    company_id = %company_id,
                    watcher_rule_id = %row.try_get::<String, _>("id").unwrap_or_default(),
                    error = %error,
                    "skipping watcher rule that failed to decode"
                ),
            }
        }
        Ok(rules)
    }

    async fn save_policy(&self, policy: Policy) -> Result<(), ApplicationError> {
        validate_policy(&policy)?;
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;

        sqlx::query(
            "INSERT INTO policies (id, company_id, name, is_active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 company_id = excluded.company_id,
                 name = excluded.name,
                 is_active = excluded.is_active,
                 updated_at = excluded.updated_at",
        )
        .bind(&policy.id.0)
        .bind(&policy.company_id.0)
        .bind(&policy.name)
        .bind(flag(policy.is_active))
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(RepositoryError::from)?;

        sqlx::query("DELETE FROM policy_step_templates WHERE policy_id = ?")
            .bind(&policy.id.0)
            .execute(&mut *tx)
            .await
            .map_err(RepositoryError::from)?;
        for step in &policy.steps {
            sqlx::query(
                "INSERT INTO policy_step_templates
                     (policy_id, sequence_order, approver_role_id, scope, specific_user_id)
                 VALUES (?, ?, ?, ?, ?)",
            )
            .bind(&policy.id.0)
            .bind(i64::from(step.sequence_order))
            .bind(&step.approver_role_id.0)
            .bind(step.scope.kind())
            .bind(step.scope.specific_user().map(|user_id| user_id.0.as_str()))
            .execute(&mut *tx)
            .await
            .map_err(RepositoryError::from)?;
        }

        replace_trigger(&mut tx, &POLICY_TABLES, &policy.id.0, &policy.trigger).await?;
        replace_watchers(&mut tx, &POLICY_TABLES, &policy.id.0, &policy.watchers).await?;

        tx.commit().await.map_err(RepositoryError::from)?;
        Ok(())
    }

    async fn save_watcher_rule(&self, rule: WatcherRule) -> Result<(), ApplicationError> {
        validate_watcher_rule(&rule)?;
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(RepositoryError::from)?;

        sqlx::query(
            "INSERT INTO watcher_rules (id, company_id, name, is_active, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 company_id = excluded.company_id,
                 name = excluded.name,
                 is_active = excluded.is_active,
                 updated_at = excluded.updated_at",
        )
        .bind(&rule.id.0)
        .bind(&rule.company_id.0)
        .bind(&rule.name)
        .bind(flag(rule.is_active))
        .bind(&now)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(RepositoryError::from)?;

        replace_trigger(&mut tx, &WATCHER_RULE_TABLES, &rule.id.0, &rule.trigger).await?;
        replace_watchers(&mut tx, &WATCHER_RULE_TABLES, &rule.id.0, &rule.watchers).await?;

        tx.commit().await.map_err(RepositoryError::from)?;
        Ok(())
    }
}

fn row_to_step_template(row: &SqliteRow) -> Result<StepTemplate, RepositoryError> {
    let sequence_order: i64 = row.try_get("sequence_order").map_err(decode_error)?;
    let approver_role_id: String = row.try_get("approver_role_id").map_err(decode_error)?;
    let scope: String = row.try_get("scope").map_err(decode_error)?;
    let specific_user_id: Option<String> = row.try_get("specific_user_id").map_err(decode_error)?;

    Ok(StepTemplate {
        sequence_order: u32::try_from(sequence_order).map_err(decode_error)?,
        approver_role_id: RoleId(approver_role_id),
        scope: ApproverScope::from_parts(&scope, specific_user_id)
            .ok_or_else(|| RepositoryError::Decode(format!("invalid approver scope `{scope}`")))?,
    })
}

fn row_to_watcher(row: &SqliteRow) -> Result<WatcherSpec, RepositoryError> {
    let target_kind: String = row.try_get("target_kind").map_err(decode_error)?;
    let user_id: Option<String> = row.try_get("user_id").map_err(decode_error)?;
    let role_id: Option<String> = row.try_get("role_id").map_err(decode_error)?;
    let scope: Option<String> = row.try_get("scope").map_err(decode_error)?;
    let specific_user_id: Option<String> = row.try_get("specific_user_id").map_err(decode_error)?;
    let events_json: String = row.try_get("events_json").map_err(decode_error)?;

    let target = match (target_kind.as_str(), user_id, role_id, scope) {
        ("user", Some(user_id), _, _) => WatcherTarget::User { user_id: UserId(user_id) },
        ("role", _, Some(role_id), Some(scope)) => WatcherTarget::Role {
            role_id: RoleId(role_id),
            scope: ApproverScope::from_parts(&scope, specific_user_id).ok_or_else(|| {
                RepositoryError::Decode(format!("invalid watcher scope `{scope}`"))
            })?,
        },
        (other, ..) => {
            return Err(RepositoryError::Decode(format!("incomplete watcher target `{other}`")))
        }
    };

    let names: Vec<String> = serde_json::from_str(&events_json).map_err(decode_error)?;
    let events = names
        .iter()
        .map(|name| {
            RequestEvent::parse(name)
                .ok_or_else(|| RepositoryError::Decode(format!("unknown watcher event `{name}`")))
        })
        .collect::<Result<BTreeSet<_>, _>>()?;

    Ok(WatcherSpec { target, events })
}

async fn load_trigger(
    pool: &DbPool,
    tables: &OwnerTables,
    owner_id: &str,
) -> Result<TriggerPredicate, RepositoryError> {
    let sql = format!(
        "SELECT axis, value FROM {} WHERE {} = ? ORDER BY axis, value",
        tables.trigger_table, tables.owner_column
    );
    let rows = sqlx::query(&sql).bind(owner_id).fetch_all(pool).await?;

    let mut trigger = TriggerPredicate::default();
    for row in &rows {
        let axis: String = row.try_get("axis").map_err(decode_error)?;
        let value: String = row.try_get("value").map_err(decode_error)?;
        let axis = TriggerAxis::parse(&axis)
            .ok_or_else(|| RepositoryError::Decode(format!("unknown trigger axis `{axis}`")))?;
        trigger.axis_mut(axis).insert(value);
    }
    Ok(trigger)
}

async fn load_watchers(
    pool: &DbPool,
    tables: &OwnerTables,
    owner_id: &str,
) -> Result<Vec<WatcherSpec>, RepositoryError> {
    let sql = format!(
        "SELECT target_kind, user_id, role_id, scope, specific_user_id, events_json
         FROM {} WHERE {} = ? ORDER BY position",
        tables.watcher_table, tables.owner_column
    );
    let rows = sqlx::query(&sql).bind(owner_id).fetch_all(pool).await?;
    rows.iter().map(row_to_watcher).collect()
}

async fn replace_trigger(
    tx: &mut Transaction<'_, Sqlite>,
    tables: &OwnerTables,
    owner_id: &str,
    trigger: &TriggerPredicate,
) -> Result<(), RepositoryError> {
    let delete = format!("DELETE FROM {} WHERE {} = ?", tables.trigger_table, tables.owner_column);
    sqlx::query(&delete).bind(owner_id).execute(&mut **tx).await?;

    let insert = format!(
        "INSERT INTO {} ({}, axis, value) VALUES (?, ?, ?)",
        tables.trigger_table, tables.owner_column
    );
    for axis in TriggerAxis::ALL {
        for value in trigger.axis(axis) {
            sqlx::query(&insert)
                .bind(owner_id)
                .bind(axis.as_str())
                .bind(value)
                .execute(&mut **tx)
                .await?;
        }
    }
    Ok(())
}

async fn replace_watchers(
    tx: &mut Transaction<'_, Sqlite>,
    tables: &OwnerTables,
    owner_id: &str,
    watchers: &[WatcherSpec],
) -> Result<(), RepositoryError> {
    let delete = format!("DELETE FROM {} WHERE {} = ?", tables.watcher_table, tables.owner_column);
    sqlx::query(&delete).bind(owner_id).execute(&mut **tx).await?;

    let insert = format!(
        "INSERT INTO {} ({}, position, target_kind, user_id, role_id, scope, specific_user_id,
                         events_json)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        tables.watcher_table, tables.owner_column
    );
    for (position, watcher) in watchers.iter().enumerate() {
        let events: Vec<&str> = watcher.events.iter().map(RequestEvent::as_str).collect();
        let events_json = serde_json::to_string(&events).map_err(decode_error)?;
        let (kind, user_id, role_id, scope) = match &watcher.target {
            WatcherTarget::User { user_id } => ("user", Some(user_id.0.as_str()), None, None),
            WatcherTarget::Role { role_id, scope } => {
                ("role", None, Some(role_id.0.as_str()), Some(scope))
            }
        };

        sqlx::query(&insert)
            .bind(owner_id)
            .bind(i64::try_from(position).map_err(decode_error)?)
            .bind(kind)
            .bind(user_id)
            .bind(role_id)
            .bind(scope.map(ApproverScope::kind))
            .bind(scope.and_then(ApproverScope::specific_user).map(|user_id| user_id.0.as_str()))
            .bind(events_json)
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}
