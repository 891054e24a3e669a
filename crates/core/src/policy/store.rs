use async_trait::async_trait;

use crate::domain::org::CompanyId;
use crate::domain::policy::{Policy, WatcherRule};
use crate::errors::ApplicationError;

/// Source of the policies and watcher rules the engine evaluates. Implementations
/// validate on write and drop rows they cannot decode on read instead of failing.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn active_policies_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<Policy>, ApplicationError>;

    async fn active_watcher_rules_for_company(
        &self,
        company_id: &CompanyId,
    ) -> Result<Vec<WatcherRule>, ApplicationError>;

    async fn save_policy(&self, policy: Policy) -> Result<(), ApplicationError>;

    async fn save_watcher_rule(&self, rule: WatcherRule) -> Result<(), ApplicationError>;
}
