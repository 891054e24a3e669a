use std::fs;
use std::path::Path;

use leaveflow_core::config::LoadOptions;
use leaveflow_core::policy::{parse_bundle, DocumentFormat, PolicyBundle, PolicyStore};
use leaveflow_db::SqlPolicyRepository;
use serde::Serialize;
use tracing::info;

use crate::commands::{
    application_failure, block_on, load_config, open_pool, CommandResult, Failure,
};

#[derive(Debug, Serialize)]
struct BundleSummary {
    policy_ids: Vec<String>,
    watcher_rule_ids: Vec<String>,
    step_count: usize,
}

impl BundleSummary {
    fn of(bundle: &PolicyBundle) -> Self {
        Self {
            policy_ids: bundle.policies.iter().map(|policy| policy.id.0.clone()).collect(),
            watcher_rule_ids: bundle.watcher_rules.iter().map(|rule| rule.id.0.clone()).collect(),
            step_count: bundle.policies.iter().map(|policy| policy.steps.len()).sum(),
        }
    }
}

/// Parses and validates a bundle without touching the database.
pub fn check(path: &Path) -> CommandResult {
    match read_bundle(path) {
        Ok(bundle) => CommandResult::success_with_data(
            "policy.check",
            format!("`{}` is a valid policy bundle", path.display()),
            &BundleSummary::of(&bundle),
        ),
        Err(failure) => CommandResult::from_failure("policy.check", failure),
    }
}

/// Validates the whole bundle first, then stores every policy and watcher rule in it.
pub fn import(options: &LoadOptions, path: &Path) -> CommandResult {
    let result = read_bundle(path).and_then(|bundle| {
        let config = load_config(options)?;
        block_on(async {
            let pool = open_pool(&config).await?;
            let repository = SqlPolicyRepository::new(pool.clone());
            let summary = BundleSummary::of(&bundle);

            for policy in bundle.policies {
                repository
                    .save_policy(policy)
                    .await
                    .map_err(|error| application_failure(error, "policy-import"))?;
            }
            for rule in bundle.watcher_rules {
                repository
                    .save_watcher_rule(rule)
                    .await
                    .map_err(|error| application_failure(error, "policy-import"))?;
            }

            info!(
                event_name = "policy.import.completed",
                source = %path.display(),
                policies = summary.policy_ids.len(),
                watcher_rules = summary.watcher_rule_ids.len(),
                "policy bundle imported"
            );
            pool.close().await;
            Ok::<BundleSummary, Failure>(summary)
        })
    });

    match result {
        Ok(summary) => CommandResult::success_with_data(
            "policy.import",
            format!("imported policy bundle `{}`", path.display()),
            &summary,
        ),
        Err(failure) => CommandResult::from_failure("policy.import", failure),
    }
}

fn read_bundle(path: &Path) -> Result<PolicyBundle, Failure> {
    let raw = fs::read_to_string(path).map_err(|error| {
        ("input_read", format!("could not read `{}`: {error}", path.display()), 6u8)
    })?;
    parse_bundle(&raw, DocumentFormat::from_path(path))
        .map_err(|error| ("policy_invalid", error.to_string(), 6u8))
}
