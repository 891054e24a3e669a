use leaveflow_core::config::LoadOptions;
use leaveflow_db::{DemoSeedDataset, SeedResult};
use serde::Serialize;

use crate::commands::{block_on, load_config, open_pool, CommandResult, Failure};

#[derive(Debug, Serialize)]
struct SeedOutput {
    users: usize,
    projects: usize,
    departments: usize,
    policies: usize,
    watcher_rules: usize,
}

impl From<SeedResult> for SeedOutput {
    fn from(result: SeedResult) -> Self {
        Self {
            users: result.users_seeded,
            projects: result.projects_seeded,
            departments: result.departments_seeded,
            policies: result.policies_seeded,
            watcher_rules: result.watcher_rules_seeded,
        }
    }
}

pub fn run(options: &LoadOptions) -> CommandResult {
    let result = load_config(options).and_then(|config| {
        block_on(async {
            let pool = open_pool(&config).await?;

            let seed_result = DemoSeedDataset::load(&pool)
                .await
                .map_err(|error| ("seed_execution", error.to_string(), 5u8))?;
            let verification = DemoSeedDataset::verify(&pool)
                .await
                .map_err(|error| ("seed_verification", error.to_string(), 6u8))?;

            let run_result: Result<SeedOutput, Failure> = if verification.all_present {
                Ok(SeedOutput::from(seed_result))
            } else {
                let failed_checks = verification
                    .checks
                    .iter()
                    .filter_map(|(check, passed)| (!passed).then_some(*check))
                    .collect::<Vec<_>>();
                Err(("seed_verification", verification_message(&failed_checks), 6u8))
            };

            pool.close().await;
            run_result
        })
    });

    match result {
        Ok(output) => CommandResult::success_with_data(
            "seed",
            "demo organization and policies loaded for company `acme`",
            &output,
        ),
        Err(failure) => CommandResult::from_failure("seed", failure),
    }
}

fn verification_message(failed_checks: &[&str]) -> String {
    if failed_checks.is_empty() {
        "Some seed data failed to load".to_string()
    } else {
        format!("Seed verification failed for checks: {}", failed_checks.join(", "))
    }
}
