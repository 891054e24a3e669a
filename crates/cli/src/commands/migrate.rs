use leaveflow_core::config::LoadOptions;
use leaveflow_db::migrations;
use serde::Serialize;

use crate::commands::{block_on, load_config, open_pool, CommandResult, Failure};

#[derive(Debug, Serialize)]
struct MigrationStatus {
    embedded: usize,
    applied: usize,
}

pub fn run(options: &LoadOptions) -> CommandResult {
    let result = load_config(options).and_then(|config| {
        block_on(async {
            let pool = open_pool(&config).await?;
            let (embedded, applied) = migrations::status(&pool)
                .await
                .map_err(|error| ("migration", error.to_string(), 5u8))?;
            pool.close().await;
            Ok::<MigrationStatus, Failure>(MigrationStatus { embedded, applied })
        })
    });

    match result {
        Ok(status) => {
            CommandResult::success_with_data("migrate", "applied pending migrations", &status)
        }
        Err(failure) => CommandResult::from_failure("migrate", failure),
    }
}
