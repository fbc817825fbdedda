use datapilot_core::config::{AppConfig, LoadOptions};
use datapilot_db::{connect_with_config, migrations, CheckpointSummary, SqlCheckpointStore};
use serde::Serialize;

use crate::commands::{async_runtime, CommandResult};

#[derive(Debug, Serialize)]
struct ThreadsReport {
    command: &'static str,
    status: &'static str,
    threads: Vec<CheckpointSummary>,
}

/// Lists the most recently updated conversation threads.
pub fn run(limit: u32) -> CommandResult {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "threads",
                "config_validation",
                format!("configuration issue: {error}"),
                2,
            );
        }
    };

    let runtime = match async_runtime() {
        Ok(runtime) => runtime,
        Err(error) => {
            return CommandResult::failure(
                "threads",
                "runtime_init",
                format!("failed to initialize async runtime: {error}"),
                3,
            );
        }
    };

    let result = runtime.block_on(async {
        let pool = connect_with_config(&config.database)
            .await
            .map_err(|error| ("db_connectivity", error.to_string(), 4u8))?;
        migrations::run_pending(&pool).await.map_err(|error| ("migration", error.to_string(), 5u8))?;
        let threads = SqlCheckpointStore::new(pool.clone())
            .recent(limit)
            .await
            .map_err(|error| ("checkpoint_query", error.to_string(), 4u8))?;
        pool.close().await;
        Ok::<_, (&'static str, String, u8)>(threads)
    });

    match result {
        Ok(threads) => CommandResult::report(0, &ThreadsReport { command: "threads", status: "ok", threads }),
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("threads", error_class, message, exit_code)
        }
    }
}
