use datapilot_agent::guardrails::SqlGuard;
use datapilot_core::config::{AppConfig, LoadOptions};
use serde::Serialize;

use crate::commands::CommandResult;

#[derive(Debug, Serialize)]
struct CheckSqlReport {
    command: &'static str,
    status: &'static str,
    dialect: String,
    is_safe: bool,
    kind: Option<&'static str>,
    normalized_query: Option<String>,
    error: Option<String>,
}

/// Runs the read-only gate offline. Exit code 0 means safe, 1 means rejected.
pub fn run(query: &str, dialect: Option<&str>) -> CommandResult {
    let dialect = match dialect {
        Some(dialect) => dialect.to_string(),
        None => match AppConfig::load(LoadOptions::default()) {
            Ok(config) => config.agent.sql_dialect,
            Err(error) => {
                return CommandResult::failure(
                    "check-sql",
                    "config_validation",
                    format!("configuration issue: {error}"),
                    2,
                );
            }
        },
    };

    let guard = match SqlGuard::new(&dialect) {
        Ok(guard) => guard,
        Err(error) => return CommandResult::failure("check-sql", "dialect", error.to_string(), 2),
    };

    let validation = guard.validate(query);
    let report = CheckSqlReport {
        command: "check-sql",
        status: if validation.is_safe { "safe" } else { "rejected" },
        dialect: guard.dialect().to_string(),
        is_safe: validation.is_safe,
        kind: validation.kind.as_ref().map(|kind| kind.as_str()),
        normalized_query: validation.normalized_query,
        error: validation.error,
    };
    CommandResult::report(if report.is_safe { 0 } else { 1 }, &report)
}
